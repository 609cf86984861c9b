//! Blockgate - Fixed-Window Request Rate Gate
//!
//! This crate decides, per client identity, whether a request may proceed.
//! Requests are counted in fixed windows; a client that exceeds its limit is
//! blocked outright for a configurable period. All state lives in a storage
//! backend (in-memory or Redis), and any storage failure denies the request.

pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
