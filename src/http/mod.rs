//! HTTP gate: derives the identity of each request and enforces its limit.

mod middleware;
mod server;

pub use middleware::{
    identify, rate_limit, retry_after_secs, GateState, Identity, INTERNAL_ERROR_MESSAGE,
    RATE_LIMITED_MESSAGE,
};
pub use server::{build_router, HttpServer, GREETING};
