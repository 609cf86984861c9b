//! Rate limit middleware for the HTTP gate.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use tracing::{debug, error, instrument, Span};

use crate::ratelimit::{Decision, Policy, PolicyTable, RateKey, RateLimiter, RateStorage};

/// Body sent with `429 Too Many Requests`.
pub const RATE_LIMITED_MESSAGE: &str =
    "you have reached the maximum number of requests or actions allowed within a certain time frame";

/// Body sent with `500 Internal Server Error`.
pub const INTERNAL_ERROR_MESSAGE: &str = "internal server error";

/// Who a request is counted against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// Client network address
    Ip(IpAddr),
    /// Presented credential
    Token(String),
}

impl Identity {
    /// The storage key for this identity.
    pub fn key(&self) -> RateKey {
        match self {
            Identity::Ip(addr) => RateKey::ip(*addr),
            Identity::Token(credential) => RateKey::token(credential),
        }
    }

    /// The policy for this identity.
    pub fn policy(&self, policies: &PolicyTable) -> Policy {
        match self {
            Identity::Ip(_) => policies.for_ip(),
            Identity::Token(credential) => policies.for_token(credential),
        }
    }
}

/// Shared state for the rate limit middleware.
pub struct GateState<S: RateStorage> {
    pub limiter: RateLimiter<S>,
    pub policies: Arc<PolicyTable>,
    pub credential_header: HeaderName,
    pub trust_forwarded_for: bool,
}

impl<S: RateStorage> Clone for GateState<S> {
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
            policies: Arc::clone(&self.policies),
            credential_header: self.credential_header.clone(),
            trust_forwarded_for: self.trust_forwarded_for,
        }
    }
}

/// Work out who a request belongs to.
///
/// A non-empty credential header wins. Otherwise the client address is used:
/// the first valid `X-Forwarded-For` entry when trusted, else the peer
/// address of the connection. Returns `None` if neither is available.
pub fn identify(
    headers: &HeaderMap,
    peer: Option<IpAddr>,
    credential_header: &HeaderName,
    trust_forwarded_for: bool,
) -> Option<Identity> {
    if let Some(credential) = headers
        .get(credential_header)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return Some(Identity::Token(credential.to_string()));
    }

    if trust_forwarded_for {
        if let Some(ip) = forwarded_for(headers) {
            return Some(Identity::Ip(ip));
        }
    }

    peer.map(Identity::Ip)
}

fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    let xff = headers.get("x-forwarded-for")?.to_str().ok()?;
    xff.split(',').next()?.trim().parse::<IpAddr>().ok()
}

/// Whole seconds until `until`, never less than one.
pub fn retry_after_secs(until: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let millis = (until - now).num_milliseconds().max(0) as u64;
    millis.div_ceil(1000).max(1)
}

fn rate_limited(until: DateTime<Utc>) -> Response {
    let secs = retry_after_secs(until, Utc::now());
    let mut response = (StatusCode::TOO_MANY_REQUESTS, RATE_LIMITED_MESSAGE).into_response();
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(secs));
    response
}

fn internal_error() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_MESSAGE).into_response()
}

/// Middleware that admits a request only if its identity is within limits.
///
/// A storage failure is answered with `500`, never `429`, and never lets the
/// request through.
#[instrument(skip_all, fields(key = tracing::field::Empty))]
pub async fn rate_limit<S>(
    State(state): State<GateState<S>>,
    req: Request<Body>,
    next: Next,
) -> Response
where
    S: RateStorage + 'static,
{
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip());

    let identity = match identify(
        req.headers(),
        peer,
        &state.credential_header,
        state.trust_forwarded_for,
    ) {
        Some(identity) => identity,
        None => {
            error!("Request has neither a credential nor a client address");
            return internal_error();
        }
    };

    let key = identity.key();
    let policy = identity.policy(&state.policies);
    Span::current().record("key", tracing::field::display(&key));

    match state.limiter.allow(&key, &policy).await {
        Ok(Decision::Allow) => next.run(req).await,
        Ok(Decision::Deny { until }) => {
            debug!(until = %until, "Request rejected");
            rate_limited(until)
        }
        Err(e) => {
            error!(error = %e, "Rate limit check failed");
            internal_error()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn api_key() -> HeaderName {
        HeaderName::from_static("api_key")
    }

    #[test]
    fn test_credential_wins_over_address() {
        let mut headers = HeaderMap::new();
        headers.insert("api_key", HeaderValue::from_static("secret"));
        let peer: IpAddr = "10.0.0.1".parse().unwrap();

        let identity = identify(&headers, Some(peer), &api_key(), false);
        assert_eq!(identity, Some(Identity::Token("secret".to_string())));
        assert_eq!(identity.unwrap().key().as_str(), "token:secret");
    }

    #[test]
    fn test_empty_credential_falls_back_to_address() {
        let mut headers = HeaderMap::new();
        headers.insert("api_key", HeaderValue::from_static("  "));
        let peer: IpAddr = "10.0.0.1".parse().unwrap();

        let identity = identify(&headers, Some(peer), &api_key(), false).unwrap();
        assert_eq!(identity.key().as_str(), "ip:10.0.0.1");
    }

    #[test]
    fn test_forwarded_for_only_when_trusted() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("192.168.1.1, 10.0.0.1"));
        let peer: IpAddr = "127.0.0.1".parse().unwrap();

        let untrusted = identify(&headers, Some(peer), &api_key(), false);
        assert_eq!(untrusted, Some(Identity::Ip(peer)));

        let trusted = identify(&headers, Some(peer), &api_key(), true);
        assert_eq!(trusted, Some(Identity::Ip("192.168.1.1".parse().unwrap())));
    }

    #[test]
    fn test_garbage_forwarded_for_uses_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("not-an-ip"));
        let peer: IpAddr = "127.0.0.1".parse().unwrap();

        assert_eq!(
            identify(&headers, Some(peer), &api_key(), true),
            Some(Identity::Ip(peer))
        );
    }

    #[test]
    fn test_no_identity() {
        assert_eq!(identify(&HeaderMap::new(), None, &api_key(), true), None);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let now = Utc::now();

        assert_eq!(retry_after_secs(now + TimeDelta::seconds(300), now), 300);
        assert_eq!(retry_after_secs(now + TimeDelta::milliseconds(1500), now), 2);
        assert_eq!(retry_after_secs(now, now), 1);
        assert_eq!(retry_after_secs(now - TimeDelta::seconds(5), now), 1);
    }
}
