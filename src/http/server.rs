//! HTTP server implementation.

use std::net::SocketAddr;

use axum::middleware;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::{rate_limit, GateState};
use crate::error::{GateError, Result};
use crate::ratelimit::RateStorage;

/// Greeting served to requests that pass the gate.
pub const GREETING: &str = "Rate limiter running!";

async fn index() -> &'static str {
    GREETING
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Build the router: `/health` is open, every other path goes through the
/// rate limit middleware.
pub fn build_router<S: RateStorage + 'static>(state: GateState<S>) -> Router {
    let gated = Router::new()
        .fallback(index)
        .layer(middleware::from_fn_with_state(state, rate_limit::<S>));

    Router::new().route("/health", get(health)).merge(gated)
}

/// HTTP server for the rate gate.
pub struct HttpServer<S: RateStorage + 'static> {
    /// Address to bind to
    addr: SocketAddr,
    /// Middleware state
    state: GateState<S>,
}

impl<S: RateStorage + 'static> HttpServer<S> {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, state: GateState<S>) -> Self {
        Self { addr, state }
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let app = build_router(self.state);
        let listener = TcpListener::bind(self.addr).await?;

        info!(addr = %self.addr, "Starting HTTP server");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            GateError::Server(e.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use crate::error::StorageError;
    use crate::http::middleware::{INTERNAL_ERROR_MESSAGE, RATE_LIMITED_MESSAGE};
    use crate::ratelimit::{BlockStatus, MemoryStorage, PolicyTable, RateKey, RateLimiter};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::{header, HeaderName, Request, StatusCode};
    use axum::response::Response;
    use chrono::{DateTime, Utc};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_policies(ip_limit: u64) -> Arc<PolicyTable> {
        let mut config = PolicyConfig::default();
        config.ip.limit = ip_limit;
        config.token.limit = ip_limit + 1;
        Arc::new(PolicyTable::from_config(&config).unwrap())
    }

    fn test_state<S: RateStorage>(storage: S, ip_limit: u64) -> GateState<S> {
        GateState {
            limiter: RateLimiter::new(Arc::new(storage)),
            policies: test_policies(ip_limit),
            credential_header: HeaderName::from_static("api_key"),
            trust_forwarded_for: false,
        }
    }

    fn request(path: &str, peer: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(path);
        if let Some(token) = token {
            builder = builder.header("API_KEY", token);
        }
        let mut req = builder.body(Body::empty()).unwrap();
        let addr: SocketAddr = peer.parse().unwrap();
        req.extensions_mut().insert(ConnectInfo(addr));
        req
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_allows_then_rejects_by_address() {
        let app = build_router(test_state(MemoryStorage::new(), 2));

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(request("/", "10.0.0.1:5000", None))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(body_text(response).await, GREETING);
        }

        // Same address from another port is the same client.
        let response = app
            .clone()
            .oneshot(request("/", "10.0.0.1:6000", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry_after: u64 = response.headers()[header::RETRY_AFTER]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!((1..=300).contains(&retry_after));
        assert_eq!(body_text(response).await, RATE_LIMITED_MESSAGE);

        // Another address is unaffected.
        let response = app
            .oneshot(request("/", "10.0.0.2:5000", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_token_counted_separately_from_address() {
        let app = build_router(test_state(MemoryStorage::new(), 1));

        let response = app
            .clone()
            .oneshot(request("/", "10.0.0.1:5000", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Token default is one higher than the address limit.
        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(request("/", "10.0.0.1:5000", Some("abc")))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = app
            .oneshot(request("/", "10.0.0.1:5000", Some("abc")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_any_path_is_gated() {
        let app = build_router(test_state(MemoryStorage::new(), 1));

        let response = app
            .clone()
            .oneshot(request("/some/path", "10.0.0.1:5000", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(request("/other", "10.0.0.1:5000", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_health_is_not_gated() {
        let app = build_router(test_state(MemoryStorage::new(), 1));

        for _ in 0..5 {
            let response = app
                .clone()
                .oneshot(request("/health", "10.0.0.1:5000", None))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_missing_peer_is_internal_error() {
        let app = build_router(test_state(MemoryStorage::new(), 1));
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();

        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    struct DownStorage;

    #[async_trait]
    impl RateStorage for DownStorage {
        async fn increment(&self, _: &RateKey, _: Duration) -> std::result::Result<u64, StorageError> {
            Err(StorageError::Unavailable("connection refused".to_string()))
        }

        async fn get_count(&self, _: &RateKey) -> std::result::Result<u64, StorageError> {
            Err(StorageError::Unavailable("connection refused".to_string()))
        }

        async fn block(&self, _: &RateKey, _: Duration) -> std::result::Result<DateTime<Utc>, StorageError> {
            Err(StorageError::Unavailable("connection refused".to_string()))
        }

        async fn is_blocked(&self, _: &RateKey) -> std::result::Result<BlockStatus, StorageError> {
            Err(StorageError::Unavailable("connection refused".to_string()))
        }

        async fn reset(&self, _: &RateKey) -> std::result::Result<(), StorageError> {
            Err(StorageError::Unavailable("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_storage_outage_is_internal_error_not_rate_limit() {
        let app = build_router(test_state(DownStorage, 10));

        let response = app
            .oneshot(request("/", "10.0.0.1:5000", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_text(response).await, INTERNAL_ERROR_MESSAGE);
    }

    #[tokio::test]
    async fn test_server_shuts_down_on_signal() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = HttpServer::new(addr, test_state(MemoryStorage::new(), 1));

        server.serve_with_shutdown(async {}).await.unwrap();
    }
}
