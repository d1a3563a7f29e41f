//! HTTP server fronted by the throttle layer.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{response::IntoResponse, routing::get, Json, Router};
use tokio::net::TcpListener;
use tracing::{error, info};

use super::layer::ThrottleLayer;
use crate::error::{Result, TurnstileError};
use crate::throttle::ThrottleChain;

/// Demo HTTP server whose routes sit behind a [`ThrottleChain`].
///
/// `/health` is mounted outside the layer and is never throttled.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The shared throttle chain
    chain: Arc<ThrottleChain>,
}

impl HttpServer {
    /// Create a new server for the given chain.
    pub fn new(addr: SocketAddr, chain: Arc<ThrottleChain>) -> Self {
        Self { addr, chain }
    }

    /// Build the application router.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(index_handler))
            .route("/api/echo/{message}", get(echo_handler))
            .layer(ThrottleLayer::new(self.chain.clone()))
            .route("/health", get(health_handler))
    }

    /// Start the server.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server stops accepting connections when `signal` resolves. The
    /// chain's background tasks are stopped once in-flight requests finish.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;
        let router = self.router();

        info!(
            addr = %local_addr,
            rules = self.chain.rules().len(),
            "Starting HTTP server"
        );

        let result = axum::serve(listener, router)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                TurnstileError::Server(e.to_string())
            });

        self.chain.shutdown().await;
        result
    }
}

async fn index_handler() -> &'static str {
    "ok"
}

async fn echo_handler(axum::extract::Path(message): axum::extract::Path<String>) -> String {
    message
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "healthy" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throttle::{MemoryEventStore, ThrottleRule, WindowRule};
    use axum::body::Body;
    use axum::extract::Request;
    use http::StatusCode;
    use std::time::Duration;
    use tower::ServiceExt;

    fn blocking_chain() -> Arc<ThrottleChain> {
        let store = Arc::new(MemoryEventStore::new());
        let rule = WindowRule::builder("all", Duration::from_secs(60), 0, store)
            .build()
            .unwrap();
        let rules: Vec<Arc<dyn ThrottleRule>> = vec![Arc::new(rule)];
        Arc::new(ThrottleChain::new(rules, StatusCode::TOO_MANY_REQUESTS, "no"))
    }

    fn get_request(uri: &str) -> Request {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health_is_not_throttled() {
        let server = HttpServer::new("127.0.0.1:0".parse().unwrap(), blocking_chain());
        let router = server.router();

        for _ in 0..3 {
            let response = router.clone().oneshot(get_request("/health")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_routes_share_the_chain() {
        let server = HttpServer::new("127.0.0.1:0".parse().unwrap(), blocking_chain());
        let router = server.router();

        let first = router.clone().oneshot(get_request("/")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = router.oneshot(get_request("/api/echo/hi")).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_serve_with_shutdown_stops_rules() {
        let store = Arc::new(MemoryEventStore::new());
        let rule = Arc::new(
            WindowRule::builder("all", Duration::from_secs(60), 10, store)
                .build()
                .unwrap(),
        );
        let rules: Vec<Arc<dyn ThrottleRule>> = vec![rule.clone() as Arc<dyn ThrottleRule>];
        let chain = Arc::new(ThrottleChain::new(rules, StatusCode::TOO_MANY_REQUESTS, "no"));
        let server = HttpServer::new("127.0.0.1:0".parse().unwrap(), chain);

        assert!(rule.is_cleanup_running());
        server.serve_with_shutdown(async {}).await.unwrap();
        assert!(!rule.is_cleanup_running());
    }
}
