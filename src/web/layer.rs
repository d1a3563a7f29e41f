//! Tower layer applying a [`ThrottleChain`] in front of a service.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::{
    body::Body,
    extract::Request,
    response::{IntoResponse, Response},
};
use futures::future::BoxFuture;
use tower::{Layer, Service};

use crate::throttle::{Decision, ThrottleChain};

/// Build the configured rejection response for a chain.
pub fn reject_response(chain: &ThrottleChain) -> Response {
    let mut response = Response::new(Body::from(chain.reject_body().clone()));
    *response.status_mut() = chain.reject_status();
    response
}

/// Tower layer for request throttling.
#[derive(Debug, Clone)]
pub struct ThrottleLayer {
    chain: Arc<ThrottleChain>,
}

impl ThrottleLayer {
    /// Create a layer that evaluates `chain` for every request.
    pub fn new(chain: Arc<ThrottleChain>) -> Self {
        Self { chain }
    }
}

impl<S> Layer<S> for ThrottleLayer {
    type Service = ThrottleService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ThrottleService {
            inner,
            chain: self.chain.clone(),
        }
    }
}

/// Tower service that rejects throttled requests and forwards the rest.
#[derive(Debug, Clone)]
pub struct ThrottleService<S> {
    inner: S,
    chain: Arc<ThrottleChain>,
}

impl<S> Service<Request> for ThrottleService<S>
where
    S: Service<Request> + Clone + Send + 'static,
    S::Response: IntoResponse,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let chain = self.chain.clone();
        // Keep the instance that was driven to readiness.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let (parts, body) = req.into_parts();

            match chain.evaluate(&parts).await {
                Decision::Allowed => {
                    let response = inner.call(Request::from_parts(parts, body)).await?;
                    Ok(response.into_response())
                }
                Decision::Rejected { .. } => Ok(reject_response(&chain)),
            }
        })
    }
}
