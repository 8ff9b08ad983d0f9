//! The request/response middleware chain.
//!
//! Order (outermost first): error-map → rate-limit → timeout → performance.
//! Each middleware wraps the next as a `Next` continuation, exactly the
//! "onion" shape used throughout the framework this gateway is built on.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use http::{Request, Response};

use crate::body::{RequestBody, ResponseBody};
use crate::error::GatewayError;

pub type GatewayRequest = Request<RequestBody>;
pub type GatewayResponse = Response<ResponseBody>;
type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// The remaining chain, captured as a continuation a middleware can call
/// at most once.
pub type Next = Box<dyn FnOnce(GatewayRequest) -> BoxFuture<Result<GatewayResponse, GatewayError>> + Send>;

pub type HandlerFn = Arc<
    dyn Fn(GatewayRequest) -> BoxFuture<Result<GatewayResponse, GatewayError>> + Send + Sync,
>;

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, req: GatewayRequest, next: Next) -> Result<GatewayResponse, GatewayError>;
}

/// Ordered, immutable list of middlewares wrapping a terminal handler.
#[derive(Clone)]
pub struct MiddlewareChain {
    middlewares: Arc<Vec<Arc<dyn Middleware>>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self {
            middlewares: Arc::new(Vec::new()),
        }
    }

    /// Append a middleware. Chains are built once at startup in the order
    /// listed in the module doc comment, outermost first.
    pub fn with(mut self, middleware: impl Middleware + 'static) -> Self {
        let mut mws = (*self.middlewares).clone();
        mws.push(Arc::new(middleware));
        self.middlewares = Arc::new(mws);
        self
    }

    pub async fn apply(
        &self,
        req: GatewayRequest,
        handler: HandlerFn,
    ) -> Result<GatewayResponse, GatewayError> {
        self.execute_from(0, req, handler).await
    }

    fn execute_from(
        &self,
        index: usize,
        req: GatewayRequest,
        handler: HandlerFn,
    ) -> BoxFuture<Result<GatewayResponse, GatewayError>> {
        if index >= self.middlewares.len() {
            return handler(req);
        }
        let middleware = self.middlewares[index].clone();
        let chain = self.clone();
        let handler = handler.clone();
        Box::pin(async move {
            middleware
                .handle(
                    req,
                    Box::new(move |req| chain.execute_from(index + 1, req, handler)),
                )
                .await
        })
    }
}

impl Default for MiddlewareChain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::full_body;
    use http_body_util::{BodyExt, Empty};

    struct AddHeader(&'static str, &'static str);

    #[async_trait]
    impl Middleware for AddHeader {
        async fn handle(
            &self,
            req: GatewayRequest,
            next: Next,
        ) -> Result<GatewayResponse, GatewayError> {
            let mut resp = next(req).await?;
            resp.headers_mut().insert(
                http::HeaderName::from_static(self.0),
                http::HeaderValue::from_static(self.1),
            );
            Ok(resp)
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl Middleware for ShortCircuit {
        async fn handle(
            &self,
            _req: GatewayRequest,
            _next: Next,
        ) -> Result<GatewayResponse, GatewayError> {
            Err(GatewayError::RateLimited {
                retry_after_secs: 30,
            })
        }
    }

    fn empty_request() -> GatewayRequest {
        Request::builder()
            .uri("/test")
            .body(
                Empty::<bytes::Bytes>::new()
                    .map_err(|never| match never {})
                    .boxed(),
            )
            .unwrap()
    }

    fn ok_handler() -> HandlerFn {
        Arc::new(|_req| Box::pin(async { Ok(Response::new(full_body("ok"))) }))
    }

    #[tokio::test]
    async fn chain_runs_outer_to_inner_then_back_out() {
        let chain = MiddlewareChain::new()
            .with(AddHeader("x-outer", "1"))
            .with(AddHeader("x-inner", "1"));

        let resp = chain.apply(empty_request(), ok_handler()).await.unwrap();

        assert_eq!(resp.headers().get("x-outer").unwrap(), "1");
        assert_eq!(resp.headers().get("x-inner").unwrap(), "1");
    }

    #[tokio::test]
    async fn empty_chain_calls_handler_directly() {
        let chain = MiddlewareChain::new();
        let resp = chain.apply(empty_request(), ok_handler()).await.unwrap();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn a_middleware_can_short_circuit_the_chain() {
        let chain = MiddlewareChain::new()
            .with(AddHeader("x-outer", "1"))
            .with(ShortCircuit);

        let err = chain
            .apply(empty_request(), ok_handler())
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::RateLimited { .. }));
    }
}
