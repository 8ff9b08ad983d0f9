//! The four concrete middlewares making up the chain: error-map, rate-limit,
//! timeout, and performance annotation (outermost first, matching the order
//! the chain is assembled in `main`).

use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use http::{HeaderValue, StatusCode};
use streamgate_core::{full_body, GatewayError, GatewayRequest, GatewayResponse, Middleware, Next};
use streamgate_ratelimit::RateLimiter;

/// The connection's peer address, inserted into request extensions by the
/// accept loop before the request ever reaches the middleware chain.
#[derive(Debug, Clone, Copy)]
pub struct PeerAddr(pub SocketAddr);

fn error_response(err: &GatewayError) -> GatewayResponse {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = http::Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(err.public_message()))
        .expect("well-formed error response");

    if let Some(secs) = err.retry_after_secs() {
        response
            .headers_mut()
            .insert(http::header::RETRY_AFTER, HeaderValue::from(secs));
    }
    if let Some(range) = err.content_range() {
        if let Ok(value) = HeaderValue::from_str(&range) {
            response.headers_mut().insert(http::header::CONTENT_RANGE, value);
        }
    }
    response
}

/// Outermost: converts any propagated [`GatewayError`] into a concrete HTTP
/// response. `Cancelled` is the one variant that re-raises instead, so a
/// disconnected client's handler unwinds without writing a response nobody
/// will read.
pub struct ErrorMapMiddleware;

fn stamp_date(resp: &mut GatewayResponse) {
    let date = httpdate::fmt_http_date(SystemTime::now());
    if let Ok(value) = HeaderValue::from_str(&date) {
        resp.headers_mut().insert(http::header::DATE, value);
    }
}

#[async_trait]
impl Middleware for ErrorMapMiddleware {
    async fn handle(&self, req: GatewayRequest, next: Next) -> Result<GatewayResponse, GatewayError> {
        match next(req).await {
            Ok(mut resp) => {
                stamp_date(&mut resp);
                Ok(resp)
            }
            Err(GatewayError::Cancelled) => Err(GatewayError::Cancelled),
            Err(err) => {
                if matches!(err, GatewayError::Unexpected(_)) {
                    tracing::error!(error = %err, "unexpected error");
                }
                let mut resp = error_response(&err);
                stamp_date(&mut resp);
                Ok(resp)
            }
        }
    }
}

/// Sliding-window rate limiting, keyed by `X-Forwarded-For` (first hop) or
/// peer address. Bypassed for `/status` and a configured whitelist.
pub struct RateLimitMiddleware {
    limiter: RateLimiter,
    whitelist: Vec<String>,
}

impl RateLimitMiddleware {
    pub fn new(rate_limit: u64, burst_limit: u64, whitelist: Vec<String>) -> Self {
        Self {
            limiter: RateLimiter::new(rate_limit, burst_limit),
            whitelist,
        }
    }

    fn key_for(&self, req: &GatewayRequest) -> String {
        if let Some(xff) = req.headers().get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            if let Some(first) = xff.split(',').next() {
                return first.trim().to_string();
            }
        }
        req.extensions()
            .get::<PeerAddr>()
            .map(|p| p.0.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    async fn handle(&self, req: GatewayRequest, next: Next) -> Result<GatewayResponse, GatewayError> {
        let path = req.uri().path().to_string();
        if path.starts_with("/status") {
            return next(req).await;
        }
        let key = self.key_for(&req);
        if self.whitelist.iter().any(|w| w == &key) {
            return next(req).await;
        }

        let decision = self.limiter.check(&key);
        if !decision.allowed {
            return Err(GatewayError::RateLimited {
                retry_after_secs: decision.retry_after_secs,
            });
        }
        next(req).await
    }
}

/// Deadline on the handler: `request_timeout` for `/dl` and `/watch`, 60s
/// otherwise. See [`crate::streamer::Streamer::stream`] for how the
/// streaming body itself is bounded once headers are already committed.
pub struct TimeoutMiddleware {
    request_timeout: Duration,
    default_timeout: Duration,
}

impl TimeoutMiddleware {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            request_timeout,
            default_timeout: Duration::from_secs(60),
        }
    }

    fn deadline_for(&self, path: &str) -> Duration {
        if path.starts_with("/dl") || path.starts_with("/watch") {
            self.request_timeout
        } else {
            self.default_timeout
        }
    }
}

#[async_trait]
impl Middleware for TimeoutMiddleware {
    async fn handle(&self, req: GatewayRequest, next: Next) -> Result<GatewayResponse, GatewayError> {
        let deadline = self.deadline_for(req.uri().path());
        match tokio::time::timeout(deadline, next(req)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(GatewayError::RequestTimeout),
        }
    }
}

/// Innermost: records wall-clock time around the handler, stamping
/// `X-Response-Time` on success and warning past a 5s threshold.
pub struct PerformanceMiddleware;

#[async_trait]
impl Middleware for PerformanceMiddleware {
    async fn handle(&self, req: GatewayRequest, next: Next) -> Result<GatewayResponse, GatewayError> {
        let path = req.uri().path().to_string();
        let started = Instant::now();
        let result = next(req).await;
        let elapsed = started.elapsed();

        if elapsed > Duration::from_secs(5) {
            tracing::warn!(path, secs = elapsed.as_secs_f64(), "slow request");
        }

        match result {
            Ok(mut resp) => {
                if let Ok(value) = HeaderValue::from_str(&format!("{:.3}s", elapsed.as_secs_f64())) {
                    resp.headers_mut().insert("x-response-time", value);
                }
                Ok(resp)
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{BodyExt, Empty};
    use std::sync::Arc;
    use streamgate_core::{HandlerFn, MiddlewareChain};

    fn empty_request(path: &str) -> GatewayRequest {
        http::Request::builder()
            .uri(path)
            .body(Empty::<bytes::Bytes>::new().map_err(|never| match never {}).boxed())
            .unwrap()
    }

    fn ok_handler() -> HandlerFn {
        Arc::new(|_req| Box::pin(async { Ok(http::Response::new(full_body("ok"))) }))
    }

    fn err_handler(err: GatewayError) -> HandlerFn {
        Arc::new(move |_req| {
            let err = match &err {
                GatewayError::RateLimited { retry_after_secs } => GatewayError::RateLimited {
                    retry_after_secs: *retry_after_secs,
                },
                _ => GatewayError::Unavailable,
            };
            Box::pin(async move { Err(err) })
        })
    }

    #[tokio::test]
    async fn error_map_turns_known_errors_into_responses() {
        let chain = MiddlewareChain::new().with(ErrorMapMiddleware);
        let resp = chain
            .apply(empty_request("/dl/x"), err_handler(GatewayError::Unavailable))
            .await
            .unwrap();
        assert_eq!(resp.status(), 503);
    }

    #[tokio::test]
    async fn error_map_lets_cancellation_propagate() {
        let chain = MiddlewareChain::new().with(ErrorMapMiddleware);
        let handler: HandlerFn = Arc::new(|_req| Box::pin(async { Err(GatewayError::Cancelled) }));
        let err = chain.apply(empty_request("/dl/x"), handler).await.unwrap_err();
        assert!(matches!(err, GatewayError::Cancelled));
    }

    #[tokio::test]
    async fn rate_limit_bypasses_status_route() {
        let mw = RateLimitMiddleware::new(0, 0, Vec::new());
        let chain = MiddlewareChain::new().with(mw);
        let resp = chain.apply(empty_request("/status"), ok_handler()).await.unwrap();
        assert_eq!(resp.status(), 200);
    }

    #[tokio::test]
    async fn rate_limit_rejects_over_budget() {
        let mw = RateLimitMiddleware::new(0, 0, Vec::new());
        let chain = MiddlewareChain::new().with(mw);
        let err = chain.apply(empty_request("/dl/x"), ok_handler()).await.unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn rate_limit_respects_whitelist() {
        let mw = RateLimitMiddleware::new(0, 0, vec!["unknown".to_string()]);
        let chain = MiddlewareChain::new().with(mw);
        let resp = chain.apply(empty_request("/dl/x"), ok_handler()).await.unwrap();
        assert_eq!(resp.status(), 200);
    }

    #[tokio::test]
    async fn timeout_fires_when_handler_outlasts_deadline() {
        let mw = TimeoutMiddleware::new(Duration::from_millis(10));
        let chain = MiddlewareChain::new().with(mw);
        let handler: HandlerFn = Arc::new(|_req| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(http::Response::new(full_body("late")))
            })
        });
        let err = chain.apply(empty_request("/thumb/x"), handler).await.unwrap_err();
        assert!(matches!(err, GatewayError::RequestTimeout));
    }

    #[tokio::test]
    async fn performance_middleware_stamps_header() {
        let chain = MiddlewareChain::new().with(PerformanceMiddleware);
        let resp = chain.apply(empty_request("/watch/x"), ok_handler()).await.unwrap();
        assert!(resp.headers().contains_key("x-response-time"));
    }
}
