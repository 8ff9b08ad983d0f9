//! HTTP plumbing shared across the gateway: error taxonomy, streaming
//! bodies, the middleware chain, and logging setup.

pub mod body;
pub mod error;
pub mod logging;
pub mod middleware;

pub use body::{box_incoming, empty_body, full_body, streaming_body, ByteStreamSender, RequestBody, ResponseBody};
pub use error::GatewayError;
pub use logging::LogConfig;
pub use middleware::{GatewayRequest, GatewayResponse, HandlerFn, Middleware, MiddlewareChain, Next};
