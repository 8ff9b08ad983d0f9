//! The gateway's error taxonomy and its mapping onto HTTP status codes.
//!
//! Propagation policy: retry locally whenever a retry budget remains,
//! surface a [`GatewayError`] once that budget is exhausted. Never leak
//! internals — every variant's `Display` is a stable, human-readable
//! message safe to hand to an HTTP client.

/// Errors the streaming data path can surface to an HTTP client.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The request's hash/signature check failed.
    #[error("invalid or expired link")]
    InvalidHash,

    /// No metadata record for the requested identifier.
    #[error("file not found")]
    FileNotFound,

    /// The requested byte range can't be satisfied against the file size.
    #[error("range not satisfiable")]
    RangeNotSatisfiable { size: u64 },

    /// The caller exceeded the rate limit.
    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    /// The whole-request deadline elapsed.
    #[error("request timed out")]
    RequestTimeout,

    /// The file is in the resolution failure-cooldown window, or every
    /// upstream client is unhealthy.
    #[error("service temporarily unavailable")]
    Unavailable,

    /// An upstream auth-exchange (export/import authorization) failed
    /// after exhausting its retry budget.
    #[error("upstream authorization exchange failed")]
    AuthExchangeFailed,

    /// The request was cancelled (client disconnect, server shutdown).
    /// Not surfaced as an HTTP response — propagated so callers can clean
    /// up and stop.
    #[error("request cancelled")]
    Cancelled,

    /// Anything else. The inner string is for server-side logs only and
    /// must never be echoed verbatim in a response body.
    #[error("an unexpected error occurred")]
    Unexpected(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl GatewayError {
    pub fn unexpected(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        GatewayError::Unexpected(err.into())
    }

    /// HTTP status code for this error, per the taxonomy in the design doc.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::InvalidHash => 403,
            GatewayError::FileNotFound => 404,
            GatewayError::RangeNotSatisfiable { .. } => 416,
            GatewayError::RateLimited { .. } => 429,
            GatewayError::RequestTimeout => 504,
            GatewayError::Unavailable => 503,
            GatewayError::AuthExchangeFailed => 502,
            GatewayError::Cancelled => 499,
            GatewayError::Unexpected(_) => 500,
        }
    }

    /// `Retry-After` header value, when one applies.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            GatewayError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// `Content-Range` header value for 416 responses.
    pub fn content_range(&self) -> Option<String> {
        match self {
            GatewayError::RangeNotSatisfiable { size } => Some(format!("bytes */{size}")),
            _ => None,
        }
    }

    /// The stable, client-safe message. Distinct from `Display` only for
    /// `Unexpected`, which never echoes its inner error text.
    pub fn public_message(&self) -> String {
        match self {
            GatewayError::Unexpected(_) => "An unexpected error occurred.".to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_the_taxonomy() {
        assert_eq!(GatewayError::InvalidHash.status_code(), 403);
        assert_eq!(GatewayError::FileNotFound.status_code(), 404);
        assert_eq!(
            GatewayError::RangeNotSatisfiable { size: 10 }.status_code(),
            416
        );
        assert_eq!(
            GatewayError::RateLimited {
                retry_after_secs: 60
            }
            .status_code(),
            429
        );
        assert_eq!(GatewayError::RequestTimeout.status_code(), 504);
        assert_eq!(GatewayError::Unavailable.status_code(), 503);
    }

    #[test]
    fn unexpected_never_leaks_internal_text() {
        let err = GatewayError::unexpected(std::io::Error::other("db password is hunter2"));
        assert_eq!(err.public_message(), "An unexpected error occurred.");
    }

    #[test]
    fn range_not_satisfiable_reports_content_range() {
        let err = GatewayError::RangeNotSatisfiable { size: 1_048_576 };
        assert_eq!(err.content_range(), Some("bytes */1048576".to_string()));
    }
}
