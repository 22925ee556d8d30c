//! Service-wide error type.
//!
//! Every fallible operation in the crate surfaces one of these kinds so the
//! HTTP layer can map failures to status codes without string matching.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

#[derive(Debug, thiserror::Error)]
pub enum LtpError {
    /// The caller supplied a malformed or empty request.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The requested pair is not configured or not offered by the exchange.
    #[error("unsupported pair: {0}")]
    UnsupportedPair(String),

    /// The exchange reported an application-level error.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// The exchange could not be reached after exhausting retries.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// No cached or fresh price exists for a required pair.
    #[error("no price available for pair {0}")]
    PriceUnavailable(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, LtpError>;

impl LtpError {
    fn status_code(&self) -> StatusCode {
        match self {
            LtpError::InvalidInput(_) | LtpError::UnsupportedPair(_) => StatusCode::BAD_REQUEST,
            LtpError::Upstream(_) | LtpError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            LtpError::PriceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            LtpError::Config(_) | LtpError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            LtpError::InvalidInput(_) => "invalid_input",
            LtpError::UnsupportedPair(_) => "unsupported_pair",
            LtpError::Upstream(_) => "upstream_error",
            LtpError::UpstreamUnavailable(_) => "upstream_unavailable",
            LtpError::PriceUnavailable(_) => "price_unavailable",
            LtpError::Config(_) => "config_error",
            LtpError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for LtpError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
        });

        (self.status_code(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_map_to_400() {
        assert_eq!(
            LtpError::InvalidInput("empty".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            LtpError::UnsupportedPair("BTC/ZZZ".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn upstream_errors_map_to_502() {
        assert_eq!(
            LtpError::Upstream("EQuery:Unknown asset pair".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            LtpError::UpstreamUnavailable("connection refused".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn missing_price_maps_to_503() {
        assert_eq!(
            LtpError::PriceUnavailable("BTC/USD".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
