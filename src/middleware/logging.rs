//! Request logging middleware.
//!
//! Logs every API request with method, path, status and latency, and feeds
//! the same observations into the metrics recorder.

use axum::body::Body;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use std::time::Instant;
use tracing::{info, warn};

/// Health probes are frequent and boring; everything else is logged.
pub async fn request_logging(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    if path == "/health" {
        return next.run(request).await;
    }

    let start = Instant::now();
    let response = next.run(request).await;
    let latency = start.elapsed();
    let status = response.status().as_u16();

    metrics::histogram!("ltp_http_request_seconds", latency.as_secs_f64());
    metrics::counter!(
        "ltp_http_requests_total", 1,
        "status" => status.to_string(),
    );

    if status >= 500 {
        warn!(
            method = %method,
            path = %path,
            status,
            latency_ms = latency.as_millis() as u64,
            "request failed"
        );
    } else {
        info!(
            method = %method,
            path = %path,
            status,
            latency_ms = latency.as_millis() as u64,
            "request completed"
        );
    }

    response
}
