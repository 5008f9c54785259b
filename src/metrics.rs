//! Prometheus metrics for azupload.
//!
//! A single global Prometheus recorder backs every counter here.  The
//! gateway records request counts and latency per method, plus bytes moved
//! and storage failures.
//!
//! The main listener treats every path as a blob path, so `/metrics` and
//! `/health` only exist on the metrics listener.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

// -- Names --------------------------------------------------------------------

/// Total HTTP requests (counter). Labels: method, status.
pub const HTTP_REQUESTS_TOTAL: &str = "azupload_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "azupload_http_request_duration_seconds";

/// Total bytes written to storage by uploads (counter).
pub const BYTES_UPLOADED_TOTAL: &str = "azupload_bytes_uploaded_total";

/// Total bytes streamed to clients by downloads (counter).
pub const BYTES_DOWNLOADED_TOTAL: &str = "azupload_bytes_downloaded_total";

/// Storage failures surfaced as 500 responses (counter).
pub const STORAGE_ERRORS_TOTAL: &str = "azupload_storage_errors_total";

// -- Recorder -----------------------------------------------------------------

/// Handle used by `/metrics` to render the exposition text.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the recorder once per process; later calls return the same
/// handle.  Fails if some other recorder got there first.
pub fn init_metrics() -> anyhow::Result<&'static PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle);
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {}", e))?;
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle))
}

/// Attach help text to every metric this crate emits.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(BYTES_UPLOADED_TOTAL, "Total bytes uploaded to storage");
    describe_counter!(BYTES_DOWNLOADED_TOTAL, "Total bytes streamed to clients");
    describe_counter!(STORAGE_ERRORS_TOTAL, "Total storage failures");
}

pub fn record_bytes_uploaded(bytes: u64) {
    counter!(BYTES_UPLOADED_TOTAL).increment(bytes);
}

pub fn record_bytes_downloaded(bytes: u64) {
    counter!(BYTES_DOWNLOADED_TOTAL).increment(bytes);
}

pub fn record_storage_error() {
    counter!(STORAGE_ERRORS_TOTAL).increment(1);
}

// -- Request accounting -------------------------------------------------------

/// Count and time every request on the main listener.
///
/// Paths are blob keys, so they stay out of the labels.
/// Duration covers the handler up to the response head; streamed bodies
/// continue afterwards.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    let method = normalize_method(req.method().as_str());

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method, "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method).record(duration);

    response
}

/// Collapse arbitrary request methods into a bounded label set.
fn normalize_method(method: &str) -> &'static str {
    match method {
        "GET" => "GET",
        "POST" => "POST",
        _ => "OTHER",
    }
}

// -- Metrics listener ---------------------------------------------------------

/// Router for the metrics listener: `/metrics` and `/health`.
pub fn metrics_router() -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_check))
}

/// `GET /metrics` -- Prometheus text exposition.
async fn metrics_handler() -> Response {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics not initialized").into_response(),
    }
}

/// `GET /health` -- liveness probe.
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tower::ServiceExt;

    #[test]
    fn test_normalize_method() {
        assert_eq!(normalize_method("GET"), "GET");
        assert_eq!(normalize_method("POST"), "POST");
        assert_eq!(normalize_method("DELETE"), "OTHER");
        assert_eq!(normalize_method("BREW"), "OTHER");
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let response = metrics_router()
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], br#"{"status":"ok"}"#);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_renders_counters() {
        init_metrics().unwrap();
        describe_metrics();
        record_bytes_uploaded(42);

        let response = metrics_router()
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains(BYTES_UPLOADED_TOTAL));
    }
}
