//! Shared HTTP plumbing: header names and request tracing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::{extract::Request, middleware::Next, response::Response};
use tracing::{info, info_span, warn, Instrument};

/// Digest header used by registries on blob and manifest responses.
pub const HEADER_DOCKER_DIGEST: &str = "docker-content-digest";

/// Request correlation header injected on outbound requests.
pub const HEADER_REQUEST_ID: &str = "x-request-id";

pub const CONTENT_TYPE_BINARY: &str = "application/octet-stream";
pub const CONTENT_TYPE_JSON: &str = "application/json";

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Attach a process-unique request id to an outbound request so peers can
/// correlate log lines across nodes.
pub fn with_request_id(req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    let id = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    req.header(HEADER_REQUEST_ID, format!("{id:016x}"))
}

/// Request logging middleware
///
/// Opens a span per inbound request and logs method, path, status and
/// latency once the handler returns.
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let request_id = request
        .headers()
        .get(HEADER_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(ToOwned::to_owned);
    let span = info_span!("http_request", %method, %path, request_id = request_id.as_deref());

    async move {
        let start = Instant::now();
        let response = next.run(request).await;
        let duration = start.elapsed();
        let status = response.status();

        if status.is_client_error() || status.is_server_error() {
            warn!("{} {} {} ({:?})", method, path, status, duration);
        } else {
            info!("{} {} {} ({:?})", method, path, status, duration);
        }
        response
    }
    .instrument(span)
    .await
}
