//! Readiness probe plumbing for rollout coordination.
//!
//! A node being replaced clears its scratch directory and serves a
//! readiness probe; the replacement waits on that probe before taking
//! traffic.

use std::path::Path;
use std::time::Duration;

use axum::{
    extract::Request,
    http::{Method, StatusCode},
    Router,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{Error, Result};

/// Poll `GET http://<host>/readyz` every `interval` until it succeeds.
///
/// After `max_attempts_before_backoff` consecutive failures the interval
/// doubles per failure. Cancellation of `token` surfaces as the context
/// deadline error.
pub async fn wait(
    token: CancellationToken,
    host: &str,
    interval: Duration,
    max_attempts_before_backoff: u32,
) -> Result<()> {
    let client = reqwest::Client::new();
    let url = format!("http://{host}/readyz");
    let mut attempts: u32 = 0;
    let mut delay = interval;
    loop {
        let response = tokio::select! {
            _ = token.cancelled() => return Err(Error::DeadlineExceeded),
            response = client.get(&url).send() => response,
        };
        match response {
            Ok(res) if res.status().is_success() => return Ok(()),
            Ok(res) => debug!(status = %res.status(), "readiness probe not ready"),
            Err(err) => debug!(%err, "readiness probe unreachable"),
        }
        attempts += 1;
        if attempts >= max_attempts_before_backoff {
            delay = delay.saturating_mul(2);
        }
        tokio::select! {
            _ = token.cancelled() => return Err(Error::DeadlineExceeded),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Clear the scratch directory and serve the readiness probe on `addr`
/// until cancellation. `GET /readyz` answers 200; everything else 404.
pub async fn run(token: CancellationToken, addr: &str, dir: &Path) -> Result<()> {
    clear_directory(dir).await?;

    let app = Router::new()
        .fallback(probe)
        .layer(axum::middleware::from_fn(crate::httpx::logging_middleware));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    debug!(addr = %listener.local_addr()?, "serving readiness probe");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;
    Ok(())
}

async fn probe(request: Request) -> StatusCode {
    if request.method() == Method::GET && request.uri().path() == "/readyz" {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn clear_directory(dir: &Path) -> Result<()> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
    }
    Ok(())
}
