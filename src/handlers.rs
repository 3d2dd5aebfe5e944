//! One handler per test operation.
//!
//! Handlers do no timing themselves: the client measures round trips and
//! transfer rates from its side, the server only produces or swallows bytes.

use std::time::Duration;

use axum::Json;
use axum::body::Body;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use futures_util::StreamExt;
use tracing::debug;

use crate::buffer::BufferManager;
use crate::config::TestConfig;
use crate::error::{Result, SpeedtestError};
use crate::page;
use crate::params;
use crate::protocol::{self, IpInfo};

/// Latency probe: an empty 200.
pub fn ping() -> Response {
    StatusCode::OK.into_response()
}

/// Serve the first `X-Chunk-Size` bytes of the shared payload.
///
/// Counts as buffer activity: records the access and pushes the idle
/// eviction back by a full timeout.
pub async fn download(buffers: &BufferManager, headers: &HeaderMap) -> Result<Response> {
    buffers.touch();
    let payload = buffers.ensure().await?;
    buffers.schedule_eviction();

    let size = protocol::negotiate_chunk_size(
        header_str(headers, params::CHUNK_SIZE_HEADER),
        buffers.capacity(),
    );
    debug!(bytes = size, "serving download chunk");

    Ok((
        [
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
            (header::PRAGMA, "no-cache"),
            (header::EXPIRES, "0"),
        ],
        payload.slice(..size),
    )
        .into_response())
}

/// Serve the first `X-Calibration-Size` bytes of the shared payload.
///
/// Calibration is an out-of-band probe: it may allocate the buffer but does
/// not count as activity for eviction.
pub async fn calibration_download(
    buffers: &BufferManager,
    headers: &HeaderMap,
) -> Result<Response> {
    let payload = buffers.ensure().await?;
    let size = protocol::negotiate_calibration_size(
        header_str(headers, params::CALIBRATION_SIZE_HEADER),
        buffers.capacity(),
    );
    debug!(bytes = size, "serving calibration payload");
    Ok(payload.slice(..size).into_response())
}

/// Swallow an upload body and answer once it is fully received.
pub async fn upload(body: Body, limit: Option<Duration>) -> Result<Response> {
    let received = drain(body, limit).await?;
    debug!(bytes = received, "upload drained");
    Ok(StatusCode::OK.into_response())
}

/// Report the address the request is attributed to.
pub fn ip_lookup(info: IpInfo) -> Response {
    Json(info).into_response()
}

/// Render the test page from `template` for the current settings.
pub fn page(template: &str, asset_base: &str, config: &TestConfig) -> Result<Response> {
    Ok(Html(page::render(template, asset_base, config)?).into_response())
}

/// Read and discard a request body, returning the number of bytes consumed.
///
/// With a `limit`, a body still arriving when it elapses fails with
/// [`SpeedtestError::UploadTimeout`].
pub async fn drain(body: Body, limit: Option<Duration>) -> Result<u64> {
    let mut stream = body.into_data_stream();
    let consume = async move {
        let mut total = 0u64;
        while let Some(chunk) = stream.next().await {
            total += chunk?.len() as u64;
        }
        Ok::<_, SpeedtestError>(total)
    };

    match limit {
        Some(limit) => tokio::time::timeout(limit, consume)
            .await
            .map_err(|_elapsed| SpeedtestError::UploadTimeout(limit))?,
        None => consume.await,
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
