//! Channel streaming endpoint.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, RawQuery, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use log::{info, warn};
use tokio_util::io::ReaderStream;
use tvrelay::BrokerError;

use crate::streamer::UpstreamError;
use crate::web::state::WebState;

/// Serve a channel as an MPEG-TS stream.
///
/// The viewer stays attached for as long as the response body is being
/// consumed; a client disconnect drops the body and detaches the viewer.
pub async fn stream_channel(
    Path(name): Path<String>,
    RawQuery(query): RawQuery,
    State(web_state): State<Arc<WebState>>,
) -> Response {
    let request = match web_state.request_for(&name, query.as_deref()) {
        Ok(request) => request,
        Err(e @ UpstreamError::UnknownChannel(_)) => {
            return (StatusCode::NOT_FOUND, e.to_string()).into_response();
        }
        Err(e) => {
            warn!("[Web] Cannot build upstream for {}: {}", name, e);
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };

    let key = request.key.clone();
    let reader = match web_state.broker.open(request).await {
        Ok(reader) => reader,
        Err(BrokerError::CapacityExceeded) => {
            warn!("[Web] Rate limited: {} ({})", name, key);
            return (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, "5")],
                "All upstream slots are busy, try again later",
            )
                .into_response();
        }
        Err(BrokerError::Closed) => {
            return (StatusCode::SERVICE_UNAVAILABLE, "Shutting down").into_response();
        }
        Err(e) => {
            warn!("[Web] Failed to open {}: {}", name, e);
            return (StatusCode::BAD_GATEWAY, e.to_string()).into_response();
        }
    };

    info!("[Web] Streaming {} to viewer {}", name, reader.sink_id());

    let body = Body::from_stream(ReaderStream::new(reader));
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "video/mp2t"),
            (header::CACHE_CONTROL, "no-cache, no-store"),
        ],
        body,
    )
        .into_response()
}
