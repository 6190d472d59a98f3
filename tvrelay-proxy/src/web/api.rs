//! Web API endpoints for monitoring.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;

use crate::web::state::WebState;

/// Channel as listed by the API.
#[derive(Debug, Serialize)]
pub struct ChannelInfo {
    pub name: String,
    pub url: String,
    pub source: Option<String>,
    /// "command" or "http".
    pub kind: &'static str,
    /// Viewers currently attached to any stream of this channel.
    pub viewers: usize,
}

/// List active relays.
pub async fn get_relays(State(web_state): State<Arc<WebState>>) -> impl IntoResponse {
    let relays = web_state.broker.relay_stats().await;
    Json(json!({
        "success": true,
        "relays": relays
    }))
}

/// Broker and limit counters.
pub async fn get_stats(State(web_state): State<Arc<WebState>>) -> impl IntoResponse {
    let stats = web_state.broker.stats().await;
    Json(json!({
        "success": true,
        "stats": stats,
        "limits": web_state.limit_stats(),
        "uptime_seconds": web_state.started_at.elapsed().as_secs()
    }))
}

/// List configured channels.
pub async fn get_channels(State(web_state): State<Arc<WebState>>) -> impl IntoResponse {
    let relays = web_state.broker.relay_stats().await;

    let channels: Vec<ChannelInfo> = web_state
        .channels()
        .iter()
        .map(|channel| ChannelInfo {
            name: channel.name.clone(),
            url: channel.url.clone(),
            source: channel.source.clone(),
            kind: if channel.command.is_some() { "command" } else { "http" },
            viewers: relays
                .iter()
                .filter(|r| r.key.has_base(&channel.url))
                .map(|r| r.clients)
                .sum(),
        })
        .collect();

    Json(json!({
        "success": true,
        "channels": channels
    }))
}

/// Evict idle relays now.
pub async fn sweep_relays(State(web_state): State<Arc<WebState>>) -> impl IntoResponse {
    let evicted = web_state.broker.sweep().await;
    Json(json!({
        "success": true,
        "evicted": evicted
    }))
}

/// Stop every active stream of a channel, disconnecting its viewers.
pub async fn stop_channel(
    Path(name): Path<String>,
    State(web_state): State<Arc<WebState>>,
) -> Response {
    let Some(channel) = web_state.channel(&name) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({
                "success": false,
                "error": format!("Unknown channel: {}", name)
            })),
        )
            .into_response();
    };

    let mut stopped = 0;
    for key in web_state.broker.active_keys().await {
        if key.has_base(&channel.url) && web_state.broker.stop(&key).await {
            stopped += 1;
        }
    }
    log::info!("[Web] Stopped {} streams of {}", stopped, name);

    Json(json!({
        "success": true,
        "stopped": stopped
    }))
    .into_response()
}
