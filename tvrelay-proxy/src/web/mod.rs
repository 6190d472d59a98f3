//! HTTP server: channel streams and monitoring API.

pub mod api;
pub mod state;
pub mod stream;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use state::WebState;

/// Build the application router.
pub fn router(web_state: Arc<WebState>) -> Router {
    Router::new()
        .route("/stream/:channel", get(stream::stream_channel))
        .route("/api/relays", get(api::get_relays))
        .route("/api/relays/sweep", post(api::sweep_relays))
        .route("/api/stats", get(api::get_stats))
        .route("/api/channels", get(api::get_channels))
        .route("/api/channels/:channel/stop", post(api::stop_channel))
        .with_state(web_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Serve until `shutdown` resolves.
pub async fn start_web_server<F>(
    listen_addr: SocketAddr,
    web_state: Arc<WebState>,
    shutdown: F,
) -> Result<(), Box<dyn std::error::Error>>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(web_state);

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    log::info!("Listening on http://{}", listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;
    use tvrelay::StreamBroker;

    use crate::config::ConfigFile;

    const CONFIG: &str = r#"
[broker]
acquire_timeout_secs = 1

[[channels]]
name = "hello"
url = "cmd://hello"
command = ["sh", "-c", "printf hello"]

[[channels]]
name = "idle"
url = "cmd://idle"
command = ["sh", "-c", "sleep 30"]
"#;

    fn app(max_upstreams: u32) -> (Router, StreamBroker) {
        let config = ConfigFile::parse(CONFIG).unwrap();
        let broker = StreamBroker::new(config.broker.broker_config());
        let state = WebState::new(broker.clone(), &config, max_upstreams, reqwest::Client::new());
        (router(Arc::new(state)), broker)
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_stream_channel() {
        let (app, broker) = app(0);

        let response = app.oneshot(get_request("/stream/hello")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "video/mp2t");

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"hello");
        broker.close().await;
    }

    #[tokio::test]
    async fn test_unknown_channel() {
        let (app, _broker) = app(0);
        let response = app.oneshot(get_request("/stream/nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_capacity_exceeded_is_429() {
        let (app, broker) = app(1);

        let busy = app.clone().oneshot(get_request("/stream/idle")).await.unwrap();
        assert_eq!(busy.status(), StatusCode::OK);

        let limited = app.clone().oneshot(get_request("/stream/hello")).await.unwrap();
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);

        let stats = app.oneshot(get_request("/api/stats")).await.unwrap();
        let body = to_bytes(stats.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["stats"]["capacity_rejections"], 1);
        assert_eq!(json["limits"][0]["name"], "global");

        drop(busy);
        broker.close().await;
    }

    #[tokio::test]
    async fn test_stop_channel_ends_stream() {
        let (app, broker) = app(1);

        let live = app.clone().oneshot(get_request("/stream/idle")).await.unwrap();
        assert_eq!(live.status(), StatusCode::OK);

        let stop = Request::builder()
            .method("POST")
            .uri("/api/channels/idle/stop")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(stop).await.unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["stopped"], 1);

        // The body ends and the only upstream slot frees up.
        let streamed = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            to_bytes(live.into_body(), usize::MAX),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(streamed.is_empty());

        let unknown = Request::builder()
            .method("POST")
            .uri("/api/channels/nope/stop")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(unknown).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        broker.close().await;
    }

    #[tokio::test]
    async fn test_list_channels() {
        let (app, _broker) = app(0);
        let response = app.oneshot(get_request("/api/channels")).await.unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();

        let names: Vec<&str> = json["channels"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["hello", "idle"]);
        assert_eq!(json["channels"][0]["kind"], "command");
    }
}
