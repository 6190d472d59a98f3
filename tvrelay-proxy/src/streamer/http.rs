//! HTTP upstream.

use async_trait::async_trait;
use futures::StreamExt;
use log::info;
use reqwest::header::USER_AGENT;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tvrelay::{PullError, RelayWriter, Streamer};

/// Fetches a URL and relays the response body.
pub struct HttpStreamer {
    client: reqwest::Client,
    url: String,
    user_agent: Option<String>,
}

impl HttpStreamer {
    pub fn new(client: reqwest::Client, url: String, user_agent: Option<String>) -> Self {
        Self {
            client,
            url,
            user_agent,
        }
    }
}

#[async_trait]
impl Streamer for HttpStreamer {
    async fn pull(&self, cancel: CancellationToken, dest: &mut RelayWriter) -> Result<u64, PullError> {
        let mut request = self.client.get(&self.url);
        if let Some(user_agent) = &self.user_agent {
            request = request.header(USER_AGENT, user_agent);
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PullError::Canceled),
            response = request.send() => {
                response.map_err(|e| PullError::Upstream(format!("{}: {}", self.url, e)))?
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Err(PullError::Upstream(format!("{} returned {}", self.url, status)));
        }
        info!("[HttpStreamer] Connected to {} ({})", self.url, status);

        let mut body = response.bytes_stream();
        let mut total = 0u64;
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PullError::Canceled),
                chunk = body.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    dest.write_all(&bytes).await?;
                    total += bytes.len() as u64;
                }
                Some(Err(e)) => {
                    return Err(PullError::Upstream(format!("{}: {}", self.url, e)));
                }
                None => break,
            }
        }

        Ok(total)
    }

    fn describe(&self) -> String {
        format!("http {}", self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Router};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tvrelay::{RelayConfig, StreamKey, StreamRelay};

    async fn serve(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn relay() -> std::sync::Arc<StreamRelay> {
        StreamRelay::new(StreamKey::new("http"), RelayConfig::default())
    }

    #[tokio::test]
    async fn test_relays_body() {
        let app = Router::new().route("/live.ts", get(|| async { "transport-stream" }));
        let addr = serve(app).await;

        let relay = relay();
        let mut writer = relay.writer();
        let streamer = HttpStreamer::new(
            reqwest::Client::new(),
            format!("http://{}/live.ts", addr),
            Some("tvrelay-test".to_string()),
        );

        let n = streamer.pull(CancellationToken::new(), &mut writer).await.unwrap();
        assert_eq!(n, 16);
        assert_eq!(relay.bytes_written(), 16);
    }

    #[tokio::test]
    async fn test_error_status_fails() {
        let app = Router::new().route("/gone", get(|| async { StatusCode::NOT_FOUND }));
        let addr = serve(app).await;

        let relay = relay();
        let mut writer = relay.writer();
        let streamer = HttpStreamer::new(reqwest::Client::new(), format!("http://{}/gone", addr), None);

        let result = streamer.pull(CancellationToken::new(), &mut writer).await;
        assert!(matches!(result, Err(PullError::Upstream(msg)) if msg.contains("404")));
    }

    #[tokio::test]
    async fn test_cancel_stops_endless_body() {
        let app = Router::new().route(
            "/endless",
            get(|| async {
                let chunks = futures::stream::repeat_with(|| {
                    Ok::<_, std::io::Error>(bytes::Bytes::from_static(&[0x47; 188]))
                })
                .then(|chunk| async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    chunk
                });
                axum::body::Body::from_stream(chunks)
            }),
        );
        let addr = serve(app).await;

        let relay = relay();
        let mut writer = relay.writer();
        let streamer = HttpStreamer::new(reqwest::Client::new(), format!("http://{}/endless", addr), None);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(5), streamer.pull(cancel, &mut writer))
            .await
            .expect("cancel must stop the fetch");
        assert!(matches!(result, Err(PullError::Canceled)));
        assert!(relay.bytes_written() > 0);
    }
}
