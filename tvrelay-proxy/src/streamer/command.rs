//! Subprocess upstream.

use std::process::Stdio;

use async_trait::async_trait;
use log::{debug, info};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tokio_util::sync::CancellationToken;
use tvrelay::{PullError, RelayWriter, Streamer};

use super::READ_CHUNK;

/// Runs a command and relays its stdout.
///
/// The child is killed when the pull is canceled or dropped.
pub struct CommandStreamer {
    argv: Vec<String>,
}

impl CommandStreamer {
    /// Create from an argv, used as is.
    pub fn new(argv: Vec<String>) -> Option<Self> {
        if argv.first().map_or(true, |program| program.trim().is_empty()) {
            return None;
        }
        Some(Self { argv })
    }

    /// Create from a template, replacing `{url}` in every argument.
    pub fn from_template(template: &[String], url: &str) -> Option<Self> {
        Self::new(template.iter().map(|arg| arg.replace("{url}", url)).collect())
    }

    /// The resolved command line.
    pub fn argv(&self) -> &[String] {
        &self.argv
    }
}

#[async_trait]
impl Streamer for CommandStreamer {
    async fn pull(&self, cancel: CancellationToken, dest: &mut RelayWriter) -> Result<u64, PullError> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| PullError::Spawn("empty command".to_string()))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PullError::Spawn(format!("{}: {}", program, e)))?;

        info!("[CommandStreamer] Started {} (pid {:?})", program, child.id());

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| PullError::Spawn("stdout not captured".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(program.clone(), stderr));
        }

        let mut buf = vec![0u8; READ_CHUNK];
        let mut total = 0u64;
        loop {
            let n = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("[CommandStreamer] Killing {}", program);
                    let _ = child.kill().await;
                    return Err(PullError::Canceled);
                }
                read = stdout.read(&mut buf) => read?,
            };
            if n == 0 {
                break;
            }
            dest.write_all(&buf[..n]).await?;
            total += n as u64;
        }

        // Stdout can close while the process keeps running.
        let exited = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            status = child.wait() => Some(status),
        };
        let status = match exited {
            Some(status) => status?,
            None => {
                debug!("[CommandStreamer] Killing {} after end of output", program);
                let _ = child.kill().await;
                return Err(PullError::Canceled);
            }
        };
        if !status.success() {
            return Err(PullError::Upstream(format!("{} exited with {}", program, status)));
        }
        Ok(total)
    }

    fn describe(&self) -> String {
        self.argv().join(" ")
    }
}

async fn log_stderr(program: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("[{}] {}", program, line);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;
    use tvrelay::{RelayConfig, StreamKey, StreamRelay};

    fn sh(script: &str) -> CommandStreamer {
        CommandStreamer::new(vec!["sh".into(), "-c".into(), script.into()]).unwrap()
    }

    #[test]
    fn test_template_substitution() {
        let template: Vec<String> = vec!["ffmpeg".into(), "-i".into(), "{url}".into()];
        let streamer = CommandStreamer::from_template(&template, "http://up/a").unwrap();
        assert_eq!(streamer.argv(), ["ffmpeg", "-i", "http://up/a"]);
        assert!(CommandStreamer::new(vec![]).is_none());
    }

    #[tokio::test]
    async fn test_relays_stdout() {
        let relay = StreamRelay::new(StreamKey::new("cmd"), RelayConfig::default());
        let mut writer = relay.writer();

        let n = sh("printf hello").pull(CancellationToken::new(), &mut writer).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(relay.bytes_written(), 5);
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails() {
        let relay = StreamRelay::new(StreamKey::new("cmd"), RelayConfig::default());
        let mut writer = relay.writer();

        let result = sh("echo oops >&2; exit 3").pull(CancellationToken::new(), &mut writer).await;
        assert!(matches!(result, Err(PullError::Upstream(_))));
    }

    #[tokio::test]
    async fn test_cancel_kills_child() {
        let relay = StreamRelay::new(StreamKey::new("cmd"), RelayConfig::default());
        let mut writer = relay.writer();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            sh("sleep 30").pull(cancel, &mut writer),
        )
        .await
        .expect("cancel must stop the command");
        assert!(matches!(result, Err(PullError::Canceled)));
    }

    #[tokio::test]
    async fn test_cancel_after_stdout_closed() {
        let relay = StreamRelay::new(StreamKey::new("cmd"), RelayConfig::default());
        let mut writer = relay.writer();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(3),
            sh("printf hi; exec >&-; sleep 20").pull(cancel, &mut writer),
        )
        .await
        .expect("cancel must stop a command whose stdout is closed");
        assert!(matches!(result, Err(PullError::Canceled)));
        assert_eq!(relay.bytes_written(), 2);
    }

    #[tokio::test]
    async fn test_missing_program() {
        let relay = StreamRelay::new(StreamKey::new("cmd"), RelayConfig::default());
        let mut writer = relay.writer();
        let streamer = CommandStreamer::new(vec!["/nonexistent/tvrelay-test".into()]).unwrap();

        let result = streamer.pull(CancellationToken::new(), &mut writer).await;
        assert!(matches!(result, Err(PullError::Spawn(_))));
    }
}
