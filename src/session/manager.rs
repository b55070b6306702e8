//! Turns an admitted channel request into a supervised transcoder process.
//!
//! Both session flavors run through the same path: resolve a playable
//! source URL (directly, or via a watch request to the receiver), spawn
//! `ffmpeg` to remux it into MPEG-TS on stdout, then hand the pipe to the
//! HTTP layer as a byte stream. Teardown is owned by the stream guard
//! (see [`crate::session::stream`]) and fires exactly once.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};

use crate::device::{DeviceClient, DeviceError};
use crate::directory::{ChannelDescriptor, SourceKind};
use crate::session::stream::SessionStream;
use crate::tuner::TunerLease;

/// Session startup failures. Both surface as a one-shot error response;
/// the caller keeps responsibility for releasing the tuner lease.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The receiver could not be asked for (or did not return) a playable
    /// source URL.
    #[error("source resolution failed: {0}")]
    SourceResolution(#[from] DeviceError),

    /// The transcoder process could not be started.
    #[error("failed to spawn transcoder: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Transcoder settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Path to the ffmpeg binary.
    pub ffmpeg_path: String,
    /// ffmpeg `-loglevel` value, derived from the gateway log level.
    pub ffmpeg_log_level: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ffmpeg_log_level: "error".to_string(),
        }
    }
}

/// An active streaming session: one client, one transcoder process, one
/// tuner slot. Exclusively owned; converting it into a [`SessionStream`]
/// transfers ownership of teardown to the stream guard.
#[derive(Debug)]
pub struct StreamSession {
    pub(crate) id: u64,
    pub(crate) channel_id: String,
    pub(crate) child: Child,
    pub(crate) stdout: ChildStdout,
    pub(crate) started_at: Instant,
}

impl StreamSession {
    /// Attach the tuner lease and become the HTTP response body stream.
    pub fn into_stream(self, lease: TunerLease) -> SessionStream {
        SessionStream::new(self, lease)
    }
}

/// Factory and supervisor for streaming sessions.
pub struct SessionManager {
    config: SessionConfig,
    device: Arc<DeviceClient>,
    next_id: AtomicU64,
}

impl SessionManager {
    pub fn new(config: SessionConfig, device: Arc<DeviceClient>) -> Self {
        Self {
            config,
            device,
            next_id: AtomicU64::new(1),
        }
    }

    /// Start a session for an already-admitted request.
    ///
    /// The caller holds the tuner lease; on any error here the caller must
    /// release it (dropping the lease does).
    pub async fn start_session(
        &self,
        descriptor: &ChannelDescriptor,
    ) -> Result<StreamSession, SessionError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let source_url = match descriptor.source {
            SourceKind::DirectUrl => descriptor.locator.clone(),
            SourceKind::DeviceHosted => {
                debug!(
                    "[Session {}] Requesting watch for channel {}",
                    id, descriptor.id
                );
                self.device.watch(&descriptor.locator).await?
            }
        };
        debug!("[Session {}] Source resolved: {}", id, source_url);

        let mut child = Command::new(&self.config.ffmpeg_path)
            .args([
                "-hide_banner",
                "-loglevel",
                &self.config.ffmpeg_log_level,
                "-i",
                &source_url,
                "-c",
                "copy",
                "-f",
                "mpegts",
                "pipe:1",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(SessionError::Spawn)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::Spawn(std::io::Error::other("no stdout pipe")))?;

        // Transcoder diagnostics go to the log and are never treated as a
        // session failure by themselves.
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[Session {}] ffmpeg: {}", id, line);
                }
            });
        } else {
            warn!("[Session {}] Transcoder stderr pipe missing", id);
        }

        info!(
            "[Session {}] Streaming channel {} ({})",
            id, descriptor.id, descriptor.display_name
        );

        Ok(StreamSession {
            id,
            channel_id: descriptor.id.clone(),
            child,
            stdout,
            started_at: Instant::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceConfig;
    use crate::tuner::TunerPool;
    use futures::StreamExt;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn offline_device() -> Arc<DeviceClient> {
        Arc::new(
            DeviceClient::new(DeviceConfig {
                base_url: "http://127.0.0.1:9".into(),
                token: "unused".into(),
                request_timeout: Duration::from_millis(200),
            })
            .unwrap(),
        )
    }

    fn direct_channel(url: &str) -> ChannelDescriptor {
        ChannelDescriptor {
            id: "direct1".into(),
            display_number: "1001".into(),
            display_name: "Direct One".into(),
            source: SourceKind::DirectUrl,
            locator: url.into(),
        }
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error_not_a_panic() {
        let manager = SessionManager::new(
            SessionConfig {
                ffmpeg_path: "/nonexistent/ffmpeg-binary".into(),
                ffmpeg_log_level: "error".into(),
            },
            offline_device(),
        );

        let err = manager
            .start_session(&direct_channel("http://example/stream.m3u8"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Spawn(_)));
    }

    #[tokio::test]
    async fn unreachable_device_is_source_resolution_error() {
        let manager = SessionManager::new(SessionConfig::default(), offline_device());
        let descriptor = ChannelDescriptor {
            id: "ota1".into(),
            display_number: "5.1".into(),
            display_name: "Five One".into(),
            source: SourceKind::DeviceHosted,
            locator: "ota1".into(),
        };

        let err = manager.start_session(&descriptor).await.unwrap_err();
        assert!(matches!(err, SessionError::SourceResolution(_)));
    }

    #[tokio::test]
    async fn device_hosted_resolves_through_watch_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/guide/channels/ota1/watch"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "playlist_url": "http://device/stream/ota1.m3u8"
            })))
            .mount(&server)
            .await;

        // Spawn is expected to fail (no ffmpeg in the test environment),
        // but resolution must have happened first via the watch request.
        let manager = SessionManager::new(
            SessionConfig {
                ffmpeg_path: "/nonexistent/ffmpeg-binary".into(),
                ffmpeg_log_level: "error".into(),
            },
            Arc::new(
                DeviceClient::new(DeviceConfig {
                    base_url: server.uri(),
                    token: "t".into(),
                    request_timeout: Duration::from_secs(2),
                })
                .unwrap(),
            ),
        );

        let descriptor = ChannelDescriptor {
            id: "ota1".into(),
            display_number: "5.1".into(),
            display_name: "Five One".into(),
            source: SourceKind::DeviceHosted,
            locator: "ota1".into(),
        };
        let err = manager.start_session(&descriptor).await.unwrap_err();
        assert!(matches!(err, SessionError::Spawn(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_exit_releases_the_slot_once() {
        let pool = Arc::new(TunerPool::new(1));
        let lease = pool.try_acquire().unwrap();

        // Stand-in for a short-lived transcoder: emits bytes, then exits.
        let mut child = Command::new("sh")
            .args(["-c", "printf data"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let stdout = child.stdout.take().unwrap();
        let session = StreamSession {
            id: 7,
            channel_id: "direct1".into(),
            child,
            stdout,
            started_at: Instant::now(),
        };

        let mut stream = session.into_stream(lease);
        let mut total = 0usize;
        while let Some(chunk) = stream.next().await {
            total += chunk.unwrap().len();
        }
        assert_eq!(total, 4);

        drop(stream);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.in_use(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn client_disconnect_tears_down_a_live_process() {
        let pool = Arc::new(TunerPool::new(1));
        let lease = pool.try_acquire().unwrap();

        let mut child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let stdout = child.stdout.take().unwrap();
        let session = StreamSession {
            id: 8,
            channel_id: "direct1".into(),
            child,
            stdout,
            started_at: Instant::now(),
        };

        let stream = session.into_stream(lease);
        drop(stream); // client went away

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pool.in_use(), 0);
    }
}
