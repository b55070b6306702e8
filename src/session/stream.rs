//! The guarded byte stream handed to the HTTP layer.
//!
//! Ownership is the teardown guard: the stream's `Drop` fires whether the
//! transcoder exited on its own (stream reached EOF and axum finished the
//! body) or the client disconnected (axum dropped the body mid-stream),
//! so there is exactly one teardown path no matter which trigger wins.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::Stream;
use log::{debug, info, warn};
use tokio::process::{Child, ChildStdout};
use tokio_util::io::ReaderStream;

use crate::session::manager::StreamSession;
use crate::tuner::TunerLease;

/// How long an interrupted transcoder gets to flush before being killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Live session bytes, with teardown tied to the stream's lifetime.
pub struct SessionStream {
    inner: ReaderStream<ChildStdout>,
    _guard: SessionGuard,
}

impl SessionStream {
    pub(crate) fn new(session: StreamSession, lease: TunerLease) -> Self {
        let StreamSession {
            id,
            channel_id,
            child,
            stdout,
            started_at,
            ..
        } = session;

        Self {
            inner: ReaderStream::new(stdout),
            _guard: SessionGuard {
                id,
                channel_id,
                started_at,
                child: Some(child),
                lease: Some(lease),
            },
        }
    }
}

impl Stream for SessionStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

struct SessionGuard {
    id: u64,
    channel_id: String,
    started_at: Instant,
    child: Option<Child>,
    lease: Option<TunerLease>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            // Interrupt rather than kill so the muxer can flush its tail.
            interrupt(&child);

            let id = self.id;
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                            Ok(Ok(status)) => {
                                debug!("[Session {}] Transcoder exited: {}", id, status)
                            }
                            Ok(Err(e)) => {
                                warn!("[Session {}] Transcoder wait failed: {}", id, e)
                            }
                            Err(_) => {
                                warn!(
                                    "[Session {}] Transcoder ignored interrupt; killing",
                                    id
                                );
                                let _ = child.kill().await;
                            }
                        }
                    });
                }
                Err(_) => {
                    // No runtime to reap on; force-stop synchronously.
                    let _ = child.start_kill();
                }
            }
        }

        if let Some(lease) = self.lease.take() {
            lease.release();
        }

        info!(
            "[Session {}] Channel {} ended after {:?}",
            self.id,
            self.channel_id,
            self.started_at.elapsed()
        );
    }
}

#[cfg(unix)]
fn interrupt(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
            warn!("Could not interrupt transcoder pid {}: {}", pid, e);
        }
    }
}

#[cfg(not(unix))]
fn interrupt(_child: &Child) {}
