//! Unix-socket event transport.
//!
//! Frames are encoded with the 16-byte wire codec and written to a
//! stream socket owned by the guest event backend.  The connection is
//! opened lazily and re-opened after failures; while the peer is away
//! frames are dropped, and the first frame after a gap is preceded by a
//! `SYN_DROPPED` marker so the receiver can resynchronize.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tracing::{debug, warn};

use input_core::codes::{EV_SYN, SYN_DROPPED};
use input_core::{encode_frame, InputEvent, WireFrame};

use crate::application::engine::OutputTransport;

/// Default backend socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/guest-input/events.sock";

pub struct UnixSocketTransport {
    path: PathBuf,
    stream: Option<UnixStream>,
    /// Set after a dropped frame; cleared once the marker is delivered.
    gap_pending: bool,
}

impl UnixSocketTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            stream: None,
            gap_pending: false,
        }
    }

    async fn stream(&mut self) -> Option<&mut UnixStream> {
        if self.stream.is_none() {
            match UnixStream::connect(&self.path).await {
                Ok(stream) => {
                    debug!(path = %self.path.display(), "event backend connected");
                    self.stream = Some(stream);
                }
                Err(e) => {
                    debug!(path = %self.path.display(), error = %e, "event backend unreachable");
                    return None;
                }
            }
        }
        self.stream.as_mut()
    }

    async fn write_frame(&mut self, frame: &WireFrame) -> bool {
        let Some(stream) = self.stream().await else {
            return false;
        };
        match stream.write_all(&encode_frame(frame)).await {
            Ok(()) => true,
            Err(e) => {
                warn!(domid = frame.domid, error = %e, "event write failed, dropping connection");
                self.stream = None;
                false
            }
        }
    }
}

#[async_trait]
impl OutputTransport for UnixSocketTransport {
    async fn deliver(&mut self, frame: WireFrame) {
        if self.gap_pending {
            let marker = WireFrame {
                event: InputEvent::new(EV_SYN, SYN_DROPPED, 0),
                ..frame
            };
            if !self.write_frame(&marker).await {
                return;
            }
            self.gap_pending = false;
        }

        if !self.write_frame(&frame).await {
            warn!(domid = frame.domid, "frame dropped");
            self.gap_pending = true;
        }
    }
}
