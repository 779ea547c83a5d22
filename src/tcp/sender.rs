//! One-shot outbound submission to a receiver.

use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::Transport;
use crate::archive;
use crate::codec::VtpFrameCodec;
use crate::document::Event;
use crate::messages::{classify, Inbound, TransportRole};
use crate::types::{VtpError, DEFAULT_MAX_FRAME_LEN};

/// What the receiver made of a submission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendReport {
    pub expected: usize,
    pub acked: usize,
    pub naked: usize,
}

impl SendReport {
    /// Every event sent was acknowledged.
    pub fn is_success(&self) -> bool {
        self.acked == self.expected
    }

    fn complete(&self) -> bool {
        self.acked + self.naked >= self.expected
    }
}

#[derive(Debug, Clone)]
pub struct Sender {
    /// Give up waiting for replies after this long.
    pub reply_timeout: Option<Duration>,
    pub max_frame_len: usize,
}

impl Default for Sender {
    fn default() -> Self {
        Self {
            reply_timeout: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl Sender {
    pub fn new(reply_timeout: Option<Duration>) -> Self {
        Self {
            reply_timeout,
            ..Self::default()
        }
    }

    /// Send a single event and wait for its `ack` or `nak`.
    pub async fn send_event<T: Transport>(&self, io: T, event: &Event) -> Result<SendReport, VtpError> {
        info!(ivorn = event.ivorn(), "sending event");
        self.submit(io, event.raw_bytes().clone(), 1).await
    }

    /// Send a tar archive of events; the receiver answers each member.
    pub async fn send_archive<T: Transport>(&self, io: T, payload: Bytes) -> Result<SendReport, VtpError> {
        let expected = archive::unpack(&payload)?.len();
        info!(members = expected, "sending event archive");
        self.submit(io, payload, expected).await
    }

    async fn submit<T: Transport>(&self, io: T, payload: Bytes, expected: usize) -> Result<SendReport, VtpError> {
        let mut conn = Framed::new(io, VtpFrameCodec::new(self.max_frame_len));
        conn.send(payload).await?;

        let mut report = SendReport {
            expected,
            ..SendReport::default()
        };
        let collect = async {
            while !report.complete() {
                let frame = match conn.next().await {
                    Some(frame) => frame?,
                    None => {
                        debug!("receiver closed the connection");
                        break;
                    }
                };
                match classify(frame) {
                    Ok(Inbound::Transport(msg)) if msg.role == TransportRole::Ack => {
                        info!(ivorn = %msg.origin, "ACK received: receiver accepted event");
                        report.acked += 1;
                    }
                    Ok(Inbound::Transport(msg)) if msg.role == TransportRole::Nak => {
                        let reason = msg.result.as_deref().unwrap_or("no reason given");
                        warn!(ivorn = %msg.origin, "NAK received: receiver refused event ({reason})");
                        report.naked += 1;
                    }
                    Ok(other) => debug!(?other, "ignoring unexpected message"),
                    Err(e) => warn!(error = %e, "unparsable reply"),
                }
            }
            Ok::<(), VtpError>(())
        };

        match self.reply_timeout {
            Some(limit) => match tokio::time::timeout(limit, collect).await {
                Ok(result) => result?,
                Err(_) => warn!(timeout = ?limit, "gave up waiting for replies"),
            },
            None => collect.await?,
        }

        let _ = conn.close().await;
        Ok(report)
    }
}
