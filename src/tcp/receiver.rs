//! One-shot inbound submissions from event authors.
//!
//! The author connects, sends one event and gets an `ack` or `nak` back;
//! the broker then closes the connection. Nothing is sent back for a
//! document that is not an event.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio_util::codec::Framed;
use tracing::{info, warn};

use super::Transport;
use crate::archive;
use crate::codec::VtpFrameCodec;
use crate::document::Event;
use crate::messages::{classify, Inbound, TransportMessage};
use crate::pipeline::{HandlerChain, ValidatorChain};
use crate::types::{VtpError, DEFAULT_MAX_FRAME_LEN};

/// Default time an author has to deliver its event.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub local_ivo: String,
    /// Whole-connection deadline. Never extended.
    pub timeout: Duration,
    /// Expect a tar archive of events rather than a single event.
    pub archive: bool,
    pub max_frame_len: usize,
}

impl ReceiverConfig {
    pub fn new(local_ivo: impl Into<String>) -> Self {
        Self {
            local_ivo: local_ivo.into(),
            timeout: DEFAULT_RECEIVE_TIMEOUT,
            archive: false,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// Receiver protocol handler, shared by every inbound connection.
#[derive(Clone)]
pub struct Receiver {
    config: Arc<ReceiverConfig>,
    validators: ValidatorChain,
    handlers: HandlerChain,
}

type Conn<T> = Framed<T, VtpFrameCodec>;

impl Receiver {
    pub fn new(config: ReceiverConfig, validators: ValidatorChain, handlers: HandlerChain) -> Self {
        Self {
            config: Arc::new(config),
            validators,
            handlers,
        }
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    /// Handle one connection from start to close.
    pub async fn serve<T: Transport>(&self, io: T) -> Result<(), VtpError> {
        let mut conn = Framed::new(io, VtpFrameCodec::new(self.config.max_frame_len));
        let limit = self.config.timeout;
        let result = match tokio::time::timeout(limit, self.exchange(&mut conn)).await {
            Ok(result) => result,
            Err(_) => {
                info!(timeout = ?limit, "timed out");
                Err(VtpError::Timeout(limit))
            }
        };
        let _ = conn.close().await;
        result
    }

    async fn exchange<T: Transport>(&self, conn: &mut Conn<T>) -> Result<(), VtpError> {
        let payload = match conn.next().await {
            Some(frame) => frame?,
            None => return Err(VtpError::ConnectionClosed),
        };

        if !self.config.archive {
            return self.process(conn, payload).await;
        }

        let members = match archive::unpack(&payload) {
            Ok(members) => members,
            Err(e) => {
                warn!(error = %e, "unreadable event archive");
                return Ok(());
            }
        };
        info!(members = members.len(), "event archive received");
        for member in members {
            self.process(conn, member).await?;
        }
        Ok(())
    }

    async fn process<T: Transport>(&self, conn: &mut Conn<T>, payload: Bytes) -> Result<(), VtpError> {
        match classify(payload) {
            Ok(Inbound::Event(event)) => {
                info!(ivorn = event.ivorn(), role = %event.role(), "event received");
                self.judge(conn, event).await
            }
            Ok(Inbound::Transport(msg)) => {
                warn!(role = %msg.role, "incomprehensible data received");
                Ok(())
            }
            Ok(Inbound::Incomprehensible(role)) => {
                warn!(role = ?role, "incomprehensible data received");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "unparsable message received");
                Ok(())
            }
        }
    }

    async fn judge<T: Transport>(&self, conn: &mut Conn<T>, event: Event) -> Result<(), VtpError> {
        let local = &self.config.local_ivo;
        match self.validators.validate(&event).await {
            Ok(()) => {
                info!(ivorn = event.ivorn(), "event accepted");
                conn.send(TransportMessage::ack(local, event.ivorn()).to_bytes()?)
                    .await?;
                self.handlers.dispatch(event);
            }
            Err(reason) => {
                info!(ivorn = event.ivorn(), %reason, "event rejected");
                let result = format!("Event rejected: {reason}");
                conn.send(TransportMessage::nak(local, event.ivorn(), Some(&result)).to_bytes()?)
                    .await?;
            }
        }
        Ok(())
    }
}
