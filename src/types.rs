//! Core types shared across the broker: roles, protocol constants and the
//! error taxonomy.

use std::fmt;
use std::io;

use thiserror::Error;

/// Namespace of VTP transport messages.
pub const TRANSPORT_NS: &str = "http://www.telescope-networks.org/xml/Transport/v1.1";

/// Namespace of VOEvent 2.0 documents.
pub const VOEVENT_NS: &str = "http://www.ivoa.net/xml/VOEvent/v2.0";

/// Namespace used for `xsi:schemaLocation`.
pub const XSI_NS: &str = "http://www.w3.org/2001/XMLSchema-instance";

/// Largest frame accepted by default.
///
/// A peer which sends its length prefix in little-endian order will
/// typically trip this limit.
pub const DEFAULT_MAX_FRAME_LEN: usize = 99_999;

/// Length of the big-endian size prefix in front of every payload.
pub const FRAME_HEADER_LEN: usize = 4;

/// Identifier handed to each accepted connection.
pub type SessionId = u64;

/// Role attribute carried by a VOEvent document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventRole {
    Observation,
    Prediction,
    Utility,
    Test,
}

impl EventRole {
    pub const ALL: [EventRole; 4] = [
        EventRole::Observation,
        EventRole::Prediction,
        EventRole::Utility,
        EventRole::Test,
    ];

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "observation" => Some(EventRole::Observation),
            "prediction" => Some(EventRole::Prediction),
            "utility" => Some(EventRole::Utility),
            "test" => Some(EventRole::Test),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventRole::Observation => "observation",
            EventRole::Prediction => "prediction",
            EventRole::Utility => "utility",
            EventRole::Test => "test",
        }
    }
}

impl fmt::Display for EventRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which end of the protocol a connection task is playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Receiver,
    Broadcaster,
    Subscriber,
    Sender,
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionRole::Receiver => "receiver",
            SessionRole::Broadcaster => "broadcaster",
            SessionRole::Subscriber => "subscriber",
            SessionRole::Sender => "sender",
        };
        f.write_str(name)
    }
}

/// Document could not be understood as XML (or used a forbidden construct).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unparsable document: {0}")]
pub struct ParseError(pub String);

/// Failure of the event store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("event store root {path} is unusable: {reason}")]
    UnusableRoot { path: String, reason: String },
    #[error("cannot derive shard from ivorn {0:?}")]
    BadIvorn(String),
    #[error("event store I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Reason an event was rejected by a validator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

impl From<StoreError> for ValidationError {
    fn from(err: StoreError) -> Self {
        ValidationError(format!("event store failure: {err}"))
    }
}

/// Failure of a side-effect handler. Logged, never reported to the peer.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("handler I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("{command} returned non-zero ({code:?})")]
    CommandFailed { command: String, code: Option<i32> },
    #[error("{0}")]
    Other(String),
}

/// Failure compiling or evaluating a subscriber filter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("invalid filter expression {expr:?}: {reason}")]
    Syntax { expr: String, reason: String },
    #[error("filter evaluation failed: {0}")]
    Evaluation(String),
}

/// Top-level protocol error.
#[derive(Debug, Error)]
pub enum VtpError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("worker pool unavailable: {0}")]
    Worker(String),
}

impl VtpError {
    pub fn config(msg: impl Into<String>) -> Self {
        VtpError::Config(msg.into())
    }
}
