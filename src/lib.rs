//! # vtp-broker - VOEvent Transport Protocol broker
//!
//! A broker for astronomical transient alerts (VOEvents) speaking the
//! VOEvent Transport Protocol (VTP). It:
//!
//! * **receives** events submitted by authors, validates them and answers
//!   each with an `ack` or a `nak`
//! * **broadcasts** accepted events to connected subscribers, honouring any
//!   XPath filters they send
//! * **subscribes** to upstream brokers, reconnecting with backoff
//! * **deduplicates** everything against a persistent, sharded event store
//!
//! ## Quick Start
//!
//! ```rust
//! use vtp_broker::{classify, Inbound, TransportMessage, TransportRole};
//!
//! let ack = TransportMessage::ack("ivo://example.org/broker", "ivo://example.org/stream#1");
//! let bytes = ack.to_bytes()?;
//!
//! match classify(bytes)? {
//!     Inbound::Transport(msg) => assert_eq!(msg.role, TransportRole::Ack),
//!     other => panic!("unexpected {other:?}"),
//! }
//! # Ok::<(), vtp_broker::VtpError>(())
//! ```
//!
//! ## Wire Format
//!
//! - LEN (4B BE): payload length, at most 99 999 bytes by default
//! - PAYLOAD: one UTF-8 XML document
//!
//! The payload is either a VOEvent or a Transport message in the
//! `http://www.telescope-networks.org/xml/Transport/v1.1` namespace.
//!
//! ## Message Types
//!
//! | Role           | Direction              | Description                     |
//! |----------------|------------------------|---------------------------------|
//! | `iamalive`     | Both                   | Liveness check and its echo     |
//! | `ack`          | Event recipient → Peer | Event accepted                  |
//! | `nak`          | Receiver → Author      | Event refused, with a reason    |
//! | `authenticate` | Both                   | Handshake; carries filters back |
//!
//! ## Services
//!
//! - **Receiver**: one event (or tar archive of events) per connection
//! - **Broadcaster**: long-lived sessions with `iamalive` every 60 s
//! - **Subscriber**: long-lived client, 120 s silence timeout

pub mod archive;
pub mod backoff;
pub mod broker;
pub mod codec;
pub mod config;
pub mod document;
pub mod event_db;
pub mod filter;
pub mod frame;
pub mod handler;
pub mod ivoid;
pub mod messages;
pub mod pipeline;
pub mod tcp;
pub mod types;
pub mod validator;
pub mod voevent;
pub mod whitelist;

// Re-export main types for convenience
pub use types::{
    EventRole, FilterError, HandlerError, ParseError, SessionId, SessionRole, StoreError,
    ValidationError, VtpError, DEFAULT_MAX_FRAME_LEN, TRANSPORT_NS, VOEVENT_NS,
};

pub use backoff::{BackoffConfig, ReconnectPolicy};
pub use broker::{Broker, RunningBroker};
pub use codec::VtpFrameCodec;
pub use config::BrokerConfig;
pub use document::{Event, XmlDocument};
pub use event_db::EventDb;
pub use filter::{FilterCompiler, Predicate, XPathCompiler};
pub use frame::{encode_frame, try_decode_frame};
pub use messages::{classify, Inbound, TransportMessage, TransportRole};
pub use pipeline::{Handler, HandlerChain, Validator, ValidatorChain, WorkerPool};
pub use tcp::sender::{SendReport, Sender};
pub use whitelist::Whitelist;
