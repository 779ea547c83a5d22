//! Event validators.
//!
//! A broker typically runs [`CheckPreviouslySeen`], [`CheckSchema`] and
//! [`CheckIvoid`] on submissions from authors, and only
//! [`CheckPreviouslySeen`] on events pulled from upstream brokers.

mod ivoid;
mod previously_seen;
mod schema;
mod signature;

pub use ivoid::CheckIvoid;
pub use previously_seen::CheckPreviouslySeen;
pub use schema::{CheckSchema, SchemaValidator, VoEventStructure};
pub use signature::{CheckSignature, SignatureVerifier};
