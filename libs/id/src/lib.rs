//! # prescale-id
//!
//! Typed identifiers for the records the prescaler reads and writes.
//!
//! Every identifier is a UUID at rest (Postgres `uuid` columns) and a
//! distinct Rust type in memory, so an event id can never be bound where a
//! cluster id is expected.
//!
//! - New ids are UUIDv7, so freshly created rows sort by creation time
//! - Parsing accepts any RFC 4122 textual form (hyphenated, simple, braced)
//! - Display always emits the hyphenated lowercase form

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export uuid for consumers binding raw values to queries.
pub use uuid::Uuid;
