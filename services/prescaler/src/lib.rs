//! Prescaler library.
//!
//! Ships the `prescaler` binary; the library surface exists so the engine,
//! watcher and scheduler can be driven from integration tests against the
//! in-memory repository and mock gateways.

pub mod config;
pub mod db;
pub mod engine;
pub mod gateway;
pub mod model;
pub mod scheduler;
pub mod shutdown;
pub mod watcher;
