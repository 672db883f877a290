//! Moyo engine: realtime conversation sync for one chat session.
//!
//! Streamed assistant replies, server snapshots, file submissions and reminder
//! notices, all driven off one realtime channel. [`engine::Engine`] wires the
//! pieces together; the CLI is a thin shell over it.

pub mod assembler;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod identity;
pub mod message;
pub mod notifications;
pub mod protocol;
pub mod store;
pub mod transport;
pub mod upload;

pub use engine::Engine;
pub use error::EngineError;
