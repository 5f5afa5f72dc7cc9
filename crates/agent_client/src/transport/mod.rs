//! Byte-stream transport to the agent CLI.
//!
//! The engine is written against the [`Transport`] trait so tests and
//! embedders can substitute their own framing; the shipped implementation
//! is [`SubprocessTransport`], which owns the CLI child process.

use async_trait::async_trait;
use serde_json::Value;

use crate::AgentError;

mod subprocess;

pub use subprocess::{CliCommand, SubprocessTransport};

/// Line-framed JSON transport.
///
/// All methods take `&self`; implementations serialize access internally so
/// the engine can read and write concurrently through one shared handle.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establishes the connection. After a successful return the transport
    /// accepts both `write` and `read_message`.
    async fn connect(&self) -> Result<(), AgentError>;

    /// Writes one JSON frame followed by a newline. Concurrent writes are
    /// totally ordered; no two frames ever interleave bytes.
    async fn write(&self, line: &str) -> Result<(), AgentError>;

    /// Half-closes the write side. Idempotent; later writes fail.
    async fn end_input(&self) -> Result<(), AgentError>;

    /// Returns the next decoded frame, `Ok(None)` at end of stream.
    /// Undecodable lines are logged and skipped, never surfaced here.
    async fn read_message(&self) -> Result<Option<Value>, AgentError>;

    /// Tears the connection down. Idempotent.
    async fn close(&self) -> Result<(), AgentError>;

    fn is_ready(&self) -> bool;
}
