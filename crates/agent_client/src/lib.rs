#![forbid(unsafe_code)]
//! Async client SDK for a conversational agent CLI driven over stdio.
//!
//! The CLI runs as a supervised child process speaking newline-delimited
//! JSON on its standard streams. Three traffic classes share that one pipe
//! pair: conversation messages streamed to the consumer, control requests
//! from the CLI answered by locally registered callbacks (permission gates,
//! lifecycle hooks, in-process tool servers speaking nested JSON-RPC), and
//! control requests from the SDK correlated to their responses by id.
//!
//! Two entry points sit on top of the engine: [`query`] for one-shot
//! streaming conversations and [`AgentClient`] for long-lived interactive
//! sessions with interrupts and mid-conversation control.
//!
//! ```rust,no_run
//! use agent_client::{query, AgentOptions, CliCommand};
//! use futures::StreamExt;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), agent_client::AgentError> {
//! let options = AgentOptions::new(
//!     CliCommand::new("agent").args(["--input-format", "stream-json"]),
//! );
//! let mut messages = query("What does this repo do?", options).await?;
//! while let Some(message) = messages.next().await {
//!     println!("{}", message?);
//! }
//! # Ok(()) }
//! ```

mod client;
mod error;
mod hooks;
mod mcp;
mod options;
mod permissions;
mod protocol;
mod query;
mod transport;

pub use client::{query, query_with_transport, AgentClient, Prompt, QueryStream};
pub use error::{AgentError, ApiErrorKind};
pub use hooks::{normalize_hook_output, HookCallback, HookContext, HookEvent, HookMatcher};
pub use mcp::{SdkMcpServer, SdkMcpTool, ToolHandler, MCP_PROTOCOL_VERSION};
pub use options::{AgentOptions, ENTRYPOINT_ENV, STREAM_CLOSE_TIMEOUT_ENV};
pub use permissions::{
    CanUseTool, PermissionBehavior, PermissionMode, PermissionResult, PermissionRuleValue,
    PermissionUpdate, PermissionUpdateDestination, ToolPermissionContext,
};
pub use protocol::{user_message_frame, ServerInfo};
pub use query::Query;
pub use transport::{CliCommand, SubprocessTransport, Transport};
