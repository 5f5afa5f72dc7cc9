use std::{path::PathBuf, process::ExitStatus, time::Duration};

use thiserror::Error;

/// Errors surfaced while driving the agent CLI.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent binary `{binary}` could not be spawned: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("working directory does not exist: {path}")]
    WorkingDirectory { path: PathBuf },
    #[error("connection to agent CLI failed: {0}")]
    Connection(String),
    #[error("agent process exited with {status}: {stderr}")]
    ProcessExit { status: ExitStatus, stderr: String },
    #[error("failed to decode stream line as JSON: {source}")]
    JsonDecode {
        line: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("control request failed: {0}")]
    ControlProtocol(String),
    #[error("control request `{subtype}` timed out after {timeout:?}")]
    ControlTimeout { subtype: String, timeout: Duration },
    #[error("API error ({kind}): {message}")]
    Api { kind: ApiErrorKind, message: String },
    #[error("callback failed: {0}")]
    Callback(String),
    #[error("invalid options: {0}")]
    InvalidOptions(String),
    #[error("not connected: {0}")]
    NotConnected(&'static str),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AgentError {
    /// Message used when draining pending control waiters after a fatal
    /// reader error; the original error stays on the conversation channel.
    pub(crate) fn fan_out(&self) -> AgentError {
        AgentError::Connection(self.to_string())
    }
}

/// Error kinds the agent annotates on assistant messages.
///
/// Messages carrying one of these are raised as [`AgentError::Api`] instead
/// of being yielded on the conversation channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    AuthenticationFailed,
    BillingError,
    RateLimit,
    InvalidRequest,
    ServerError,
    Unknown,
}

impl ApiErrorKind {
    pub fn from_wire(kind: &str) -> Self {
        match kind {
            "authentication_failed" => Self::AuthenticationFailed,
            "billing_error" => Self::BillingError,
            "rate_limit" => Self::RateLimit,
            "invalid_request" => Self::InvalidRequest,
            "server_error" => Self::ServerError,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed => "authentication_failed",
            Self::BillingError => "billing_error",
            Self::RateLimit => "rate_limit",
            Self::InvalidRequest => "invalid_request",
            Self::ServerError => "server_error",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ApiErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_kind_round_trips_known_values() {
        for kind in [
            "authentication_failed",
            "billing_error",
            "rate_limit",
            "invalid_request",
            "server_error",
        ] {
            assert_eq!(ApiErrorKind::from_wire(kind).as_str(), kind);
        }
        assert_eq!(ApiErrorKind::from_wire("overloaded"), ApiErrorKind::Unknown);
    }

    #[test]
    fn fan_out_keeps_the_original_message() {
        let err = AgentError::Connection("stdout closed".into());
        match err.fan_out() {
            AgentError::Connection(message) => assert!(message.contains("stdout closed")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
