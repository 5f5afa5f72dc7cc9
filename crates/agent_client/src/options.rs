use std::{collections::HashMap, time::Duration};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::{
    hooks::{HookEvent, HookMatcher},
    mcp::SdkMcpServer,
    permissions::CanUseTool,
    transport::CliCommand,
    AgentError,
};

/// Milliseconds to hold stdin open after input exhaustion while callbacks
/// may still be in flight; also the floor for the `initialize` timeout.
pub const STREAM_CLOSE_TIMEOUT_ENV: &str = "CLAUDE_CODE_STREAM_CLOSE_TIMEOUT";

/// Set by the façades so the CLI can attribute the session.
pub const ENTRYPOINT_ENV: &str = "CLAUDE_CODE_ENTRYPOINT";

const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_STREAM_CLOSE_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration for a conversation with the agent CLI.
///
/// Everything except the launch command is optional. Callback registrations
/// (permission gate, hooks, in-process tool servers) are announced to the
/// CLI during the `initialize` round trip.
#[derive(Clone)]
pub struct AgentOptions {
    pub cli: CliCommand,
    pub can_use_tool: Option<CanUseTool>,
    pub hooks: HashMap<HookEvent, Vec<HookMatcher>>,
    pub mcp_servers: Vec<SdkMcpServer>,
    /// Named agent definitions forwarded opaquely in `initialize`.
    pub agents: Option<Value>,
    pub permission_prompt_tool_name: Option<String>,
    pub system_prompt: Option<String>,
    pub append_system_prompt: Option<String>,
    /// JSON schema constraining structured output.
    pub json_schema: Option<Value>,
    pub control_timeout: Duration,
    /// Overrides the default of `max(60s, $CLAUDE_CODE_STREAM_CLOSE_TIMEOUT)`.
    pub initialize_timeout: Option<Duration>,
    /// Overrides `$CLAUDE_CODE_STREAM_CLOSE_TIMEOUT` for stdin-close deferral.
    pub stream_close_timeout: Option<Duration>,
    /// Receives the child's stderr lines.
    pub stderr_sink: Option<mpsc::UnboundedSender<String>>,
}

impl AgentOptions {
    pub fn new(cli: CliCommand) -> Self {
        Self {
            cli,
            can_use_tool: None,
            hooks: HashMap::new(),
            mcp_servers: Vec::new(),
            agents: None,
            permission_prompt_tool_name: None,
            system_prompt: None,
            append_system_prompt: None,
            json_schema: None,
            control_timeout: DEFAULT_CONTROL_TIMEOUT,
            initialize_timeout: None,
            stream_close_timeout: None,
            stderr_sink: None,
        }
    }

    /// Registers the permission callback answering `can_use_tool` requests.
    pub fn can_use_tool<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(String, Value, crate::permissions::ToolPermissionContext) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: std::future::Future<Output = Result<crate::permissions::PermissionResult, AgentError>>
            + Send
            + 'static,
    {
        self.can_use_tool = Some(std::sync::Arc::new(move |tool_name, input, context| {
            Box::pin(callback(tool_name, input, context))
        }));
        self
    }

    pub fn hook(mut self, event: HookEvent, matcher: HookMatcher) -> Self {
        self.hooks.entry(event).or_default().push(matcher);
        self
    }

    pub fn mcp_server(mut self, server: SdkMcpServer) -> Self {
        self.mcp_servers.push(server);
        self
    }

    pub fn agents(mut self, agents: Value) -> Self {
        self.agents = Some(agents);
        self
    }

    pub fn permission_prompt_tool_name(mut self, name: impl Into<String>) -> Self {
        self.permission_prompt_tool_name = Some(name.into());
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn append_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.append_system_prompt = Some(prompt.into());
        self
    }

    pub fn json_schema(mut self, schema: Value) -> Self {
        self.json_schema = Some(schema);
        self
    }

    pub fn control_timeout(mut self, timeout: Duration) -> Self {
        self.control_timeout = timeout;
        self
    }

    pub fn initialize_timeout(mut self, timeout: Duration) -> Self {
        self.initialize_timeout = Some(timeout);
        self
    }

    pub fn stream_close_timeout(mut self, timeout: Duration) -> Self {
        self.stream_close_timeout = Some(timeout);
        self
    }

    pub fn stderr_sink(mut self, sink: mpsc::UnboundedSender<String>) -> Self {
        self.stderr_sink = Some(sink);
        self
    }

    /// Rejects option combinations the protocol cannot honor.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.can_use_tool.is_some() && self.permission_prompt_tool_name.is_some() {
            return Err(AgentError::InvalidOptions(
                "a permission callback cannot be combined with an explicit \
                 permission_prompt_tool_name; use one or the other"
                    .into(),
            ));
        }
        Ok(())
    }

    /// Permission-prompt tool the CLI should use. A registered permission
    /// callback routes prompts through the stdio control channel.
    pub fn effective_permission_prompt_tool(&self) -> Option<&str> {
        if self.can_use_tool.is_some() {
            Some("stdio")
        } else {
            self.permission_prompt_tool_name.as_deref()
        }
    }

    /// Whether the CLI may need to call back into this process after input
    /// ends (hooks or in-process tool servers are registered).
    pub(crate) fn has_control_callbacks(&self) -> bool {
        !self.mcp_servers.is_empty() || self.hooks.values().any(|matchers| !matchers.is_empty())
    }

    pub(crate) fn resolved_stream_close_timeout(&self) -> Duration {
        self.stream_close_timeout.unwrap_or_else(env_stream_close_timeout)
    }

    /// The CLI may spend the startup window launching external tool
    /// servers, so initialization gets the larger of the default and the
    /// environment override.
    pub(crate) fn resolved_initialize_timeout(&self) -> Duration {
        self.initialize_timeout
            .unwrap_or_else(|| env_stream_close_timeout().max(DEFAULT_CONTROL_TIMEOUT))
    }
}

impl std::fmt::Debug for AgentOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentOptions")
            .field("cli", &self.cli)
            .field("can_use_tool", &self.can_use_tool.is_some())
            .field("hooks", &self.hooks.len())
            .field("mcp_servers", &self.mcp_servers.len())
            .field(
                "permission_prompt_tool_name",
                &self.permission_prompt_tool_name,
            )
            .field("control_timeout", &self.control_timeout)
            .finish()
    }
}

fn env_stream_close_timeout() -> Duration {
    std::env::var(STREAM_CLOSE_TIMEOUT_ENV)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_STREAM_CLOSE_TIMEOUT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::PermissionResult;

    fn options() -> AgentOptions {
        AgentOptions::new(CliCommand::new("agent"))
    }

    #[test]
    fn callback_and_explicit_prompt_tool_conflict() {
        let opts = options()
            .can_use_tool(|_, _, _| async { Ok(PermissionResult::allow()) })
            .permission_prompt_tool_name("mcp__approver");
        assert!(matches!(
            opts.validate(),
            Err(AgentError::InvalidOptions(_))
        ));
    }

    #[test]
    fn callback_routes_permission_prompts_through_stdio() {
        let opts = options().can_use_tool(|_, _, _| async { Ok(PermissionResult::allow()) });
        assert!(opts.validate().is_ok());
        assert_eq!(opts.effective_permission_prompt_tool(), Some("stdio"));

        let explicit = options().permission_prompt_tool_name("mcp__approver");
        assert_eq!(
            explicit.effective_permission_prompt_tool(),
            Some("mcp__approver")
        );
        assert_eq!(options().effective_permission_prompt_tool(), None);
    }

    #[test]
    fn control_callbacks_detected_from_hooks_and_servers() {
        assert!(!options().has_control_callbacks());
        assert!(options()
            .hook(
                HookEvent::PreToolUse,
                HookMatcher::all().hook(|_, _, _| async { Ok(serde_json::json!({})) }),
            )
            .has_control_callbacks());
        assert!(options()
            .mcp_server(SdkMcpServer::new("calc"))
            .has_control_callbacks());
        // An event with an empty matcher list does not count.
        let mut empty = options();
        empty.hooks.insert(HookEvent::Stop, Vec::new());
        assert!(!empty.has_control_callbacks());
    }
}
