//! Lifecycle hooks invoked by the agent CLI through the control protocol.
//!
//! Callbacks are registered per event with optional tool-name matchers. The
//! engine assigns each callback a stable identifier during `initialize` and
//! the CLI addresses callbacks by that identifier only; the callables never
//! cross the wire.

use std::{sync::Arc, time::Duration};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::AgentError;

/// Events the agent CLI can attach hooks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookEvent {
    PreToolUse,
    PostToolUse,
    PostToolUseFailure,
    UserPromptSubmit,
    Stop,
    SubagentStop,
    PreCompact,
    Notification,
    SubagentStart,
    PermissionRequest,
    SessionStart,
    SessionEnd,
    Setup,
    TeammateIdle,
    TaskCompleted,
    ConfigChange,
}

impl HookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreToolUse => "PreToolUse",
            Self::PostToolUse => "PostToolUse",
            Self::PostToolUseFailure => "PostToolUseFailure",
            Self::UserPromptSubmit => "UserPromptSubmit",
            Self::Stop => "Stop",
            Self::SubagentStop => "SubagentStop",
            Self::PreCompact => "PreCompact",
            Self::Notification => "Notification",
            Self::SubagentStart => "SubagentStart",
            Self::PermissionRequest => "PermissionRequest",
            Self::SessionStart => "SessionStart",
            Self::SessionEnd => "SessionEnd",
            Self::Setup => "Setup",
            Self::TeammateIdle => "TeammateIdle",
            Self::TaskCompleted => "TaskCompleted",
            Self::ConfigChange => "ConfigChange",
        }
    }
}

/// Context handed to a hook callback alongside the event input.
///
/// Reserved for abort-signal support; carries nothing today.
#[derive(Debug, Clone, Copy, Default)]
#[non_exhaustive]
pub struct HookContext {}

/// Async hook callback: `(input, tool_use_id, context) -> output`.
///
/// The returned map is sent to the CLI as the hook's response payload after
/// key normalization (see [`normalize_hook_output`]). Errors become an error
/// control response for the originating request.
pub type HookCallback = Arc<
    dyn Fn(Value, Option<String>, HookContext) -> BoxFuture<'static, Result<Value, AgentError>>
        + Send
        + Sync,
>;

/// One matcher record: an optional tool-name filter, the callbacks to run,
/// and an optional per-matcher timeout forwarded to the CLI.
#[derive(Clone, Default)]
pub struct HookMatcher {
    pub matcher: Option<String>,
    pub hooks: Vec<HookCallback>,
    pub timeout: Option<Duration>,
}

impl HookMatcher {
    pub fn new(matcher: impl Into<Option<String>>) -> Self {
        Self {
            matcher: matcher.into(),
            hooks: Vec::new(),
            timeout: None,
        }
    }

    /// Matches every tool.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn hook<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(Value, Option<String>, HookContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, AgentError>> + Send + 'static,
    {
        self.hooks.push(Arc::new(move |input, tool_use_id, context| {
            Box::pin(callback(input, tool_use_id, context))
        }));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl std::fmt::Debug for HookMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookMatcher")
            .field("matcher", &self.matcher)
            .field("hooks", &format!("{} callbacks", self.hooks.len()))
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Strips trailing underscores from top-level output keys.
///
/// Hook output fields named after language keywords (`async`, `continue`)
/// are commonly written with a trailing underscore on the host side; the
/// wire names never carry it.
pub fn normalize_hook_output(output: Value) -> Value {
    match output {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (key.trim_end_matches('_').to_string(), value))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_serialize_to_wire_names() {
        assert_eq!(
            serde_json::to_value(HookEvent::PreToolUse).unwrap(),
            json!("PreToolUse")
        );
        assert_eq!(
            serde_json::to_value(HookEvent::PostToolUseFailure).unwrap(),
            json!("PostToolUseFailure")
        );
        let event: HookEvent = serde_json::from_value(json!("SessionEnd")).unwrap();
        assert_eq!(event, HookEvent::SessionEnd);
    }

    #[test]
    fn normalization_strips_trailing_underscores() {
        let output = normalize_hook_output(json!({
            "async_": true,
            "continue_": false,
            "stopReason": "done",
        }));
        assert_eq!(
            output,
            json!({"async": true, "continue": false, "stopReason": "done"})
        );
    }

    #[test]
    fn normalization_leaves_non_objects_alone() {
        assert_eq!(normalize_hook_output(json!(null)), json!(null));
    }

    #[tokio::test]
    async fn matcher_builder_registers_callbacks() {
        let matcher = HookMatcher::new(Some("Bash".to_string()))
            .hook(|input, _, _| async move { Ok(json!({"seen": input})) })
            .timeout(Duration::from_secs(5));
        assert_eq!(matcher.hooks.len(), 1);
        assert_eq!(matcher.matcher.as_deref(), Some("Bash"));

        let output = (matcher.hooks[0])(json!({"prompt": "hi"}), None, HookContext::default())
            .await
            .unwrap();
        assert_eq!(output, json!({"seen": {"prompt": "hi"}}));
    }
}
