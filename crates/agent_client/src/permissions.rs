//! Tool permission gating: modes, rule updates, and the consumer callback
//! that answers the CLI's `can_use_tool` control requests.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::AgentError;

/// Permission mode the CLI runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionMode {
    #[serde(rename = "default")]
    Default,
    #[serde(rename = "acceptEdits")]
    AcceptEdits,
    #[serde(rename = "plan")]
    Plan,
    #[serde(rename = "bypassPermissions")]
    BypassPermissions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionBehavior {
    Allow,
    Deny,
    Ask,
}

/// Where a permission update is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionUpdateDestination {
    UserSettings,
    ProjectSettings,
    LocalSettings,
    Session,
}

/// A single permission rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRuleValue {
    #[serde(rename = "toolName")]
    pub tool_name: String,
    #[serde(rename = "ruleContent", skip_serializing_if = "Option::is_none")]
    pub rule_content: Option<String>,
}

/// Permission updates a callback may attach to an allow result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PermissionUpdate {
    #[serde(rename = "addRules")]
    AddRules {
        rules: Vec<PermissionRuleValue>,
        behavior: PermissionBehavior,
        #[serde(skip_serializing_if = "Option::is_none")]
        destination: Option<PermissionUpdateDestination>,
    },
    #[serde(rename = "replaceRules")]
    ReplaceRules {
        rules: Vec<PermissionRuleValue>,
        behavior: PermissionBehavior,
        #[serde(skip_serializing_if = "Option::is_none")]
        destination: Option<PermissionUpdateDestination>,
    },
    #[serde(rename = "removeRules")]
    RemoveRules {
        rules: Vec<PermissionRuleValue>,
        behavior: PermissionBehavior,
        #[serde(skip_serializing_if = "Option::is_none")]
        destination: Option<PermissionUpdateDestination>,
    },
    #[serde(rename = "setMode")]
    SetMode {
        mode: PermissionMode,
        #[serde(skip_serializing_if = "Option::is_none")]
        destination: Option<PermissionUpdateDestination>,
    },
    #[serde(rename = "addDirectories")]
    AddDirectories {
        directories: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        destination: Option<PermissionUpdateDestination>,
    },
    #[serde(rename = "removeDirectories")]
    RemoveDirectories {
        directories: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        destination: Option<PermissionUpdateDestination>,
    },
}

/// Context for a `can_use_tool` callback invocation.
#[derive(Debug, Clone, Default)]
pub struct ToolPermissionContext {
    /// Identifies the specific tool call within the assistant turn.
    pub tool_use_id: String,
    /// Permission suggestions offered by the CLI, passed through verbatim.
    pub suggestions: Vec<Value>,
    /// Path that triggered the check, when the tool touched a blocked path.
    pub blocked_path: Option<String>,
}

/// Outcome of a permission callback.
#[derive(Debug, Clone, PartialEq)]
pub enum PermissionResult {
    Allow {
        /// Replacement tool input; the original input is substituted when
        /// absent.
        updated_input: Option<Value>,
        updated_permissions: Option<Vec<PermissionUpdate>>,
    },
    Deny {
        message: String,
        interrupt: bool,
    },
}

impl PermissionResult {
    pub fn allow() -> Self {
        Self::Allow {
            updated_input: None,
            updated_permissions: None,
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self::Deny {
            message: message.into(),
            interrupt: false,
        }
    }

    /// Serializes to the wire shape, substituting `original_input` when the
    /// callback allowed without rewriting the input.
    pub(crate) fn into_wire(self, original_input: &Value) -> Result<Value, AgentError> {
        match self {
            Self::Allow {
                updated_input,
                updated_permissions,
            } => {
                let mut wire = json!({
                    "behavior": "allow",
                    "updatedInput": updated_input.unwrap_or_else(|| original_input.clone()),
                });
                if let Some(updates) = updated_permissions {
                    wire["updatedPermissions"] = serde_json::to_value(updates)?;
                }
                Ok(wire)
            }
            Self::Deny { message, interrupt } => Ok(json!({
                "behavior": "deny",
                "message": message,
                "interrupt": interrupt,
            })),
        }
    }
}

/// Async permission callback: `(tool_name, input, context) -> result`.
pub type CanUseTool = Arc<
    dyn Fn(String, Value, ToolPermissionContext) -> BoxFuture<'static, Result<PermissionResult, AgentError>>
        + Send
        + Sync,
>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_use_camel_case_wire_values() {
        assert_eq!(
            serde_json::to_value(PermissionMode::AcceptEdits).unwrap(),
            json!("acceptEdits")
        );
        assert_eq!(
            serde_json::to_value(PermissionMode::BypassPermissions).unwrap(),
            json!("bypassPermissions")
        );
    }

    #[test]
    fn updates_serialize_with_wire_keys() {
        let update = PermissionUpdate::AddRules {
            rules: vec![PermissionRuleValue {
                tool_name: "Bash".into(),
                rule_content: Some("ls *".into()),
            }],
            behavior: PermissionBehavior::Allow,
            destination: Some(PermissionUpdateDestination::Session),
        };
        assert_eq!(
            serde_json::to_value(update).unwrap(),
            json!({
                "type": "addRules",
                "rules": [{"toolName": "Bash", "ruleContent": "ls *"}],
                "behavior": "allow",
                "destination": "session",
            })
        );
    }

    #[test]
    fn allow_substitutes_original_input() {
        let original = json!({"command": "ls"});
        let wire = PermissionResult::allow().into_wire(&original).unwrap();
        assert_eq!(
            wire,
            json!({"behavior": "allow", "updatedInput": {"command": "ls"}})
        );
    }

    #[test]
    fn allow_keeps_updated_input() {
        let wire = PermissionResult::Allow {
            updated_input: Some(json!({"command": "ls -la"})),
            updated_permissions: None,
        }
        .into_wire(&json!({"command": "ls"}))
        .unwrap();
        assert_eq!(wire["updatedInput"], json!({"command": "ls -la"}));
    }

    #[test]
    fn deny_carries_message_and_interrupt() {
        let wire = PermissionResult::deny("nope").into_wire(&json!({})).unwrap();
        assert_eq!(
            wire,
            json!({"behavior": "deny", "message": "nope", "interrupt": false})
        );
    }
}
