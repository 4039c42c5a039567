use chrono::{DateTime, Utc};
use ferry_core::{InjectMessage, InjectionSource};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Free-form metadata passed from hook to hook.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookPhase {
    PreInject,
    PostInject,
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PreInject => f.write_str("pre-inject"),
            Self::PostInject => f.write_str("post-inject"),
        }
    }
}

/// A command hook from config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookConfig {
    pub name: String,
    pub phase: HookPhase,
    /// Program and arguments. Receives the context as JSON on stdin.
    pub command: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// What a hook sees, serialised as one JSON object on the hook's stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookContext {
    pub message: InjectMessage,
    pub source: InjectionSource,
    pub target_session: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
    /// Final response text; only set for post-inject hooks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

impl HookContext {
    pub fn new(
        message: InjectMessage,
        source: InjectionSource,
        target_session: impl Into<String>,
    ) -> Self {
        Self {
            message,
            source,
            target_session: target_session.into(),
            timestamp: Utc::now(),
            metadata: Metadata::new(),
            response: None,
        }
    }
}

/// A hook's answer. Every field is optional; `{}` or empty output means allow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookResponse {
    #[serde(default = "default_enabled")]
    pub allow: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Replaces the running message for later hooks and the injection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<InjectMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl Default for HookResponse {
    fn default() -> Self {
        Self::allow()
    }
}

impl HookResponse {
    pub fn allow() -> Self {
        Self {
            allow: true,
            reason: None,
            message: None,
            metadata: None,
        }
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            allow: false,
            reason: Some(reason.into()),
            ..Self::allow()
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: InjectMessage) -> Self {
        self.message = Some(message);
        self
    }
}
