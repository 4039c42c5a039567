use chrono::{DateTime, Utc};
use ferry_core::InjectId;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueEventKind {
    Enqueue,
    Dequeue,
    Start,
    Complete,
    Error,
    Cancel,
    /// A message went straight into the running turn.
    V2Inject,
}

impl QueueEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enqueue => "enqueue",
            Self::Dequeue => "dequeue",
            Self::Start => "start",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Cancel => "cancel",
            Self::V2Inject => "v2-inject",
        }
    }
}

impl fmt::Display for QueueEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle event of one injection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEvent {
    pub kind: QueueEventKind,
    pub session_key: String,
    pub inject_id: InjectId,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl QueueEvent {
    pub fn new(kind: QueueEventKind, session_key: &str, inject_id: InjectId) -> Self {
        Self {
            kind,
            session_key: session_key.to_owned(),
            inject_id,
            timestamp: Utc::now(),
            detail: None,
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_serialize_kebab_case() {
        let event = QueueEvent::new(QueueEventKind::V2Inject, "support", InjectId::nil());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "v2-inject");
        assert_eq!(json["session_key"], "support");
        assert!(json.get("detail").is_none());
        assert_eq!(QueueEventKind::V2Inject.to_string(), "v2-inject");
    }
}
