//! JSON-lines protocol of `ferry serve`: one object per line in each direction.

use ferry_core::{InjectId, InjectMessage, InjectionSource, SourceType};
use ferry_policy::ForwardRequest;
use ferry_queue::{QueueEvent, QueueStats};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::app::source_from_args;
use crate::injection::InjectOutcome;

/// A client line: an optional correlation id plus the command.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub(crate) struct ClientRequest {
    #[serde(default)]
    pub request: Option<String>,
    #[serde(flatten)]
    pub message: ClientMessage,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ClientMessage {
    Inject {
        session: String,
        message: InjectMessage,
        #[serde(default)]
        source: Option<SourceSpec>,
        #[serde(default)]
        priority: i32,
        #[serde(default = "default_true")]
        allow_live: bool,
        /// Send response lines as `chunk` messages while the turn runs.
        #[serde(default)]
        stream: bool,
    },
    Cancel {
        session: String,
        #[serde(default)]
        scope: CancelScope,
        /// Cancel one injection instead of a scope.
        #[serde(default)]
        inject_id: Option<InjectId>,
    },
    CancelEverything,
    Stats {
        #[serde(default)]
        session: Option<String>,
    },
    PendingForwards,
    ApproveForward {
        id: Uuid,
    },
    RejectForward {
        id: Uuid,
        #[serde(default)]
        reason: Option<String>,
    },
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum CancelScope {
    #[default]
    Active,
    Queued,
    All,
}

/// Who the client injects as. Defaults to the local CLI.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub(crate) struct SourceSpec {
    #[serde(rename = "type")]
    pub source_type: SourceType,
    #[serde(default)]
    pub identity: Option<String>,
}

impl SourceSpec {
    pub(crate) fn into_source(self) -> InjectionSource {
        source_from_args(self.source_type, self.identity.as_deref())
    }
}

/// A server line, echoing the request id it answers when there is one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct ServerResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,
    #[serde(flatten)]
    pub message: ServerMessage,
}

impl ServerResponse {
    pub(crate) fn reply(request: Option<String>, message: ServerMessage) -> Self {
        Self { request, message }
    }

    pub(crate) fn unsolicited(message: ServerMessage) -> Self {
        Self {
            request: None,
            message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ServerMessage {
    Outcome { outcome: InjectOutcome },
    Chunk { session: String, text: String },
    Cancelled { count: usize },
    Stats { sessions: Vec<QueueStats> },
    Forwards { pending: Vec<ForwardRequest> },
    Forward { forward: ForwardRequest },
    Event { event: QueueEvent },
    /// Forward requests that passed their TTL without a decision.
    Expired { ids: Vec<Uuid> },
    Error { message: String },
}

impl ServerMessage {
    pub(crate) fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::TrustLevel;

    #[test]
    fn inject_request_defaults() {
        let parsed: ClientRequest =
            serde_json::from_str(r#"{"type":"inject","session":"main","message":"hi"}"#).unwrap();
        assert_eq!(parsed.request, None);
        assert_eq!(
            parsed.message,
            ClientMessage::Inject {
                session: "main".into(),
                message: "hi".into(),
                source: None,
                priority: 0,
                allow_live: true,
                stream: false,
            }
        );
    }

    #[test]
    fn source_spec_maps_identity() {
        let parsed: ClientRequest = serde_json::from_str(
            r#"{"request":"r1","type":"inject","session":"support","message":"hi","source":{"type":"p2p-discovery","identity":"k1"}}"#,
        )
        .unwrap();
        assert_eq!(parsed.request.as_deref(), Some("r1"));
        let ClientMessage::Inject { source, .. } = parsed.message else {
            panic!("expected inject");
        };
        let source = source.unwrap().into_source();
        assert_eq!(source.source_type, SourceType::P2pDiscovery);
        assert_eq!(source.trust_level, TrustLevel::Untrusted);
        assert_eq!(source.label(), "p2p-discovery:k1");
    }

    #[test]
    fn cancel_scope_defaults_to_active() {
        let parsed: ClientRequest =
            serde_json::from_str(r#"{"type":"cancel","session":"main"}"#).unwrap();
        assert_eq!(
            parsed.message,
            ClientMessage::Cancel {
                session: "main".into(),
                scope: CancelScope::Active,
                inject_id: None,
            }
        );

        let parsed: ClientRequest =
            serde_json::from_str(r#"{"type":"cancel","session":"main","scope":"all"}"#).unwrap();
        assert!(matches!(
            parsed.message,
            ClientMessage::Cancel {
                scope: CancelScope::All,
                ..
            }
        ));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let parsed = serde_json::from_str::<ClientRequest>(r#"{"type":"reboot"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn response_carries_request_id() {
        let json = serde_json::to_value(ServerResponse::reply(
            Some("r7".into()),
            ServerMessage::Cancelled { count: 2 },
        ))
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"request": "r7", "type": "cancelled", "count": 2})
        );

        let json = serde_json::to_value(ServerResponse::unsolicited(ServerMessage::error("bad"))).unwrap();
        assert_eq!(json, serde_json::json!({"type": "error", "message": "bad"}));
    }
}
