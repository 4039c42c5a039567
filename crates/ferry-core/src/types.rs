use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Identifier of a single queued or active injection.
pub type InjectId = Uuid;

/// Trust levels, ordered from least to most privileged.
///
/// `Ord` follows privilege: `Untrusted < SemiTrusted < Trusted < Owner`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrustLevel {
    Owner,
    Trusted,
    SemiTrusted,
    Untrusted,
}

impl TrustLevel {
    pub const ALL: [Self; 4] = [
        Self::Owner,
        Self::Trusted,
        Self::SemiTrusted,
        Self::Untrusted,
    ];

    /// Numeric rank where higher = more privileged.
    fn rank(self) -> u8 {
        match self {
            Self::Owner => 3,
            Self::Trusted => 2,
            Self::SemiTrusted => 1,
            Self::Untrusted => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Trusted => "trusted",
            Self::SemiTrusted => "semi-trusted",
            Self::Untrusted => "untrusted",
        }
    }
}

impl PartialOrd for TrustLevel {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TrustLevel {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrustLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "owner" => Ok(Self::Owner),
            "trusted" => Ok(Self::Trusted),
            "semi-trusted" | "semi_trusted" | "semitrusted" => Ok(Self::SemiTrusted),
            "untrusted" => Ok(Self::Untrusted),
            other => anyhow::bail!("unknown trust level: {other}"),
        }
    }
}

/// Where an injection request originates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceType {
    Cli,
    Daemon,
    Plugin,
    Cron,
    Api,
    P2p,
    P2pDiscovery,
    Gateway,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Daemon => "daemon",
            Self::Plugin => "plugin",
            Self::Cron => "cron",
            Self::Api => "api",
            Self::P2p => "p2p",
            Self::P2pDiscovery => "p2p-discovery",
            Self::Gateway => "gateway",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cli" => Ok(Self::Cli),
            "daemon" => Ok(Self::Daemon),
            "plugin" => Ok(Self::Plugin),
            "cron" => Ok(Self::Cron),
            "api" => Ok(Self::Api),
            "p2p" => Ok(Self::P2p),
            "p2p-discovery" | "p2p_discovery" => Ok(Self::P2pDiscovery),
            "gateway" => Ok(Self::Gateway),
            other => anyhow::bail!("unknown source type: {other}"),
        }
    }
}

/// Who a source claims to be, when it is known.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "kebab-case")]
pub enum SourceIdentity {
    User(String),
    PublicKey(String),
    Plugin(String),
    CronJob(String),
    GatewaySession(String),
}

impl SourceIdentity {
    pub fn value(&self) -> &str {
        match self {
            Self::User(v)
            | Self::PublicKey(v)
            | Self::Plugin(v)
            | Self::CronJob(v)
            | Self::GatewaySession(v) => v,
        }
    }
}

/// Provenance attached to a message that reached its session through a gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Forwarded {
    pub gateway_session: String,
    pub request_id: Uuid,
    pub original: InjectionSource,
}

/// The party asking to inject a message. Lives only for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectionSource {
    #[serde(rename = "type")]
    pub source_type: SourceType,
    pub trust_level: TrustLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<SourceIdentity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarded: Option<Box<Forwarded>>,
}

impl InjectionSource {
    /// A source with the default trust level for its type.
    pub fn new(source_type: SourceType) -> Self {
        Self {
            source_type,
            trust_level: crate::trust::default_trust_for_source(source_type),
            identity: None,
            forwarded: None,
        }
    }

    #[must_use]
    pub fn with_trust(mut self, trust_level: TrustLevel) -> Self {
        self.trust_level = trust_level;
        self
    }

    #[must_use]
    pub fn with_identity(mut self, identity: SourceIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn cli(user: Option<&str>) -> Self {
        let source = Self::new(SourceType::Cli);
        match user {
            Some(user) => source.with_identity(SourceIdentity::User(user.to_owned())),
            None => source,
        }
    }

    pub fn daemon() -> Self {
        Self::new(SourceType::Daemon)
    }

    pub fn plugin(plugin_id: &str) -> Self {
        Self::new(SourceType::Plugin)
            .with_identity(SourceIdentity::Plugin(plugin_id.to_owned()))
    }

    pub fn cron(job: &str) -> Self {
        Self::new(SourceType::Cron)
            .with_identity(SourceIdentity::CronJob(job.to_owned()))
    }

    pub fn api(user_id: Option<&str>) -> Self {
        let source = Self::new(SourceType::Api);
        match user_id {
            Some(user) => source.with_identity(SourceIdentity::User(user.to_owned())),
            None => source,
        }
    }

    pub fn p2p(public_key: &str) -> Self {
        Self::new(SourceType::P2p)
            .with_identity(SourceIdentity::PublicKey(public_key.to_owned()))
    }

    pub fn p2p_discovery(public_key: &str) -> Self {
        Self::new(SourceType::P2pDiscovery)
            .with_identity(SourceIdentity::PublicKey(public_key.to_owned()))
    }

    pub fn gateway(gateway_session: &str) -> Self {
        Self::new(SourceType::Gateway)
            .with_identity(SourceIdentity::GatewaySession(gateway_session.to_owned()))
    }

    /// Short human label, e.g. `cron:nightly` or `p2p:3f9a01c2`.
    pub fn label(&self) -> String {
        match &self.identity {
            Some(SourceIdentity::PublicKey(key)) => {
                let short: String = key.chars().take(8).collect();
                format!("{}:{short}", self.source_type)
            }
            Some(identity) => format!("{}:{}", self.source_type, identity.value()),
            None => self.source_type.to_string(),
        }
    }
}

/// One part of a multimodal message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { media_type: String, data: String },
}

/// Message body of an injection: plain text or a list of parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InjectMessage {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl InjectMessage {
    /// Concatenated text content; images are skipped.
    pub fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Replace the text content, keeping any non-text parts in place after it.
    #[must_use]
    pub fn with_text(self, text: impl Into<String>) -> Self {
        match self {
            Self::Text(_) => Self::Text(text.into()),
            Self::Parts(parts) => {
                let mut replaced = vec![ContentPart::Text { text: text.into() }];
                replaced.extend(
                    parts
                        .into_iter()
                        .filter(|part| !matches!(part, ContentPart::Text { .. })),
                );
                Self::Parts(replaced)
            }
        }
    }
}

impl From<&str> for InjectMessage {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for InjectMessage {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Per-injection options.
#[derive(Debug, Clone)]
pub struct InjectOptions {
    /// Higher runs first; ties run in enqueue order.
    pub priority: i32,
    /// Suppress delivery of the response to the originating channel.
    pub silent: bool,
    /// Allow the live-inject fast path when the session is already streaming.
    pub allow_live_inject: bool,
    pub source: Option<InjectionSource>,
    pub channel: Option<String>,
    /// Receives response text chunks as the executor produces them.
    pub stream: Option<mpsc::Sender<String>>,
}

impl Default for InjectOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            silent: false,
            allow_live_inject: true,
            source: None,
            channel: None,
            stream: None,
        }
    }
}

impl InjectOptions {
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: InjectionSource) -> Self {
        self.source = Some(source);
        self
    }

    #[must_use]
    pub fn without_live_inject(mut self) -> Self {
        self.allow_live_inject = false;
        self
    }
}

/// What an executor returns for one injection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InjectResult {
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    /// Set when the message went into an already-running turn instead of
    /// through the queue; `response` is empty in that case.
    #[serde(default)]
    pub live: bool,
}

impl InjectResult {
    pub fn text(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            ..Self::default()
        }
    }

    pub fn live() -> Self {
        Self {
            live: true,
            ..Self::default()
        }
    }
}

/// Outcome of a permission check. Denials are values, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "reason", rename_all = "lowercase")]
pub enum Decision {
    Allowed,
    Denied(String),
}

impl Decision {
    pub fn deny(reason: impl Into<String>) -> Self {
        Self::Denied(reason.into())
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Allowed => None,
            Self::Denied(reason) => Some(reason),
        }
    }
}

/// Structured audit record for an allowed or denied injection.
///
/// An allowed entry that carries a `reason` was permitted but failed to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub session: String,
    pub source: String,
    pub trust: TrustLevel,
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inject_id: Option<InjectId>,
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trust_ordering_follows_privilege() {
        assert!(TrustLevel::Owner > TrustLevel::Trusted);
        assert!(TrustLevel::Trusted > TrustLevel::SemiTrusted);
        assert!(TrustLevel::SemiTrusted > TrustLevel::Untrusted);
        assert_eq!(
            std::cmp::min(TrustLevel::Owner, TrustLevel::Untrusted),
            TrustLevel::Untrusted
        );
    }

    #[test]
    fn trust_level_serde_uses_kebab_case() {
        let json = serde_json::to_string(&TrustLevel::SemiTrusted).unwrap();
        assert_eq!(json, "\"semi-trusted\"");
        let parsed: TrustLevel = serde_json::from_str("\"untrusted\"").unwrap();
        assert_eq!(parsed, TrustLevel::Untrusted);
    }

    #[test]
    fn trust_level_from_str_accepts_variants() {
        assert_eq!(
            "Semi_Trusted".parse::<TrustLevel>().unwrap(),
            TrustLevel::SemiTrusted
        );
        assert!("root".parse::<TrustLevel>().is_err());
    }

    #[test]
    fn source_constructors_use_default_trust() {
        assert_eq!(InjectionSource::cli(None).trust_level, TrustLevel::Owner);
        assert_eq!(
            InjectionSource::cron("nightly").trust_level,
            TrustLevel::Trusted
        );
        assert_eq!(
            InjectionSource::p2p("abcdef").trust_level,
            TrustLevel::Untrusted
        );
    }

    #[test]
    fn label_shortens_public_keys() {
        let source = InjectionSource::p2p("0123456789abcdef");
        assert_eq!(source.label(), "p2p:01234567");
        assert_eq!(InjectionSource::cron("nightly").label(), "cron:nightly");
        assert_eq!(InjectionSource::daemon().label(), "daemon");
    }

    #[test]
    fn with_text_keeps_images() {
        let message = InjectMessage::Parts(vec![
            ContentPart::Text { text: "old".into() },
            ContentPart::Image {
                media_type: "image/png".into(),
                data: "AAAA".into(),
            },
        ]);
        let replaced = message.with_text("new");
        assert_eq!(replaced.text(), "new");
        match replaced {
            InjectMessage::Parts(parts) => assert_eq!(parts.len(), 2),
            InjectMessage::Text(_) => panic!("expected parts"),
        }
    }

    #[test]
    fn message_deserializes_from_plain_string() {
        let message: InjectMessage = serde_json::from_str("\"hello\"").unwrap();
        assert_eq!(message, InjectMessage::Text("hello".into()));
    }

    #[test]
    fn decision_reason() {
        assert_eq!(Decision::Allowed.reason(), None);
        assert_eq!(Decision::deny("nope").reason(), Some("nope"));
        assert!(!Decision::deny("nope").is_allowed());
    }
}
