use ferry_core::{
    Capability, Decision, InjectionSource, SourceType, TrustLevel, capability_profile,
    expand_capabilities, meets_trust_level, tool_capability,
};
use ferry_sandbox::{SandboxConfig, SandboxOverride};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Tool allow/deny lists for a session. Deny wins over allow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPolicy {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

/// Capabilities added to or removed from the trust profile. Revoke wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityOverrides {
    #[serde(default)]
    pub grant: Vec<String>,
    #[serde(default)]
    pub revoke: Vec<String>,
}

/// Per-session configuration consulted on every injection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPolicy {
    /// Lowest trust level that may inject into this session directly.
    #[serde(default = "default_min_trust")]
    pub min_trust: TrustLevel,
    /// Whether this session relays messages for sources that cannot reach
    /// their target directly.
    #[serde(default)]
    pub gateway: bool,
    /// Trust levels allowed to forward through this session.
    #[serde(default)]
    pub forward_from: Vec<TrustLevel>,
    #[serde(default)]
    pub tools: ToolPolicy,
    #[serde(default)]
    pub capabilities: CapabilityOverrides,
    #[serde(default)]
    pub sandbox: Option<SandboxOverride>,
}

fn default_min_trust() -> TrustLevel {
    TrustLevel::Trusted
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            min_trust: default_min_trust(),
            gateway: false,
            forward_from: Vec::new(),
            tools: ToolPolicy::default(),
            capabilities: CapabilityOverrides::default(),
            sandbox: None,
        }
    }
}

/// Which targets a gateway relays to, and from which trust level upwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRule {
    pub min_trust: TrustLevel,
    pub target: String,
}

/// A gateway session and the sources routed through it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayRoute {
    pub session: String,
    #[serde(default)]
    pub sources: Vec<SourceType>,
    #[serde(default)]
    pub rules: Vec<ForwardRule>,
    /// Pending forward requests older than this expire.
    #[serde(default = "default_request_ttl_secs")]
    pub request_ttl_secs: u64,
}

fn default_request_ttl_secs() -> u64 {
    3600
}

impl GatewayRoute {
    pub fn new(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            sources: Vec::new(),
            rules: Vec::new(),
            request_ttl_secs: default_request_ttl_secs(),
        }
    }

    #[must_use]
    pub fn with_sources(mut self, sources: &[SourceType]) -> Self {
        self.sources = sources.to_vec();
        self
    }

    #[must_use]
    pub fn with_rule(mut self, min_trust: TrustLevel, target: impl Into<String>) -> Self {
        self.rules.push(ForwardRule {
            min_trust,
            target: target.into(),
        });
        self
    }

    pub fn accepts(&self, source_type: SourceType) -> bool {
        self.sources.contains(&source_type)
    }

    /// Whether a source at `trust` may be relayed to `target`.
    pub fn allows(&self, trust: TrustLevel, target: &str) -> bool {
        self.rules
            .iter()
            .any(|rule| rule.target == target && meets_trust_level(trust, rule.min_trust))
    }
}

/// Source of session policies and gateway routes. Read on every request.
pub trait SessionConfigProvider: Send + Sync {
    fn session_policy(&self, session: &str) -> SessionPolicy;

    fn gateways(&self) -> Vec<GatewayRoute>;
}

/// In-memory session config.
#[derive(Debug, Clone, Default)]
pub struct StaticSessionConfig {
    sessions: HashMap<String, SessionPolicy>,
    gateways: Vec<GatewayRoute>,
}

impl StaticSessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_session(mut self, name: impl Into<String>, policy: SessionPolicy) -> Self {
        self.sessions.insert(name.into(), policy);
        self
    }

    #[must_use]
    pub fn with_gateway(mut self, gateway: GatewayRoute) -> Self {
        self.gateways.push(gateway);
        self
    }
}

impl SessionConfigProvider for StaticSessionConfig {
    fn session_policy(&self, session: &str) -> SessionPolicy {
        self.sessions.get(session).cloned().unwrap_or_default()
    }

    fn gateways(&self) -> Vec<GatewayRoute> {
        self.gateways.clone()
    }
}

/// Tool lists after merging. `allow` never contains a denied name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolvedTools {
    pub allow: BTreeSet<String>,
    pub deny: BTreeSet<String>,
}

/// Effective permissions for one (source, session) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedPolicy {
    pub trust: TrustLevel,
    pub capabilities: BTreeSet<Capability>,
    pub tools: ResolvedTools,
    pub sandbox: SandboxConfig,
    pub is_gateway: bool,
    pub can_forward: bool,
}

impl ResolvedPolicy {
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Deny-list, then allow-list, then the tool's capability mapping.
    ///
    /// Tools with no known capability are denied.
    pub fn check_tool(&self, tool: &str) -> Decision {
        if self.tools.deny.contains(tool) {
            return Decision::deny(format!("tool '{tool}' is denied for this session"));
        }
        if !self.tools.allow.is_empty() {
            return if self.tools.allow.contains(tool) {
                Decision::Allowed
            } else {
                Decision::deny(format!("tool '{tool}' is not in the session allow-list"))
            };
        }
        match tool_capability(tool) {
            Some(capability) if self.has_capability(capability) => Decision::Allowed,
            Some(capability) => Decision::deny(format!(
                "tool '{tool}' requires {capability}, not granted at {} trust",
                self.trust
            )),
            None => Decision::deny(format!("unknown tool '{tool}'")),
        }
    }
}

/// Compute the effective policy for `source` against one session's config.
///
/// Pure: the same inputs always give the same policy.
pub fn resolve_policy(source: &InjectionSource, session: &SessionPolicy) -> ResolvedPolicy {
    let trust = source.trust_level;

    let mut capabilities = capability_profile(trust);
    capabilities.extend(expand_capabilities(&session.capabilities.grant));
    for revoked in expand_capabilities(&session.capabilities.revoke) {
        capabilities.remove(&revoked);
    }

    let deny: BTreeSet<String> = session.tools.deny.iter().cloned().collect();
    let allow = session
        .tools
        .allow
        .iter()
        .filter(|tool| !deny.contains(*tool))
        .cloned()
        .collect();

    let base = SandboxConfig::default_for_trust(trust);
    let sandbox = match &session.sandbox {
        Some(overrides) => base.with_override(overrides),
        None => base,
    };

    ResolvedPolicy {
        trust,
        capabilities,
        tools: ResolvedTools { allow, deny },
        sandbox,
        is_gateway: session.gateway,
        can_forward: session.forward_from.contains(&trust),
    }
}

/// Capability a source type needs to inject into a session directly.
pub(crate) fn inject_capability(source_type: SourceType) -> Capability {
    match source_type {
        SourceType::P2p | SourceType::P2pDiscovery => Capability::InjectNetwork,
        SourceType::Cli
        | SourceType::Daemon
        | SourceType::Plugin
        | SourceType::Cron
        | SourceType::Api
        | SourceType::Gateway => Capability::InjectLocal,
    }
}

/// Resolves policies against the live session configuration.
#[derive(Clone)]
pub struct PolicyEngine {
    config: Arc<dyn SessionConfigProvider>,
}

impl std::fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyEngine").finish_non_exhaustive()
    }
}

impl PolicyEngine {
    pub fn new(config: Arc<dyn SessionConfigProvider>) -> Self {
        Self { config }
    }

    pub fn session_policy(&self, session: &str) -> SessionPolicy {
        self.config.session_policy(session)
    }

    pub fn gateways(&self) -> Vec<GatewayRoute> {
        self.config.gateways()
    }

    /// Resolve a fresh policy. Never cached: session config may change between calls.
    pub fn resolve(&self, source: &InjectionSource, session: &str) -> ResolvedPolicy {
        resolve_policy(source, &self.config.session_policy(session))
    }

    /// Whether `source` may inject into `session` without a gateway.
    pub fn check_direct(&self, source: &InjectionSource, session: &str) -> Decision {
        let policy = self.config.session_policy(session);
        if !meets_trust_level(source.trust_level, policy.min_trust) {
            return Decision::deny(format!(
                "session '{session}' requires {} trust, source is {}",
                policy.min_trust, source.trust_level
            ));
        }
        let required = inject_capability(source.source_type);
        if !resolve_policy(source, &policy).has_capability(required) {
            return Decision::deny(format!(
                "{} sources need {required} to inject into '{session}'",
                source.source_type
            ));
        }
        Decision::Allowed
    }
}
