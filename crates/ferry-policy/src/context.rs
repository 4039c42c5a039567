//! Security contexts: a source bound to its resolved policy for one session turn.

use ferry_core::{
    Capability, Decision, Forwarded, InjectionSource, SourceIdentity, SourceType, TrustLevel,
    default_trust_for_source,
};
use ferry_sandbox::{SandboxConfig, TrustLookup};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::resolver::{PolicyEngine, ResolvedPolicy};

/// Live permission handle for one session invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityContext {
    session: String,
    source: InjectionSource,
    policy: ResolvedPolicy,
}

impl SecurityContext {
    pub fn new(
        session: impl Into<String>,
        source: InjectionSource,
        policy: ResolvedPolicy,
    ) -> Self {
        Self {
            session: session.into(),
            source,
            policy,
        }
    }

    /// Resolve `source` against the current config of `session`.
    pub fn resolve(engine: &PolicyEngine, source: InjectionSource, session: &str) -> Self {
        let policy = engine.resolve(&source, session);
        Self::new(session, source, policy)
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn source(&self) -> &InjectionSource {
        &self.source
    }

    pub fn trust_level(&self) -> TrustLevel {
        self.policy.trust
    }

    pub fn resolved_policy(&self) -> &ResolvedPolicy {
        &self.policy
    }

    pub fn can_use_tool(&self, tool: &str) -> Decision {
        let decision = self.policy.check_tool(tool);
        if let Decision::Denied(reason) = &decision {
            debug!(
                session = %self.session,
                tool,
                trust = %self.policy.trust,
                reason = %reason,
                "tool denied"
            );
        }
        decision
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.policy.has_capability(capability)
    }
}

pub fn create_cli_context(
    engine: &PolicyEngine,
    session: &str,
    user: Option<&str>,
) -> SecurityContext {
    SecurityContext::resolve(engine, InjectionSource::cli(user), session)
}

pub fn create_daemon_context(engine: &PolicyEngine, session: &str) -> SecurityContext {
    SecurityContext::resolve(engine, InjectionSource::daemon(), session)
}

pub fn create_plugin_context(
    engine: &PolicyEngine,
    session: &str,
    plugin_id: &str,
) -> SecurityContext {
    SecurityContext::resolve(engine, InjectionSource::plugin(plugin_id), session)
}

pub fn create_cron_context(engine: &PolicyEngine, session: &str, job: &str) -> SecurityContext {
    SecurityContext::resolve(engine, InjectionSource::cron(job), session)
}

pub fn create_p2p_context(
    engine: &PolicyEngine,
    session: &str,
    public_key: &str,
) -> SecurityContext {
    SecurityContext::resolve(engine, InjectionSource::p2p(public_key), session)
}

pub fn create_p2p_discovery_context(
    engine: &PolicyEngine,
    session: &str,
    public_key: &str,
) -> SecurityContext {
    SecurityContext::resolve(engine, InjectionSource::p2p_discovery(public_key), session)
}

pub fn create_api_context(
    engine: &PolicyEngine,
    session: &str,
    user_id: Option<&str>,
) -> SecurityContext {
    SecurityContext::resolve(engine, InjectionSource::api(user_id), session)
}

/// Context for a message relayed by `gateway_session` on behalf of `original`.
///
/// The relayed source never carries more trust than the original sender or
/// than a gateway itself.
pub fn create_forwarded_context(
    engine: &PolicyEngine,
    session: &str,
    gateway_session: &str,
    request_id: Uuid,
    original: InjectionSource,
) -> SecurityContext {
    let trust = std::cmp::min(
        original.trust_level,
        default_trust_for_source(SourceType::Gateway),
    );
    let mut source = InjectionSource::new(SourceType::Gateway)
        .with_trust(trust)
        .with_identity(SourceIdentity::GatewaySession(gateway_session.to_owned()));
    source.forwarded = Some(Box::new(Forwarded {
        gateway_session: gateway_session.to_owned(),
        request_id,
        original,
    }));
    SecurityContext::resolve(engine, source, session)
}

// ---------------------------------------------------------------------------
// ContextRegistry
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Entry {
    generation: u64,
    context: SecurityContext,
}

/// Contexts of the turns currently running, keyed by session.
///
/// A stored context must be cleared when its turn ends; [`ContextRegistry::enter`]
/// returns a guard that does it on drop.
#[derive(Debug, Default)]
pub struct ContextRegistry {
    contexts: Mutex<HashMap<String, Entry>>,
    next_generation: AtomicU64,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn store_entry(&self, context: SecurityContext) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let session = context.session().to_owned();
        debug!(
            session = %session,
            trust = %context.trust_level(),
            "storing security context"
        );
        self.contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                session,
                Entry {
                    generation,
                    context,
                },
            );
        generation
    }

    /// Store `context` for its session, replacing any previous one.
    pub fn store_context(&self, context: SecurityContext) {
        self.store_entry(context);
    }

    pub fn get_context(&self, session: &str) -> Option<SecurityContext> {
        self.contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session)
            .map(|entry| entry.context.clone())
    }

    /// Returns whether a context was stored.
    pub fn clear_context(&self, session: &str) -> bool {
        self.contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session)
            .is_some()
    }

    /// Store `context` for the duration of a turn.
    ///
    /// Dropping the guard clears the context unless a later turn has already
    /// replaced it.
    pub fn enter(self: &Arc<Self>, context: SecurityContext) -> TurnGuard {
        let session = context.session().to_owned();
        let generation = self.store_entry(context);
        TurnGuard {
            registry: Arc::clone(self),
            session,
            generation,
        }
    }

    /// Trust of the stored context, or untrusted when there is none.
    pub fn trust_level_for(&self, session: &str) -> TrustLevel {
        self.trust_for_session(session).unwrap_or_else(|| {
            warn!(
                session,
                "no security context for session, falling back to untrusted"
            );
            TrustLevel::Untrusted
        })
    }

    /// Whether the current turn of `session` may read other sessions' transcripts.
    pub fn can_read_transcripts(&self, session: &str) -> bool {
        match self.get_context(session) {
            Some(context) => context.has_capability(Capability::CrossRead),
            None => {
                warn!(
                    session,
                    "no security context for session, transcript access denied"
                );
                false
            }
        }
    }

    pub fn sessions(&self) -> Vec<String> {
        let mut sessions: Vec<_> = self
            .contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        sessions.sort();
        sessions
    }
}

impl TrustLookup for ContextRegistry {
    fn trust_for_session(&self, session: &str) -> Option<TrustLevel> {
        self.get_context(session)
            .map(|context| context.trust_level())
    }

    fn sandbox_for_session(&self, session: &str) -> Option<SandboxConfig> {
        self.get_context(session)
            .map(|context| context.resolved_policy().sandbox.clone())
    }
}

/// Clears a session's context when the turn that stored it ends.
#[derive(Debug)]
pub struct TurnGuard {
    registry: Arc<ContextRegistry>,
    session: String,
    generation: u64,
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        let mut contexts = self
            .registry
            .contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if contexts
            .get(&self.session)
            .is_some_and(|entry| entry.generation == self.generation)
        {
            contexts.remove(&self.session);
            debug!(session = %self.session, "cleared security context");
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{SessionPolicy, StaticSessionConfig, ToolPolicy};

    fn engine() -> PolicyEngine {
        let config = StaticSessionConfig::new().with_session(
            "main",
            SessionPolicy {
                tools: ToolPolicy {
                    allow: Vec::new(),
                    deny: vec!["config_write".into()],
                },
                ..SessionPolicy::default()
            },
        );
        PolicyEngine::new(Arc::new(config))
    }

    #[test]
    fn factories_use_default_trust() {
        let engine = engine();
        assert_eq!(
            create_cli_context(&engine, "main", Some("alice")).trust_level(),
            TrustLevel::Owner
        );
        assert_eq!(
            create_daemon_context(&engine, "main").trust_level(),
            TrustLevel::Owner
        );
        assert_eq!(
            create_cron_context(&engine, "main", "nightly").trust_level(),
            TrustLevel::Trusted
        );
        assert_eq!(
            create_api_context(&engine, "main", None).trust_level(),
            TrustLevel::Trusted
        );
        assert_eq!(
            create_plugin_context(&engine, "main", "weather").trust_level(),
            TrustLevel::SemiTrusted
        );
        assert_eq!(
            create_p2p_context(&engine, "main", "abc").trust_level(),
            TrustLevel::Untrusted
        );
        let discovery = create_p2p_discovery_context(&engine, "main", "abc");
        assert_eq!(discovery.source().source_type, SourceType::P2pDiscovery);
    }

    #[test]
    fn session_deny_applies_even_to_owner() {
        let context = create_cli_context(&engine(), "main", None);
        assert!(context.can_use_tool("bash").is_allowed());
        assert!(!context.can_use_tool("config_write").is_allowed());
        assert!(context.has_capability(Capability::ConfigWrite));
    }

    #[test]
    fn forwarded_context_never_escalates() {
        let engine = engine();
        let original = InjectionSource::p2p("peer");
        let context = create_forwarded_context(
            &engine,
            "support",
            "inbox",
            Uuid::new_v4(),
            original.clone(),
        );
        assert_eq!(context.trust_level(), TrustLevel::Untrusted);
        let forwarded = context.source().forwarded.as_ref().unwrap();
        assert_eq!(forwarded.gateway_session, "inbox");
        assert_eq!(forwarded.original, original);

        let daemon = InjectionSource::daemon();
        let owner = create_forwarded_context(&engine, "support", "inbox", Uuid::new_v4(), daemon);
        assert_eq!(owner.trust_level(), TrustLevel::SemiTrusted);
    }

    #[test]
    fn store_get_clear() {
        let registry = ContextRegistry::new();
        registry.store_context(create_cron_context(&engine(), "main", "nightly"));
        assert_eq!(
            registry.trust_for_session("main"),
            Some(TrustLevel::Trusted)
        );
        assert!(registry.clear_context("main"));
        assert!(!registry.clear_context("main"));
        assert!(registry.get_context("main").is_none());
    }

    #[test]
    fn missing_context_is_untrusted() {
        let registry = ContextRegistry::new();
        assert_eq!(registry.trust_level_for("ghost"), TrustLevel::Untrusted);
        assert!(!registry.can_read_transcripts("ghost"));
    }

    #[test]
    fn transcripts_need_cross_read() {
        let registry = ContextRegistry::new();
        registry.store_context(create_cron_context(&engine(), "a", "nightly"));
        registry.store_context(create_plugin_context(&engine(), "b", "weather"));
        assert!(registry.can_read_transcripts("a"));
        assert!(!registry.can_read_transcripts("b"));
    }

    #[test]
    fn guard_clears_only_its_own_turn() {
        let registry = Arc::new(ContextRegistry::new());
        let first = registry.enter(create_cron_context(&engine(), "main", "nightly"));
        let second = registry.enter(create_cli_context(&engine(), "main", None));
        drop(first);
        assert_eq!(registry.trust_for_session("main"), Some(TrustLevel::Owner));
        drop(second);
        assert!(registry.get_context("main").is_none());
        assert!(registry.sessions().is_empty());
    }
}
