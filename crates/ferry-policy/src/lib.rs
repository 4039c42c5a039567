//! Policy engine for injections: who may reach which session, with which
//! tools, inside which sandbox, and how lower-trust sources are relayed
//! through gateway sessions.

pub mod context;
pub mod forward;
pub mod resolver;

pub use context::{
    ContextRegistry, SecurityContext, TurnGuard, create_api_context, create_cli_context,
    create_cron_context, create_daemon_context, create_forwarded_context, create_p2p_context,
    create_p2p_discovery_context, create_plugin_context,
};
pub use forward::{ForwardError, ForwardManager, ForwardRequest, ForwardStatus, Route};
pub use resolver::{
    CapabilityOverrides, ForwardRule, GatewayRoute, PolicyEngine, ResolvedPolicy, ResolvedTools,
    SessionConfigProvider, SessionPolicy, StaticSessionConfig, ToolPolicy, resolve_policy,
};
