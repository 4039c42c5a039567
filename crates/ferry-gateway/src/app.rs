use anyhow::{Context, Result};
use ferry_core::{
    Executor, InjectionSource, SourceIdentity, SourceType, TracingAuditSink,
};
use ferry_hooks::{AuditLogHook, HookPipeline};
use ferry_policy::{ContextRegistry, PolicyEngine};
use ferry_queue::QueueManager;
use ferry_sandbox::{ContainerExtension, SandboxExtensions, SandboxResolver};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::config::SharedConfig;
use crate::executor::{CommandExecutor, SandboxRouting, TurnContextExecutor};
use crate::injection::{Injector, install_builtin_hooks};
use crate::session_config::ConfigSessions;

/// Every long-lived component of the daemon, wired from one config.
pub(crate) struct App {
    pub config: SharedConfig,
    pub engine: PolicyEngine,
    pub registry: Arc<ContextRegistry>,
    pub sandbox: Arc<SandboxResolver>,
    pub hooks: Arc<HookPipeline>,
    pub queues: Arc<QueueManager>,
    pub injector: Arc<Injector>,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("sandbox", &self.sandbox)
            .field("queues", &self.queues)
            .finish_non_exhaustive()
    }
}

impl App {
    /// Wire components from `config`. No executor is installed yet.
    ///
    /// `config_dir` anchors relative paths such as the sandbox workspace.
    pub(crate) fn build(config: SharedConfig, config_dir: &Path) -> Result<Self> {
        let snapshot = config.load_full();

        let engine = PolicyEngine::new(Arc::new(ConfigSessions::new(Arc::clone(&config))));
        let registry = Arc::new(ContextRegistry::new());

        let mut extensions = SandboxExtensions::new();
        extensions.register(Arc::new(ContainerExtension::new(
            snapshot.sandbox.container_settings(config_dir),
        )));
        let extension = match snapshot.sandbox.extension.as_deref() {
            Some(name) => Some(extensions.get(name).with_context(|| {
                format!(
                    "unknown sandbox extension '{name}' (available: {})",
                    extensions.names().join(", ")
                )
            })?),
            None => None,
        };
        let sandbox = Arc::new(SandboxResolver::new(
            Arc::clone(&registry) as Arc<dyn ferry_sandbox::TrustLookup>,
            extension,
        ));

        let queues = Arc::new(QueueManager::new().with_max_depth(snapshot.queue.max_depth));

        let audit = Arc::new(AuditLogHook::new(
            Arc::new(TracingAuditSink),
            snapshot.audit.log_success,
            snapshot.audit.log_denied,
        ));
        let hooks = Arc::new(HookPipeline::new());
        install_builtin_hooks(&hooks, &audit);
        hooks.sync_config(&snapshot.hooks);

        let injector = Arc::new(Injector::new(
            engine.clone(),
            Arc::clone(&hooks),
            Arc::clone(&queues),
            audit,
        ));

        info!(
            sessions = snapshot.sessions.len(),
            gateways = snapshot.gateways.len(),
            hooks = snapshot.hooks.len(),
            sandbox = sandbox.has_extension(),
            "ferry components ready"
        );

        Ok(Self {
            config,
            engine,
            registry,
            sandbox,
            hooks,
            queues,
            injector,
        })
    }

    /// The configured command executor, routed through the sandbox when one is installed.
    pub(crate) fn command_executor(&self) -> CommandExecutor {
        let config = self.config.load();
        let executor = CommandExecutor::new(
            config.executor.command.clone(),
            config.executor.timeout(),
        );
        if self.sandbox.has_extension() {
            executor.with_sandbox(SandboxRouting {
                resolver: Arc::clone(&self.sandbox),
                runtime: config.sandbox.runtime.clone(),
            })
        } else {
            executor
        }
    }

    /// Install `inner` behind the per-turn security context.
    pub(crate) fn install_executor(&self, inner: Arc<dyn Executor>) {
        self.queues.set_executor(Arc::new(TurnContextExecutor::new(
            inner,
            self.engine.clone(),
            Arc::clone(&self.registry),
        )));
    }

    /// Re-apply the hot-reloadable parts of the config to running components.
    pub(crate) fn apply_runtime_config(&self) {
        let config = self.config.load();
        self.hooks.sync_config(&config.hooks);
        self.queues.set_max_depth(config.queue.max_depth);
        info!(
            hooks = config.hooks.len(),
            max_depth = ?config.queue.max_depth,
            "runtime config applied"
        );
    }
}

/// Build an injection source from a source type and an optional identity.
///
/// The identity is interpreted according to the source type; daemon sources
/// carry none.
pub(crate) fn source_from_args(source_type: SourceType, identity: Option<&str>) -> InjectionSource {
    let source = InjectionSource::new(source_type);
    let Some(identity) = identity else {
        return source;
    };
    let identity = identity.to_owned();
    match source_type {
        SourceType::Cli | SourceType::Api => source.with_identity(SourceIdentity::User(identity)),
        SourceType::Plugin => source.with_identity(SourceIdentity::Plugin(identity)),
        SourceType::Cron => source.with_identity(SourceIdentity::CronJob(identity)),
        SourceType::P2p | SourceType::P2pDiscovery => {
            source.with_identity(SourceIdentity::PublicKey(identity))
        }
        SourceType::Gateway => source.with_identity(SourceIdentity::GatewaySession(identity)),
        SourceType::Daemon => source,
    }
}
