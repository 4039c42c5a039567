use anyhow::Result;
use async_trait::async_trait;
use ferry_core::InjectMessage;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::command::{HOOK_TIMEOUT, run_command_hook};
use crate::types::{HookConfig, HookContext, HookPhase, HookResponse, Metadata};

/// A hook implemented inside the process.
#[async_trait]
pub trait InProcessHook: Send + Sync {
    async fn call(&self, context: &HookContext) -> Result<HookResponse>;
}

/// How a hook runs.
#[derive(Clone)]
pub enum HookHandler {
    InProcess(Arc<dyn InProcessHook>),
    /// Program and arguments of an external command.
    Command(Vec<String>),
}

impl std::fmt::Debug for HookHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProcess(_) => f.write_str("InProcess"),
            Self::Command(command) => f.debug_tuple("Command").field(command).finish(),
        }
    }
}

#[derive(Debug, Clone)]
struct RegisteredHook {
    name: String,
    phase: HookPhase,
    enabled: bool,
    /// Registered from config and replaced on reload.
    from_config: bool,
    handler: HookHandler,
}

/// Result of the pre-inject phase.
#[derive(Debug, Clone, PartialEq)]
pub enum PreInjectOutcome {
    Allow {
        message: InjectMessage,
        metadata: Metadata,
    },
    Blocked {
        hook: String,
        reason: String,
    },
}

/// Ordered pre- and post-inject hooks.
#[derive(Debug)]
pub struct HookPipeline {
    hooks: Mutex<Vec<RegisteredHook>>,
    timeout: Duration,
}

impl Default for HookPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl HookPipeline {
    pub fn new() -> Self {
        Self {
            hooks: Mutex::new(Vec::new()),
            timeout: HOOK_TIMEOUT,
        }
    }

    /// Override the per-hook timeout for command hooks.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Vec<RegisteredHook>> {
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, hook: RegisteredHook) {
        let mut hooks = self.lock();
        hooks.retain(|existing| existing.name != hook.name);
        debug!(hook = %hook.name, phase = %hook.phase, "registered hook");
        hooks.push(hook);
    }

    /// Register a hook at the end of its phase, replacing any hook with the same name.
    pub fn register(&self, name: impl Into<String>, phase: HookPhase, handler: HookHandler) {
        self.push(RegisteredHook {
            name: name.into(),
            phase,
            enabled: true,
            from_config: false,
            handler,
        });
    }

    pub fn register_config(&self, config: &HookConfig) {
        self.push(RegisteredHook {
            name: config.name.clone(),
            phase: config.phase,
            enabled: config.enabled,
            from_config: true,
            handler: HookHandler::Command(config.command.clone()),
        });
    }

    /// Replace every config-defined hook with `configs`, in order. Other hooks stay.
    pub fn sync_config(&self, configs: &[HookConfig]) {
        self.lock().retain(|hook| !hook.from_config);
        for config in configs {
            self.register_config(config);
        }
        info!(count = configs.len(), "hook config synchronised");
    }

    /// Returns whether a hook with that name exists.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut hooks = self.lock();
        match hooks.iter_mut().find(|hook| hook.name == name) {
            Some(hook) => {
                hook.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut hooks = self.lock();
        let before = hooks.len();
        hooks.retain(|hook| hook.name != name);
        hooks.len() != before
    }

    /// Names of the enabled hooks in a phase, in run order.
    pub fn names(&self, phase: HookPhase) -> Vec<String> {
        self.enabled(phase)
            .into_iter()
            .map(|hook| hook.name)
            .collect()
    }

    fn enabled(&self, phase: HookPhase) -> Vec<RegisteredHook> {
        self.lock()
            .iter()
            .filter(|hook| hook.enabled && hook.phase == phase)
            .cloned()
            .collect()
    }

    async fn call(&self, hook: &RegisteredHook, context: &HookContext) -> Result<HookResponse> {
        match &hook.handler {
            HookHandler::InProcess(handler) => handler.call(context).await,
            HookHandler::Command(command) => run_command_hook(command, context, self.timeout).await,
        }
    }

    /// Run pre-inject hooks in order.
    ///
    /// Each hook sees the message and metadata left by the previous ones. The
    /// first hook that answers `allow: false` stops the pipeline. A hook that
    /// fails counts as allow.
    pub async fn run_pre_inject(&self, mut context: HookContext) -> PreInjectOutcome {
        for hook in self.enabled(HookPhase::PreInject) {
            let span = info_span!("hook", hook = %hook.name, phase = "pre-inject");
            let response = match self.call(&hook, &context).instrument(span).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(
                        hook = %hook.name,
                        error = %format!("{e:#}"),
                        "pre-inject hook failed, allowing"
                    );
                    continue;
                }
            };

            if !response.allow {
                let reason = response
                    .reason
                    .filter(|reason| !reason.is_empty())
                    .unwrap_or_else(|| format!("blocked by hook: {}", hook.name));
                info!(
                    hook = %hook.name,
                    session = %context.target_session,
                    reason = %reason,
                    "injection blocked by hook"
                );
                return PreInjectOutcome::Blocked {
                    hook: hook.name,
                    reason,
                };
            }
            if let Some(message) = response.message {
                context.message = message;
            }
            if let Some(metadata) = response.metadata {
                context.metadata.extend(metadata);
            }
        }

        PreInjectOutcome::Allow {
            message: context.message,
            metadata: context.metadata,
        }
    }

    /// Run post-inject hooks for their side effects. Errors are logged only.
    pub async fn run_post_inject(&self, context: &HookContext) {
        for hook in self.enabled(HookPhase::PostInject) {
            let span = info_span!("hook", hook = %hook.name, phase = "post-inject");
            if let Err(e) = self.call(&hook, context).instrument(span).await {
                warn!(
                    hook = %hook.name,
                    error = %format!("{e:#}"),
                    "post-inject hook failed"
                );
            }
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::InjectionSource;
    use serde_json::json;

    struct Fixed(HookResponse);

    #[async_trait]
    impl InProcessHook for Fixed {
        async fn call(&self, _context: &HookContext) -> Result<HookResponse> {
            Ok(self.0.clone())
        }
    }

    struct Broken;

    #[async_trait]
    impl InProcessHook for Broken {
        async fn call(&self, _context: &HookContext) -> Result<HookResponse> {
            anyhow::bail!("boom")
        }
    }

    /// Appends its name to the message and records what it saw.
    struct Append(&'static str);

    #[async_trait]
    impl InProcessHook for Append {
        async fn call(&self, context: &HookContext) -> Result<HookResponse> {
            let mut metadata = Metadata::new();
            metadata.insert(self.0.to_owned(), json!(context.metadata.len()));
            Ok(HookResponse {
                message: Some(format!("{}+{}", context.message.text(), self.0).into()),
                metadata: Some(metadata),
                ..HookResponse::allow()
            })
        }
    }

    fn context() -> HookContext {
        HookContext::new("msg".into(), InjectionSource::cron("nightly"), "reports")
    }

    fn in_process(hook: impl InProcessHook + 'static) -> HookHandler {
        HookHandler::InProcess(Arc::new(hook))
    }

    #[tokio::test]
    async fn hooks_chain_in_registration_order() {
        let pipeline = HookPipeline::new();
        pipeline.register("a", HookPhase::PreInject, in_process(Append("a")));
        pipeline.register("b", HookPhase::PreInject, in_process(Append("b")));

        match pipeline.run_pre_inject(context()).await {
            PreInjectOutcome::Allow { message, metadata } => {
                assert_eq!(message.text(), "msg+a+b");
                assert_eq!(metadata["a"], json!(0));
                assert_eq!(metadata["b"], json!(1));
            }
            PreInjectOutcome::Blocked { .. } => panic!("expected allow"),
        }
    }

    #[tokio::test]
    async fn block_short_circuits() {
        let pipeline = HookPipeline::new();
        let gate = in_process(Fixed(HookResponse::block("x")));
        pipeline.register("gate", HookPhase::PreInject, gate);
        pipeline.register("after", HookPhase::PreInject, in_process(Append("after")));

        assert_eq!(
            pipeline.run_pre_inject(context()).await,
            PreInjectOutcome::Blocked {
                hook: "gate".into(),
                reason: "x".into()
            }
        );
    }

    #[tokio::test]
    async fn block_without_reason_names_the_hook() {
        let pipeline = HookPipeline::new();
        let response = HookResponse {
            allow: false,
            ..HookResponse::allow()
        };
        pipeline.register("gate", HookPhase::PreInject, in_process(Fixed(response)));
        match pipeline.run_pre_inject(context()).await {
            PreInjectOutcome::Blocked { reason, .. } => assert_eq!(reason, "blocked by hook: gate"),
            PreInjectOutcome::Allow { .. } => panic!("expected block"),
        }
    }

    #[tokio::test]
    async fn broken_hook_fails_open() {
        let pipeline = HookPipeline::new();
        pipeline.register("broken", HookPhase::PreInject, in_process(Broken));
        pipeline.register(
            "missing",
            HookPhase::PreInject,
            HookHandler::Command(Vec::new()),
        );
        match pipeline.run_pre_inject(context()).await {
            PreInjectOutcome::Allow { message, .. } => assert_eq!(message.text(), "msg"),
            PreInjectOutcome::Blocked { .. } => panic!("expected allow"),
        }
        pipeline.register("broken-post", HookPhase::PostInject, in_process(Broken));
        pipeline.run_post_inject(&context()).await;
    }

    #[tokio::test]
    async fn disabled_and_removed_hooks_do_not_run() {
        let pipeline = HookPipeline::new();
        let gate = in_process(Fixed(HookResponse::block("x")));
        pipeline.register("gate", HookPhase::PreInject, gate);
        assert!(pipeline.set_enabled("gate", false));
        assert!(matches!(
            pipeline.run_pre_inject(context()).await,
            PreInjectOutcome::Allow { .. }
        ));
        assert!(pipeline.names(HookPhase::PreInject).is_empty());
        assert!(pipeline.remove("gate"));
        assert!(!pipeline.set_enabled("gate", true));
    }

    #[test]
    fn sync_config_keeps_builtins_first() {
        let pipeline = HookPipeline::new();
        pipeline.register("tag", HookPhase::PreInject, in_process(Append("tag")));
        let configs = vec![
            HookConfig {
                name: "redact".into(),
                phase: HookPhase::PreInject,
                command: vec!["./redact.sh".into()],
                enabled: true,
            },
            HookConfig {
                name: "notify".into(),
                phase: HookPhase::PostInject,
                command: vec!["./notify.sh".into()],
                enabled: true,
            },
        ];
        pipeline.sync_config(&configs);
        assert_eq!(pipeline.names(HookPhase::PreInject), vec!["tag", "redact"]);

        pipeline.sync_config(&configs[1..]);
        assert_eq!(pipeline.names(HookPhase::PreInject), vec!["tag"]);
        assert_eq!(pipeline.names(HookPhase::PostInject), vec!["notify"]);
    }
}
