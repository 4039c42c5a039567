use ferry_core::{
    InjectError, InjectId, InjectMessage, InjectOptions, InjectResult, InjectionSource,
};
use ferry_hooks::{
    AuditLogHook, HookContext, HookHandler, HookPhase, HookPipeline, PreInjectOutcome,
    SourceMetadataHook,
};
use ferry_policy::{
    ForwardError, ForwardManager, ForwardRequest, PolicyEngine, Route, create_cli_context,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

/// How one injection ended, as reported to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub(crate) enum InjectOutcome {
    /// Ran to completion. `inject_id` is absent for live injects.
    Completed {
        #[serde(skip_serializing_if = "Option::is_none")]
        inject_id: Option<InjectId>,
        result: InjectResult,
    },
    /// Held for owner approval at a gateway session.
    Forwarded { request_id: Uuid, gateway: String },
    Denied { reason: String },
    Blocked { hook: String, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ApprovalError {
    #[error(transparent)]
    Forward(#[from] ForwardError),
    #[error(transparent)]
    Inject(#[from] InjectError),
}

/// Register the hooks every pipeline starts with, ahead of configured ones.
pub(crate) fn install_builtin_hooks(pipeline: &HookPipeline, audit: &Arc<AuditLogHook>) {
    pipeline.register(
        "source-metadata",
        HookPhase::PreInject,
        HookHandler::InProcess(Arc::new(SourceMetadataHook)),
    );
    pipeline.register(
        "audit-log",
        HookPhase::PostInject,
        HookHandler::InProcess(Arc::clone(audit) as Arc<dyn ferry_hooks::InProcessHook>),
    );
}

/// Entry point for every injection: route, hooks, queue, audit.
pub(crate) struct Injector {
    engine: PolicyEngine,
    forwards: ForwardManager,
    hooks: Arc<HookPipeline>,
    queues: Arc<ferry_queue::QueueManager>,
    audit: Arc<AuditLogHook>,
}

impl std::fmt::Debug for Injector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Injector")
            .field("queues", &self.queues)
            .finish_non_exhaustive()
    }
}

impl Injector {
    pub(crate) fn new(
        engine: PolicyEngine,
        hooks: Arc<HookPipeline>,
        queues: Arc<ferry_queue::QueueManager>,
        audit: Arc<AuditLogHook>,
    ) -> Self {
        Self {
            forwards: ForwardManager::new(engine.clone()),
            engine,
            hooks,
            queues,
            audit,
        }
    }

    pub(crate) fn forwards(&self) -> &ForwardManager {
        &self.forwards
    }

    /// Inject `message` into `session` on behalf of `source`.
    ///
    /// Policy denials and hook blocks are outcomes, not errors. Errors come
    /// from the queue or the executor.
    pub(crate) async fn inject(
        &self,
        session: &str,
        message: InjectMessage,
        source: InjectionSource,
        options: InjectOptions,
    ) -> Result<InjectOutcome, InjectError> {
        let span = info_span!(
            "inject",
            session,
            source = %source.label(),
            trust = %source.trust_level,
        );
        async {
            match self.forwards.route(&source, session) {
                Route::Direct => self.run_direct(session, message, source, options).await,
                Route::ViaGateway(gateway) => {
                    match self
                        .forwards
                        .create_request(source.clone(), session, message)
                    {
                        Ok(request) => Ok(InjectOutcome::Forwarded {
                            request_id: request.id,
                            gateway,
                        }),
                        Err(e) => {
                            let reason = e.to_string();
                            self.audit.record_denied(session, &source, &reason);
                            Ok(InjectOutcome::Denied { reason })
                        }
                    }
                }
                Route::Deny(reason) => {
                    info!(reason = %reason, "injection denied");
                    self.audit.record_denied(session, &source, &reason);
                    Ok(InjectOutcome::Denied { reason })
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Hooks, queue and post hooks for an injection that is already permitted.
    async fn run_direct(
        &self,
        session: &str,
        message: InjectMessage,
        source: InjectionSource,
        mut options: InjectOptions,
    ) -> Result<InjectOutcome, InjectError> {
        let context = HookContext::new(message, source.clone(), session);
        let (message, metadata) = match self.hooks.run_pre_inject(context).await {
            PreInjectOutcome::Allow { message, metadata } => (message, metadata),
            PreInjectOutcome::Blocked { hook, reason } => {
                self.audit.record_denied(session, &source, &reason);
                return Ok(InjectOutcome::Blocked { hook, reason });
            }
        };

        options.source = Some(source.clone());
        let submitted = self.queues.submit(session, message.clone(), options).await?;
        let inject_id = submitted.inject_id();
        debug!(?inject_id, "injection accepted");

        let result = match submitted.wait().await {
            Ok(result) => result,
            Err(e) => {
                let error = e.to_string();
                warn!(error = %error, "injection failed");
                self.audit
                    .record_failed(session, &source, inject_id, &error);
                return Err(e);
            }
        };

        let mut context = HookContext::new(message, source, session);
        context.metadata = metadata;
        if let Some(id) = inject_id {
            let value = serde_json::Value::String(id.to_string());
            context.metadata.insert("inject_id".to_owned(), value);
        }
        context.response = Some(result.response.clone());
        self.hooks.run_post_inject(&context).await;

        Ok(InjectOutcome::Completed { inject_id, result })
    }

    pub(crate) fn pending_forwards(&self) -> Vec<ForwardRequest> {
        self.forwards.get_pending_requests()
    }

    /// Approve a held forward as the owner and run it in its target session.
    pub(crate) async fn approve_forward(&self, id: Uuid) -> Result<InjectOutcome, ApprovalError> {
        let request = self
            .forwards
            .get_request(id)
            .ok_or(ForwardError::NotFound(id))?;
        let approver = create_cli_context(&self.engine, &request.gateway, None);
        self.forwards.approve_request(id, &approver)?;
        let (request, context) = self.forwards.complete_request(id)?;

        let span = info_span!("forward", request_id = %id, target = %request.to);
        let outcome = self
            .run_direct(
                &request.to,
                request.message,
                context.source().clone(),
                InjectOptions::default(),
            )
            .instrument(span)
            .await?;
        Ok(outcome)
    }

    pub(crate) fn reject_forward(
        &self,
        id: Uuid,
        reason: Option<String>,
    ) -> Result<ForwardRequest, ForwardError> {
        let request = self
            .forwards
            .get_request(id)
            .ok_or(ForwardError::NotFound(id))?;
        let approver = create_cli_context(&self.engine, &request.gateway, None);
        let request = self.forwards.reject_request(id, &approver, reason)?;
        let reason = request.reason.as_deref().unwrap_or("rejected");
        self.audit.record_denied(&request.to, &request.from, reason);
        Ok(request)
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use ferry_core::fakes::{FailingExecutor, FakeExecutor, MemoryAuditSink};
    use ferry_core::{SourceType, TrustLevel};
    use ferry_hooks::{HookResponse, InProcessHook};
    use ferry_policy::{ForwardStatus, GatewayRoute, SessionPolicy, StaticSessionConfig};
    use ferry_queue::QueueManager;

    struct Harness {
        injector: Injector,
        executor: Arc<FakeExecutor>,
        sink: Arc<MemoryAuditSink>,
        hooks: Arc<HookPipeline>,
    }

    fn harness(config: StaticSessionConfig) -> Harness {
        let engine = PolicyEngine::new(Arc::new(config));
        let executor = Arc::new(FakeExecutor::new());
        let queues = Arc::new(QueueManager::new());
        queues.set_executor(Arc::clone(&executor) as Arc<dyn ferry_core::Executor>);
        let sink = Arc::new(MemoryAuditSink::new());
        let audit = Arc::new(AuditLogHook::new(
            Arc::clone(&sink) as Arc<dyn ferry_core::AuditSink>,
            true,
            true,
        ));
        let hooks = Arc::new(HookPipeline::new());
        install_builtin_hooks(&hooks, &audit);
        Harness {
            injector: Injector::new(engine, Arc::clone(&hooks), queues, audit),
            executor,
            sink,
            hooks,
        }
    }

    fn gateway_config() -> StaticSessionConfig {
        StaticSessionConfig::new()
            .with_session(
                "inbox",
                SessionPolicy {
                    gateway: true,
                    forward_from: vec![TrustLevel::Untrusted],
                    ..SessionPolicy::default()
                },
            )
            .with_gateway(
                GatewayRoute::new("inbox")
                    .with_sources(&[SourceType::P2p])
                    .with_rule(TrustLevel::Untrusted, "support"),
            )
    }

    #[tokio::test]
    async fn owner_injection_runs_with_source_tag_and_audit() {
        let h = harness(StaticSessionConfig::new());
        let source = InjectionSource::cli(None);
        let outcome = h
            .injector
            .inject("main", "hi".into(), source, InjectOptions::default())
            .await
            .unwrap();

        let InjectOutcome::Completed { inject_id, result } = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert!(inject_id.is_some());
        assert_eq!(result.response, "echo: [From: cli | Trust: owner]\nhi");
        assert_eq!(h.executor.calls()[0].0, "main");

        let entries = h.sink.entries();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].allowed);
        assert_eq!(entries[0].inject_id, inject_id);
    }

    #[tokio::test]
    async fn failed_turn_still_leaves_an_audit_entry() {
        let queues = Arc::new(QueueManager::new());
        queues.set_executor(Arc::new(FailingExecutor::new("model offline")));
        let sink = Arc::new(MemoryAuditSink::new());
        let audit = Arc::new(AuditLogHook::new(
            Arc::clone(&sink) as Arc<dyn ferry_core::AuditSink>,
            true,
            true,
        ));
        let hooks = Arc::new(HookPipeline::new());
        install_builtin_hooks(&hooks, &audit);
        let engine = PolicyEngine::new(Arc::new(StaticSessionConfig::new()));
        let injector = Injector::new(engine, hooks, queues, audit);

        let source = InjectionSource::cli(None);
        let err = injector
            .inject("main", "hi".into(), source, InjectOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, InjectError::Executor(_)), "{err}");

        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].allowed);
        assert!(entries[0].inject_id.is_some());
        let reason = entries[0].reason.as_deref().unwrap();
        assert!(reason.contains("model offline"), "{reason}");
    }

    #[tokio::test]
    async fn untrusted_source_without_gateway_is_denied() {
        let h = harness(StaticSessionConfig::new());
        let source = InjectionSource::p2p("abcdef0123");
        let outcome = h
            .injector
            .inject("main", "hi".into(), source, InjectOptions::default())
            .await
            .unwrap();

        let InjectOutcome::Denied { reason } = outcome else {
            panic!("expected denial, got {outcome:?}");
        };
        assert!(reason.contains("requires trusted trust"), "{reason}");
        assert!(h.executor.calls().is_empty());
        let entries = h.sink.entries();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].allowed);
        assert_eq!(entries[0].source, "p2p:abcdef01");
    }

    #[tokio::test]
    async fn gateway_forward_waits_for_approval() {
        let h = harness(gateway_config());
        let source = InjectionSource::p2p("abcdef0123");
        let outcome = h
            .injector
            .inject("support", "help".into(), source, InjectOptions::default())
            .await
            .unwrap();

        let InjectOutcome::Forwarded { request_id, gateway } = outcome else {
            panic!("expected forward, got {outcome:?}");
        };
        assert_eq!(gateway, "inbox");
        assert!(h.executor.calls().is_empty());
        assert_eq!(h.injector.pending_forwards().len(), 1);

        let outcome = h.injector.approve_forward(request_id).await.unwrap();
        let InjectOutcome::Completed { result, .. } = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        let response = &result.response;
        assert!(response.contains("via inbox"), "{response}");
        assert!(response.contains("Trust: untrusted"), "{response}");
        assert_eq!(h.executor.calls()[0].0, "support");
        assert!(h.injector.pending_forwards().is_empty());
        assert_eq!(
            h.injector
                .forwards()
                .get_request(request_id)
                .unwrap()
                .status,
            ForwardStatus::Completed
        );
    }

    #[tokio::test]
    async fn rejected_forward_cannot_be_approved() {
        let h = harness(gateway_config());
        let source = InjectionSource::p2p("abcdef0123");
        let outcome = h
            .injector
            .inject("support", "help".into(), source, InjectOptions::default())
            .await
            .unwrap();
        let InjectOutcome::Forwarded { request_id, .. } = outcome else {
            panic!("expected forward, got {outcome:?}");
        };

        let rejected = h
            .injector
            .reject_forward(request_id, Some("spam".into()))
            .unwrap();
        assert_eq!(rejected.status, ForwardStatus::Rejected);
        assert_eq!(rejected.reason.as_deref(), Some("spam"));

        let err = h.injector.approve_forward(request_id).await.unwrap_err();
        assert!(matches!(
            err,
            ApprovalError::Forward(ForwardError::InvalidTransition { .. })
        ));
        assert!(h.executor.calls().is_empty());
    }

    #[tokio::test]
    async fn unknown_forward_is_not_found() {
        let h = harness(gateway_config());
        let err = h
            .injector
            .approve_forward(Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::Forward(ForwardError::NotFound(_))));
    }

    #[tokio::test]
    async fn blocking_hook_stops_injection() {
        struct NoSecrets;

        #[async_trait]
        impl InProcessHook for NoSecrets {
            async fn call(&self, context: &HookContext) -> Result<HookResponse> {
                if context.message.text().contains("password") {
                    Ok(HookResponse::block("looks like a secret"))
                } else {
                    Ok(HookResponse::allow())
                }
            }
        }

        let h = harness(StaticSessionConfig::new());
        h.hooks.register(
            "no-secrets",
            HookPhase::PreInject,
            HookHandler::InProcess(Arc::new(NoSecrets)),
        );

        let outcome = h
            .injector
            .inject(
                "main",
                "my password is hunter2".into(),
                InjectionSource::cli(None),
                InjectOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            InjectOutcome::Blocked {
                hook: "no-secrets".into(),
                reason: "looks like a secret".into(),
            }
        );
        assert!(h.executor.calls().is_empty());
        assert!(!h.sink.entries()[0].allowed);
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let json = serde_json::to_value(InjectOutcome::Denied {
            reason: "nope".into(),
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"status": "denied", "reason": "nope"})
        );
    }
}
