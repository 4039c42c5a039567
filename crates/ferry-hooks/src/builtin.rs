//! Hooks that ship with the daemon.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use ferry_core::{AuditEntry, AuditSink, InjectId, InjectionSource};
use std::sync::Arc;

use crate::pipeline::InProcessHook;
use crate::types::{HookContext, HookResponse};

/// Prefix a message with where it came from, e.g.
/// `[From: cron:nightly | Trust: trusted]`.
pub fn add_source_metadata(context: &HookContext) -> HookResponse {
    let source = &context.source;
    let from = match &source.forwarded {
        Some(forwarded) => format!(
            "{} via {}",
            forwarded.original.label(),
            forwarded.gateway_session
        ),
        None => source.label(),
    };
    let tagged = format!(
        "[From: {from} | Trust: {}]\n{}",
        source.trust_level,
        context.message.text()
    );
    HookResponse::allow().with_message(context.message.clone().with_text(tagged))
}

/// [`add_source_metadata`] as a pre-inject hook.
#[derive(Debug, Default, Clone, Copy)]
pub struct SourceMetadataHook;

#[async_trait]
impl InProcessHook for SourceMetadataHook {
    async fn call(&self, context: &HookContext) -> Result<HookResponse> {
        Ok(add_source_metadata(context))
    }
}

/// Writes audit entries for allowed, failed and denied injections.
///
/// As a post-inject hook it records completed injections; the entry point
/// calls [`AuditLogHook::record_denied`] for injections that never got that far
/// and [`AuditLogHook::record_failed`] for permitted ones whose turn errored.
pub struct AuditLogHook {
    sink: Arc<dyn AuditSink>,
    log_success: bool,
    log_denied: bool,
}

impl std::fmt::Debug for AuditLogHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogHook")
            .field("log_success", &self.log_success)
            .field("log_denied", &self.log_denied)
            .finish_non_exhaustive()
    }
}

impl AuditLogHook {
    pub fn new(sink: Arc<dyn AuditSink>, log_success: bool, log_denied: bool) -> Self {
        Self {
            sink,
            log_success,
            log_denied,
        }
    }

    pub fn record_allowed(
        &self,
        session: &str,
        source: &InjectionSource,
        inject_id: Option<InjectId>,
    ) {
        if !self.log_success {
            return;
        }
        self.sink.record(&AuditEntry {
            timestamp: Utc::now(),
            session: session.to_owned(),
            source: source.label(),
            trust: source.trust_level,
            allowed: true,
            reason: None,
            inject_id,
        });
    }

    pub fn record_denied(&self, session: &str, source: &InjectionSource, reason: &str) {
        if !self.log_denied {
            return;
        }
        self.sink.record(&AuditEntry {
            timestamp: Utc::now(),
            session: session.to_owned(),
            source: source.label(),
            trust: source.trust_level,
            allowed: false,
            reason: Some(reason.to_owned()),
            inject_id: None,
        });
    }

    /// A permitted injection whose turn did not complete. Logged when either
    /// kind of entry is enabled.
    pub fn record_failed(
        &self,
        session: &str,
        source: &InjectionSource,
        inject_id: Option<InjectId>,
        error: &str,
    ) {
        if !self.log_success && !self.log_denied {
            return;
        }
        self.sink.record(&AuditEntry {
            timestamp: Utc::now(),
            session: session.to_owned(),
            source: source.label(),
            trust: source.trust_level,
            allowed: true,
            reason: Some(error.to_owned()),
            inject_id,
        });
    }
}

#[async_trait]
impl InProcessHook for AuditLogHook {
    async fn call(&self, context: &HookContext) -> Result<HookResponse> {
        let inject_id = context
            .metadata
            .get("inject_id")
            .and_then(serde_json::Value::as_str)
            .and_then(|id| id.parse().ok());
        self.record_allowed(&context.target_session, &context.source, inject_id);
        Ok(HookResponse::allow())
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::fakes::MemoryAuditSink;
    use ferry_core::{ContentPart, Forwarded, InjectMessage, TrustLevel};

    #[test]
    fn tags_message_with_source() {
        let source = InjectionSource::cron("nightly");
        let context = HookContext::new("status?".into(), source, "reports");
        let response = add_source_metadata(&context);
        assert_eq!(
            response.message.unwrap().text(),
            "[From: cron:nightly | Trust: trusted]\nstatus?"
        );
    }

    #[test]
    fn tags_forwarded_message_with_gateway() {
        let mut source = InjectionSource::gateway("inbox").with_trust(TrustLevel::Untrusted);
        source.forwarded = Some(Box::new(Forwarded {
            gateway_session: "inbox".into(),
            request_id: InjectId::new_v4(),
            original: InjectionSource::p2p("0123456789"),
        }));
        let context = HookContext::new("hi".into(), source, "support");
        let text = add_source_metadata(&context).message.unwrap().text();
        let tag = "[From: p2p:01234567 via inbox | Trust: untrusted]";
        assert!(text.starts_with(tag));
    }

    #[test]
    fn tagging_keeps_images() {
        let message = InjectMessage::Parts(vec![
            ContentPart::Text {
                text: "look".into(),
            },
            ContentPart::Image {
                media_type: "image/png".into(),
                data: "AAAA".into(),
            },
        ]);
        let context = HookContext::new(message, InjectionSource::daemon(), "main");
        match add_source_metadata(&context).message.unwrap() {
            InjectMessage::Parts(parts) => assert_eq!(parts.len(), 2),
            InjectMessage::Text(_) => panic!("expected parts"),
        }
    }

    #[test]
    fn audit_flags_are_independent() {
        let sink = Arc::new(MemoryAuditSink::new());
        let quiet_success = AuditLogHook::new(Arc::clone(&sink) as Arc<dyn AuditSink>, false, true);
        quiet_success.record_allowed("main", &InjectionSource::daemon(), None);
        quiet_success.record_denied("main", &InjectionSource::p2p("k"), "min trust");
        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].allowed);
        assert_eq!(entries[0].reason.as_deref(), Some("min trust"));
        assert_eq!(entries[0].trust, TrustLevel::Untrusted);
    }

    #[tokio::test]
    async fn audit_hook_records_inject_id() {
        let sink = Arc::new(MemoryAuditSink::new());
        let hook = AuditLogHook::new(Arc::clone(&sink) as Arc<dyn AuditSink>, true, true);
        let id = InjectId::new_v4();
        let source = InjectionSource::cron("nightly");
        let mut context = HookContext::new("hi".into(), source, "reports");
        let value = serde_json::Value::String(id.to_string());
        context.metadata.insert("inject_id".into(), value);
        hook.call(&context).await.unwrap();
        assert_eq!(sink.entries()[0].inject_id, Some(id));
        assert_eq!(sink.entries()[0].source, "cron:nightly");
    }
}
