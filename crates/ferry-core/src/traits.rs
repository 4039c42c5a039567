//! Contracts between the injection pipeline and its collaborators.
//!
//! The pipeline never knows how a response is produced or how a message got
//! here; it only talks to these traits.

use crate::types::{AuditEntry, InjectId, InjectMessage, InjectOptions, InjectResult};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Everything an executor gets for one injection.
#[derive(Debug)]
pub struct ExecuteRequest {
    pub inject_id: InjectId,
    pub session_key: String,
    pub message: InjectMessage,
    pub options: InjectOptions,
    /// Cancelled when the caller asks to stop. Cooperative: the executor
    /// checks it at safe points and stops forwarding output.
    pub cancel: CancellationToken,
    /// Register a live handle here to accept follow-up messages mid-turn.
    pub live: LiveSlot,
}

/// Produces a response for one injection. Opaque to the pipeline.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, request: ExecuteRequest) -> Result<InjectResult>;
}

// ---------------------------------------------------------------------------
// Live inject
// ---------------------------------------------------------------------------

/// A handle into an already-streaming turn that can take more input.
#[async_trait]
pub trait LiveInjector: Send + Sync {
    async fn inject(&self, session_key: &str, message: &InjectMessage) -> Result<()>;
}

/// Slot an executor fills while its turn is streaming.
///
/// The queue owns one slot per active injection and drops it when the
/// injection settles, so a stale handle can never outlive its turn.
#[derive(Clone, Default)]
pub struct LiveSlot {
    inner: Arc<Mutex<Option<Arc<dyn LiveInjector>>>>,
}

impl LiveSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: Arc<dyn LiveInjector>) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    pub fn clear(&self) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn current(&self) -> Option<Arc<dyn LiveInjector>> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_registered(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl std::fmt::Debug for LiveSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveSlot")
            .field("registered", &self.is_registered())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

/// Receives structured audit entries for allowed and denied injections.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &AuditEntry);
}

/// Audit sink that writes entries to the `ferry::audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, entry: &AuditEntry) {
        if let (true, Some(error)) = (entry.allowed, entry.reason.as_deref()) {
            tracing::warn!(
                target: "ferry::audit",
                session = %entry.session,
                source = %entry.source,
                trust = %entry.trust,
                inject_id = ?entry.inject_id,
                error,
                "injection failed"
            );
        } else if entry.allowed {
            tracing::info!(
                target: "ferry::audit",
                session = %entry.session,
                source = %entry.source,
                trust = %entry.trust,
                inject_id = ?entry.inject_id,
                "injection allowed"
            );
        } else {
            tracing::info!(
                target: "ferry::audit",
                session = %entry.session,
                source = %entry.source,
                trust = %entry.trust,
                reason = entry.reason.as_deref().unwrap_or(""),
                "injection denied"
            );
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl LiveInjector for Noop {
        async fn inject(&self, _session_key: &str, _message: &InjectMessage) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn live_slot_register_and_clear() {
        let slot = LiveSlot::new();
        assert!(!slot.is_registered());
        slot.register(Arc::new(Noop));
        assert!(slot.is_registered());
        assert!(slot.clone().current().is_some());
        slot.clear();
        assert!(slot.current().is_none());
    }
}
