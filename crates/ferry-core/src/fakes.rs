//! Fake implementations for testing.
#![allow(clippy::unwrap_used)]

use crate::traits::{AuditSink, ExecuteRequest, Executor, LiveInjector};
use crate::types::{AuditEntry, InjectMessage, InjectResult};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Semaphore;

// ---------------------------------------------------------------------------
// FakeExecutor
// ---------------------------------------------------------------------------

/// Executor that answers immediately with `echo: <text>`.
#[derive(Debug, Default)]
pub struct FakeExecutor {
    pub calls: Mutex<Vec<(String, String)>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(session_key, message text)` for every call, in order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn execute(&self, request: ExecuteRequest) -> Result<InjectResult> {
        let text = request.message.text();
        self.calls
            .lock()
            .unwrap()
            .push((request.session_key.clone(), text.clone()));
        if let Some(stream) = &request.options.stream {
            let _ = stream.send(format!("echo: {text}")).await;
        }
        Ok(InjectResult {
            response: format!("echo: {text}"),
            session_id: Some(request.session_key),
            cost: Some(0.0),
            live: false,
        })
    }
}

// ---------------------------------------------------------------------------
// GatedExecutor
// ---------------------------------------------------------------------------

/// Executor that blocks every call until the test releases it.
///
/// Tracks start order and the highest number of calls that were ever in
/// flight at once, so tests can assert per-session mutual exclusion.
pub struct GatedExecutor {
    gate: Semaphore,
    started: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    live: Mutex<Option<Arc<dyn LiveInjector>>>,
}

impl std::fmt::Debug for GatedExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatedExecutor")
            .field("started", &self.started())
            .finish_non_exhaustive()
    }
}

impl Default for GatedExecutor {
    fn default() -> Self {
        Self {
            gate: Semaphore::new(0),
            started: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            live: Mutex::new(None),
        }
    }
}

impl GatedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` as the live injector of every turn this executor runs.
    #[must_use]
    pub fn with_live(self, handle: Arc<dyn LiveInjector>) -> Self {
        *self.live.lock().unwrap() = Some(handle);
        self
    }

    /// Let `n` blocked (or future) calls finish.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    /// Message texts in the order their executions started.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Executor for GatedExecutor {
    async fn execute(&self, request: ExecuteRequest) -> Result<InjectResult> {
        let text = request.message.text();
        self.started.lock().unwrap().push(text.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let live = self.live.lock().unwrap().clone();
        if let Some(handle) = live {
            request.live.register(handle);
        }

        let outcome = tokio::select! {
            permit = self.gate.acquire() => {
                if let Ok(permit) = permit {
                    permit.forget();
                }
                Ok(InjectResult::text(format!("done: {text}")))
            }
            () = request.cancel.cancelled() => Err(anyhow::anyhow!("turn stopped")),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

// ---------------------------------------------------------------------------
// FailingExecutor
// ---------------------------------------------------------------------------

/// Executor that always fails with the given message.
#[derive(Debug)]
pub struct FailingExecutor {
    pub message: String,
}

impl FailingExecutor {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl Executor for FailingExecutor {
    async fn execute(&self, _request: ExecuteRequest) -> Result<InjectResult> {
        anyhow::bail!("{}", self.message)
    }
}

// ---------------------------------------------------------------------------
// FakeLiveInjector
// ---------------------------------------------------------------------------

/// Live injector that records what it receives; can be told to fail.
#[derive(Debug, Default)]
pub struct FakeLiveInjector {
    pub received: Mutex<Vec<String>>,
    pub fail: std::sync::atomic::AtomicBool,
}

impl FakeLiveInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let injector = Self::default();
        injector.fail.store(true, Ordering::SeqCst);
        injector
    }

    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl LiveInjector for FakeLiveInjector {
    async fn inject(&self, _session_key: &str, message: &InjectMessage) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("generator closed");
        }
        self.received.lock().unwrap().push(message.text());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryAuditSink
// ---------------------------------------------------------------------------

/// Audit sink that keeps entries in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    pub entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().unwrap().clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, entry: &AuditEntry) {
        self.entries.lock().unwrap().push(entry.clone());
    }
}
