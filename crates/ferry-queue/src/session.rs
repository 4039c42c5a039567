use chrono::{DateTime, Utc};
use ferry_core::{
    CancelStage, ExecuteRequest, Executor, InjectError, InjectId, InjectMessage, InjectOptions,
    InjectResult, LiveInjector, LiveSlot,
};
use futures::FutureExt;
use serde::Serialize;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};
use uuid::Uuid;

use crate::events::{QueueEvent, QueueEventKind};

const EVENT_CAPACITY: usize = 256;

type Reply = oneshot::Sender<Result<InjectResult, InjectError>>;

struct QueuedInject {
    id: InjectId,
    message: InjectMessage,
    options: InjectOptions,
    queued_at: DateTime<Utc>,
    cancel: CancellationToken,
    reply: Reply,
}

struct ActiveInject {
    id: InjectId,
    started_at: Instant,
    cancel: CancellationToken,
    live: LiveSlot,
}

/// An injection taken off the queue, about to run.
struct Started {
    id: InjectId,
    message: InjectMessage,
    options: InjectOptions,
    cancel: CancellationToken,
    live: LiveSlot,
    reply: Reply,
}

struct State {
    /// Sorted by priority descending; equal priorities keep enqueue order.
    queued: VecDeque<QueuedInject>,
    active: Option<ActiveInject>,
    /// A run loop task exists for this queue.
    processing: bool,
    last_activity: Instant,
}

/// Waits for one queued injection to settle.
#[derive(Debug)]
pub struct InjectTicket {
    id: InjectId,
    rx: oneshot::Receiver<Result<InjectResult, InjectError>>,
}

impl InjectTicket {
    pub fn id(&self) -> InjectId {
        self.id
    }

    pub async fn wait(self) -> Result<InjectResult, InjectError> {
        let Self { id, rx } = self;
        rx.await.unwrap_or(Err(InjectError::Dropped(id)))
    }
}

/// Observability snapshot of one session queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub session_key: String,
    pub queue_depth: usize,
    pub is_processing: bool,
    pub active_inject_id: Option<InjectId>,
    pub active_duration_ms: Option<u64>,
    pub oldest_queued_at: Option<DateTime<Utc>>,
}

/// Serialises injections for one session.
pub struct SessionQueue {
    key: String,
    executor: RwLock<Arc<dyn Executor>>,
    state: Mutex<State>,
    events: broadcast::Sender<QueueEvent>,
    global_events: Option<broadcast::Sender<QueueEvent>>,
    /// Queued (not active) items allowed at once. 0 means unbounded.
    max_depth: AtomicUsize,
}

impl std::fmt::Debug for SessionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionQueue")
            .field("key", &self.key)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl SessionQueue {
    pub fn new(key: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            key: key.into(),
            executor: RwLock::new(executor),
            state: Mutex::new(State {
                queued: VecDeque::new(),
                active: None,
                processing: false,
                last_activity: Instant::now(),
            }),
            events,
            global_events: None,
            max_depth: AtomicUsize::new(0),
        }
    }

    /// Also publish every event on `sender`.
    #[must_use]
    pub fn with_global_events(mut self, sender: broadcast::Sender<QueueEvent>) -> Self {
        self.global_events = Some(sender);
        self
    }

    #[must_use]
    pub fn with_max_depth(self, max_depth: Option<usize>) -> Self {
        self.set_max_depth(max_depth);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn set_max_depth(&self, max_depth: Option<usize>) {
        self.max_depth
            .store(max_depth.unwrap_or(0), Ordering::Relaxed);
    }

    /// Executor used for injections that start after this call.
    pub fn set_executor(&self, executor: Arc<dyn Executor>) {
        *self.executor.write().unwrap_or_else(PoisonError::into_inner) = executor;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: QueueEvent) {
        if let Some(global) = &self.global_events {
            let _ = global.send(event.clone());
        }
        let _ = self.events.send(event);
    }

    /// Queue an injection. Starts the run loop if the session is idle.
    pub fn enqueue(
        self: &Arc<Self>,
        message: InjectMessage,
        options: InjectOptions,
    ) -> Result<InjectTicket, InjectError> {
        let id = Uuid::new_v4();
        let (reply, rx) = oneshot::channel();
        let priority = options.priority;

        let (start, depth) = {
            let mut state = self.lock();
            let max_depth = self.max_depth.load(Ordering::Relaxed);
            if max_depth > 0 && state.queued.len() >= max_depth {
                return Err(InjectError::QueueFull {
                    session_key: self.key.clone(),
                    depth: state.queued.len(),
                });
            }

            let position = state
                .queued
                .iter()
                .position(|queued| queued.options.priority < priority)
                .unwrap_or(state.queued.len());
            state.queued.insert(
                position,
                QueuedInject {
                    id,
                    message,
                    options,
                    queued_at: Utc::now(),
                    cancel: CancellationToken::new(),
                    reply,
                },
            );
            state.last_activity = Instant::now();
            self.emit(
                QueueEvent::new(QueueEventKind::Enqueue, &self.key, id)
                    .with_detail(format!("priority {priority}")),
            );

            let start = !state.processing;
            state.processing = true;
            (start, state.queued.len())
        };

        debug!(
            session = %self.key,
            inject_id = %id,
            priority,
            depth,
            "injection queued"
        );
        if start {
            let queue = Arc::clone(self);
            tokio::spawn(async move { queue.run().await });
        }
        Ok(InjectTicket { id, rx })
    }

    /// Pop the next item and mark it active, or mark the queue idle.
    fn take_next(&self, state: &mut State) -> Option<Started> {
        let Some(next) = state.queued.pop_front() else {
            state.active = None;
            state.processing = false;
            return None;
        };

        let live = LiveSlot::new();
        state.active = Some(ActiveInject {
            id: next.id,
            started_at: Instant::now(),
            cancel: next.cancel.clone(),
            live: live.clone(),
        });
        self.emit(QueueEvent::new(QueueEventKind::Dequeue, &self.key, next.id));
        self.emit(QueueEvent::new(QueueEventKind::Start, &self.key, next.id));

        Some(Started {
            id: next.id,
            message: next.message,
            options: next.options,
            cancel: next.cancel,
            live,
            reply: next.reply,
        })
    }

    async fn run(self: Arc<Self>) {
        let mut next = {
            let mut state = self.lock();
            self.take_next(&mut state)
        };

        while let Some(started) = next {
            let Started {
                id,
                message,
                options,
                cancel,
                live,
                reply,
            } = started;
            let outcome = self.execute(id, message, options, cancel, live).await;
            next = self.settle(id, reply, outcome);
        }
        debug!(session = %self.key, "queue drained");
    }

    async fn execute(
        &self,
        id: InjectId,
        message: InjectMessage,
        options: InjectOptions,
        cancel: CancellationToken,
        live: LiveSlot,
    ) -> Result<InjectResult, InjectError> {
        let executor = {
            let current = self.executor.read().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(&*current)
        };
        let request = ExecuteRequest {
            inject_id: id,
            session_key: self.key.clone(),
            message,
            options,
            cancel: cancel.clone(),
            live,
        };

        let span = info_span!("execute", session = %self.key, inject_id = %id);
        match AssertUnwindSafe(executor.execute(request))
            .catch_unwind()
            .instrument(span)
            .await
        {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) if cancel.is_cancelled() => Err(InjectError::Cancelled {
                inject_id: id,
                stage: CancelStage::Active,
                reason: format!("stopped on request: {e:#}"),
            }),
            Ok(Err(e)) => Err(InjectError::Executor(e)),
            Err(_panic) => {
                warn!(session = %self.key, inject_id = %id, "executor panicked");
                Err(InjectError::Executor(anyhow::anyhow!("executor panicked")))
            }
        }
    }

    /// Record the outcome, start the next item, then wake the caller.
    ///
    /// The next item is already active by the time the caller sees its result.
    fn settle(
        &self,
        id: InjectId,
        reply: Reply,
        outcome: Result<InjectResult, InjectError>,
    ) -> Option<Started> {
        let next = {
            let mut state = self.lock();
            state.active = None;
            state.last_activity = Instant::now();
            let event = match &outcome {
                Ok(_) => QueueEvent::new(QueueEventKind::Complete, &self.key, id),
                Err(e) if e.is_cancelled() => {
                    QueueEvent::new(QueueEventKind::Cancel, &self.key, id)
                        .with_detail(e.to_string())
                }
                Err(e) => {
                    QueueEvent::new(QueueEventKind::Error, &self.key, id)
                        .with_detail(e.to_string())
                }
            };
            self.emit(event);
            self.take_next(&mut state)
        };

        match &outcome {
            Ok(_) => debug!(session = %self.key, inject_id = %id, "injection complete"),
            Err(e) => debug!(
                session = %self.key,
                inject_id = %id,
                error = %e,
                "injection failed"
            ),
        }
        if reply.send(outcome).is_err() {
            debug!(
                session = %self.key,
                inject_id = %id,
                "caller stopped waiting"
            );
        }
        next
    }

    /// Push `message` into the running turn instead of queueing it.
    ///
    /// Only possible while an active injection has a live handle registered
    /// and `options` allow it. Returns false when the caller must enqueue.
    pub async fn try_live_inject(&self, message: &InjectMessage, options: &InjectOptions) -> bool {
        if !options.allow_live_inject {
            return false;
        }
        let target = {
            let state = self.lock();
            state
                .active
                .as_ref()
                .filter(|active| !active.cancel.is_cancelled())
                .and_then(|active| {
                    active.live.current().map(|handle| (active.id, handle))
                })
        };
        let Some((active_id, handle)) = target else {
            return false;
        };

        match handle.inject(&self.key, message).await {
            Ok(()) => {
                let event = QueueEvent::new(QueueEventKind::V2Inject, &self.key, active_id);
                self.emit(event);
                debug!(
                    session = %self.key,
                    inject_id = %active_id,
                    "message injected into live turn"
                );
                true
            }
            Err(e) => {
                debug!(
                    session = %self.key,
                    error = %e,
                    "live inject failed, falling back to queue"
                );
                false
            }
        }
    }

    /// Register the live handle of the active injection. False when nothing is active.
    pub fn set_active_generator(&self, handle: Arc<dyn LiveInjector>) -> bool {
        let state = self.lock();
        match &state.active {
            Some(active) => {
                active.live.register(handle);
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.lock().active.is_some()
    }

    fn reject_queued(&self, item: QueuedInject, reason: &str) {
        item.cancel.cancel();
        let event = QueueEvent::new(QueueEventKind::Cancel, &self.key, item.id).with_detail(reason);
        self.emit(event);
        let _ = item.reply.send(Err(InjectError::Cancelled {
            inject_id: item.id,
            stage: CancelStage::Queued,
            reason: reason.to_owned(),
        }));
    }

    /// Signal the active injection to stop. False when there is nothing to cancel.
    pub fn cancel_active(&self) -> bool {
        let state = self.lock();
        match &state.active {
            Some(active) if !active.cancel.is_cancelled() => {
                active.cancel.cancel();
                debug!(
                    session = %self.key,
                    inject_id = %active.id,
                    "cancellation signalled"
                );
                true
            }
            _ => false,
        }
    }

    /// Reject every queued injection without running it. Returns how many.
    pub fn cancel_queued(&self) -> usize {
        let drained: Vec<_> = self.lock().queued.drain(..).collect();
        let count = drained.len();
        for item in drained {
            self.reject_queued(item, "queue cleared");
        }
        count
    }

    pub fn cancel_all(&self) -> usize {
        let queued = self.cancel_queued();
        queued + usize::from(self.cancel_active())
    }

    /// Cancel one injection, queued or active.
    pub fn cancel(&self, inject_id: InjectId) -> bool {
        let removed = {
            let mut state = self.lock();
            if let Some(position) = state.queued.iter().position(|item| item.id == inject_id) {
                state.queued.remove(position)
            } else {
                return match &state.active {
                    Some(active) if active.id == inject_id && !active.cancel.is_cancelled() => {
                        active.cancel.cancel();
                        true
                    }
                    _ => false,
                };
            }
        };
        match removed {
            Some(item) => {
                self.reject_queued(item, "cancelled before start");
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        QueueStats {
            session_key: self.key.clone(),
            queue_depth: state.queued.len(),
            is_processing: state.processing,
            active_inject_id: state.active.as_ref().map(|active| active.id),
            active_duration_ms: state.active.as_ref().map(|active| {
                u64::try_from(active.started_at.elapsed().as_millis()).unwrap_or(u64::MAX)
            }),
            oldest_queued_at: state.queued.iter().map(|item| item.queued_at).min(),
        }
    }

    /// Time since the last enqueue or settle, if nothing is queued or running.
    pub fn idle_for(&self) -> Option<Duration> {
        let state = self.lock();
        let idle = !state.processing && state.active.is_none() && state.queued.is_empty();
        idle.then(|| state.last_activity.elapsed())
    }
}
