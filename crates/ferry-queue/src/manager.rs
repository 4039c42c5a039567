use ferry_core::{Executor, InjectError, InjectId, InjectMessage, InjectOptions, InjectResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::events::QueueEvent;
use crate::session::{InjectTicket, QueueStats, SessionQueue};

const GLOBAL_EVENT_CAPACITY: usize = 1024;

/// How an injection was accepted.
#[derive(Debug)]
pub enum Submitted {
    /// Delivered into the running turn; there is no separate result.
    Live,
    Queued(InjectTicket),
}

impl Submitted {
    pub fn inject_id(&self) -> Option<InjectId> {
        match self {
            Self::Live => None,
            Self::Queued(ticket) => Some(ticket.id()),
        }
    }

    pub async fn wait(self) -> Result<InjectResult, InjectError> {
        match self {
            Self::Live => Ok(InjectResult::live()),
            Self::Queued(ticket) => ticket.wait().await,
        }
    }
}

/// Owns one [`SessionQueue`] per session key.
pub struct QueueManager {
    executor: RwLock<Option<Arc<dyn Executor>>>,
    queues: Mutex<HashMap<String, Arc<SessionQueue>>>,
    events: broadcast::Sender<QueueEvent>,
    max_depth: Mutex<Option<usize>>,
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("has_executor", &self.has_executor())
            .field("sessions", &self.lock().len())
            .finish_non_exhaustive()
    }
}

impl Default for QueueManager {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueManager {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(GLOBAL_EVENT_CAPACITY);
        Self {
            executor: RwLock::new(None),
            queues: Mutex::new(HashMap::new()),
            events,
            max_depth: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_max_depth(self, max_depth: Option<usize>) -> Self {
        self.set_max_depth(max_depth);
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<SessionQueue>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> Vec<Arc<SessionQueue>> {
        self.lock().values().map(Arc::clone).collect()
    }

    /// Cap queued items per session for existing and future queues. `None` is unbounded.
    pub fn set_max_depth(&self, max_depth: Option<usize>) {
        *self.max_depth.lock().unwrap_or_else(PoisonError::into_inner) = max_depth;
        for queue in self.snapshot() {
            queue.set_max_depth(max_depth);
        }
    }

    pub fn set_executor(&self, executor: Arc<dyn Executor>) {
        for queue in self.snapshot() {
            queue.set_executor(Arc::clone(&executor));
        }
        *self.executor.write().unwrap_or_else(PoisonError::into_inner) = Some(executor);
    }

    pub fn has_executor(&self) -> bool {
        self.executor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// The queue for `session_key`, created on first use.
    pub fn queue(&self, session_key: &str) -> Result<Arc<SessionQueue>, InjectError> {
        let executor = self
            .executor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(InjectError::NoExecutor)?;
        let max_depth = *self.max_depth.lock().unwrap_or_else(PoisonError::into_inner);

        let mut queues = self.lock();
        let queue = queues.entry(session_key.to_owned()).or_insert_with(|| {
            debug!(session = session_key, "creating session queue");
            Arc::new(
                SessionQueue::new(session_key, executor)
                    .with_global_events(self.events.clone())
                    .with_max_depth(max_depth),
            )
        });
        Ok(Arc::clone(queue))
    }

    pub fn get_queue(&self, session_key: &str) -> Option<Arc<SessionQueue>> {
        self.lock().get(session_key).map(Arc::clone)
    }

    /// Accept an injection: into the live turn if possible, otherwise queued.
    pub async fn submit(
        &self,
        session_key: &str,
        message: InjectMessage,
        options: InjectOptions,
    ) -> Result<Submitted, InjectError> {
        let queue = self.queue(session_key)?;
        if queue.is_active() && queue.try_live_inject(&message, &options).await {
            return Ok(Submitted::Live);
        }
        queue.enqueue(message, options).map(Submitted::Queued)
    }

    /// Inject and wait for the result.
    pub async fn inject(
        &self,
        session_key: &str,
        message: InjectMessage,
        options: InjectOptions,
    ) -> Result<InjectResult, InjectError> {
        self.submit(session_key, message, options)
            .await?
            .wait()
            .await
    }

    pub fn cancel_active(&self, session_key: &str) -> bool {
        self.get_queue(session_key)
            .is_some_and(|queue| queue.cancel_active())
    }

    pub fn cancel_queued(&self, session_key: &str) -> usize {
        self.get_queue(session_key)
            .map_or(0, |queue| queue.cancel_queued())
    }

    pub fn cancel_all(&self, session_key: &str) -> usize {
        self.get_queue(session_key)
            .map_or(0, |queue| queue.cancel_all())
    }

    pub fn cancel(&self, session_key: &str, inject_id: InjectId) -> bool {
        self.get_queue(session_key)
            .is_some_and(|queue| queue.cancel(inject_id))
    }

    /// Cancel everything in every session. Returns how many injections were affected.
    pub fn cancel_everything(&self) -> usize {
        let count: usize = self.snapshot().iter().map(|queue| queue.cancel_all()).sum();
        if count > 0 {
            info!(count, "cancelled all injections");
        }
        count
    }

    pub fn stats(&self, session_key: &str) -> Option<QueueStats> {
        self.get_queue(session_key).map(|queue| queue.stats())
    }

    pub fn all_stats(&self) -> Vec<QueueStats> {
        let mut stats: Vec<_> = self.snapshot().iter().map(|queue| queue.stats()).collect();
        stats.sort_by(|a, b| a.session_key.cmp(&b.session_key));
        stats
    }

    /// Stats of sessions with queued or running work.
    pub fn active_stats(&self) -> Vec<QueueStats> {
        self.all_stats()
            .into_iter()
            .filter(|stats| stats.is_processing)
            .collect()
    }

    /// Events from every session queue.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Drop queues that have been idle for at least `max_idle`. Returns how many.
    ///
    /// A dropped queue is recreated on its next injection.
    pub fn cleanup(&self, max_idle: Duration) -> usize {
        let mut queues = self.lock();
        let before = queues.len();
        queues.retain(|_, queue| {
            queue.idle_for().is_none_or(|idle| idle < max_idle)
        });
        let removed = before - queues.len();
        drop(queues);
        if removed > 0 {
            debug!(removed, "removed idle session queues");
        }
        removed
    }

    pub fn session_keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}
