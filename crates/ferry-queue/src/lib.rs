//! Per-session injection queues.
//!
//! Each session runs at most one injection at a time. Queued injections run
//! by priority, then in enqueue order. A message may skip the queue only by
//! going into a turn that is already streaming and has registered a live
//! handle.

pub mod events;
pub mod manager;
pub mod session;

pub use events::{QueueEvent, QueueEventKind};
pub use manager::{QueueManager, Submitted};
pub use session::{InjectTicket, QueueStats, SessionQueue};
