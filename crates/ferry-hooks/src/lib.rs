//! Pre- and post-inject hooks.
//!
//! Hooks run in registration order. A pre-inject hook may rewrite the
//! message, attach metadata, or block the injection; post-inject hooks only
//! observe. A failing hook never blocks anything.

pub mod builtin;
pub mod command;
pub mod pipeline;
pub mod types;

pub use builtin::{AuditLogHook, SourceMetadataHook, add_source_metadata};
pub use pipeline::{HookHandler, HookPipeline, InProcessHook, PreInjectOutcome};
pub use types::{HookConfig, HookContext, HookPhase, HookResponse, Metadata};
