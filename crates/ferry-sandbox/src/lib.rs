//! Sandbox selection for tool execution.
//!
//! Maps a session's trust level to a sandbox configuration and hands the
//! actual isolation to an optional extension (e.g. a container runtime).
//! With no extension installed nothing is sandboxed and nothing is executed.

pub mod container;
pub mod fakes;
pub mod policy;
pub mod resolver;

pub use container::{ContainerExtension, ContainerSettings};
pub use policy::{
    ExecOutput, NetworkMode, SandboxConfig, SandboxMode, SandboxOverride, WorkspaceAccess,
    parse_memory_size,
};
pub use resolver::{
    SandboxExtension, SandboxExtensions, SandboxHandle, SandboxRequest, SandboxResolver,
    TrustLookup,
};
