use anyhow::Result;
use async_trait::async_trait;
use ferry_core::TrustLevel;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::policy::{ExecOutput, NetworkMode, SandboxConfig};

const SANDBOX_TIMEOUT: Duration = Duration::from_secs(120);

/// Looks up who is currently driving a session.
///
/// Implemented by the security context registry. `None` means no context is
/// stored for the session, which the resolver treats as untrusted.
pub trait TrustLookup: Send + Sync {
    fn trust_for_session(&self, session: &str) -> Option<TrustLevel>;

    /// Sandbox config already resolved for the session, if any.
    fn sandbox_for_session(&self, _session: &str) -> Option<SandboxConfig> {
        None
    }
}

/// What the resolver asks an extension to materialise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxRequest {
    pub session_name: String,
    pub trust_level: TrustLevel,
    pub config: SandboxConfig,
}

/// A concrete execution context handed back by an extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxHandle {
    pub container: String,
    pub workdir: PathBuf,
    pub trust_level: TrustLevel,
    pub network: NetworkMode,
}

/// Provides actual isolation (containers, VMs, ...). Optional infrastructure.
#[async_trait]
pub trait SandboxExtension: Send + Sync {
    fn name(&self) -> &str;

    async fn resolve_context(&self, request: &SandboxRequest) -> Result<Option<SandboxHandle>>;

    async fn exec(
        &self,
        handle: &SandboxHandle,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput>;
}

/// Sandbox extensions installed in this process, by name.
#[derive(Default, Clone)]
pub struct SandboxExtensions {
    by_name: HashMap<String, Arc<dyn SandboxExtension>>,
}

impl SandboxExtensions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, extension: Arc<dyn SandboxExtension>) {
        self.by_name.insert(extension.name().to_owned(), extension);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SandboxExtension>> {
        self.by_name.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.by_name.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for SandboxExtensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxExtensions")
            .field("names", &self.names())
            .finish()
    }
}

/// Maps sessions to sandbox execution contexts.
pub struct SandboxResolver {
    trust: Arc<dyn TrustLookup>,
    extension: Option<Arc<dyn SandboxExtension>>,
    timeout: Duration,
}

impl std::fmt::Debug for SandboxResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let extension = self.extension.as_ref().map(|e| e.name().to_owned());
        f.debug_struct("SandboxResolver")
            .field("extension", &extension)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl SandboxResolver {
    pub fn new(trust: Arc<dyn TrustLookup>, extension: Option<Arc<dyn SandboxExtension>>) -> Self {
        Self {
            trust,
            extension,
            timeout: SANDBOX_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn has_extension(&self) -> bool {
        self.extension.is_some()
    }

    /// Trust level and sandbox config for a session. Missing context is untrusted.
    pub fn resolve_request(&self, session: &str) -> SandboxRequest {
        let trust_level = self.trust.trust_for_session(session).unwrap_or_else(|| {
            warn!(
                session,
                "no security context for session, falling back to untrusted sandbox"
            );
            TrustLevel::Untrusted
        });
        let config = self
            .trust
            .sandbox_for_session(session)
            .unwrap_or_else(|| SandboxConfig::default_for_trust(trust_level));

        SandboxRequest {
            session_name: session.to_owned(),
            trust_level,
            config,
        }
    }

    /// Materialise the sandbox for a session.
    ///
    /// Returns `Ok(None)` when no extension is installed or the extension
    /// declines; sandboxing is optional infrastructure.
    pub async fn get_sandbox_for_session(&self, session: &str) -> Result<Option<SandboxHandle>> {
        let request = self.resolve_request(session);
        let Some(extension) = &self.extension else {
            debug!(
                session,
                trust = %request.trust_level,
                "no sandbox extension installed"
            );
            return Ok(None);
        };

        debug!(
            session,
            trust = %request.trust_level,
            extension = extension.name(),
            network = ?request.config.network,
            "resolving sandbox context"
        );
        extension.resolve_context(&request).await
    }

    /// Run `command` inside the session's sandbox.
    ///
    /// Returns `Ok(None)` instead of running unsandboxed when there is no
    /// extension or no context could be materialised.
    pub async fn exec_in_sandbox(
        &self,
        session: &str,
        command: &str,
    ) -> Result<Option<ExecOutput>> {
        let Some(extension) = &self.extension else {
            debug!(session, "no sandbox extension installed, refusing to exec");
            return Ok(None);
        };
        let Some(handle) = self.get_sandbox_for_session(session).await? else {
            return Ok(None);
        };

        debug!(
            session,
            container = %handle.container,
            command_len = command.len(),
            "sandbox: exec"
        );
        extension
            .exec(&handle, command, self.timeout)
            .await
            .map(Some)
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::RecordingSandboxExtension;

    struct NoContexts;

    impl TrustLookup for NoContexts {
        fn trust_for_session(&self, _session: &str) -> Option<TrustLevel> {
            None
        }
    }

    #[test]
    fn missing_context_resolves_untrusted_defaults() {
        let resolver = SandboxResolver::new(Arc::new(NoContexts), None);
        let request = resolver.resolve_request("support");
        assert_eq!(request.trust_level, TrustLevel::Untrusted);
        assert_eq!(
            request.config,
            SandboxConfig::default_for_trust(TrustLevel::Untrusted)
        );
    }

    #[tokio::test]
    async fn no_extension_returns_none() {
        let resolver = SandboxResolver::new(Arc::new(NoContexts), None);
        let handle = resolver.get_sandbox_for_session("a").await.unwrap();
        assert!(handle.is_none());
        assert!(resolver.exec_in_sandbox("a", "ls").await.unwrap().is_none());
    }

    #[test]
    fn extensions_registry_by_name() {
        let mut extensions = SandboxExtensions::new();
        extensions.register(Arc::new(RecordingSandboxExtension::new()));
        assert!(extensions.get("recording").is_some());
        assert!(extensions.get("container").is_none());
        assert_eq!(extensions.names(), vec!["recording".to_owned()]);
    }
}
