use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use ferry_hooks::HookConfig;
use ferry_policy::{GatewayRoute, SessionPolicy};
use ferry_sandbox::ContainerSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Config shared between the watcher and everything that reads it per request.
pub(crate) type SharedConfig = Arc<ArcSwap<Config>>;

pub(crate) fn shared_config(config: Config) -> SharedConfig {
    Arc::new(ArcSwap::from_pointee(config))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Config {
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub sandbox: SandboxSettings,
    #[serde(default)]
    pub sessions: Vec<SessionEntry>,
    #[serde(default)]
    pub gateways: Vec<GatewayRoute>,
    #[serde(default)]
    pub hooks: Vec<HookConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ExecutorConfig {
    /// Program and arguments. Gets the message on stdin, answers on stdout.
    pub command: Vec<String>,
    #[serde(default = "default_executor_timeout")]
    pub timeout_secs: u64,
}

fn default_executor_timeout() -> u64 {
    600
}

impl ExecutorConfig {
    pub(crate) fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct QueueConfig {
    /// Queued items allowed per session. Unbounded when absent.
    #[serde(default)]
    pub max_depth: Option<usize>,
    #[serde(default = "default_idle_cleanup")]
    pub idle_cleanup_secs: u64,
}

fn default_idle_cleanup() -> u64 {
    600
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_depth: None,
            idle_cleanup_secs: default_idle_cleanup(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct AuditConfig {
    #[serde(default = "default_true")]
    pub log_success: bool,
    #[serde(default = "default_true")]
    pub log_denied: bool,
}

fn default_true() -> bool {
    true
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log_success: true,
            log_denied: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SandboxSettings {
    /// Name of the sandbox extension. No sandboxing when absent.
    #[serde(default)]
    pub extension: Option<String>,
    #[serde(default = "default_runtime")]
    pub runtime: String,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_sandbox_workspace")]
    pub workspace: String,
}

fn default_runtime() -> String {
    "docker".to_owned()
}

fn default_image() -> String {
    "ubuntu:24.04".to_owned()
}

fn default_sandbox_workspace() -> String {
    "./workspaces".to_owned()
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            extension: None,
            runtime: default_runtime(),
            image: default_image(),
            workspace: default_sandbox_workspace(),
        }
    }
}

impl SandboxSettings {
    pub(crate) fn container_settings(&self, base_dir: &Path) -> ContainerSettings {
        let workspace = PathBuf::from(&self.workspace);
        ContainerSettings {
            runtime: self.runtime.clone(),
            image: self.image.clone(),
            workspace: if workspace.is_absolute() {
                workspace
            } else {
                base_dir.join(workspace)
            },
        }
    }
}

/// One `[[sessions]]` entry: a name plus its policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SessionEntry {
    pub name: String,
    #[serde(flatten)]
    pub policy: SessionPolicy,
}

impl Config {
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    pub(crate) fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub(crate) fn session(&self, name: &str) -> Option<&SessionPolicy> {
        self.sessions
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| &entry.policy)
    }

    /// Resolve config path: check arg, then default locations.
    pub(crate) fn find_config_path(explicit: Option<&str>) -> PathBuf {
        if let Some(p) = explicit {
            return PathBuf::from(p);
        }

        let local = PathBuf::from("ferry.toml");
        if local.exists() {
            return local;
        }

        if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
            let xdg = PathBuf::from(config_dir).join("ferry/ferry.toml");
            if xdg.exists() {
                return xdg;
            }
        }

        if let Ok(home) = std::env::var("HOME") {
            let home_config = PathBuf::from(home).join(".config/ferry/ferry.toml");
            if home_config.exists() {
                return home_config;
            }
        }

        local
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::{SourceType, TrustLevel};
    use ferry_hooks::HookPhase;
    use ferry_sandbox::NetworkMode;

    #[test]
    fn parse_minimal_config() {
        let config = Config::parse("[executor]\ncommand = [\"cat\"]\n").unwrap();
        assert_eq!(config.executor.command, vec!["cat"]);
        assert_eq!(config.executor.timeout_secs, 600);
        assert!(config.queue.max_depth.is_none());
        assert_eq!(config.queue.idle_cleanup_secs, 600);
        assert!(config.audit.log_success && config.audit.log_denied);
        assert!(config.sandbox.extension.is_none());
        assert!(config.sessions.is_empty());
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[executor]
command = ["claude", "-p"]
timeout_secs = 120

[queue]
max_depth = 32

[audit]
log_success = false

[sandbox]
extension = "container"
runtime = "podman"

[[sessions]]
name = "main"
min_trust = "owner"
tools = { deny = ["bash"] }
capabilities = { grant = ["cross.inject"] }
sandbox = { network = "none", workspace_access = "ro", memory = "1g" }

[[sessions]]
name = "inbox"
gateway = true
forward_from = ["untrusted", "semi-trusted"]

[[gateways]]
session = "inbox"
sources = ["p2p", "p2p-discovery"]
rules = [{ min_trust = "untrusted", target = "support" }]

[[hooks]]
name = "redact"
phase = "pre-inject"
command = ["./hooks/redact.sh"]
"#;
        let config = Config::parse(toml).unwrap();
        assert_eq!(config.queue.max_depth, Some(32));
        assert!(!config.audit.log_success);
        assert!(config.audit.log_denied);
        assert_eq!(config.sandbox.runtime, "podman");

        let main = config.session("main").unwrap();
        assert_eq!(main.min_trust, TrustLevel::Owner);
        assert_eq!(main.tools.deny, vec!["bash"]);
        assert_eq!(main.capabilities.grant, vec!["cross.inject"]);
        let sandbox = main.sandbox.as_ref().unwrap();
        assert_eq!(sandbox.network, Some(NetworkMode::None));
        assert_eq!(sandbox.memory.as_deref(), Some("1g"));

        let inbox = config.session("inbox").unwrap();
        assert!(inbox.gateway);
        assert_eq!(
            inbox.forward_from,
            vec![TrustLevel::Untrusted, TrustLevel::SemiTrusted]
        );
        assert_eq!(inbox.min_trust, TrustLevel::Trusted);

        assert_eq!(
            config.gateways[0].sources,
            vec![SourceType::P2p, SourceType::P2pDiscovery]
        );
        assert_eq!(config.gateways[0].request_ttl_secs, 3600);
        assert_eq!(config.hooks[0].phase, HookPhase::PreInject);
        assert!(config.hooks[0].enabled);
    }

    #[test]
    fn executor_section_is_required() {
        assert!(Config::parse("[queue]\nmax_depth = 1\n").is_err());
    }

    #[test]
    fn relative_sandbox_workspace_follows_config_dir() {
        let settings = SandboxSettings::default();
        let container = settings.container_settings(Path::new("/etc/ferry"));
        assert_eq!(
            container.workspace,
            PathBuf::from("/etc/ferry/./workspaces")
        );
        assert_eq!(container.runtime, "docker");
    }
}
