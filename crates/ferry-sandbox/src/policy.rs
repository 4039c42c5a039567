use ferry_core::TrustLevel;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Which sessions a sandbox applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxMode {
    Off,
    /// Every session except the main one.
    NonMain,
    All,
}

/// Network access inside the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkMode {
    /// Empty network namespace.
    None,
    /// Outbound internet only, no access to the host or LAN.
    Restricted,
    Full,
}

/// How the workspace directory is mounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceAccess {
    None,
    Ro,
    Rw,
}

/// Isolation requirement for tool execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub enabled: bool,
    pub mode: SandboxMode,
    pub network: NetworkMode,
    pub workspace_access: WorkspaceAccess,
    /// Memory limit in bytes. 0 = no limit.
    pub memory_limit: u64,
    /// Max number of PIDs (fork bomb protection). 0 = no limit.
    pub pids_limit: u32,
}

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

impl SandboxConfig {
    /// Default sandbox for a trust level. The less trusted, the tighter.
    pub fn default_for_trust(trust: TrustLevel) -> Self {
        match trust {
            TrustLevel::Owner => Self {
                enabled: false,
                mode: SandboxMode::Off,
                network: NetworkMode::Full,
                workspace_access: WorkspaceAccess::Rw,
                memory_limit: 0,
                pids_limit: 0,
            },
            TrustLevel::Trusted => Self {
                enabled: true,
                mode: SandboxMode::NonMain,
                network: NetworkMode::Full,
                workspace_access: WorkspaceAccess::Rw,
                memory_limit: 2 * GIB,
                pids_limit: 512,
            },
            TrustLevel::SemiTrusted => Self {
                enabled: true,
                mode: SandboxMode::All,
                network: NetworkMode::Restricted,
                workspace_access: WorkspaceAccess::Ro,
                memory_limit: GIB,
                pids_limit: 256,
            },
            TrustLevel::Untrusted => Self {
                enabled: true,
                mode: SandboxMode::All,
                network: NetworkMode::None,
                workspace_access: WorkspaceAccess::None,
                memory_limit: 512 * MIB,
                pids_limit: 128,
            },
        }
    }

    /// Apply a session override on top of this config. Unset fields keep their value.
    #[must_use]
    pub fn with_override(mut self, overrides: &SandboxOverride) -> Self {
        if let Some(enabled) = overrides.enabled {
            self.enabled = enabled;
        }
        if let Some(mode) = overrides.mode {
            self.mode = mode;
        }
        if let Some(network) = overrides.network {
            self.network = network;
        }
        if let Some(access) = overrides.workspace_access {
            self.workspace_access = access;
        }
        if let Some(ref memory) = overrides.memory {
            match parse_memory_size(memory) {
                Ok(bytes) => self.memory_limit = bytes,
                Err(e) => warn!(error = %e, "ignoring sandbox memory override"),
            }
        }
        if let Some(pids_limit) = overrides.pids_limit {
            self.pids_limit = pids_limit;
        }
        self
    }

    /// Whether tool execution in this session must go through the sandbox.
    pub fn required_for(&self, is_main_session: bool) -> bool {
        if !self.enabled {
            return false;
        }
        match self.mode {
            SandboxMode::Off => false,
            SandboxMode::NonMain => !is_main_session,
            SandboxMode::All => true,
        }
    }
}

/// Per-session sandbox override from config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxOverride {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub mode: Option<SandboxMode>,
    #[serde(default)]
    pub network: Option<NetworkMode>,
    #[serde(default)]
    pub workspace_access: Option<WorkspaceAccess>,
    /// Human size such as "512m" or "2g".
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default)]
    pub pids_limit: Option<u32>,
}

/// Output from a sandboxed command execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Parse a memory size string like "2g", "512m", "1024k" into bytes.
pub fn parse_memory_size(s: &str) -> anyhow::Result<u64> {
    let s = s.trim().to_ascii_lowercase();
    if s.is_empty() || s == "0" {
        return Ok(0);
    }

    let (num_str, multiplier) = if let Some(n) = s.strip_suffix('g') {
        (n, GIB)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, MIB)
    } else if let Some(n) = s.strip_suffix('k') {
        (n, 1024u64)
    } else {
        (s.as_str(), 1u64)
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid memory size '{s}': {e}"))?;

    num.checked_mul(multiplier)
        .ok_or_else(|| anyhow::anyhow!("memory size '{s}' overflows"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_memory_size_units() {
        assert_eq!(parse_memory_size("1024").expect("valid"), 1024);
        assert_eq!(parse_memory_size("512k").expect("valid"), 512 * 1024);
        assert_eq!(parse_memory_size("256m").expect("valid"), 256 * MIB);
        assert_eq!(parse_memory_size("4G").expect("valid"), 4 * GIB);
        assert_eq!(parse_memory_size("0").expect("valid"), 0);
    }

    #[test]
    fn parse_memory_size_invalid() {
        assert!(parse_memory_size("abc").is_err());
        assert!(parse_memory_size("99999999999999999999g").is_err());
    }

    #[test]
    fn owner_is_not_sandboxed() {
        let config = SandboxConfig::default_for_trust(TrustLevel::Owner);
        assert!(!config.enabled);
        assert!(!config.required_for(false));
    }

    #[test]
    fn untrusted_gets_no_network_and_no_workspace() {
        let config = SandboxConfig::default_for_trust(TrustLevel::Untrusted);
        assert!(config.enabled);
        assert_eq!(config.network, NetworkMode::None);
        assert_eq!(config.workspace_access, WorkspaceAccess::None);
        assert!(config.required_for(true));
    }

    #[test]
    fn trusted_sandbox_skips_main_session() {
        let config = SandboxConfig::default_for_trust(TrustLevel::Trusted);
        assert!(!config.required_for(true));
        assert!(config.required_for(false));
    }

    #[test]
    fn override_only_touches_set_fields() {
        let overrides = SandboxOverride {
            network: Some(NetworkMode::Full),
            memory: Some("4g".into()),
            ..SandboxOverride::default()
        };
        let config = SandboxConfig::default_for_trust(TrustLevel::Untrusted)
            .with_override(&overrides);
        assert_eq!(config.network, NetworkMode::Full);
        assert_eq!(config.memory_limit, 4 * GIB);
        assert_eq!(config.workspace_access, WorkspaceAccess::None);
        assert_eq!(config.pids_limit, 128);
    }

    #[test]
    fn bad_memory_override_keeps_default() {
        let overrides = SandboxOverride {
            memory: Some("lots".into()),
            ..SandboxOverride::default()
        };
        let config = SandboxConfig::default_for_trust(TrustLevel::SemiTrusted)
            .with_override(&overrides);
        assert_eq!(config.memory_limit, GIB);
    }
}
