//! Static trust and capability tables.
//!
//! Everything here is pure: lookups over fixed tables, no state.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::types::{SourceType, TrustLevel};

/// A named permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    #[serde(rename = "inject.local")]
    InjectLocal,
    #[serde(rename = "inject.network")]
    InjectNetwork,
    #[serde(rename = "cross.inject")]
    CrossInject,
    #[serde(rename = "cross.read")]
    CrossRead,
    #[serde(rename = "tools.read")]
    ToolsRead,
    #[serde(rename = "tools.write")]
    ToolsWrite,
    #[serde(rename = "tools.exec")]
    ToolsExec,
    #[serde(rename = "tools.network")]
    ToolsNetwork,
    #[serde(rename = "memory.read")]
    MemoryRead,
    #[serde(rename = "memory.write")]
    MemoryWrite,
    #[serde(rename = "gateway.forward")]
    GatewayForward,
    #[serde(rename = "config.write")]
    ConfigWrite,
}

impl Capability {
    pub const ALL: [Self; 12] = [
        Self::InjectLocal,
        Self::InjectNetwork,
        Self::CrossInject,
        Self::CrossRead,
        Self::ToolsRead,
        Self::ToolsWrite,
        Self::ToolsExec,
        Self::ToolsNetwork,
        Self::MemoryRead,
        Self::MemoryWrite,
        Self::GatewayForward,
        Self::ConfigWrite,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::InjectLocal => "inject.local",
            Self::InjectNetwork => "inject.network",
            Self::CrossInject => "cross.inject",
            Self::CrossRead => "cross.read",
            Self::ToolsRead => "tools.read",
            Self::ToolsWrite => "tools.write",
            Self::ToolsExec => "tools.exec",
            Self::ToolsNetwork => "tools.network",
            Self::MemoryRead => "memory.read",
            Self::MemoryWrite => "memory.write",
            Self::GatewayForward => "gateway.forward",
            Self::ConfigWrite => "config.write",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|cap| cap.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown capability: {s}"))
    }
}

/// Default trust level for each source type.
pub fn default_trust_for_source(source_type: SourceType) -> TrustLevel {
    match source_type {
        SourceType::Cli | SourceType::Daemon => TrustLevel::Owner,
        SourceType::Cron | SourceType::Api => TrustLevel::Trusted,
        SourceType::Plugin | SourceType::Gateway => TrustLevel::SemiTrusted,
        SourceType::P2p | SourceType::P2pDiscovery => TrustLevel::Untrusted,
    }
}

/// Capability profile granted by a trust level before any session overrides.
pub fn capability_profile(trust: TrustLevel) -> BTreeSet<Capability> {
    use Capability::{
        CrossRead, GatewayForward, InjectLocal, InjectNetwork, MemoryRead, MemoryWrite, ToolsExec,
        ToolsNetwork, ToolsRead, ToolsWrite,
    };

    match trust {
        TrustLevel::Owner => Capability::ALL.into_iter().collect(),
        TrustLevel::Trusted => [
            InjectLocal,
            InjectNetwork,
            CrossRead,
            ToolsRead,
            ToolsWrite,
            ToolsExec,
            ToolsNetwork,
            MemoryRead,
            MemoryWrite,
            GatewayForward,
        ]
        .into_iter()
        .collect(),
        TrustLevel::SemiTrusted => [
            InjectLocal,
            ToolsRead,
            ToolsNetwork,
            MemoryRead,
            GatewayForward,
        ]
        .into_iter()
        .collect(),
        TrustLevel::Untrusted => [InjectLocal, GatewayForward].into_iter().collect(),
    }
}

/// Total order over trust levels; `Greater` means `a` is more privileged.
pub fn compare_trust_level(a: TrustLevel, b: TrustLevel) -> Ordering {
    a.cmp(&b)
}

/// Whether `actual` is at least as privileged as `required`.
pub fn meets_trust_level(actual: TrustLevel, required: TrustLevel) -> bool {
    compare_trust_level(actual, required) != Ordering::Less
}

/// Resolve one capability name, wildcard or alias.
///
/// Accepts exact names (`tools.exec`), `*`, prefix wildcards (`tools.*`) and
/// the aliases `read-only` and `admin`. Returns `None` for anything else.
pub fn parse_capability_pattern(pattern: &str) -> Option<Vec<Capability>> {
    let pattern = pattern.trim();
    match pattern {
        "*" | "admin" => return Some(Capability::ALL.to_vec()),
        "read-only" => {
            return Some(vec![
                Capability::ToolsRead,
                Capability::MemoryRead,
                Capability::CrossRead,
            ]);
        }
        _ => {}
    }

    if let Some(prefix) = pattern.strip_suffix(".*") {
        let matched: Vec<_> = Capability::ALL
            .into_iter()
            .filter(|cap| {
                cap.as_str()
                    .split_once('.')
                    .is_some_and(|(group, _)| group == prefix)
            })
            .collect();
        return if matched.is_empty() {
            None
        } else {
            Some(matched)
        };
    }

    pattern.parse::<Capability>().ok().map(|cap| vec![cap])
}

/// Expand capability names, wildcards and aliases into a concrete set.
///
/// Unknown names are dropped: an unrecognised capability is never granted.
pub fn expand_capabilities<S: AsRef<str>>(names: &[S]) -> BTreeSet<Capability> {
    let mut expanded = BTreeSet::new();
    for name in names {
        if let Some(caps) = parse_capability_pattern(name.as_ref()) {
            expanded.extend(caps);
        } else {
            debug!(
                capability = name.as_ref(),
                "ignoring unknown capability name"
            );
        }
    }
    expanded
}

/// Capability a tool needs when no explicit allow-list applies.
///
/// Returns `None` for tools not in the table; callers must treat that as denied.
pub fn tool_capability(tool: &str) -> Option<Capability> {
    let cap = match tool {
        "read_file" | "list_directory" | "glob" | "grep" | "view_image" => Capability::ToolsRead,
        "write_file" | "edit_file" | "apply_patch" => Capability::ToolsWrite,
        "bash" | "exec" | "process" => Capability::ToolsExec,
        "web_fetch" | "web_search" | "browser" => Capability::ToolsNetwork,
        "memory_search" | "memory_get" => Capability::MemoryRead,
        "memory_write" | "memory_forget" => Capability::MemoryWrite,
        "sessions_list" | "sessions_history" => Capability::CrossRead,
        "sessions_send" | "session_inject" => Capability::CrossInject,
        "config_set" | "config_write" => Capability::ConfigWrite,
        _ => return None,
    };
    Some(cap)
}
