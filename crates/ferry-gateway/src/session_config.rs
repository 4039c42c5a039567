use ferry_policy::{GatewayRoute, SessionConfigProvider, SessionPolicy};

use crate::config::SharedConfig;

/// Session policies read from the live config on every call.
pub(crate) struct ConfigSessions {
    config: SharedConfig,
}

impl ConfigSessions {
    pub(crate) fn new(config: SharedConfig) -> Self {
        Self { config }
    }
}

impl std::fmt::Debug for ConfigSessions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigSessions")
            .field("sessions", &self.config.load().sessions.len())
            .finish_non_exhaustive()
    }
}

impl SessionConfigProvider for ConfigSessions {
    fn session_policy(&self, session: &str) -> SessionPolicy {
        self.config
            .load()
            .session(session)
            .cloned()
            .unwrap_or_default()
    }

    fn gateways(&self) -> Vec<GatewayRoute> {
        self.config.load().gateways.clone()
    }
}
