use std::env;
use std::time::Duration;

use crate::error::RelayError;

/// Upstream call deadline. Deliberately below the ~60 s hard caps common on
/// hosting platforms, so the relay times out first and can still answer.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(55);

/// Relay configuration, read from the environment once at process start and
/// passed by reference into request handling. Handlers never touch `env`
/// themselves.
///
/// Each upstream setting is accepted under a primary name or a
/// build-tool-prefixed alias (`VITE_*`), whichever is set first.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Upstream service root, or a fully-qualified `/webhook/` URL.
    pub base_url: Option<String>,
    /// Flow/agent identifier appended in prediction-API mode.
    pub agent_id: Option<String>,
    /// Optional bearer credential for the prediction API.
    pub api_key: Option<String>,
    /// Value for `Access-Control-Allow-Origin`.
    pub allow_origin: String,
    /// Wall-clock cap on the upstream call.
    pub deadline: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            base_url: None,
            agent_id: None,
            api_key: None,
            allow_origin: "*".to_string(),
            deadline: DEFAULT_DEADLINE,
        }
    }
}

impl RelayConfig {
    /// Build from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let either = |primary: &str, alias: &str| {
            lookup(primary)
                .or_else(|| lookup(alias))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let deadline = either("CHAT_RELAY_DEADLINE_SECS", "VITE_CHAT_RELAY_DEADLINE_SECS")
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_DEADLINE);

        RelayConfig {
            base_url: either("FLOWISE_BASE_URL", "VITE_FLOWISE_BASE_URL"),
            agent_id: either("FLOWISE_AGENT_ID", "VITE_FLOWISE_AGENT_ID"),
            api_key: either("FLOWISE_API_KEY", "VITE_FLOWISE_API_KEY"),
            allow_origin: either("CHAT_RELAY_ALLOW_ORIGIN", "VITE_CHAT_RELAY_ALLOW_ORIGIN")
                .unwrap_or_else(|| "*".to_string()),
            deadline,
        }
    }

    /// The upstream settings required before any network call, or the
    /// configuration error naming the first missing one.
    pub fn require_upstream(&self) -> Result<(&str, Option<&str>), RelayError> {
        let base = self
            .base_url
            .as_deref()
            .ok_or(RelayError::Configuration("FLOWISE_BASE_URL"))?;
        // Webhook URLs are self-contained; the agent id only matters for the
        // prediction API.
        if !base.contains("/webhook/") && self.agent_id.is_none() {
            return Err(RelayError::Configuration("FLOWISE_AGENT_ID"));
        }
        Ok((base, self.agent_id.as_deref()))
    }
}
