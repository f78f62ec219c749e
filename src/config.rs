// Engine configuration: ICE servers plus the reconnection policy.

use std::path::Path;
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{NegotiationError, Result};
use crate::peer::types::{ServerConfig, ServerKind};

/// Cap on ICE restarts per session before it is torn down.
pub const MAX_RETRIES: u32 = 3;

pub const ENV_MAX_RETRIES: &str = "PAIRLINK_MAX_RETRIES";
pub const ENV_RESTART_BACKOFF_MS: &str = "PAIRLINK_RESTART_BACKOFF_MS";

pub static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> = Lazy::new(|| {
    vec![
        ServerConfig::stun("default-stun", "stun:stun.l.google.com:19302"),
        ServerConfig::stun("default-stun-1", "stun:stun1.l.google.com:19302"),
        ServerConfig::stun("metered-stun", "stun:stun.relay.metered.ca:80"),
    ]
});

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub ice_servers: Vec<ServerConfig>,
    pub max_retries: u32,
    /// Delay before the first ICE restart; attempt `n` waits `n` times this.
    pub restart_backoff_ms: u64,
    pub ice_candidate_pool_size: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
            max_retries: MAX_RETRIES,
            restart_backoff_ms: 0,
            ice_candidate_pool_size: 10,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_json_str(&raw)?;
        info!(
            path = %path.as_ref().display(),
            servers = config.ice_servers.len(),
            "engine config loaded"
        );
        Ok(config)
    }

    /// Overrides the retry policy from `PAIRLINK_*` environment variables.
    /// Unparsable values are ignored with a warning.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Some(value) = env_number::<u32>(ENV_MAX_RETRIES) {
            self.max_retries = value;
        }
        if let Some(value) = env_number::<u64>(ENV_RESTART_BACKOFF_MS) {
            self.restart_backoff_ms = value;
        }
        self
    }

    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }

    pub fn validate(&self) -> Result<()> {
        for server in &self.ice_servers {
            if server.url.trim().is_empty() {
                return Err(NegotiationError::Config(format!(
                    "ice server `{}` has an empty url",
                    server.id
                )));
            }
            if server.r#type == ServerKind::Turn
                && (server.username.is_none() || server.credential.is_none())
            {
                return Err(NegotiationError::Config(format!(
                    "turn server `{}` requires username and credential",
                    server.id
                )));
            }
        }
        Ok(())
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reconnect_policy() {
        let config = EngineConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.restart_backoff(), Duration::ZERO);
        assert!(!config.ice_servers.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = EngineConfig::from_json_str(r#"{ "max_retries": 5 }"#).unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.ice_candidate_pool_size, 10);
        assert_eq!(config.ice_servers, *DEFAULT_ICE_SERVERS);
    }

    #[test]
    fn turn_without_credentials_is_rejected() {
        let raw = r#"{ "ice_servers": [
            { "id": "relay", "type": "turn", "url": "turn:relay.example.org:80" }
        ] }"#;
        let err = EngineConfig::from_json_str(raw).unwrap_err();
        assert!(matches!(err, NegotiationError::Config(_)));
    }

    #[test]
    fn empty_url_is_rejected() {
        let mut config = EngineConfig::default();
        config.ice_servers.push(ServerConfig::stun("blank", " "));
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_apply() {
        std::env::set_var(ENV_RESTART_BACKOFF_MS, "250");
        let config = EngineConfig::default().apply_env_overrides();
        std::env::remove_var(ENV_RESTART_BACKOFF_MS);
        assert_eq!(config.restart_backoff(), Duration::from_millis(250));
    }
}
