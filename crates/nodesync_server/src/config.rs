//! Server configuration.

use crate::auth::AuthConfig;
use std::collections::BTreeSet;
use std::time::Duration;

/// Configuration for the receiving endpoint.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Reservations that may be held at once.
    pub max_concurrent_sessions: usize,
    /// A reservation not used within this time is dropped.
    pub reservation_timeout: Duration,
    /// Byte budget of one pull response.
    pub max_pull_bytes: u64,
    /// Channels refused at reservation time.
    pub disabled_channels: BTreeSet<String>,
    /// Token checking; `None` accepts any known node.
    pub auth: Option<AuthConfig>,
}

impl ServerConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            max_concurrent_sessions: 20,
            reservation_timeout: Duration::from_secs(60),
            max_pull_bytes: 1024 * 1024,
            disabled_channels: BTreeSet::new(),
            auth: None,
        }
    }

    /// Sets the session limit; zero is treated as one.
    pub fn with_max_concurrent_sessions(mut self, max: usize) -> Self {
        self.max_concurrent_sessions = max.max(1);
        self
    }

    /// Sets the reservation timeout.
    pub fn with_reservation_timeout(mut self, timeout: Duration) -> Self {
        self.reservation_timeout = timeout;
        self
    }

    /// Sets the pull byte budget.
    pub fn with_max_pull_bytes(mut self, bytes: u64) -> Self {
        self.max_pull_bytes = bytes;
        self
    }

    /// Refuses sessions on `channel_id`.
    pub fn with_disabled_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.disabled_channels.insert(channel_id.into());
        self
    }

    /// Enables token authentication.
    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = Some(auth);
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.max_concurrent_sessions, 20);
        assert!(config.auth.is_none());
        assert!(config.disabled_channels.is_empty());
    }

    #[test]
    fn config_builder() {
        let config = ServerConfig::new()
            .with_max_concurrent_sessions(0)
            .with_max_pull_bytes(512)
            .with_disabled_channel("reload")
            .with_auth(AuthConfig::new(vec![1, 2, 3, 4]));

        assert_eq!(config.max_concurrent_sessions, 1);
        assert_eq!(config.max_pull_bytes, 512);
        assert!(config.disabled_channels.contains("reload"));
        assert_eq!(config.auth.unwrap().secret, vec![1, 2, 3, 4]);
    }
}
