//! Server configuration.

use std::time::Duration;

use mshell_core::config::DaemonConfig;
use mshell_core::sentinel::DEFAULT_BUFFER_SIZE;

/// Per-session relay settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOptions {
    /// Size of each read from a client.
    pub buffer_size: usize,
    /// Treat an exact PANIC literal from a client as teardown.
    pub detect_wire_panic: bool,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            detect_wire_panic: true,
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum live sessions (`None` = unbounded).
    pub max_sessions: Option<usize>,

    /// Relay settings handed to every session.
    pub relay: RelayOptions,

    /// How long shutdown waits for sessions to finish on their own.
    pub drain_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_sessions: None,
            relay: RelayOptions::default(),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&DaemonConfig> for ServerConfig {
    fn from(config: &DaemonConfig) -> Self {
        Self {
            max_sessions: config.max_sessions,
            relay: RelayOptions {
                buffer_size: config.buffer_size,
                detect_wire_panic: config.detect_wire_panic,
            },
            drain_timeout: Duration::from_secs(config.drain_timeout_secs),
        }
    }
}

impl ServerConfig {
    /// Set max sessions.
    #[must_use]
    pub const fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = Some(max);
        self
    }

    /// Set the relay buffer size.
    #[must_use]
    pub const fn with_buffer_size(mut self, size: usize) -> Self {
        self.relay.buffer_size = size;
        self
    }

    /// Turn PANIC detection on client streams on or off.
    #[must_use]
    pub const fn with_wire_panic(mut self, detect: bool) -> Self {
        self.relay.detect_wire_panic = detect;
        self
    }

    /// Set the shutdown drain timeout.
    #[must_use]
    pub const fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.drain_timeout, Duration::from_secs(5));
        assert!(config.max_sessions.is_none());
        assert_eq!(config.relay.buffer_size, 1000);
        assert!(config.relay.detect_wire_panic);
    }

    #[test]
    fn from_daemon_config() {
        let daemon = DaemonConfig {
            max_sessions: Some(4),
            buffer_size: 4096,
            detect_wire_panic: false,
            terminate_timeout_secs: 9,
            drain_timeout_secs: 2,
            ..DaemonConfig::default()
        };
        let config = ServerConfig::from(&daemon);
        assert_eq!(config.max_sessions, Some(4));
        assert_eq!(config.relay.buffer_size, 4096);
        assert!(!config.relay.detect_wire_panic);
        assert_eq!(config.drain_timeout, Duration::from_secs(2));
    }

    #[test]
    fn builders_chain() {
        let config = ServerConfig::default()
            .with_max_sessions(2)
            .with_buffer_size(64)
            .with_wire_panic(false);
        assert_eq!(config.max_sessions, Some(2));
        assert_eq!(config.relay.buffer_size, 64);
        assert!(!config.relay.detect_wire_panic);
    }
}
