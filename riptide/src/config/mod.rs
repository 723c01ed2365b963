use serde::{Deserialize, Serialize};

use crate::node::ConnPriority;

/// Default amount of seconds between noop keepalives
const fn default_noop_interval() -> u64 {
    180
}

/// Default flow-control window advertised to the producer
const fn default_connection_buffer_size() -> u64 {
    10_485_760
}

/// Default amount of buffered events applied per vbucket visit
const fn default_processor_batch() -> usize {
    10
}

/// Default outstanding-bytes budget shared by all backfill scans
const fn default_backfill_byte_budget() -> u64 {
    20_971_520
}

/// Default number of scans serviced before newcomers queue up
const fn default_backfill_scan_budget() -> usize {
    4
}

/// Default amount of seconds between rollback retries
const fn default_rollback_retry_timer() -> u64 {
    5
}

/// Default amount of seconds the processor sleeps when idle
const fn default_processor_idle_timer() -> u64 {
    1
}

/// Default amount of seconds the processor backs off when throttled
const fn default_processor_throttle_timer() -> u64 {
    5
}

const fn default_true() -> bool {
    true
}

const fn default_priority() -> ConnPriority {
    ConnPriority::Medium
}

/// Per-connection tunables, negotiated over CONTROL messages where the
/// protocol allows it
#[derive(Serialize, Deserialize, Clone)]
pub struct ConnectionConfig {
    /// Whether the consumer asks for noop keepalives
    #[serde(default = "default_true")]
    pub enable_noop: bool,

    /// Seconds between noops; twice this is the dead-peer watchdog
    #[serde(default = "default_noop_interval")]
    pub noop_interval: u64,

    /// Flow-control window in bytes. 0 disables flow control.
    #[serde(default = "default_connection_buffer_size")]
    pub connection_buffer_size: u64,

    #[serde(default = "default_priority")]
    pub priority: ConnPriority,

    #[serde(default = "default_true")]
    pub enable_ext_metadata: bool,

    #[serde(default)]
    pub enable_value_compression: bool,

    #[serde(default = "default_true")]
    pub supports_cursor_dropping: bool,

    #[serde(default = "default_processor_batch")]
    pub processor_batch: usize,

    #[serde(default = "default_processor_idle_timer")]
    pub processor_idle_timer: u64,

    #[serde(default = "default_processor_throttle_timer")]
    pub processor_throttle_timer: u64,

    #[serde(default = "default_backfill_byte_budget")]
    pub backfill_byte_budget: u64,

    #[serde(default = "default_backfill_scan_budget")]
    pub backfill_scan_budget: usize,

    #[serde(default = "default_rollback_retry_timer")]
    pub rollback_retry_timer: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            enable_noop: default_true(),
            noop_interval: default_noop_interval(),
            connection_buffer_size: default_connection_buffer_size(),
            priority: default_priority(),
            enable_ext_metadata: default_true(),
            enable_value_compression: false,
            supports_cursor_dropping: default_true(),
            processor_batch: default_processor_batch(),
            processor_idle_timer: default_processor_idle_timer(),
            processor_throttle_timer: default_processor_throttle_timer(),
            backfill_byte_budget: default_backfill_byte_budget(),
            backfill_scan_budget: default_backfill_scan_budget(),
            rollback_retry_timer: default_rollback_retry_timer(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionConfig;
    use crate::node::ConnPriority;

    #[test]
    fn test_defaults_from_empty_document() {
        let config: ConnectionConfig = toml::from_str("").unwrap();

        assert!(config.enable_noop);
        assert_eq!(config.noop_interval, 180);
        assert_eq!(config.connection_buffer_size, 10_485_760);
        assert_eq!(config.priority, ConnPriority::Medium);
        assert!(!config.enable_value_compression);
    }

    #[test]
    fn test_overrides() {
        let config: ConnectionConfig = toml::from_str(
            r#"
            noop_interval = 5
            connection_buffer_size = 1024
            priority = "high"
            "#,
        )
        .unwrap();

        assert_eq!(config.noop_interval, 5);
        assert_eq!(config.connection_buffer_size, 1024);
        assert_eq!(config.priority, ConnPriority::High);
    }
}
