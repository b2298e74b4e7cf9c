//! Stack configuration structures.
//!
//! All intervals are milliseconds unless the field name says otherwise.
//! Defaults mirror the values the daemon has always shipped with; every
//! field can be overridden from the TOML file or a `CPOSD_*` environment
//! variable (see [`crate::toml_config`]).

use std::sync::Arc;

use serde::Deserialize;

pub type SharedConfig = Arc<StackConfig>;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct StackConfig {
    pub modem: ModemConfig,
    pub gps: GpsConfig,
    pub debug_server: DebugServerConfig,
    pub monitor: MonitorConfig,
    pub session: SessionConfig,
}

/// Modem serial channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModemConfig {
    /// Serial device path, e.g. `/dev/gsmtty7`.
    pub device: String,
    pub baud: u32,
    /// Reader tick: serial read timeout treated as "no data yet".
    pub read_tick_ms: u64,
    /// Plain AT command acknowledgment timeout.
    pub command_timeout_ms: u64,
    /// Timeout for XML-bearing exchanges (+CPOS body).
    pub xml_command_timeout_ms: u64,
    pub reopen_retry_ms: u64,
    pub rx_buffer_size: usize,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            device: "/dev/gsmtty7".into(),
            baud: 115_200,
            read_tick_ms: 50,
            command_timeout_ms: 300,
            xml_command_timeout_ms: 1000,
            reopen_retry_ms: 3000,
            rx_buffer_size: 4096,
        }
    }
}

/// Socket link toward the positioning process.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GpsConfig {
    pub host: String,
    pub port: u16,
    /// When set, connect over a local-domain socket at this path instead of TCP.
    pub socket_path: Option<String>,
    pub reconnect_retry_ms: u64,
    pub rx_buffer_size: usize,
}

impl Default for GpsConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 4121,
            socket_path: None,
            reconnect_retry_ms: 3000,
            rx_buffer_size: 4096,
        }
    }
}

/// Optional modem pass-through listener for diagnostics.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebugServerConfig {
    pub enabled: bool,
    pub port: u16,
    pub max_connections: usize,
}

impl Default for DebugServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 4122,
            max_connections: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Background supervisor check interval. The loop sleeps a quarter of
    /// this between power-state polls, so checks land every `interval / 4`
    /// while the platform is active.
    pub interval_ms: u64,
    pub active_interval_ms: u64,
    /// Quiet window after which +CPOSR registration is re-attempted.
    pub registration_quiet_ms: u64,
    /// Platform power-state indicator; empty disables power monitoring.
    pub power_state_path: String,
    /// Abort a session with zero delivered responses after this long.
    pub no_fix_abort_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 20_000,
            active_interval_ms: 1000,
            registration_quiet_ms: 300_000,
            power_state_path: "/sys/power/current_state".into(),
            no_fix_abort_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Minimum spacing between +CPOS delivery attempts toward the modem.
    pub response_rate_limit_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            response_rate_limit_ms: 1000,
        }
    }
}
