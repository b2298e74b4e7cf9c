//! TOML configuration file loading plus environment overrides.
//!
//! Load order, later wins:
//! 1. built-in defaults
//! 2. TOML file (explicit path, or `CPOSD_CONFIG` if set)
//! 3. `CPOSD_*` environment variables

use std::path::Path;
use std::sync::Arc;

use crate::stack_config::{SharedConfig, StackConfig};

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "config file read failed: {e}"),
            ConfigError::Parse(e) => write!(f, "config file parse failed: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

pub fn load_config(path: Option<&Path>) -> Result<SharedConfig, ConfigError> {
    let mut config = match explicit_or_env_path(path) {
        Some(p) => {
            let text = std::fs::read_to_string(&p).map_err(ConfigError::Io)?;
            let cfg: StackConfig = toml::from_str(&text).map_err(ConfigError::Parse)?;
            tracing::info!(path = %p.display(), "loaded configuration file");
            cfg
        }
        None => StackConfig::default(),
    };
    apply_env_overrides(&mut config);
    Ok(Arc::new(config))
}

fn explicit_or_env_path(path: Option<&Path>) -> Option<std::path::PathBuf> {
    if let Some(p) = path {
        return Some(p.to_path_buf());
    }
    std::env::var("CPOSD_CONFIG").ok().map(Into::into)
}

fn env_str(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let v = env_str(name)?;
    match v.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(var = name, value = %v, "ignoring unparsable environment override");
            None
        }
    }
}

fn apply_env_overrides(config: &mut StackConfig) {
    if let Some(v) = env_str("CPOSD_MODEM_DEVICE") {
        config.modem.device = v;
    }
    if let Some(v) = env_parse::<u32>("CPOSD_MODEM_BAUD") {
        config.modem.baud = v;
    }
    if let Some(v) = env_str("CPOSD_GPS_HOST") {
        config.gps.host = v;
    }
    if let Some(v) = env_parse::<u16>("CPOSD_GPS_PORT") {
        config.gps.port = v;
    }
    if let Some(v) = env_str("CPOSD_GPS_SOCKET") {
        config.gps.socket_path = Some(v);
    }
    if let Some(v) = env_parse::<u16>("CPOSD_DEBUG_PORT") {
        config.debug_server.port = v;
    }
    if let Some(v) = env_parse::<u8>("CPOSD_DEBUG_SERVER") {
        config.debug_server.enabled = v != 0;
    }
    if let Some(v) = env_str("CPOSD_POWER_STATE_PATH") {
        config.monitor.power_state_path = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let cfg = load_config(None).unwrap();
        assert_eq!(cfg.gps.port, 4121);
        assert_eq!(cfg.debug_server.port, 4122);
        assert_eq!(cfg.session.response_rate_limit_ms, 1000);
    }

    #[test]
    fn parses_partial_toml() {
        let cfg: StackConfig = toml::from_str(
            r#"
            [modem]
            device = "/dev/ttyUSB3"

            [gps]
            port = 5121
            "#,
        )
        .unwrap();
        assert_eq!(cfg.modem.device, "/dev/ttyUSB3");
        assert_eq!(cfg.gps.port, 5121);
        // untouched sections keep defaults
        assert_eq!(cfg.modem.command_timeout_ms, 300);
        assert_eq!(cfg.monitor.no_fix_abort_ms, 120_000);
    }
}
