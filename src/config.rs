//! TOML-backed startup configuration with environment-variable overrides.

use crate::error::ControllerError;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_PATH: &str = "config.toml";
const CONFIG_PATH_ENV: &str = "SIGNAL_CONTROLLER_CONFIG";

#[derive(Debug, Clone, Deserialize)]
pub struct SimulatorConfig {
    /// Host:port (or equivalent connection string) of the remote simulator.
    pub target: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TickConfig {
    #[serde(default = "default_decision_cycle")]
    pub decision_cycle: u64,
    #[serde(default = "default_max_red_time")]
    pub max_red_time: u64,
}

fn default_decision_cycle() -> u64 {
    5
}

fn default_max_red_time() -> u64 {
    90
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemoryConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_records")]
    pub max_records: usize,
}

fn default_max_records() -> usize {
    50_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub metrics_log_path: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub simulator: SimulatorConfig,
    pub http_bind: String,
    #[serde(default)]
    pub tick: TickConfig,
    pub memory: MemoryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            decision_cycle: default_decision_cycle(),
            max_red_time: default_max_red_time(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            metrics_log_path: None,
        }
    }
}

impl Config {
    /// Loads `path` (or the default), applies `SIGNAL_CONTROLLER_<FIELD>`
    /// scalar overrides, then validates. Aborts the caller with a structured
    /// error on any problem rather than starting the tick loop half-configured.
    pub fn load(path: Option<&Path>) -> Result<Self, ControllerError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        let contents = std::fs::read_to_string(&path).map_err(|err| ControllerError::InvalidConfig {
            field: "path".to_string(),
            reason: format!("could not read {:?}: {err}", path),
        })?;

        let mut config: Config = toml::from_str(&contents).map_err(|err| ControllerError::InvalidConfig {
            field: "<file>".to_string(),
            reason: err.to_string(),
        })?;

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SIGNAL_CONTROLLER_HTTP_BIND") {
            self.http_bind = v;
        }
        if let Ok(v) = std::env::var("SIGNAL_CONTROLLER_SIMULATOR_TARGET") {
            self.simulator.target = v;
        }
        if let Ok(v) = std::env::var("SIGNAL_CONTROLLER_DECISION_CYCLE") {
            if let Ok(n) = v.parse() {
                self.tick.decision_cycle = n;
            }
        }
        if let Ok(v) = std::env::var("SIGNAL_CONTROLLER_MAX_RED_TIME") {
            if let Ok(n) = v.parse() {
                self.tick.max_red_time = n;
            }
        }
        if let Ok(v) = std::env::var("SIGNAL_CONTROLLER_LOG_LEVEL") {
            self.logging.level = v;
        }
    }

    fn validate(&self) -> Result<(), ControllerError> {
        self.http_bind.parse::<SocketAddr>().map_err(|err| ControllerError::InvalidConfig {
            field: "http_bind".to_string(),
            reason: err.to_string(),
        })?;
        if self.tick.decision_cycle == 0 {
            return Err(ControllerError::InvalidConfig {
                field: "tick.decision_cycle".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.tick.max_red_time == 0 {
            return Err(ControllerError::InvalidConfig {
                field: "tick.max_red_time".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.memory.max_records == 0 {
            return Err(ControllerError::InvalidConfig {
                field: "memory.max_records".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if let Some(parent) = self.memory.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                return Err(ControllerError::InvalidConfig {
                    field: "memory.path".to_string(),
                    reason: format!("parent directory {:?} does not exist", parent),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("signal_controller_config_test_{}.toml", std::process::id()));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_minimal_valid_config() {
        let path = write_temp(
            r#"
            http_bind = "127.0.0.1:8080"
            [simulator]
            target = "127.0.0.1:9999"
            [memory]
            path = "memory.json"
            "#,
        );
        let config = Config::load(Some(&path)).expect("valid config loads");
        assert_eq!(config.tick.decision_cycle, 5);
        assert_eq!(config.memory.max_records, 50_000);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn rejects_unparseable_bind_address() {
        let path = write_temp(
            r#"
            http_bind = "not an address"
            [simulator]
            target = "x"
            [memory]
            path = "memory.json"
            "#,
        );
        let result = Config::load(Some(&path));
        assert!(result.is_err());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn env_override_wins_over_file() {
        let path = write_temp(
            r#"
            http_bind = "127.0.0.1:8080"
            [simulator]
            target = "127.0.0.1:9999"
            [memory]
            path = "memory.json"
            "#,
        );
        std::env::set_var("SIGNAL_CONTROLLER_HTTP_BIND", "0.0.0.0:9090");
        let config = Config::load(Some(&path)).expect("valid config loads");
        assert_eq!(config.http_bind, "0.0.0.0:9090");
        std::env::remove_var("SIGNAL_CONTROLLER_HTTP_BIND");
        let _ = std::fs::remove_file(&path);
    }
}
