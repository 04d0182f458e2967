//! Application configuration.
//!
//! Aggregates the I/O context settings and default socket options into a
//! single Config struct that can be loaded from YAML files or environment
//! variables.

use serde::Deserialize;

use crate::socket::SocketOptions;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "HWMPIPE_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "HWMPIPE";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "HWMPIPE_LOG";

/// Default name prefix of I/O context threads.
pub const DEFAULT_THREAD_NAME: &str = "hwmpipe-io";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("failed to parse YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// I/O context configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IoConfig {
    /// Runtime worker threads driving connections. 0 = one per core.
    pub worker_threads: usize,
    /// Name given to runtime threads.
    pub thread_name: String,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
        }
    }
}

/// Main configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// I/O context configuration.
    pub io: IoConfig,
    /// Options every new socket starts with.
    pub socket: SocketOptions,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, `__` separated
    ///    (e.g. `HWMPIPE__SOCKET__SEND_HWM=2000`)
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Parse configuration from a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowPolicy;
    use std::io::Write;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.io.worker_threads, 0);
        assert_eq!(config.io.thread_name, "hwmpipe-io");
        assert_eq!(config.socket, SocketOptions::default());
    }

    #[test]
    fn test_from_yaml() {
        let config = Config::from_yaml(
            r#"
io:
  worker_threads: 2
socket:
  send_hwm: 2000
  flow_policy: block
  recv_timeout_ms: 10
"#,
        )
        .unwrap();
        assert_eq!(config.io.worker_threads, 2);
        assert_eq!(config.io.thread_name, DEFAULT_THREAD_NAME);
        assert_eq!(config.socket.send_hwm, 2000);
        assert_eq!(config.socket.flow_policy, FlowPolicy::Block);
        assert_eq!(config.socket.recv_timeout_ms, 10);
        assert_eq!(config.socket.recv_hwm, 1000);
    }

    #[test]
    fn test_from_yaml_rejects_bad_policy() {
        assert!(matches!(
            Config::from_yaml("socket:\n  flow_policy: sometimes\n"),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn test_load_from_explicit_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "socket:\n  recv_hwm: 11024\n  max_message_size: 4096").unwrap();

        let config = Config::load(file.path().to_str()).unwrap();
        assert_eq!(config.socket.recv_hwm, 11024);
        assert_eq!(config.socket.max_message_size, 4096);
        assert_eq!(config.socket.send_hwm, 1000);
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        assert!(matches!(
            Config::load(Some("/nonexistent/hwmpipe.yaml")),
            Err(ConfigError::Load(_))
        ));
    }
}
