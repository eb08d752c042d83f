// Configuration Management
//
// This crate handles all configuration loading and management for the
// realtime voice gateway. It provides:
// - Configuration structs
// - YAML file loading with environment variable override
// - Default configuration values
//
// This keeps configuration concerns separate from domain/service logic.

use std::env;

use thiserror::Error;

pub mod types;

// Re-export all configuration types
pub use types::*;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

const DEFAULT_CONFIG_PATH: &str = "config.yaml";

impl ApiConfig {
    /// Load configuration from a YAML file.
    ///
    /// The path is taken from the `GATEWAY_CONFIG_PATH` environment
    /// variable, defaulting to `config.yaml` in the working directory. The
    /// HMAC secret used to verify bearer tokens may additionally be
    /// overridden by the `GATEWAY_HMAC_SECRET` environment variable, so
    /// production deployments need not write secrets to disk.
    pub fn load() -> Result<Self, ConfigError> {
        let path =
            env::var("GATEWAY_CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;

        let mut config: ApiConfig =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse { path, source })?;

        if let Ok(secret) = env::var("GATEWAY_HMAC_SECRET") {
            config.gateway.hmac_secret = secret;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_gateway_config_matches_spec_defaults() {
        let gateway = GatewayConfig::default();
        assert_eq!(gateway.heartbeat_interval_secs, 25);
        assert_eq!(gateway.connection_timeout_secs, 60);
        assert_eq!(gateway.session_create_timeout_ms, 2_000);
        assert_eq!(gateway.expiry_sweep_interval_secs, 300);
        assert_eq!(gateway.rag_history_turns, 5);
        assert_eq!(gateway.alert_min_samples, 10);
    }

    #[test]
    fn load_reads_yaml_file_and_env_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            r#"
server:
  host: "0.0.0.0"
  port: 8080
gateway:
  hmac_secret: "from-file"
"#,
        )
        .unwrap();

        std::env::set_var("GATEWAY_CONFIG_PATH", path.to_str().unwrap());
        std::env::set_var("GATEWAY_HMAC_SECRET", "from-env");

        let config = ApiConfig::load().unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.gateway.hmac_secret, "from-env");

        std::env::remove_var("GATEWAY_CONFIG_PATH");
        std::env::remove_var("GATEWAY_HMAC_SECRET");
    }
}
