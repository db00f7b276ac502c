use crate::process::Escalation;
use crate::registry::{CheckTables, EngineSettings, BASE_TEMPLATE};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    #[serde(default)]
    pub nr_concurrent_plugins: Option<usize>,
    #[serde(default)]
    pub max_processes: Option<usize>,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    #[serde(default)]
    pub escalation: EscalationConfig,
    #[serde(default)]
    pub templates: Map<String, Value>,
    #[serde(default)]
    pub actions: Map<String, Value>,
    #[serde(default)]
    pub plugins: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EscalationConfig {
    #[serde(default = "default_sigterm_grace_secs")]
    pub sigterm_grace_secs: u64,
    #[serde(default = "default_sigkill_grace_secs")]
    pub sigkill_grace_secs: u64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            sigterm_grace_secs: default_sigterm_grace_secs(),
            sigkill_grace_secs: default_sigkill_grace_secs(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;
        Self::from_yaml(&text, &path_display)
    }

    pub fn from_yaml(text: &str, origin: &str) -> Result<Self, ConfigError> {
        let cfg: Config = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "listen has to be a valid host:port address".to_string(),
            ));
        }
        if self.tick_interval_secs < 1 {
            return Err(ConfigError::Validation(
                "tick_interval_secs has to be >= 1".to_string(),
            ));
        }
        if self.nr_concurrent_plugins == Some(0) {
            return Err(ConfigError::Validation(
                "nr_concurrent_plugins has to be >= 1".to_string(),
            ));
        }
        if self.max_processes == Some(0) {
            return Err(ConfigError::Validation(
                "max_processes has to be >= 1".to_string(),
            ));
        }
        if !matches!(self.templates.get(BASE_TEMPLATE), Some(Value::Object(_))) {
            return Err(ConfigError::Validation(format!(
                "templates.{BASE_TEMPLATE} is required"
            )));
        }
        if self.plugins.is_empty() {
            return Err(ConfigError::Validation(
                "at least one plugin has to be configured".to_string(),
            ));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn check_tables(&self) -> CheckTables {
        CheckTables {
            templates: self.templates.clone(),
            actions: self.actions.clone(),
            plugins: self.plugins.clone(),
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            concurrency: self
                .nr_concurrent_plugins
                .unwrap_or_else(crate::gate::default_size),
            escalation: Escalation {
                sigterm_grace: Duration::from_secs(self.escalation.sigterm_grace_secs),
                sigkill_grace: Duration::from_secs(self.escalation.sigkill_grace_secs),
            },
            max_processes: self.max_processes,
        }
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn default_listen() -> String {
    "127.0.0.1:8086".to_string()
}

const fn default_tick_interval_secs() -> u64 {
    5
}

const fn default_shutdown_timeout_secs() -> u64 {
    60
}

const fn default_sigterm_grace_secs() -> u64 {
    3
}

const fn default_sigkill_grace_secs() -> u64 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_example_is_valid() {
        let cfg = Config::from_yaml(Config::example_yaml(), "example").unwrap();
        assert_eq!(cfg.tick_interval_secs, 5);
        assert!(cfg.plugins.contains_key("uname"));
        let settings = cfg.engine_settings();
        assert_eq!(settings.escalation, Escalation::default());
    }

    #[test]
    fn defaults_are_filled() {
        let cfg = Config::from_yaml(
            "templates:\n  BasePlugin: {Timeout: 5}\nplugins:\n  a: {Command: 'true'}\n",
            "inline",
        )
        .unwrap();
        assert_eq!(cfg.listen, "127.0.0.1:8086");
        assert_eq!(cfg.shutdown_timeout(), Duration::from_secs(60));
        assert!(cfg.engine_settings().concurrency >= 3);
        assert_eq!(cfg.plugins["a"]["Command"], Value::from("true"));
    }

    #[test]
    fn validation_errors() {
        let missing_base = Config::from_yaml("plugins:\n  a: {Command: 'true'}\n", "inline");
        assert!(matches!(missing_base, Err(ConfigError::Validation(_))));

        let bad_listen = Config::from_yaml(
            "listen: nowhere\ntemplates:\n  BasePlugin: {}\nplugins:\n  a: {Command: 'true'}\n",
            "inline",
        );
        assert!(matches!(bad_listen, Err(ConfigError::Validation(_))));

        let zero_gate = Config::from_yaml(
            "nr_concurrent_plugins: 0\ntemplates:\n  BasePlugin: {}\nplugins:\n  a: {Command: 'true'}\n",
            "inline",
        );
        assert!(matches!(zero_gate, Err(ConfigError::Validation(_))));

        assert!(matches!(
            Config::from_yaml("listen: [", "inline"),
            Err(ConfigError::Parse { .. })
        ));
    }
}
