//! Process configuration
//!
//! Loaded from a TOML file. Broker credentials are never written in the file;
//! `[broker]` names the environment variables that hold them and they are read
//! when parameters are built.

use crate::engine::{EngineOptions, ReconnectConfig};
use crate::session::{
    SessionParameters, SessionSettings, DEFAULT_BUFFER_CAPACITY, DEFAULT_STORM_CEILING,
};
use crate::settings::DEFAULT_MAX_HISTORY;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

pub const DEFAULT_PORT: u16 = 1883;

/// Whole configuration file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    pub broker: BrokerSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub settings: SettingsSection,
}

/// Broker to connect to and how to identify
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// `mqtt://host[:port]`; takes precedence over `host`/`port`
    pub broker_url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Generated when absent
    pub client_id: Option<String>,
    /// Environment variable containing the username
    pub username_env: Option<String>,
    /// Environment variable containing the password
    pub password_env: Option<String>,
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

fn default_clean_session() -> bool {
    true
}

fn default_keep_alive() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default = "default_storm_ceiling")]
    pub storm_ceiling: u32,
    #[serde(default = "default_storm_window")]
    pub storm_window_secs: u64,
}

fn default_buffer_capacity() -> usize {
    DEFAULT_BUFFER_CAPACITY
}

fn default_storm_ceiling() -> u32 {
    DEFAULT_STORM_CEILING
}

fn default_storm_window() -> u64 {
    60
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            storm_ceiling: default_storm_ceiling(),
            storm_window_secs: default_storm_window(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default = "default_backoff_pattern")]
    pub backoff_pattern_ms: Vec<u64>,
    #[serde(default = "default_sustained_delay")]
    pub sustained_delay_ms: u64,
}

fn default_backoff_pattern() -> Vec<u64> {
    ReconnectConfig::default().backoff_pattern
}

fn default_sustained_delay() -> u64 {
    ReconnectConfig::default().sustained_delay
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            backoff_pattern_ms: default_backoff_pattern(),
            sustained_delay_ms: default_sustained_delay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SettingsSection {
    /// Where connection and subscription history is kept; none disables it
    pub history_path: Option<PathBuf>,
    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

fn default_max_history() -> usize {
    DEFAULT_MAX_HISTORY
}

impl Default for SettingsSection {
    fn default() -> Self {
        Self {
            history_path: None,
            max_history: default_max_history(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to render TOML: {0}")]
    TomlRender(#[from] toml::ser::Error),
    #[error("Invalid broker URL {url:?}: {reason}")]
    InvalidBrokerUrl { url: String, reason: String },
    #[error("Invalid port: {0}")]
    InvalidPort(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Host and port after resolving `broker_url` against `host`/`port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl ClientConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration text. A missing `client_id` is filled
    /// with a generated one.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let mut config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        if config.broker.client_id.is_none() {
            config.broker.client_id = Some(generate_client_id());
        }
        Ok(config)
    }

    /// Effective configuration rendered back to TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.address()?;

        if let Some(client_id) = &self.broker.client_id {
            validate_client_id(client_id)?;
        }
        if self.broker.keep_alive_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "keep_alive_secs must be greater than zero".to_string(),
            ));
        }
        if self.session.buffer_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "buffer_capacity must be greater than zero".to_string(),
            ));
        }
        if self.session.storm_ceiling == 0 {
            return Err(ConfigError::InvalidConfig(
                "storm_ceiling must be greater than zero".to_string(),
            ));
        }
        if self.session.storm_window_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "storm_window_secs must be greater than zero".to_string(),
            ));
        }
        if self.settings.max_history == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_history must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn client_id(&self) -> String {
        self.broker
            .client_id
            .clone()
            .unwrap_or_else(generate_client_id)
    }

    /// Get MQTT username from its environment variable
    pub fn get_mqtt_username(&self) -> Option<String> {
        env_var_optional(self.broker.username_env.as_deref())
    }

    /// Get MQTT password from its environment variable
    pub fn get_mqtt_password(&self) -> Option<String> {
        env_var_optional(self.broker.password_env.as_deref())
    }

    /// Session parameters for the configured broker, credentials included when
    /// both environment variables resolve
    pub fn to_session_parameters(&self) -> Result<SessionParameters, ConfigError> {
        let address = self.broker.address()?;
        let mut params = SessionParameters::new(address.host, address.port, self.client_id())
            .with_clean_session(self.broker.clean_session);

        if let (Some(username), Some(password)) = (self.get_mqtt_username(), self.get_mqtt_password()) {
            params = params.with_credentials(username, password);
        }
        Ok(params)
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            keep_alive: Duration::from_secs(self.broker.keep_alive_secs),
            reconnect: ReconnectConfig {
                backoff_pattern: self.reconnect.backoff_pattern_ms.clone(),
                sustained_delay: self.reconnect.sustained_delay_ms,
            },
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            buffer_capacity: self.session.buffer_capacity,
            storm_ceiling: self.session.storm_ceiling,
            storm_window: Duration::from_secs(self.session.storm_window_secs),
        }
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        Self::from_toml(
            r#"
[broker]
broker_url = "mqtt://localhost:1883"
client_id = "test-client"
"#,
        )
        .expect("Test config should parse")
    }
}

impl BrokerSection {
    /// Resolve the broker address. `broker_url` wins over `host`/`port`.
    pub fn address(&self) -> Result<BrokerAddress, ConfigError> {
        if let Some(raw) = &self.broker_url {
            return parse_broker_url(raw);
        }

        let host = self
            .host
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| {
                ConfigError::InvalidConfig("[broker] needs broker_url or host".to_string())
            })?;
        let port = self.port.unwrap_or(DEFAULT_PORT);
        if port == 0 {
            return Err(ConfigError::InvalidPort(port.to_string()));
        }

        Ok(BrokerAddress {
            host: host.to_string(),
            port,
        })
    }
}

/// Parse `mqtt://host[:port]` (also accepts `tcp://`)
pub fn parse_broker_url(raw: &str) -> Result<BrokerAddress, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidBrokerUrl {
        url: raw.to_string(),
        reason: reason.to_string(),
    };

    let url = Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(url.scheme(), "mqtt" | "tcp") {
        return Err(invalid("scheme must be mqtt or tcp"));
    }
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| invalid("missing host"))?;
    let port = url.port().unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(ConfigError::InvalidPort(port.to_string()));
    }

    Ok(BrokerAddress {
        host: host.to_string(),
        port,
    })
}

/// `mqttool-` followed by eight hex digits
pub fn generate_client_id() -> String {
    let simple = Uuid::new_v4().simple().to_string();
    format!("mqttool-{}", &simple[..8])
}

fn validate_client_id(client_id: &str) -> Result<(), ConfigError> {
    if client_id.trim().is_empty() || client_id.starts_with(' ') {
        return Err(ConfigError::InvalidConfig(format!(
            "client_id {client_id:?} must not be blank or start with a space"
        )));
    }
    Ok(())
}

fn env_var_optional(name: Option<&str>) -> Option<String> {
    name.and_then(|name| std::env::var(name).ok())
}
