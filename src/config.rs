//! TOML configuration for an agent connection
//!
//! ```toml
//! [identity]
//! label = "web"
//! account = "fey"
//! audience = "dev.usr.example.org"
//!
//! [connection]
//! host = "localhost"
//! port = 1883
//! mode = "default"
//! protocol_version = "v1"
//! password_env = "MQTT_PASSWORD"
//! timeout_secs = 5
//! ```
//!
//! Secrets never live in the file: `password_env` names an environment
//! variable which is resolved when the transport options are built.

use crate::protocol::identity::{
    Account, Agent, ClientIdentity, ConnectionMode, ProtocolVersion,
};
use crate::protocol::topics::{validate_segment, ValidationError, DEFAULT_API_VERSION};
use crate::transport::TransportOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Complete client configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    pub identity: IdentitySection,
    #[serde(default)]
    pub connection: ConnectionSection,
}

/// Who this client is: `label.account.audience`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdentitySection {
    pub label: String,
    pub account: String,
    pub audience: String,
}

/// Broker address and session settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub mode: ConnectionMode,
    #[serde(default)]
    pub protocol_version: ProtocolVersion,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Overrides the username derived from the protocol version
    pub username: Option<String>,
    /// Environment variable containing the password
    pub password_env: Option<String>,
    pub clean_session: Option<bool>,
    pub keep_alive_secs: Option<u64>,
    /// Default receive/request timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    1883
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

fn default_timeout_secs() -> u64 {
    5
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            mode: ConnectionMode::default(),
            protocol_version: ProtocolVersion::default(),
            api_version: default_api_version(),
            username: None,
            password_env: None,
            clean_session: None,
            keep_alive_secs: None,
            timeout_secs: default_timeout_secs(),
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
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid {field}: {source}")]
    InvalidSegment {
        field: &'static str,
        #[source]
        source: ValidationError,
    },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let segments = [
            ("identity.label", &self.identity.label),
            ("identity.account", &self.identity.account),
            ("identity.audience", &self.identity.audience),
            ("connection.api_version", &self.connection.api_version),
        ];
        for (field, value) in segments {
            validate_segment(value).map_err(|source| ConfigError::InvalidSegment { field, source })?;
        }

        if self.connection.host.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "connection.host cannot be empty".to_string(),
            ));
        }
        if self.connection.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "connection.port must be non-zero".to_string(),
            ));
        }
        if self.connection.timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "connection.timeout_secs must be non-zero".to_string(),
            ));
        }

        Ok(())
    }

    pub fn agent(&self) -> Agent {
        Agent::new(
            self.identity.label.clone(),
            Account::new(self.identity.account.clone(), self.identity.audience.clone()),
        )
    }

    pub fn client_identity(&self) -> ClientIdentity {
        ClientIdentity::new(self.agent())
            .with_mode(self.connection.mode)
            .with_protocol_version(self.connection.protocol_version)
            .with_api_version(self.connection.api_version.clone())
    }
}

impl ConnectionSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Password from the configured environment variable, if one is configured
    pub fn password(&self) -> Result<Option<String>, ConfigError> {
        match &self.password_env {
            Some(name) => std::env::var(name)
                .map(Some)
                .map_err(|_| ConfigError::EnvVarNotFound(name.clone())),
            None => Ok(None),
        }
    }

    /// Transport options for `identity`; unset settings keep transport defaults
    pub fn to_transport_options(
        &self,
        identity: &ClientIdentity,
    ) -> Result<TransportOptions, ConfigError> {
        let mut options = TransportOptions::new(&self.host, self.port, identity.client_id());
        options.username = self.username.clone().or_else(|| identity.username());
        options.password = self.password()?;
        options.clean_session = self.clean_session;
        options.keep_alive = self.keep_alive_secs.map(Duration::from_secs);
        Ok(options)
    }
}
