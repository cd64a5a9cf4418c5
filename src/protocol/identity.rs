//! Identity value types for agents and accounts
//!
//! An [`Account`] is a label scoped to an audience, an [`Agent`] is one
//! connected process acting on behalf of an account. Both render to the
//! dotted string form used as topic path segments and transport client ids.
//! No escaping is performed: labels and audiences must already be path-safe.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Account identity: `{label}.{audience}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Account {
    label: String,
    audience: String,
}

impl Account {
    pub fn new(label: impl Into<String>, audience: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            audience: audience.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.label, self.audience)
    }
}

/// Agent identity: `{label}.{account}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Agent {
    label: String,
    account: Account,
}

impl Agent {
    pub fn new(label: impl Into<String>, account: Account) -> Self {
        Self {
            label: label.into(),
            account,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn account(&self) -> &Account {
        &self.account
    }
}

impl fmt::Display for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.label, self.account)
    }
}

/// Authentication framing variant used when opening the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    /// Mode and api version are packed into the client id
    #[default]
    V1,
    /// Client id is the bare agent; mode travels as the username
    V2,
}

/// Connection mode, controls how the broker authorizes the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    #[default]
    Default,
    Service,
    Bridge,
    Observer,
}

impl ConnectionMode {
    /// Mode label as it appears in a v1 client id
    pub fn v1_label(self) -> &'static str {
        match self {
            ConnectionMode::Default => "agents",
            ConnectionMode::Service => "service-agents",
            ConnectionMode::Bridge => "bridge-agents",
            ConnectionMode::Observer => "observer-agents",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionMode::Default => "default",
            ConnectionMode::Service => "service",
            ConnectionMode::Bridge => "bridge",
            ConnectionMode::Observer => "observer",
        }
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("Unknown connection mode: {0}")]
pub struct UnknownModeError(pub String);

impl FromStr for ConnectionMode {
    type Err = UnknownModeError;

    /// Accepts both the short names and the v1 labels
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "default" | "agents" => Ok(ConnectionMode::Default),
            "service" | "service-agents" => Ok(ConnectionMode::Service),
            "bridge" | "bridge-agents" => Ok(ConnectionMode::Bridge),
            "observer" | "observer-agents" => Ok(ConnectionMode::Observer),
            other => Err(UnknownModeError(other.to_string())),
        }
    }
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the transport needs to know about who is connecting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub agent: Agent,
    pub mode: ConnectionMode,
    pub protocol_version: ProtocolVersion,
    pub api_version: String,
}

impl ClientIdentity {
    pub fn new(agent: Agent) -> Self {
        Self {
            agent,
            mode: ConnectionMode::default(),
            protocol_version: ProtocolVersion::default(),
            api_version: crate::protocol::topics::DEFAULT_API_VERSION.to_string(),
        }
    }

    pub fn with_mode(mut self, mode: ConnectionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn with_api_version(mut self, api_version: impl Into<String>) -> Self {
        self.api_version = api_version.into();
        self
    }

    /// Transport-level client identifier
    pub fn client_id(&self) -> String {
        match self.protocol_version {
            ProtocolVersion::V1 => {
                format!("{}/{}/{}", self.api_version, self.mode.v1_label(), self.agent)
            }
            ProtocolVersion::V2 => self.agent.to_string(),
        }
    }

    /// Username implied by the protocol variant, if any
    pub fn username(&self) -> Option<String> {
        match self.protocol_version {
            ProtocolVersion::V1 => None,
            ProtocolVersion::V2 => Some(format!("v2::{}", self.mode)),
        }
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.client_id())
    }
}
