//! Transport layer underneath a [`Connection`](crate::connection::Connection)
//!
//! The connection only needs five primitives from a publish/subscribe
//! transport: open, publish, subscribe, pull the next message, close.
//! [`Transport`] captures exactly that so the MQTT client and the in-memory
//! test broker are interchangeable.

use bytes::Bytes;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub mod mqtt;

pub use rumqttc::v5::mqttbytes::QoS;

/// How long `open` waits for the broker to acknowledge the connection
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed")]
    ConnectFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Connection refused by broker: {0}")]
    ConnectionRefused(String),
    #[error("No connection acknowledgement within {0:?}")]
    ConnAckTimeout(Duration),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscribeFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Transport is not open")]
    NotOpen,
    #[error("Transport stream closed")]
    Closed,
    #[error("Invalid QoS level: {0}")]
    InvalidQos(u8),
}

/// A raw message as delivered by the broker
#[derive(Debug, Clone, PartialEq)]
pub struct TransportMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl TransportMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Parameters for opening a transport.
///
/// `None` means "use the transport's default".
#[derive(Clone, PartialEq)]
pub struct TransportOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub clean_session: Option<bool>,
    pub keep_alive: Option<Duration>,
    pub connect_timeout: Duration,
}

impl TransportOptions {
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            username: None,
            password: None,
            clean_session: None,
            keep_alive: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

// Hand-written so passwords never end up in logs
impl fmt::Debug for TransportOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("clean_session", &self.clean_session)
            .field("keep_alive", &self.keep_alive)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// Map a numeric QoS level (0..=2) to [`QoS`]
pub fn qos_from_level(level: u8) -> Result<QoS, TransportError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(TransportError::InvalidQos(other)),
    }
}

/// Publish/subscribe transport consumed by a connection.
///
/// `next_message` blocks until the broker delivers something; timeouts are
/// layered on top by the caller, so implementations must be cancel safe
/// there (dropping the future must not lose a message).
#[async_trait::async_trait]
pub trait Transport: Send {
    /// Open the transport and wait until the broker accepted it
    async fn open(&mut self, options: &TransportOptions) -> Result<(), TransportError>;

    /// Hand a message to the broker, no delivery acknowledgement is awaited
    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
        qos: QoS,
    ) -> Result<(), TransportError>;

    /// Register interest in a topic filter
    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    /// Next delivered message; [`TransportError::Closed`] once the stream ended
    async fn next_message(&mut self) -> Result<TransportMessage, TransportError>;

    /// Close the transport
    async fn close(&mut self) -> Result<(), TransportError>;
}
