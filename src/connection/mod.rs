//! Connection of one agent to the broker
//!
//! A [`Connection`] owns its transport and walks through
//! `Unconnected -> Connected -> Disconnected`. Connecting subscribes to the
//! agent's inbox filter right away, after that the connection offers plain
//! publish/subscribe plus a receive loop that filters delivered messages
//! with a predicate under a single wall-clock deadline.
//!
//! Messages that do not satisfy the active predicate are dropped for good:
//! consumption is at-most-once, nothing is buffered for a later `receive`.
//!
//! All operations are recorded inside the connection's own tracing span,
//! which callers can replace with [`Connection::with_span`].

use crate::config::{ClientConfig, ConfigError};
use crate::error::{ClientError, ClientResult};
use crate::protocol::envelope::{self, IncomingMessage, Properties};
use crate::protocol::identity::{Agent, ClientIdentity};
use crate::protocol::topics::TopicBuilder;
use crate::transport::mqtt::MqttTransport;
use crate::transport::{QoS, Transport, TransportError, TransportMessage, TransportOptions};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, Span};

pub mod request;

pub use request::{generate_correlation_token, RequestOptions};

/// Timeout applied when callers do not pass one
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline offset used when `now + timeout` does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Lifecycle of a connection; `Disconnected` is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connected,
    Disconnected,
}

/// Per-publish settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PublishOptions {
    pub retain: bool,
    pub qos: QoS,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            retain: false,
            qos: QoS::AtMostOnce,
        }
    }
}

/// Transport options carrying the identity's client id and username
pub fn transport_options(identity: &ClientIdentity, host: &str, port: u16) -> TransportOptions {
    let mut options = TransportOptions::new(host, port, identity.client_id());
    options.username = identity.username();
    options
}

/// Request/response messaging for one agent over one transport
pub struct Connection<T: Transport = MqttTransport> {
    transport: T,
    identity: ClientIdentity,
    options: TransportOptions,
    topics: TopicBuilder,
    default_timeout: Duration,
    state: ConnectionState,
    span: Span,
}

impl<T: Transport> Connection<T> {
    pub fn new(transport: T, identity: ClientIdentity, options: TransportOptions) -> Self {
        let topics = TopicBuilder::new(identity.api_version.clone());
        let span = crate::connection_span!(
            agent = %identity.agent,
            client_id = %options.client_id
        );

        Self {
            transport,
            identity,
            options,
            topics,
            default_timeout: DEFAULT_TIMEOUT,
            state: ConnectionState::Unconnected,
            span,
        }
    }

    /// Build an unconnected connection from a validated configuration
    pub fn from_config(transport: T, config: &ClientConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let identity = config.client_identity();
        let options = config.connection.to_transport_options(&identity)?;
        Ok(Self::new(transport, identity, options)
            .with_default_timeout(config.connection.timeout()))
    }

    /// Record this connection's activity under `span`
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn agent(&self) -> &Agent {
        &self.identity.agent
    }

    pub fn topics(&self) -> &TopicBuilder {
        &self.topics
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn ensure_connected(&self) -> ClientResult<()> {
        match self.state {
            ConnectionState::Connected => Ok(()),
            state => Err(ClientError::NotConnected { state }),
        }
    }

    /// Open the transport and subscribe to this agent's inbox
    #[tracing::instrument(name = "connect", parent = &self.span, skip_all)]
    pub async fn connect(&mut self) -> ClientResult<()> {
        if self.state != ConnectionState::Unconnected {
            return Err(ClientError::NotConnected { state: self.state });
        }

        self.transport
            .open(&self.options)
            .await
            .map_err(ClientError::Connect)?;
        self.state = ConnectionState::Connected;
        info!("Connected to {}:{}", self.options.host, self.options.port);

        let inbox = self.topics.build_inbox_filter(&self.identity.agent);
        if let Err(e) = self.subscribe(&inbox, QoS::AtMostOnce).await {
            if let Err(close_err) = self.transport.close().await {
                debug!("Close after failed inbox subscription: {}", close_err);
            }
            self.state = ConnectionState::Disconnected;
            return Err(e);
        }

        Ok(())
    }

    /// Close the transport; the connection cannot be used afterwards
    #[tracing::instrument(name = "disconnect", parent = &self.span, skip_all)]
    pub async fn disconnect(&mut self) -> ClientResult<()> {
        self.ensure_connected()?;

        self.state = ConnectionState::Disconnected;
        self.transport.close().await?;
        info!("Disconnected");
        Ok(())
    }

    /// Publish with default options (not retained, QoS 0)
    pub async fn publish<P>(
        &mut self,
        topic: &str,
        payload: &P,
        properties: &Properties,
    ) -> ClientResult<()>
    where
        P: Serialize + ?Sized + Sync,
    {
        self.publish_with(topic, payload, properties, PublishOptions::default())
            .await
    }

    /// Wrap `payload` and `properties` in an envelope and hand it to the transport
    #[tracing::instrument(
        name = "publish",
        parent = &self.span,
        skip_all,
        fields(topic = %topic)
    )]
    pub async fn publish_with<P>(
        &mut self,
        topic: &str,
        payload: &P,
        properties: &Properties,
        options: PublishOptions,
    ) -> ClientResult<()>
    where
        P: Serialize + ?Sized + Sync,
    {
        self.ensure_connected()?;
        let bytes = envelope::encode(payload, properties).map_err(ClientError::Encode)?;

        self.transport
            .publish(topic, bytes, options.retain, options.qos)
            .await?;

        info!(
            qos = ?options.qos,
            retain = options.retain,
            "Published message"
        );
        debug!(properties = ?properties, "Published properties");
        Ok(())
    }

    /// Register interest in `topic`
    #[tracing::instrument(name = "subscribe", parent = &self.span, skip_all, fields(topic = %topic))]
    pub async fn subscribe(&mut self, topic: &str, qos: QoS) -> ClientResult<()> {
        self.ensure_connected()?;

        self.transport.subscribe(topic, qos).await?;
        info!(qos = ?qos, "Subscribed");
        Ok(())
    }

    /// Return the next delivered message, whatever it is
    pub async fn receive(&mut self, timeout: Duration) -> ClientResult<IncomingMessage> {
        self.receive_matching(timeout, |_| true).await
    }

    /// Wait for the first delivered message satisfying `predicate`.
    ///
    /// Non-matching messages are discarded. `timeout` bounds the whole loop,
    /// not each read, so a stream of near-miss messages cannot stretch it.
    /// A message that fails to decode aborts the wait.
    #[tracing::instrument(
        name = "receive",
        parent = &self.span,
        skip_all,
        fields(timeout = ?timeout)
    )]
    pub async fn receive_matching<F>(
        &mut self,
        timeout: Duration,
        mut predicate: F,
    ) -> ClientResult<IncomingMessage>
    where
        F: FnMut(&IncomingMessage) -> bool + Send,
    {
        self.ensure_connected()?;

        let started = Instant::now();
        let deadline = started
            .checked_add(timeout)
            .unwrap_or_else(|| started + FAR_FUTURE);
        let mut discarded = 0usize;

        loop {
            let TransportMessage { topic, payload } =
                match tokio::time::timeout_at(deadline, self.transport.next_message()).await {
                    Ok(Ok(raw)) => raw,
                    Ok(Err(TransportError::Closed)) => return Err(ClientError::StreamClosed),
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => {
                        return Err(ClientError::timeout(
                            format!("Timed out waiting for the message ({discarded} discarded)"),
                            started.elapsed(),
                        ))
                    }
                };

            let message = match IncomingMessage::from_bytes(topic.clone(), &payload) {
                Ok(message) => message,
                Err(source) => return Err(ClientError::Decode { topic, source }),
            };

            debug!(
                topic = %message.topic,
                payload = %message.payload,
                properties = ?message.properties,
                "Received message"
            );

            if predicate(&message) {
                info!(topic = %message.topic, "The message matched the given predicate");
                return Ok(message);
            }

            discarded += 1;
            debug!(
                topic = %message.topic,
                "The message didn't match the given predicate, waiting for the next one"
            );
        }
    }
}

/// Build a connection over MQTT from `config` and connect it
pub async fn connect(config: &ClientConfig) -> ClientResult<Connection<MqttTransport>> {
    let mut connection = Connection::from_config(MqttTransport::new(), config)?;
    connection.connect().await?;
    Ok(connection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::envelope::{CORRELATION_DATA_KEY, TYPE_KEY};
    use crate::protocol::identity::{Account, ConnectionMode, ProtocolVersion};
    use crate::testing::{MemoryBroker, MemoryTransport};
    use serde_json::json;

    fn identity(label: &str) -> ClientIdentity {
        ClientIdentity::new(Agent::new(
            label,
            Account::new("fey", "dev.usr.example.org"),
        ))
    }

    fn connection(broker: &MemoryBroker, label: &str) -> Connection<MemoryTransport> {
        let identity = identity(label);
        let options = transport_options(&identity, "memory", 0);
        Connection::new(broker.transport(), identity, options)
    }

    #[test]
    fn test_transport_options_follow_protocol_version() {
        let v1 = identity("web");
        let options = transport_options(&v1, "localhost", 1883);
        assert_eq!(options.client_id, "v1/agents/web.fey.dev.usr.example.org");
        assert_eq!(options.username, None);

        let v2 = identity("web")
            .with_protocol_version(ProtocolVersion::V2)
            .with_mode(ConnectionMode::Bridge);
        let options = transport_options(&v2, "localhost", 1883);
        assert_eq!(options.client_id, "web.fey.dev.usr.example.org");
        assert_eq!(options.username.as_deref(), Some("v2::bridge"));
    }

    #[tokio::test]
    async fn test_connect_subscribes_to_inbox() {
        let broker = MemoryBroker::new();
        let mut conn = connection(&broker, "web");
        assert_eq!(conn.state(), ConnectionState::Unconnected);

        conn.connect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(
            conn.transport().subscriptions(),
            vec!["agents/web.fey.dev.usr.example.org/api/v1/in/#".to_string()]
        );
    }

    #[tokio::test]
    async fn test_connect_failure_is_surfaced() {
        let broker = MemoryBroker::new();
        broker.refuse_connections();
        let mut conn = connection(&broker, "web");

        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, ClientError::Connect(_)));
        assert_eq!(conn.state(), ConnectionState::Unconnected);
    }

    #[tokio::test]
    async fn test_failed_inbox_subscription_closes_transport() {
        let broker = MemoryBroker::new();
        broker.refuse_subscriptions();
        let mut conn = connection(&broker, "web");

        let err = conn.connect().await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Transport(TransportError::SubscribeFailed(_))
        ));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!conn.transport().is_open());
        assert!(broker.connected_clients().is_empty());
    }

    #[tokio::test]
    async fn test_operations_require_connected_state() {
        let broker = MemoryBroker::new();
        let mut conn = connection(&broker, "web");

        let err = conn
            .publish("a/b", &json!(1), &Properties::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::NotConnected {
                state: ConnectionState::Unconnected
            }
        ));

        conn.connect().await.unwrap();
        conn.disconnect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        assert!(matches!(
            conn.receive(Duration::from_millis(10)).await,
            Err(ClientError::NotConnected {
                state: ConnectionState::Disconnected
            })
        ));
        assert!(matches!(
            conn.connect().await,
            Err(ClientError::NotConnected { .. })
        ));
        assert!(matches!(
            conn.disconnect().await,
            Err(ClientError::NotConnected { .. })
        ));
    }

    #[tokio::test]
    async fn test_receive_without_predicate_returns_first_message() {
        let broker = MemoryBroker::new();
        let mut conn = connection(&broker, "web");
        conn.connect().await.unwrap();
        conn.subscribe("apps/test/#", QoS::AtMostOnce).await.unwrap();

        let properties = Properties::new().with(TYPE_KEY, "event");
        conn.publish("apps/test/one", &json!({"n": 1}), &properties)
            .await
            .unwrap();
        conn.publish("apps/test/two", &json!({"n": 2}), &properties)
            .await
            .unwrap();

        let message = conn.receive(Duration::from_secs(1)).await.unwrap();
        assert_eq!(message.topic, "apps/test/one");
        assert_eq!(message.payload, json!({"n": 1}));
        assert_eq!(message.properties, properties);
    }

    #[tokio::test]
    async fn test_receive_discards_until_predicate_matches() {
        let broker = MemoryBroker::new();
        let mut conn = connection(&broker, "web");
        conn.connect().await.unwrap();
        conn.subscribe("apps/test/#", QoS::AtMostOnce).await.unwrap();

        for token in ["a", "b", "c"] {
            let properties = Properties::new().with(CORRELATION_DATA_KEY, token);
            conn.publish("apps/test/x", &json!(token), &properties)
                .await
                .unwrap();
        }

        let message = conn
            .receive_matching(Duration::from_secs(1), |m| {
                m.correlation_data() == Some("c")
            })
            .await
            .unwrap();
        assert_eq!(message.payload, json!("c"));

        // "a" and "b" are gone for good
        let err = conn.receive(Duration::from_millis(50)).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_decode_failure_aborts_receive() {
        let broker = MemoryBroker::new();
        let mut conn = connection(&broker, "web");
        conn.connect().await.unwrap();

        let inbox = conn
            .topics()
            .build_inbox_topic(conn.agent(), &Account::new("svc", "dev.svc.example.org"));
        broker.inject(&inbox, b"{not an envelope".to_vec());
        conn.publish(&inbox, &json!("valid"), &Properties::new())
            .await
            .unwrap();

        let err = conn
            .receive(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Decode { ref topic, .. } if *topic == inbox));

        // The connection stays usable and the next message is intact
        let message = conn.receive(Duration::from_secs(1)).await.unwrap();
        assert_eq!(message.payload, json!("valid"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_a_single_deadline() {
        let broker = MemoryBroker::new();
        let mut conn = connection(&broker, "web");
        conn.connect().await.unwrap();
        let inbox = conn
            .topics()
            .build_inbox_topic(conn.agent(), &Account::new("svc", "dev.svc.example.org"));

        // A noisy peer keeps delivering non-matching messages every 300ms
        let noisy = broker.clone();
        let noise_topic = inbox.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(300)).await;
                let bytes = envelope::encode(&json!("noise"), &Properties::new()).unwrap();
                noisy.inject(&noise_topic, bytes);
            }
        });

        let started = Instant::now();
        let err = conn
            .receive_matching(Duration::from_secs(1), |_| false)
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(err.is_timeout());
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_millis(1100));
    }

    #[tokio::test]
    async fn test_unbounded_timeout_still_receives() {
        let broker = MemoryBroker::new();
        let mut conn =
            connection(&broker, "web").with_default_timeout(Duration::from_secs(u64::MAX));
        conn.connect().await.unwrap();
        let inbox = conn
            .topics()
            .build_inbox_topic(conn.agent(), &Account::new("svc", "dev.svc.example.org"));

        conn.publish(&inbox, &json!(1), &Properties::new())
            .await
            .unwrap();
        let message = conn.receive(Duration::MAX).await.unwrap();
        assert_eq!(message.payload, json!(1));

        conn.publish(&inbox, &json!(2), &Properties::new())
            .await
            .unwrap();
        let timeout = conn.default_timeout();
        let message = conn.receive(timeout).await.unwrap();
        assert_eq!(message.payload, json!(2));
    }

    #[tokio::test]
    async fn test_closed_stream_is_reported() {
        let broker = MemoryBroker::new();
        let mut conn = connection(&broker, "web");
        conn.connect().await.unwrap();

        broker.shutdown();
        let err = conn.receive(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ClientError::StreamClosed));
    }
}
