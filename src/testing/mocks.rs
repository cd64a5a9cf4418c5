//! In-process broker and transport for tests
//!
//! [`MemoryBroker`] routes publishes to every attached [`MemoryTransport`]
//! whose subscriptions match the topic, with the usual MQTT `+`/`#`
//! semantics. Delivery order per client follows publish order. Handles are
//! cheap to clone, so tests can keep one to inject traffic or inspect what
//! was published while connections own their transports.

use crate::protocol::topics::matches_filter;
use crate::transport::{QoS, Transport, TransportError, TransportMessage, TransportOptions};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

/// A message published through the broker by one of its clients
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub client_id: String,
    pub topic: String,
    pub payload: Bytes,
    pub retain: bool,
    pub qos: QoS,
}

#[derive(Debug)]
struct AttachedClient {
    client_id: String,
    filters: Vec<String>,
    sender: mpsc::UnboundedSender<TransportMessage>,
}

#[derive(Debug, Default)]
struct BrokerState {
    next_session: u64,
    clients: HashMap<u64, AttachedClient>,
    retained: HashMap<String, Bytes>,
    history: Vec<PublishedMessage>,
    refuse_connections: bool,
    refuse_subscriptions: bool,
}

impl BrokerState {
    fn route(&mut self, topic: &str, payload: &Bytes) {
        for client in self.clients.values() {
            if client.filters.iter().any(|filter| matches_filter(filter, topic)) {
                // A receiver dropped without close only loses its own copy
                let _ = client
                    .sender
                    .send(TransportMessage::new(topic, payload.clone()));
            }
        }
    }
}

/// Shared in-memory broker
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A fresh, unopened transport attached to this broker
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            broker: self.clone(),
            session: None,
            incoming: None,
            subscriptions: Vec::new(),
        }
    }

    /// Make every following `open` fail as if the broker rejected the client
    pub fn refuse_connections(&self) {
        self.lock().refuse_connections = true;
    }

    /// Make every following `subscribe` fail with a broker rejection
    pub fn refuse_subscriptions(&self) {
        self.lock().refuse_subscriptions = true;
    }

    /// Deliver raw bytes on `topic` as if an outside peer published them
    pub fn inject(&self, topic: &str, payload: impl Into<Bytes>) {
        let payload = payload.into();
        self.lock().route(topic, &payload);
    }

    /// Detach all clients; their message streams end
    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.clients.clear();
        debug!("Memory broker shut down");
    }

    /// Everything published by clients, in order
    pub fn history(&self) -> Vec<PublishedMessage> {
        self.lock().history.clone()
    }

    pub fn clear_history(&self) {
        self.lock().history.clear();
    }

    /// Client ids of the currently attached transports
    pub fn connected_clients(&self) -> Vec<String> {
        let state = self.lock();
        let mut ids: Vec<String> = state
            .clients
            .values()
            .map(|client| client.client_id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn attach(&self, client_id: &str) -> Result<(u64, mpsc::UnboundedReceiver<TransportMessage>), TransportError> {
        let mut state = self.lock();
        if state.refuse_connections {
            return Err(TransportError::ConnectionRefused("NotAuthorized".to_string()));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let session = state.next_session;
        state.next_session += 1;
        state.clients.insert(
            session,
            AttachedClient {
                client_id: client_id.to_string(),
                filters: Vec::new(),
                sender,
            },
        );
        Ok((session, receiver))
    }

    fn detach(&self, session: u64) {
        self.lock().clients.remove(&session);
    }
}

/// Transport end of a [`MemoryBroker`]
#[derive(Debug)]
pub struct MemoryTransport {
    broker: MemoryBroker,
    session: Option<u64>,
    incoming: Option<mpsc::UnboundedReceiver<TransportMessage>>,
    subscriptions: Vec<String>,
}

impl MemoryTransport {
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    /// Filters subscribed through this transport, in order
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.clone()
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    fn session(&self) -> Result<u64, TransportError> {
        self.session.ok_or(TransportError::NotOpen)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&mut self, options: &TransportOptions) -> Result<(), TransportError> {
        if self.session.is_some() {
            return Err(TransportError::ConnectFailed(
                "Transport is already open".into(),
            ));
        }

        let (session, incoming) = self.broker.attach(&options.client_id)?;
        self.session = Some(session);
        self.incoming = Some(incoming);
        debug!(client_id = %options.client_id, "Attached to memory broker");
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
        qos: QoS,
    ) -> Result<(), TransportError> {
        let session = self.session()?;
        let payload = Bytes::from(payload);

        let mut state = self.broker.lock();
        let client_id = match state.clients.get(&session) {
            Some(client) => client.client_id.clone(),
            None => return Err(TransportError::Closed),
        };

        if retain {
            state.retained.insert(topic.to_string(), payload.clone());
        }
        state.history.push(PublishedMessage {
            client_id,
            topic: topic.to_string(),
            payload: payload.clone(),
            retain,
            qos,
        });
        state.route(topic, &payload);
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str, _qos: QoS) -> Result<(), TransportError> {
        let session = self.session()?;

        let mut state = self.broker.lock();
        if state.refuse_subscriptions {
            return Err(TransportError::SubscribeFailed(
                format!("Subscription to {topic} rejected").into(),
            ));
        }
        let retained: Vec<TransportMessage> = state
            .retained
            .iter()
            .filter(|(retained_topic, _)| matches_filter(topic, retained_topic))
            .map(|(retained_topic, payload)| TransportMessage::new(retained_topic.clone(), payload.clone()))
            .collect();

        let client = state
            .clients
            .get_mut(&session)
            .ok_or(TransportError::Closed)?;
        client.filters.push(topic.to_string());
        for message in retained {
            let _ = client.sender.send(message);
        }
        drop(state);

        self.subscriptions.push(topic.to_string());
        Ok(())
    }

    async fn next_message(&mut self) -> Result<TransportMessage, TransportError> {
        let incoming = self.incoming.as_mut().ok_or(TransportError::NotOpen)?;
        incoming.recv().await.ok_or(TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let session = self.session.take().ok_or(TransportError::NotOpen)?;
        self.broker.detach(session);
        self.incoming = None;
        Ok(())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.broker.detach(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(client_id: &str) -> TransportOptions {
        TransportOptions::new("memory", 0, client_id)
    }

    #[tokio::test]
    async fn test_routes_by_filter() {
        let broker = MemoryBroker::new();
        let mut alice = broker.transport();
        let mut bob = broker.transport();
        alice.open(&options("alice")).await.unwrap();
        bob.open(&options("bob")).await.unwrap();

        alice.subscribe("rooms/+/events", QoS::AtMostOnce).await.unwrap();
        bob.subscribe("rooms/#", QoS::AtMostOnce).await.unwrap();
        bob.subscribe("rooms/1/events", QoS::AtMostOnce).await.unwrap();

        bob.publish("rooms/1/events", b"one".to_vec(), false, QoS::AtMostOnce)
            .await
            .unwrap();
        bob.publish("rooms/1/state", b"two".to_vec(), false, QoS::AtMostOnce)
            .await
            .unwrap();

        let message = alice.next_message().await.unwrap();
        assert_eq!(message, TransportMessage::new("rooms/1/events", "one"));

        // Overlapping filters still deliver a single copy
        assert_eq!(bob.next_message().await.unwrap().payload, Bytes::from("one"));
        assert_eq!(bob.next_message().await.unwrap().payload, Bytes::from("two"));

        let history = broker.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].client_id, "bob");
        assert_eq!(broker.connected_clients(), vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_retained_messages_reach_late_subscribers() {
        let broker = MemoryBroker::new();
        let mut publisher = broker.transport();
        publisher.open(&options("publisher")).await.unwrap();
        publisher
            .publish("apps/status", b"up".to_vec(), true, QoS::AtLeastOnce)
            .await
            .unwrap();

        let mut late = broker.transport();
        late.open(&options("late")).await.unwrap();
        late.subscribe("apps/#", QoS::AtMostOnce).await.unwrap();
        assert_eq!(
            late.next_message().await.unwrap(),
            TransportMessage::new("apps/status", "up")
        );
    }

    #[tokio::test]
    async fn test_refused_and_closed() {
        let broker = MemoryBroker::new();
        let mut transport = broker.transport();
        transport.open(&options("web")).await.unwrap();
        assert!(transport.is_open());

        broker.shutdown();
        assert!(matches!(
            transport.next_message().await,
            Err(TransportError::Closed)
        ));

        broker.refuse_connections();
        let mut refused = broker.transport();
        assert!(matches!(
            refused.open(&options("other")).await,
            Err(TransportError::ConnectionRefused(_))
        ));
    }

    #[tokio::test]
    async fn test_drop_detaches() {
        let broker = MemoryBroker::new();
        {
            let mut transport = broker.transport();
            transport.open(&options("short-lived")).await.unwrap();
            assert_eq!(broker.connected_clients(), vec!["short-lived"]);
        }
        assert!(broker.connected_clients().is_empty());
    }
}
