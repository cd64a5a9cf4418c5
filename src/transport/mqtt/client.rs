//! Impure I/O for the MQTT transport
//!
//! A background task polls the rumqttc event loop, forwards delivered
//! messages into an unbounded channel and reports the connection outcome
//! through a watch channel. [`MqttTransport::next_message`] simply pulls
//! from that channel, which keeps it cancel safe.

use super::message_handler::{EventRoute, MessageHandler};
use super::options::configure_mqtt_options;
use crate::transport::{QoS, Transport, TransportError, TransportMessage, TransportOptions};
use async_trait::async_trait;
use rumqttc::v5::{AsyncClient, EventLoop};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the rumqttc request channel
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// How long `close` waits for the event loop to flush the DISCONNECT
const CLOSE_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Link state reported by the event loop task
#[derive(Debug, Clone, PartialEq)]
pub enum LinkState {
    Connecting,
    Open,
    /// Broker rejected the connect packet
    Refused(String),
    /// Network or protocol failure
    Failed(String),
}

/// MQTT v5 transport backed by rumqttc
#[derive(Default)]
pub struct MqttTransport {
    client: Option<AsyncClient>,
    incoming: Option<mpsc::UnboundedReceiver<TransportMessage>>,
    event_loop_handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<watch::Sender<bool>>,
}

impl MqttTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.client.is_some()
    }

    /// Wait until the event loop saw a ConnAck, a failure, or the timeout hit
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<LinkState>,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let confirmation = tokio::time::timeout(timeout, async {
            loop {
                let state = state_rx.borrow_and_update().clone();
                match state {
                    LinkState::Open => return Ok(()),
                    LinkState::Refused(reason) => {
                        return Err(TransportError::ConnectionRefused(reason))
                    }
                    LinkState::Failed(reason) => {
                        return Err(TransportError::ConnectFailed(reason.into()))
                    }
                    LinkState::Connecting => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(TransportError::ConnectFailed(
                        "Event loop stopped before the connection was acknowledged".into(),
                    ));
                }
            }
        })
        .await;

        match confirmation {
            Ok(result) => result,
            Err(_) => Err(TransportError::ConnAckTimeout(timeout)),
        }
    }

    /// Poll the event loop until shutdown, disconnect or a network error
    async fn run_event_loop(
        mut event_loop: EventLoop,
        client_id: String,
        state_tx: watch::Sender<LinkState>,
        message_tx: mpsc::UnboundedSender<TransportMessage>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        debug!(client_id = %client_id, "Starting MQTT event loop");

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!("Shutdown signal received, stopping event loop");
                        break;
                    }
                }

                event = event_loop.poll() => {
                    match event {
                        Ok(event) => match MessageHandler::route_mqtt_event(&event) {
                            EventRoute::ConnectionAcknowledged => {
                                let _ = state_tx.send(LinkState::Open);
                            }
                            EventRoute::ConnectionRefused(reason) => {
                                let _ = state_tx.send(LinkState::Refused(reason));
                                break;
                            }
                            EventRoute::MessageReceived(message) => {
                                tracing::trace!(target: "mqtt_transport", topic = %message.topic, "Message delivered");
                                if message_tx.send(message).is_err() {
                                    break;
                                }
                            }
                            EventRoute::Disconnected => {
                                info!(client_id = %client_id, "Broker closed the session");
                                break;
                            }
                            EventRoute::DisconnectSent => break,
                            EventRoute::SubscriptionConfirmed { packet_id } => {
                                tracing::debug!(target: "mqtt_transport", packet_id, "Subscription confirmed");
                            }
                            EventRoute::InfrastructureEvent(event) => {
                                tracing::trace!(target: "mqtt_transport", "MQTT event: {}", event);
                            }
                            EventRoute::OutgoingEvent => {}
                        },
                        Err(e) => {
                            warn!(client_id = %client_id, error = %e, "MQTT event loop error");
                            let _ = state_tx.send(LinkState::Failed(e.to_string()));
                            break;
                        }
                    }
                }
            }
        }

        debug!(client_id = %client_id, "MQTT event loop stopped");
    }

    fn client(&self) -> Result<&AsyncClient, TransportError> {
        self.client.as_ref().ok_or(TransportError::NotOpen)
    }

    fn abort_event_loop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }
        if let Some(handle) = self.event_loop_handle.take() {
            handle.abort();
        }
        self.client = None;
        self.incoming = None;
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn open(&mut self, options: &TransportOptions) -> Result<(), TransportError> {
        if self.client.is_some() {
            return Err(TransportError::ConnectFailed(
                "Transport is already open".into(),
            ));
        }

        let mqtt_options = configure_mqtt_options(options);
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);

        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (message_tx, message_rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(Self::run_event_loop(
            event_loop,
            options.client_id.clone(),
            state_tx,
            message_tx,
            shutdown_rx,
        ));

        self.client = Some(client);
        self.incoming = Some(message_rx);
        self.event_loop_handle = Some(handle);
        self.shutdown_tx = Some(shutdown_tx);

        if let Err(e) =
            Self::wait_for_connection_confirmation(state_rx, options.connect_timeout).await
        {
            self.abort_event_loop();
            return Err(e);
        }

        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
        qos: QoS,
    ) -> Result<(), TransportError> {
        self.client()?
            .publish(topic.to_string(), qos, retain, payload)
            .await
            .map_err(|e| TransportError::PublishFailed(Box::new(e)))
    }

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.client()?
            .subscribe(topic.to_string(), qos)
            .await
            .map_err(|e| TransportError::SubscribeFailed(Box::new(e)))
    }

    async fn next_message(&mut self) -> Result<TransportMessage, TransportError> {
        let incoming = self.incoming.as_mut().ok_or(TransportError::NotOpen)?;
        incoming.recv().await.ok_or(TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let client = self.client.take().ok_or(TransportError::NotOpen)?;

        // Fails when the event loop already stopped, nothing left to flush then
        if let Err(e) = client.disconnect().await {
            debug!(error = %e, "Disconnect request not delivered");
        }

        if let Some(mut handle) = self.event_loop_handle.take() {
            match tokio::time::timeout(CLOSE_GRACE_PERIOD, &mut handle).await {
                Ok(Ok(())) => debug!("Event loop shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => {
                    warn!("Event loop task ended with error: {}", e);
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!("Event loop didn't shut down gracefully, aborting");
                    handle.abort();
                }
            }
        }

        self.shutdown_tx = None;
        self.incoming = None;
        Ok(())
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        // No async in Drop: callers wanting a clean DISCONNECT use `close`
        self.abort_event_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_success() {
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(LinkState::Open);
        });

        let result =
            MqttTransport::wait_for_connection_confirmation(state_rx, Duration::from_millis(500))
                .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_refused() {
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        state_tx
            .send(LinkState::Refused("NotAuthorized".to_string()))
            .unwrap();

        let result =
            MqttTransport::wait_for_connection_confirmation(state_rx, Duration::from_millis(500))
                .await;
        assert!(matches!(result, Err(TransportError::ConnectionRefused(_))));
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_timeout() {
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);

        let result =
            MqttTransport::wait_for_connection_confirmation(state_rx, Duration::from_millis(20))
                .await;
        assert!(matches!(result, Err(TransportError::ConnAckTimeout(_))));
        drop(state_tx);
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_loop_gone() {
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        drop(state_tx);

        let result =
            MqttTransport::wait_for_connection_confirmation(state_rx, Duration::from_millis(500))
                .await;
        assert!(matches!(result, Err(TransportError::ConnectFailed(_))));
    }

    #[tokio::test]
    async fn test_operations_before_open_fail() {
        let mut transport = MqttTransport::new();
        assert!(!transport.is_open());

        assert!(matches!(
            transport.publish("a/b", vec![], false, QoS::AtMostOnce).await,
            Err(TransportError::NotOpen)
        ));
        assert!(matches!(
            transport.subscribe("a/#", QoS::AtMostOnce).await,
            Err(TransportError::NotOpen)
        ));
        assert!(matches!(
            transport.next_message().await,
            Err(TransportError::NotOpen)
        ));
        assert!(matches!(
            transport.close().await,
            Err(TransportError::NotOpen)
        ));
    }

    #[tokio::test]
    async fn test_open_fails_without_broker() {
        // Port 1 on loopback refuses connections
        let mut options = TransportOptions::new("127.0.0.1", 1, "agentlink-test");
        options.connect_timeout = Duration::from_secs(2);

        let mut transport = MqttTransport::new();
        let result = transport.open(&options).await;
        assert!(result.is_err());
        assert!(!transport.is_open());
    }
}
