//! Pure routing of MQTT event loop events
//!
//! The I/O side in [`super::client`] polls the rumqttc event loop and asks
//! [`MessageHandler`] what each event means for the transport.

use crate::transport::TransportMessage;
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Packet};
use rumqttc::v5::Event;

/// Pure routing decisions for MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route an MQTT v5 event to what the transport should do about it
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) if connack.code == ConnectReturnCode::Success => {
                    EventRoute::ConnectionAcknowledged
                }
                Packet::ConnAck(connack) => {
                    EventRoute::ConnectionRefused(format!("{:?}", connack.code))
                }
                Packet::Publish(publish) => EventRoute::MessageReceived(TransportMessage {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.clone(),
                }),
                Packet::Disconnect(_) => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(rumqttc::Outgoing::Disconnect) => EventRoute::DisconnectSent,
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Broker accepted the connection
    ConnectionAcknowledged,
    /// Broker answered the connect with a failure code
    ConnectionRefused(String),
    /// Message delivered on a subscribed topic
    MessageReceived(TransportMessage),
    /// Broker closed the session
    Disconnected,
    /// Our own DISCONNECT left the socket
    DisconnectSent,
    SubscriptionConfirmed {
        packet_id: u16,
    },
    /// PingResp and friends
    InfrastructureEvent(String),
    OutgoingEvent,
}
