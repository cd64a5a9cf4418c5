//! MQTT v5 implementation of [`Transport`](crate::transport::Transport)
//!
//! Split the same way as the rest of the transport code: pure pieces are
//! kept apart from the I/O so they can be tested without a broker.
//!
//! - [`options`] - pure translation of transport options into rumqttc options
//! - [`message_handler`] - pure routing of event loop events
//! - [`client`] - the event loop task and the `Transport` implementation
//!
//! # Usage
//!
//! ```rust,no_run
//! use agentlink::transport::mqtt::MqttTransport;
//! use agentlink::transport::{Transport, TransportOptions, QoS};
//!
//! # tokio_test::block_on(async {
//! let mut transport = MqttTransport::new();
//! transport
//!     .open(&TransportOptions::new("localhost", 1883, "v1/agents/web.fey.example.org"))
//!     .await?;
//! transport.subscribe("agents/web.fey.example.org/api/v1/in/#", QoS::AtMostOnce).await?;
//! let message = transport.next_message().await?;
//! println!("{}", message.topic);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod message_handler;
pub mod options;

pub use client::{LinkState, MqttTransport};
pub use message_handler::{EventRoute, MessageHandler};
pub use options::configure_mqtt_options;
