//! agentlink - request/response messaging for agents on an MQTT broker
//!
//! Every participant is an [`Agent`] (`label.account.audience`) connected
//! to a publish/subscribe broker. Messages travel in a two-layer JSON
//! envelope (a JSON-encoded payload string plus a flat properties map) on
//! topics derived from the sender and receiver identities. On top of that,
//! a [`Connection`] offers:
//!
//! - publish/subscribe with envelope encoding
//! - predicate-filtered receive under a single deadline
//! - request/response correlation with random correlation tokens
//!
//! # Quick Start
//!
//! ```rust
//! use agentlink::connection::{transport_options, Connection};
//! use agentlink::protocol::{Account, Agent, ClientIdentity, MessageType};
//! use agentlink::testing::MemoryBroker;
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let broker = MemoryBroker::new();
//! let identity = ClientIdentity::new(Agent::new(
//!     "web",
//!     Account::new("fey", "dev.usr.example.org"),
//! ));
//! let options = transport_options(&identity, "localhost", 1883);
//! let mut conn = Connection::new(broker.transport(), identity, options);
//! conn.connect().await?;
//!
//! let rooms = Account::new("conference", "dev.svc.example.org");
//! let topic = conn.topics().build_app_topic(&rooms, "rooms/1/events");
//! conn.subscribe(&topic, agentlink::transport::QoS::AtMostOnce).await?;
//! conn.publish_event(&topic, "room.enter", &json!({"id": 1})).await?;
//!
//! let event = conn
//!     .receive_matching(Duration::from_secs(1), |m| m.kind() == Some(MessageType::Event))
//!     .await?;
//! assert_eq!(event.get("id"), Some(&json!(1)));
//! conn.disconnect().await?;
//! # Ok::<(), agentlink::ClientError>(())
//! # }).unwrap();
//! ```
//!
//! Against a real broker, build the connection with [`connection::connect`]
//! from a [`ClientConfig`].

pub mod config;
pub mod connection;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use config::{ClientConfig, ConfigError};
pub use connection::{Connection, ConnectionState, RequestOptions};
pub use error::{ClientError, ClientResult};
pub use protocol::{Account, Agent, ClientIdentity, IncomingMessage, Properties};
