//! Wire-level protocol: identities, the message envelope and topic names

pub mod envelope;
pub mod identity;
pub mod topics;

pub use envelope::{decode, encode, EnvelopeError, IncomingMessage, MessageType, Properties};
pub use identity::{Account, Agent, ClientIdentity, ConnectionMode, ProtocolVersion};
pub use topics::{matches_filter, TopicBuilder};
