//! Testing utilities
//!
//! An in-process broker so connections can be exercised end to end without
//! a network MQTT broker.

pub mod mocks;

pub use mocks::*;
