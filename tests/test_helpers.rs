//! Test helpers and utilities for integration tests

use agentlink::connection::{transport_options, Connection};
use agentlink::protocol::{Account, Agent, ClientIdentity};
use agentlink::testing::{MemoryBroker, MemoryTransport};
use agentlink::transport::QoS;

#[allow(dead_code)]
pub fn user_account() -> Account {
    Account::new("fey", "dev.usr.example.org")
}

#[allow(dead_code)]
pub fn service_account() -> Account {
    Account::new("conference", "dev.svc.example.org")
}

#[allow(dead_code)]
pub fn user_identity(label: &str) -> ClientIdentity {
    ClientIdentity::new(Agent::new(label, user_account()))
}

/// Unconnected connection for `identity` attached to `broker`
#[allow(dead_code)]
pub fn connection(broker: &MemoryBroker, identity: ClientIdentity) -> Connection<MemoryTransport> {
    let options = transport_options(&identity, "memory", 0);
    Connection::new(broker.transport(), identity, options)
}

/// Connected user agent `label.fey.dev.usr.example.org`
#[allow(dead_code)]
pub async fn connect_user(broker: &MemoryBroker, label: &str) -> Connection<MemoryTransport> {
    let mut conn = connection(broker, user_identity(label));
    conn.connect().await.expect("user connection should open");
    conn
}

/// Connected service agent that also receives every request sent to its account
#[allow(dead_code)]
pub async fn connect_service(broker: &MemoryBroker) -> Connection<MemoryTransport> {
    let identity = ClientIdentity::new(Agent::new("alpha", service_account()));
    let mut conn = connection(broker, identity);
    conn.connect().await.expect("service connection should open");

    let requests = conn.topics().build_requests_filter(&service_account());
    conn.subscribe(&requests, QoS::AtMostOnce)
        .await
        .expect("service should subscribe to its requests");
    conn
}
