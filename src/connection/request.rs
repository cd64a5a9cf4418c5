//! Request/response correlation on top of a connection
//!
//! A request carries a fresh random `correlation_data` token and a
//! `response_topic` pointing back into the sender's inbox. The reply is
//! recognized purely by its properties: `type == "response"` and the same
//! token. Anything else arriving meanwhile is discarded, so only one request
//! per connection should be awaiting its reply at a time.

use super::{Connection, PublishOptions};
use crate::error::{ClientError, ClientResult};
use crate::protocol::envelope::{
    IncomingMessage, MessageType, Properties, CORRELATION_DATA_KEY, LABEL_KEY, METHOD_KEY,
    RESPONSE_TOPIC_KEY, STATUS_KEY,
};
use crate::protocol::identity::Account;
use crate::transport::{QoS, Transport};
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Optional knobs for [`Connection::request_with`]
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOptions {
    /// Extra properties; protocol keys overwrite clashing entries
    pub properties: Properties,
    pub qos: QoS,
    /// Falls back to the connection's default timeout
    pub timeout: Option<Duration>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            properties: Properties::new(),
            qos: QoS::AtMostOnce,
            timeout: None,
        }
    }
}

impl RequestOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(key, value);
        self
    }
}

/// Fresh correlation token: 64 hex characters from two random UUIDs
pub fn generate_correlation_token() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

/// Properties of an outgoing request, merged over `extra`
pub fn request_properties(
    mut extra: Properties,
    method: &str,
    token: &str,
    response_topic: &str,
) -> Properties {
    let mut protocol = Properties::new()
        .with(METHOD_KEY, method)
        .with(CORRELATION_DATA_KEY, token)
        .with(RESPONSE_TOPIC_KEY, response_topic);
    protocol.set_kind(MessageType::Request);

    extra.merge(protocol);
    extra
}

impl<T: Transport> Connection<T> {
    /// Send a request to `to` and wait for the matching response
    pub async fn request<P>(
        &mut self,
        method: &str,
        to: &Account,
        payload: &P,
    ) -> ClientResult<IncomingMessage>
    where
        P: Serialize + ?Sized + Sync,
    {
        self.request_with(method, to, payload, RequestOptions::default())
            .await
    }

    /// Send a request with explicit properties, QoS and timeout
    #[tracing::instrument(
        name = "request",
        parent = &self.span,
        skip_all,
        fields(method = %method, to = %to)
    )]
    pub async fn request_with<P>(
        &mut self,
        method: &str,
        to: &Account,
        payload: &P,
        options: RequestOptions,
    ) -> ClientResult<IncomingMessage>
    where
        P: Serialize + ?Sized + Sync,
    {
        let token = generate_correlation_token();
        let response_topic = self.topics().build_inbox_topic(self.agent(), to);
        let topic = self.topics().build_outgoing_topic(self.agent(), to);
        let properties = request_properties(options.properties, method, &token, &response_topic);
        let timeout = options.timeout.unwrap_or(self.default_timeout());

        self.publish_with(
            &topic,
            payload,
            &properties,
            PublishOptions {
                retain: false,
                qos: options.qos,
            },
        )
        .await?;

        let result = self
            .receive_matching(timeout, |message| message.properties.is_response_to(&token))
            .await;

        match result {
            Ok(response) => {
                info!(status = ?response.status(), "Received response");
                Ok(response)
            }
            Err(ClientError::Timeout { elapsed, .. }) => {
                warn!(correlation_data = %token, "No response before the deadline");
                Err(ClientError::timeout(
                    format!("No response to {method} from {to} (correlation_data {token})"),
                    elapsed,
                ))
            }
            Err(e) => Err(e),
        }
    }

    /// Answer `request` on its response topic with the same correlation token
    pub async fn reply<P>(
        &mut self,
        request: &IncomingMessage,
        payload: &P,
        status: &str,
    ) -> ClientResult<()>
    where
        P: Serialize + ?Sized + Sync,
    {
        let response_topic = request
            .properties
            .response_topic()
            .ok_or_else(|| ClientError::invalid_request("missing response_topic"))?
            .to_string();
        let token = request
            .correlation_data()
            .ok_or_else(|| ClientError::invalid_request("missing correlation_data"))?;

        let mut properties = Properties::new()
            .with(CORRELATION_DATA_KEY, token)
            .with(STATUS_KEY, status);
        properties.set_kind(MessageType::Response);

        self.publish(&response_topic, payload, &properties).await
    }

    /// Publish an event labelled `label` on an application topic
    pub async fn publish_event<P>(&mut self, topic: &str, label: &str, payload: &P) -> ClientResult<()>
    where
        P: Serialize + ?Sized + Sync,
    {
        let mut properties = Properties::new().with(LABEL_KEY, label);
        properties.set_kind(MessageType::Event);

        self.publish(topic, payload, &properties).await
    }
}
