//! Topic naming scheme and topic filter matching
//!
//! Every direct-addressing topic in the crate is built here:
//!
//! - inbox filter: `agents/{agent}/api/{version}/in/#`
//! - outgoing:     `agents/{agent}/api/{version}/out/{account}`
//! - inbox:        `agents/{agent}/api/{version}/in/{account}`
//! - requests:     `agents/+/api/{version}/out/{account}` (service side)
//!
//! Broadcast topics under `apps/{account}/api/{version}/...` belong to the
//! application; [`TopicBuilder::build_app_topic`] only joins the prefix.

use crate::protocol::identity::{Account, Agent};
use thiserror::Error;

/// Api version used when none is configured
pub const DEFAULT_API_VERSION: &str = "v1";

/// Builds topic strings for one api version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBuilder {
    api_version: String,
}

impl Default for TopicBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_API_VERSION)
    }
}

impl TopicBuilder {
    pub fn new(api_version: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
        }
    }

    pub fn api_version(&self) -> &str {
        &self.api_version
    }

    /// Wildcard filter covering everything delivered to `agent`'s inbox
    pub fn build_inbox_filter(&self, agent: &Agent) -> String {
        format!("agents/{agent}/api/{}/in/#", self.api_version)
    }

    /// Topic `agent` publishes on when addressing `account`
    pub fn build_outgoing_topic(&self, agent: &Agent, account: &Account) -> String {
        format!("agents/{agent}/api/{}/out/{account}", self.api_version)
    }

    /// `agent`'s inbox scoped to messages coming from `account`.
    ///
    /// This is the response topic hint embedded in requests.
    pub fn build_inbox_topic(&self, agent: &Agent, account: &Account) -> String {
        format!("agents/{agent}/api/{}/in/{account}", self.api_version)
    }

    /// Filter a service subscribes to for every request addressed to `account`
    pub fn build_requests_filter(&self, account: &Account) -> String {
        format!("agents/+/api/{}/out/{account}", self.api_version)
    }

    /// Application topic `apps/{account}/api/{version}/{path}`
    pub fn build_app_topic(&self, account: &Account, path: &str) -> String {
        let path = path.trim_matches('/');
        format!("apps/{account}/api/{}/{path}", self.api_version)
    }
}

/// Check a topic name against an MQTT topic filter (`+` and `#` wildcards)
pub fn matches_filter(filter: &str, topic: &str) -> bool {
    // Wildcards never match system topics unless the filter is explicit
    if topic.starts_with('$') && !filter.starts_with('$') {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Validate a label or audience before it is used as a topic segment
pub fn validate_segment(segment: &str) -> Result<(), ValidationError> {
    if segment.is_empty() {
        return Err(ValidationError::EmptySegment);
    }

    for ch in segment.chars() {
        if matches!(ch, '/' | '+' | '#') || ch.is_whitespace() || ch.is_control() {
            return Err(ValidationError::InvalidSegmentChar(ch));
        }
    }

    Ok(())
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Topic segment cannot be empty")]
    EmptySegment,
    #[error("Topic segment contains invalid character: '{0}'")]
    InvalidSegmentChar(char),
}
