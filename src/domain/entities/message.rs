use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::waiting_event::{Correlation, WaitingEvent};
use crate::infrastructure::persistence::{Persistent, RecordKind};

/// A fired message waiting for a matching waiting message event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageInstance {
    pub id: String,
    pub message_name: String,
    pub target_process: String,
    /// When set, only waiting events on this flow node can take the message
    pub target_flow_node: Option<String>,
    #[serde(default)]
    pub correlations: Vec<Correlation>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub creation_seq: i64,
    /// Claimed by a correlation pass
    pub handled: bool,
    #[serde(default)]
    pub version: u64,
}

impl MessageInstance {
    pub fn new(message_name: impl Into<String>, target_process: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            message_name: message_name.into(),
            target_process: target_process.into(),
            target_flow_node: None,
            correlations: Vec::new(),
            payload: serde_json::Value::Null,
            created_at: Utc::now(),
            creation_seq: 0,
            handled: false,
            version: 0,
        }
    }

    pub fn to_flow_node(mut self, flow_node_name: impl Into<String>) -> Self {
        self.target_flow_node = Some(flow_node_name.into());
        self
    }

    pub fn with_correlation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.correlations.push(Correlation::new(key, value));
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn correlation_value(&self, key: &str) -> Option<&str> {
        self.correlations
            .iter()
            .find(|c| c.key == key)
            .map(|c| c.value.as_str())
    }
}

impl Persistent for MessageInstance {
    const KIND: RecordKind = RecordKind::MessageInstance;

    fn id(&self) -> String {
        self.id.clone()
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

/// A message paired with the waiting event that takes it. Never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEventCouple {
    pub message: MessageInstance,
    pub waiting_event: WaitingEvent,
}
