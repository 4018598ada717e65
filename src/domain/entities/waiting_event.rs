//! Waiting events: persisted catch conditions raised by running process instances

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::infrastructure::persistence::{Persistent, RecordKind};

/// Upper bound on the correlation pairs carried by a message or a waiting event
pub const MAX_CORRELATIONS: usize = 5;

/// One named correlation value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Correlation {
    pub key: String,
    pub value: String,
}

impl Correlation {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Where the catching construct sits in the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CatchEventKind {
    Start,
    Intermediate,
    Boundary,
    EventSubProcessStart,
}

impl CatchEventKind {
    /// Process start events stay in place after a match: each match starts a
    /// new process instance.
    pub fn is_reusable(&self) -> bool {
        matches!(self, CatchEventKind::Start)
    }
}

/// What the waiting event is waiting for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum WaitingTrigger {
    Signal {
        signal_name: String,
    },
    Message {
        message_name: String,
        #[serde(default)]
        correlations: Vec<Correlation>,
    },
    Error {
        /// `None` catches every error code
        error_code: Option<String>,
        related_activity_instance_id: Option<i64>,
    },
}

impl WaitingTrigger {
    pub fn event_type(&self) -> &'static str {
        match self {
            WaitingTrigger::Signal { .. } => "Signal",
            WaitingTrigger::Message { .. } => "Message",
            WaitingTrigger::Error { .. } => "Error",
        }
    }

    /// Signal name, message name or error code
    pub fn correlation_name(&self) -> Option<&str> {
        match self {
            WaitingTrigger::Signal { signal_name } => Some(signal_name),
            WaitingTrigger::Message { message_name, .. } => Some(message_name),
            WaitingTrigger::Error { error_code, .. } => error_code.as_deref(),
        }
    }

    /// Declared correlation pairs; only message triggers have them
    pub fn correlation_keys(&self) -> Option<&[Correlation]> {
        match self {
            WaitingTrigger::Message { correlations, .. } => Some(correlations),
            _ => None,
        }
    }

    pub fn has_correlation_keys(&self) -> bool {
        self.correlation_keys().is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitingEvent {
    pub id: String,
    #[serde(flatten)]
    pub trigger: WaitingTrigger,
    pub event_kind: CatchEventKind,
    pub process_definition_id: i64,
    pub process_name: String,
    pub flow_node_name: String,
    pub flow_node_definition_id: i64,
    /// `None` for start events, which belong to the definition
    pub flow_node_instance_id: Option<i64>,
    pub parent_process_instance_id: Option<i64>,
    pub root_process_instance_id: Option<i64>,
    pub sub_process_id: Option<i64>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    /// Orders events created in the same millisecond
    #[serde(default)]
    pub creation_seq: i64,
    pub in_progress: bool,
    pub active: bool,
    #[serde(default)]
    pub version: u64,
}

impl WaitingEvent {
    pub fn new(
        trigger: WaitingTrigger,
        event_kind: CatchEventKind,
        process_name: impl Into<String>,
        flow_node_name: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            trigger,
            event_kind,
            process_definition_id: 0,
            process_name: process_name.into(),
            flow_node_name: flow_node_name.into(),
            flow_node_definition_id: 0,
            flow_node_instance_id: None,
            parent_process_instance_id: None,
            root_process_instance_id: None,
            sub_process_id: None,
            created_at: Utc::now(),
            creation_seq: 0,
            in_progress: false,
            active: true,
            version: 0,
        }
    }

    pub fn message(
        message_name: impl Into<String>,
        correlations: Vec<Correlation>,
        event_kind: CatchEventKind,
        process_name: impl Into<String>,
        flow_node_name: impl Into<String>,
    ) -> Self {
        Self::new(
            WaitingTrigger::Message {
                message_name: message_name.into(),
                correlations,
            },
            event_kind,
            process_name,
            flow_node_name,
        )
    }

    pub fn signal(
        signal_name: impl Into<String>,
        event_kind: CatchEventKind,
        process_name: impl Into<String>,
        flow_node_name: impl Into<String>,
    ) -> Self {
        Self::new(
            WaitingTrigger::Signal {
                signal_name: signal_name.into(),
            },
            event_kind,
            process_name,
            flow_node_name,
        )
    }

    /// Boundary error event attached to `related_activity_instance_id`
    pub fn boundary_error(
        error_code: Option<String>,
        related_activity_instance_id: i64,
        process_name: impl Into<String>,
        flow_node_name: impl Into<String>,
    ) -> Self {
        Self::new(
            WaitingTrigger::Error {
                error_code,
                related_activity_instance_id: Some(related_activity_instance_id),
            },
            CatchEventKind::Boundary,
            process_name,
            flow_node_name,
        )
    }

    pub fn with_definition(mut self, process_definition_id: i64, flow_node_definition_id: i64) -> Self {
        self.process_definition_id = process_definition_id;
        self.flow_node_definition_id = flow_node_definition_id;
        self
    }

    pub fn in_process_instance(
        mut self,
        root_process_instance_id: i64,
        parent_process_instance_id: i64,
        flow_node_instance_id: i64,
    ) -> Self {
        self.root_process_instance_id = Some(root_process_instance_id);
        self.parent_process_instance_id = Some(parent_process_instance_id);
        self.flow_node_instance_id = Some(flow_node_instance_id);
        self
    }

    pub fn in_sub_process(mut self, sub_process_id: i64) -> Self {
        self.sub_process_id = Some(sub_process_id);
        self
    }

    /// Can take part in a new match
    pub fn is_matchable(&self) -> bool {
        self.active && !self.in_progress
    }
}

impl Persistent for WaitingEvent {
    const KIND: RecordKind = RecordKind::WaitingEvent;

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
