use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::infrastructure::persistence::{Persistent, RecordKind};

/// A live timer of a flow node, joined to its scheduler job by `job_name`
/// and to the scheduler trigger by (`group`, `trigger_name`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerEventTriggerInstance {
    pub id: String,
    pub tenant_id: i64,
    pub event_instance_id: i64,
    pub event_instance_name: String,
    pub job_name: String,
    pub trigger_name: String,
    pub group: String,
    pub process_instance_id: i64,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub execution_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: u64,
}

impl TimerEventTriggerInstance {
    pub fn new(
        tenant_id: i64,
        process_instance_id: i64,
        event_instance_id: i64,
        event_instance_name: impl Into<String>,
    ) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let job_name = format!("Timer_Ev_{}", id);
        Self {
            trigger_name: job_name.clone(),
            job_name,
            id,
            tenant_id,
            event_instance_id,
            event_instance_name: event_instance_name.into(),
            group: tenant_id.to_string(),
            process_instance_id,
            execution_date: None,
            version: 0,
        }
    }
}

impl Persistent for TimerEventTriggerInstance {
    const KIND: RecordKind = RecordKind::TimerTriggerInstance;

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
