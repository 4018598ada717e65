//! Scheduler entities: job descriptors, triggers, job logs and tenant state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::infrastructure::persistence::{Persistent, RecordKind};

/// Attributes handed to a job before it runs
pub type JobParameters = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub id: String,
    pub tenant_id: i64,
    pub job_name: String,
    /// Key of the job factory in the job registry
    pub job_class_name: String,
    pub description: String,
    pub disallow_concurrent_execution: bool,
    #[serde(default)]
    pub parameters: JobParameters,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub running_since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub running_on: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl JobDescriptor {
    pub fn new(tenant_id: i64, job_class_name: impl Into<String>, job_name: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id,
            job_name: job_name.into(),
            job_class_name: job_class_name.into(),
            description: String::new(),
            disallow_concurrent_execution: false,
            parameters: JobParameters::new(),
            running_since: None,
            running_on: None,
            created_at: Utc::now(),
            version: 0,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn disallow_concurrent_execution(mut self) -> Self {
        self.disallow_concurrent_execution = true;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn is_running(&self) -> bool {
        self.running_since.is_some()
    }
}

/// When a trigger fires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "schedule_type")]
pub enum TriggerSchedule {
    OneShot {
        #[serde(with = "chrono::serde::ts_milliseconds")]
        at: DateTime<Utc>,
    },
    /// Unix cron expression (5 fields, or 6/7 with seconds and year) evaluated
    /// at a fixed offset from UTC
    UnixCron {
        expression: String,
        #[serde(default)]
        utc_offset_minutes: i32,
    },
    /// Fires every `every_millis` from the trigger start; `repeat_count` is
    /// the total number of firings, unbounded when absent
    Interval {
        every_millis: u64,
        #[serde(default)]
        repeat_count: Option<u64>,
    },
}

impl TriggerSchedule {
    pub fn is_recurring(&self) -> bool {
        !matches!(self, TriggerSchedule::OneShot { .. })
    }
}

/// What happens to firings missed while the scheduler was down or the tenant paused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MisfirePolicy {
    /// Skip to the next natural occurrence
    None,
    /// Fire once as soon as possible, then resume the normal cadence
    Restart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerState {
    Scheduled,
    Due,
    Executing,
    Paused,
    Done,
    Erroneous,
}

impl TriggerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerState::Scheduled => "Scheduled",
            TriggerState::Due => "Due",
            TriggerState::Executing => "Executing",
            TriggerState::Paused => "Paused",
            TriggerState::Done => "Done",
            TriggerState::Erroneous => "Erroneous",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: String,
    pub name: String,
    pub group: String,
    pub tenant_id: i64,
    pub job_descriptor_id: String,
    pub schedule: TriggerSchedule,
    pub misfire_policy: MisfirePolicy,
    pub state: TriggerState,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub start_at: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub end_at: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub next_fire_time: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub previous_fire_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fire_count: u64,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub claimed_by: Option<String>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: u64,
}

impl Trigger {
    fn new(name: impl Into<String>, schedule: TriggerSchedule, start_at: DateTime<Utc>) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            group: String::new(),
            tenant_id: 0,
            job_descriptor_id: String::new(),
            schedule,
            misfire_policy: MisfirePolicy::None,
            state: TriggerState::Scheduled,
            start_at,
            end_at: None,
            next_fire_time: None,
            previous_fire_time: None,
            fire_count: 0,
            paused_at: None,
            claimed_by: None,
            claimed_at: None,
            version: 0,
        }
    }

    pub fn one_shot(name: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self::new(name, TriggerSchedule::OneShot { at }, at)
    }

    /// Cron trigger starting now; the scheduler stamps the start time when
    /// it is left at the Unix epoch
    pub fn unix_cron(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self::new(
            name,
            TriggerSchedule::UnixCron {
                expression: expression.into(),
                utc_offset_minutes: 0,
            },
            DateTime::<Utc>::from(std::time::UNIX_EPOCH),
        )
    }

    pub fn interval(name: impl Into<String>, every: chrono::Duration, repeat_count: Option<u64>) -> Self {
        Self::new(
            name,
            TriggerSchedule::Interval {
                every_millis: every.num_milliseconds().max(1) as u64,
                repeat_count,
            },
            DateTime::<Utc>::from(std::time::UNIX_EPOCH),
        )
    }

    pub fn with_misfire_policy(mut self, misfire_policy: MisfirePolicy) -> Self {
        self.misfire_policy = misfire_policy;
        self
    }

    pub fn with_utc_offset_minutes(mut self, minutes: i32) -> Self {
        if let TriggerSchedule::UnixCron { utc_offset_minutes, .. } = &mut self.schedule {
            *utc_offset_minutes = minutes;
        }
        self
    }

    pub fn starting_at(mut self, start_at: DateTime<Utc>) -> Self {
        self.start_at = start_at;
        if let TriggerSchedule::OneShot { at } = &mut self.schedule {
            *at = start_at;
        }
        self
    }

    pub fn ending_at(mut self, end_at: DateTime<Utc>) -> Self {
        self.end_at = Some(end_at);
        self
    }

    /// Record id derived from the unique (group, name) pair
    pub fn id_for(group: &str, name: &str) -> String {
        format!("{}/{}", group, name)
    }

    pub fn is_start_unset(&self) -> bool {
        self.start_at.timestamp_millis() == 0
    }
}

impl Persistent for JobDescriptor {
    const KIND: RecordKind = RecordKind::JobDescriptor;

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

impl Persistent for Trigger {
    const KIND: RecordKind = RecordKind::Trigger;

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

/// Failure history of one job descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLog {
    pub id: String,
    pub job_descriptor_id: String,
    pub tenant_id: i64,
    pub exception_message: String,
    pub retry_number: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_update: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl Persistent for JobLog {
    const KIND: RecordKind = RecordKind::JobLog;

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

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantState {
    pub id: String,
    pub tenant_id: i64,
    pub paused: bool,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: u64,
}

impl TenantState {
    pub fn id_for(tenant_id: i64) -> String {
        format!("tenant-{}", tenant_id)
    }
}

impl Persistent for TenantState {
    const KIND: RecordKind = RecordKind::TenantState;

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
