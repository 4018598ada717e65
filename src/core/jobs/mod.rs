//! Job contract, registry and the platform jobs

pub mod message_correlation_job;
pub mod message_retention_job;
pub mod stateless_job;
pub mod timer_event_job;

pub use message_correlation_job::{CoupleHandler, MessageCorrelationJob};
pub use message_retention_job::MessageRetentionJob;
pub use stateless_job::{InstrumentedJob, JobFactory, JobRegistry, StatelessJob};
pub use timer_event_job::{TimerEventHandler, TimerEventJob};

use crate::domain::entities::JobParameters;
use crate::error::{AppError, Result};

pub(crate) fn u64_attribute(attributes: &JobParameters, key: &str) -> Result<Option<u64>> {
    match attributes.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(value) => value.as_u64().map(Some).ok_or_else(|| {
            AppError::ConfigurationError(format!("Job attribute '{}' must be a positive integer, got {}", key, value))
        }),
    }
}

pub(crate) fn string_attribute(attributes: &JobParameters, key: &str) -> Result<String> {
    attributes
        .get(key)
        .and_then(|value| value.as_str())
        .map(str::to_string)
        .ok_or_else(|| AppError::ConfigurationError(format!("Job attribute '{}' is missing", key)))
}
