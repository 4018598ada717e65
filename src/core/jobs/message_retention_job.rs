use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;

use super::{u64_attribute, StatelessJob};
use crate::core::clock::Clock;
use crate::core::correlation::EventCorrelationEngine;
use crate::core::transaction::Transaction;
use crate::domain::entities::JobParameters;
use crate::error::{AppError, Result};

const DEFAULT_BATCH: usize = 1000;

/// Deletes messages that found no waiting event within the retention period
pub struct MessageRetentionJob {
    engine: Arc<EventCorrelationEngine>,
    clock: Arc<dyn Clock>,
    retention_millis: Option<u64>,
    batch_size: usize,
}

impl MessageRetentionJob {
    pub const CLASS_NAME: &'static str = "MessageRetentionJob";

    pub fn new(engine: Arc<EventCorrelationEngine>, clock: Arc<dyn Clock>) -> Self {
        Self {
            engine,
            clock,
            retention_millis: None,
            batch_size: DEFAULT_BATCH,
        }
    }
}

#[async_trait]
impl StatelessJob for MessageRetentionJob {
    fn name(&self) -> String {
        Self::CLASS_NAME.to_string()
    }

    fn description(&self) -> String {
        "Deletes unmatched message instances past their retention period".to_string()
    }

    fn set_attributes(&mut self, attributes: &JobParameters) -> Result<()> {
        self.retention_millis = Some(u64_attribute(attributes, "retention_millis")?.ok_or_else(|| {
            AppError::ConfigurationError("Job attribute 'retention_millis' is missing".to_string())
        })?);
        if let Some(batch_size) = u64_attribute(attributes, "batch_size")? {
            self.batch_size = batch_size.max(1) as usize;
        }
        Ok(())
    }

    async fn execute(&self, tx: &Transaction) -> Result<()> {
        let retention_millis = self.retention_millis.ok_or_else(|| {
            AppError::execution("Message retention job ran without a retention period")
        })?;
        let cutoff = self.clock.now() - Duration::milliseconds(retention_millis as i64);
        self.engine
            .delete_message_instances_created_before(tx, cutoff, self.batch_size)
            .await?;
        Ok(())
    }
}
