use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{string_attribute, StatelessJob};
use crate::core::correlation::EventCorrelationEngine;
use crate::core::transaction::Transaction;
use crate::domain::entities::{JobParameters, TimerEventTriggerInstance};
use crate::error::{AppError, Result};

pub const TIMER_ID_ATTRIBUTE: &str = "timer_trigger_instance_id";
pub const ONE_SHOT_ATTRIBUTE: &str = "one_shot";

/// Reacts to a timer firing in the process instance that owns it
#[async_trait]
pub trait TimerEventHandler: Send + Sync {
    async fn on_timer(&self, tx: &Transaction, timer: &TimerEventTriggerInstance) -> Result<()>;
}

/// Fires a timer event. The timer row is the source of truth: when it is
/// gone the timer was cancelled and the firing is dropped.
pub struct TimerEventJob {
    engine: Arc<EventCorrelationEngine>,
    handler: Arc<dyn TimerEventHandler>,
    timer_id: Option<String>,
    one_shot: bool,
}

impl TimerEventJob {
    pub const CLASS_NAME: &'static str = "TimerEventJob";

    pub fn new(engine: Arc<EventCorrelationEngine>, handler: Arc<dyn TimerEventHandler>) -> Self {
        Self {
            engine,
            handler,
            timer_id: None,
            one_shot: true,
        }
    }
}

#[async_trait]
impl StatelessJob for TimerEventJob {
    fn name(&self) -> String {
        Self::CLASS_NAME.to_string()
    }

    fn description(&self) -> String {
        "Triggers a timer event".to_string()
    }

    fn set_attributes(&mut self, attributes: &JobParameters) -> Result<()> {
        self.timer_id = Some(string_attribute(attributes, TIMER_ID_ATTRIBUTE)?);
        self.one_shot = attributes
            .get(ONE_SHOT_ATTRIBUTE)
            .and_then(|value| value.as_bool())
            .unwrap_or(true);
        Ok(())
    }

    async fn execute(&self, tx: &Transaction) -> Result<()> {
        let timer_id = self
            .timer_id
            .as_deref()
            .ok_or_else(|| AppError::execution("Timer job ran without a timer id"))?;

        let Some(timer) = self.engine.get_timer_trigger_instance(tx, timer_id).await? else {
            info!(timer_id = %timer_id, "Timer was cancelled, ignoring firing");
            return Ok(());
        };

        self.handler
            .on_timer(tx, &timer)
            .await
            .map_err(|e| AppError::execution(format!("Timer event {} failed", timer.event_instance_name)).with_source(e))?;

        if self.one_shot {
            self.engine.delete_timer_trigger_instance(tx, timer_id).await?;
        }
        debug!(timer_id = %timer_id, event = %timer.event_instance_name, "Timer event triggered");
        Ok(())
    }
}
