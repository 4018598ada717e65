//! Timer events as a pair of rows: a scheduler job that fires the timer and
//! a correlation row that lets the process side find and cancel it. Both
//! rows share the trigger name.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info};

use crate::core::correlation::EventCorrelationEngine;
use crate::core::jobs::timer_event_job::{ONE_SHOT_ATTRIBUTE, TIMER_ID_ATTRIBUTE};
use crate::core::jobs::TimerEventJob;
use crate::core::scheduler::SchedulerService;
use crate::core::transaction::Transaction;
use crate::domain::entities::{JobDescriptor, TimerEventTriggerInstance, Trigger};
use crate::error::{AppError, Result, ResultExt};

pub struct TimerService {
    engine: Arc<EventCorrelationEngine>,
    scheduler: Arc<SchedulerService>,
}

impl TimerService {
    pub fn new(engine: Arc<EventCorrelationEngine>, scheduler: Arc<SchedulerService>) -> Self {
        Self { engine, scheduler }
    }

    /// Schedules the timer job and stores the correlation row in `tx`. The
    /// trigger is renamed after the row so that either side finds the other.
    pub async fn arm_timer(
        &self,
        tx: &Transaction,
        mut timer: TimerEventTriggerInstance,
        trigger: Trigger,
    ) -> Result<TimerEventTriggerInstance> {
        let one_shot = !trigger.schedule.is_recurring();
        let mut trigger = trigger;
        trigger.name = timer.trigger_name.clone();
        trigger.group = timer.group.clone();

        let descriptor = JobDescriptor::new(timer.tenant_id, TimerEventJob::CLASS_NAME, timer.job_name.clone())
            .with_description(format!("Timer event {}", timer.event_instance_name))
            .disallow_concurrent_execution()
            .with_parameter(TIMER_ID_ATTRIBUTE, json!(timer.id))
            .with_parameter(ONE_SHOT_ATTRIBUTE, json!(one_shot));

        let trigger = self
            .scheduler
            .schedule(tx, descriptor, trigger)
            .await
            .or_wrap(|| AppError::creation(format!("Cannot schedule timer {}", timer.event_instance_name)))?;
        timer.execution_date = trigger.next_fire_time;

        let timer = self.engine.create_timer_trigger_instance(tx, timer).await?;
        info!(
            timer_id = %timer.id,
            event = %timer.event_instance_name,
            process_instance_id = timer.process_instance_id,
            "⏰ Timer armed"
        );
        Ok(timer)
    }

    /// Deletes the timer job, then the correlation row. Either may already
    /// be gone, so running this twice is harmless.
    pub async fn cancel_timer(&self, tx: &Transaction, timer: &TimerEventTriggerInstance) -> Result<()> {
        let job_deleted = self
            .scheduler
            .delete_job(tx, timer.tenant_id, &timer.job_name)
            .await
            .or_wrap(|| AppError::modification(format!("Cannot delete timer job {}", timer.job_name)))?;
        let row_deleted = self.engine.delete_timer_trigger_instance(tx, &timer.id).await?;

        debug!(
            timer_id = %timer.id,
            job_deleted,
            row_deleted,
            "Timer cancelled"
        );
        Ok(())
    }

    pub async fn cancel_timers_of_process_instance(&self, tx: &Transaction, process_instance_id: i64) -> Result<u64> {
        let timers = self
            .engine
            .get_timer_trigger_instances_of_process_instance(tx, process_instance_id)
            .await?;

        let mut cancelled = 0;
        for timer in &timers {
            self.cancel_timer(tx, timer).await?;
            cancelled += 1;
        }
        if cancelled > 0 {
            info!(process_instance_id, cancelled, "Timers of process instance cancelled");
        }
        Ok(cancelled)
    }
}
