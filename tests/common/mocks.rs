use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bpm_event_core::core::jobs::{CoupleHandler, StatelessJob, TimerEventHandler};
use bpm_event_core::core::scheduler::SchedulerService;
use bpm_event_core::core::transaction::Transaction;
use bpm_event_core::domain::entities::{JobParameters, MessageEventCouple, TimerEventTriggerInstance};
use bpm_event_core::{AppError, Result};
use tokio::sync::Mutex;

/// Records delivered couples; fails every delivery while `fail` is set
#[derive(Default)]
pub struct RecordingCoupleHandler {
    pub delivered: Mutex<Vec<MessageEventCouple>>,
    pub fail: AtomicBool,
}

impl RecordingCoupleHandler {
    pub async fn delivered_count(&self) -> usize {
        self.delivered.lock().await.len()
    }
}

#[async_trait]
impl CoupleHandler for RecordingCoupleHandler {
    async fn handle(&self, _tx: &Transaction, couple: &MessageEventCouple) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::execution("delivery refused"));
        }
        self.delivered.lock().await.push(couple.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingTimerHandler {
    pub fired: Mutex<Vec<TimerEventTriggerInstance>>,
}

#[async_trait]
impl TimerEventHandler for RecordingTimerHandler {
    async fn on_timer(&self, _tx: &Transaction, timer: &TimerEventTriggerInstance) -> Result<()> {
        self.fired.lock().await.push(timer.clone());
        Ok(())
    }
}

pub const COUNTING_JOB: &str = "CountingJob";

/// Shared state of every `CountingJob` instance
#[derive(Default)]
pub struct JobTally {
    pub runs: AtomicUsize,
    pub fail: AtomicBool,
    pub last_label: std::sync::Mutex<Option<String>>,
}

impl JobTally {
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

struct CountingJob {
    tally: Arc<JobTally>,
    label: Option<String>,
}

#[async_trait]
impl StatelessJob for CountingJob {
    fn name(&self) -> String {
        COUNTING_JOB.to_string()
    }

    fn description(&self) -> String {
        "Counts its executions".to_string()
    }

    fn set_attributes(&mut self, attributes: &JobParameters) -> Result<()> {
        self.label = attributes.get("label").and_then(|v| v.as_str()).map(str::to_string);
        Ok(())
    }

    async fn execute(&self, _tx: &Transaction) -> Result<()> {
        self.tally.runs.fetch_add(1, Ordering::SeqCst);
        *self.tally.last_label.lock().unwrap() = self.label.clone();
        if self.tally.fail.load(Ordering::SeqCst) {
            return Err(AppError::execution("counting job failed on purpose"));
        }
        Ok(())
    }
}

pub async fn register_counting_job(scheduler: &SchedulerService) -> Arc<JobTally> {
    let tally = Arc::new(JobTally::default());
    let shared = Arc::clone(&tally);
    scheduler
        .register_job(COUNTING_JOB, move || {
            Box::new(CountingJob {
                tally: Arc::clone(&shared),
                label: None,
            })
        })
        .await;
    tally
}
