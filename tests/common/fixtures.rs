use std::future::Future;
use std::sync::Arc;

use bpm_event_core::config::AppConfiguration;
use bpm_event_core::core::clock::{Clock, ManualClock};
use bpm_event_core::core::transaction::Transaction;
use bpm_event_core::infrastructure::persistence::InMemoryPersistence;
use bpm_event_core::{Collaborators, Result, ServiceRegistry};
use chrono::{DateTime, TimeZone, Utc};

use super::mocks::{RecordingCoupleHandler, RecordingTimerHandler};

pub const TENANT: i64 = 1;

/// Monday 2024-01-15 12:00:00 UTC
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()
}

pub fn test_config() -> AppConfiguration {
    let mut config = AppConfiguration::default();
    config.node_id = "test-node".to_string();
    config.scheduler.workers = 1;
    config.scheduler.poll_interval_ms = 10;
    config.scheduler.misfire_threshold_ms = 60_000;
    config.retry.max_retries = 3;
    config.retry.wait_time_ms = 1;
    config
}

/// One node on an in-memory store with a manual clock set to `t0()`
pub struct TestNode {
    pub services: ServiceRegistry,
    pub store: Arc<InMemoryPersistence>,
    pub clock: Arc<ManualClock>,
    pub couples: Arc<RecordingCoupleHandler>,
    pub timers: Arc<RecordingTimerHandler>,
}

impl TestNode {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: AppConfiguration) -> Self {
        let store = Arc::new(InMemoryPersistence::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let couples = Arc::new(RecordingCoupleHandler::default());
        let timers = Arc::new(RecordingTimerHandler::default());

        let clock_handle: Arc<dyn Clock> = clock.clone();
        let services = ServiceRegistry::build_with(
            config,
            clock_handle,
            Arc::clone(&store),
            Collaborators {
                couple_handler: couples.clone(),
                timer_handler: timers.clone(),
            },
        );

        Self {
            services,
            store,
            clock,
            couples,
            timers,
        }
    }

    /// Runs `work` in a retried transaction
    pub async fn run<T, F, Fut>(&self, work: F) -> Result<T>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.services.executor.execute(work).await
    }

    pub fn advance_minutes(&self, minutes: i64) {
        self.clock.advance(chrono::Duration::minutes(minutes));
    }
}
