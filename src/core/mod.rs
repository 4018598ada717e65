//! Core services: transactions, event correlation, scheduling and timers

pub mod clock;
pub mod correlation;
pub mod jobs;
pub mod logging;
pub mod scheduler;
pub mod timer_service;
pub mod transaction;

pub use clock::{Clock, CreationSequence, ManualClock, SystemClock};
pub use correlation::EventCorrelationEngine;
pub use jobs::{JobRegistry, StatelessJob};
pub use scheduler::{DispatchReport, SchedulerService};
pub use timer_service::TimerService;
pub use transaction::{RetryTransactionExecutor, Transaction};
