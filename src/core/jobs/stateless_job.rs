//! Job contract and the registry that instantiates jobs by class name

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{info, warn, Instrument};

use crate::core::transaction::Transaction;
use crate::domain::entities::JobParameters;
use crate::error::{AppError, Result};

/// A unit of scheduled work. A fresh instance is built for every firing,
/// so implementations keep no state between runs.
#[async_trait]
pub trait StatelessJob: Send + Sync {
    fn name(&self) -> String;

    fn description(&self) -> String;

    /// Receives the descriptor parameters before `execute`. Missing or
    /// malformed attributes are a `ConfigurationError`.
    fn set_attributes(&mut self, attributes: &JobParameters) -> Result<()>;

    /// Runs inside the transaction the scheduler opened for this attempt
    async fn execute(&self, tx: &Transaction) -> Result<()>;
}

/// Builds a job instance
pub type JobFactory = Arc<dyn Fn() -> Box<dyn StatelessJob> + Send + Sync>;

/// Wraps a job in a tracing span and logs its duration
pub struct InstrumentedJob {
    inner: Box<dyn StatelessJob>,
}

impl InstrumentedJob {
    pub fn new(inner: Box<dyn StatelessJob>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl StatelessJob for InstrumentedJob {
    fn name(&self) -> String {
        self.inner.name()
    }

    fn description(&self) -> String {
        self.inner.description()
    }

    fn set_attributes(&mut self, attributes: &JobParameters) -> Result<()> {
        self.inner.set_attributes(attributes)
    }

    async fn execute(&self, tx: &Transaction) -> Result<()> {
        let span = tracing::info_span!("job", job = %self.inner.name(), transaction_id = %tx.id());
        let started = Instant::now();

        let result = self.inner.execute(tx).instrument(span).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(()) => info!(job = %self.inner.name(), elapsed_ms, "✅ Job completed"),
            Err(e) => warn!(job = %self.inner.name(), elapsed_ms, error = %e, "Job failed"),
        }
        result
    }
}

/// Maps job class names to factories
#[derive(Clone, Default)]
pub struct JobRegistry {
    factories: HashMap<String, JobFactory>,
    instrumented: bool,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every job created by this registry is wrapped in an `InstrumentedJob`
    pub fn instrumented() -> Self {
        Self {
            factories: HashMap::new(),
            instrumented: true,
        }
    }

    pub fn register<F>(&mut self, class_name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn StatelessJob> + Send + Sync + 'static,
    {
        self.factories.insert(class_name.into(), Arc::new(factory));
    }

    pub fn contains(&self, class_name: &str) -> bool {
        self.factories.contains_key(class_name)
    }

    pub fn class_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn create(&self, class_name: &str) -> Result<Box<dyn StatelessJob>> {
        let factory = self.factories.get(class_name).ok_or_else(|| {
            AppError::scheduler(format!("No job registered for class '{}'", class_name))
        })?;

        let job = factory();
        if self.instrumented {
            Ok(Box::new(InstrumentedJob::new(job)))
        } else {
            Ok(job)
        }
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("classes", &self.class_names())
            .field("instrumented", &self.instrumented)
            .finish()
    }
}
