//! Wires the store, transaction manager, correlation engine, scheduler and
//! timer service of one node, and drives their lifecycle

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::info;

use crate::config::{AppConfiguration, StoreBackend};
use crate::core::clock::Clock;
use crate::core::correlation::EventCorrelationEngine;
use crate::core::jobs::{
    CoupleHandler, JobRegistry, MessageCorrelationJob, MessageRetentionJob, TimerEventHandler, TimerEventJob,
};
use crate::core::scheduler::SchedulerService;
use crate::core::timer_service::TimerService;
use crate::core::transaction::{
    DefaultTransactionManager, RestartPolicy, RetryTransactionExecutor, Transaction, TransactionService,
    TransactionalResource,
};
use crate::domain::entities::{JobDescriptor, MessageEventCouple, TimerEventTriggerInstance, Trigger};
use crate::domain::repositories::{EntityStore, EventCorrelationStore, SchedulerStore};
use crate::error::{AppError, Result};
use crate::infrastructure::persistence::{InMemoryPersistence, MongoPersistence, PersistenceService};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ServiceStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Process-side callbacks invoked by the platform jobs
#[derive(Clone)]
pub struct Collaborators {
    pub couple_handler: Arc<dyn CoupleHandler>,
    pub timer_handler: Arc<dyn TimerEventHandler>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            couple_handler: Arc::new(LoggingHandler),
            timer_handler: Arc::new(LoggingHandler),
        }
    }
}

/// Stand-in collaborator for a node that runs without a process engine
struct LoggingHandler;

#[async_trait]
impl CoupleHandler for LoggingHandler {
    async fn handle(&self, _tx: &Transaction, couple: &MessageEventCouple) -> Result<()> {
        info!(
            message = %couple.message.message_name,
            waiting_event_id = %couple.waiting_event.id,
            process = %couple.waiting_event.process_name,
            "📝 Message correlated"
        );
        Ok(())
    }
}

#[async_trait]
impl TimerEventHandler for LoggingHandler {
    async fn on_timer(&self, _tx: &Transaction, timer: &TimerEventTriggerInstance) -> Result<()> {
        info!(
            event = %timer.event_instance_name,
            process_instance_id = timer.process_instance_id,
            "📝 Timer fired"
        );
        Ok(())
    }
}

pub struct ServiceRegistry {
    pub config: AppConfiguration,
    pub clock: Arc<dyn Clock>,
    pub persistence: Arc<dyn PersistenceService>,
    pub transactions: Arc<DefaultTransactionManager>,
    pub executor: RetryTransactionExecutor,
    pub engine: Arc<EventCorrelationEngine>,
    pub scheduler: Arc<SchedulerService>,
    pub timers: Arc<TimerService>,
    status: RwLock<ServiceStatus>,
}

impl ServiceRegistry {
    /// Builds a node on the configured store with logging collaborators
    pub async fn build(config: AppConfiguration, clock: Arc<dyn Clock>) -> Result<Self> {
        match config.store.backend {
            StoreBackend::Memory => {
                info!("📁 Using in-memory store");
                let store = Arc::new(InMemoryPersistence::new());
                Ok(Self::build_with(config, clock, store, Collaborators::default()))
            }
            StoreBackend::Mongo => {
                let store = Arc::new(
                    MongoPersistence::connect(&config.store.mongodb_uri, &config.store.database_name).await?,
                );
                Ok(Self::build_with(config, clock, store, Collaborators::default()))
            }
        }
    }

    pub fn build_with<P>(
        config: AppConfiguration,
        clock: Arc<dyn Clock>,
        store: Arc<P>,
        collaborators: Collaborators,
    ) -> Self
    where
        P: PersistenceService + TransactionalResource + 'static,
    {
        let persistence: Arc<dyn PersistenceService> = store.clone();
        let resource: Arc<dyn TransactionalResource> = store;

        let transactions = Arc::new(DefaultTransactionManager::new(resource, Arc::clone(&clock)));
        let transaction_service: Arc<dyn TransactionService> = transactions.clone();
        let executor = RetryTransactionExecutor::from_config(
            &config.retry,
            transaction_service,
            RestartPolicy::concurrency_conflicts(),
        );

        let entities = EntityStore::new(Arc::clone(&persistence));
        let engine = Arc::new(EventCorrelationEngine::new(
            EventCorrelationStore::new(entities.clone()),
            Arc::clone(&clock),
        ));

        let registry = platform_jobs(&config, &clock, &engine, &executor, &collaborators);
        let scheduler = Arc::new(SchedulerService::new(
            SchedulerStore::new(entities),
            executor.clone(),
            registry,
            Arc::clone(&clock),
            config.scheduler.clone(),
            config.node_id.clone(),
        ));
        let timers = Arc::new(TimerService::new(Arc::clone(&engine), Arc::clone(&scheduler)));

        info!(node_id = %config.node_id, "🔧 Services wired");
        Self {
            config,
            clock,
            persistence,
            transactions,
            executor,
            engine,
            scheduler,
            timers,
            status: RwLock::new(ServiceStatus::Stopped),
        }
    }

    pub async fn status(&self) -> ServiceStatus {
        *self.status.read().await
    }

    /// Hands back couples a previous run of this node left claimed, then
    /// starts the scheduler
    pub async fn start(&self) -> Result<()> {
        {
            let mut status = self.status.write().await;
            if *status != ServiceStatus::Stopped {
                return Err(AppError::scheduler(format!("Services cannot start while {:?}", *status)));
            }
            *status = ServiceStatus::Starting;
        }

        let engine = self.engine.as_ref();
        let recovery = self
            .executor
            .execute(|tx| async move {
                let events = engine.reset_in_progress_waiting_events(&tx).await?;
                let messages = engine.reset_progress_message_instances(&tx).await?;
                Ok((events, messages))
            })
            .await;

        let started = match recovery {
            Ok((events, messages)) => {
                info!(waiting_events = events, messages, "🔄 Reset in-progress correlation rows");
                self.scheduler.start().await
            }
            Err(e) => Err(e),
        };

        let mut status = self.status.write().await;
        match started {
            Ok(()) => {
                *status = ServiceStatus::Running;
                info!(node_id = %self.config.node_id, "✅ Services started");
                Ok(())
            }
            Err(e) => {
                *status = ServiceStatus::Stopped;
                Err(e)
            }
        }
    }

    pub async fn stop(&self) -> Result<()> {
        {
            let mut status = self.status.write().await;
            if *status != ServiceStatus::Running {
                return Ok(());
            }
            *status = ServiceStatus::Stopping;
        }

        let stopped = self.scheduler.stop().await;
        *self.status.write().await = ServiceStatus::Stopped;
        info!(node_id = %self.config.node_id, "Services stopped");
        stopped
    }

    /// Schedules the correlation and retention jobs of a tenant unless they
    /// already exist
    pub async fn register_platform_jobs(&self, tenant_id: i64) -> Result<()> {
        let scheduler = self.scheduler.as_ref();
        let correlation = &self.config.correlation;
        let retention_millis = correlation.message_retention_secs.saturating_mul(1000);

        self.executor
            .execute(|tx| async move {
                if !scheduler
                    .is_existing_job(&tx, tenant_id, MessageCorrelationJob::CLASS_NAME)
                    .await?
                {
                    let descriptor =
                        JobDescriptor::new(tenant_id, MessageCorrelationJob::CLASS_NAME, MessageCorrelationJob::CLASS_NAME)
                            .with_description("Message correlation")
                            .disallow_concurrent_execution()
                            .with_parameter("batch_size", json!(correlation.batch_size));
                    let trigger = Trigger::unix_cron("message-correlation", correlation.correlation_cron.clone());
                    scheduler.schedule(&tx, descriptor, trigger).await?;
                }

                if !scheduler
                    .is_existing_job(&tx, tenant_id, MessageRetentionJob::CLASS_NAME)
                    .await?
                {
                    let descriptor =
                        JobDescriptor::new(tenant_id, MessageRetentionJob::CLASS_NAME, MessageRetentionJob::CLASS_NAME)
                            .with_description("Unmatched message retention")
                            .disallow_concurrent_execution()
                            .with_parameter("retention_millis", json!(retention_millis));
                    let trigger = Trigger::unix_cron("message-retention", correlation.retention_cron.clone());
                    scheduler.schedule(&tx, descriptor, trigger).await?;
                }
                Ok(())
            })
            .await?;

        info!(tenant_id, "📋 Platform jobs registered");
        Ok(())
    }
}

fn platform_jobs(
    config: &AppConfiguration,
    clock: &Arc<dyn Clock>,
    engine: &Arc<EventCorrelationEngine>,
    executor: &RetryTransactionExecutor,
    collaborators: &Collaborators,
) -> JobRegistry {
    let mut registry = JobRegistry::instrumented();

    let (job_engine, job_executor, handler) = (
        Arc::clone(engine),
        executor.clone(),
        Arc::clone(&collaborators.couple_handler),
    );
    let batch_size = config.correlation.batch_size;
    registry.register(MessageCorrelationJob::CLASS_NAME, move || {
        Box::new(MessageCorrelationJob::new(
            Arc::clone(&job_engine),
            job_executor.clone(),
            Arc::clone(&handler),
            batch_size,
        ))
    });

    let (job_engine, job_clock) = (Arc::clone(engine), Arc::clone(clock));
    registry.register(MessageRetentionJob::CLASS_NAME, move || {
        Box::new(MessageRetentionJob::new(Arc::clone(&job_engine), Arc::clone(&job_clock)))
    });

    let (job_engine, handler) = (Arc::clone(engine), Arc::clone(&collaborators.timer_handler));
    registry.register(TimerEventJob::CLASS_NAME, move || {
        Box::new(TimerEventJob::new(Arc::clone(&job_engine), Arc::clone(&handler)))
    });

    registry
}
