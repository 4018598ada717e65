//! Pairs pending messages with waiting events and delivers each pair once
//! the claiming transaction has committed

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use super::{u64_attribute, StatelessJob};
use crate::core::correlation::EventCorrelationEngine;
use crate::core::transaction::{RetryTransactionExecutor, Transaction, TransactionStatus, TransactionSynchronization};
use crate::domain::entities::{JobParameters, MessageEventCouple};
use crate::error::Result;

/// Receives a matched message in the owner of the waiting event, for
/// example by starting a process or resuming a flow node
#[async_trait]
pub trait CoupleHandler: Send + Sync {
    async fn handle(&self, tx: &Transaction, couple: &MessageEventCouple) -> Result<()>;
}

pub struct MessageCorrelationJob {
    engine: Arc<EventCorrelationEngine>,
    executor: RetryTransactionExecutor,
    handler: Arc<dyn CoupleHandler>,
    batch_size: usize,
}

impl MessageCorrelationJob {
    pub const CLASS_NAME: &'static str = "MessageCorrelationJob";

    pub fn new(
        engine: Arc<EventCorrelationEngine>,
        executor: RetryTransactionExecutor,
        handler: Arc<dyn CoupleHandler>,
        batch_size: usize,
    ) -> Self {
        Self {
            engine,
            executor,
            handler,
            batch_size,
        }
    }
}

#[async_trait]
impl StatelessJob for MessageCorrelationJob {
    fn name(&self) -> String {
        Self::CLASS_NAME.to_string()
    }

    fn description(&self) -> String {
        "Matches message instances with waiting message events".to_string()
    }

    fn set_attributes(&mut self, attributes: &JobParameters) -> Result<()> {
        if let Some(batch_size) = u64_attribute(attributes, "batch_size")? {
            self.batch_size = batch_size.max(1) as usize;
        }
        Ok(())
    }

    async fn execute(&self, tx: &Transaction) -> Result<()> {
        let couples = self.engine.get_message_event_couples(tx, self.batch_size).await?;
        if couples.is_empty() {
            return Ok(());
        }

        debug!(count = couples.len(), "Message event couples claimed, delivering after commit");
        tx.register_synchronization(Arc::new(CoupleDelivery {
            couples,
            engine: Arc::clone(&self.engine),
            executor: self.executor.clone(),
            handler: Arc::clone(&self.handler),
        }))
        .await
    }
}

struct CoupleDelivery {
    couples: Vec<MessageEventCouple>,
    engine: Arc<EventCorrelationEngine>,
    executor: RetryTransactionExecutor,
    handler: Arc<dyn CoupleHandler>,
}

impl CoupleDelivery {
    async fn deliver(&self, couple: &MessageEventCouple) {
        let engine = self.engine.as_ref();
        let handler = self.handler.as_ref();

        let delivered = self
            .executor
            .execute(|tx| async move {
                handler.handle(&tx, couple).await?;
                engine.consume_couple(&tx, couple).await
            })
            .await;

        let Err(e) = delivered else {
            return;
        };
        warn!(
            message = %couple.message.message_name,
            message_id = %couple.message.id,
            waiting_event_id = %couple.waiting_event.id,
            error = %e,
            "Message delivery failed, releasing couple"
        );

        if let Err(release_error) = self
            .executor
            .execute(|tx| async move { engine.release_couple(&tx, couple).await })
            .await
        {
            error!(
                message_id = %couple.message.id,
                waiting_event_id = %couple.waiting_event.id,
                error = %release_error,
                "Unable to release couple, left in progress for the recovery sweep"
            );
        }
    }
}

#[async_trait]
impl TransactionSynchronization for CoupleDelivery {
    async fn after_completion(&self, status: TransactionStatus) {
        if status != TransactionStatus::Committed {
            return;
        }
        for couple in &self.couples {
            self.deliver(couple).await;
        }
    }
}
