//! Persistence façade
//!
//! Entities are stored as [`Record`]s: a kind, an id, an optimistic-lock
//! version and a JSON body. Every operation runs inside the caller's
//! [`Transaction`].

pub mod criteria;
pub mod memory;
pub mod mongo;

pub use criteria::{Filter, OrderBy, QueryCriteria, SortDirection};
pub use memory::InMemoryPersistence;
pub use mongo::MongoPersistence;

use crate::core::transaction::Transaction;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecordKind {
    WaitingEvent,
    MessageInstance,
    TimerTriggerInstance,
    JobDescriptor,
    Trigger,
    JobLog,
    TenantState,
}

impl RecordKind {
    pub const ALL: [RecordKind; 7] = [
        RecordKind::WaitingEvent,
        RecordKind::MessageInstance,
        RecordKind::TimerTriggerInstance,
        RecordKind::JobDescriptor,
        RecordKind::Trigger,
        RecordKind::JobLog,
        RecordKind::TenantState,
    ];

    pub fn collection_name(&self) -> &'static str {
        match self {
            RecordKind::WaitingEvent => "waiting_events",
            RecordKind::MessageInstance => "message_instances",
            RecordKind::TimerTriggerInstance => "timer_trigger_instances",
            RecordKind::JobDescriptor => "job_descriptors",
            RecordKind::Trigger => "triggers",
            RecordKind::JobLog => "job_logs",
            RecordKind::TenantState => "tenant_states",
        }
    }
}

/// Stored form of an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub kind: RecordKind,
    pub id: String,
    pub version: u64,
    pub body: Value,
}

/// An entity that can be stored through the façade
pub trait Persistent: Serialize + DeserializeOwned + Send + Sync {
    const KIND: RecordKind;

    fn id(&self) -> String;
    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);

    fn to_record(&self) -> Result<Record> {
        let body = serde_json::to_value(self)
            .map_err(|e| AppError::WriteError(format!("Cannot serialize {:?}: {}", Self::KIND, e)))?;
        Ok(Record {
            kind: Self::KIND,
            id: self.id(),
            version: self.version(),
            body,
        })
    }

    fn from_record(record: Record) -> Result<Self> {
        if record.kind != Self::KIND {
            return Err(AppError::read(format!(
                "Expected a {:?} record, got {:?}",
                Self::KIND,
                record.kind
            )));
        }
        let mut entity: Self = serde_json::from_value(record.body).map_err(|e| {
            AppError::read(format!("Cannot deserialize {:?} {}: {}", Self::KIND, record.id, e))
        })?;
        entity.set_version(record.version);
        Ok(entity)
    }
}

/// CRUD and query operations, each bound to a transaction
#[async_trait]
pub trait PersistenceService: Send + Sync {
    /// Stores a new record with version 1. A duplicate id is a `WriteError`.
    async fn insert(&self, tx: &Transaction, record: Record) -> Result<Record>;

    /// Replaces the body when `record.version` matches the stored version and
    /// returns the record with the bumped version. A mismatch, or a row locked
    /// by another live transaction, is a `ConcurrencyConflict`.
    async fn update(&self, tx: &Transaction, record: Record) -> Result<Record>;

    /// Returns whether the record existed
    async fn delete(&self, tx: &Transaction, kind: RecordKind, id: &str) -> Result<bool>;

    async fn delete_all(&self, tx: &Transaction, kind: RecordKind, criteria: &QueryCriteria) -> Result<u64>;

    async fn select_by_id(&self, tx: &Transaction, kind: RecordKind, id: &str) -> Result<Option<Record>>;

    async fn select_one(
        &self,
        tx: &Transaction,
        kind: RecordKind,
        criteria: &QueryCriteria,
    ) -> Result<Option<Record>> {
        let mut records = self
            .select_list(tx, kind, &criteria.clone().max_results(1))
            .await?;
        Ok(records.pop())
    }

    async fn select_list(&self, tx: &Transaction, kind: RecordKind, criteria: &QueryCriteria) -> Result<Vec<Record>>;

    async fn count(&self, tx: &Transaction, kind: RecordKind, criteria: &QueryCriteria) -> Result<u64>;
}
