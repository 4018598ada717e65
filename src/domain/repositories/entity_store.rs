use std::sync::Arc;

use crate::core::transaction::Transaction;
use crate::error::Result;
use crate::infrastructure::persistence::{PersistenceService, Persistent, QueryCriteria};

/// Generic typed CRUD on top of [`PersistenceService`]
#[derive(Clone)]
pub struct EntityStore {
    persistence: Arc<dyn PersistenceService>,
}

impl EntityStore {
    pub fn new(persistence: Arc<dyn PersistenceService>) -> Self {
        Self { persistence }
    }

    pub async fn insert<E: Persistent>(&self, tx: &Transaction, entity: &E) -> Result<E> {
        let record = entity.to_record()?;
        let stored = self.persistence.insert(tx, record).await?;
        E::from_record(stored)
    }

    /// Optimistic update; the returned entity carries the new version
    pub async fn update<E: Persistent>(&self, tx: &Transaction, entity: &E) -> Result<E> {
        let record = entity.to_record()?;
        let stored = self.persistence.update(tx, record).await?;
        E::from_record(stored)
    }

    pub async fn delete<E: Persistent>(&self, tx: &Transaction, id: &str) -> Result<bool> {
        self.persistence.delete(tx, E::KIND, id).await
    }

    pub async fn delete_where<E: Persistent>(&self, tx: &Transaction, criteria: &QueryCriteria) -> Result<u64> {
        self.persistence.delete_all(tx, E::KIND, criteria).await
    }

    pub async fn get<E: Persistent>(&self, tx: &Transaction, id: &str) -> Result<Option<E>> {
        self.persistence
            .select_by_id(tx, E::KIND, id)
            .await?
            .map(E::from_record)
            .transpose()
    }

    pub async fn find_one<E: Persistent>(&self, tx: &Transaction, criteria: &QueryCriteria) -> Result<Option<E>> {
        self.persistence
            .select_one(tx, E::KIND, criteria)
            .await?
            .map(E::from_record)
            .transpose()
    }

    pub async fn find<E: Persistent>(&self, tx: &Transaction, criteria: &QueryCriteria) -> Result<Vec<E>> {
        self.persistence
            .select_list(tx, E::KIND, criteria)
            .await?
            .into_iter()
            .map(E::from_record)
            .collect()
    }

    pub async fn count<E: Persistent>(&self, tx: &Transaction, criteria: &QueryCriteria) -> Result<u64> {
        self.persistence.count(tx, E::KIND, criteria).await
    }
}
