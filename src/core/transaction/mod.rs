//! Transaction coordination
//!
//! A [`Transaction`] is a cheap handle shared by every store call made inside
//! one unit of work. The [`DefaultTransactionManager`] begins and completes
//! transactions against a [`TransactionalResource`] and runs the registered
//! [`TransactionSynchronization`] callbacks around the commit.

pub mod retry_executor;

pub use retry_executor::{RestartPolicy, RetryTransactionExecutor};

use crate::error::{AppError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Active,
    Committed,
    RolledBack,
}

/// Callbacks run around the completion of a transaction
#[async_trait]
pub trait TransactionSynchronization: Send + Sync {
    /// Runs before the resource commits, still inside `tx`. A failure rolls
    /// the transaction back.
    async fn before_commit(&self, _tx: &Transaction) -> Result<()> {
        Ok(())
    }

    /// Runs once the transaction is committed or rolled back
    async fn after_completion(&self, _status: TransactionStatus) {}
}

struct TransactionInner {
    id: Uuid,
    started_at: DateTime<Utc>,
    rollback_only: AtomicBool,
    status: RwLock<TransactionStatus>,
    synchronizations: Mutex<Vec<Arc<dyn TransactionSynchronization>>>,
}

/// Handle on one unit of work
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("started_at", &self.inner.started_at)
            .field("rollback_only", &self.is_rollback_only())
            .finish()
    }
}

impl Transaction {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(TransactionInner {
                id: Uuid::new_v4(),
                started_at,
                rollback_only: AtomicBool::new(false),
                status: RwLock::new(TransactionStatus::Active),
                synchronizations: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    pub fn set_rollback_only(&self) {
        self.inner.rollback_only.store(true, Ordering::SeqCst);
    }

    pub fn is_rollback_only(&self) -> bool {
        self.inner.rollback_only.load(Ordering::SeqCst)
    }

    pub async fn status(&self) -> TransactionStatus {
        *self.inner.status.read().await
    }

    pub async fn is_active(&self) -> bool {
        self.status().await == TransactionStatus::Active
    }

    pub async fn register_synchronization(
        &self,
        synchronization: Arc<dyn TransactionSynchronization>,
    ) -> Result<()> {
        if !self.is_active().await {
            return Err(AppError::TransactionError(format!(
                "Transaction {} is no longer active",
                self.inner.id
            )));
        }
        self.inner.synchronizations.lock().await.push(synchronization);
        Ok(())
    }

    async fn take_synchronizations(&self) -> Vec<Arc<dyn TransactionSynchronization>> {
        std::mem::take(&mut *self.inner.synchronizations.lock().await)
    }

    async fn set_status(&self, status: TransactionStatus) {
        *self.inner.status.write().await = status;
    }
}

/// A store that takes part in transactions
#[async_trait]
pub trait TransactionalResource: Send + Sync {
    async fn begin(&self, tx_id: Uuid) -> Result<()>;
    async fn commit(&self, tx_id: Uuid) -> Result<()>;
    async fn rollback(&self, tx_id: Uuid) -> Result<()>;
}

/// Transaction boundaries used by the retry executor and the bootstrap
#[async_trait]
pub trait TransactionService: Send + Sync {
    async fn begin(&self) -> Result<Transaction>;

    /// Commits unless the transaction is rollback-only. Completing a
    /// transaction twice is a `TransactionError`.
    async fn complete(&self, tx: &Transaction) -> Result<TransactionStatus>;
}

/// Transaction statistics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionStats {
    pub begun: u64,
    pub committed: u64,
    pub rolled_back: u64,
    pub active: u64,
}

pub struct DefaultTransactionManager {
    resource: Arc<dyn TransactionalResource>,
    clock: Arc<dyn crate::core::clock::Clock>,
    active_transactions: RwLock<HashMap<Uuid, Transaction>>,
    stats: RwLock<TransactionStats>,
}

impl DefaultTransactionManager {
    pub fn new(
        resource: Arc<dyn TransactionalResource>,
        clock: Arc<dyn crate::core::clock::Clock>,
    ) -> Self {
        Self {
            resource,
            clock,
            active_transactions: RwLock::new(HashMap::new()),
            stats: RwLock::new(TransactionStats::default()),
        }
    }

    pub async fn stats(&self) -> TransactionStats {
        self.stats.read().await.clone()
    }

    async fn finish(&self, tx: &Transaction, status: TransactionStatus) {
        tx.set_status(status).await;
        self.active_transactions.write().await.remove(&tx.id());

        {
            let mut stats = self.stats.write().await;
            stats.active = stats.active.saturating_sub(1);
            match status {
                TransactionStatus::Committed => stats.committed += 1,
                TransactionStatus::RolledBack => stats.rolled_back += 1,
                TransactionStatus::Active => {}
            }
        }

        for synchronization in tx.take_synchronizations().await {
            synchronization.after_completion(status).await;
        }
    }

    async fn roll_back(&self, tx: &Transaction) {
        if let Err(e) = self.resource.rollback(tx.id()).await {
            error!(transaction_id = %tx.id(), error = %e, "Failed to roll back transaction");
        }
        self.finish(tx, TransactionStatus::RolledBack).await;
        debug!(transaction_id = %tx.id(), "Transaction rolled back");
    }
}

#[async_trait]
impl TransactionService for DefaultTransactionManager {
    async fn begin(&self) -> Result<Transaction> {
        let tx = Transaction::new(self.clock.now());
        self.resource.begin(tx.id()).await?;

        self.active_transactions.write().await.insert(tx.id(), tx.clone());
        {
            let mut stats = self.stats.write().await;
            stats.begun += 1;
            stats.active += 1;
        }

        debug!(transaction_id = %tx.id(), "Started transaction");
        Ok(tx)
    }

    async fn complete(&self, tx: &Transaction) -> Result<TransactionStatus> {
        if !self.active_transactions.read().await.contains_key(&tx.id()) || !tx.is_active().await {
            return Err(AppError::TransactionError(format!(
                "Transaction {} is not active",
                tx.id()
            )));
        }

        if tx.is_rollback_only() {
            self.roll_back(tx).await;
            return Ok(TransactionStatus::RolledBack);
        }

        let synchronizations: Vec<_> = tx.inner.synchronizations.lock().await.clone();
        for synchronization in &synchronizations {
            if let Err(e) = synchronization.before_commit(tx).await {
                warn!(transaction_id = %tx.id(), error = %e, "before-commit callback failed, rolling back");
                self.roll_back(tx).await;
                return Err(e);
            }
        }

        if let Err(e) = self.resource.commit(tx.id()).await {
            error!(transaction_id = %tx.id(), error = %e, "Failed to commit transaction");
            self.roll_back(tx).await;
            return Err(e);
        }

        self.finish(tx, TransactionStatus::Committed).await;
        debug!(transaction_id = %tx.id(), "Transaction committed");
        Ok(TransactionStatus::Committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::SystemClock;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingResource {
        begins: AtomicUsize,
        commits: AtomicUsize,
        rollbacks: AtomicUsize,
        fail_commit: AtomicBool,
    }

    #[async_trait]
    impl TransactionalResource for CountingResource {
        async fn begin(&self, _tx_id: Uuid) -> Result<()> {
            self.begins.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn commit(&self, _tx_id: Uuid) -> Result<()> {
            if self.fail_commit.load(Ordering::SeqCst) {
                return Err(AppError::WriteError("commit refused".to_string()));
            }
            self.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn rollback(&self, _tx_id: Uuid) -> Result<()> {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct RecordingSync {
        fail_before_commit: bool,
        seen: Mutex<Vec<TransactionStatus>>,
    }

    #[async_trait]
    impl TransactionSynchronization for RecordingSync {
        async fn before_commit(&self, _tx: &Transaction) -> Result<()> {
            if self.fail_before_commit {
                return Err(AppError::execution("veto"));
            }
            Ok(())
        }

        async fn after_completion(&self, status: TransactionStatus) {
            self.seen.lock().await.push(status);
        }
    }

    fn manager(resource: Arc<CountingResource>) -> DefaultTransactionManager {
        DefaultTransactionManager::new(resource, Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn test_commit_runs_synchronizations() {
        let resource = Arc::new(CountingResource::default());
        let manager = manager(resource.clone());
        let sync = Arc::new(RecordingSync { fail_before_commit: false, seen: Mutex::new(Vec::new()) });

        let tx = manager.begin().await.unwrap();
        tx.register_synchronization(sync.clone()).await.unwrap();
        let status = manager.complete(&tx).await.unwrap();

        assert_eq!(status, TransactionStatus::Committed);
        assert_eq!(resource.commits.load(Ordering::SeqCst), 1);
        assert_eq!(*sync.seen.lock().await, vec![TransactionStatus::Committed]);
        assert_eq!(manager.stats().await, TransactionStats { begun: 1, committed: 1, rolled_back: 0, active: 0 });
    }

    #[tokio::test]
    async fn test_rollback_only_rolls_back() {
        let resource = Arc::new(CountingResource::default());
        let manager = manager(resource.clone());

        let tx = manager.begin().await.unwrap();
        tx.set_rollback_only();

        assert_eq!(manager.complete(&tx).await.unwrap(), TransactionStatus::RolledBack);
        assert_eq!(resource.rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(resource.commits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_before_commit_failure_rolls_back() {
        let resource = Arc::new(CountingResource::default());
        let manager = manager(resource.clone());
        let sync = Arc::new(RecordingSync { fail_before_commit: true, seen: Mutex::new(Vec::new()) });

        let tx = manager.begin().await.unwrap();
        tx.register_synchronization(sync.clone()).await.unwrap();

        assert!(manager.complete(&tx).await.is_err());
        assert_eq!(resource.rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(*sync.seen.lock().await, vec![TransactionStatus::RolledBack]);
    }

    #[tokio::test]
    async fn test_commit_failure_rolls_back_and_reports() {
        let resource = Arc::new(CountingResource::default());
        resource.fail_commit.store(true, Ordering::SeqCst);
        let manager = manager(resource.clone());

        let tx = manager.begin().await.unwrap();
        let result = manager.complete(&tx).await;

        assert!(matches!(result, Err(AppError::WriteError(_))));
        assert_eq!(tx.status().await, TransactionStatus::RolledBack);
        assert_eq!(manager.stats().await.rolled_back, 1);
    }

    #[tokio::test]
    async fn test_completing_twice_is_an_error() {
        let resource = Arc::new(CountingResource::default());
        let manager = manager(resource);

        let tx = manager.begin().await.unwrap();
        manager.complete(&tx).await.unwrap();

        assert!(matches!(manager.complete(&tx).await, Err(AppError::TransactionError(_))));
        assert!(tx.register_synchronization(Arc::new(RecordingSync {
            fail_before_commit: false,
            seen: Mutex::new(Vec::new()),
        }))
        .await
        .is_err());
    }
}
