use super::{PersistenceService, QueryCriteria, Record, RecordKind};
use crate::core::transaction::{Transaction, TransactionalResource};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

type RowKey = (RecordKind, String);

enum UndoEntry {
    Inserted(RowKey),
    Updated(Record),
    Deleted(Record),
}

#[derive(Default)]
struct TransactionLog {
    undo: Vec<UndoEntry>,
    locks: Vec<RowKey>,
}

#[derive(Default)]
struct MemoryState {
    tables: HashMap<RecordKind, HashMap<String, Record>>,
    locks: HashMap<RowKey, Uuid>,
    transactions: HashMap<Uuid, TransactionLog>,
}

impl MemoryState {
    fn table(&self, kind: RecordKind) -> Option<&HashMap<String, Record>> {
        self.tables.get(&kind)
    }

    fn ensure_active(&self, tx_id: Uuid) -> Result<()> {
        if self.transactions.contains_key(&tx_id) {
            Ok(())
        } else {
            Err(AppError::TransactionError(format!(
                "Transaction {} is not active on the in-memory store",
                tx_id
            )))
        }
    }

    /// Takes the write lock on a row for `tx_id`
    fn lock(&mut self, tx_id: Uuid, key: &RowKey) -> Result<()> {
        match self.locks.get(key) {
            Some(owner) if *owner == tx_id => Ok(()),
            Some(owner) => Err(AppError::ConcurrencyConflict(format!(
                "{:?} {} is locked by transaction {}",
                key.0, key.1, owner
            ))),
            None => {
                self.locks.insert(key.clone(), tx_id);
                if let Some(log) = self.transactions.get_mut(&tx_id) {
                    log.locks.push(key.clone());
                }
                Ok(())
            }
        }
    }

    fn log_undo(&mut self, tx_id: Uuid, entry: UndoEntry) {
        if let Some(log) = self.transactions.get_mut(&tx_id) {
            log.undo.push(entry);
        }
    }

    fn release(&mut self, log: &TransactionLog) {
        for key in &log.locks {
            self.locks.remove(key);
        }
    }

    fn select(&self, kind: RecordKind, criteria: &QueryCriteria) -> Vec<Record> {
        let matching: Vec<Record> = self
            .table(kind)
            .map(|table| {
                table
                    .values()
                    .filter(|record| criteria.matches(&record.body))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        criteria.apply(matching)
    }

    fn delete_row(&mut self, tx_id: Uuid, kind: RecordKind, id: &str) -> Result<bool> {
        let key = (kind, id.to_string());
        self.lock(tx_id, &key)?;
        let removed = self.tables.get_mut(&kind).and_then(|table| table.remove(id));
        match removed {
            Some(previous) => {
                self.log_undo(tx_id, UndoEntry::Deleted(previous));
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Store keeping every table in memory.
///
/// Writes are visible to other transactions immediately; the rows written by
/// a transaction stay locked until it commits or rolls back, and a rollback
/// replays the transaction's undo log.
#[derive(Default)]
pub struct InMemoryPersistence {
    state: RwLock<MemoryState>,
    unavailable: AtomicBool,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every read fail with `ReadError` and every write with `WriteError`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_readable(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::read("In-memory store is unavailable"));
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::WriteError("In-memory store is unavailable".to_string()));
        }
        Ok(())
    }

    /// Number of transactions currently open on the store
    pub async fn open_transactions(&self) -> usize {
        self.state.read().await.transactions.len()
    }
}

#[async_trait]
impl TransactionalResource for InMemoryPersistence {
    async fn begin(&self, tx_id: Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        state.transactions.insert(tx_id, TransactionLog::default());
        Ok(())
    }

    async fn commit(&self, tx_id: Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        let log = state.transactions.remove(&tx_id).ok_or_else(|| {
            AppError::TransactionError(format!("Transaction {} not found", tx_id))
        })?;
        state.release(&log);
        debug!(transaction_id = %tx_id, writes = log.undo.len(), "In-memory transaction committed");
        Ok(())
    }

    async fn rollback(&self, tx_id: Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        let Some(mut log) = state.transactions.remove(&tx_id) else {
            warn!(transaction_id = %tx_id, "Rollback of unknown transaction ignored");
            return Ok(());
        };

        while let Some(entry) = log.undo.pop() {
            match entry {
                UndoEntry::Inserted((kind, id)) => {
                    if let Some(table) = state.tables.get_mut(&kind) {
                        table.remove(&id);
                    }
                }
                UndoEntry::Updated(previous) | UndoEntry::Deleted(previous) => {
                    state
                        .tables
                        .entry(previous.kind)
                        .or_default()
                        .insert(previous.id.clone(), previous);
                }
            }
        }
        state.release(&log);
        debug!(transaction_id = %tx_id, "In-memory transaction rolled back");
        Ok(())
    }
}

#[async_trait]
impl PersistenceService for InMemoryPersistence {
    async fn insert(&self, tx: &Transaction, mut record: Record) -> Result<Record> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        state.ensure_active(tx.id())?;

        let key = (record.kind, record.id.clone());
        state.lock(tx.id(), &key)?;
        let exists = state
            .table(record.kind)
            .map(|table| table.contains_key(&record.id))
            .unwrap_or(false);
        if exists {
            return Err(AppError::WriteError(format!(
                "{:?} {} already exists",
                record.kind, record.id
            )));
        }

        record.version = 1;
        state
            .tables
            .entry(record.kind)
            .or_default()
            .insert(record.id.clone(), record.clone());
        state.log_undo(tx.id(), UndoEntry::Inserted(key));
        Ok(record)
    }

    async fn update(&self, tx: &Transaction, mut record: Record) -> Result<Record> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        state.ensure_active(tx.id())?;

        let key = (record.kind, record.id.clone());
        state.lock(tx.id(), &key)?;
        let stored = state
            .table(record.kind)
            .and_then(|table| table.get(&record.id))
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("{:?} {}", record.kind, record.id)))?;

        if stored.version != record.version {
            return Err(AppError::ConcurrencyConflict(format!(
                "{:?} {} has version {}, update expected {}",
                record.kind, record.id, stored.version, record.version
            )));
        }

        record.version = stored.version + 1;
        state
            .tables
            .entry(record.kind)
            .or_default()
            .insert(record.id.clone(), record.clone());
        state.log_undo(tx.id(), UndoEntry::Updated(stored));
        Ok(record)
    }

    async fn delete(&self, tx: &Transaction, kind: RecordKind, id: &str) -> Result<bool> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        state.ensure_active(tx.id())?;
        state.delete_row(tx.id(), kind, id)
    }

    async fn delete_all(&self, tx: &Transaction, kind: RecordKind, criteria: &QueryCriteria) -> Result<u64> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        state.ensure_active(tx.id())?;

        let ids: Vec<String> = state.select(kind, criteria).into_iter().map(|r| r.id).collect();
        let mut deleted = 0;
        for id in ids {
            if state.delete_row(tx.id(), kind, &id)? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn select_by_id(&self, tx: &Transaction, kind: RecordKind, id: &str) -> Result<Option<Record>> {
        self.check_readable()?;
        let state = self.state.read().await;
        state.ensure_active(tx.id())?;
        Ok(state.table(kind).and_then(|table| table.get(id)).cloned())
    }

    async fn select_list(&self, tx: &Transaction, kind: RecordKind, criteria: &QueryCriteria) -> Result<Vec<Record>> {
        self.check_readable()?;
        let state = self.state.read().await;
        state.ensure_active(tx.id())?;
        Ok(state.select(kind, criteria))
    }

    async fn count(&self, tx: &Transaction, kind: RecordKind, criteria: &QueryCriteria) -> Result<u64> {
        self.check_readable()?;
        let state = self.state.read().await;
        state.ensure_active(tx.id())?;
        let count = state
            .table(kind)
            .map(|table| table.values().filter(|r| criteria.matches(&r.body)).count())
            .unwrap_or(0);
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::SystemClock;
    use crate::core::transaction::{DefaultTransactionManager, TransactionService};
    use serde_json::json;
    use std::sync::Arc;

    fn setup() -> (Arc<InMemoryPersistence>, DefaultTransactionManager) {
        let store = Arc::new(InMemoryPersistence::new());
        let manager = DefaultTransactionManager::new(store.clone(), Arc::new(SystemClock));
        (store, manager)
    }

    fn record(id: &str, body: serde_json::Value) -> Record {
        Record {
            kind: RecordKind::Trigger,
            id: id.to_string(),
            version: 0,
            body,
        }
    }

    #[tokio::test]
    async fn test_optimistic_update() {
        let (store, manager) = setup();
        let tx = manager.begin().await.unwrap();

        let inserted = store.insert(&tx, record("t1", json!({ "state": "Scheduled" }))).await.unwrap();
        assert_eq!(inserted.version, 1);

        let mut changed = inserted.clone();
        changed.body = json!({ "state": "Executing" });
        let updated = store.update(&tx, changed).await.unwrap();
        assert_eq!(updated.version, 2);

        let stale = store.update(&tx, inserted).await;
        assert!(matches!(stale, Err(AppError::ConcurrencyConflict(_))));
        manager.complete(&tx).await.unwrap();
    }

    #[tokio::test]
    async fn test_rows_stay_locked_until_completion() {
        let (store, manager) = setup();
        let setup_tx = manager.begin().await.unwrap();
        let stored = store.insert(&setup_tx, record("t1", json!({ "n": 1 }))).await.unwrap();
        manager.complete(&setup_tx).await.unwrap();

        let first = manager.begin().await.unwrap();
        let second = manager.begin().await.unwrap();
        let updated = store.update(&first, stored.clone()).await.unwrap();

        let mut competing = updated.clone();
        competing.body = json!({ "n": 3 });
        assert!(matches!(store.update(&second, competing).await, Err(AppError::ConcurrencyConflict(_))));
        assert!(matches!(store.delete(&second, RecordKind::Trigger, "t1").await, Err(AppError::ConcurrencyConflict(_))));

        manager.complete(&first).await.unwrap();
        assert!(store.delete(&second, RecordKind::Trigger, "t1").await.unwrap());
        manager.complete(&second).await.unwrap();
    }

    #[tokio::test]
    async fn test_rollback_restores_previous_state() {
        let (store, manager) = setup();
        let setup_tx = manager.begin().await.unwrap();
        store.insert(&setup_tx, record("keep", json!({ "n": 1 }))).await.unwrap();
        manager.complete(&setup_tx).await.unwrap();

        let tx = manager.begin().await.unwrap();
        store.insert(&tx, record("new", json!({ "n": 2 }))).await.unwrap();
        let existing = store.select_by_id(&tx, RecordKind::Trigger, "keep").await.unwrap().unwrap();
        let mut changed = existing.clone();
        changed.body = json!({ "n": 10 });
        let changed = store.update(&tx, changed).await.unwrap();
        store.update(&tx, changed).await.unwrap();
        tx.set_rollback_only();
        manager.complete(&tx).await.unwrap();

        let check = manager.begin().await.unwrap();
        assert!(store.select_by_id(&check, RecordKind::Trigger, "new").await.unwrap().is_none());
        let restored = store.select_by_id(&check, RecordKind::Trigger, "keep").await.unwrap().unwrap();
        assert_eq!(restored, existing);
        manager.complete(&check).await.unwrap();
        assert_eq!(store.open_transactions().await, 0);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_reads_and_writes() {
        let (store, manager) = setup();
        let tx = manager.begin().await.unwrap();
        store.set_unavailable(true);

        let read = store.select_list(&tx, RecordKind::Trigger, &QueryCriteria::new()).await;
        assert!(matches!(read, Err(AppError::ReadError { .. })));
        let write = store.insert(&tx, record("x", json!({}))).await;
        assert!(matches!(write, Err(AppError::WriteError(_))));

        store.set_unavailable(false);
        manager.complete(&tx).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_all_and_count() {
        let (store, manager) = setup();
        let tx = manager.begin().await.unwrap();
        for (id, group) in [("a", "g1"), ("b", "g1"), ("c", "g2")] {
            store.insert(&tx, record(id, json!({ "group": group }))).await.unwrap();
        }

        let g1 = QueryCriteria::new().eq("group", "g1");
        assert_eq!(store.count(&tx, RecordKind::Trigger, &g1).await.unwrap(), 2);
        assert_eq!(store.delete_all(&tx, RecordKind::Trigger, &g1).await.unwrap(), 2);
        assert_eq!(store.count(&tx, RecordKind::Trigger, &QueryCriteria::new()).await.unwrap(), 1);
        manager.complete(&tx).await.unwrap();
    }
}
