use super::{Filter, PersistenceService, QueryCriteria, Record, RecordKind, SortDirection};
use crate::core::transaction::{Transaction, TransactionalResource};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use futures::stream::TryStreamExt;
use mongodb::{
    bson::{doc, Bson, Document},
    options::{ClientOptions, FindOptions, ServerApi, ServerApiVersion},
    Client, ClientSession, Collection, Database,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};
use uuid::Uuid;

const TRANSIENT_LABEL: &str = "TransientTransactionError";

/// MongoDB-backed store: one collection per record kind, documents shaped
/// `{ _id, version, body }`, every operation bound to the transaction's session
pub struct MongoPersistence {
    client: Client,
    database: Database,
    sessions: RwLock<HashMap<Uuid, Arc<Mutex<ClientSession>>>>,
}

impl MongoPersistence {
    pub async fn connect(mongodb_uri: &str, database_name: &str) -> Result<Self> {
        info!("🔄 Connecting to MongoDB...");

        let mut client_options = ClientOptions::parse(mongodb_uri).await.map_err(|e| {
            AppError::ConfigurationError(format!("Failed to parse MongoDB URI: {}", e))
        })?;
        let server_api = ServerApi::builder().version(ServerApiVersion::V1).build();
        client_options.server_api = Some(server_api);

        let client = Client::with_options(client_options)
            .map_err(|e| AppError::read(format!("Failed to create MongoDB client: {}", e)))?;

        client
            .database("admin")
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|e| AppError::read(format!("Failed to ping MongoDB: {}", e)))?;

        info!("✅ Successfully connected to MongoDB!");
        let database = client.database(database_name);
        Ok(Self::new(client, database))
    }

    pub fn new(client: Client, database: Database) -> Self {
        Self {
            client,
            database,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    fn collection(&self, kind: RecordKind) -> Collection<Document> {
        self.database.collection::<Document>(kind.collection_name())
    }

    async fn session(&self, tx_id: Uuid) -> Result<Arc<Mutex<ClientSession>>> {
        self.sessions
            .read()
            .await
            .get(&tx_id)
            .cloned()
            .ok_or_else(|| AppError::TransactionError(format!("No MongoDB session for transaction {}", tx_id)))
    }

    async fn take_session(&self, tx_id: Uuid) -> Result<Arc<Mutex<ClientSession>>> {
        self.sessions
            .write()
            .await
            .remove(&tx_id)
            .ok_or_else(|| AppError::TransactionError(format!("Transaction {} not found", tx_id)))
    }
}

fn to_document(record: &Record) -> Result<Document> {
    let body = mongodb::bson::to_document(&record.body).map_err(|e| {
        AppError::WriteError(format!("Cannot encode {:?} {}: {}", record.kind, record.id, e))
    })?;
    Ok(doc! {
        "_id": record.id.clone(),
        "version": record.version as i64,
        "body": body,
    })
}

fn from_document(kind: RecordKind, document: Document) -> Result<Record> {
    let id = document
        .get_str("_id")
        .map_err(|e| AppError::read(format!("{:?} document without string _id: {}", kind, e)))?
        .to_string();
    let version = document
        .get_i64("version")
        .map_err(|e| AppError::read(format!("{:?} {} without version: {}", kind, id, e)))?;
    let body = document
        .get_document("body")
        .map_err(|e| AppError::read(format!("{:?} {} without body: {}", kind, id, e)))?
        .clone();

    Ok(Record {
        kind,
        id,
        version: version.max(0) as u64,
        body: Bson::Document(body).into_relaxed_extjson(),
    })
}

fn to_bson(value: &Value) -> Result<Bson> {
    mongodb::bson::to_bson(value).map_err(|e| AppError::read(format!("Invalid filter value {}: {}", value, e)))
}

fn body_field(name: &str) -> String {
    format!("body.{}", name)
}

fn clause(name: &str, operator: Option<&str>, value: Bson) -> Document {
    let mut clause = Document::new();
    match operator {
        Some(operator) => {
            let mut condition = Document::new();
            condition.insert(operator, value);
            clause.insert(body_field(name), condition);
        }
        None => {
            clause.insert(body_field(name), value);
        }
    }
    clause
}

fn filter_document(criteria: &QueryCriteria) -> Result<Document> {
    let mut clauses = Vec::with_capacity(criteria.filters.len());
    for filter in &criteria.filters {
        let next = match filter {
            Filter::Eq(name, value) => clause(name, None, to_bson(value)?),
            Filter::Ne(name, value) => clause(name, Some("$ne"), to_bson(value)?),
            Filter::Lt(name, value) => clause(name, Some("$lt"), to_bson(value)?),
            Filter::Lte(name, value) => clause(name, Some("$lte"), to_bson(value)?),
            Filter::Gt(name, value) => clause(name, Some("$gt"), to_bson(value)?),
            Filter::Gte(name, value) => clause(name, Some("$gte"), to_bson(value)?),
            Filter::In(name, values) => {
                let values = values.iter().map(to_bson).collect::<Result<Vec<_>>>()?;
                clause(name, Some("$in"), Bson::Array(values))
            }
            Filter::IsNull(name) => clause(name, None, Bson::Null),
            Filter::NotNull(name) => clause(name, Some("$ne"), Bson::Null),
        };
        clauses.push(next);
    }

    if clauses.is_empty() {
        Ok(Document::new())
    } else {
        Ok(doc! { "$and": clauses })
    }
}

fn find_options(criteria: &QueryCriteria) -> FindOptions {
    let mut sort = Document::new();
    for order in &criteria.order_by {
        let direction = match order.direction {
            SortDirection::Ascending => 1,
            SortDirection::Descending => -1,
        };
        sort.insert(body_field(&order.field), direction);
    }
    sort.insert("_id", 1);

    FindOptions::builder()
        .sort(sort)
        .skip(Some(criteria.from_index as u64))
        .limit(criteria.max_results.map(|limit| limit as i64))
        .build()
}

fn read_failure(operation: &str, kind: RecordKind, e: mongodb::error::Error) -> AppError {
    if e.contains_label(TRANSIENT_LABEL) {
        return AppError::ConcurrencyConflict(format!("{} {:?}: {}", operation, kind, e));
    }
    AppError::read(format!("{} {:?} failed: {}", operation, kind, e))
}

fn write_failure(operation: &str, kind: RecordKind, e: mongodb::error::Error) -> AppError {
    if e.contains_label(TRANSIENT_LABEL) {
        return AppError::ConcurrencyConflict(format!("{} {:?}: {}", operation, kind, e));
    }
    AppError::WriteError(format!("{} {:?} failed: {}", operation, kind, e))
}

#[async_trait]
impl TransactionalResource for MongoPersistence {
    async fn begin(&self, tx_id: Uuid) -> Result<()> {
        let mut session = self
            .client
            .start_session(None)
            .await
            .map_err(|e| AppError::TransactionError(format!("Failed to start session: {}", e)))?;
        session
            .start_transaction(None)
            .await
            .map_err(|e| AppError::TransactionError(format!("Failed to start transaction: {}", e)))?;

        self.sessions
            .write()
            .await
            .insert(tx_id, Arc::new(Mutex::new(session)));
        debug!(transaction_id = %tx_id, "Started MongoDB transaction");
        Ok(())
    }

    async fn commit(&self, tx_id: Uuid) -> Result<()> {
        let session = self.take_session(tx_id).await?;
        let mut session = session.lock().await;
        session.commit_transaction().await.map_err(|e| {
            if e.contains_label(TRANSIENT_LABEL) {
                AppError::ConcurrencyConflict(format!("Commit of {} conflicted: {}", tx_id, e))
            } else {
                AppError::TransactionError(format!("Commit of {} failed: {}", tx_id, e))
            }
        })
    }

    async fn rollback(&self, tx_id: Uuid) -> Result<()> {
        let session = self.take_session(tx_id).await?;
        let mut session = session.lock().await;
        if let Err(e) = session.abort_transaction().await {
            error!(transaction_id = %tx_id, error = %e, "Failed to abort MongoDB transaction");
            return Err(AppError::TransactionError(format!("Rollback of {} failed: {}", tx_id, e)));
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceService for MongoPersistence {
    async fn insert(&self, tx: &Transaction, mut record: Record) -> Result<Record> {
        record.version = 1;
        let document = to_document(&record)?;
        let session = self.session(tx.id()).await?;
        let mut session = session.lock().await;

        self.collection(record.kind)
            .insert_one_with_session(document, None, &mut session)
            .await
            .map_err(|e| write_failure("Insert", record.kind, e))?;
        Ok(record)
    }

    async fn update(&self, tx: &Transaction, mut record: Record) -> Result<Record> {
        let expected = record.version;
        record.version = expected + 1;
        let body = to_document(&record)?
            .get("body")
            .cloned()
            .unwrap_or(Bson::Null);
        let session = self.session(tx.id()).await?;
        let mut session = session.lock().await;
        let collection = self.collection(record.kind);

        let result = collection
            .update_one_with_session(
                doc! { "_id": record.id.clone(), "version": expected as i64 },
                doc! { "$set": { "version": record.version as i64, "body": body } },
                None,
                &mut session,
            )
            .await
            .map_err(|e| write_failure("Update", record.kind, e))?;

        if result.matched_count == 0 {
            let exists = collection
                .find_one_with_session(doc! { "_id": record.id.clone() }, None, &mut session)
                .await
                .map_err(|e| read_failure("Update", record.kind, e))?
                .is_some();
            return Err(if exists {
                AppError::ConcurrencyConflict(format!(
                    "{:?} {} changed since version {}",
                    record.kind, record.id, expected
                ))
            } else {
                AppError::NotFound(format!("{:?} {}", record.kind, record.id))
            });
        }
        Ok(record)
    }

    async fn delete(&self, tx: &Transaction, kind: RecordKind, id: &str) -> Result<bool> {
        let session = self.session(tx.id()).await?;
        let mut session = session.lock().await;
        let result = self
            .collection(kind)
            .delete_one_with_session(doc! { "_id": id }, None, &mut session)
            .await
            .map_err(|e| write_failure("Delete", kind, e))?;
        Ok(result.deleted_count > 0)
    }

    async fn delete_all(&self, tx: &Transaction, kind: RecordKind, criteria: &QueryCriteria) -> Result<u64> {
        let filter = filter_document(criteria)?;
        let session = self.session(tx.id()).await?;
        let mut session = session.lock().await;
        let result = self
            .collection(kind)
            .delete_many_with_session(filter, None, &mut session)
            .await
            .map_err(|e| write_failure("Delete all", kind, e))?;
        Ok(result.deleted_count)
    }

    async fn select_by_id(&self, tx: &Transaction, kind: RecordKind, id: &str) -> Result<Option<Record>> {
        let session = self.session(tx.id()).await?;
        let mut session = session.lock().await;
        let document = self
            .collection(kind)
            .find_one_with_session(doc! { "_id": id }, None, &mut session)
            .await
            .map_err(|e| read_failure("Select", kind, e))?;
        document.map(|d| from_document(kind, d)).transpose()
    }

    async fn select_list(&self, tx: &Transaction, kind: RecordKind, criteria: &QueryCriteria) -> Result<Vec<Record>> {
        let filter = filter_document(criteria)?;
        let session = self.session(tx.id()).await?;
        let mut session = session.lock().await;

        let mut cursor = self
            .collection(kind)
            .find_with_session(filter, find_options(criteria), &mut session)
            .await
            .map_err(|e| read_failure("Select", kind, e))?;

        let mut documents = cursor.stream(&mut session);
        let mut records = Vec::new();
        while let Some(document) = documents
            .try_next()
            .await
            .map_err(|e| read_failure("Select", kind, e))?
        {
            records.push(from_document(kind, document)?);
        }
        Ok(records)
    }

    async fn count(&self, tx: &Transaction, kind: RecordKind, criteria: &QueryCriteria) -> Result<u64> {
        let filter = filter_document(criteria)?;
        let session = self.session(tx.id()).await?;
        let mut session = session.lock().await;
        self.collection(kind)
            .count_documents_with_session(filter, None, &mut session)
            .await
            .map_err(|e| read_failure("Count", kind, e))
    }
}
