//! The `JobStore` trait and the redb driver.
//!
//! Task and job records are JSON-serialized into redb's `&[u8]` value
//! columns. The driver supports on-disk and in-memory backends (the latter
//! for testing).

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::debug;

use flotilla_types::{JobId, Task, TaskId};

use crate::error::{StoreError, StoreResult};

const TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");
const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

/// Boxed future returned by the async store methods.
pub type StoreFuture<T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send>>;

/// The persisted view of a job: its identity and the tasks it owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub task_ids: Vec<TaskId>,
    pub updated_at_ms: u64,
}

/// Durable storage for jobs and tasks.
///
/// Every method resolves once the write is acknowledged; failures surface
/// as [`StoreError`]s. Callers impose their own timeout on the returned
/// future.
pub trait JobStore: Send + Sync {
    fn store_task(&self, task: &Task) -> StoreFuture<()>;
    fn replace_task(&self, old_id: &TaskId, task: &Task) -> StoreFuture<()>;
    fn remove_task(&self, task_id: &TaskId) -> StoreFuture<()>;
    fn update_job(&self, job: &JobRecord) -> StoreFuture<()>;
}

/// redb-backed `JobStore`.
#[derive(Clone)]
pub struct RedbJobStore {
    db: Arc<Database>,
}

impl RedbJobStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "job store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory job store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(TASKS).map_err(map_err!(Table))?;
        txn.open_table(JOBS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn put_task_sync(&self, task: &Task) -> StoreResult<()> {
        let value = serde_json::to_vec(task).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(TASKS).map_err(map_err!(Table))?;
            table
                .insert(task.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(task_id = %task.id, "task stored");
        Ok(())
    }

    fn remove_task_sync(&self, task_id: &str) -> StoreResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(TASKS).map_err(map_err!(Table))?;
            existed = table.remove(task_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Read a task back (diagnostics and tests).
    pub fn get_task(&self, task_id: &str) -> StoreResult<Option<Task>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TASKS).map_err(map_err!(Table))?;
        match table.get(task_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let task: Task =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    /// List all persisted tasks.
    pub fn list_tasks(&self) -> StoreResult<Vec<Task>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TASKS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let task: Task =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(task);
        }
        Ok(results)
    }

    /// Read a job record back (diagnostics and tests).
    pub fn get_job(&self, job_id: &str) -> StoreResult<Option<JobRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
        match table.get(job_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let job: JobRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }
}

impl JobStore for RedbJobStore {
    fn store_task(&self, task: &Task) -> StoreFuture<()> {
        let store = self.clone();
        let task = task.clone();
        Box::pin(async move { store.put_task_sync(&task) })
    }

    fn replace_task(&self, old_id: &TaskId, task: &Task) -> StoreFuture<()> {
        let store = self.clone();
        let old_id = old_id.clone();
        let task = task.clone();
        Box::pin(async move {
            if old_id != task.id {
                store.remove_task_sync(&old_id)?;
            }
            store.put_task_sync(&task)
        })
    }

    fn remove_task(&self, task_id: &TaskId) -> StoreFuture<()> {
        let store = self.clone();
        let task_id = task_id.clone();
        Box::pin(async move {
            store.remove_task_sync(&task_id)?;
            Ok(())
        })
    }

    fn update_job(&self, job: &JobRecord) -> StoreFuture<()> {
        let store = self.clone();
        let job = job.clone();
        Box::pin(async move {
            let value = serde_json::to_vec(&job).map_err(map_err!(Serialize))?;
            let txn = store.db.begin_write().map_err(map_err!(Transaction))?;
            {
                let mut table = txn.open_table(JOBS).map_err(map_err!(Table))?;
                table
                    .insert(job.id.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            txn.commit().map_err(map_err!(Transaction))?;
            debug!(job_id = %job.id, "job updated");
            Ok(())
        })
    }
}
