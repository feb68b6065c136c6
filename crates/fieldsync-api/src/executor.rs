//! Store executor for non-blocking database operations.
//!
//! The store lives on a dedicated thread and every operation is shipped to it
//! over a channel, so callers never hold a connection across an await point.
//! Operations run one at a time, which makes the executor the single writer.
//!
//! ```ignore
//! let executor = StoreExecutor::new(store);
//! let rows = executor.run(|store| store.list("asset", DataSource::Local)).await?;
//! ```

use std::sync::mpsc;
use std::thread;

use anyhow::Result;
use fieldsync_store_sqlite::SqliteStore;
use tokio::sync::oneshot;
use tracing::debug;

type Job = Box<dyn FnOnce(&mut SqliteStore) + Send + 'static>;

/// Runs store operations on a dedicated thread.
pub struct StoreExecutor {
    sender: Option<mpsc::Sender<Job>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl StoreExecutor {
    /// Take ownership of `store` and start the worker thread.
    ///
    /// # Errors
    /// Returns an error when the worker thread cannot be spawned.
    pub fn new(mut store: SqliteStore) -> Result<Self, ExecutorError> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let handle = thread::Builder::new()
            .name("fieldsync-store".to_string())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    job(&mut store);
                }
                debug!("store executor drained");
            })
            .map_err(|err| ExecutorError::Spawn(err.to_string()))?;

        Ok(Self { sender: Some(sender), handle: Some(handle) })
    }

    /// Run `op` on the store thread and await its result.
    ///
    /// # Errors
    /// Returns the operation's own error, or [`ExecutorError::ChannelClosed`]
    /// when the worker is gone.
    pub async fn run<F, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (response_tx, response_rx) = oneshot::channel();
        let job: Job = Box::new(move |store| {
            let _ = response_tx.send(op(store));
        });

        self.sender
            .as_ref()
            .ok_or(ExecutorError::ChannelClosed)?
            .send(job)
            .map_err(|_| ExecutorError::ChannelClosed)?;

        response_rx.await.map_err(|_| ExecutorError::ChannelClosed)?
    }

    /// Stop accepting work, let queued operations finish and join the worker.
    ///
    /// # Errors
    /// Returns [`ExecutorError::WorkerPanicked`] when an operation panicked.
    pub fn shutdown(mut self) -> Result<(), ExecutorError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), ExecutorError> {
        self.sender.take();
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| ExecutorError::WorkerPanicked),
            None => Ok(()),
        }
    }
}

impl Drop for StoreExecutor {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("failed to start store thread: {0}")]
    Spawn(String),

    #[error("store executor channel closed; the executor may have shut down")]
    ChannelClosed,

    #[error("store thread panicked")]
    WorkerPanicked,
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use fieldsync_core::{DataSource, Row};
    use serde_json::json;

    use super::*;

    fn executor() -> Result<StoreExecutor> {
        let mut store = SqliteStore::open_default(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(StoreExecutor::new(store)?)
    }

    #[tokio::test]
    async fn runs_operations_on_the_store_thread() -> Result<()> {
        let executor = executor()?;
        let version = executor.run(|store| Ok(store.schema_status()?.current_version)).await?;
        assert_eq!(version, 2);

        let mut row = Row::new();
        row.insert("id".to_string(), json!("t1"));
        row.insert("key".to_string(), json!("k"));
        row.insert("value".to_string(), json!("v"));
        executor.run(move |store| store.insert("tag", DataSource::Local, row)).await?;
        let found = executor
            .run(|store| store.find_by_id("tag", DataSource::Local, "t1"))
            .await?;
        assert!(found.is_some());
        executor.shutdown()?;
        Ok(())
    }

    #[tokio::test]
    async fn operation_errors_pass_through_unchanged() -> Result<()> {
        let executor = executor()?;
        let Err(err) = executor.run(|store| store.list("recording", DataSource::Synced)).await else {
            panic!("unknown table must fail");
        };
        assert!(err.to_string().contains("recording"));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_callers_are_serialized() -> Result<()> {
        let executor = std::sync::Arc::new(executor()?);
        let mut tasks = Vec::new();
        for index in 0..8 {
            let executor = std::sync::Arc::clone(&executor);
            tasks.push(tokio::spawn(async move {
                let mut row = Row::new();
                row.insert("key".to_string(), json!("n"));
                row.insert("value".to_string(), json!(index.to_string()));
                executor.run(move |store| store.insert("tag", DataSource::Local, row)).await
            }));
        }
        for task in tasks {
            task.await??;
        }
        let rows = executor.run(|store| store.list("tag", DataSource::Local)).await?;
        assert_eq!(rows.len(), 8);
        Ok(())
    }
}
