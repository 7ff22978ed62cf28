//! Dedicated store thread.
//!
//! The SQLite connection is opened on, and never leaves, one OS thread. Async
//! callers submit boxed jobs over a channel and await the job's own oneshot
//! reply, so no lock is held across an await point and jobs run in the order
//! they were submitted.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use quiznote_store_sqlite::{SqliteStore, StoreError};
use tokio::sync::oneshot;
use tracing::{debug, warn};

type Job = Box<dyn FnOnce(&mut SqliteStore) + Send + 'static>;

static NEXT_EXECUTOR_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("store executor channel closed")]
    ChannelClosed,
    #[error("failed to start store executor thread: {0}")]
    Spawn(#[source] std::io::Error),
}

pub struct OpenRequest {
    pub data_dir: PathBuf,
    pub name: String,
    pub target_version: i64,
    pub busy_timeout: Duration,
}

pub struct StoreExecutor {
    id: u64,
    sender: mpsc::Sender<Job>,
    handle: thread::JoinHandle<()>,
}

impl StoreExecutor {
    /// Start the store thread and open the database on it.
    ///
    /// The outer error means the thread could not be started or died before
    /// answering; the inner one is the open result itself.
    pub async fn open(request: OpenRequest) -> Result<Result<Self, StoreError>, ExecutorError> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let (opened_tx, opened_rx) = oneshot::channel::<Result<(), StoreError>>();

        let handle = thread::Builder::new()
            .name("quiznote-store".to_string())
            .spawn(move || {
                let opened = SqliteStore::open_identity(
                    &request.data_dir,
                    &request.name,
                    request.target_version,
                    request.busy_timeout,
                );
                let mut store = match opened {
                    Ok(store) => {
                        let _ = opened_tx.send(Ok(()));
                        store
                    }
                    Err(err) => {
                        let _ = opened_tx.send(Err(err));
                        return;
                    }
                };

                while let Ok(job) = receiver.recv() {
                    job(&mut store);
                }
                debug!("store executor stopped");
            })
            .map_err(ExecutorError::Spawn)?;

        match opened_rx.await.map_err(|_| ExecutorError::ChannelClosed)? {
            Ok(()) => {
                let id = NEXT_EXECUTOR_ID.fetch_add(1, Ordering::Relaxed);
                Ok(Ok(Self { id, sender, handle }))
            }
            Err(err) => {
                join_thread(handle, "store executor panicked during open").await;
                Ok(Err(err))
            }
        }
    }

    /// Distinguishes this executor from any later one opened on the same handle.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Run `op` on the store thread and await its result.
    pub async fn run<F, T>(&self, op: F) -> Result<T, ExecutorError>
    where
        F: FnOnce(&mut SqliteStore) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (response_tx, response_rx) = oneshot::channel();
        let job: Job = Box::new(move |store| {
            let _ = response_tx.send(op(store));
        });

        self.sender.send(job).map_err(|_| ExecutorError::ChannelClosed)?;
        response_rx.await.map_err(|_| ExecutorError::ChannelClosed)
    }

    /// Stop accepting jobs, let queued ones finish, and close the connection.
    pub async fn shutdown(self) {
        let Self { sender, handle, .. } = self;
        drop(sender);
        join_thread(handle, "store executor panicked before shutdown").await;
    }
}

async fn join_thread(handle: thread::JoinHandle<()>, panicked: &'static str) {
    match tokio::task::spawn_blocking(move || handle.join()).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => warn!("{panicked}"),
        Err(err) => warn!(error = %err, "failed to join store executor"),
    }
}
