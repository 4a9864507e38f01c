//! Persistence
//!
//! Durable storage for retained messages and for sessions created with
//! clean_session=false (subscriptions and queued QoS 1 messages). Writes
//! are fire-and-forget from the broker and committed in batches by a
//! background task.

mod backend;
mod error;
mod fjall;
mod models;

pub use backend::{PersistenceOp, StorageBackend};
pub use error::{PersistenceError, Result};
pub use fjall::FjallBackend;
pub use models::{
    LoadedData, StoredPublish, StoredRetainedMessage, StoredSession, StoredSubscription,
};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{BackendType, PersistenceConfig};

/// Capacity of the write queue
const WRITE_QUEUE_SIZE: usize = 10_000;

/// Handles background writes to a storage backend
pub struct PersistenceManager {
    backend: Arc<dyn StorageBackend>,
    tx: mpsc::Sender<PersistenceOp>,
    shutdown_tx: mpsc::Sender<()>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceManager {
    /// Start a manager over the given backend
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        flush_interval: Duration,
        max_batch_size: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(WRITE_QUEUE_SIZE);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let writer = tokio::spawn(Self::writer_loop(
            backend.clone(),
            rx,
            shutdown_rx,
            flush_interval,
            max_batch_size.max(1),
        ));

        Self {
            backend,
            tx,
            shutdown_tx,
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Open the configured backend and start a manager over it
    pub fn open(config: &PersistenceConfig) -> Result<Self> {
        let backend: Arc<dyn StorageBackend> = match config.backend {
            BackendType::Fjall => Arc::new(FjallBackend::open(&config.path)?),
        };
        info!("Persistence enabled at {}", config.path.display());
        Ok(Self::new(
            backend,
            config.flush_interval,
            config.max_batch_size,
        ))
    }

    /// Queue a write without waiting
    ///
    /// The operation is dropped when the queue is full.
    pub fn write(&self, op: PersistenceOp) {
        if let Err(e) = self.tx.try_send(op) {
            warn!("Persistence queue full, dropping operation: {}", e);
        }
    }

    pub async fn load_all(&self) -> Result<LoadedData> {
        self.backend.load_all().await
    }

    /// Commit queued writes and close the backend
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down persistence manager");

        let _ = self.shutdown_tx.send(()).await;
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                error!("Persistence writer task failed: {}", e);
            }
        }

        self.backend.close().await?;
        info!("Persistence manager shutdown complete");
        Ok(())
    }

    async fn commit(
        backend: &Arc<dyn StorageBackend>,
        batch: &mut Vec<PersistenceOp>,
        reason: &str,
    ) {
        if batch.is_empty() {
            return;
        }
        let count = batch.len();
        match backend.batch_write(std::mem::take(batch)).await {
            Ok(()) => debug!("Flushed {} operations ({})", count, reason),
            Err(e) => error!("Failed to write batch of {} operations: {}", count, e),
        }
    }

    async fn writer_loop(
        backend: Arc<dyn StorageBackend>,
        mut rx: mpsc::Receiver<PersistenceOp>,
        mut shutdown_rx: mpsc::Receiver<()>,
        flush_interval: Duration,
        max_batch_size: usize,
    ) {
        let mut batch = Vec::with_capacity(max_batch_size);
        let mut interval = tokio::time::interval(flush_interval);

        loop {
            tokio::select! {
                op = rx.recv() => {
                    match op {
                        Some(op) => {
                            batch.push(op);
                            if batch.len() >= max_batch_size {
                                Self::commit(&backend, &mut batch, "max batch").await;
                            }
                        }
                        None => break,
                    }
                }

                _ = interval.tick() => {
                    Self::commit(&backend, &mut batch, "interval").await;
                }

                _ = shutdown_rx.recv() => {
                    info!("Persistence writer received shutdown signal");
                    while let Ok(op) = rx.try_recv() {
                        batch.push(op);
                    }
                    break;
                }
            }
        }

        Self::commit(&backend, &mut batch, "shutdown").await;
        info!("Persistence writer loop exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn retained(topic: &str, payload: &[u8]) -> StoredRetainedMessage {
        StoredRetainedMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos: 1,
            stored_at_ms: 1_700_000_000_000,
        }
    }

    fn session(client_id: &str) -> StoredSession {
        StoredSession {
            client_id: client_id.to_string(),
            subscriptions: vec![StoredSubscription {
                filter: "a/#".to_string(),
                qos: 1,
            }],
            messages: vec![StoredPublish {
                topic: "a/b".to_string(),
                payload: b"queued".to_vec(),
                qos: 1,
            }],
            disconnected_at_ms: Some(1_700_000_000_000),
        }
    }

    #[tokio::test]
    async fn test_fjall_backend_basic_operations() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = FjallBackend::open(temp_dir.path()).unwrap();

        backend
            .set_retained("test/topic", &retained("test/topic", &[1, 2, 3]))
            .await
            .unwrap();
        let stored = backend.get_retained("test/topic").await.unwrap().unwrap();
        assert_eq!(stored.payload, vec![1, 2, 3]);

        backend.delete_retained("test/topic").await.unwrap();
        assert!(backend.get_retained("test/topic").await.unwrap().is_none());

        backend.set_session("c1", &session("c1")).await.unwrap();
        assert_eq!(backend.get_session("c1").await.unwrap(), Some(session("c1")));
        backend.delete_session("c1").await.unwrap();
        assert!(backend.list_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fjall_backend_batch_write() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = FjallBackend::open(temp_dir.path()).unwrap();

        let ops = vec![
            PersistenceOp::SetRetained {
                topic: "topic1".to_string(),
                message: retained("topic1", &[1]),
            },
            PersistenceOp::SetRetained {
                topic: "topic2".to_string(),
                message: retained("topic2", &[2]),
            },
            PersistenceOp::DeleteRetained {
                topic: "topic1".to_string(),
            },
            PersistenceOp::SetSession {
                client_id: "c1".to_string(),
                session: session("c1"),
            },
        ];
        backend.batch_write(ops).await.unwrap();

        let loaded = backend.load_all().await.unwrap();
        assert_eq!(loaded.retained.len(), 1);
        assert_eq!(loaded.retained[0].0, "topic2");
        assert_eq!(loaded.sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_manager_commits_queued_writes_on_shutdown() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = PersistenceConfig {
            enabled: true,
            path: temp_dir.path().to_path_buf(),
            flush_interval: Duration::from_secs(3600),
            max_batch_size: 1000,
            ..Default::default()
        };

        let manager = PersistenceManager::open(&config).unwrap();
        manager.write(PersistenceOp::SetSession {
            client_id: "c1".to_string(),
            session: session("c1"),
        });
        manager.write(PersistenceOp::SetRetained {
            topic: "t".to_string(),
            message: retained("t", b"v"),
        });
        manager.shutdown().await.unwrap();

        // The flush interval never elapsed, so only the shutdown drain wrote
        let loaded = manager.load_all().await.unwrap();
        assert_eq!(loaded.sessions, vec![("c1".to_string(), session("c1"))]);
        assert_eq!(loaded.retained.len(), 1);
        manager.shutdown().await.unwrap();
    }
}
