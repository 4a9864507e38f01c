//! Storage backend trait

use async_trait::async_trait;

use super::error::Result;
use super::models::{LoadedData, StoredRetainedMessage, StoredSession};

/// Persistence operation for batch writes
#[derive(Debug, Clone)]
pub enum PersistenceOp {
    SetRetained {
        topic: String,
        message: StoredRetainedMessage,
    },
    DeleteRetained {
        topic: String,
    },
    SetSession {
        client_id: String,
        session: StoredSession,
    },
    DeleteSession {
        client_id: String,
    },
}

/// Durable store for retained messages and persistent sessions
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn get_retained(&self, topic: &str) -> Result<Option<StoredRetainedMessage>>;

    async fn set_retained(&self, topic: &str, message: &StoredRetainedMessage) -> Result<()>;

    async fn delete_retained(&self, topic: &str) -> Result<()>;

    async fn list_retained(&self) -> Result<Vec<(String, StoredRetainedMessage)>>;

    async fn get_session(&self, client_id: &str) -> Result<Option<StoredSession>>;

    async fn set_session(&self, client_id: &str, session: &StoredSession) -> Result<()>;

    async fn delete_session(&self, client_id: &str) -> Result<()>;

    async fn list_sessions(&self) -> Result<Vec<(String, StoredSession)>>;

    /// Apply a batch of operations atomically
    async fn batch_write(&self, ops: Vec<PersistenceOp>) -> Result<()>;

    /// Flush pending writes to disk
    async fn flush(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Load everything at startup
    async fn load_all(&self) -> Result<LoadedData> {
        Ok(LoadedData {
            retained: self.list_retained().await?,
            sessions: self.list_sessions().await?,
        })
    }
}
