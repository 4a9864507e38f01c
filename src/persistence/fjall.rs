//! Fjall storage backend
//!
//! Local LSM-tree storage with one partition per record kind.

use std::path::Path;

use async_trait::async_trait;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use super::backend::{PersistenceOp, StorageBackend};
use super::error::{PersistenceError, Result};
use super::models::{StoredRetainedMessage, StoredSession};

pub struct FjallBackend {
    keyspace: Keyspace,
    retained: PartitionHandle,
    sessions: PartitionHandle,
}

impl FjallBackend {
    /// Open (or create) a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let keyspace = Config::new(path).open()?;

        let retained = keyspace.open_partition("retained", PartitionCreateOptions::default())?;
        let sessions = keyspace.open_partition("sessions", PartitionCreateOptions::default())?;

        Ok(Self {
            keyspace,
            retained,
            sessions,
        })
    }

    fn serialize<T: bincode::Encode>(value: &T) -> Result<Vec<u8>> {
        bincode::encode_to_vec(value, bincode::config::standard()).map_err(PersistenceError::from)
    }

    fn deserialize<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T> {
        bincode::decode_from_slice(bytes, bincode::config::standard())
            .map(|(value, _)| value)
            .map_err(PersistenceError::from)
    }

    fn get<T: bincode::Decode<()>>(partition: &PartitionHandle, key: &str) -> Result<Option<T>> {
        match partition.get(key)? {
            Some(bytes) => Ok(Some(Self::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn list<T: bincode::Decode<()>>(partition: &PartitionHandle) -> Result<Vec<(String, T)>> {
        let mut result = Vec::new();
        for item in partition.iter() {
            let (key, value) = item?;
            let key = std::str::from_utf8(&key)
                .map_err(|e| PersistenceError::Corruption(format!("non-UTF-8 key: {}", e)))?
                .to_string();
            result.push((key, Self::deserialize(&value)?));
        }
        Ok(result)
    }
}

#[async_trait]
impl StorageBackend for FjallBackend {
    async fn get_retained(&self, topic: &str) -> Result<Option<StoredRetainedMessage>> {
        Self::get(&self.retained, topic)
    }

    async fn set_retained(&self, topic: &str, message: &StoredRetainedMessage) -> Result<()> {
        self.retained.insert(topic, Self::serialize(message)?)?;
        Ok(())
    }

    async fn delete_retained(&self, topic: &str) -> Result<()> {
        self.retained.remove(topic)?;
        Ok(())
    }

    async fn list_retained(&self) -> Result<Vec<(String, StoredRetainedMessage)>> {
        Self::list(&self.retained)
    }

    async fn get_session(&self, client_id: &str) -> Result<Option<StoredSession>> {
        Self::get(&self.sessions, client_id)
    }

    async fn set_session(&self, client_id: &str, session: &StoredSession) -> Result<()> {
        self.sessions.insert(client_id, Self::serialize(session)?)?;
        Ok(())
    }

    async fn delete_session(&self, client_id: &str) -> Result<()> {
        self.sessions.remove(client_id)?;
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<(String, StoredSession)>> {
        Self::list(&self.sessions)
    }

    async fn batch_write(&self, ops: Vec<PersistenceOp>) -> Result<()> {
        let mut batch = self.keyspace.batch();

        for op in ops {
            match op {
                PersistenceOp::SetRetained { topic, message } => {
                    batch.insert(&self.retained, topic, Self::serialize(&message)?);
                }
                PersistenceOp::DeleteRetained { topic } => {
                    batch.remove(&self.retained, topic);
                }
                PersistenceOp::SetSession { client_id, session } => {
                    batch.insert(&self.sessions, client_id, Self::serialize(&session)?);
                }
                PersistenceOp::DeleteSession { client_id } => {
                    batch.remove(&self.sessions, client_id);
                }
            }
        }

        batch.commit()?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // fjall releases its resources on drop
        self.flush().await
    }
}
