//! Redis-backed storage backend implementation.
//!
//! Used for cluster mode, where session/retained/subscription state must
//! survive a node crash independent of that node's local disk: an embedded
//! file store would not be visible to the node that takes over a dead
//! node's clients, but a shared Redis instance is. Keys are namespaced
//! `{entity}:{id}`, e.g. `session:client-123`, `retained:sensors/temp`.

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::backend::{PersistenceOp, StorageBackend};
use super::error::{PersistenceError, Result};
use super::models::{
    StoredInflightMessage, StoredRetainedMessage, StoredRole, StoredSession, StoredUser,
};

const RETAINED_PREFIX: &str = "retained:";
const SESSION_PREFIX: &str = "session:";
const USER_PREFIX: &str = "user:";
const ROLE_PREFIX: &str = "role:";
const INFLIGHT_PREFIX: &str = "inflight:";

fn inflight_key(client_id: &str, packet_id: u16) -> String {
    format!("{INFLIGHT_PREFIX}{client_id}:{packet_id}")
}

/// Redis-backed storage backend
pub struct RedisBackend {
    conn: ConnectionManager,
}

impl RedisBackend {
    /// Connect to Redis at the given URL (e.g. `redis://127.0.0.1:6379`)
    pub async fn open(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }

    fn serialize<T: bincode::Encode>(value: &T) -> Result<Vec<u8>> {
        bincode::encode_to_vec(value, bincode::config::standard()).map_err(PersistenceError::from)
    }

    fn deserialize<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T> {
        bincode::decode_from_slice(bytes, bincode::config::standard())
            .map(|(value, _)| value)
            .map_err(PersistenceError::from)
    }

    async fn get<T: bincode::Decode<()>>(&self, key: String) -> Result<Option<T>> {
        let mut conn = self.conn.clone();
        let bytes: Option<Vec<u8>> = conn.get(key).await?;
        bytes.map(|b| Self::deserialize(&b)).transpose()
    }

    async fn set<T: bincode::Encode>(&self, key: String, value: &T) -> Result<()> {
        let mut conn = self.conn.clone();
        let bytes = Self::serialize(value)?;
        let _: () = conn.set(key, bytes).await?;
        Ok(())
    }

    async fn delete(&self, key: String) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    /// List every entry under `prefix`, stripping it back off to recover the
    /// entity id. Uses `SCAN` rather than `KEYS` so it doesn't block the
    /// server on a large keyspace.
    async fn list<T: bincode::Decode<()>>(&self, prefix: &str) -> Result<Vec<(String, T)>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{prefix}*");
        let keys: Vec<String> = conn.scan_match(pattern).await?.collect::<Vec<_>>().await;

        let mut result = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(bytes) = conn.get::<_, Option<Vec<u8>>>(&key).await? {
                let id = key.trim_start_matches(prefix).to_string();
                result.push((id, Self::deserialize(&bytes)?));
            }
        }
        Ok(result)
    }
}

#[async_trait]
impl StorageBackend for RedisBackend {
    async fn get_retained(&self, topic: &str) -> Result<Option<StoredRetainedMessage>> {
        self.get(format!("{RETAINED_PREFIX}{topic}")).await
    }

    async fn set_retained(&self, topic: &str, message: &StoredRetainedMessage) -> Result<()> {
        self.set(format!("{RETAINED_PREFIX}{topic}"), message).await
    }

    async fn delete_retained(&self, topic: &str) -> Result<()> {
        self.delete(format!("{RETAINED_PREFIX}{topic}")).await
    }

    async fn list_retained(&self) -> Result<Vec<(String, StoredRetainedMessage)>> {
        self.list(RETAINED_PREFIX).await
    }

    async fn get_session(&self, client_id: &str) -> Result<Option<StoredSession>> {
        self.get(format!("{SESSION_PREFIX}{client_id}")).await
    }

    async fn set_session(&self, client_id: &str, session: &StoredSession) -> Result<()> {
        self.set(format!("{SESSION_PREFIX}{client_id}"), session).await
    }

    async fn delete_session(&self, client_id: &str) -> Result<()> {
        self.delete(format!("{SESSION_PREFIX}{client_id}")).await
    }

    async fn list_sessions(&self) -> Result<Vec<(String, StoredSession)>> {
        self.list(SESSION_PREFIX).await
    }

    async fn set_inflight(
        &self,
        client_id: &str,
        packet_id: u16,
        message: &StoredInflightMessage,
    ) -> Result<()> {
        self.set(inflight_key(client_id, packet_id), message).await
    }

    async fn delete_inflight(&self, client_id: &str, packet_id: u16) -> Result<()> {
        self.delete(inflight_key(client_id, packet_id)).await
    }

    async fn list_inflight(&self, client_id: &str) -> Result<Vec<StoredInflightMessage>> {
        let prefix = format!("{INFLIGHT_PREFIX}{client_id}:");
        let entries: Vec<(String, StoredInflightMessage)> = self.list(&prefix).await?;
        Ok(entries.into_iter().map(|(_, v)| v).collect())
    }

    async fn get_user(&self, username: &str) -> Result<Option<StoredUser>> {
        self.get(format!("{USER_PREFIX}{username}")).await
    }

    async fn set_user(&self, username: &str, user: &StoredUser) -> Result<()> {
        self.set(format!("{USER_PREFIX}{username}"), user).await
    }

    async fn delete_user(&self, username: &str) -> Result<()> {
        self.delete(format!("{USER_PREFIX}{username}")).await
    }

    async fn list_users(&self) -> Result<Vec<(String, StoredUser)>> {
        self.list(USER_PREFIX).await
    }

    async fn get_role(&self, name: &str) -> Result<Option<StoredRole>> {
        self.get(format!("{ROLE_PREFIX}{name}")).await
    }

    async fn set_role(&self, name: &str, role: &StoredRole) -> Result<()> {
        self.set(format!("{ROLE_PREFIX}{name}"), role).await
    }

    async fn delete_role(&self, name: &str) -> Result<()> {
        self.delete(format!("{ROLE_PREFIX}{name}")).await
    }

    async fn list_roles(&self) -> Result<Vec<(String, StoredRole)>> {
        self.list(ROLE_PREFIX).await
    }

    /// Redis has no multi-key atomic batch across our varied value types
    /// without Lua scripting, so this applies the ops sequentially. Lost
    /// atomicity is acceptable here: each op is independently idempotent
    /// and the writer loop retries the whole batch on any single failure.
    async fn batch_write(&self, ops: Vec<PersistenceOp>) -> Result<()> {
        for op in ops {
            match op {
                PersistenceOp::SetRetained { topic, message } => {
                    self.set_retained(&topic, &message).await?
                }
                PersistenceOp::DeleteRetained { topic } => self.delete_retained(&topic).await?,
                PersistenceOp::SetSession { client_id, session } => {
                    self.set_session(&client_id, &session).await?
                }
                PersistenceOp::DeleteSession { client_id } => {
                    self.delete_session(&client_id).await?
                }
                PersistenceOp::SetUser { username, user } => {
                    self.set_user(&username, &user).await?
                }
                PersistenceOp::DeleteUser { username } => self.delete_user(&username).await?,
                PersistenceOp::SetRole { name, role } => self.set_role(&name, &role).await?,
                PersistenceOp::DeleteRole { name } => self.delete_role(&name).await?,
                PersistenceOp::SetInflight {
                    client_id,
                    packet_id,
                    message,
                } => self.set_inflight(&client_id, packet_id, &message).await?,
                PersistenceOp::DeleteInflight { client_id, packet_id } => {
                    self.delete_inflight(&client_id, packet_id).await?
                }
            }
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        // Redis persists each write as it's issued; nothing to batch-flush.
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

impl From<redis::RedisError> for PersistenceError {
    fn from(err: redis::RedisError) -> Self {
        PersistenceError::Storage(err.to_string())
    }
}
