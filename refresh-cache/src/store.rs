//! Entry storage.
//!
//! Stores only know about whole entries and a physical retention time. They
//! never decide freshness; that is the manager's job, based on `expires_at`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::clock::{self, Clock};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    pub stored_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("stored entry is not valid JSON: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<CacheEntry>, StoreError>;

    /// Replace the entry for `entry.key`, keeping it for `retain`.
    async fn save(&self, entry: &CacheEntry, retain: Duration) -> Result<(), StoreError>;
}

// ------------------------------------------------------------------ //
//  Redis                                                              //
// ------------------------------------------------------------------ //

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn load(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await?;
        raw.map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn save(&self, entry: &CacheEntry, retain: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let raw = serde_json::to_string(entry)?;
        // SET .. EX replaces the whole value in one command.
        let _: () = conn
            .set_ex(&entry.key, raw, retain.as_secs().max(1))
            .await?;
        Ok(())
    }
}

// ------------------------------------------------------------------ //
//  In-memory                                                          //
// ------------------------------------------------------------------ //

/// Process-local store used when no Redis is configured.
#[derive(Clone)]
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    entries: Arc<Mutex<HashMap<String, (CacheEntry, DateTime<Utc>)>>>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            Some((_, evict_at)) if now >= *evict_at => {
                entries.remove(key);
                Ok(None)
            }
            Some((entry, _)) => Ok(Some(entry.clone())),
            None => Ok(None),
        }
    }

    /// Also drops every other entry past its retention window.
    async fn save(&self, entry: &CacheEntry, retain: Duration) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, (_, evict_at)| now < *evict_at);
        entries.insert(entry.key.clone(), (entry.clone(), clock::add(now, retain)));
        Ok(())
    }
}
