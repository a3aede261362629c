//! API key persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use uuid::Uuid;

use crate::config::SeedApiKey;
use crate::store::StoreError;

/// A stored API key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiKeyRecord {
    /// Key id
    pub id: Uuid,
    /// Owner of the key
    pub user_id: String,
    /// Display name
    pub name: String,
    /// Leading characters of the key, for display
    pub prefix: String,
    /// SHA-256 hex digest of the full key
    #[serde(skip)]
    pub key_hash: String,
    /// Whether the key is accepted
    pub active: bool,
    /// When the key was issued
    pub created_at: DateTime<Utc>,
    /// When the key last authenticated a request
    pub last_used_at: Option<DateTime<Utc>>,
    /// Per-key in-flight job limit
    pub max_concurrent_jobs: Option<u64>,
}

impl ApiKeyRecord {
    /// Build an active record for a key hash.
    pub fn new(
        user_id: impl Into<String>,
        name: impl Into<String>,
        prefix: impl Into<String>,
        key_hash: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            name: name.into(),
            prefix: prefix.into(),
            key_hash: key_hash.into(),
            active: true,
            created_at: Utc::now(),
            last_used_at: None,
            max_concurrent_jobs: None,
        }
    }
}

impl From<SeedApiKey> for ApiKeyRecord {
    fn from(seed: SeedApiKey) -> Self {
        Self {
            active: seed.active,
            max_concurrent_jobs: seed.max_concurrent_jobs,
            ..Self::new(seed.user_id, seed.name, seed.prefix, seed.key_hash.to_ascii_lowercase())
        }
    }
}

/// Lookup and bookkeeping for API keys.
#[async_trait]
pub trait ApiKeyRepository: Send + Sync {
    /// Find a key by the hash of its full value.
    async fn find_by_hash(&self, key_hash: &str) -> Result<Option<ApiKeyRecord>, StoreError>;

    /// Record that a key was used at `at`.
    async fn touch_last_used(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;
}

/// Keys held in this process.
#[derive(Default)]
pub struct InMemoryApiKeyRepository {
    /// Records indexed by id
    records: DashMap<Uuid, ApiKeyRecord>,
    /// Hash to id
    by_hash: RwLock<std::collections::HashMap<String, Uuid>>,
}

impl InMemoryApiKeyRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a record, replacing any record with the same hash.
    ///
    /// The hash index stays locked until the record is visible, so a
    /// lookup never resolves an id whose record is missing.
    pub fn insert(&self, record: ApiKeyRecord) {
        let mut by_hash = self.by_hash.write();
        let key_hash = record.key_hash.clone();
        let id = record.id;

        self.records.insert(id, record);
        if let Some(previous) = by_hash.insert(key_hash, id) {
            if previous != id {
                self.records.remove(&previous);
            }
        }
    }

    /// Deactivate a key. Returns whether it existed.
    pub fn revoke(&self, id: Uuid) -> bool {
        match self.records.get_mut(&id) {
            Some(mut record) => {
                record.active = false;
                true
            }
            None => false,
        }
    }

    /// Fetch a record by id.
    pub fn get(&self, id: Uuid) -> Option<ApiKeyRecord> {
        self.records.get(&id).map(|r| r.clone())
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no keys are stored.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl ApiKeyRepository for InMemoryApiKeyRepository {
    async fn find_by_hash(&self, key_hash: &str) -> Result<Option<ApiKeyRecord>, StoreError> {
        let id = match self.by_hash.read().get(key_hash) {
            Some(id) => *id,
            None => return Ok(None),
        };
        Ok(self.get(id))
    }

    async fn touch_last_used(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        match self.records.get_mut(&id) {
            Some(mut record) => {
                record.last_used_at = Some(at);
                Ok(())
            }
            None => Err(StoreError::Query(format!("unknown API key {id}"))),
        }
    }
}
