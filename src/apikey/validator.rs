//! Presented-key validation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::key::{hash_key, is_well_formed};
use super::repository::{ApiKeyRecord, ApiKeyRepository};

/// What a request learns about the key that authenticated it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyMetadata {
    /// Key id, also the concurrency guard key
    pub id: Uuid,
    /// Owner of the key
    pub user_id: String,
    /// Display name
    pub name: String,
    /// Leading characters of the key
    pub prefix: String,
    /// Previous use, before this request
    pub last_used_at: Option<DateTime<Utc>>,
    /// Per-key in-flight job limit
    pub max_concurrent_jobs: Option<u64>,
}

impl From<ApiKeyRecord> for ApiKeyMetadata {
    fn from(record: ApiKeyRecord) -> Self {
        Self {
            id: record.id,
            user_id: record.user_id,
            name: record.name,
            prefix: record.prefix,
            last_used_at: record.last_used_at,
            max_concurrent_jobs: record.max_concurrent_jobs,
        }
    }
}

/// Resolves presented keys to their metadata.
pub struct ApiKeyValidator {
    repository: Arc<dyn ApiKeyRepository>,
}

impl ApiKeyValidator {
    /// Create a validator over `repository`.
    pub fn new(repository: Arc<dyn ApiKeyRepository>) -> Self {
        Self { repository }
    }

    /// Validate a presented key.
    ///
    /// Returns `None` for malformed, unknown or inactive keys, and when the
    /// repository cannot be reached. On success the last-used timestamp is
    /// updated in the background.
    pub async fn validate(&self, presented: &str) -> Option<ApiKeyMetadata> {
        let presented = presented.trim();
        if !is_well_formed(presented) {
            debug!("Rejected malformed API key");
            return None;
        }

        let record = match self.repository.find_by_hash(&hash_key(presented)).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!("Rejected unknown API key");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "API key lookup failed");
                return None;
            }
        };

        if !record.active {
            debug!(key_id = %record.id, "Rejected inactive API key");
            return None;
        }

        self.touch_in_background(record.id);
        Some(ApiKeyMetadata::from(record))
    }

    fn touch_in_background(&self, id: Uuid) {
        let repository = Arc::clone(&self.repository);
        let at = Utc::now();

        tokio::spawn(async move {
            if let Err(e) = repository.touch_last_used(id, at).await {
                warn!(key_id = %id, error = %e, "Failed to record API key use");
            }
        });
    }
}
