//! API key issuing and validation.

mod key;
mod repository;
mod validator;

pub use key::{hash_key, is_well_formed, ApiKey, KEY_PREFIX};
pub use repository::{ApiKeyRecord, ApiKeyRepository, InMemoryApiKeyRepository};
pub use validator::{ApiKeyMetadata, ApiKeyValidator};
