// Origin-local persistent key/value storage
// Every surface owns one scope; the parent domain owns another for shared cookies

mod memory;
mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use thiserror::Error;

use crate::error::ApiError;

/// Storage failures. Callers in the session core degrade these to "absent".
#[derive(Error, Debug)]
pub enum StorageError {
    /// Persistence is disabled or could not be reached
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// SQLite backend failure
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        ApiError::Storage(err.to_string())
    }
}

/// Synchronous key/value store scoped to a single origin
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Storage that always fails, modelling a surface with persistence disabled
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledStorage;

impl Storage for DisabledStorage {
    fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
        Err(StorageError::Unavailable("persistence disabled".to_string()))
    }

    fn set(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
        Err(StorageError::Unavailable("persistence disabled".to_string()))
    }

    fn remove(&self, _key: &str) -> Result<(), StorageError> {
        Err(StorageError::Unavailable("persistence disabled".to_string()))
    }
}
