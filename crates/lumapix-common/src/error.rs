//! Error types for Lumapix
//!
//! This module defines the common error types used throughout the caching
//! layer.

use thiserror::Error;

/// Common result type for Lumapix operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Lumapix
#[derive(Debug, Error)]
pub enum Error {
    /// The store file could not be created or opened. Caches degrade to
    /// WAL/memory-only mode when they see this.
    #[error("store unavailable: {name}: {reason}")]
    StoreUnavailable { name: String, reason: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),

    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
}

impl From<redb::TransactionError> for Error {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl Error {
    /// Create a store-unavailable error
    pub fn store_unavailable(name: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::StoreUnavailable {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Check if this means the backing store never opened
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }

    /// Check if this is a value-decoding problem (treated as a cache miss)
    #[must_use]
    pub fn is_serialization(&self) -> bool {
        matches!(self, Self::Serialization(_))
    }
}
