//! Error types for Estuary.
//!
//! Estuary uses a hierarchical error system:
//! - `Error` is the top-level error returned by all public APIs
//! - Specific error types (`StorageError`, `SourceError`, `NotFoundError`)
//!   provide detail for pattern matching
//!
//! The pipeline recovers locally by aborting the current batch and
//! reporting only the offending command. The synchronizer retries
//! [`SourceError::Transient`] failures with backoff and dead-letters
//! [`SourceError::Permanent`] ones. [`StorageError::Corrupted`] and
//! [`StorageError::Full`] are fatal to the worker process.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Estuary operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum for all Estuary operations.
///
/// This is the only error type returned by public APIs.
/// Use pattern matching to handle specific error cases.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage layer error (I/O, corruption, transactions).
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Requested entity, revision, or mapping not found.
    #[error("{0}")]
    NotFound(#[from] NotFoundError),

    /// Malformed command buffer; the command is dropped with a warning.
    #[error("Invalid payload: {reason}")]
    InvalidPayload {
        /// What was wrong with the payload.
        reason: String,
    },

    /// Operation precondition not met (e.g. modify of a deleted entity).
    #[error("Precondition failed: {reason}")]
    PreconditionFailed {
        /// Which precondition failed.
        reason: String,
    },

    /// Configuration error.
    #[error("Configuration error: {reason}")]
    Config {
        /// Description of what's wrong with the configuration.
        reason: String,
    },

    /// Source adaptor error (remote side).
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// Missing or invalid secret for a resource instance.
    ///
    /// Credentialed work suspends until a new secret arrives.
    #[error("Authentication required for resource {resource}")]
    Auth {
        /// The resource instance identifier lacking a secret.
        resource: String,
    },

    /// Cooperative cancellation; not an error to the user.
    #[error("Operation cancelled")]
    Cancelled,

    /// General I/O error (lockfile, blob staging, sockets).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Creates an invalid-payload error with the given reason.
    pub fn invalid_payload(reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            reason: reason.into(),
        }
    }

    /// Creates a precondition-failed error with the given reason.
    pub fn precondition(reason: impl Into<String>) -> Self {
        Self::PreconditionFailed {
            reason: reason.into(),
        }
    }

    /// Creates a configuration error with the given reason.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Creates an auth error for the given resource instance.
    pub fn auth(resource: impl Into<String>) -> Self {
        Self::Auth {
            resource: resource.into(),
        }
    }

    /// Returns true if this is a "not found" error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns true if this is a storage error.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Returns true if the synchronizer may retry this error with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Source(SourceError::Transient(_)))
    }

    /// Returns true if this error is fatal to the worker process.
    ///
    /// Corruption and storage exhaustion cannot be recovered in-process;
    /// the worker emits an error notification and exits cleanly.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Storage(StorageError::Corrupted(_)) | Self::Storage(StorageError::Full(_))
        )
    }

    /// Returns true if this is a cooperative cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Storage-related errors.
///
/// These errors indicate problems with the underlying storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database file or data is corrupted.
    #[error("Database corrupted: {0}")]
    Corrupted(String),

    /// Database file not found at expected path.
    #[error("Database not found: {0}")]
    DatabaseNotFound(PathBuf),

    /// Instance is locked by another worker process.
    #[error("Instance is locked by another worker")]
    Locked,

    /// The store ran out of space; fatal to the current transaction.
    #[error("Storage full: {0}")]
    Full(String),

    /// Transaction failed (commit, rollback, etc.).
    #[error("Transaction failed: {0}")]
    Transaction(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error from the redb storage engine.
    #[error("Storage engine error: {0}")]
    Engine(String),

    /// Database schema version doesn't match expected version.
    #[error("Schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch {
        /// Expected schema version.
        expected: u32,
        /// Actual schema version found in database.
        found: u32,
    },
}

impl StorageError {
    /// Creates a corruption error with the given message.
    pub fn corrupted(msg: impl Into<String>) -> Self {
        Self::Corrupted(msg.into())
    }

    /// Creates a transaction error with the given message.
    pub fn transaction(msg: impl Into<String>) -> Self {
        Self::Transaction(msg.into())
    }

    /// Creates a serialization error with the given message.
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Creates an engine error with the given message.
    pub fn engine(msg: impl Into<String>) -> Self {
        Self::Engine(msg.into())
    }
}

// Conversions from redb error types. Space exhaustion is routed to
// `Full` so callers can distinguish it from corruption.
impl From<redb::Error> for StorageError {
    fn from(err: redb::Error) -> Self {
        StorageError::Engine(err.to_string())
    }
}

impl From<redb::DatabaseError> for StorageError {
    fn from(err: redb::DatabaseError) -> Self {
        StorageError::Engine(err.to_string())
    }
}

impl From<redb::TransactionError> for StorageError {
    fn from(err: redb::TransactionError) -> Self {
        StorageError::Transaction(err.to_string())
    }
}

impl From<redb::CommitError> for StorageError {
    fn from(err: redb::CommitError) -> Self {
        StorageError::Transaction(format!("Commit failed: {}", err))
    }
}

impl From<redb::TableError> for StorageError {
    fn from(err: redb::TableError) -> Self {
        StorageError::Engine(format!("Table error: {}", err))
    }
}

impl From<redb::StorageError> for StorageError {
    fn from(err: redb::StorageError) -> Self {
        match err {
            redb::StorageError::Corrupted(msg) => StorageError::Corrupted(msg.to_string()),
            redb::StorageError::Io(e) if e.raw_os_error() == Some(28) => {
                // ENOSPC from the underlying file
                StorageError::Full(e.to_string())
            }
            other => StorageError::Engine(other.to_string()),
        }
    }
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

// Also allow direct conversion to Error for convenience.
impl From<redb::Error> for Error {
    fn from(err: redb::Error) -> Self {
        Error::Storage(StorageError::from(err))
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(err: redb::DatabaseError) -> Self {
        Error::Storage(StorageError::from(err))
    }
}

impl From<redb::TransactionError> for Error {
    fn from(err: redb::TransactionError) -> Self {
        Error::Storage(StorageError::from(err))
    }
}

impl From<redb::CommitError> for Error {
    fn from(err: redb::CommitError) -> Self {
        Error::Storage(StorageError::from(err))
    }
}

impl From<redb::TableError> for Error {
    fn from(err: redb::TableError) -> Self {
        Error::Storage(StorageError::from(err))
    }
}

impl From<redb::StorageError> for Error {
    fn from(err: redb::StorageError) -> Self {
        Error::Storage(StorageError::from(err))
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Storage(StorageError::from(err))
    }
}

/// Errors reported by a source adaptor.
///
/// The synchronizer maps these to retry, dead-letter, or connection
/// status notifications.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Retryable failure; the synchronizer backs off and retries.
    #[error("Transient source failure: {0}")]
    Transient(String),

    /// Permanent failure; the item is dead-lettered and surfaced.
    #[error("Permanent source failure: {0}")]
    Permanent(String),

    /// The source is unreachable.
    #[error("Source connection failed: {0}")]
    Connection(String),
}

impl SourceError {
    /// Creates a transient source error.
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Creates a permanent source error.
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Creates a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }
}

/// Not found errors for specific lookups.
#[derive(Debug, Error)]
pub enum NotFoundError {
    /// No entity with the given id exists for the type.
    #[error("Entity not found: {entity_type}/{id}")]
    Entity {
        /// The entity type that was queried.
        entity_type: String,
        /// Display form of the entity id.
        id: String,
    },

    /// The entity exists but has no record at the requested revision.
    #[error("Revision {revision} not found for entity {id}")]
    Revision {
        /// Display form of the entity id.
        id: String,
        /// The requested revision.
        revision: u64,
    },

    /// No local entity is mapped to the given remote id.
    #[error("Remote id not mapped: {0}")]
    RemoteId(String),
}

impl NotFoundError {
    /// Creates an entity-not-found error.
    pub fn entity(entity_type: impl ToString, id: impl ToString) -> Self {
        Self::Entity {
            entity_type: entity_type.to_string(),
            id: id.to_string(),
        }
    }

    /// Creates a revision-not-found error.
    pub fn revision(id: impl ToString, revision: u64) -> Self {
        Self::Revision {
            id: id.to_string(),
            revision,
        }
    }

    /// Creates a remote-id-not-mapped error.
    pub fn remote_id(id: impl ToString) -> Self {
        Self::RemoteId(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::config("missing storage dir");
        assert_eq!(err.to_string(), "Configuration error: missing storage dir");
    }

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::SchemaVersionMismatch {
            expected: 2,
            found: 1,
        };
        assert_eq!(
            err.to_string(),
            "Schema version mismatch: expected 2, found 1"
        );
    }

    #[test]
    fn test_not_found_display() {
        let err = NotFoundError::entity("mail", "abc123");
        assert_eq!(err.to_string(), "Entity not found: mail/abc123");
    }

    #[test]
    fn test_is_not_found() {
        let err: Error = NotFoundError::entity("mail", "x").into();
        assert!(err.is_not_found());
        assert!(!err.is_storage());
    }

    #[test]
    fn test_is_transient() {
        let err: Error = SourceError::transient("timeout").into();
        assert!(err.is_transient());

        let err: Error = SourceError::permanent("rejected").into();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_is_fatal() {
        let err: Error = StorageError::corrupted("bad page").into();
        assert!(err.is_fatal());

        let err: Error = StorageError::Full("disk".into()).into();
        assert!(err.is_fatal());

        let err: Error = NotFoundError::remote_id("r1").into();
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_error_conversion_chain() {
        fn inner() -> Result<()> {
            Err(StorageError::corrupted("test corruption"))?
        }

        let result = inner();
        assert!(result.is_err());
        assert!(result.unwrap_err().is_storage());
    }

    #[test]
    fn test_cancelled_is_not_fatal() {
        let err = Error::Cancelled;
        assert!(err.is_cancelled());
        assert!(!err.is_fatal());
    }
}
