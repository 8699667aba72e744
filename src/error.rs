/// Error types for the local store
///
/// Every fallible operation in the crate returns `StoreError`.
/// The training engine has its own `EngineError`, which folds into
/// `StoreError` at the manager boundary.

use rusqlite::ErrorCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The catalog database could not be opened. Fatal.
    #[error("failed to open local store at {path}: {source}")]
    StoreOpen {
        path: String,
        #[source]
        source: rusqlite::Error,
    },

    /// The catalog was written by a newer schema than this build knows.
    #[error("local store schema version {found} is newer than supported version {supported}")]
    VersionConflict { found: i64, supported: i64 },

    #[error("database error: {0}")]
    Database(#[source] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{collection} record not found: {id}")]
    NotFound { collection: &'static str, id: String },

    #[error("collection {collection} has no index {index}")]
    UnknownIndex { collection: &'static str, index: String },

    #[error("{collection} record already exists: {id}")]
    Duplicate { collection: &'static str, id: String },

    /// Persistent file area not supported or not granted. The caller can re-prompt.
    #[error("persistent storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The underlying store rejected a write for lack of space.
    #[error("storage quota exceeded")]
    QuotaExceeded,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The file's bytes were handed to the user and cannot be read back.
    #[error("file {file} is not retrievable: {reason}")]
    NotRetrievable { file: String, reason: String },

    #[error("unsupported dataset format: {0}")]
    UnsupportedFormat(String),

    #[error("invalid dataset: {0}")]
    DatasetInvalid(String),

    #[error("project {0} has no retrievable training data")]
    NoTrainingData(String),

    #[error("a training session is already running for project {0}")]
    SessionAlreadyRunning(String),

    #[error("training session {session_id} failed: {message}")]
    TrainingFailure { session_id: String, message: String },

    #[error("training session {0} was cancelled")]
    Cancelled(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _) if code.code == ErrorCode::DiskFull => {
                StoreError::QuotaExceeded
            }
            _ => StoreError::Database(err),
        }
    }
}

impl From<config::ConfigError> for StoreError {
    fn from(err: config::ConfigError) -> Self {
        StoreError::Config(err.to_string())
    }
}

impl From<EngineError> for StoreError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::DatasetInvalid(msg) => StoreError::DatasetInvalid(msg),
            other @ EngineError::UnsupportedAlgorithm(_) => StoreError::Config(other.to_string()),
            other => StoreError::TrainingFailure {
                session_id: String::new(),
                message: other.to_string(),
            },
        }
    }
}

impl StoreError {
    /// Disk-full conditions surface from the filesystem as plain IO errors.
    pub(crate) fn from_io(err: std::io::Error) -> Self {
        if is_disk_full(&err) {
            StoreError::QuotaExceeded
        } else {
            StoreError::Io(err)
        }
    }
}

#[cfg(unix)]
fn is_disk_full(err: &std::io::Error) -> bool {
    // ENOSPC
    err.raw_os_error() == Some(28)
}

#[cfg(windows)]
fn is_disk_full(err: &std::io::Error) -> bool {
    // ERROR_DISK_FULL, ERROR_HANDLE_DISK_FULL
    matches!(err.raw_os_error(), Some(112) | Some(39))
}

#[cfg(not(any(unix, windows)))]
fn is_disk_full(_err: &std::io::Error) -> bool {
    false
}

/// Errors raised by a training engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    DatasetInvalid(String),

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("training cancelled")]
    Cancelled,

    #[error("numeric failure: {0}")]
    Numeric(String),

    #[error("progress sink failed: {0}")]
    Progress(String),

    #[error("incompatible model artifact: {0}")]
    Artifact(String),

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_full_maps_to_quota() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_FULL),
            None,
        );
        assert!(matches!(StoreError::from(err), StoreError::QuotaExceeded));
    }

    #[cfg(unix)]
    #[test]
    fn test_enospc_maps_to_quota() {
        let io = std::io::Error::from_raw_os_error(28);
        assert!(matches!(StoreError::from_io(io), StoreError::QuotaExceeded));

        let other = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(StoreError::from_io(other), StoreError::Io(_)));
    }

    #[test]
    fn test_engine_dataset_error_keeps_kind() {
        let err: StoreError = EngineError::DatasetInvalid("no rows".into()).into();
        assert!(matches!(err, StoreError::DatasetInvalid(_)));

        let err: StoreError = EngineError::UnsupportedAlgorithm("forest".into()).into();
        assert!(matches!(err, StoreError::Config(ref m) if m.contains("forest")));

        let err: StoreError = EngineError::Numeric("nan loss".into()).into();
        assert!(matches!(err, StoreError::TrainingFailure { .. }));
    }
}
