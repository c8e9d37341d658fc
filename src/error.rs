#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    IO(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Configuration parsing error: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("storage configuration required: set kv.dir or s3.bucket")]
    NoStorageConfigured,
}

/// Errors surfaced by the storage contract. Backend-specific failures are
/// flattened into `WriteFailed`/`ReadFailed` with the backend's message.
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("Could not open storage: {0}")]
    Open(String),

    #[error("Invalid profile metadata: {0}")]
    InvalidMetadata(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Profile not found: {0}")]
    NotFound(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Corrupt storage key: {0}")]
    CorruptKey(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Storage is closed")]
    Closed,
}

/// Outcome of a single reclamation attempt that did not reclaim anything.
#[derive(thiserror::Error, Debug)]
pub enum GcError {
    /// Sentinel: the store had nothing worth rewriting. Not a failure.
    #[error("nothing to reclaim")]
    NothingToReclaim,

    #[error("storage is closed")]
    Closed,

    #[error("reclamation failed: {0}")]
    Backend(StorageError),
}

impl From<StorageError> for GcError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Closed => GcError::Closed,
            other => GcError::Backend(other),
        }
    }
}

#[derive(thiserror::Error, Debug)]
#[error("unknown profile type: {0}")]
pub struct ParseProfileTypeError(pub String);

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error("Server initialization error: {0}")]
    Init(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Upstream storage error: {0}")]
    Upstream(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

}

impl From<StorageError> for ServerError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidMetadata(_) | StorageError::InvalidQuery(_) => {
                ServerError::BadRequest(err.to_string())
            }
            StorageError::NotFound(_) | StorageError::CorruptKey(_) => {
                ServerError::NotFound(err.to_string())
            }
            StorageError::WriteFailed(_) | StorageError::ReadFailed(_) => {
                ServerError::Upstream(err.to_string())
            }
            StorageError::Open(_) | StorageError::Cancelled | StorageError::Closed => {
                ServerError::Unavailable(err.to_string())
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
