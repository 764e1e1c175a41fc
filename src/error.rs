use thiserror::Error;

#[derive(Debug, Error)]
pub enum StashError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("File '{id}' not found")]
    NotFound { id: String },

    #[error("File '{id}' has expired")]
    Expired { id: String },

    #[error("Metadata index is corrupt: {0}")]
    IndexCorrupt(String),

    #[error("Metadata store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Could not allocate a free identifier after {attempts} attempts")]
    ResourceExhausted { attempts: usize },

    #[error("Blob I/O error ({context}): {source}")]
    BlobIo {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid upload: {0}")]
    InvalidUpload(String),
}

impl StashError {
    pub(crate) fn blob_io(context: impl Into<String>, source: std::io::Error) -> Self {
        StashError::BlobIo { context: context.into(), source }
    }

    /// `NotFound` and `Expired` look the same to callers.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StashError::NotFound { .. } | StashError::Expired { .. })
    }

    /// Only transient store failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StashError::StoreUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, StashError>;
