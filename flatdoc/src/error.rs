use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Validation error: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Invalid reference in field '{field}': expected a 36-character id, got {value}")]
    InvalidReference { field: String, value: String },

    #[error("Document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Invalid pipeline stage: {0}")]
    InvalidStage(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Lock poisoned for collection '{0}'")]
    LockPoisoned(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connector error: {0}")]
    Connector(String),
}

/// Coarse classification of a [`StoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    IoFailure,
    ConnectorFailure,
    Usage,
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Validation(_) | StoreError::InvalidReference { .. } => {
                ErrorKind::Validation
            }
            StoreError::NotFound { .. } => ErrorKind::NotFound,
            StoreError::Io(_) | StoreError::Json(_) | StoreError::Yaml(_) => ErrorKind::IoFailure,
            StoreError::Sqlite(_) | StoreError::Connector(_) => ErrorKind::ConnectorFailure,
            StoreError::Schema(_)
            | StoreError::InvalidStage(_)
            | StoreError::InvalidArgument(_)
            | StoreError::LockPoisoned(_) => ErrorKind::Usage,
        }
    }

    /// Field-level messages carried by a validation failure.
    pub fn messages(&self) -> Vec<String> {
        match self {
            StoreError::Validation(messages) => messages.clone(),
            other => vec![other.to_string()],
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
