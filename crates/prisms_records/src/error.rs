use serde::Serialize;
use thiserror::Error;

/// Unified error type for record keeping operations
#[derive(Debug, Error)]
pub enum RecordError {
    // Validation errors (malformed change records are never persisted)
    #[error("Invalid change record: {0}")]
    InvalidRecord(String),

    #[error("Unknown subject type '{0}'")]
    UnknownSubjectType(String),

    #[error("Unknown change type '{change}' for subject '{subject}'")]
    UnknownChangeType { subject: String, change: String },

    // Backend errors
    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Lock poisoned: a previous holder panicked")]
    LockPoisoned,

    #[error("No free IDs left in the range of center {0}")]
    IdSpaceExhausted(i32),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Record persister error: {0}")]
    Persister(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Could not parse stored value '{value}': {reason}")]
    ValueParse { value: String, reason: String },

    // Config errors
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config serialize error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Result type alias for record keeping operations
pub type Result<T> = std::result::Result<T, RecordError>;

impl<T> From<std::sync::PoisonError<T>> for RecordError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        RecordError::LockPoisoned
    }
}

/// A serializable representation of RecordError for administrative callers
/// that report a single human-readable message.
#[derive(Debug, Clone, Serialize)]
pub struct SerializableError {
    /// Error kind/variant name
    pub kind: String,
    /// Human-readable error message
    pub message: String,
}

impl From<&RecordError> for SerializableError {
    fn from(err: &RecordError) -> Self {
        let kind = match err {
            RecordError::InvalidRecord(_) => "InvalidRecord",
            RecordError::UnknownSubjectType(_) => "UnknownSubjectType",
            RecordError::UnknownChangeType { .. } => "UnknownChangeType",
            #[cfg(feature = "sqlite")]
            RecordError::Database(_) => "Database",
            RecordError::Io(_) => "Io",
            RecordError::LockPoisoned => "LockPoisoned",
            RecordError::IdSpaceExhausted(_) => "IdSpaceExhausted",
            RecordError::NotFound(_) => "NotFound",
            RecordError::Persister(_) => "Persister",
            RecordError::Serialization(_) => "Serialization",
            RecordError::ValueParse { .. } => "ValueParse",
            RecordError::ConfigParse(_) => "ConfigParse",
            RecordError::ConfigSerialize(_) => "ConfigSerialize",
            RecordError::Config(_) => "Config",
        }
        .to_string();

        Self {
            kind,
            message: err.to_string(),
        }
    }
}

impl From<RecordError> for SerializableError {
    fn from(err: RecordError) -> Self {
        SerializableError::from(&err)
    }
}

impl RecordError {
    /// Convert to a serializable representation
    pub fn to_serializable(&self) -> SerializableError {
        SerializableError::from(self)
    }

    /// Whether this error came from the storage backend rather than from the
    /// caller's input. Backend failures may be retried by the caller when the
    /// operation is idempotent.
    pub fn is_backend(&self) -> bool {
        match self {
            #[cfg(feature = "sqlite")]
            RecordError::Database(_) => true,
            RecordError::Io(_) | RecordError::LockPoisoned | RecordError::Persister(_) => true,
            _ => false,
        }
    }
}
