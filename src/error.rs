use rusqlite::{ffi, ErrorCode};
use thiserror::Error;

/// Errors surfaced by every registry operation.
///
/// Only [`RegistryError::Conflict`] is safe to retry automatically; every other
/// kind needs the caller (or a human) to change something first.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("dependency cycle: {0}")]
    Cycle(String),

    #[error("conflict (retryable): {0}")]
    Conflict(String),

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("external fetch failed: {0}")]
    Http(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

impl RegistryError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn permission(msg: impl Into<String>) -> Self {
        Self::Permission(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Whether a caller may retry the failed operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Short machine-readable code, used by the CLI and in log fields.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Permission(_) => "PERMISSION_ERROR",
            Self::Duplicate(_) => "DUPLICATE_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Cycle(_) => "CYCLE_ERROR",
            Self::Conflict(_) => "CONFLICT",
            Self::Integrity(_) => "INTEGRITY_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Http(_) => "HTTP_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

impl From<rusqlite::Error> for RegistryError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => Self::NotFound("no matching row".to_string()),
            rusqlite::Error::SqliteFailure(ref e, ref msg) => match e.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    Self::Conflict(format!("database is busy: {}", describe(e, msg)))
                }
                ErrorCode::ConstraintViolation => constraint_error(e, msg),
                _ => Self::Storage(err.to_string()),
            },
            other => Self::Storage(other.to_string()),
        }
    }
}

fn describe(e: &rusqlite::ffi::Error, msg: &Option<String>) -> String {
    msg.clone().unwrap_or_else(|| e.to_string())
}

/// Prefix SQLite reports when either per-slot index on `file_instances` rejects a row.
const SLOT_INDEX_VIOLATION: &str =
    "UNIQUE constraint failed: file_instances.blueprint_id, file_instances.env_id";

/// Only a lost race on the slot indexes is retryable. Trigger aborts guard
/// the append-only tables; anything else is a bad write.
fn constraint_error(e: &rusqlite::ffi::Error, msg: &Option<String>) -> RegistryError {
    let text = describe(e, msg);
    match e.extended_code {
        ffi::SQLITE_CONSTRAINT_UNIQUE if text.starts_with(SLOT_INDEX_VIOLATION) => {
            RegistryError::Conflict(text)
        }
        ffi::SQLITE_CONSTRAINT_TRIGGER => RegistryError::Integrity(text),
        _ => RegistryError::Storage(text),
    }
}

impl From<reqwest::Error> for RegistryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Http(format!("request timed out: {}", err))
        } else {
            Self::Http(err.to_string())
        }
    }
}
