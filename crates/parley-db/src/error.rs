use thiserror::Error;

/// Domain error taxonomy for the store layer. The API layer maps these onto
/// HTTP statuses; the gateway maps them onto `error` frames.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}")]
    Validation(String),

    /// Display is deliberately generic; the inner detail is for server logs.
    #[error("not permitted")]
    Authorization(&'static str),

    #[error("insufficient balance: need {required} coins, have {available}")]
    InsufficientBalance { required: i64, available: i64 },

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Conflict(&'static str),

    #[error("database lock poisoned")]
    Lock,

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

impl StoreError {
    /// Contention errors worth retrying at the transaction boundary.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::Db(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::DatabaseBusy
                    || e.code == rusqlite::ErrorCode::DatabaseLocked
        )
    }

    /// What the actor did to get this error, for log lines.
    pub fn detail(&self) -> String {
        match self {
            Self::Authorization(detail) => (*detail).to_string(),
            other => other.to_string(),
        }
    }
}

/// Map a UNIQUE-constraint violation to a domain conflict, passing everything
/// else through.
pub(crate) fn map_constraint(e: rusqlite::Error, conflict: &'static str) -> StoreError {
    match e {
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StoreError::Conflict(conflict)
        }
        other => StoreError::Db(other),
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
