//! Repository error type shared by every table.

use thiserror::Error;

pub type RepoResult<T> = Result<T, RepoError>;

/// Outcome classes of a repository call.
///
/// `Store` is the transient class (connectivity, locking, I/O). The other
/// variants are deterministic and retrying them will not help.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("{entity} {key} not found")]
    NotFound { entity: &'static str, key: String },
    #[error("invalid {entity}: {reason}")]
    Validation {
        entity: &'static str,
        reason: &'static str,
    },
    #[error("unknown field `{field}` on {entity}")]
    UnknownField { entity: &'static str, field: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("database error: {0}")]
    Store(#[source] sqlx::Error),
}

impl RepoError {
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        RepoError::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub fn invalid(entity: &'static str, reason: &'static str) -> Self {
        RepoError::Validation { entity, reason }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RepoError::NotFound { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, RepoError::Store(_))
    }
}

impl From<sqlx::Error> for RepoError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            // Constraint violations are deterministic, never transient.
            sqlx::Error::Database(db)
                if db.is_unique_violation()
                    || db.is_foreign_key_violation()
                    || db.is_check_violation() =>
            {
                RepoError::Conflict(db.message().to_string())
            }
            other => RepoError::Store(other),
        }
    }
}
