use thiserror::Error;

/// Domain error taxonomy shared by every subsystem (cache, repository,
/// wallet, session, AML, admission, reporting).
///
/// Business errors (`InsufficientFunds`, `Conflict`, `NotFound`, ...) are
/// enumerated values returned from core functions; only genuine invariant
/// violations surface as `Internal`.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("authorization denied: {0}")]
    Authorization(String),

    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("insufficient funds")]
    InsufficientFunds,

    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    #[error("upstream provider error: {0}")]
    Upstream(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource,
            id: id.into(),
        }
    }

    /// Machine-readable error code per spec.md §6's error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "INVALID_REQUEST",
            Self::Authentication(_) => "UNAUTHORIZED",
            Self::Authorization(_) => "FORBIDDEN",
            Self::NotFound { .. } => "RESOURCE_NOT_FOUND",
            Self::Conflict(_) => "DUPLICATE_RESOURCE",
            Self::InsufficientFunds => "INSUFFICIENT_FUNDS",
            Self::RateLimited { .. } => "RATE_LIMIT_EXCEEDED",
            Self::Upstream(_) => "SERVICE_UNAVAILABLE",
            Self::Internal(_) | Self::Database(_) | Self::Cache(_) | Self::Serialization(_) => {
                "INTERNAL_ERROR"
            }
        }
    }

    /// True when the database layer should retry once with a fresh
    /// serializable transaction (spec.md §7 recovery rules).
    pub fn is_retryable_db_conflict(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::Database(db_err)) => {
                // Postgres serialization_failure / deadlock_detected SQLSTATEs.
                matches!(db_err.code().as_deref(), Some("40001") | Some("40P01"))
            }
            _ => false,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
