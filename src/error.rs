use axum::http::StatusCode;
use thiserror::Error;

/// Domain error for the comparison-and-rating subsystem.
///
/// Every variant maps to an HTTP status for the API surface and to a
/// category code + operator hint for CLI/log output.
#[derive(Debug, Error)]
pub enum ArenaError {
    #[error("invalid metric id")]
    InvalidMetric,

    #[error("batch size {requested} exceeds the maximum of {max}")]
    InvalidBatchSize { requested: u32, max: u32 },

    #[error("default test set '{0}' is not configured")]
    NoDefaultTestSet(String),

    #[error("comparison token not found or expired")]
    TokenUnknownOrExpired,

    #[error("comparison token payload could not be parsed")]
    MalformedToken,

    #[error("one or both samples for the comparison no longer exist")]
    SamplesNotFound,

    #[error("invalid ranking: {0}")]
    RanksInvalid(String),

    #[error("samples in the comparison do not share a test set")]
    TestSetMismatch,

    #[error("identity does not have the vote permission")]
    Forbidden,

    #[error("authenticated user not found")]
    UnknownUser,

    #[error("{0} not found")]
    NotFound(String),

    #[error("rating computation failed: {0}")]
    RatingMath(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Cache(#[from] redis::RedisError),
}

pub type ArenaResult<T> = std::result::Result<T, ArenaError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Input,
    Token,
    Referential,
    Auth,
    Storage,
    Rating,
}

impl ErrorCategory {
    pub fn code(self) -> &'static str {
        match self {
            ErrorCategory::Input => "INPUT",
            ErrorCategory::Token => "TOKEN",
            ErrorCategory::Referential => "REFERENTIAL",
            ErrorCategory::Auth => "AUTH",
            ErrorCategory::Storage => "STORAGE",
            ErrorCategory::Rating => "RATING",
        }
    }

    pub fn hint(self) -> &'static str {
        match self {
            ErrorCategory::Input => "Correct the request parameters and retry.",
            ErrorCategory::Token => {
                "Request a fresh comparison batch; tokens are single-use and expire after an hour."
            }
            ErrorCategory::Referential => {
                "The referenced samples or scopes changed underneath the client; refresh and retry."
            }
            ErrorCategory::Auth => "The identity lacks the vote permission or does not exist.",
            ErrorCategory::Storage => {
                "Check --database-url/--redis-url and run with RUST_LOG=debug for query logs."
            }
            ErrorCategory::Rating => {
                "A rating update was skipped and will be retried; check telemetry for math errors."
            }
        }
    }
}

impl ArenaError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ArenaError::InvalidMetric
            | ArenaError::InvalidBatchSize { .. }
            | ArenaError::RanksInvalid(_)
            | ArenaError::MalformedToken => ErrorCategory::Input,
            ArenaError::TokenUnknownOrExpired => ErrorCategory::Token,
            ArenaError::SamplesNotFound
            | ArenaError::TestSetMismatch
            | ArenaError::NoDefaultTestSet(_)
            | ArenaError::NotFound(_) => ErrorCategory::Referential,
            ArenaError::Forbidden | ArenaError::UnknownUser => ErrorCategory::Auth,
            ArenaError::Database(_) | ArenaError::Cache(_) => ErrorCategory::Storage,
            ArenaError::RatingMath(_) => ErrorCategory::Rating,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ArenaError::InvalidMetric
            | ArenaError::MalformedToken
            | ArenaError::RanksInvalid(_) => StatusCode::BAD_REQUEST,
            ArenaError::InvalidBatchSize { .. } => StatusCode::NOT_ACCEPTABLE,
            ArenaError::TokenUnknownOrExpired
            | ArenaError::SamplesNotFound
            | ArenaError::UnknownUser
            | ArenaError::NotFound(_) => StatusCode::NOT_FOUND,
            ArenaError::TestSetMismatch => StatusCode::CONFLICT,
            ArenaError::Forbidden => StatusCode::FORBIDDEN,
            ArenaError::NoDefaultTestSet(_)
            | ArenaError::RatingMath(_)
            | ArenaError::Database(_)
            | ArenaError::Cache(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub fn format_cli_error(err: &anyhow::Error) -> String {
    let category = err
        .downcast_ref::<ArenaError>()
        .map(ArenaError::category)
        .unwrap_or(ErrorCategory::Storage);
    format!("[{}] {:#}\nHint: {}", category.code(), err, category.hint())
}
