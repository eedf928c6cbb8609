//! Service-wide error types.

use escrow_protocol::EscrowError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Protocol(#[from] EscrowError),
}

/// Storage failures surface to the protocol as its own error type. A
/// duplicate `(campaign, sequence)` row means another writer won the race.
impl From<ServiceError> for EscrowError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::Protocol(inner) => inner,
            ServiceError::Database(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                EscrowError::Conflict(format!("event already recorded: {db}"))
            }
            other => EscrowError::Storage(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;
