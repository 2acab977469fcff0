use thiserror::Error;

use crate::types::Entity;

#[derive(Error, Debug)]
pub enum EtlError {
    #[error("{source_name}: missing required column(s) {missing:?}")]
    SchemaMismatch {
        source_name: &'static str,
        missing: Vec<String>,
    },

    #[error("{source_name}: unreadable source: {message}")]
    UnreadableSource {
        source_name: &'static str,
        message: String,
    },

    #[error("incremental mode requested but no prior successful run is recorded")]
    LedgerUnavailable,

    #[error("another run already holds the warehouse run lock")]
    ConcurrentRunDetected,

    #[error("{entity} batch failed and was rolled back: {source}")]
    ConstraintViolation {
        entity: Entity,
        #[source]
        source: sqlx::Error,
    },

    #[error("database query failed: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("database migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("environment variable error: {0}")]
    EnvVar(#[from] std::env::VarError),
}

pub type Result<T> = std::result::Result<T, EtlError>;
