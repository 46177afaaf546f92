//! Scheduler error types.

use buildmaster_config::ConfigError;
use buildmaster_db::DbError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error("worker connection: {0}")]
    Connection(#[from] buildmaster_core::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("unknown builder: {0}")]
    UnknownBuilder(String),

    #[error("unknown worker: {0}")]
    UnknownWorker(String),

    #[error("unknown lock: {0}")]
    UnknownLock(String),

    #[error("worker slot {slot} cannot go from {from} to {to}")]
    InvalidSlotTransition {
        slot: String,
        from: String,
        to: String,
    },

    #[error("substantiation of {worker} failed: {message}")]
    Substantiation { worker: String, message: String },

    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("master is stopped")]
    Stopped,
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
