use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("monitor {0} not found")]
    NotFound(String),
    #[error("monitor with stream_url {0} is already active")]
    DuplicateActiveMonitor(String),
    #[error("monitor {0} is not active")]
    NotActive(String),
    #[error("stats for monitor {0} not found")]
    StatsNotFound(String),
    #[error("storage backend error: {0}")]
    Backend(#[from] sqlx::Error),
}
