//! Error type shared by the remote client, the local store and the synchronizer.

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Remote unreachable, TLS failure, connection reset.
    #[error("failed to reach remote service: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success response, including rejected credentials (401/403).
    #[error("remote error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("rate limited by remote service: {0}")]
    RateLimited(String),

    #[error("invalid remote response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("batch {batch_id} did not finish within {waited:?}")]
    PollTimeout { batch_id: String, waited: Duration },

    #[error("batch {batch_id} did not finish after {attempts} polls, last status: {status}")]
    BatchUnfinished {
        batch_id: String,
        attempts: u32,
        status: String,
    },

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("mailing list {0} not found")]
    ListNotFound(i64),

    #[error("mailing list {0} is already syncing")]
    AlreadySyncing(i64),

    #[error("mailing list {0} has no remote list id or api key")]
    NotConfigured(i64),

    #[error("invalid input: {0}")]
    Invalid(String),
}

impl SyncError {
    pub fn api(status: u16, body: impl Into<String>) -> Self {
        Self::Api {
            status,
            body: body.into(),
        }
    }

    /// True when the remote rejected the credentials.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Api { status: 401 | 403, .. })
    }
}
