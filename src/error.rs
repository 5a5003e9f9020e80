//! Error taxonomy for the acquisition engine
//!
//! Collaborators report failures as [anyhow::Error]. The variants here are the
//! ones the engine has to tell apart: transient capacity problems, quota
//! rejections from the relay, and the one timeout that is never retried.

use std::time::Duration;

use thiserror::Error;

/// Marker carried by the message of [PoolError::WaitTimeout].
///
/// History records store error text only, so the orchestrator recognises the
/// non-retryable condition by this substring.
pub const RELAY_WAIT_TIMEOUT_MARKER: &str = "relay wait timeout";

/// Message persisted when the local client job stalls.
pub const DOWNLOAD_TIMEOUT_MESSAGE: &str = "download timeout";

/// Whether a persisted error message describes a failure that must not be
/// retried automatically.
pub fn is_non_retryable(message: &str) -> bool {
    message.contains(RELAY_WAIT_TIMEOUT_MARKER)
}

/// Failure reported by a relay session when creating an offline task.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("daily task creation limit exceeded: {0}")]
    DailyLimitExceeded(String),

    #[error("insufficient relay storage: {0}")]
    InsufficientStorage(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors surfaced by the [AccountPool](crate::services::AccountPool).
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no relay account available")]
    NoAccountAvailable,

    #[error("relay account {account} rejected task: {source}")]
    Rejected {
        account: String,
        #[source]
        source: RelayError,
    },

    #[error(
        "{marker}: task {task_id} did not finish within {timeout:?}",
        marker = RELAY_WAIT_TIMEOUT_MARKER
    )]
    WaitTimeout { task_id: String, timeout: Duration },

    #[error("relay task {task_id} failed: {message}")]
    TaskFailed { task_id: String, message: String },

    #[error("relay file is not tracked by any account: {0}")]
    FileNotTracked(String),

    #[error("account store failed: {0:#}")]
    Store(#[source] anyhow::Error),

    #[error(transparent)]
    Relay(#[from] anyhow::Error),
}

/// Errors returned by [DownloadOrchestrator](crate::services::DownloadOrchestrator).
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("no download backend configured")]
    NoBackend,

    #[error("download history store failed: {0:#}")]
    History(#[source] anyhow::Error),

    #[error("{0:#}")]
    Backend(#[source] anyhow::Error),
}

impl DownloadError {
    /// Transient capacity errors are never persisted and never reach observers.
    pub fn is_transient(&self) -> bool {
        matches!(self, DownloadError::Pool(PoolError::NoAccountAvailable))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_timeout_message_is_non_retryable() {
        let err = PoolError::WaitTimeout {
            task_id: "VN1".to_string(),
            timeout: Duration::from_secs(60),
        };
        assert!(is_non_retryable(&err.to_string()));
        assert!(is_non_retryable(&DownloadError::from(err).to_string()));
    }

    #[test]
    fn test_other_messages_are_retryable() {
        assert!(!is_non_retryable(DOWNLOAD_TIMEOUT_MESSAGE));
        assert!(!is_non_retryable("relay task VN1 failed: tracker unreachable"));
        assert!(!is_non_retryable(""));
    }

    #[test]
    fn test_only_no_account_is_transient() {
        assert!(DownloadError::Pool(PoolError::NoAccountAvailable).is_transient());
        assert!(!DownloadError::NoBackend.is_transient());
        assert!(
            !DownloadError::Pool(PoolError::Rejected {
                account: "a".to_string(),
                source: RelayError::DailyLimitExceeded("limit".to_string()),
            })
            .is_transient()
        );
    }
}
