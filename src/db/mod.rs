//! Persisted records and the repositories the engine reads and writes through

pub mod accounts;
pub mod download_history;

pub use accounts::{AccountHealth, AccountRecord, AccountRepository, InMemoryAccountRepository};
pub use download_history::{
    BackendContext, DownloadBackend, DownloadHistoryRecord, DownloadHistoryRepository,
    EpisodeKey, HistoryState, InMemoryHistoryRepository,
};
