//! Episode acquisition engine
//!
//! Picks the best release for an episode, pushes it through a relay offline
//! downloader (pool of quota-limited accounts plus a local segment-transfer
//! client) and falls back to a local BitTorrent client. Every attempt is
//! tracked in a persisted per-episode history so restarts resume instead of
//! resubmitting.

pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod services;

pub use config::Config;
pub use error::{DownloadError, PoolError, RelayError};
pub use services::{
    AccountPool, CompletionObserver, DownloadOrchestrator, OrchestratorConfig, Resource, Series,
};
