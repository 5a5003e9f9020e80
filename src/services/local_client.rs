//! Local BitTorrent client capability
//!
//! The fallback backend: torrents are handed straight to a client running next
//! to us (qBittorrent-style), addressed by info hash.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::services::resource_selector::ResourcePayload;

/// Simplified local job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalJobState {
    Queued,
    Checking,
    Downloading,
    Stalled,
    Paused,
    /// Payload fully downloaded (seeding or stopped after completion)
    Completed,
    Error,
}

impl std::fmt::Display for LocalJobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LocalJobState::Queued => write!(f, "queued"),
            LocalJobState::Checking => write!(f, "checking"),
            LocalJobState::Downloading => write!(f, "downloading"),
            LocalJobState::Stalled => write!(f, "stalled"),
            LocalJobState::Paused => write!(f, "paused"),
            LocalJobState::Completed => write!(f, "completed"),
            LocalJobState::Error => write!(f, "error"),
        }
    }
}

/// A torrent known to the local client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalJob {
    pub hash: String,
    pub name: String,
    pub state: LocalJobState,
    /// 0.0 ..= 1.0
    pub progress: f64,
    pub download_speed: u64,
    pub save_path: String,
}

/// A file inside a local torrent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalFile {
    pub index: usize,
    pub path: String,
    pub size: u64,
}

/// Local client used as the secondary backend
#[async_trait]
pub trait LocalClient: Send + Sync {
    /// Add a torrent; returns its info hash
    async fn add_torrent(
        &self,
        payload: &ResourcePayload,
        save_path: &str,
        category: &str,
    ) -> Result<String>;

    async fn get(&self, hash: &str) -> Result<Option<LocalJob>>;

    async fn files(&self, hash: &str) -> Result<Vec<LocalFile>>;

    async fn rename_file(&self, hash: &str, old_path: &str, new_path: &str) -> Result<()>;

    /// Priority 0 skips the files entirely
    async fn set_file_priority(&self, hash: &str, indices: &[usize], priority: u8) -> Result<()>;

    async fn delete(&self, hash: &str, delete_files: bool) -> Result<()>;
}

const VIDEO_EXTENSIONS: &[&str] = &["mkv", "mp4", "avi", "m4v", "ts", "webm", "mov", "wmv", "flv"];

pub fn is_video_path(path: &str) -> bool {
    std::path::Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| VIDEO_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Whether a job has made too little headway since submission.
///
/// Only meaningful once the stall window has elapsed.
pub fn is_stalled(job: &LocalJob, min_progress: f64) -> bool {
    job.progress < min_progress && job.download_speed == 0
}
