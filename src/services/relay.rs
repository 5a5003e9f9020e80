//! Relay service capability
//!
//! A relay is a quota-limited offline download service: it fetches a torrent
//! server-side, after which the files are pulled locally over plain HTTP. Each
//! account gets its own session; the wire client lives outside this crate.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::db::AccountRecord;
use crate::error::RelayError;

/// Phase of a relay offline task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayTaskPhase {
    Pending,
    Running,
    Complete,
    Error,
}

impl std::fmt::Display for RelayTaskPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayTaskPhase::Pending => write!(f, "pending"),
            RelayTaskPhase::Running => write!(f, "running"),
            RelayTaskPhase::Complete => write!(f, "complete"),
            RelayTaskPhase::Error => write!(f, "error"),
        }
    }
}

/// An offline task as reported by the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayTask {
    pub id: String,
    pub name: String,
    /// Source the task was created from (usually a magnet link)
    pub source: String,
    pub phase: RelayTaskPhase,
    /// Root file or folder produced by the task
    pub file_id: Option<String>,
    pub progress: f64,
    pub message: Option<String>,
}

/// A file stored on the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayFile {
    pub id: String,
    /// Path relative to the task root
    pub path: String,
    pub size: u64,
}

/// Storage quota of one account, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageQuota {
    pub limit: u64,
    pub usage: u64,
}

impl StorageQuota {
    pub fn free(&self) -> u64 {
        self.limit.saturating_sub(self.usage)
    }
}

/// A file resolved to a direct URL, ready for segment transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferItem {
    pub url: String,
    pub path: String,
    pub size: u64,
}

/// Filter applied to relay tasks while walking the task list
pub type TaskPredicate = dyn for<'a> Fn(&'a RelayTask) -> bool + Send + Sync;

/// One authenticated relay session
#[async_trait]
pub trait RelayService: Send + Sync {
    /// Create an offline task. Quota rejections are reported as typed errors.
    async fn create_task(&self, name: &str, source: &str) -> Result<RelayTask, RelayError>;

    /// First existing task matching `predicate`, walking all pages
    async fn find_task(&self, predicate: &TaskPredicate) -> Result<Option<RelayTask>>;

    async fn get_task(&self, id: &str) -> Result<Option<RelayTask>>;

    async fn list_tasks(&self) -> Result<Vec<RelayTask>>;

    async fn delete_tasks(&self, ids: &[String], delete_files: bool) -> Result<()>;

    /// Every leaf file below `root_id`
    async fn file_tree(&self, root_id: &str) -> Result<Vec<RelayFile>>;

    async fn download_url(&self, file_id: &str) -> Result<String>;

    async fn delete_files(&self, ids: &[String]) -> Result<()>;

    async fn empty_trash(&self) -> Result<()>;

    async fn quota(&self) -> Result<StorageQuota>;
}

/// Opens relay sessions from stored credentials
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(&self, account: &AccountRecord) -> Result<Arc<dyn RelayService>>;
}

/// Whether an existing task was created from the requested source.
///
/// Relays tend to normalise magnets (dropping trackers, changing case), so
/// besides exact and substring matches the BitTorrent info hash is compared.
pub fn source_matches(task_source: &str, requested: &str) -> bool {
    if task_source.is_empty() || requested.is_empty() {
        return false;
    }
    if task_source == requested
        || task_source.contains(requested)
        || requested.contains(task_source)
    {
        return true;
    }
    match (info_hash(task_source), info_hash(requested)) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        _ => false,
    }
}

fn info_hash(source: &str) -> Option<&str> {
    let start = source.find("urn:btih:")? + "urn:btih:".len();
    let rest = &source[start..];
    let end = rest.find('&').unwrap_or(rest.len());
    let hash = &rest[..end];
    (!hash.is_empty()).then_some(hash)
}
