//! Download history repository
//!
//! One record per episode with a current download attempt. The orchestrator is
//! the only writer; everything else should re-read before acting.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of one episode of a tracked series
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EpisodeKey {
    pub series_id: String,
    pub season: u32,
    pub episode: u32,
}

impl EpisodeKey {
    pub fn new(series_id: impl Into<String>, season: u32, episode: u32) -> Self {
        Self {
            series_id: series_id.into(),
            season,
            episode,
        }
    }

    /// `S01E03` style tag
    pub fn tag(&self) -> String {
        format!("S{:02}E{:02}", self.season, self.episode)
    }
}

impl std::fmt::Display for EpisodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.series_id, self.tag())
    }
}

/// Lifecycle state of a download attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryState {
    /// Attempt registered, nothing accepted by a backend yet
    TryDownload,
    /// A backend accepted the job
    Downloading,
    Downloaded,
    /// Failed; retried on the next attempt unless the error is non-retryable
    DownloadErr,
}

impl HistoryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, HistoryState::Downloaded | HistoryState::DownloadErr)
    }
}

impl std::fmt::Display for HistoryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HistoryState::TryDownload => write!(f, "try_download"),
            HistoryState::Downloading => write!(f, "downloading"),
            HistoryState::Downloaded => write!(f, "downloaded"),
            HistoryState::DownloadErr => write!(f, "download_err"),
        }
    }
}

impl std::str::FromStr for HistoryState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "try_download" => Ok(HistoryState::TryDownload),
            "downloading" => Ok(HistoryState::Downloading),
            "downloaded" => Ok(HistoryState::Downloaded),
            "download_err" => Ok(HistoryState::DownloadErr),
            _ => Err(anyhow::anyhow!("Unknown download history state: {}", s)),
        }
    }
}

/// Which pipeline carries an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadBackend {
    /// Relay account pool followed by the segment-transfer client
    Relay,
    /// Local BitTorrent client
    Local,
}

impl std::fmt::Display for DownloadBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DownloadBackend::Relay => write!(f, "relay"),
            DownloadBackend::Local => write!(f, "local"),
        }
    }
}

/// Backend handles needed to resume waiting on an attempt after a restart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum BackendContext {
    Relay {
        /// Segment-transfer job ids, one per transferred file
        job_ids: Vec<String>,
        /// Episode directory the jobs write into
        dir: String,
        /// Relay download URLs, used to reclaim relay storage afterwards
        #[serde(default)]
        sources: Vec<String>,
    },
    Local {
        hash: String,
        submitted_at: DateTime<Utc>,
    },
}

impl BackendContext {
    pub fn backend(&self) -> DownloadBackend {
        match self {
            BackendContext::Relay { .. } => DownloadBackend::Relay,
            BackendContext::Local { .. } => DownloadBackend::Local,
        }
    }

    /// Serialize to the opaque column value kept by SQL stores
    pub fn to_blob(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_blob(blob: &str) -> Result<Self> {
        Ok(serde_json::from_str(blob)?)
    }
}

/// Download history record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadHistoryRecord {
    pub id: Uuid,
    pub episode: EpisodeKey,
    pub resource_hash: String,
    pub state: HistoryState,
    pub context: Option<BackendContext>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DownloadHistoryRecord {
    /// Fresh record for a first attempt
    pub fn new(episode: EpisodeKey, resource_hash: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            episode,
            resource_hash: resource_hash.into(),
            state: HistoryState::TryDownload,
            context: None,
            error_message: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn backend(&self) -> Option<DownloadBackend> {
        self.context.as_ref().map(BackendContext::backend)
    }

    /// Restart the attempt, possibly with a different resource
    pub fn mark_try_download(&mut self, resource_hash: &str) {
        self.resource_hash = resource_hash.to_string();
        self.state = HistoryState::TryDownload;
        self.context = None;
        self.error_message = None;
        self.updated_at = Utc::now();
    }

    pub fn mark_downloading(&mut self, context: BackendContext) {
        self.state = HistoryState::Downloading;
        self.context = Some(context);
        self.error_message = None;
        self.updated_at = Utc::now();
    }

    pub fn mark_downloaded(&mut self) {
        self.state = HistoryState::Downloaded;
        self.error_message = None;
        self.updated_at = Utc::now();
    }

    /// Record a failed attempt; the context is kept for diagnostics
    pub fn mark_error(&mut self, message: impl Into<String>) {
        self.state = HistoryState::DownloadErr;
        self.error_message = Some(message.into());
        self.retry_count += 1;
        self.updated_at = Utc::now();
    }

    /// Extend the error of an attempt already counted by [mark_error](Self::mark_error)
    pub fn amend_error(&mut self, message: impl Into<String>) {
        self.state = HistoryState::DownloadErr;
        self.error_message = Some(message.into());
        self.updated_at = Utc::now();
    }

    /// Keep a live attempt from looking abandoned
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Storage for download history, keyed by episode
#[async_trait]
pub trait DownloadHistoryRepository: Send + Sync {
    async fn get(&self, episode: &EpisodeKey) -> Result<Option<DownloadHistoryRecord>>;

    /// Insert a new record. Fails if the episode already has one.
    async fn create(&self, record: &DownloadHistoryRecord) -> Result<()>;

    async fn update(&self, record: &DownloadHistoryRecord) -> Result<()>;

    async fn delete(&self, episode: &EpisodeKey) -> Result<bool>;

    async fn list(&self) -> Result<Vec<DownloadHistoryRecord>>;
}

/// Process-local history store
#[derive(Debug, Default)]
pub struct InMemoryHistoryRepository {
    records: RwLock<HashMap<EpisodeKey, DownloadHistoryRecord>>,
}

impl InMemoryHistoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DownloadHistoryRepository for InMemoryHistoryRepository {
    async fn get(&self, episode: &EpisodeKey) -> Result<Option<DownloadHistoryRecord>> {
        Ok(self.records.read().get(episode).cloned())
    }

    async fn create(&self, record: &DownloadHistoryRecord) -> Result<()> {
        let mut records = self.records.write();
        if records.contains_key(&record.episode) {
            anyhow::bail!("Download history already exists for {}", record.episode);
        }
        records.insert(record.episode.clone(), record.clone());
        Ok(())
    }

    async fn update(&self, record: &DownloadHistoryRecord) -> Result<()> {
        let mut records = self.records.write();
        match records.get_mut(&record.episode) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(anyhow::anyhow!(
                "Download history not found for {}",
                record.episode
            )),
        }
    }

    async fn delete(&self, episode: &EpisodeKey) -> Result<bool> {
        Ok(self.records.write().remove(episode).is_some())
    }

    async fn list(&self) -> Result<Vec<DownloadHistoryRecord>> {
        Ok(self.records.read().values().cloned().collect())
    }
}
