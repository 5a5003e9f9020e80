//! Download orchestrator
//!
//! Drives one episode download from "we picked a resource" to "the file is on
//! disk":
//! 1. Consults the persisted history to decide between no-op, resume, retry or
//!    a fresh attempt
//! 2. Tries the relay pipeline (account pool, then segment transfer)
//! 3. Falls back to the local BitTorrent client when the relay cannot take it
//! 4. Waits for completion in a background task and notifies observers
//!
//! The caller must not run two attempts for the same episode concurrently.
//! Background waits for different episodes run independently.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, anyhow};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::db::{
    BackendContext, DownloadBackend, DownloadHistoryRecord, DownloadHistoryRepository, EpisodeKey,
    HistoryState,
};
use crate::error::{DOWNLOAD_TIMEOUT_MESSAGE, DownloadError, is_non_retryable};
use crate::services::account_pool::AccountPool;
use crate::services::local_client::{LocalClient, LocalJobState, is_stalled, is_video_path};
use crate::services::resource_selector::Resource;
use crate::services::segment::{
    SegmentOutcome, SegmentTransferClient, find_jobs_in_dir, wait_for_jobs,
};

type Result<T> = std::result::Result<T, DownloadError>;

/// Configuration for the download orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub downloads_path: PathBuf,
    pub try_download_grace: Duration,
    pub local_stall_timeout: Duration,
    pub local_stall_min_progress: f64,
    pub local_poll_interval: Duration,
    pub local_category: String,
    pub segment_poll_interval: Duration,
    pub relay_wait_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            downloads_path: PathBuf::from("./data/downloads"),
            try_download_grace: Duration::from_secs(5 * 60),
            local_stall_timeout: Duration::from_secs(60 * 60),
            local_stall_min_progress: 0.5,
            local_poll_interval: Duration::from_secs(10),
            local_category: "librarian".to_string(),
            segment_poll_interval: Duration::from_secs(5),
            relay_wait_timeout: Duration::from_secs(60 * 60),
        }
    }
}

/// The series an episode belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Series {
    pub id: String,
    pub title: String,
}

impl Series {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
        }
    }
}

/// Receives the outcome of background downloads.
///
/// Called from background tasks, possibly from several at once.
pub trait CompletionObserver: Send + Sync {
    fn on_complete(&self, series: &Series, season: u32, episode: u32);

    fn on_error(&self, error: &DownloadError, series: &Series, season: u32, episode: u32);
}

/// Relay account pool plus the segment-transfer client that pulls relay files
#[derive(Clone)]
pub struct RelayPipeline {
    pub pool: Arc<AccountPool>,
    pub segment: Arc<dyn SegmentTransferClient>,
}

/// Builder for [DownloadOrchestrator]
pub struct DownloadOrchestratorBuilder {
    history: Arc<dyn DownloadHistoryRepository>,
    config: OrchestratorConfig,
    relay: Option<RelayPipeline>,
    local: Option<Arc<dyn LocalClient>>,
}

impl DownloadOrchestratorBuilder {
    pub fn relay(
        mut self,
        pool: Arc<AccountPool>,
        segment: Arc<dyn SegmentTransferClient>,
    ) -> Self {
        self.relay = Some(RelayPipeline { pool, segment });
        self
    }

    pub fn local(mut self, client: Arc<dyn LocalClient>) -> Self {
        self.local = Some(client);
        self
    }

    pub fn build(self) -> DownloadOrchestrator {
        DownloadOrchestrator {
            inner: Arc::new(Inner {
                history: self.history,
                config: self.config,
                relay: self.relay,
                local: self.local,
                observers: RwLock::new(Arc::new(Vec::new())),
                watches: Mutex::new(HashMap::new()),
                next_watch: AtomicU64::new(1),
            }),
        }
    }
}

/// Episode download orchestrator
#[derive(Clone)]
pub struct DownloadOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    history: Arc<dyn DownloadHistoryRepository>,
    config: OrchestratorConfig,
    relay: Option<RelayPipeline>,
    local: Option<Arc<dyn LocalClient>>,
    /// Replaced wholesale on registration so fan-out iterates a frozen list
    observers: RwLock<Arc<Vec<Arc<dyn CompletionObserver>>>>,
    /// Episodes with a live background wait in this process
    watches: Mutex<HashMap<EpisodeKey, u64>>,
    next_watch: AtomicU64,
}

impl DownloadOrchestrator {
    pub fn builder(
        history: Arc<dyn DownloadHistoryRepository>,
        config: OrchestratorConfig,
    ) -> DownloadOrchestratorBuilder {
        DownloadOrchestratorBuilder {
            history,
            config,
            relay: None,
            local: None,
        }
    }

    pub fn add_completion_observer(&self, observer: Arc<dyn CompletionObserver>) {
        let mut observers = self.inner.observers.write();
        let mut next = Vec::with_capacity(observers.len() + 1);
        next.extend(observers.iter().cloned());
        next.push(observer);
        *observers = Arc::new(next);
    }

    /// Current history record for an episode; re-read before acting on it
    pub async fn history(
        &self,
        series_id: &str,
        season: u32,
        episode: u32,
    ) -> Result<Option<DownloadHistoryRecord>> {
        self.inner
            .history
            .get(&EpisodeKey::new(series_id, season, episode))
            .await
            .map_err(DownloadError::History)
    }

    /// Operator action: forget an episode's history so the next call starts over
    pub async fn reset(&self, series_id: &str, season: u32, episode: u32) -> Result<bool> {
        let key = EpisodeKey::new(series_id, season, episode);
        let removed = self
            .inner
            .history
            .delete(&key)
            .await
            .map_err(DownloadError::History)?;
        if removed {
            info!(episode = %key, "Download history reset");
        }
        Ok(removed)
    }

    /// Download `resource` for one episode.
    ///
    /// Returns once a backend accepted the job (or nothing needed doing);
    /// completion is reported to observers.
    pub async fn download_episode(
        &self,
        series: &Series,
        season: u32,
        episode: u32,
        resource: &Resource,
    ) -> Result<()> {
        let key = EpisodeKey::new(&series.id, season, episode);
        let existing = self
            .inner
            .history
            .get(&key)
            .await
            .map_err(DownloadError::History)?;

        let record = match existing {
            None => {
                let record = DownloadHistoryRecord::new(key.clone(), &resource.hash);
                self.inner
                    .history
                    .create(&record)
                    .await
                    .map_err(DownloadError::History)?;
                debug!(episode = %key, resource = %resource.hash, "Registered download attempt");
                record
            }
            Some(record) => match record.state {
                HistoryState::Downloaded => {
                    debug!(episode = %key, "Episode already downloaded");
                    return Ok(());
                }
                HistoryState::TryDownload => {
                    if !self.inner.is_stale(&record) {
                        debug!(episode = %key, "Download attempt already in progress");
                        return Ok(());
                    }
                    info!(
                        episode = %key,
                        since = %record.updated_at,
                        "Restarting abandoned download attempt"
                    );
                    self.inner.restart(record, resource).await?
                }
                HistoryState::Downloading => {
                    return self.resume(series, record, resource).await;
                }
                HistoryState::DownloadErr => {
                    let message = record.error_message.as_deref().unwrap_or_default();
                    if is_non_retryable(message) {
                        debug!(
                            episode = %key,
                            error = %message,
                            "Previous failure is not retryable"
                        );
                        return Ok(());
                    }
                    info!(
                        episode = %key,
                        retry_count = record.retry_count,
                        error = %message,
                        "Retrying failed download"
                    );
                    self.inner.restart(record, resource).await?
                }
            },
        };

        self.start_attempt(series, record, resource).await
    }

    async fn start_attempt(
        &self,
        series: &Series,
        mut record: DownloadHistoryRecord,
        resource: &Resource,
    ) -> Result<()> {
        let mut relay_failure = None;
        if let Some(relay) = &self.inner.relay {
            match self.start_relay(relay, series, &mut record, resource).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() => {
                    if self.inner.local.is_none() {
                        debug!(
                            episode = %record.episode,
                            "No relay account available, will retry later"
                        );
                        return Err(e);
                    }
                    info!(
                        episode = %record.episode,
                        "No relay account available, falling back to local client"
                    );
                }
                Err(e) => {
                    warn!(episode = %record.episode, error = %e, "Relay download failed");
                    record.mark_error(e.to_string());
                    self.inner.save(&record).await?;
                    if self.inner.local.is_none() {
                        self.inner.notify_error(&e, series, &record.episode);
                        return Err(e);
                    }
                    info!(episode = %record.episode, "Falling back to local client");
                    relay_failure = Some(e);
                }
            }
        }

        let Some(local) = &self.inner.local else {
            return Err(DownloadError::NoBackend);
        };

        match self.start_local(local, series, &mut record, resource).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(episode = %record.episode, error = %e, "Local client download failed");
                // Attempt already counted by the relay failure, whose marker must survive
                let e = match relay_failure {
                    Some(relay_err) => {
                        let combined = DownloadError::Backend(anyhow!(
                            "{}; local fallback failed: {}",
                            relay_err,
                            e
                        ));
                        record.amend_error(combined.to_string());
                        combined
                    }
                    None => {
                        record.mark_error(e.to_string());
                        e
                    }
                };
                self.inner.save(&record).await?;
                self.inner.notify_error(&e, series, &record.episode);
                Err(e)
            }
        }
    }

    async fn start_relay(
        &self,
        relay: &RelayPipeline,
        series: &Series,
        record: &mut DownloadHistoryRecord,
        resource: &Resource,
    ) -> Result<()> {
        let key = record.episode.clone();
        let name = format!("{} {}", series.title, key.tag());

        let source = resource.source_reference();
        let submit = relay
            .pool
            .submit_and_wait(&name, &source, self.inner.config.relay_wait_timeout);
        tokio::pin!(submit);

        // The relay wait can outlast the TryDownload grace period
        let every = (self.inner.config.try_download_grace / 2).max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + every, every);
        let items = loop {
            tokio::select! {
                result = &mut submit => break result?,
                _ = heartbeat.tick() => {
                    record.touch();
                    if let Err(e) = self.inner.save(record).await {
                        warn!(episode = %key, error = %e, "Failed to refresh download attempt");
                    }
                }
            }
        };
        if items.is_empty() {
            return Err(DownloadError::Backend(anyhow!(
                "relay task for {} produced no files",
                name
            )));
        }

        let dir = self.inner.episode_dir(series, &key);
        let mut job_ids = Vec::with_capacity(items.len());
        for item in &items {
            match relay.segment.add_uri(&item.url, &dir, &item.path).await {
                Ok(id) => job_ids.push(id),
                Err(e) => {
                    for id in &job_ids {
                        if let Err(e) = relay.segment.remove(id).await {
                            debug!(
                                job_id = %id,
                                error = %e,
                                "Failed to remove partial segment job"
                            );
                        }
                    }
                    for item in &items {
                        if let Err(e) = relay.pool.reclaim_storage(&item.url).await {
                            debug!(url = %item.url, error = %e, "Failed to reclaim relay file");
                        }
                    }
                    return Err(DownloadError::Backend(
                        e.context("Failed to queue segment transfer"),
                    ));
                }
            }
        }

        record.mark_downloading(BackendContext::Relay {
            job_ids,
            dir,
            sources: items.into_iter().map(|i| i.url).collect(),
        });
        self.inner.save(record).await?;

        info!(
            series = %series.title,
            season = key.season,
            episode = key.episode,
            backend = "relay",
            "Download started"
        );
        self.spawn_watch(series.clone(), record.clone(), true);
        Ok(())
    }

    async fn start_local(
        &self,
        local: &Arc<dyn LocalClient>,
        series: &Series,
        record: &mut DownloadHistoryRecord,
        resource: &Resource,
    ) -> Result<()> {
        let key = record.episode.clone();
        let dir = self.inner.episode_dir(series, &key);

        let hash = local
            .add_torrent(&resource.payload, &dir, &self.inner.config.local_category)
            .await
            .map_err(|e| {
                DownloadError::Backend(e.context("Failed to add torrent to local client"))
            })?;

        if let Err(e) = prepare_local_files(local.as_ref(), &hash, &key).await {
            warn!(
                episode = %key,
                hash = %hash,
                error = %e,
                "Could not prepare local torrent files"
            );
        }

        record.mark_downloading(BackendContext::Local {
            hash,
            submitted_at: Utc::now(),
        });
        self.inner.save(record).await?;

        info!(
            series = %series.title,
            season = key.season,
            episode = key.episode,
            backend = "local",
            "Download started"
        );
        self.spawn_watch(series.clone(), record.clone(), true);
        Ok(())
    }

    /// Reattach to an attempt persisted as `Downloading`
    async fn resume(
        &self,
        series: &Series,
        mut record: DownloadHistoryRecord,
        resource: &Resource,
    ) -> Result<()> {
        if self.inner.is_watching(&record.episode) {
            debug!(episode = %record.episode, "Download already being watched");
            return Ok(());
        }

        let found = match record.context.clone() {
            Some(BackendContext::Relay { job_ids, dir, sources }) => match &self.inner.relay {
                Some(relay) => {
                    let live = reattach_segment_jobs(relay.segment.as_ref(), &job_ids, &dir).await?;
                    if !live.is_empty() && live != job_ids {
                        info!(
                            episode = %record.episode,
                            jobs = live.len(),
                            "Rediscovered segment jobs"
                        );
                        record.context = Some(BackendContext::Relay {
                            job_ids: live.clone(),
                            dir,
                            sources,
                        });
                        self.inner.save(&record).await?;
                    }
                    !live.is_empty()
                }
                None => false,
            },
            Some(BackendContext::Local { hash, .. }) => match &self.inner.local {
                Some(local) => local
                    .get(&hash)
                    .await
                    .map_err(DownloadError::Backend)?
                    .is_some(),
                None => false,
            },
            None => false,
        };

        if found {
            info!(episode = %record.episode, backend = ?record.backend(), "Resuming download wait");
            self.spawn_watch(series.clone(), record, false);
            return Ok(());
        }

        warn!(episode = %record.episode, "In-flight download is gone, starting over");
        let record = self.inner.restart(record, resource).await?;
        self.start_attempt(series, record, resource).await
    }

    /// Wait for the attempt in `record` in the background.
    ///
    /// A fresh attempt (`takeover`) replaces any watcher still finishing a
    /// previous attempt for the episode; a resume never does.
    fn spawn_watch(&self, series: Series, record: DownloadHistoryRecord, takeover: bool) {
        let Some(token) = self.inner.begin_watch(&record.episode, takeover) else {
            debug!(episode = %record.episode, "Download already being watched");
            return;
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let key = record.episode.clone();
            let outcome = match record.backend() {
                Some(DownloadBackend::Relay) => inner.watch_relay(record).await,
                Some(DownloadBackend::Local) => inner.watch_local(record).await,
                None => None,
            };
            inner.end_watch(&key, token);

            match outcome {
                Some(Ok(())) => inner.notify_complete(&series, &key),
                Some(Err(e)) => inner.notify_error(&e, &series, &key),
                None => warn!(episode = %key, "Download watch ended without an outcome"),
            }
        });
    }
}

impl Inner {
    fn is_stale(&self, record: &DownloadHistoryRecord) -> bool {
        let age = Utc::now().signed_duration_since(record.updated_at);
        age.to_std().map(|age| age > self.config.try_download_grace).unwrap_or(false)
    }

    fn episode_dir(&self, series: &Series, key: &EpisodeKey) -> String {
        self.config
            .downloads_path
            .join(sanitize_filename::sanitize(&series.title))
            .join(format!("Season {:02}", key.season))
            .join(key.tag())
            .to_string_lossy()
            .into_owned()
    }

    async fn restart(
        &self,
        mut record: DownloadHistoryRecord,
        resource: &Resource,
    ) -> Result<DownloadHistoryRecord> {
        record.mark_try_download(&resource.hash);
        self.save(&record).await?;
        Ok(record)
    }

    async fn save(&self, record: &DownloadHistoryRecord) -> Result<()> {
        self.history
            .update(record)
            .await
            .map_err(DownloadError::History)
    }

    fn is_watching(&self, key: &EpisodeKey) -> bool {
        self.watches.lock().contains_key(key)
    }

    fn begin_watch(&self, key: &EpisodeKey, takeover: bool) -> Option<u64> {
        let mut watches = self.watches.lock();
        if watches.contains_key(key) {
            if !takeover {
                return None;
            }
            debug!(episode = %key, "New attempt takes over the download watch");
        }
        let token = self.next_watch.fetch_add(1, Ordering::Relaxed);
        watches.insert(key.clone(), token);
        Some(token)
    }

    fn end_watch(&self, key: &EpisodeKey, token: u64) {
        let mut watches = self.watches.lock();
        if watches.get(key) == Some(&token) {
            watches.remove(key);
        }
    }

    async fn watch_relay(&self, mut record: DownloadHistoryRecord) -> Option<Result<()>> {
        let Some(BackendContext::Relay { job_ids, sources, .. }) = record.context.clone() else {
            return None;
        };
        let Some(relay) = &self.relay else {
            warn!(
                episode = %record.episode,
                "Relay pipeline not configured, cannot watch download"
            );
            return None;
        };

        let outcome = wait_for_jobs(
            relay.segment.as_ref(),
            &job_ids,
            self.config.segment_poll_interval,
        )
        .await;
        let err = match outcome {
            Ok(SegmentOutcome::Complete) => {
                for id in &job_ids {
                    if let Err(e) = relay.segment.remove_result(id).await {
                        debug!(job_id = %id, error = %e, "Failed to drop segment job result");
                    }
                }

                record.mark_downloaded();
                if let Err(e) = self.save(&record).await {
                    error!(
                        episode = %record.episode,
                        error = %e,
                        "Failed to persist completed download"
                    );
                }

                for url in &sources {
                    if let Err(e) = relay.pool.reclaim_storage(url).await {
                        warn!(
                            episode = %record.episode,
                            url = %url,
                            error = %e,
                            "Failed to reclaim relay storage"
                        );
                    }
                }

                info!(episode = %record.episode, backend = "relay", "Download complete");
                return Some(Ok(()));
            }
            Ok(SegmentOutcome::Failed { job_id, message }) => {
                DownloadError::Backend(anyhow!("segment transfer {} failed: {}", job_id, message))
            }
            Err(e) => DownloadError::Backend(e.context("Failed to poll segment transfer")),
        };

        Some(Err(self.record_failure(&mut record, err).await))
    }

    async fn watch_local(&self, mut record: DownloadHistoryRecord) -> Option<Result<()>> {
        let Some(BackendContext::Local { hash, submitted_at }) = record.context.clone() else {
            return None;
        };
        let Some(local) = self.local.clone() else {
            warn!(episode = %record.episode, "Local client not configured, cannot watch download");
            return None;
        };

        let elapsed = Utc::now()
            .signed_duration_since(submitted_at)
            .to_std()
            .unwrap_or_default();
        let stall_deadline =
            Instant::now() + self.config.local_stall_timeout.saturating_sub(elapsed);

        let err = loop {
            let job = match local.get(&hash).await {
                Ok(Some(job)) => job,
                Ok(None) => break DownloadError::Backend(anyhow!("local job {} disappeared", hash)),
                Err(e) => {
                    warn!(
                        episode = %record.episode,
                        hash = %hash,
                        error = %e,
                        "Failed to poll local client"
                    );
                    tokio::time::sleep(self.config.local_poll_interval).await;
                    continue;
                }
            };

            match job.state {
                LocalJobState::Completed => {
                    record.mark_downloaded();
                    if let Err(e) = self.save(&record).await {
                        error!(
                            episode = %record.episode,
                            error = %e,
                            "Failed to persist completed download"
                        );
                    }
                    info!(episode = %record.episode, backend = "local", "Download complete");
                    return Some(Ok(()));
                }
                LocalJobState::Error => {
                    break DownloadError::Backend(anyhow!("local job {} errored", hash));
                }
                _ => {}
            }

            if Instant::now() >= stall_deadline
                && is_stalled(&job, self.config.local_stall_min_progress)
            {
                warn!(
                    episode = %record.episode,
                    hash = %hash,
                    progress = job.progress,
                    "Local download stalled, removing it"
                );
                if let Err(e) = local.delete(&hash, true).await {
                    warn!(hash = %hash, error = %e, "Failed to delete stalled local job");
                }
                break DownloadError::Backend(anyhow!(DOWNLOAD_TIMEOUT_MESSAGE));
            }

            tokio::time::sleep(self.config.local_poll_interval).await;
        };

        Some(Err(self.record_failure(&mut record, err).await))
    }

    async fn record_failure(
        &self,
        record: &mut DownloadHistoryRecord,
        err: DownloadError,
    ) -> DownloadError {
        warn!(episode = %record.episode, error = %err, "Download failed");
        record.mark_error(err.to_string());
        if let Err(e) = self.save(record).await {
            error!(episode = %record.episode, error = %e, "Failed to persist download failure");
        }
        err
    }

    fn notify_complete(&self, series: &Series, key: &EpisodeKey) {
        let observers = self.observers.read().clone();
        for observer in observers.iter() {
            observer.on_complete(series, key.season, key.episode);
        }
    }

    fn notify_error(&self, err: &DownloadError, series: &Series, key: &EpisodeKey) {
        if err.is_transient() {
            return;
        }
        let observers = self.observers.read().clone();
        for observer in observers.iter() {
            observer.on_error(err, series, key.season, key.episode);
        }
    }
}

/// Ids of the segment jobs still carrying an attempt, rediscovering them by
/// directory when the stored ids are unknown to the client
async fn reattach_segment_jobs(
    segment: &dyn SegmentTransferClient,
    job_ids: &[String],
    dir: &str,
) -> Result<Vec<String>> {
    let mut known = Vec::with_capacity(job_ids.len());
    for id in job_ids {
        if segment
            .status(id)
            .await
            .map_err(DownloadError::Backend)?
            .is_some()
        {
            known.push(id.clone());
        }
    }
    if !known.is_empty() && known.len() == job_ids.len() {
        return Ok(known);
    }

    let found = find_jobs_in_dir(segment, dir)
        .await
        .context("Failed to list segment jobs")
        .map_err(DownloadError::Backend)?;
    Ok(found.into_iter().map(|j| j.id).collect())
}

/// Skip non-video files and give a lone video the episode tag as its name
async fn prepare_local_files(
    local: &dyn LocalClient,
    hash: &str,
    key: &EpisodeKey,
) -> anyhow::Result<()> {
    let files = local.files(hash).await?;
    let (videos, others): (Vec<_>, Vec<_>) =
        files.into_iter().partition(|f| is_video_path(&f.path));

    if !others.is_empty() {
        let indices: Vec<usize> = others.iter().map(|f| f.index).collect();
        local.set_file_priority(hash, &indices, 0).await?;
    }

    if let [video] = videos.as_slice() {
        let old = Path::new(&video.path);
        let ext = old.extension().and_then(|e| e.to_str()).unwrap_or("mkv");
        let new = old.with_file_name(format!("{}.{}", key.tag(), ext));
        let new = new.to_string_lossy();
        if new != video.path {
            local.rename_file(hash, &video.path, &new).await?;
        }
    }

    Ok(())
}
