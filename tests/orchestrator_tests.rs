//! End-to-end orchestrator tests against stub collaborators
//!
//! Run with: cargo test --test orchestrator_tests

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use assert_matches::assert_matches;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

use librarian_acquire::db::{
    AccountHealth, AccountRecord, BackendContext, DownloadHistoryRecord, DownloadHistoryRepository,
    EpisodeKey, HistoryState, InMemoryAccountRepository, InMemoryHistoryRepository,
};
use librarian_acquire::error::{DownloadError, PoolError, RelayError, is_non_retryable};
use librarian_acquire::services::relay::{
    RelayConnector, RelayFile, RelayService, RelayTask, RelayTaskPhase, StorageQuota, TaskPredicate,
};
use librarian_acquire::services::{
    AccountPool, AccountPoolConfig, CompletionObserver, DownloadOrchestrator, LocalClient,
    LocalFile, LocalJob, LocalJobState, OrchestratorConfig, Resource, ResourceKind,
    ResourcePayload, SegmentJob,
    SegmentStatus, SegmentTransferClient, Series,
};

const EPISODE_DIR: &str = "/downloads/Frieren/Season 01/S01E03";

// ============================================================================
// Stubs
// ============================================================================

struct StubRelay {
    tasks: Mutex<Vec<RelayTask>>,
    deleted_files: Mutex<Vec<String>>,
    daily_limit: Mutex<bool>,
    /// New tasks finish immediately unless cleared
    finish_immediately: Mutex<bool>,
    created: AtomicUsize,
}

impl StubRelay {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            tasks: Mutex::new(Vec::new()),
            deleted_files: Mutex::new(Vec::new()),
            daily_limit: Mutex::new(false),
            finish_immediately: Mutex::new(true),
            created: AtomicUsize::new(0),
        })
    }

    fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    fn complete_all(&self) {
        for task in self.tasks.lock().iter_mut() {
            task.phase = RelayTaskPhase::Complete;
            task.progress = 1.0;
        }
    }
}

#[async_trait]
impl RelayService for StubRelay {
    async fn create_task(&self, name: &str, source: &str) -> Result<RelayTask, RelayError> {
        if *self.daily_limit.lock() {
            return Err(RelayError::DailyLimitExceeded("task_daily_create_limit".into()));
        }
        let id = format!("task-{}", self.created.fetch_add(1, Ordering::SeqCst) + 1);
        let phase = if *self.finish_immediately.lock() {
            RelayTaskPhase::Complete
        } else {
            RelayTaskPhase::Running
        };
        let task = RelayTask {
            id: id.clone(),
            name: name.to_string(),
            source: source.to_string(),
            phase,
            file_id: Some(format!("root-{}", id)),
            progress: 0.0,
            message: None,
        };
        let mut tasks = self.tasks.lock();
        tasks.push(task.clone());
        Ok(task)
    }

    async fn find_task(&self, predicate: &TaskPredicate) -> Result<Option<RelayTask>> {
        Ok(self.tasks.lock().iter().find(|t| predicate(t)).cloned())
    }

    async fn get_task(&self, id: &str) -> Result<Option<RelayTask>> {
        Ok(self.tasks.lock().iter().find(|t| t.id == id).cloned())
    }

    async fn list_tasks(&self) -> Result<Vec<RelayTask>> {
        Ok(self.tasks.lock().clone())
    }

    async fn delete_tasks(&self, ids: &[String], _delete_files: bool) -> Result<()> {
        self.tasks.lock().retain(|t| !ids.contains(&t.id));
        Ok(())
    }

    async fn file_tree(&self, root_id: &str) -> Result<Vec<RelayFile>> {
        Ok(vec![RelayFile {
            id: format!("{}/file", root_id),
            path: "Frieren - 03.mkv".to_string(),
            size: 700 * 1024 * 1024,
        }])
    }

    async fn download_url(&self, file_id: &str) -> Result<String> {
        Ok(format!("https://relay.example/{}", file_id))
    }

    async fn delete_files(&self, ids: &[String]) -> Result<()> {
        self.deleted_files.lock().extend(ids.iter().cloned());
        Ok(())
    }

    async fn empty_trash(&self) -> Result<()> {
        Ok(())
    }

    async fn quota(&self) -> Result<StorageQuota> {
        Ok(StorageQuota {
            limit: u64::MAX,
            usage: 0,
        })
    }
}

struct StubConnector(Arc<StubRelay>);

#[async_trait]
impl RelayConnector for StubConnector {
    async fn connect(&self, _account: &AccountRecord) -> Result<Arc<dyn RelayService>> {
        Ok(self.0.clone())
    }
}

struct StubSegment {
    jobs: Mutex<HashMap<String, SegmentJob>>,
    added: Mutex<Vec<(String, String, String)>>,
    removed_results: Mutex<Vec<String>>,
    next_id: AtomicUsize,
    /// Status given to newly added jobs
    initial: Mutex<(SegmentStatus, Option<String>)>,
}

impl StubSegment {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            jobs: Mutex::new(HashMap::new()),
            added: Mutex::new(Vec::new()),
            removed_results: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(1),
            initial: Mutex::new((SegmentStatus::Complete, None)),
        })
    }

    fn insert(&self, id: &str, dir: &str, status: SegmentStatus) {
        self.jobs.lock().insert(id.to_string(), segment_job(id, dir, "episode.mkv", status, None));
    }

    fn list(&self, wanted: &[SegmentStatus]) -> Vec<SegmentJob> {
        self.jobs
            .lock()
            .values()
            .filter(|j| wanted.contains(&j.status))
            .cloned()
            .collect()
    }
}

fn segment_job(
    id: &str,
    dir: &str,
    out: &str,
    status: SegmentStatus,
    error: Option<String>,
) -> SegmentJob {
    SegmentJob {
        id: id.to_string(),
        status,
        dir: dir.to_string(),
        files: vec![Path::new(dir).join(out).to_string_lossy().into_owned()],
        total_length: 1024,
        completed_length: 0,
        download_speed: 0,
        error_message: error,
    }
}

#[async_trait]
impl SegmentTransferClient for StubSegment {
    async fn add_uri(&self, uri: &str, dir: &str, out: &str) -> Result<String> {
        let id = format!("gid-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let (status, error) = self.initial.lock().clone();
        self.jobs
            .lock()
            .insert(id.clone(), segment_job(&id, dir, out, status, error));
        self.added
            .lock()
            .push((uri.to_string(), dir.to_string(), out.to_string()));
        Ok(id)
    }

    async fn status(&self, id: &str) -> Result<Option<SegmentJob>> {
        Ok(self.jobs.lock().get(id).cloned())
    }

    async fn list_active(&self) -> Result<Vec<SegmentJob>> {
        Ok(self.list(&[SegmentStatus::Active]))
    }

    async fn list_waiting(&self) -> Result<Vec<SegmentJob>> {
        Ok(self.list(&[SegmentStatus::Waiting, SegmentStatus::Paused]))
    }

    async fn list_stopped(&self) -> Result<Vec<SegmentJob>> {
        Ok(self.list(&[SegmentStatus::Complete, SegmentStatus::Error, SegmentStatus::Removed]))
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.jobs.lock().remove(id);
        Ok(())
    }

    async fn remove_result(&self, id: &str) -> Result<()> {
        self.removed_results.lock().push(id.to_string());
        Ok(())
    }
}

struct StubLocal {
    jobs: Mutex<HashMap<String, LocalJob>>,
    files: Vec<LocalFile>,
    added: Mutex<Vec<(String, String)>>,
    renamed: Mutex<Vec<(String, String)>>,
    priorities: Mutex<Vec<(Vec<usize>, u8)>>,
    deleted: Mutex<Vec<String>>,
    /// State, progress and speed of newly added jobs
    initial: Mutex<(LocalJobState, f64, u64)>,
    refuse_add: Mutex<bool>,
}

impl StubLocal {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            jobs: Mutex::new(HashMap::new()),
            files: vec![
                LocalFile {
                    index: 0,
                    path: "Frieren/[Sub] Frieren - 03 [1080p].mkv".to_string(),
                    size: 700 * 1024 * 1024,
                },
                LocalFile {
                    index: 1,
                    path: "Frieren/readme.txt".to_string(),
                    size: 12,
                },
            ],
            added: Mutex::new(Vec::new()),
            renamed: Mutex::new(Vec::new()),
            priorities: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            initial: Mutex::new((LocalJobState::Downloading, 0.1, 4096)),
            refuse_add: Mutex::new(false),
        })
    }
}

#[async_trait]
impl LocalClient for StubLocal {
    async fn add_torrent(
        &self,
        _payload: &ResourcePayload,
        save_path: &str,
        category: &str,
    ) -> Result<String> {
        if *self.refuse_add.lock() {
            anyhow::bail!("torrent rejected by client");
        }
        let hash = "c0ffee".to_string();
        let (state, progress, download_speed) = *self.initial.lock();
        self.jobs.lock().insert(
            hash.clone(),
            LocalJob {
                hash: hash.clone(),
                name: "Frieren".to_string(),
                state,
                progress,
                download_speed,
                save_path: save_path.to_string(),
            },
        );
        self.added
            .lock()
            .push((save_path.to_string(), category.to_string()));
        Ok(hash)
    }

    async fn get(&self, hash: &str) -> Result<Option<LocalJob>> {
        Ok(self.jobs.lock().get(hash).cloned())
    }

    async fn files(&self, _hash: &str) -> Result<Vec<LocalFile>> {
        Ok(self.files.clone())
    }

    async fn rename_file(&self, _hash: &str, old_path: &str, new_path: &str) -> Result<()> {
        self.renamed
            .lock()
            .push((old_path.to_string(), new_path.to_string()));
        Ok(())
    }

    async fn set_file_priority(&self, _hash: &str, indices: &[usize], priority: u8) -> Result<()> {
        self.priorities.lock().push((indices.to_vec(), priority));
        Ok(())
    }

    async fn delete(&self, hash: &str, _delete_files: bool) -> Result<()> {
        self.jobs.lock().remove(hash);
        self.deleted.lock().push(hash.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Complete(u32, u32),
    Error(String),
}

struct ChannelObserver(mpsc::UnboundedSender<Event>);

/// History store whose first failure write stalls after it lands
struct SlowFailureHistory {
    inner: InMemoryHistoryRepository,
    delay: Duration,
    stalled: AtomicUsize,
}

#[async_trait]
impl DownloadHistoryRepository for SlowFailureHistory {
    async fn get(&self, episode: &EpisodeKey) -> Result<Option<DownloadHistoryRecord>> {
        self.inner.get(episode).await
    }

    async fn create(&self, record: &DownloadHistoryRecord) -> Result<()> {
        self.inner.create(record).await
    }

    async fn update(&self, record: &DownloadHistoryRecord) -> Result<()> {
        self.inner.update(record).await?;
        if record.state == HistoryState::DownloadErr
            && self.stalled.fetch_add(1, Ordering::SeqCst) == 0
        {
            tokio::time::sleep(self.delay).await;
        }
        Ok(())
    }

    async fn delete(&self, episode: &EpisodeKey) -> Result<bool> {
        self.inner.delete(episode).await
    }

    async fn list(&self) -> Result<Vec<DownloadHistoryRecord>> {
        self.inner.list().await
    }
}

impl CompletionObserver for ChannelObserver {
    fn on_complete(&self, _series: &Series, season: u32, episode: u32) {
        let _ = self.0.send(Event::Complete(season, episode));
    }

    fn on_error(&self, error: &DownloadError, _series: &Series, _season: u32, _episode: u32) {
        let _ = self.0.send(Event::Error(error.to_string()));
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    orchestrator: DownloadOrchestrator,
    history: Arc<dyn DownloadHistoryRepository>,
    accounts: Arc<InMemoryAccountRepository>,
    pool: Arc<AccountPool>,
    relay: Arc<StubRelay>,
    segment: Arc<StubSegment>,
    local: Arc<StubLocal>,
    events: mpsc::UnboundedReceiver<Event>,
}

impl Harness {
    fn new(accounts: Vec<AccountRecord>, with_local: bool) -> Self {
        Self::build(accounts, with_local, Arc::new(InMemoryHistoryRepository::new()), |_| {})
    }

    fn build(
        accounts: Vec<AccountRecord>,
        with_local: bool,
        history: Arc<dyn DownloadHistoryRepository>,
        configure: impl FnOnce(&mut OrchestratorConfig),
    ) -> Self {
        let accounts = Arc::new(InMemoryAccountRepository::new(accounts));
        let relay = StubRelay::new();
        let segment = StubSegment::new();
        let local = StubLocal::new();

        let pool = Arc::new(AccountPool::new(
            accounts.clone(),
            Arc::new(StubConnector(relay.clone())),
            AccountPoolConfig {
                poll_interval: Duration::from_millis(10),
                min_free_bytes: 0,
            },
        ));

        let mut config = OrchestratorConfig {
            downloads_path: PathBuf::from("/downloads"),
            try_download_grace: Duration::from_secs(300),
            local_stall_timeout: Duration::from_secs(60),
            local_stall_min_progress: 0.5,
            local_poll_interval: Duration::from_secs(10),
            local_category: "anime".to_string(),
            segment_poll_interval: Duration::from_millis(10),
            relay_wait_timeout: Duration::from_secs(60),
        };
        configure(&mut config);

        let mut builder = DownloadOrchestrator::builder(history.clone(), config)
            .relay(pool.clone(), segment.clone());
        if with_local {
            builder = builder.local(local.clone());
        }
        let orchestrator = builder.build();

        let (tx, events) = mpsc::unbounded_channel();
        orchestrator.add_completion_observer(Arc::new(ChannelObserver(tx)));

        Self {
            orchestrator,
            history,
            accounts,
            pool,
            relay,
            segment,
            local,
            events,
        }
    }

    async fn download(&self) -> Result<(), DownloadError> {
        self.orchestrator
            .download_episode(&series(), 1, 3, &resource())
            .await
    }

    async fn record(&self) -> DownloadHistoryRecord {
        self.history.get(&key()).await.unwrap().unwrap()
    }

    async fn seed(&self, record: DownloadHistoryRecord) {
        self.history.create(&record).await.unwrap();
    }

    async fn next_event(&mut self) -> Event {
        self.next_event_within(Duration::from_secs(24 * 60 * 60)).await
    }

    async fn next_event_within(&mut self, limit: Duration) -> Event {
        tokio::time::timeout(limit, self.events.recv())
            .await
            .expect("no download outcome reported")
            .expect("observer channel closed")
    }
}

fn series() -> Series {
    Series::new("frieren", "Frieren")
}

fn key() -> EpisodeKey {
    EpisodeKey::new("frieren", 1, 3)
}

fn resource() -> Resource {
    Resource::from_title(
        "ABCDEF0123",
        "[Sub] Frieren - 03 [1080p][CHT]",
        ResourceKind::Regular,
        ResourcePayload::Magnet("magnet:?xt=urn:btih:ABCDEF0123".to_string()),
    )
}

fn record_in(state: HistoryState) -> DownloadHistoryRecord {
    let mut record = DownloadHistoryRecord::new(key(), "ABCDEF0123");
    record.state = state;
    record
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_relay_download_completes_and_reclaims_storage() {
    let mut h = Harness::new(vec![AccountRecord::new("alice", "pw")], true);

    h.download().await.unwrap();
    assert_eq!(h.next_event().await, Event::Complete(1, 3));

    let record = h.record().await;
    assert_eq!(record.state, HistoryState::Downloaded);
    assert_eq!(record.retry_count, 0);
    assert_matches!(
        record.context,
        Some(BackendContext::Relay { ref job_ids, ref dir, .. })
            if job_ids == &["gid-1".to_string()] && dir == EPISODE_DIR
    );

    let added = h.segment.added.lock().clone();
    assert_eq!(
        added,
        vec![(
            "https://relay.example/root-task-1/file".to_string(),
            EPISODE_DIR.to_string(),
            "Frieren - 03.mkv".to_string(),
        )]
    );
    assert_eq!(*h.segment.removed_results.lock(), vec!["gid-1".to_string()]);
    assert_eq!(*h.relay.deleted_files.lock(), vec!["root-task-1/file".to_string()]);
    assert_eq!(h.pool.tracked_files().await, 0);
    assert!(h.local.added.lock().is_empty());
}

#[tokio::test]
async fn test_downloaded_episode_is_not_resubmitted() {
    let h = Harness::new(vec![AccountRecord::new("alice", "pw")], true);
    h.seed(record_in(HistoryState::Downloaded)).await;

    h.download().await.unwrap();

    assert_eq!(h.relay.created(), 0);
    assert!(h.local.added.lock().is_empty());
    assert_eq!(h.record().await.state, HistoryState::Downloaded);
}

#[tokio::test]
async fn test_relay_wait_timeout_is_not_retried() {
    let h = Harness::new(vec![AccountRecord::new("alice", "pw")], true);
    let mut record = record_in(HistoryState::DownloadErr);
    let timeout = PoolError::WaitTimeout {
        task_id: "task-9".to_string(),
        timeout: Duration::from_secs(3600),
    };
    record.mark_error(DownloadError::from(timeout).to_string());
    h.seed(record).await;

    h.download().await.unwrap();

    assert_eq!(h.relay.created(), 0);
    assert!(h.local.added.lock().is_empty());
    let record = h.record().await;
    assert_eq!(record.state, HistoryState::DownloadErr);
    assert_eq!(record.retry_count, 1);
}

#[tokio::test]
async fn test_retryable_error_is_retried() {
    let mut h = Harness::new(vec![AccountRecord::new("alice", "pw")], true);
    let mut record = record_in(HistoryState::DownloadErr);
    record.mark_error("segment transfer gid-1 failed: connection reset");
    h.seed(record).await;

    h.download().await.unwrap();
    assert_eq!(h.next_event().await, Event::Complete(1, 3));

    assert_eq!(h.relay.created(), 1);
    let record = h.record().await;
    assert_eq!(record.state, HistoryState::Downloaded);
    assert_eq!(record.retry_count, 1);
    assert_eq!(record.error_message, None);
}

#[tokio::test]
async fn test_no_account_falls_back_to_local_client() {
    let h = Harness::new(Vec::new(), true);

    h.download().await.unwrap();

    let record = h.record().await;
    assert_eq!(record.state, HistoryState::Downloading);
    assert_eq!(record.retry_count, 0);
    assert_eq!(record.error_message, None);
    assert_matches!(
        record.context,
        Some(BackendContext::Local { ref hash, .. }) if hash == "c0ffee"
    );

    assert_eq!(
        *h.local.added.lock(),
        vec![(EPISODE_DIR.to_string(), "anime".to_string())]
    );
    assert_eq!(*h.local.priorities.lock(), vec![(vec![1], 0)]);
    assert_eq!(
        *h.local.renamed.lock(),
        vec![(
            "Frieren/[Sub] Frieren - 03 [1080p].mkv".to_string(),
            "Frieren/S01E03.mkv".to_string(),
        )]
    );
}

#[tokio::test]
async fn test_relay_rejection_is_recorded_before_falling_back() {
    let h = Harness::new(vec![AccountRecord::new("alice", "pw")], true);
    *h.relay.daily_limit.lock() = true;

    h.download().await.unwrap();

    let record = h.record().await;
    assert_eq!(record.state, HistoryState::Downloading);
    assert_eq!(record.retry_count, 1);
    assert_matches!(record.context, Some(BackendContext::Local { .. }));
    assert_eq!(h.local.added.lock().len(), 1);

    let alice = h.accounts.get("alice").unwrap();
    assert_eq!(alice.health, AccountHealth::RateLimited);
}

#[tokio::test]
async fn test_transient_failure_without_fallback_is_not_persisted() {
    let mut h = Harness::new(Vec::new(), false);

    let err = h.download().await.unwrap_err();
    assert_matches!(err, DownloadError::Pool(PoolError::NoAccountAvailable));

    let record = h.record().await;
    assert_eq!(record.state, HistoryState::TryDownload);
    assert_eq!(record.retry_count, 0);
    assert_eq!(record.error_message, None);
    assert!(h.events.try_recv().is_err());
}

#[tokio::test]
async fn test_recent_try_download_is_left_alone() {
    let h = Harness::new(vec![AccountRecord::new("alice", "pw")], true);
    h.seed(record_in(HistoryState::TryDownload)).await;

    h.download().await.unwrap();

    assert_eq!(h.relay.created(), 0);
    assert!(h.local.added.lock().is_empty());
}

#[tokio::test]
async fn test_stale_try_download_restarts() {
    let mut h = Harness::new(vec![AccountRecord::new("alice", "pw")], true);
    let mut record = record_in(HistoryState::TryDownload);
    record.updated_at = Utc::now() - chrono::Duration::minutes(10);
    h.seed(record).await;

    h.download().await.unwrap();
    assert_eq!(h.next_event().await, Event::Complete(1, 3));

    assert_eq!(h.relay.created(), 1);
    assert_eq!(h.record().await.state, HistoryState::Downloaded);
}

#[tokio::test]
async fn test_resume_reattaches_without_resubmitting() {
    let mut h = Harness::new(vec![AccountRecord::new("alice", "pw")], true);
    h.segment.insert("gid-7", EPISODE_DIR, SegmentStatus::Complete);
    let mut record = record_in(HistoryState::TryDownload);
    record.mark_downloading(BackendContext::Relay {
        job_ids: vec!["gid-7".to_string()],
        dir: EPISODE_DIR.to_string(),
        sources: Vec::new(),
    });
    h.seed(record).await;

    h.download().await.unwrap();
    assert_eq!(h.next_event().await, Event::Complete(1, 3));

    assert_eq!(h.relay.created(), 0);
    assert!(h.segment.added.lock().is_empty());
    assert_eq!(h.record().await.state, HistoryState::Downloaded);
}

#[tokio::test]
async fn test_resume_rediscovers_segment_jobs_by_directory() {
    let mut h = Harness::new(vec![AccountRecord::new("alice", "pw")], true);
    h.segment.insert("gid-42", EPISODE_DIR, SegmentStatus::Complete);
    h.segment
        .insert("gid-43", "/downloads/Frieren/Season 01/S01E04", SegmentStatus::Active);
    let mut record = record_in(HistoryState::TryDownload);
    record.mark_downloading(BackendContext::Relay {
        job_ids: vec!["gid-lost".to_string()],
        dir: EPISODE_DIR.to_string(),
        sources: Vec::new(),
    });
    h.seed(record).await;

    h.download().await.unwrap();
    assert_eq!(h.next_event().await, Event::Complete(1, 3));

    let record = h.record().await;
    assert_eq!(record.state, HistoryState::Downloaded);
    assert_matches!(
        record.context,
        Some(BackendContext::Relay { ref job_ids, .. }) if job_ids == &["gid-42".to_string()]
    );
    assert_eq!(h.relay.created(), 0);
}

#[tokio::test]
async fn test_segment_failure_is_persisted_and_reported() {
    let mut h = Harness::new(vec![AccountRecord::new("alice", "pw")], true);
    *h.segment.initial.lock() = (SegmentStatus::Error, Some("connection reset".to_string()));

    h.download().await.unwrap();

    assert_matches!(
        h.next_event().await,
        Event::Error(message) if message.contains("connection reset")
    );
    let record = h.record().await;
    assert_eq!(record.state, HistoryState::DownloadErr);
    assert_eq!(record.retry_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_local_download_times_out() {
    let mut h = Harness::new(Vec::new(), true);
    *h.local.initial.lock() = (LocalJobState::Downloading, 0.1, 0);

    h.download().await.unwrap();
    assert_eq!(h.next_event().await, Event::Error("download timeout".to_string()));

    let record = h.record().await;
    assert_eq!(record.state, HistoryState::DownloadErr);
    assert_eq!(record.error_message.as_deref(), Some("download timeout"));
    assert_eq!(record.retry_count, 1);
    assert_eq!(*h.local.deleted.lock(), vec!["c0ffee".to_string()]);

    // A stall is retryable
    h.download().await.unwrap();
    assert_eq!(h.local.added.lock().len(), 2);
    assert_eq!(h.record().await.state, HistoryState::Downloading);
}

#[tokio::test(start_paused = true)]
async fn test_progressing_local_download_is_not_stalled() {
    let mut h = Harness::new(Vec::new(), true);
    *h.local.initial.lock() = (LocalJobState::Downloading, 0.8, 0);

    h.download().await.unwrap();
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(h.events.try_recv().is_err());
    assert!(h.local.deleted.lock().is_empty());

    h.local
        .jobs
        .lock()
        .get_mut("c0ffee")
        .unwrap()
        .state = LocalJobState::Completed;
    assert_eq!(h.next_event().await, Event::Complete(1, 3));
    assert_eq!(h.record().await.state, HistoryState::Downloaded);
}

#[tokio::test]
async fn test_reset_forgets_history() {
    let h = Harness::new(vec![AccountRecord::new("alice", "pw")], true);
    h.seed(record_in(HistoryState::Downloaded)).await;

    assert!(h.orchestrator.reset("frieren", 1, 3).await.unwrap());
    assert!(h.orchestrator.history("frieren", 1, 3).await.unwrap().is_none());
    assert!(!h.orchestrator.reset("frieren", 1, 3).await.unwrap());
}

#[tokio::test]
async fn test_retry_during_failure_write_is_still_watched() {
    let history = Arc::new(SlowFailureHistory {
        inner: InMemoryHistoryRepository::new(),
        delay: Duration::from_millis(200),
        stalled: AtomicUsize::new(0),
    });
    let mut h = Harness::build(vec![AccountRecord::new("alice", "pw")], true, history, |_| {});
    *h.segment.initial.lock() = (SegmentStatus::Error, Some("connection reset".to_string()));

    h.download().await.unwrap();

    // The first watcher is now parked inside its failure write
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while h.record().await.state != HistoryState::DownloadErr {
        assert!(tokio::time::Instant::now() < deadline, "failure was never recorded");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    *h.segment.initial.lock() = (SegmentStatus::Complete, None);
    h.download().await.unwrap();

    let mut events = vec![
        h.next_event_within(Duration::from_secs(5)).await,
        h.next_event_within(Duration::from_secs(5)).await,
    ];
    events.sort_by_key(|e| matches!(e, Event::Error(_)));
    assert_eq!(events[0], Event::Complete(1, 3));
    assert_matches!(&events[1], Event::Error(message) if message.contains("connection reset"));

    let record = h.record().await;
    assert_eq!(record.state, HistoryState::Downloaded);
    assert_eq!(record.retry_count, 1);
    assert_eq!(h.segment.added.lock().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_relay_timeout_survives_failed_local_fallback() {
    let mut h = Harness::new(vec![AccountRecord::new("alice", "pw")], true);
    *h.relay.finish_immediately.lock() = false;
    *h.local.refuse_add.lock() = true;

    let err = h.download().await.unwrap_err();
    assert!(is_non_retryable(&err.to_string()));
    assert_matches!(h.next_event().await, Event::Error(message) if is_non_retryable(&message));

    let record = h.record().await;
    assert_eq!(record.state, HistoryState::DownloadErr);
    assert_eq!(record.retry_count, 1);
    let message = record.error_message.unwrap_or_default();
    assert!(is_non_retryable(&message));
    assert!(message.contains("torrent rejected by client"));

    // Not retried: no second relay submission and no local attempt
    *h.local.refuse_add.lock() = false;
    h.download().await.unwrap();
    assert_eq!(h.relay.created(), 1);
    assert!(h.local.added.lock().is_empty());
    assert_eq!(h.record().await.retry_count, 1);
}

#[tokio::test]
async fn test_long_relay_wait_keeps_attempt_fresh() {
    let mut h = Harness::build(
        vec![AccountRecord::new("alice", "pw")],
        true,
        Arc::new(InMemoryHistoryRepository::new()),
        |config| config.try_download_grace = Duration::from_millis(200),
    );
    *h.relay.finish_immediately.lock() = false;

    let first = h.download();
    let second = async {
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(h.record().await.state, HistoryState::TryDownload);
        h.download().await.unwrap();
        h.relay.complete_all();
    };
    let (result, ()) = tokio::join!(first, second);
    result.unwrap();

    assert_eq!(h.next_event_within(Duration::from_secs(5)).await, Event::Complete(1, 3));
    assert_eq!(h.relay.created(), 1);
    assert_eq!(h.segment.added.lock().len(), 1);
}
