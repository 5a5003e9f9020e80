//! Relay account pool
//!
//! Fronts a set of quota-limited relay accounts:
//! - Submission (account choice, duplicate lookup, task creation) runs under a
//!   single lock; waiting for the relay and resolving URLs happens outside it.
//! - Accounts rejected for quota reasons are quarantined and recovered later by
//!   [AccountPool::recover_accounts].
//! - Files handed out for transfer are tracked so their relay storage can be
//!   reclaimed once the local copy exists.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Local, TimeZone, Timelike, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::db::{AccountHealth, AccountRecord, AccountRepository};
use crate::error::{PoolError, RelayError};
use crate::services::relay::{
    RelayConnector, RelayService, RelayTask, RelayTaskPhase, TransferItem, source_matches,
};

/// Configuration for the account pool
#[derive(Debug, Clone)]
pub struct AccountPoolConfig {
    /// Poll cadence while waiting for a relay task
    pub poll_interval: Duration,
    /// Free bytes required to release a storage-exhausted account
    pub min_free_bytes: u64,
}

impl Default for AccountPoolConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            min_free_bytes: 500 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
struct TrackedFile {
    file_id: String,
    account: String,
}

#[derive(Default)]
struct PoolState {
    sessions: HashMap<String, Arc<dyn RelayService>>,
    /// Transfer URL -> relay file awaiting reclamation
    files: HashMap<String, TrackedFile>,
}

/// Multi-account front for the relay service
pub struct AccountPool {
    accounts: Arc<dyn AccountRepository>,
    connector: Arc<dyn RelayConnector>,
    config: AccountPoolConfig,
    state: Mutex<PoolState>,
}

impl AccountPool {
    pub fn new(
        accounts: Arc<dyn AccountRepository>,
        connector: Arc<dyn RelayConnector>,
        config: AccountPoolConfig,
    ) -> Self {
        Self {
            accounts,
            connector,
            config,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Sweep leftover relay storage on every account.
    ///
    /// Completed and failed tasks are deleted together with their files, then
    /// the trash is emptied. A failing account is logged and skipped.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let accounts = self.accounts.list().await?;

        for account in accounts {
            let session = match self.session(&mut state, &account).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(
                        account = %account.username,
                        error = %e,
                        "Could not open relay session for sweep"
                    );
                    continue;
                }
            };

            match sweep_account(session.as_ref()).await {
                Ok(removed) => info!(
                    account = %account.username,
                    removed_tasks = removed,
                    "Swept relay storage"
                ),
                Err(e) => warn!(
                    account = %account.username,
                    error = %e,
                    "Failed to sweep relay storage"
                ),
            }
        }

        Ok(())
    }

    /// Submit `source` to a relay account and wait until the relay holds the
    /// files, returning one transfer item per file.
    pub async fn submit_and_wait(
        &self,
        name: &str,
        source: &str,
        timeout: Duration,
    ) -> Result<Vec<TransferItem>, PoolError> {
        let (account, session, task) = {
            let mut state = self.state.lock().await;
            self.submit_locked(&mut state, name, source).await?
        };

        info!(
            account = %account,
            task_id = %task.id,
            phase = %task.phase,
            "Relay task accepted: {}",
            name
        );

        let task = self.wait_for_task(session.as_ref(), task, timeout).await?;
        let resolved = resolve_items(session.as_ref(), &task).await?;

        let mut state = self.state.lock().await;
        let mut items = Vec::with_capacity(resolved.len());
        for (file_id, item) in resolved {
            state.files.insert(
                item.url.clone(),
                TrackedFile {
                    file_id,
                    account: account.clone(),
                },
            );
            items.push(item);
        }

        debug!(account = %account, task_id = %task.id, files = items.len(), "Relay files resolved");
        Ok(items)
    }

    /// Delete the relay copy of a file previously returned by
    /// [submit_and_wait](Self::submit_and_wait).
    pub async fn reclaim_storage(&self, url: &str) -> Result<(), PoolError> {
        let mut state = self.state.lock().await;
        let tracked = state
            .files
            .get(url)
            .cloned()
            .ok_or_else(|| PoolError::FileNotTracked(url.to_string()))?;

        let session = self.session_for(&mut state, &tracked.account).await?;
        session
            .delete_files(std::slice::from_ref(&tracked.file_id))
            .await?;
        state.files.remove(url);

        debug!(account = %tracked.account, file_id = %tracked.file_id, "Reclaimed relay storage");
        Ok(())
    }

    /// Release quarantined accounts whose restriction has lapsed.
    ///
    /// Returns the number of accounts restored to normal.
    pub async fn recover_accounts(&self) -> Result<usize, PoolError> {
        let mut state = self.state.lock().await;
        self.recover_locked(&mut state, Utc::now()).await
    }

    /// Number of relay files still awaiting reclamation
    pub async fn tracked_files(&self) -> usize {
        self.state.lock().await.files.len()
    }

    async fn submit_locked(
        &self,
        state: &mut PoolState,
        name: &str,
        source: &str,
    ) -> Result<(String, Arc<dyn RelayService>, RelayTask), PoolError> {
        let mut tried: HashSet<String> = HashSet::new();
        let mut refreshed = false;
        let mut last_rejection: Option<PoolError> = None;

        loop {
            let account = match self.pick_account(&tried).await? {
                Some(account) => account,
                None if !refreshed => {
                    refreshed = true;
                    let restored = self.recover_locked(state, Utc::now()).await?;
                    debug!(restored, "No normal relay account, ran recovery pass");
                    continue;
                }
                None => return Err(last_rejection.unwrap_or(PoolError::NoAccountAvailable)),
            };
            tried.insert(account.username.clone());

            let session = self.session(state, &account).await?;
            match submit_to(session.as_ref(), name, source).await {
                Ok(task) => return Ok((account.username, session, task)),
                Err(RelayError::DailyLimitExceeded(message)) => {
                    warn!(
                        account = %account.username,
                        %message,
                        "Relay account hit daily task limit"
                    );
                    self.quarantine(account.clone(), AccountHealth::RateLimited).await?;
                    last_rejection = Some(PoolError::Rejected {
                        account: account.username,
                        source: RelayError::DailyLimitExceeded(message),
                    });
                }
                Err(RelayError::InsufficientStorage(message)) => {
                    warn!(account = %account.username, %message, "Relay account out of storage");
                    self.quarantine(account.clone(), AccountHealth::StorageExhausted).await?;
                    last_rejection = Some(PoolError::Rejected {
                        account: account.username,
                        source: RelayError::InsufficientStorage(message),
                    });
                }
                Err(RelayError::Other(e)) => return Err(PoolError::Relay(e)),
            }
        }
    }

    async fn pick_account(
        &self,
        tried: &HashSet<String>,
    ) -> Result<Option<AccountRecord>, PoolError> {
        let candidates = self
            .accounts
            .list_by_health(AccountHealth::Normal)
            .await
            .map_err(PoolError::Store)?;

        Ok(candidates
            .into_iter()
            .find(|a| a.health == AccountHealth::Normal && !tried.contains(&a.username)))
    }

    async fn quarantine(
        &self,
        mut account: AccountRecord,
        health: AccountHealth,
    ) -> Result<(), PoolError> {
        account.quarantine(health, Utc::now());
        self.accounts
            .update(&account)
            .await
            .map_err(PoolError::Store)
    }

    async fn recover_locked(
        &self,
        state: &mut PoolState,
        now: DateTime<Utc>,
    ) -> Result<usize, PoolError> {
        let accounts = self.accounts.list().await.map_err(PoolError::Store)?;
        let mut restored = 0;

        for mut account in accounts {
            let release = match account.health {
                AccountHealth::Normal => continue,
                AccountHealth::RateLimited => account
                    .restricted_at
                    .map(|since| now >= rate_limit_release_at(since, &Local))
                    .unwrap_or(true),
                AccountHealth::StorageExhausted => {
                    self.storage_recovered(state, &account).await
                }
            };

            if release {
                let previous = account.health;
                account.restore();
                self.accounts
                    .update(&account)
                    .await
                    .map_err(PoolError::Store)?;
                info!(account = %account.username, previous = %previous, "Relay account restored");
                restored += 1;
            }
        }

        Ok(restored)
    }

    async fn storage_recovered(&self, state: &mut PoolState, account: &AccountRecord) -> bool {
        let session = match self.session(state, account).await {
            Ok(s) => s,
            Err(e) => {
                warn!(
                    account = %account.username,
                    error = %e,
                    "Could not open relay session for recovery"
                );
                return false;
            }
        };

        if let Err(e) = session.empty_trash().await {
            warn!(account = %account.username, error = %e, "Failed to empty relay trash");
        }

        match session.quota().await {
            Ok(quota) if quota.free() > self.config.min_free_bytes => true,
            Ok(quota) => {
                debug!(
                    account = %account.username,
                    free = quota.free(),
                    required = self.config.min_free_bytes,
                    "Relay account still short of storage"
                );
                false
            }
            Err(e) => {
                warn!(account = %account.username, error = %e, "Failed to read relay quota");
                false
            }
        }
    }

    async fn session(
        &self,
        state: &mut PoolState,
        account: &AccountRecord,
    ) -> Result<Arc<dyn RelayService>> {
        if let Some(session) = state.sessions.get(&account.username) {
            return Ok(session.clone());
        }
        let session = self.connector.connect(account).await?;
        state
            .sessions
            .insert(account.username.clone(), session.clone());
        Ok(session)
    }

    async fn session_for(
        &self,
        state: &mut PoolState,
        username: &str,
    ) -> Result<Arc<dyn RelayService>, PoolError> {
        if let Some(session) = state.sessions.get(username) {
            return Ok(session.clone());
        }
        let account = self
            .accounts
            .list()
            .await
            .map_err(PoolError::Store)?
            .into_iter()
            .find(|a| a.username == username)
            .ok_or_else(|| PoolError::Store(anyhow::anyhow!("Account not found: {}", username)))?;
        Ok(self.session(state, &account).await?)
    }

    async fn wait_for_task(
        &self,
        session: &dyn RelayService,
        mut task: RelayTask,
        timeout: Duration,
    ) -> Result<RelayTask, PoolError> {
        let deadline = Instant::now() + timeout;

        loop {
            match task.phase {
                RelayTaskPhase::Complete => return Ok(task),
                RelayTaskPhase::Error => {
                    return Err(PoolError::TaskFailed {
                        message: task
                            .message
                            .clone()
                            .unwrap_or_else(|| "unknown error".to_string()),
                        task_id: task.id,
                    });
                }
                RelayTaskPhase::Pending | RelayTaskPhase::Running => {}
            }

            let now = Instant::now();
            if now >= deadline {
                if let Err(e) = session.delete_tasks(std::slice::from_ref(&task.id), true).await {
                    warn!(task_id = %task.id, error = %e, "Failed to cancel timed out relay task");
                }
                return Err(PoolError::WaitTimeout {
                    task_id: task.id,
                    timeout,
                });
            }

            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;

            task = session
                .get_task(&task.id)
                .await?
                .ok_or_else(|| PoolError::TaskFailed {
                    task_id: task.id.clone(),
                    message: "task disappeared from relay".to_string(),
                })?;
        }
    }
}

/// When a rate-limited account becomes usable again: the first midnight in
/// `tz` at or after 24 hours past the quarantine.
pub fn rate_limit_release_at<Tz: TimeZone>(since: DateTime<Utc>, tz: &Tz) -> DateTime<Utc> {
    let earliest = since + chrono::Duration::hours(24);
    let local = earliest.with_timezone(tz);

    if local.num_seconds_from_midnight() == 0 && local.nanosecond() == 0 {
        return earliest;
    }

    let Some(next_midnight) = local
        .date_naive()
        .succ_opt()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
    else {
        return earliest;
    };

    // Midnight can fall into a DST gap; the hour after it is then the first local time.
    tz.from_local_datetime(&next_midnight)
        .earliest()
        .or_else(|| {
            tz.from_local_datetime(&(next_midnight + chrono::Duration::hours(1)))
                .earliest()
        })
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or(earliest)
}

async fn submit_to(
    session: &dyn RelayService,
    name: &str,
    source: &str,
) -> Result<RelayTask, RelayError> {
    let wanted = source.to_owned();
    let predicate = move |task: &RelayTask| source_matches(&task.source, &wanted);

    if let Some(existing) = session.find_task(&predicate).await? {
        match existing.phase {
            RelayTaskPhase::Complete | RelayTaskPhase::Running | RelayTaskPhase::Pending => {
                debug!(
                    task_id = %existing.id,
                    phase = %existing.phase,
                    "Reusing existing relay task"
                );
                return Ok(existing);
            }
            RelayTaskPhase::Error => {
                debug!(task_id = %existing.id, "Discarding failed relay task before resubmitting");
                session
                    .delete_tasks(std::slice::from_ref(&existing.id), true)
                    .await?;
            }
        }
    }

    session.create_task(name, source).await
}

async fn resolve_items(
    session: &dyn RelayService,
    task: &RelayTask,
) -> Result<Vec<(String, TransferItem)>, PoolError> {
    let root = task.file_id.as_deref().ok_or_else(|| PoolError::TaskFailed {
        task_id: task.id.clone(),
        message: "completed task has no files".to_string(),
    })?;

    let files = session.file_tree(root).await?;
    let mut items = Vec::with_capacity(files.len());
    for file in files {
        let url = session.download_url(&file.id).await?;
        items.push((
            file.id,
            TransferItem {
                url,
                path: file.path,
                size: file.size,
            },
        ));
    }
    Ok(items)
}

async fn sweep_account(session: &dyn RelayService) -> Result<usize> {
    let stale: Vec<String> = session
        .list_tasks()
        .await?
        .into_iter()
        .filter(|t| matches!(t.phase, RelayTaskPhase::Complete | RelayTaskPhase::Error))
        .map(|t| t.id)
        .collect();

    if !stale.is_empty() {
        session.delete_tasks(&stale, true).await?;
    }
    session.empty_trash().await?;
    Ok(stale.len())
}
