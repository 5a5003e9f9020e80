//! Segment-transfer client capability
//!
//! A local download manager that fetches direct URLs (aria2-style). The
//! orchestrator feeds it the URLs resolved from the relay and waits on the
//! resulting jobs.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Status of a segment-transfer job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentStatus {
    Active,
    Waiting,
    Paused,
    Complete,
    Error,
    Removed,
}

impl std::fmt::Display for SegmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SegmentStatus::Active => write!(f, "active"),
            SegmentStatus::Waiting => write!(f, "waiting"),
            SegmentStatus::Paused => write!(f, "paused"),
            SegmentStatus::Complete => write!(f, "complete"),
            SegmentStatus::Error => write!(f, "error"),
            SegmentStatus::Removed => write!(f, "removed"),
        }
    }
}

/// A segment-transfer job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentJob {
    pub id: String,
    pub status: SegmentStatus,
    pub dir: String,
    /// Output file paths
    pub files: Vec<String>,
    pub total_length: u64,
    pub completed_length: u64,
    pub download_speed: u64,
    pub error_message: Option<String>,
}

impl SegmentJob {
    /// Whether the job writes below `dir`
    pub fn writes_into(&self, dir: &str) -> bool {
        let dir = Path::new(dir);
        Path::new(&self.dir).starts_with(dir)
            || self.files.iter().any(|f| Path::new(f).starts_with(dir))
    }
}

/// Segment-transfer client used for the relay pipeline
#[async_trait]
pub trait SegmentTransferClient: Send + Sync {
    /// Queue `uri` for download into `dir` as `out`; returns the job id
    async fn add_uri(&self, uri: &str, dir: &str, out: &str) -> Result<String>;

    /// Current job status; `None` if the client does not know the id
    async fn status(&self, id: &str) -> Result<Option<SegmentJob>>;

    async fn list_active(&self) -> Result<Vec<SegmentJob>>;

    async fn list_waiting(&self) -> Result<Vec<SegmentJob>>;

    async fn list_stopped(&self) -> Result<Vec<SegmentJob>>;

    async fn remove(&self, id: &str) -> Result<()>;

    /// Drop the result record of a stopped job
    async fn remove_result(&self, id: &str) -> Result<()>;
}

/// How a set of segment jobs ended
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentOutcome {
    Complete,
    Failed { job_id: String, message: String },
}

/// Every job the client knows about that writes into `dir`
pub async fn find_jobs_in_dir(
    client: &dyn SegmentTransferClient,
    dir: &str,
) -> Result<Vec<SegmentJob>> {
    let mut jobs = client.list_active().await?;
    jobs.extend(client.list_waiting().await?);
    jobs.extend(client.list_stopped().await?);
    Ok(jobs.into_iter().filter(|j| j.writes_into(dir)).collect())
}

/// Poll `job_ids` until all complete or one fails
pub async fn wait_for_jobs(
    client: &dyn SegmentTransferClient,
    job_ids: &[String],
    poll_interval: Duration,
) -> Result<SegmentOutcome> {
    let mut pending: Vec<String> = job_ids.to_vec();

    loop {
        let mut still_running = Vec::with_capacity(pending.len());
        for id in pending {
            let Some(job) = client.status(&id).await? else {
                return Ok(SegmentOutcome::Failed {
                    job_id: id,
                    message: "transfer job disappeared".to_string(),
                });
            };

            match job.status {
                SegmentStatus::Complete => {
                    debug!(job_id = %id, "Segment job complete");
                }
                SegmentStatus::Error | SegmentStatus::Removed => {
                    return Ok(SegmentOutcome::Failed {
                        message: job
                            .error_message
                            .unwrap_or_else(|| format!("transfer job {}", job.status)),
                        job_id: id,
                    });
                }
                SegmentStatus::Active | SegmentStatus::Waiting | SegmentStatus::Paused => {
                    still_running.push(id);
                }
            }
        }

        if still_running.is_empty() {
            return Ok(SegmentOutcome::Complete);
        }
        pending = still_running;
        tokio::time::sleep(poll_interval).await;
    }
}
