//! Background job scheduling

pub mod account_recovery;

use std::sync::Arc;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use crate::services::AccountPool;

/// Initialize and start the job scheduler
pub async fn start_scheduler(
    pool: Arc<AccountPool>,
    recovery_cron: &str,
) -> anyhow::Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    // Relay account recovery - releases lapsed rate limits and refilled storage
    let recovery_pool = pool.clone();
    let recovery_job = Job::new_async(recovery_cron, move |_uuid, _l| {
        let pool = recovery_pool.clone();
        Box::pin(async move {
            if let Err(e) = account_recovery::run_recovery(pool).await {
                tracing::error!(job = "account_recovery", error = %e, "Account recovery failed");
            }
        })
    })?;
    scheduler.add(recovery_job).await?;

    scheduler.start().await?;
    info!(cron = %recovery_cron, "Job scheduler started");

    Ok(scheduler)
}
