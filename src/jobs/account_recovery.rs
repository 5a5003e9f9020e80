//! Periodic relay account recovery
//!
//! The pool also recovers on demand when it runs out of normal accounts; this
//! job keeps quarantined accounts from lingering between submissions.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info};

use crate::services::AccountPool;

pub async fn run_recovery(pool: Arc<AccountPool>) -> Result<usize> {
    debug!(job = "account_recovery", "Checking quarantined relay accounts");

    let restored = pool.recover_accounts().await?;
    if restored > 0 {
        info!(job = "account_recovery", restored, "Relay accounts returned to service");
    }

    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration, Utc};

    use crate::db::{AccountHealth, AccountRecord, InMemoryAccountRepository};
    use crate::services::AccountPoolConfig;
    use crate::services::relay::{RelayConnector, RelayService};

    struct NoSessions;

    #[async_trait]
    impl RelayConnector for NoSessions {
        async fn connect(&self, account: &AccountRecord) -> Result<Arc<dyn RelayService>> {
            anyhow::bail!("no session for {}", account.username)
        }
    }

    #[tokio::test]
    async fn test_run_recovery_releases_lapsed_rate_limit() {
        let mut limited = AccountRecord::new("alice", "secret");
        limited.quarantine(AccountHealth::RateLimited, Utc::now() - Duration::days(3));
        let accounts = Arc::new(InMemoryAccountRepository::new([limited]));

        let pool = Arc::new(AccountPool::new(
            accounts.clone(),
            Arc::new(NoSessions),
            AccountPoolConfig::default(),
        ));

        assert_eq!(run_recovery(pool).await.unwrap(), 1);
        assert_eq!(accounts.get("alice").unwrap().health, AccountHealth::Normal);
    }
}
