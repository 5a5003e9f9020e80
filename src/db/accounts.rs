//! Relay account repository

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Usability of a relay account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountHealth {
    Normal,
    /// Daily task creation limit hit
    RateLimited,
    /// Relay storage is full
    StorageExhausted,
}

impl std::fmt::Display for AccountHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccountHealth::Normal => write!(f, "normal"),
            AccountHealth::RateLimited => write!(f, "rate_limited"),
            AccountHealth::StorageExhausted => write!(f, "storage_exhausted"),
        }
    }
}

impl std::str::FromStr for AccountHealth {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "normal" => Ok(AccountHealth::Normal),
            "rate_limited" => Ok(AccountHealth::RateLimited),
            "storage_exhausted" => Ok(AccountHealth::StorageExhausted),
            _ => Err(anyhow::anyhow!("Unknown account health: {}", s)),
        }
    }
}

/// Relay account record
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub username: String,
    pub password: String,
    pub health: AccountHealth,
    /// When the current restriction began; `None` while normal
    pub restricted_at: Option<DateTime<Utc>>,
}

impl AccountRecord {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            health: AccountHealth::Normal,
            restricted_at: None,
        }
    }

    pub fn quarantine(&mut self, health: AccountHealth, at: DateTime<Utc>) {
        self.health = health;
        self.restricted_at = Some(at);
    }

    pub fn restore(&mut self) {
        self.health = AccountHealth::Normal;
        self.restricted_at = None;
    }
}

impl std::fmt::Debug for AccountRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountRecord")
            .field("username", &self.username)
            .field("password", &"***")
            .field("health", &self.health)
            .field("restricted_at", &self.restricted_at)
            .finish()
    }
}

/// Persistent storage for relay accounts
#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn list(&self) -> Result<Vec<AccountRecord>>;

    async fn list_by_health(&self, health: AccountHealth) -> Result<Vec<AccountRecord>>;

    async fn update(&self, account: &AccountRecord) -> Result<()>;
}

/// Process-local account store, ordered by username
#[derive(Debug, Default)]
pub struct InMemoryAccountRepository {
    accounts: RwLock<BTreeMap<String, AccountRecord>>,
}

impl InMemoryAccountRepository {
    pub fn new(accounts: impl IntoIterator<Item = AccountRecord>) -> Self {
        Self {
            accounts: RwLock::new(
                accounts
                    .into_iter()
                    .map(|a| (a.username.clone(), a))
                    .collect(),
            ),
        }
    }

    pub fn get(&self, username: &str) -> Option<AccountRecord> {
        self.accounts.read().get(username).cloned()
    }
}

#[async_trait]
impl AccountRepository for InMemoryAccountRepository {
    async fn list(&self) -> Result<Vec<AccountRecord>> {
        Ok(self.accounts.read().values().cloned().collect())
    }

    async fn list_by_health(&self, health: AccountHealth) -> Result<Vec<AccountRecord>> {
        Ok(self
            .accounts
            .read()
            .values()
            .filter(|a| a.health == health)
            .cloned()
            .collect())
    }

    async fn update(&self, account: &AccountRecord) -> Result<()> {
        let mut accounts = self.accounts.write();
        match accounts.get_mut(&account.username) {
            Some(existing) => {
                *existing = account.clone();
                Ok(())
            }
            None => Err(anyhow::anyhow!("Account not found: {}", account.username)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_hides_password() {
        let account = AccountRecord::new("alice@example.com", "hunter2");
        let rendered = format!("{:?}", account);
        assert!(rendered.contains("alice@example.com"));
        assert!(!rendered.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_list_by_health_filters() {
        let mut limited = AccountRecord::new("b", "pw");
        limited.quarantine(AccountHealth::RateLimited, Utc::now());
        let repo = InMemoryAccountRepository::new([AccountRecord::new("a", "pw"), limited]);

        let normal = repo.list_by_health(AccountHealth::Normal).await.unwrap();
        assert_eq!(normal.len(), 1);
        assert_eq!(normal[0].username, "a");

        let mut restored = repo.get("b").unwrap();
        restored.restore();
        repo.update(&restored).await.unwrap();
        assert_eq!(repo.list_by_health(AccountHealth::Normal).await.unwrap().len(), 2);
        assert!(repo.update(&AccountRecord::new("zed", "pw")).await.is_err());
    }
}
