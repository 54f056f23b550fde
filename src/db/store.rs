//! Trait seam between the batch passes and persistence, plus the SQLite
//! implementation.
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::model::UpsertOutcome;
use super::repo::{self, Pool};
use crate::model::{BatchCounts, LogStatus, NewLogEntry, NotificationLogEntry, Recipient};
use crate::secrets::SecretStore;

/// Status changes the passes record on an existing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    Sent {
        provider_message_id: String,
        sent_at: DateTime<Utc>,
    },
    Failed {
        error: String,
    },
    /// failed → prepared; `phone` replaces the stored number when present.
    Prepared {
        phone: Option<String>,
    },
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn find_recipient(&self, id: i64) -> Result<Option<Recipient>>;
    async fn insert_pending(&self, entry: &NewLogEntry) -> Result<Option<i64>>;
    async fn upsert_entry(&self, entry: &NewLogEntry) -> Result<UpsertOutcome>;
    async fn list_entries(
        &self,
        batch_id: &str,
        status: Option<LogStatus>,
    ) -> Result<Vec<NotificationLogEntry>>;
    async fn update_status(&self, id: i64, update: StatusUpdate) -> Result<()>;
    async fn delete_entries(&self, batch_id: &str, status: LogStatus) -> Result<u64>;
    async fn batch_counts(&self, batch_id: &str) -> Result<BatchCounts>;
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationStore for SqliteStore {
    async fn find_recipient(&self, id: i64) -> Result<Option<Recipient>> {
        repo::get_customer(&self.pool, id).await
    }

    async fn insert_pending(&self, entry: &NewLogEntry) -> Result<Option<i64>> {
        repo::insert_pending_entry(&self.pool, entry).await
    }

    async fn upsert_entry(&self, entry: &NewLogEntry) -> Result<UpsertOutcome> {
        repo::upsert_log_entry(&self.pool, entry).await
    }

    async fn list_entries(
        &self,
        batch_id: &str,
        status: Option<LogStatus>,
    ) -> Result<Vec<NotificationLogEntry>> {
        repo::list_log_entries(&self.pool, batch_id, status).await
    }

    async fn update_status(&self, id: i64, update: StatusUpdate) -> Result<()> {
        match update {
            StatusUpdate::Sent {
                provider_message_id,
                sent_at,
            } => repo::mark_entry_sent(&self.pool, id, &provider_message_id, sent_at).await,
            StatusUpdate::Failed { error } => repo::mark_entry_failed(&self.pool, id, &error).await,
            StatusUpdate::Prepared { phone } => {
                repo::reset_entry_for_retry(&self.pool, id, phone.as_deref()).await
            }
        }
    }

    async fn delete_entries(&self, batch_id: &str, status: LogStatus) -> Result<u64> {
        repo::delete_log_entries(&self.pool, batch_id, status).await
    }

    async fn batch_counts(&self, batch_id: &str) -> Result<BatchCounts> {
        repo::batch_counts(&self.pool, batch_id).await
    }
}

#[async_trait]
impl SecretStore for SqliteStore {
    async fn get_secret(&self, name: &str) -> Result<Option<String>> {
        repo::get_secret(&self.pool, name).await
    }
}
