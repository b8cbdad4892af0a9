/// In-app notifications
///
/// The ledger and reconciler emit notifications through the [`Notifier`]
/// trait. Delivery is fire-and-forget: callers log a failure and move on.
use crate::{
    clock::Clock,
    error::{CoreError, CoreResult},
    metrics,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use std::str::FromStr;
use std::sync::Arc;

/// Notification category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Subscription,
    Account,
    System,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Subscription => "subscription",
            NotificationKind::Account => "account",
            NotificationKind::System => "system",
        }
    }
}

impl FromStr for NotificationKind {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s {
            "subscription" => Ok(NotificationKind::Subscription),
            "account" => Ok(NotificationKind::Account),
            "system" => Ok(NotificationKind::System),
            _ => Err(CoreError::Validation(format!("Invalid notification kind: {}", s))),
        }
    }
}

/// Stored notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub account_id: i64,
    pub title: String,
    pub message: String,
    pub kind: NotificationKind,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    fn from_row(row: &SqliteRow) -> CoreResult<Self> {
        let kind: String = row.try_get("kind")?;

        Ok(Self {
            id: row.try_get("id")?,
            account_id: row.try_get("account_id")?,
            title: row.try_get("title")?,
            message: row.try_get("message")?,
            kind: kind.parse()?,
            is_read: row.try_get("is_read")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        account_id: i64,
        title: &str,
        message: &str,
        kind: NotificationKind,
    ) -> CoreResult<()>;
}

/// Send a notification, logging instead of failing
pub async fn notify_best_effort(
    notifier: &dyn Notifier,
    account_id: i64,
    title: &str,
    message: &str,
    kind: NotificationKind,
) {
    match notifier.notify(account_id, title, message, kind).await {
        Ok(()) => metrics::record_notification(kind.as_str(), true),
        Err(e) => {
            metrics::record_notification(kind.as_str(), false);
            tracing::warn!(account_id, title, "Failed to deliver notification: {}", e);
        }
    }
}

/// Notifier that persists to the `notification` table
pub struct SqliteNotifier {
    db: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SqliteNotifier {
    pub fn new(db: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Newest first
    pub async fn list_for_account(&self, account_id: i64, limit: i64) -> CoreResult<Vec<Notification>> {
        let rows = sqlx::query(
            "SELECT id, account_id, title, message, kind, is_read, created_at
             FROM notification
             WHERE account_id = ?1
             ORDER BY created_at DESC, id DESC
             LIMIT ?2",
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(Notification::from_row).collect()
    }

    pub async fn unread_count(&self, account_id: i64) -> CoreResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM notification WHERE account_id = ?1 AND is_read = 0",
        )
        .bind(account_id)
        .fetch_one(&self.db)
        .await?;

        Ok(count)
    }

    /// Mark one notification read. Scoped by account so nobody can touch
    /// someone else's inbox.
    pub async fn mark_read(&self, account_id: i64, notification_id: i64) -> CoreResult<bool> {
        let result = sqlx::query(
            "UPDATE notification SET is_read = 1 WHERE id = ?1 AND account_id = ?2",
        )
        .bind(notification_id)
        .bind(account_id)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_all_read(&self, account_id: i64) -> CoreResult<u64> {
        let result = sqlx::query(
            "UPDATE notification SET is_read = 1 WHERE account_id = ?1 AND is_read = 0",
        )
        .bind(account_id)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl Notifier for SqliteNotifier {
    async fn notify(
        &self,
        account_id: i64,
        title: &str,
        message: &str,
        kind: NotificationKind,
    ) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO notification (account_id, title, message, kind, is_read, created_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)",
        )
        .bind(account_id)
        .bind(title)
        .bind(message)
        .bind(kind.as_str())
        .bind(self.clock.now())
        .execute(&self.db)
        .await?;

        tracing::debug!(account_id, title, "Notification stored");
        Ok(())
    }
}
