/// Expiration reconciler
///
/// Sweeps memberships whose end date has passed and demotes members left
/// without coverage. Each account is handled in its own transaction, so a
/// failure part way through keeps everything already committed and the sweep
/// moves on to the next account.
use crate::{
    account::Role,
    clock::Clock,
    db,
    error::CoreResult,
    metrics,
    notification::{notify_best_effort, NotificationKind, Notifier},
    subscription::{apply_role_transition, has_coverage},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;

/// What one pass changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Memberships moved from active to expired
    pub expired: u64,
    /// Accounts demoted from member to guest
    pub demoted: u64,
    /// Accounts skipped because of an error
    pub failures: u64,
}

pub struct ExpirationReconciler {
    db: SqlitePool,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
}

impl ExpirationReconciler {
    pub fn new(db: SqlitePool, notifier: Arc<dyn Notifier>, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            notifier,
            clock,
        }
    }

    /// Run one sweep against a single reading of the clock.
    ///
    /// Only the candidate queries can fail the whole pass; per-account errors
    /// are logged and counted.
    pub async fn run_once(&self) -> CoreResult<ReconcileReport> {
        let now = self.clock.now();
        let mut report = ReconcileReport::default();

        let lapsed: Vec<i64> = sqlx::query_scalar(
            "SELECT DISTINCT account_id FROM membership
             WHERE status = 'active' AND end_at <= ?1
             ORDER BY account_id",
        )
        .bind(now)
        .fetch_all(&self.db)
        .await?;

        for account_id in lapsed {
            match self.expire_account(account_id, now).await {
                Ok((expired, demoted)) => {
                    report.expired += expired;
                    report.demoted += u64::from(demoted);
                    if expired > 0 {
                        notify_best_effort(
                            self.notifier.as_ref(),
                            account_id,
                            "Subscription Expired",
                            "Your subscription has expired. Please renew to continue enjoying member benefits.",
                            NotificationKind::Subscription,
                        )
                        .await;
                    }
                }
                Err(e) => {
                    report.failures += 1;
                    tracing::error!(account_id, "Failed to expire memberships: {}", e);
                    metrics::record_error("reconcile_expire", "jobs");
                }
            }
        }

        // Members who lost coverage without an active row reaching this pass,
        // e.g. a cancelled membership running out
        let uncovered: Vec<i64> = sqlx::query_scalar(
            "SELECT a.id FROM account a
             WHERE a.role = 'member'
               AND NOT EXISTS (
                   SELECT 1 FROM membership m
                   WHERE m.account_id = a.id
                     AND m.status IN ('active', 'cancelled')
                     AND m.end_at > ?1
               )
             ORDER BY a.id",
        )
        .bind(now)
        .fetch_all(&self.db)
        .await?;

        for account_id in uncovered {
            match self.demote_account(account_id, now).await {
                Ok(demoted) => report.demoted += u64::from(demoted),
                Err(e) => {
                    report.failures += 1;
                    tracing::error!(account_id, "Failed to demote lapsed member: {}", e);
                    metrics::record_error("reconcile_demote", "jobs");
                }
            }
        }

        metrics::record_memberships_expired(report.expired);
        tracing::info!(
            expired = report.expired,
            demoted = report.demoted,
            failures = report.failures,
            "Membership reconciliation finished"
        );

        Ok(report)
    }

    /// Expire one account's lapsed active memberships and demote if nothing
    /// else covers it. Returns (memberships expired, demoted).
    async fn expire_account(&self, account_id: i64, now: DateTime<Utc>) -> CoreResult<(u64, bool)> {
        let mut tx = self.db.begin().await?;
        db::lock_account(&mut tx, account_id, now).await?;

        // Re-evaluated under the lock: a renewal committed since the
        // candidate query pushed end_at forward and must win
        let expired = sqlx::query(
            "UPDATE membership SET status = 'expired', updated_at = ?1
             WHERE account_id = ?2 AND status = 'active' AND end_at <= ?1",
        )
        .bind(now)
        .bind(account_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let demoted = if expired > 0 && !has_coverage(&mut tx, account_id, now).await? {
            apply_role_transition(&mut tx, account_id, now, Role::after_lapse)
                .await?
                .is_some()
        } else {
            false
        };

        tx.commit().await?;

        if expired > 0 {
            tracing::info!(account_id, expired, demoted, "Memberships expired");
        }

        Ok((expired, demoted))
    }

    async fn demote_account(&self, account_id: i64, now: DateTime<Utc>) -> CoreResult<bool> {
        let mut tx = self.db.begin().await?;
        db::lock_account(&mut tx, account_id, now).await?;

        let demoted = if has_coverage(&mut tx, account_id, now).await? {
            false
        } else {
            apply_role_transition(&mut tx, account_id, now, Role::after_lapse)
                .await?
                .is_some()
        };

        tx.commit().await?;
        Ok(demoted)
    }
}
