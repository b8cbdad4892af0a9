/// Brute-force lockout over a sliding window of failed login attempts
use crate::{clock::Clock, error::{CoreError, CoreResult}, metrics};
use chrono::{DateTime, Duration, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;

/// An attempt row claimed before the secret is checked.
///
/// It counts as a failure until [`LoginGuard::mark_success`] flips it, so an
/// attempt that is abandoned or times out is never recorded as a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptSlot {
    id: i64,
}

/// Login guard
///
/// Counts failed attempts for an identifier OR a source IP over the trailing
/// window. Nothing is bucketed: the count is recomputed from timestamps on
/// every attempt, so lockouts lift on their own.
pub struct LoginGuard {
    db: SqlitePool,
    clock: Arc<dyn Clock>,
    max_failures: u32,
    window: Duration,
}

impl LoginGuard {
    pub fn new(db: SqlitePool, clock: Arc<dyn Clock>, max_failures: u32, window: Duration) -> Self {
        Self {
            db,
            clock,
            max_failures,
            window,
        }
    }

    /// Claim an attempt for the identifier and IP, or refuse with `RateLimited`
    /// when either already has `max_failures` failures in the window.
    ///
    /// The claim and the count run in one write transaction, so concurrent
    /// attempts are admitted one at a time and at most `max_failures` of them
    /// get past the guard.
    pub async fn begin_attempt(&self, identifier: &str, ip_address: &str) -> CoreResult<AttemptSlot> {
        let now = self.clock.now();
        let since = now - self.window;

        let mut tx = self.db.begin().await?;

        // Inserting first upgrades the transaction to the single writer
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO login_attempt (identifier, ip_address, success, attempted_at)
             VALUES (?1, ?2, 0, ?3)
             RETURNING id",
        )
        .bind(identifier)
        .bind(ip_address)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        // Includes the row just claimed
        let failures = failure_count_in(&mut tx, identifier, ip_address, since).await?;
        if failures <= i64::from(self.max_failures) {
            tx.commit().await?;
            return Ok(AttemptSlot { id });
        }

        tx.rollback().await?;

        let retry_after = self.retry_after(identifier, ip_address, now).await?;
        tracing::warn!(identifier, ip_address, failures = failures - 1, "Login locked out");
        metrics::record_login_attempt("rate_limited");

        Err(CoreError::RateLimited { retry_after })
    }

    /// Turn a claimed attempt into a success
    pub async fn mark_success(&self, slot: AttemptSlot) -> CoreResult<()> {
        let mut conn = self.db.acquire().await?;
        Self::mark_success_in(&mut conn, slot).await
    }

    /// Turn a claimed attempt into a success as part of a caller's transaction
    pub(crate) async fn mark_success_in(conn: &mut SqliteConnection, slot: AttemptSlot) -> CoreResult<()> {
        sqlx::query("UPDATE login_attempt SET success = 1 WHERE id = ?1")
            .bind(slot.id)
            .execute(&mut *conn)
            .await?;

        Ok(())
    }

    /// The lockout lifts once the max_failures-th most recent failure leaves the window
    async fn retry_after(
        &self,
        identifier: &str,
        ip_address: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<std::time::Duration> {
        let oldest_counted: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT attempted_at FROM login_attempt
             WHERE (identifier = ?1 OR ip_address = ?2) AND success = 0 AND attempted_at > ?3
             ORDER BY attempted_at DESC
             LIMIT 1 OFFSET ?4",
        )
        .bind(identifier)
        .bind(ip_address)
        .bind(now - self.window)
        .bind(i64::from(self.max_failures) - 1)
        .fetch_optional(&self.db)
        .await?;

        Ok(oldest_counted
            .map(|at| (at + self.window - now).to_std().unwrap_or_default())
            .unwrap_or_else(|| self.window.to_std().unwrap_or_default()))
    }

    /// Failed attempts for the identifier or IP inside the current window
    pub async fn failure_count(&self, identifier: &str, ip_address: &str) -> CoreResult<i64> {
        let since = self.clock.now() - self.window;
        let mut conn = self.db.acquire().await?;
        failure_count_in(&mut conn, identifier, ip_address, since).await
    }

    /// Delete attempts that have left the window and can no longer lock anyone out
    pub async fn prune_attempts(&self) -> CoreResult<u64> {
        let since = self.clock.now() - self.window;
        let result = sqlx::query("DELETE FROM login_attempt WHERE attempted_at <= ?1")
            .bind(since)
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected())
    }
}

async fn failure_count_in(
    conn: &mut SqliteConnection,
    identifier: &str,
    ip_address: &str,
    since: DateTime<Utc>,
) -> CoreResult<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM login_attempt
         WHERE (identifier = ?1 OR ip_address = ?2) AND success = 0 AND attempted_at > ?3",
    )
    .bind(identifier)
    .bind(ip_address)
    .bind(since)
    .fetch_one(&mut *conn)
    .await?;

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::ManualClock, db};
    use chrono::TimeZone;
    use tempfile::TempDir;

    async fn create_test_guard() -> (Arc<LoginGuard>, ManualClock, TempDir) {
        let dir = TempDir::new().unwrap();
        let pool = db::create_pool(&dir.path().join("guard.sqlite"), db::DatabaseOptions::default())
            .await
            .unwrap();
        db::run_migrations(&pool).await.unwrap();

        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap());
        let guard = LoginGuard::new(pool, Arc::new(clock.clone()), 5, Duration::minutes(30));
        (Arc::new(guard), clock, dir)
    }

    #[tokio::test]
    async fn test_locks_after_threshold() {
        let (guard, clock, _dir) = create_test_guard().await;

        for i in 0..5 {
            if i > 0 {
                clock.advance(Duration::minutes(1));
            }
            guard.begin_attempt("a@x.com", "10.0.0.1").await.unwrap();
        }

        match guard.begin_attempt("a@x.com", "10.0.0.1").await {
            Err(CoreError::RateLimited { retry_after }) => {
                // First failure was at 09:00, now is 09:04, window is 30 minutes
                assert_eq!(retry_after.as_secs(), 26 * 60);
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }

        // Refused attempts are not claimed
        assert_eq!(guard.failure_count("a@x.com", "10.0.0.1").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_ip_failures_lock_other_identifiers() {
        let (guard, _clock, _dir) = create_test_guard().await;

        for i in 0..5 {
            let identifier = format!("user{}@x.com", i);
            guard.begin_attempt(&identifier, "10.0.0.9").await.unwrap();
        }

        assert!(matches!(
            guard.begin_attempt("fresh@x.com", "10.0.0.9").await,
            Err(CoreError::RateLimited { .. })
        ));
        guard.begin_attempt("fresh@x.com", "10.0.0.10").await.unwrap();
    }

    #[tokio::test]
    async fn test_window_slides() {
        let (guard, clock, _dir) = create_test_guard().await;

        for _ in 0..5 {
            guard.begin_attempt("b@x.com", "10.0.0.2").await.unwrap();
        }
        assert!(guard.begin_attempt("b@x.com", "10.0.0.2").await.is_err());

        clock.advance(Duration::minutes(31));
        guard.begin_attempt("b@x.com", "10.0.0.2").await.unwrap();
        assert_eq!(guard.failure_count("b@x.com", "10.0.0.2").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_successes_do_not_count() {
        let (guard, _clock, _dir) = create_test_guard().await;

        for _ in 0..10 {
            let slot = guard.begin_attempt("c@x.com", "10.0.0.3").await.unwrap();
            guard.mark_success(slot).await.unwrap();
        }
        guard.begin_attempt("c@x.com", "10.0.0.3").await.unwrap();
        assert_eq!(guard.failure_count("c@x.com", "10.0.0.3").await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_attempts_admit_at_most_threshold() {
        let (guard, _clock, _dir) = create_test_guard().await;

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let guard = Arc::clone(&guard);
                tokio::spawn(async move { guard.begin_attempt("e@x.com", "10.0.0.5").await })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => admitted += 1,
                Err(CoreError::RateLimited { .. }) => {}
                Err(e) => panic!("unexpected error: {:?}", e),
            }
        }

        assert_eq!(admitted, 5);
        assert_eq!(guard.failure_count("e@x.com", "10.0.0.5").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_prune_keeps_attempts_inside_window() {
        let (guard, clock, _dir) = create_test_guard().await;

        guard.begin_attempt("d@x.com", "10.0.0.4").await.unwrap();
        clock.advance(Duration::minutes(20));
        guard.begin_attempt("d@x.com", "10.0.0.4").await.unwrap();
        clock.advance(Duration::minutes(15));

        assert_eq!(guard.prune_attempts().await.unwrap(), 1);
        assert_eq!(guard.failure_count("d@x.com", "10.0.0.4").await.unwrap(), 1);
    }
}
