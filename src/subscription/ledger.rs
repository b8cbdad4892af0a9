/// Subscription ledger: subscribe, renew, cancel
///
/// The gateway is charged before any write lock is taken. The membership
/// change, the payment record and the role promotion then commit together in
/// one transaction that starts by locking the account row. A charge whose
/// transaction fails is kept as an `unapplied` payment so it can be refunded.
/// Notifications go out after commit.
use crate::{
    account::Role,
    clock::Clock,
    db::{
        self,
        subscription::{Membership, MembershipPlan, PaymentRecord},
    },
    error::{CoreError, CoreResult},
    metrics,
    notification::{notify_best_effort, NotificationKind, Notifier},
    subscription::{
        apply_role_transition, ActiveMembership, ChargeRequest, MemberStatus, PaymentGateway,
        PaymentMethod, PlanCatalog,
    },
};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::sync::Arc;

const MEMBERSHIP_COLUMNS: &str =
    "id, account_id, plan_id, start_at, end_at, status, created_at, updated_at";

/// A charge the gateway approved, waiting to be applied to a membership
struct ApprovedCharge<'a> {
    account_id: i64,
    plan: &'a MembershipPlan,
    method: PaymentMethod,
    transaction_id: String,
}

pub struct SubscriptionLedger {
    db: SqlitePool,
    plans: Arc<PlanCatalog>,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
}

impl SubscriptionLedger {
    pub fn new(
        db: SqlitePool,
        plans: Arc<PlanCatalog>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            plans,
            gateway,
            notifier,
            clock,
        }
    }

    /// Buy a plan.
    ///
    /// An existing active membership is replaced in place (new plan, start
    /// and end) rather than stacked.
    pub async fn subscribe(
        &self,
        account_id: i64,
        plan_id: i64,
        method: PaymentMethod,
    ) -> CoreResult<Membership> {
        let plan = self.plans.get_plan(plan_id).await?;
        self.ensure_account(account_id).await?;

        let charge = self.charge(account_id, &plan, method).await?;

        let now = self.clock.now();
        let end = now + plan.duration();
        let applied = self.apply_subscribe(&charge, now, end).await;
        let membership = self.settle(applied, &charge).await?;

        tracing::info!(account_id, plan_id, membership_id = membership.id, end = %end, "Subscription activated");
        metrics::record_subscription_event("subscribe");

        notify_best_effort(
            self.notifier.as_ref(),
            account_id,
            "Subscription Activated",
            &format!(
                "Your {} membership is active until {}.",
                plan.name,
                end.format("%Y-%m-%d")
            ),
            NotificationKind::Subscription,
        )
        .await;

        Ok(membership)
    }

    async fn apply_subscribe(
        &self,
        charge: &ApprovedCharge<'_>,
        now: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> CoreResult<Membership> {
        let (account_id, plan) = (charge.account_id, charge.plan);
        let mut tx = self.db.begin().await?;
        db::lock_account(&mut tx, account_id, now).await?;

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM membership WHERE account_id = ?1 AND status = 'active'",
        )
        .bind(account_id)
        .fetch_optional(&mut *tx)
        .await?;

        let membership_id = match existing {
            Some(id) => {
                sqlx::query(
                    "UPDATE membership SET plan_id = ?1, start_at = ?2, end_at = ?3, updated_at = ?2
                     WHERE id = ?4",
                )
                .bind(plan.id)
                .bind(now)
                .bind(end)
                .bind(id)
                .execute(&mut *tx)
                .await?;
                id
            }
            None => sqlx::query(
                "INSERT INTO membership (account_id, plan_id, start_at, end_at, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'active', ?3, ?3)",
            )
            .bind(account_id)
            .bind(plan.id)
            .bind(now)
            .bind(end)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid(),
        };

        insert_payment(&mut tx, charge, Some(membership_id), "completed", now).await?;
        apply_role_transition(&mut tx, account_id, now, Role::after_subscription).await?;

        let membership = fetch_membership(&mut tx, membership_id).await?;
        tx.commit().await?;
        Ok(membership)
    }

    /// Extend the active membership by its plan's duration, counted from the
    /// later of its current end and now.
    pub async fn renew(&self, account_id: i64, method: PaymentMethod) -> CoreResult<Membership> {
        let plan_id: i64 = sqlx::query_scalar(
            "SELECT plan_id FROM membership
             WHERE account_id = ?1 AND status = 'active'
             ORDER BY end_at DESC
             LIMIT 1",
        )
        .bind(account_id)
        .fetch_optional(&self.db)
        .await?
        .ok_or(CoreError::NoActiveSubscription)?;
        let plan = self.plans.get_plan(plan_id).await?;

        let charge = self.charge(account_id, &plan, method).await?;

        let now = self.clock.now();
        let applied = self.apply_renew(&charge, now).await;
        let membership = self.settle(applied, &charge).await?;

        tracing::info!(account_id, membership_id = membership.id, end = %membership.end_at, "Subscription renewed");
        metrics::record_subscription_event("renew");

        notify_best_effort(
            self.notifier.as_ref(),
            account_id,
            "Subscription Renewed",
            &format!(
                "Your {} membership has been renewed until {}.",
                plan.name,
                membership.end_at.format("%Y-%m-%d")
            ),
            NotificationKind::Subscription,
        )
        .await;

        Ok(membership)
    }

    async fn apply_renew(&self, charge: &ApprovedCharge<'_>, now: DateTime<Utc>) -> CoreResult<Membership> {
        let (account_id, plan) = (charge.account_id, charge.plan);
        let mut tx = self.db.begin().await?;
        db::lock_account(&mut tx, account_id, now).await?;

        // The charge was priced on this plan; a membership switched or
        // cancelled since then does not get the extension
        let row = sqlx::query(
            "SELECT id, end_at FROM membership
             WHERE account_id = ?1 AND status = 'active' AND plan_id = ?2
             ORDER BY end_at DESC
             LIMIT 1",
        )
        .bind(account_id)
        .bind(plan.id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(CoreError::NoActiveSubscription)?;

        let membership_id: i64 = row.try_get("id")?;
        let current_end: DateTime<Utc> = row.try_get("end_at")?;
        let new_end = current_end.max(now) + plan.duration();

        sqlx::query("UPDATE membership SET end_at = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(new_end)
            .bind(now)
            .bind(membership_id)
            .execute(&mut *tx)
            .await?;

        insert_payment(&mut tx, charge, Some(membership_id), "completed", now).await?;
        apply_role_transition(&mut tx, account_id, now, Role::after_subscription).await?;

        let membership = fetch_membership(&mut tx, membership_id).await?;
        tx.commit().await?;
        Ok(membership)
    }

    /// Pass a successful application through. When it failed after the
    /// gateway took the money, keep the charge on record before returning
    /// the error.
    async fn settle(
        &self,
        applied: CoreResult<Membership>,
        charge: &ApprovedCharge<'_>,
    ) -> CoreResult<Membership> {
        let err = match applied {
            Ok(membership) => return Ok(membership),
            Err(e) => e,
        };

        tracing::error!(
            account_id = charge.account_id,
            plan_id = charge.plan.id,
            transaction_id = %charge.transaction_id,
            "Charge succeeded but the membership change failed: {}",
            err
        );
        metrics::record_subscription_event("payment_unapplied");

        if let Err(e) = self.record_unapplied(charge).await {
            tracing::error!(
                account_id = charge.account_id,
                transaction_id = %charge.transaction_id,
                "Failed to record unapplied charge: {}",
                e
            );
        }

        Err(err)
    }

    async fn record_unapplied(&self, charge: &ApprovedCharge<'_>) -> CoreResult<()> {
        let mut conn = self.db.acquire().await?;
        insert_payment(&mut conn, charge, None, "unapplied", self.clock.now()).await
    }

    async fn ensure_account(&self, account_id: i64) -> CoreResult<()> {
        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM account WHERE id = ?1")
            .bind(account_id)
            .fetch_optional(&self.db)
            .await?;

        exists.map(|_| ()).ok_or(CoreError::AccountNotFound)
    }

    /// Stop the active membership from renewing. Access continues until its end.
    pub async fn cancel(&self, account_id: i64) -> CoreResult<Membership> {
        let now = self.clock.now();

        let mut tx = self.db.begin().await?;
        db::lock_account(&mut tx, account_id, now).await?;

        let membership_id: i64 = sqlx::query_scalar(
            "SELECT id FROM membership
             WHERE account_id = ?1 AND status = 'active' AND end_at > ?2
             ORDER BY end_at DESC
             LIMIT 1",
        )
        .bind(account_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(CoreError::NoActiveSubscription)?;

        sqlx::query("UPDATE membership SET status = 'cancelled', updated_at = ?1 WHERE id = ?2")
            .bind(now)
            .bind(membership_id)
            .execute(&mut *tx)
            .await?;

        let membership = fetch_membership(&mut tx, membership_id).await?;
        tx.commit().await?;

        tracing::info!(account_id, membership_id, "Subscription cancelled");
        metrics::record_subscription_event("cancel");

        notify_best_effort(
            self.notifier.as_ref(),
            account_id,
            "Subscription Cancelled",
            &format!(
                "Your subscription has been cancelled. You keep member access until {}.",
                membership.end_at.format("%Y-%m-%d")
            ),
            NotificationKind::Subscription,
        )
        .await;

        Ok(membership)
    }

    /// Whether the account has paid-tier access at `at`
    pub async fn has_access(&self, account_id: i64, at: DateTime<Utc>) -> CoreResult<bool> {
        let memberships = self.memberships(account_id).await?;
        Ok(memberships.iter().any(|m| m.grants_access_at(at)))
    }

    /// The membership currently granting access, preferring an active one
    pub async fn active_membership(&self, account_id: i64) -> CoreResult<Option<ActiveMembership>> {
        let now = self.clock.now();
        let sql = format!(
            "SELECT {} FROM membership
             WHERE account_id = ?1 AND status IN ('active', 'cancelled') AND end_at > ?2
             ORDER BY status = 'active' DESC, end_at DESC
             LIMIT 1",
            MEMBERSHIP_COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(account_id)
            .bind(now)
            .fetch_optional(&self.db)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let membership = Membership::from_row(&row)?;
        let plan = self.plans.get_plan(membership.plan_id).await?;
        let seconds_left = (membership.end_at - now).num_seconds();
        let days_remaining = (seconds_left + 86_399) / 86_400;

        Ok(Some(ActiveMembership {
            membership,
            plan,
            days_remaining,
        }))
    }

    pub async fn member_status(&self, account_id: i64) -> CoreResult<MemberStatus> {
        let role: String = sqlx::query_scalar("SELECT role FROM account WHERE id = ?1")
            .bind(account_id)
            .fetch_optional(&self.db)
            .await?
            .ok_or(CoreError::AccountNotFound)?;

        Ok(MemberStatus {
            role: role.parse()?,
            has_active_membership: self.has_access(account_id, self.clock.now()).await?,
        })
    }

    /// All memberships of an account, newest first
    pub async fn memberships(&self, account_id: i64) -> CoreResult<Vec<Membership>> {
        let sql = format!(
            "SELECT {} FROM membership WHERE account_id = ?1 ORDER BY created_at DESC, id DESC",
            MEMBERSHIP_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(account_id)
            .fetch_all(&self.db)
            .await?;

        rows.iter().map(Membership::from_row).collect()
    }

    /// Payments of an account, newest first
    pub async fn payment_history(&self, account_id: i64) -> CoreResult<Vec<PaymentRecord>> {
        let rows = sqlx::query(
            "SELECT id, account_id, plan_id, membership_id, amount, method, status, transaction_id, created_at
             FROM payment
             WHERE account_id = ?1
             ORDER BY created_at DESC, id DESC",
        )
        .bind(account_id)
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(PaymentRecord::from_row).collect()
    }

    async fn charge<'a>(
        &self,
        account_id: i64,
        plan: &'a MembershipPlan,
        method: PaymentMethod,
    ) -> CoreResult<ApprovedCharge<'a>> {
        let receipt = self
            .gateway
            .charge(ChargeRequest {
                account_id,
                amount: plan.price,
                method,
                description: plan.name.clone(),
            })
            .await
            .map_err(|e| {
                tracing::warn!(account_id, plan_id = plan.id, "Charge failed: {}", e);
                metrics::record_subscription_event("payment_failed");
                match e {
                    CoreError::PaymentFailed(_) => e,
                    other => CoreError::PaymentFailed(other.to_string()),
                }
            })?;

        Ok(ApprovedCharge {
            account_id,
            plan,
            method,
            transaction_id: receipt.transaction_id,
        })
    }
}

async fn insert_payment(
    conn: &mut SqliteConnection,
    charge: &ApprovedCharge<'_>,
    membership_id: Option<i64>,
    status: &str,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    sqlx::query(
        "INSERT INTO payment (account_id, plan_id, membership_id, amount, method, status, transaction_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )
    .bind(charge.account_id)
    .bind(charge.plan.id)
    .bind(membership_id)
    .bind(charge.plan.price)
    .bind(charge.method.as_str())
    .bind(status)
    .bind(&charge.transaction_id)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn fetch_membership(conn: &mut SqliteConnection, membership_id: i64) -> CoreResult<Membership> {
    let sql = format!("SELECT {} FROM membership WHERE id = ?1", MEMBERSHIP_COLUMNS);
    let row = sqlx::query(&sql)
        .bind(membership_id)
        .fetch_one(&mut *conn)
        .await?;

    Membership::from_row(&row)
}

#[cfg(test)]
mod tests {
    use crate::{
        account::Role,
        context::testing::{register_active, TestContext},
        error::CoreError,
        subscription::{MembershipStatus, PaymentMethod},
    };
    use chrono::Duration;

    #[tokio::test]
    async fn test_subscribe_promotes_guest_and_records_payment() {
        let t = TestContext::new().await;
        let account = register_active(&t, "sub@smokefree.vn").await;

        let membership = t
            .ctx
            .ledger
            .subscribe(account.id, 1, PaymentMethod::CreditCard)
            .await
            .unwrap();

        assert_eq!(membership.status, MembershipStatus::Active);
        assert_eq!(membership.end_at - membership.start_at, Duration::days(30));

        let status = t.ctx.ledger.member_status(account.id).await.unwrap();
        assert_eq!(status.role, Role::Member);
        assert!(status.has_active_membership);

        let payments = t.ctx.ledger.payment_history(account.id).await.unwrap();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].amount, 99000);
        assert_eq!(payments[0].status, "completed");
        assert_eq!(payments[0].membership_id, Some(membership.id));

        let inbox = t.ctx.notifications.list_for_account(account.id, 10).await.unwrap();
        assert_eq!(inbox[0].title, "Subscription Activated");
    }

    #[tokio::test]
    async fn test_subscribe_replaces_active_membership() {
        let t = TestContext::new().await;
        let account = register_active(&t, "upgrade@smokefree.vn").await;

        let first = t
            .ctx
            .ledger
            .subscribe(account.id, 1, PaymentMethod::EWallet)
            .await
            .unwrap();
        t.clock.advance(Duration::days(10));
        let upgraded = t
            .ctx
            .ledger
            .subscribe(account.id, 4, PaymentMethod::EWallet)
            .await
            .unwrap();

        assert_eq!(upgraded.id, first.id);
        assert_eq!(upgraded.plan_id, 4);
        assert_eq!(upgraded.start_at, t.clock_now());
        assert_eq!(upgraded.end_at, t.clock_now() + Duration::days(365));
        assert_eq!(t.ctx.ledger.memberships(account.id).await.unwrap().len(), 1);
        assert_eq!(t.ctx.ledger.payment_history(account.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_plan_and_account() {
        let t = TestContext::new().await;
        let account = register_active(&t, "noplan@smokefree.vn").await;

        assert!(matches!(
            t.ctx.ledger.subscribe(account.id, 99, PaymentMethod::CreditCard).await,
            Err(CoreError::PlanNotFound(99))
        ));
        assert!(matches!(
            t.ctx.ledger.subscribe(9999, 1, PaymentMethod::CreditCard).await,
            Err(CoreError::AccountNotFound)
        ));
    }

    #[tokio::test]
    async fn test_renew_extends_from_later_of_end_and_now() {
        let t = TestContext::new().await;
        let account = register_active(&t, "renew@smokefree.vn").await;

        let original = t
            .ctx
            .ledger
            .subscribe(account.id, 1, PaymentMethod::BankTransfer)
            .await
            .unwrap();

        // Early renewal stacks on the current end
        t.clock.advance(Duration::days(5));
        let early = t
            .ctx
            .ledger
            .renew(account.id, PaymentMethod::BankTransfer)
            .await
            .unwrap();
        assert_eq!(early.end_at, original.end_at + Duration::days(30));

        // Lapsed but not yet swept: coverage restarts from now
        t.clock.advance(Duration::days(100));
        let late = t
            .ctx
            .ledger
            .renew(account.id, PaymentMethod::BankTransfer)
            .await
            .unwrap();
        assert_eq!(late.end_at, t.clock_now() + Duration::days(30));
        assert!(late.end_at >= early.end_at);
    }

    #[tokio::test]
    async fn test_renew_without_membership() {
        let t = TestContext::new().await;
        let account = register_active(&t, "none@smokefree.vn").await;

        assert!(matches!(
            t.ctx.ledger.renew(account.id, PaymentMethod::CreditCard).await,
            Err(CoreError::NoActiveSubscription)
        ));
        assert!(matches!(
            t.ctx.ledger.cancel(account.id).await,
            Err(CoreError::NoActiveSubscription)
        ));
    }

    #[tokio::test]
    async fn test_cancel_keeps_access_until_end() {
        let t = TestContext::new().await;
        let account = register_active(&t, "cancel@smokefree.vn").await;

        let membership = t
            .ctx
            .ledger
            .subscribe(account.id, 1, PaymentMethod::CreditCard)
            .await
            .unwrap();
        let cancelled = t.ctx.ledger.cancel(account.id).await.unwrap();

        assert_eq!(cancelled.status, MembershipStatus::Cancelled);
        assert_eq!(cancelled.end_at, membership.end_at);

        let just_before_end = membership.end_at - Duration::seconds(1);
        assert!(t.ctx.ledger.has_access(account.id, just_before_end).await.unwrap());
        assert!(!t.ctx.ledger.has_access(account.id, membership.end_at).await.unwrap());

        let active = t.ctx.ledger.active_membership(account.id).await.unwrap().unwrap();
        assert_eq!(active.days_remaining, 30);

        // Nothing left to cancel or renew
        assert!(matches!(
            t.ctx.ledger.cancel(account.id).await,
            Err(CoreError::NoActiveSubscription)
        ));
    }

    #[tokio::test]
    async fn test_declined_payment_leaves_no_trace() {
        let t = TestContext::new().await;
        let account = register_active(&t, "declined@smokefree.vn").await;

        t.gateway.set_declining(true);
        let result = t
            .ctx
            .ledger
            .subscribe(account.id, 2, PaymentMethod::CreditCard)
            .await;
        assert!(matches!(result, Err(CoreError::PaymentFailed(_))));

        assert!(t.ctx.ledger.memberships(account.id).await.unwrap().is_empty());
        assert!(t.ctx.ledger.payment_history(account.id).await.unwrap().is_empty());
        let status = t.ctx.ledger.member_status(account.id).await.unwrap();
        assert_eq!(status.role, Role::Guest);
    }

    #[tokio::test]
    async fn test_subscription_never_touches_staff_roles() {
        let t = TestContext::new().await;
        let account = register_active(&t, "coach@smokefree.vn").await;
        t.ctx
            .credential_store
            .set_role(account.id, Role::Coach)
            .await
            .unwrap();

        t.ctx
            .ledger
            .subscribe(account.id, 1, PaymentMethod::CreditCard)
            .await
            .unwrap();

        let status = t.ctx.ledger.member_status(account.id).await.unwrap();
        assert_eq!(status.role, Role::Coach);
    }
}
