/// Membership plans, payments and the subscription ledger

mod ledger;
mod payment;
mod plans;

pub use ledger::SubscriptionLedger;
pub use payment::{ChargeReceipt, ChargeRequest, MockPaymentGateway, PaymentGateway};
pub use plans::{NewPlan, PlanCatalog};

use crate::{
    account::Role,
    db::subscription::{MembershipPlan, Membership},
    error::{CoreError, CoreResult},
    metrics,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use std::fmt;
use std::str::FromStr;

/// Membership lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipStatus {
    Active,
    Expired,
    /// No longer renewing; access lasts until `end_at`
    Cancelled,
}

impl MembershipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipStatus::Active => "active",
            MembershipStatus::Expired => "expired",
            MembershipStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for MembershipStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s {
            "active" => Ok(MembershipStatus::Active),
            "expired" => Ok(MembershipStatus::Expired),
            "cancelled" => Ok(MembershipStatus::Cancelled),
            _ => Err(CoreError::Validation(format!("Invalid membership status: {}", s))),
        }
    }
}

impl fmt::Display for MembershipStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a plan was paid for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    CreditCard,
    BankTransfer,
    EWallet,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::CreditCard => "credit_card",
            PaymentMethod::BankTransfer => "bank_transfer",
            PaymentMethod::EWallet => "e_wallet",
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "credit_card" | "card" => Ok(PaymentMethod::CreditCard),
            "bank_transfer" | "transfer" => Ok(PaymentMethod::BankTransfer),
            "e_wallet" | "ewallet" => Ok(PaymentMethod::EWallet),
            _ => Err(CoreError::Validation(format!("Invalid payment method: {}", s))),
        }
    }
}

/// The membership currently granting access, with its plan
#[derive(Debug, Clone, Serialize)]
pub struct ActiveMembership {
    pub membership: Membership,
    pub plan: MembershipPlan,
    /// Whole days left, rounded up
    pub days_remaining: i64,
}

/// Role together with whether a membership currently covers the account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemberStatus {
    pub role: Role,
    pub has_active_membership: bool,
}

/// Apply a role transition to an account inside an open transaction.
///
/// Returns the `(from, to)` pair when the role actually changed.
pub(crate) async fn apply_role_transition(
    conn: &mut SqliteConnection,
    account_id: i64,
    now: DateTime<Utc>,
    transition: fn(Role) -> Role,
) -> CoreResult<Option<(Role, Role)>> {
    let current: String = sqlx::query_scalar("SELECT role FROM account WHERE id = ?1")
        .bind(account_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(CoreError::AccountNotFound)?;

    let from: Role = current.parse()?;
    let to = transition(from);
    if from == to {
        return Ok(None);
    }

    sqlx::query("UPDATE account SET role = ?1, updated_at = ?2 WHERE id = ?3")
        .bind(to.as_str())
        .bind(now)
        .bind(account_id)
        .execute(&mut *conn)
        .await?;

    tracing::info!(account_id, from = %from, to = %to, "Role changed");
    metrics::record_role_change(from.as_str(), to.as_str());

    Ok(Some((from, to)))
}

/// Whether any membership still covers the account at `at`
pub(crate) async fn has_coverage(
    conn: &mut SqliteConnection,
    account_id: i64,
    at: DateTime<Utc>,
) -> CoreResult<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM membership
         WHERE account_id = ?1 AND status IN ('active', 'cancelled') AND end_at > ?2",
    )
    .bind(account_id)
    .bind(at)
    .fetch_one(&mut *conn)
    .await?;

    Ok(count > 0)
}
