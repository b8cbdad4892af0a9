/// Membership plan, membership and payment models
use crate::{
    error::{CoreError, CoreResult},
    subscription::{MembershipStatus, PaymentMethod},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, Row};

/// Membership plan reference data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipPlan {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    /// Price in the smallest currency unit
    pub price: i64,
    pub duration_days: i64,
    pub features: Vec<String>,
}

impl MembershipPlan {
    pub fn from_row(row: &SqliteRow) -> CoreResult<Self> {
        let features: String = row.try_get("features")?;
        let features = serde_json::from_str(&features)
            .map_err(|e| CoreError::Internal(format!("Corrupt plan features: {}", e)))?;

        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            price: row.try_get("price")?,
            duration_days: row.try_get("duration_days")?,
            features,
        })
    }

    pub fn duration(&self) -> chrono::Duration {
        chrono::Duration::days(self.duration_days)
    }
}

/// Membership record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Membership {
    pub id: i64,
    pub account_id: i64,
    pub plan_id: i64,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub status: MembershipStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Membership {
    pub fn from_row(row: &SqliteRow) -> CoreResult<Self> {
        let status: String = row.try_get("status")?;

        Ok(Self {
            id: row.try_get("id")?,
            account_id: row.try_get("account_id")?,
            plan_id: row.try_get("plan_id")?,
            start_at: row.try_get("start_at")?,
            end_at: row.try_get("end_at")?,
            status: status.parse()?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    /// Whether this row grants paid-tier access at `at`.
    /// Cancelled memberships keep access until their end date.
    pub fn grants_access_at(&self, at: DateTime<Utc>) -> bool {
        matches!(
            self.status,
            MembershipStatus::Active | MembershipStatus::Cancelled
        ) && self.end_at > at
    }
}

/// Payment record, immutable once written
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: i64,
    pub account_id: i64,
    pub plan_id: i64,
    pub membership_id: Option<i64>,
    pub amount: i64,
    pub method: PaymentMethod,
    pub status: String,
    pub transaction_id: String,
    pub created_at: DateTime<Utc>,
}

impl PaymentRecord {
    pub fn from_row(row: &SqliteRow) -> CoreResult<Self> {
        let method: String = row.try_get("method")?;

        Ok(Self {
            id: row.try_get("id")?,
            account_id: row.try_get("account_id")?,
            plan_id: row.try_get("plan_id")?,
            membership_id: row.try_get("membership_id")?,
            amount: row.try_get("amount")?,
            method: method.parse()?,
            status: row.try_get("status")?,
            transaction_id: row.try_get("transaction_id")?,
            created_at: row.try_get("created_at")?,
        })
    }
}
