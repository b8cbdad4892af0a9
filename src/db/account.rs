/// Account database models
use crate::{account::Role, error::CoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, Row};

/// Columns selected for an [`Account`]. Token digests are never loaded here.
pub const ACCOUNT_COLUMNS: &str = "id, email, phone_number, password_hash, first_name, last_name, \
     role, is_active, email_verified, last_login_at, created_at, updated_at";

/// Account record in the database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub role: Role,
    pub is_active: bool,
    pub email_verified: bool,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn from_row(row: &SqliteRow) -> CoreResult<Self> {
        let role: String = row.try_get("role")?;

        Ok(Self {
            id: row.try_get("id")?,
            email: row.try_get("email")?,
            phone_number: row.try_get("phone_number")?,
            password_hash: row.try_get("password_hash")?,
            first_name: row.try_get("first_name")?,
            last_name: row.try_get("last_name")?,
            role: role.parse()?,
            is_active: row.try_get("is_active")?,
            email_verified: row.try_get("email_verified")?,
            last_login_at: row.try_get("last_login_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// Successful login audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginHistoryEntry {
    pub id: i64,
    pub account_id: i64,
    pub ip_address: String,
    pub user_agent: Option<String>,
    pub logged_in_at: DateTime<Utc>,
}

impl LoginHistoryEntry {
    pub fn from_row(row: &SqliteRow) -> CoreResult<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            account_id: row.try_get("account_id")?,
            ip_address: row.try_get("ip_address")?,
            user_agent: row.try_get("user_agent")?,
            logged_in_at: row.try_get("logged_in_at")?,
        })
    }
}
