/// Unified error types for the SmokeFree identity and subscription core
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Main error type for the core
#[derive(Error, Debug)]
pub enum CoreError {
    /// Normalized email or phone number already registered
    #[error("Identifier already registered: {0}")]
    IdentifierTaken(String),

    /// Unknown identifier or wrong secret. Callers cannot tell which.
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// Too many failed attempts for the identifier or source IP
    #[error("Too many failed login attempts")]
    RateLimited { retry_after: Duration },

    #[error("Account has not been activated")]
    AccountNotActivated,

    /// Access token signature or structure is bad
    #[error("Invalid access token")]
    TokenInvalid,

    /// Access token is well formed but past its `exp`
    #[error("Access token expired")]
    TokenExpired,

    #[error("Invalid or expired refresh token")]
    RefreshInvalid,

    #[error("Invalid or expired activation token")]
    TokenInvalidOrExpired,

    #[error("Account already activated")]
    AlreadyActivated,

    #[error("Membership plan not found: {0}")]
    PlanNotFound(i64),

    #[error("No active subscription")]
    NoActiveSubscription,

    #[error("Account not found")]
    AccountNotFound,

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Charge declined by the payment gateway
    #[error("Payment failed: {0}")]
    PaymentFailed(String),

    /// Storage call exceeded the request deadline
    #[error("Request timed out")]
    Timeout,

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serializable error body for whatever transport embeds the core
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl CoreError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::IdentifierTaken(_) => "IdentifierTaken",
            CoreError::InvalidCredentials => "InvalidCredentials",
            CoreError::RateLimited { .. } => "RateLimited",
            CoreError::AccountNotActivated => "AccountNotActivated",
            CoreError::TokenInvalid => "TokenInvalid",
            CoreError::TokenExpired => "TokenExpired",
            CoreError::RefreshInvalid => "RefreshInvalid",
            CoreError::TokenInvalidOrExpired => "TokenInvalidOrExpired",
            CoreError::AlreadyActivated => "AlreadyActivated",
            CoreError::PlanNotFound(_) => "PlanNotFound",
            CoreError::NoActiveSubscription => "NoActiveSubscription",
            CoreError::AccountNotFound => "AccountNotFound",
            CoreError::Validation(_) => "InvalidRequest",
            CoreError::PaymentFailed(_) => "PaymentFailed",
            CoreError::Timeout => "Timeout",
            CoreError::Database(_)
            | CoreError::Migration(_)
            | CoreError::Internal(_)
            | CoreError::Io(_) => "InternalServerError",
        }
    }

    /// Storage and internal faults, as opposed to caller mistakes
    pub fn is_server_fault(&self) -> bool {
        matches!(
            self,
            CoreError::Database(_)
                | CoreError::Migration(_)
                | CoreError::Internal(_)
                | CoreError::Io(_)
                | CoreError::Timeout
        )
    }

    /// Message safe to hand to a client
    pub fn public_message(&self) -> String {
        match self {
            CoreError::Database(_)
            | CoreError::Migration(_)
            | CoreError::Internal(_)
            | CoreError::Io(_) => "Internal server error".to_string(), // Don't leak details
            _ => self.to_string(),
        }
    }

    pub fn to_response(&self) -> ErrorResponse {
        let retry_after_secs = match self {
            CoreError::RateLimited { retry_after } => Some(retry_after.as_secs().max(1)),
            _ => None,
        };

        ErrorResponse {
            error: self.code().to_string(),
            message: self.public_message(),
            retry_after_secs,
        }
    }
}

/// Returns true when a sqlx error is a UNIQUE constraint violation
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.is_unique_violation(),
        _ => false,
    }
}

/// Result type alias for core operations
pub type CoreResult<T> = Result<T, CoreError>;
