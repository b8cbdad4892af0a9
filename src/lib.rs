/// SmokeFree core - identity and subscription lifecycle
///
/// Accounts and credentials, login lockout, token issuance, activation,
/// sessions, the subscription ledger and the expiration reconciler that keeps
/// roles in step with paid coverage.

pub mod account;
pub mod auth;
pub mod clock;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod jobs;
pub mod mailer;
pub mod metrics;
pub mod notification;
pub mod subscription;

pub use context::{AppContext, Collaborators};
pub use error::{CoreError, CoreResult};
