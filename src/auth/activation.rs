/// Account activation: `Unverified -> Active`, one way
use crate::{
    account::{CredentialStore, Identifier},
    auth::{generate_opaque_token, token_digest},
    clock::Clock,
    config::ActivationConfig,
    db::{self, account::Account},
    error::{CoreError, CoreResult},
    mailer::AccountMailer,
    metrics,
};
use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;

/// A generated activation token. Only `digest` is persisted.
#[derive(Debug, Clone)]
pub struct PendingActivation {
    pub token: String,
    pub digest: String,
    pub expires_at: DateTime<Utc>,
}

pub struct ActivationFlow {
    db: SqlitePool,
    store: Arc<CredentialStore>,
    mailer: Arc<dyn AccountMailer>,
    clock: Arc<dyn Clock>,
    config: ActivationConfig,
}

impl ActivationFlow {
    pub fn new(
        db: SqlitePool,
        store: Arc<CredentialStore>,
        mailer: Arc<dyn AccountMailer>,
        clock: Arc<dyn Clock>,
        config: ActivationConfig,
    ) -> Self {
        Self {
            db,
            store,
            mailer,
            clock,
            config,
        }
    }

    /// Fresh token expiring after the configured TTL
    pub fn new_token(&self) -> PendingActivation {
        let token = generate_opaque_token();
        PendingActivation {
            digest: token_digest(&token),
            expires_at: self.clock.now() + Duration::hours(self.config.token_ttl_hours),
            token,
        }
    }

    pub fn activation_link(&self, token: &str) -> String {
        format!("{}/activate/{}", self.config.frontend_url.trim_end_matches('/'), token)
    }

    /// Send the activation mail. Failures are logged, never returned: the
    /// account already exists and the user can ask for a new link.
    pub async fn send_activation_mail(&self, account: &Account, token: &str) {
        let Some(ref email) = account.email else {
            return;
        };

        let link = self.activation_link(token);
        if let Err(e) = self
            .mailer
            .send_activation(email, &account.display_name(), &link)
            .await
        {
            tracing::warn!(account_id = account.id, "Failed to send activation email: {}", e);
        }
    }

    /// Activate the account holding `token`.
    ///
    /// The token is single use: the first call clears it, later calls fail
    /// with `TokenInvalidOrExpired`. A registered token that resolves to an
    /// account which is already active succeeds without changing it.
    pub async fn activate(&self, token: &str) -> CoreResult<Account> {
        let now = self.clock.now();
        let digest = token_digest(token);

        let mut tx = self.db.begin().await?;

        // Matching the token and taking the write lock in one statement
        let row = sqlx::query(
            "UPDATE account SET updated_at = ?1
             WHERE activation_token_hash = ?2 AND activation_expires_at > ?1
             RETURNING id, is_active",
        )
        .bind(now)
        .bind(&digest)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(CoreError::TokenInvalidOrExpired)?;

        let account_id: i64 = row.try_get("id")?;
        let was_active: bool = row.try_get("is_active")?;

        sqlx::query(
            "UPDATE account
             SET is_active = 1,
                 email_verified = CASE WHEN email IS NOT NULL THEN 1 ELSE email_verified END,
                 activation_token_hash = NULL,
                 activation_expires_at = NULL
             WHERE id = ?1",
        )
        .bind(account_id)
        .execute(&mut *tx)
        .await?;

        let account = CredentialStore::get_account_in(&mut tx, account_id).await?;
        tx.commit().await?;

        if was_active {
            tracing::debug!(account_id, "Activation token used on an already active account");
            return Ok(account);
        }

        tracing::info!(account_id, "Account activated");
        metrics::record_activation("activated");

        if let Some(ref email) = account.email {
            if let Err(e) = self.mailer.send_welcome(email, &account.display_name()).await {
                tracing::warn!(account_id, "Failed to send welcome email: {}", e);
            }
        }

        Ok(account)
    }

    /// Issue a new activation token for an unactivated account and mail it.
    /// The previous token stops working because it is overwritten.
    pub async fn regenerate(&self, identifier: &str) -> CoreResult<()> {
        let identifier = Identifier::parse(identifier)?;
        let account = self
            .store
            .find_by_identifier(&identifier)
            .await?
            .ok_or(CoreError::AccountNotFound)?;

        if account.is_active {
            return Err(CoreError::AlreadyActivated);
        }

        let pending = self.new_token();
        let now = self.clock.now();

        let mut tx = self.db.begin().await?;
        db::lock_account(&mut tx, account.id, now).await?;

        // Re-check under the lock; activation may have landed in between
        let result = sqlx::query(
            "UPDATE account SET activation_token_hash = ?1, activation_expires_at = ?2
             WHERE id = ?3 AND is_active = 0",
        )
        .bind(&pending.digest)
        .bind(pending.expires_at)
        .bind(account.id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::AlreadyActivated);
        }

        tx.commit().await?;

        tracing::info!(account_id = account.id, "Activation token regenerated");
        metrics::record_activation("regenerated");

        self.send_activation_mail(&account, &pending.token).await;
        Ok(())
    }
}
