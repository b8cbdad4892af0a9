/// Session orchestration: register, login, refresh, logout
use crate::{
    account::{
        check_password_policy, CredentialStore, Identifier, LoginRequest, NewAccount,
        RegisterRequest, Role,
    },
    auth::{AccessClaims, ActivationFlow, IssuedToken, LoginGuard, TokenIssuer},
    clock::Clock,
    config::CoreConfig,
    db::{self, account::Account},
    error::{CoreError, CoreResult},
    metrics,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Token pair bound to one account at issuance time
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub account: Account,
    pub access_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_token: String,
    pub refresh_expires_at: DateTime<Utc>,
}

/// Result of a registration
#[derive(Debug, Clone)]
pub enum RegisterOutcome {
    /// Activation mail sent; the account cannot log in yet
    PendingActivation { account: Account },
    /// Account is active and already holds a session
    Active { session: Session },
}

impl RegisterOutcome {
    pub fn account(&self) -> &Account {
        match self {
            RegisterOutcome::PendingActivation { account } => account,
            RegisterOutcome::Active { session } => &session.account,
        }
    }
}

pub struct SessionManager {
    db: SqlitePool,
    store: Arc<CredentialStore>,
    guard: Arc<LoginGuard>,
    tokens: Arc<TokenIssuer>,
    activation: Arc<ActivationFlow>,
    clock: Arc<dyn Clock>,
    config: Arc<CoreConfig>,
}

impl SessionManager {
    pub fn new(
        db: SqlitePool,
        store: Arc<CredentialStore>,
        guard: Arc<LoginGuard>,
        tokens: Arc<TokenIssuer>,
        activation: Arc<ActivationFlow>,
        clock: Arc<dyn Clock>,
        config: Arc<CoreConfig>,
    ) -> Self {
        Self {
            db,
            store,
            guard,
            tokens,
            activation,
            clock,
            config,
        }
    }

    /// Register a new account.
    ///
    /// Email registrations go through activation unless the request or the
    /// configuration opts out. Phone-only registrations are active at once.
    pub async fn register(&self, request: RegisterRequest) -> CoreResult<RegisterOutcome> {
        let (email, phone_number) = request.normalized_identifiers()?;

        let needs_activation = email.is_some()
            && request
                .require_activation
                .unwrap_or(self.config.activation.required);
        let pending = needs_activation.then(|| self.activation.new_token());

        let account = self
            .store
            .create_account(NewAccount {
                email,
                phone_number,
                first_name: request.first_name.trim().to_string(),
                last_name: request.last_name.trim().to_string(),
                password: request.password,
                role: Role::Guest,
                is_active: !needs_activation,
                activation: pending
                    .as_ref()
                    .map(|p| (p.digest.clone(), p.expires_at)),
            })
            .await?;

        metrics::record_registration(needs_activation);

        if let Some(pending) = pending {
            self.activation
                .send_activation_mail(&account, &pending.token)
                .await;
            return Ok(RegisterOutcome::PendingActivation { account });
        }

        let session = self.open_session(account, false).await?;
        Ok(RegisterOutcome::Active { session })
    }

    /// Authenticate with an identifier and secret.
    ///
    /// Unknown identifiers and wrong secrets both fail with
    /// `InvalidCredentials`. Lockout and activation state are only revealed
    /// in that order: lockout before anything is checked, activation after
    /// the secret verified. The attempt is claimed as a failure before the
    /// secret is hashed and only becomes a success once the session commits.
    pub async fn login(&self, request: LoginRequest) -> CoreResult<Session> {
        self.with_timeout("login", self.login_inner(&request)).await
    }

    async fn login_inner(&self, request: &LoginRequest) -> CoreResult<Session> {
        let identifier = Identifier::parse(&request.identifier).ok();
        let attempt_key = identifier
            .as_ref()
            .map(|id| id.as_str().to_string())
            .unwrap_or_else(|| request.identifier.trim().to_lowercase());
        let ip = request.ip_address.as_str();

        let slot = self.guard.begin_attempt(&attempt_key, ip).await?;

        let account = match identifier {
            Some(ref id) => self.store.find_by_identifier(id).await?,
            None => None,
        };

        let Some(account) = account else {
            self.store.verify_unknown(&request.password).await?;
            metrics::record_login_attempt("invalid_credentials");
            return Err(CoreError::InvalidCredentials);
        };

        if !self
            .store
            .verify_secret(&request.password, &account.password_hash)
            .await?
        {
            metrics::record_login_attempt("invalid_credentials");
            return Err(CoreError::InvalidCredentials);
        }

        if !account.is_active {
            // The secret was right, so this counts as a successful attempt
            self.guard.mark_success(slot).await?;
            metrics::record_login_attempt("not_activated");
            return Err(CoreError::AccountNotActivated);
        }

        let now = self.clock.now();
        let mut tx = self.db.begin().await?;
        db::lock_account(&mut tx, account.id, now).await?;

        LoginGuard::mark_success_in(&mut tx, slot).await?;

        sqlx::query("UPDATE account SET last_login_at = ?1 WHERE id = ?2")
            .bind(now)
            .bind(account.id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO login_history (account_id, ip_address, user_agent, logged_in_at)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(account.id)
        .bind(ip)
        .bind(&request.user_agent)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let refresh = self
            .tokens
            .store_refresh_token_in(&mut tx, account.id, request.remember_me, now)
            .await?;

        // Re-read under the lock so the access token carries the current role
        let account = CredentialStore::get_account_in(&mut tx, account.id).await?;
        tx.commit().await?;

        let access = self.tokens.issue_access_token(&account, request.remember_me)?;

        tracing::info!(account_id = account.id, ip, "Login succeeded");
        metrics::record_login_attempt("success");

        Ok(Session {
            account,
            access_token: access.token,
            access_expires_at: access.expires_at,
            refresh_token: refresh.token,
            refresh_expires_at: refresh.expires_at,
        })
    }

    /// Exchange a refresh token for a new access token (and, when rotating,
    /// a new refresh token that replaces the presented one)
    pub async fn refresh(&self, refresh_token: &str) -> CoreResult<Session> {
        self.with_timeout("refresh", self.refresh_inner(refresh_token))
            .await
    }

    async fn refresh_inner(&self, refresh_token: &str) -> CoreResult<Session> {
        let redemption = self.tokens.redeem_refresh_token(refresh_token).await?;
        let access = self.tokens.issue_access_token(&redemption.account, false)?;

        let refresh = match redemption.refresh_token {
            Some(rotated) => rotated,
            None => {
                // Reuse policy: hand the same token back with its stored expiry
                let expires_at: DateTime<Utc> =
                    sqlx::query_scalar("SELECT refresh_expires_at FROM account WHERE id = ?1")
                        .bind(redemption.account.id)
                        .fetch_optional(&self.db)
                        .await?
                        .ok_or(CoreError::RefreshInvalid)?;

                IssuedToken {
                    token: refresh_token.to_string(),
                    expires_at,
                }
            }
        };

        Ok(Session {
            account: redemption.account,
            access_token: access.token,
            access_expires_at: access.expires_at,
            refresh_token: refresh.token,
            refresh_expires_at: refresh.expires_at,
        })
    }

    /// Clear the refresh token of whoever the access token names.
    ///
    /// Never fails. An absent, malformed or foreign token is ignored; an
    /// expired one still identifies the account. Returns whether a stored
    /// refresh token was actually cleared.
    pub async fn logout(&self, access_token: Option<&str>) -> bool {
        let Some(token) = access_token else {
            return false;
        };

        let claims = match self.tokens.decode_ignoring_expiry(token) {
            Ok(claims) => claims,
            Err(_) => {
                tracing::debug!("Logout with unreadable access token, nothing to revoke");
                return false;
            }
        };

        match self.tokens.revoke_refresh_token(claims.sub).await {
            Ok(cleared) => {
                tracing::info!(account_id = claims.sub, cleared, "Logged out");
                cleared
            }
            Err(e) => {
                tracing::warn!(account_id = claims.sub, "Failed to revoke refresh token on logout: {}", e);
                false
            }
        }
    }

    /// Verify an access token presented by a caller
    pub fn authenticate(&self, access_token: &str) -> CoreResult<AccessClaims> {
        self.tokens.verify_access_token(access_token)
    }

    /// Change password after re-verifying the current one. Other sessions
    /// lose their refresh token.
    pub async fn change_password(
        &self,
        account_id: i64,
        current_password: &str,
        new_password: &str,
    ) -> CoreResult<()> {
        if new_password.chars().count() < 8 {
            return Err(CoreError::Validation(
                "Password must be at least 8 characters".to_string(),
            ));
        }
        check_password_policy(new_password)?;

        let account = self.store.get_account(account_id).await?;
        if !self
            .store
            .verify_secret(current_password, &account.password_hash)
            .await?
        {
            return Err(CoreError::InvalidCredentials);
        }

        self.store.update_password(account_id, new_password).await
    }

    /// Issue a full token pair without the login bookkeeping
    async fn open_session(&self, account: Account, remember_me: bool) -> CoreResult<Session> {
        let refresh = self
            .tokens
            .issue_refresh_token(account.id, remember_me)
            .await?;
        let access = self.tokens.issue_access_token(&account, remember_me)?;

        Ok(Session {
            account,
            access_token: access.token,
            access_expires_at: access.expires_at,
            refresh_token: refresh.token,
            refresh_expires_at: refresh.expires_at,
        })
    }

    async fn with_timeout<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = CoreResult<T>>,
    ) -> CoreResult<T> {
        let limit = Duration::from_secs(self.config.request_timeout_secs);
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => {
                // Dropping the future rolls back any open transaction
                tracing::warn!(operation, "Storage deadline exceeded");
                metrics::record_error("timeout", operation);
                Err(CoreError::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::token_digest,
        config::RefreshPolicy,
        context::testing::{register_active, register_request, TestContext},
    };

    fn login_request(identifier: &str, password: &str) -> LoginRequest {
        LoginRequest {
            identifier: identifier.to_string(),
            password: password.to_string(),
            remember_me: false,
            ip_address: "203.0.113.7".to_string(),
            user_agent: Some("tests".to_string()),
        }
    }

    #[tokio::test]
    async fn test_register_rejects_taken_identifiers() {
        let t = TestContext::new().await;
        register_active(&t, "dup@smokefree.vn").await;

        let again = t
            .ctx
            .sessions
            .register(register_request("  DUP@smokefree.vn "))
            .await;
        assert!(matches!(again, Err(CoreError::IdentifierTaken(_))));
    }

    #[tokio::test]
    async fn test_phone_registration_is_active_immediately() {
        let t = TestContext::new().await;
        let request = RegisterRequest {
            email: None,
            phone_number: Some("0901 234 567".to_string()),
            ..register_request("unused@smokefree.vn")
        };

        let outcome = t.ctx.sessions.register(request).await.unwrap();
        assert!(matches!(outcome, RegisterOutcome::Active { .. }));
        assert_eq!(outcome.account().role, Role::Guest);
        assert!(t.mailer.sent().is_empty());

        let session = t
            .ctx
            .sessions
            .login(login_request("090-123-4567", "Quit$moking1"))
            .await
            .unwrap();
        assert_eq!(session.account.phone_number.as_deref(), Some("0901234567"));
    }

    #[tokio::test]
    async fn test_login_records_history() {
        let t = TestContext::new().await;
        let account = register_active(&t, "hist@smokefree.vn").await;

        let session = t
            .ctx
            .sessions
            .login(login_request("Hist@SmokeFree.vn", "Quit$moking1"))
            .await
            .unwrap();
        assert_eq!(session.account.last_login_at, Some(t.clock_now()));

        let claims = t.ctx.sessions.authenticate(&session.access_token).unwrap();
        assert_eq!(claims.sub, account.id);
        assert_eq!(claims.role, Role::Guest);

        let history = t.ctx.credential_store.login_history(account.id, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].ip_address, "203.0.113.7");
    }

    #[tokio::test]
    async fn test_unknown_and_wrong_password_look_alike() {
        let t = TestContext::new().await;
        register_active(&t, "real@smokefree.vn").await;

        let unknown = t
            .ctx
            .sessions
            .login(login_request("ghost@smokefree.vn", "Quit$moking1"))
            .await;
        let wrong = t
            .ctx
            .sessions
            .login(login_request("real@smokefree.vn", "Wrong$pass1"))
            .await;

        assert!(matches!(unknown, Err(CoreError::InvalidCredentials)));
        assert!(matches!(wrong, Err(CoreError::InvalidCredentials)));
    }

    #[tokio::test]
    async fn test_rotation_revokes_presented_token() {
        let t = TestContext::new().await;
        register_active(&t, "rotate@smokefree.vn").await;
        let session = t
            .ctx
            .sessions
            .login(login_request("rotate@smokefree.vn", "Quit$moking1"))
            .await
            .unwrap();

        t.clock.advance(chrono::Duration::minutes(5));
        let refreshed = t.ctx.sessions.refresh(&session.refresh_token).await.unwrap();
        assert_ne!(refreshed.refresh_token, session.refresh_token);
        assert_eq!(refreshed.refresh_expires_at, session.refresh_expires_at);

        assert!(matches!(
            t.ctx.sessions.refresh(&session.refresh_token).await,
            Err(CoreError::RefreshInvalid)
        ));
        t.ctx.sessions.refresh(&refreshed.refresh_token).await.unwrap();
    }

    #[tokio::test]
    async fn test_reuse_policy_keeps_token() {
        let t = TestContext::with_config(|config| {
            config.authentication.refresh_policy = RefreshPolicy::Reuse;
        })
        .await;
        register_active(&t, "reuse@smokefree.vn").await;
        let session = t
            .ctx
            .sessions
            .login(login_request("reuse@smokefree.vn", "Quit$moking1"))
            .await
            .unwrap();

        let first = t.ctx.sessions.refresh(&session.refresh_token).await.unwrap();
        let second = t.ctx.sessions.refresh(&session.refresh_token).await.unwrap();
        assert_eq!(first.refresh_token, session.refresh_token);
        assert_eq!(second.refresh_expires_at, session.refresh_expires_at);

        t.clock.advance(chrono::Duration::days(8));
        assert!(matches!(
            t.ctx.sessions.refresh(&session.refresh_token).await,
            Err(CoreError::RefreshInvalid)
        ));
    }

    #[tokio::test]
    async fn test_logout_never_fails() {
        let t = TestContext::new().await;
        register_active(&t, "bye@smokefree.vn").await;
        let session = t
            .ctx
            .sessions
            .login(login_request("bye@smokefree.vn", "Quit$moking1"))
            .await
            .unwrap();

        assert!(!t.ctx.sessions.logout(None).await);
        assert!(!t.ctx.sessions.logout(Some("not.a.jwt")).await);

        // Expired access token still names the account
        t.clock.advance(chrono::Duration::hours(2));
        assert!(t.ctx.sessions.logout(Some(&session.access_token)).await);
        assert!(!t.ctx.sessions.logout(Some(&session.access_token)).await);

        assert!(matches!(
            t.ctx.sessions.refresh(&session.refresh_token).await,
            Err(CoreError::RefreshInvalid)
        ));
    }

    #[tokio::test]
    async fn test_change_password() {
        let t = TestContext::new().await;
        let account = register_active(&t, "change@smokefree.vn").await;
        let session = t
            .ctx
            .sessions
            .login(login_request("change@smokefree.vn", "Quit$moking1"))
            .await
            .unwrap();

        assert!(matches!(
            t.ctx
                .sessions
                .change_password(account.id, "Wrong$pass1", "N3w$ecret!")
                .await,
            Err(CoreError::InvalidCredentials)
        ));
        assert!(matches!(
            t.ctx
                .sessions
                .change_password(account.id, "Quit$moking1", "short")
                .await,
            Err(CoreError::Validation(_))
        ));

        t.ctx
            .sessions
            .change_password(account.id, "Quit$moking1", "N3w$ecret!")
            .await
            .unwrap();

        assert!(matches!(
            t.ctx.sessions.refresh(&session.refresh_token).await,
            Err(CoreError::RefreshInvalid)
        ));
        t.ctx
            .sessions
            .login(login_request("change@smokefree.vn", "N3w$ecret!"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_remember_me_extends_refresh_ttl() {
        let t = TestContext::new().await;
        register_active(&t, "remember@smokefree.vn").await;
        let now = t.clock_now();

        let short = t
            .ctx
            .sessions
            .login(login_request("remember@smokefree.vn", "Quit$moking1"))
            .await
            .unwrap();
        assert_eq!(short.refresh_expires_at, now + chrono::Duration::days(7));
        assert_eq!(short.access_expires_at, now + chrono::Duration::hours(1));

        let long = t
            .ctx
            .sessions
            .login(LoginRequest {
                remember_me: true,
                ..login_request("remember@smokefree.vn", "Quit$moking1")
            })
            .await
            .unwrap();
        assert_eq!(long.refresh_expires_at, now + chrono::Duration::days(30));
        assert_eq!(long.access_expires_at, now + chrono::Duration::days(1));

        // Rotation keeps the longer expiry
        let refreshed = t.ctx.sessions.refresh(&long.refresh_token).await.unwrap();
        assert_eq!(refreshed.refresh_expires_at, long.refresh_expires_at);
    }

    #[tokio::test]
    async fn test_timed_out_login_is_not_a_success() {
        let t = TestContext::with_config(|config| config.request_timeout_secs = 1).await;
        let account = register_active(&t, "slow@smokefree.vn").await;
        let other = register_active(&t, "busy@smokefree.vn").await;

        // Another writer holds the database past the deadline
        let mut blocker = t.ctx.db.begin().await.unwrap();
        db::lock_account(&mut blocker, other.id, t.clock_now()).await.unwrap();

        let result = t
            .ctx
            .sessions
            .login(login_request("slow@smokefree.vn", "Quit$moking1"))
            .await;
        assert!(matches!(result, Err(CoreError::Timeout)));

        blocker.rollback().await.unwrap();

        let successes: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM login_attempt WHERE success = 1")
                .fetch_one(&t.ctx.db)
                .await
                .unwrap();
        assert_eq!(successes, 0);
        let stored = t.ctx.credential_store.get_account(account.id).await.unwrap();
        assert_eq!(stored.last_login_at, None);

        // Once the writer is gone the same login goes through
        t.ctx
            .sessions
            .login(login_request("slow@smokefree.vn", "Quit$moking1"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_refresh_refused_for_deactivated_account() {
        let t = TestContext::new().await;
        let account = register_active(&t, "gone@smokefree.vn").await;
        let session = t
            .ctx
            .sessions
            .login(login_request("gone@smokefree.vn", "Quit$moking1"))
            .await
            .unwrap();

        sqlx::query("UPDATE account SET is_active = 0 WHERE id = ?1")
            .bind(account.id)
            .execute(&t.ctx.db)
            .await
            .unwrap();

        assert!(matches!(
            t.ctx.sessions.refresh(&session.refresh_token).await,
            Err(CoreError::RefreshInvalid)
        ));

        // The stored token was not rotated away
        let stored: Option<String> =
            sqlx::query_scalar("SELECT refresh_token_hash FROM account WHERE id = ?1")
                .bind(account.id)
                .fetch_one(&t.ctx.db)
                .await
                .unwrap();
        assert_eq!(stored, Some(token_digest(&session.refresh_token)));
    }
}
