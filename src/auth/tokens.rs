/// Access and refresh token issuance
///
/// Access tokens are HS256 JWTs carrying the account id and role. They are
/// validated from the signature and `exp` alone and cannot be revoked.
/// Refresh tokens are opaque random values; only their SHA-256 digest is
/// stored, in a single column per account, so issuing one overwrites the last.
use crate::{
    account::{CredentialStore, Role},
    auth::{generate_opaque_token, token_digest},
    clock::Clock,
    config::{AuthConfig, RefreshPolicy},
    db::account::Account,
    error::{CoreError, CoreResult},
    metrics,
};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::sync::Arc;
use uuid::Uuid;

/// Access token claims
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Account id
    pub sub: i64,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

/// A freshly minted token and when it stops working
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of redeeming a refresh token
#[derive(Debug, Clone)]
pub struct Redemption {
    pub account: Account,
    /// Replacement refresh token when the policy rotates on use
    pub refresh_token: Option<IssuedToken>,
}

pub struct TokenIssuer {
    db: SqlitePool,
    clock: Arc<dyn Clock>,
    config: AuthConfig,
}

impl TokenIssuer {
    pub fn new(db: SqlitePool, clock: Arc<dyn Clock>, config: AuthConfig) -> Self {
        Self { db, clock, config }
    }

    fn access_ttl(&self, remember_me: bool) -> Duration {
        if remember_me {
            Duration::seconds(self.config.remember_me_access_token_ttl_secs)
        } else {
            Duration::seconds(self.config.access_token_ttl_secs)
        }
    }

    fn refresh_ttl(&self, remember_me: bool) -> Duration {
        if remember_me {
            Duration::days(self.config.remember_me_refresh_token_ttl_days)
        } else {
            Duration::days(self.config.refresh_token_ttl_days)
        }
    }

    /// Mint a signed access token for an account
    pub fn issue_access_token(&self, account: &Account, remember_me: bool) -> CoreResult<IssuedToken> {
        let now = self.clock.now();
        let expires_at = now + self.access_ttl(remember_me);

        let claims = AccessClaims {
            sub: account.id,
            role: account.role,
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.config.jwt_secret.as_bytes()),
        )
        .map_err(|e| CoreError::Internal(format!("Failed to generate token: {}", e)))?;

        Ok(IssuedToken { token, expires_at })
    }

    /// Verify signature and expiry.
    ///
    /// `TokenInvalid` means the client must log in again, `TokenExpired` means
    /// it can silently refresh.
    pub fn verify_access_token(&self, token: &str) -> CoreResult<AccessClaims> {
        let claims = self.decode_claims(token)?;

        if claims.exp <= self.clock.now().timestamp() {
            return Err(CoreError::TokenExpired);
        }

        Ok(claims)
    }

    /// Verify the signature only. Used where an expired token still proves who
    /// the caller was, such as logout.
    pub fn decode_ignoring_expiry(&self, token: &str) -> CoreResult<AccessClaims> {
        self.decode_claims(token)
    }

    fn decode_claims(&self, token: &str) -> CoreResult<AccessClaims> {
        // Expiry is compared against the injected clock, not the system time
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.leeway = 0;

        decode::<AccessClaims>(
            token,
            &DecodingKey::from_secret(self.config.jwt_secret.as_bytes()),
            &validation,
        )
        .map(|data| data.claims)
        .map_err(|e| {
            tracing::debug!("Access token rejected: {}", e);
            CoreError::TokenInvalid
        })
    }

    /// Issue a refresh token, replacing whatever the account held before
    pub async fn issue_refresh_token(&self, account_id: i64, remember_me: bool) -> CoreResult<IssuedToken> {
        let now = self.clock.now();
        let mut tx = self.db.begin().await?;
        crate::db::lock_account(&mut tx, account_id, now).await?;
        let issued = self.store_refresh_token_in(&mut tx, account_id, remember_me, now).await?;
        tx.commit().await?;
        Ok(issued)
    }

    /// Overwrite the stored refresh token inside a caller's transaction
    pub(crate) async fn store_refresh_token_in(
        &self,
        conn: &mut SqliteConnection,
        account_id: i64,
        remember_me: bool,
        now: DateTime<Utc>,
    ) -> CoreResult<IssuedToken> {
        let token = generate_opaque_token();
        let expires_at = now + self.refresh_ttl(remember_me);

        let result = sqlx::query(
            "UPDATE account SET refresh_token_hash = ?1, refresh_expires_at = ?2 WHERE id = ?3",
        )
        .bind(token_digest(&token))
        .bind(expires_at)
        .bind(account_id)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::AccountNotFound);
        }

        Ok(IssuedToken { token, expires_at })
    }

    /// Redeem a refresh token.
    ///
    /// Under [`RefreshPolicy::Rotate`] the match and replacement happen in one
    /// compare-and-swap statement, so two concurrent redemptions of the same
    /// token cannot both succeed. The replacement keeps the original expiry.
    /// Tokens held by a deactivated account are refused and left untouched.
    pub async fn redeem_refresh_token(&self, token: &str) -> CoreResult<Redemption> {
        let now = self.clock.now();
        let presented = token_digest(token);
        let mut tx = self.db.begin().await?;

        let (account_id, refresh_token) = match self.config.refresh_policy {
            RefreshPolicy::Rotate => {
                let replacement = generate_opaque_token();
                let row = sqlx::query(
                    "UPDATE account SET refresh_token_hash = ?1, updated_at = ?2
                     WHERE refresh_token_hash = ?3 AND refresh_expires_at > ?2
                     RETURNING id, refresh_expires_at",
                )
                .bind(token_digest(&replacement))
                .bind(now)
                .bind(&presented)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(CoreError::RefreshInvalid)?;

                let account_id: i64 = row.try_get("id")?;
                let expires_at: DateTime<Utc> = row.try_get("refresh_expires_at")?;
                (
                    account_id,
                    Some(IssuedToken {
                        token: replacement,
                        expires_at,
                    }),
                )
            }
            RefreshPolicy::Reuse => {
                let account_id: i64 = sqlx::query_scalar(
                    "SELECT id FROM account WHERE refresh_token_hash = ?1 AND refresh_expires_at > ?2",
                )
                .bind(&presented)
                .bind(now)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(CoreError::RefreshInvalid)?;
                (account_id, None)
            }
        };

        let account = CredentialStore::get_account_in(&mut tx, account_id).await?;
        if !account.is_active {
            // Roll back so a rotation never lands on an account that cannot use it
            tx.rollback().await?;
            return Err(CoreError::RefreshInvalid);
        }
        tx.commit().await?;

        metrics::record_token_refresh(refresh_token.is_some());
        Ok(Redemption {
            account,
            refresh_token,
        })
    }

    /// Clear the stored refresh token. Returns whether one was present.
    pub async fn revoke_refresh_token(&self, account_id: i64) -> CoreResult<bool> {
        let result = sqlx::query(
            "UPDATE account SET refresh_token_hash = NULL, refresh_expires_at = NULL, updated_at = ?1
             WHERE id = ?2 AND refresh_token_hash IS NOT NULL",
        )
        .bind(self.clock.now())
        .bind(account_id)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Cleanup expired refresh tokens
    ///
    /// Run periodically; expired tokens are already unusable, this only frees
    /// the unique index slots.
    pub async fn cleanup_expired_refresh_tokens(&self) -> CoreResult<u64> {
        let result = sqlx::query(
            "UPDATE account SET refresh_token_hash = NULL, refresh_expires_at = NULL
             WHERE refresh_token_hash IS NOT NULL AND refresh_expires_at <= ?1",
        )
        .bind(self.clock.now())
        .execute(&self.db)
        .await?;

        let cleared = result.rows_affected();
        if cleared > 0 {
            tracing::info!(cleared, "Cleaned up expired refresh tokens");
        } else {
            tracing::debug!("Refresh token cleanup: no expired tokens found");
        }

        Ok(cleared)
    }
}
