/// Credential store backed by SQLite runtime queries
use crate::{
    account::{Identifier, PasswordHasher, Role},
    clock::Clock,
    db::{
        self,
        account::{Account, LoginHistoryEntry, ACCOUNT_COLUMNS},
    },
    error::{is_unique_violation, CoreError, CoreResult},
};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::sync::Arc;

/// Input for account creation. Identifiers must already be normalized.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub password: String,
    pub role: Role,
    pub is_active: bool,
    /// Digest and expiry of a pending activation token
    pub activation: Option<(String, DateTime<Utc>)>,
}

/// Account persistence and secret verification
pub struct CredentialStore {
    db: SqlitePool,
    hasher: PasswordHasher,
    clock: Arc<dyn Clock>,
}

impl CredentialStore {
    pub fn new(db: SqlitePool, hasher: PasswordHasher, clock: Arc<dyn Clock>) -> Self {
        Self { db, hasher, clock }
    }

    /// Create a new account.
    ///
    /// Fails with `IdentifierTaken` when the email or phone number is already
    /// registered, including when a concurrent registration wins the race.
    pub async fn create_account(&self, input: NewAccount) -> CoreResult<Account> {
        if input.email.is_none() && input.phone_number.is_none() {
            return Err(CoreError::Validation(
                "Either email or phone number is required".to_string(),
            ));
        }

        if let Some(ref email) = input.email {
            if self.identifier_exists(&Identifier::Email(email.clone())).await? {
                return Err(CoreError::IdentifierTaken(email.clone()));
            }
        }

        if let Some(ref phone) = input.phone_number {
            if self.identifier_exists(&Identifier::Phone(phone.clone())).await? {
                return Err(CoreError::IdentifierTaken(phone.clone()));
            }
        }

        let password_hash = self.hasher.hash(&input.password).await?;
        let now = self.clock.now();
        let (activation_hash, activation_expires) = match input.activation {
            Some((hash, expires)) => (Some(hash), Some(expires)),
            None => (None, None),
        };

        let result = sqlx::query(
            "INSERT INTO account (email, phone_number, password_hash, first_name, last_name, role,
                                  is_active, email_verified, activation_token_hash, activation_expires_at,
                                  created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
        )
        .bind(&input.email)
        .bind(&input.phone_number)
        .bind(&password_hash)
        .bind(&input.first_name)
        .bind(&input.last_name)
        .bind(input.role.as_str())
        .bind(input.is_active)
        .bind(false)
        .bind(&activation_hash)
        .bind(activation_expires)
        .bind(now)
        .execute(&self.db)
        .await;

        let id = match result {
            Ok(done) => done.last_insert_rowid(),
            Err(e) if is_unique_violation(&e) => {
                let taken = input
                    .email
                    .clone()
                    .or_else(|| input.phone_number.clone())
                    .unwrap_or_default();
                return Err(CoreError::IdentifierTaken(taken));
            }
            Err(e) => return Err(e.into()),
        };

        tracing::info!(account_id = id, role = %input.role, active = input.is_active, "Account created");

        Ok(Account {
            id,
            email: input.email,
            phone_number: input.phone_number,
            password_hash,
            first_name: input.first_name,
            last_name: input.last_name,
            role: input.role,
            is_active: input.is_active,
            email_verified: false,
            last_login_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Get account by id
    pub async fn get_account(&self, account_id: i64) -> CoreResult<Account> {
        let sql = format!("SELECT {} FROM account WHERE id = ?1", ACCOUNT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(account_id)
            .fetch_optional(&self.db)
            .await?
            .ok_or(CoreError::AccountNotFound)?;

        Account::from_row(&row)
    }

    /// Same as [`get_account`](Self::get_account) but inside an open transaction
    pub async fn get_account_in(
        conn: &mut SqliteConnection,
        account_id: i64,
    ) -> CoreResult<Account> {
        let sql = format!("SELECT {} FROM account WHERE id = ?1", ACCOUNT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(account_id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or(CoreError::AccountNotFound)?;

        Account::from_row(&row)
    }

    /// Find account by normalized email or phone number
    pub async fn find_by_identifier(&self, identifier: &Identifier) -> CoreResult<Option<Account>> {
        let sql = format!(
            "SELECT {} FROM account WHERE {} = ?1",
            ACCOUNT_COLUMNS,
            identifier.column()
        );
        let row = sqlx::query(&sql)
            .bind(identifier.as_str())
            .fetch_optional(&self.db)
            .await?;

        row.as_ref().map(Account::from_row).transpose()
    }

    async fn identifier_exists(&self, identifier: &Identifier) -> CoreResult<bool> {
        let sql = format!(
            "SELECT COUNT(*) AS count FROM account WHERE {} = ?1",
            identifier.column()
        );
        let row = sqlx::query(&sql)
            .bind(identifier.as_str())
            .fetch_one(&self.db)
            .await?;

        let count: i64 = row.try_get("count")?;
        Ok(count > 0)
    }

    /// Check a plaintext secret against an account's stored hash
    pub async fn verify_secret(&self, plain: &str, hash: &str) -> CoreResult<bool> {
        self.hasher.verify(plain, hash).await
    }

    /// Spend the same verification cost for an identifier with no account
    pub async fn verify_unknown(&self, plain: &str) -> CoreResult<()> {
        self.hasher.verify_unknown(plain).await
    }

    /// Replace the password hash. Revokes the stored refresh token so other
    /// sessions must log in again.
    pub async fn update_password(&self, account_id: i64, new_password: &str) -> CoreResult<()> {
        let password_hash = self.hasher.hash(new_password).await?;
        let now = self.clock.now();

        let mut tx = self.db.begin().await?;
        db::lock_account(&mut tx, account_id, now).await?;

        sqlx::query(
            "UPDATE account
             SET password_hash = ?1, refresh_token_hash = NULL, refresh_expires_at = NULL
             WHERE id = ?2",
        )
        .bind(&password_hash)
        .bind(account_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(account_id, "Password changed, refresh token revoked");
        Ok(())
    }

    /// Administratively set a role
    pub async fn set_role(&self, account_id: i64, role: Role) -> CoreResult<Account> {
        let now = self.clock.now();
        let result = sqlx::query("UPDATE account SET role = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(role.as_str())
            .bind(now)
            .bind(account_id)
            .execute(&self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::AccountNotFound);
        }

        tracing::info!(account_id, role = %role, "Role updated");
        self.get_account(account_id).await
    }

    /// Most recent successful logins, newest first
    pub async fn login_history(
        &self,
        account_id: i64,
        limit: i64,
    ) -> CoreResult<Vec<LoginHistoryEntry>> {
        let rows = sqlx::query(
            "SELECT id, account_id, ip_address, user_agent, logged_in_at
             FROM login_history
             WHERE account_id = ?1
             ORDER BY logged_in_at DESC, id DESC
             LIMIT ?2",
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(LoginHistoryEntry::from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::SystemClock, config::PasswordHashConfig};
    use tempfile::TempDir;

    async fn create_test_store() -> (CredentialStore, SqlitePool, TempDir) {
        let dir = TempDir::new().unwrap();
        let pool = db::create_pool(&dir.path().join("store.sqlite"), db::DatabaseOptions::default())
            .await
            .unwrap();
        db::run_migrations(&pool).await.unwrap();

        let hasher = PasswordHasher::new(&PasswordHashConfig {
            memory_kib: 1024,
            iterations: 1,
            parallelism: 1,
        })
        .unwrap();

        let store = CredentialStore::new(pool.clone(), hasher, Arc::new(SystemClock));
        (store, pool, dir)
    }

    fn new_account(email: Option<&str>, phone: Option<&str>) -> NewAccount {
        NewAccount {
            email: email.map(str::to_string),
            phone_number: phone.map(str::to_string),
            first_name: "Lan".to_string(),
            last_name: "Nguyen".to_string(),
            password: "breathe-easy-7!".to_string(),
            role: Role::Guest,
            is_active: true,
            activation: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_find_account() {
        let (store, _pool, _dir) = create_test_store().await;

        let account = store
            .create_account(new_account(Some("lan@smokefree.vn"), None))
            .await
            .unwrap();
        assert_eq!(account.role, Role::Guest);
        assert_ne!(account.password_hash, "breathe-easy-7!");

        let found = store
            .find_by_identifier(&Identifier::Email("lan@smokefree.vn".to_string()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, account.id);
        assert!(store
            .verify_secret("breathe-easy-7!", &found.password_hash)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_identifiers_rejected() {
        let (store, _pool, _dir) = create_test_store().await;

        store
            .create_account(new_account(Some("dup@smokefree.vn"), Some("0901234567")))
            .await
            .unwrap();

        let by_email = store
            .create_account(new_account(Some("dup@smokefree.vn"), None))
            .await;
        assert!(matches!(by_email, Err(CoreError::IdentifierTaken(_))));

        let by_phone = store
            .create_account(new_account(None, Some("0901234567")))
            .await;
        assert!(matches!(by_phone, Err(CoreError::IdentifierTaken(_))));
    }

    #[tokio::test]
    async fn test_requires_identifier() {
        let (store, _pool, _dir) = create_test_store().await;
        let result = store.create_account(new_account(None, None)).await;
        assert!(matches!(result, Err(CoreError::Validation(_))));
    }

    #[tokio::test]
    async fn test_update_password_revokes_refresh_token() {
        let (store, pool, _dir) = create_test_store().await;
        let account = store
            .create_account(new_account(None, Some("0907654321")))
            .await
            .unwrap();

        sqlx::query("UPDATE account SET refresh_token_hash = 'abc', refresh_expires_at = ?1 WHERE id = ?2")
            .bind(Utc::now())
            .bind(account.id)
            .execute(&pool)
            .await
            .unwrap();

        store.update_password(account.id, "new-secret-8#").await.unwrap();

        let refresh: Option<String> =
            sqlx::query_scalar("SELECT refresh_token_hash FROM account WHERE id = ?1")
                .bind(account.id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert!(refresh.is_none());

        let updated = store.get_account(account.id).await.unwrap();
        assert!(store.verify_secret("new-secret-8#", &updated.password_hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_set_role() {
        let (store, _pool, _dir) = create_test_store().await;
        let account = store
            .create_account(new_account(Some("coach@smokefree.vn"), None))
            .await
            .unwrap();

        let updated = store.set_role(account.id, Role::Coach).await.unwrap();
        assert_eq!(updated.role, Role::Coach);

        assert!(matches!(
            store.set_role(9999, Role::Admin).await,
            Err(CoreError::AccountNotFound)
        ));
    }
}
