/// Argon2id password hashing
///
/// Hashing is deliberately expensive, so both hashing and verification run on
/// tokio's blocking pool instead of the async workers.
use crate::{
    config::PasswordHashConfig,
    error::{CoreError, CoreResult},
};
use argon2::{
    password_hash::{PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use rand::RngCore;
use std::sync::Arc;

#[derive(Clone)]
pub struct PasswordHasher {
    params: Params,
    /// Verified against when the account does not exist or its stored hash is
    /// unreadable, so those paths cost the same as a wrong password.
    dummy_hash: Arc<str>,
}

impl PasswordHasher {
    pub fn new(config: &PasswordHashConfig) -> CoreResult<Self> {
        let params = Params::new(config.memory_kib, config.iterations, config.parallelism, None)
            .map_err(|e| CoreError::Internal(format!("Invalid Argon2 parameters: {}", e)))?;

        let mut seed = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut seed);
        let dummy_hash = hash_with(&params, &hex::encode(seed))?;

        Ok(Self {
            params,
            dummy_hash: Arc::from(dummy_hash),
        })
    }

    /// Hash a password with a fresh random salt
    pub async fn hash(&self, plain: &str) -> CoreResult<String> {
        let params = self.params.clone();
        let plain = plain.to_string();

        tokio::task::spawn_blocking(move || hash_with(&params, &plain))
            .await
            .map_err(|e| CoreError::Internal(format!("Password hashing task failed: {}", e)))?
    }

    /// Verify a password against a stored PHC string.
    ///
    /// Never errors on bad input: a malformed hash verifies as `false` after
    /// doing the same amount of work as a real comparison.
    pub async fn verify(&self, plain: &str, hash: &str) -> CoreResult<bool> {
        let plain = plain.to_string();
        let hash = hash.to_string();
        let dummy = Arc::clone(&self.dummy_hash);

        tokio::task::spawn_blocking(move || verify_with(&plain, &hash, &dummy))
            .await
            .map_err(|e| CoreError::Internal(format!("Password verification task failed: {}", e)))
    }

    /// Burn one verification for an identifier that has no account
    pub async fn verify_unknown(&self, plain: &str) -> CoreResult<()> {
        let dummy = Arc::clone(&self.dummy_hash);
        self.verify(plain, &dummy).await.map(|_| ())
    }
}

fn hash_with(params: &Params, plain: &str) -> CoreResult<String> {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    let salt = SaltString::encode_b64(&salt)
        .map_err(|e| CoreError::Internal(format!("Salt encoding failed: {}", e)))?;

    Argon2::new(Algorithm::Argon2id, Version::V0x13, params.clone())
        .hash_password(plain.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| CoreError::Internal(format!("Password hashing failed: {}", e)))
}

fn verify_with(plain: &str, hash: &str, dummy: &str) -> bool {
    // Parameters come from the PHC string, so old hashes keep verifying
    // after the configured work factor changes.
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(plain.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => {
            if let Ok(parsed) = PasswordHash::new(dummy) {
                let _ = Argon2::default().verify_password(plain.as_bytes(), &parsed);
            }
            false
        }
    }
}
