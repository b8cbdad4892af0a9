/// Authentication: login guard, token issuance, activation and sessions

mod activation;
mod guard;
mod session;
mod tokens;

pub use activation::{ActivationFlow, PendingActivation};
pub use guard::{AttemptSlot, LoginGuard};
pub use session::{RegisterOutcome, Session, SessionManager};
pub use tokens::{AccessClaims, IssuedToken, Redemption, TokenIssuer};

use rand::RngCore;
use sha2::{Digest, Sha256};

/// Bytes of entropy in refresh and activation tokens
pub(crate) const OPAQUE_TOKEN_BYTES: usize = 40;

/// Generate a random opaque token, hex encoded
pub(crate) fn generate_opaque_token() -> String {
    let mut bytes = [0u8; OPAQUE_TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Storage form of an opaque token. Plaintext tokens are never persisted.
pub(crate) fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Pull the token out of an `Authorization: Bearer ...` header value
pub fn bearer_token(authorization: &str) -> Option<&str> {
    authorization
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}
