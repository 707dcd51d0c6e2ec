//! Credential verification seam
//!
//! The plugins never store or compare raw secrets themselves; they hand the
//! supplied password and the configured principal to a [`CredentialVerifier`]
//! the host wires at startup.

use crate::config::PasswordHasher;
use async_trait::async_trait;

/// Checks a supplied password against a stored credential
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    /// Verify `password` against `stored` (whatever format the host uses)
    async fn verify(&self, stored: &str, password: &str) -> bool;
}

/// Default verifier: argon2 PHC strings or sha256 hex digests
pub struct ConfigCredentialVerifier;

#[async_trait]
impl CredentialVerifier for ConfigCredentialVerifier {
    async fn verify(&self, stored: &str, password: &str) -> bool {
        if stored.starts_with("$argon2") {
            use argon2::{Argon2, PasswordHash, PasswordVerifier};
            match PasswordHash::new(stored) {
                Ok(hash) => Argon2::default()
                    .verify_password(password.as_bytes(), &hash)
                    .is_ok(),
                Err(_) => false,
            }
        } else {
            PasswordHasher::verify_password(password, stored)
        }
    }
}
