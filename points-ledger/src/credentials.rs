//! Registration input rules and password hashing

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use rand::rngs::OsRng;
use serde::Deserialize;

use crate::{types::AccountId, Error, Result};

/// Shortest accepted password
pub const MIN_PASSWORD_LEN: usize = 4;
/// Longest accepted password
pub const MAX_PASSWORD_LEN: usize = 20;
/// Shortest accepted display name, after trimming
pub const MIN_NAME_LEN: usize = 2;

/// Raw registration form
#[derive(Debug, Clone, Deserialize)]
pub struct Registration {
    /// Requested account id
    pub account_id: String,
    /// Display name
    pub name: String,
    /// Password
    pub password: String,
    /// Password confirmation
    pub confirm: String,
}

/// Registration that passed every input rule
#[derive(Debug, Clone)]
pub struct ValidRegistration {
    /// Account id
    pub account_id: AccountId,
    /// Trimmed display name
    pub name: String,
    /// Password
    pub password: String,
}

fn is_valid_password(password: &str) -> bool {
    (MIN_PASSWORD_LEN..=MAX_PASSWORD_LEN).contains(&password.len())
        && password
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

impl Registration {
    /// Check the form
    pub fn validate(&self) -> Result<ValidRegistration> {
        let account_id = AccountId::parse(&self.account_id)?;

        let name = self.name.trim();
        if name.chars().count() < MIN_NAME_LEN {
            return Err(Error::validation(format!(
                "name must be at least {} characters",
                MIN_NAME_LEN
            )));
        }

        if !is_valid_password(&self.password) {
            return Err(Error::validation(format!(
                "password must be {}-{} characters of letters, digits, '_' or '-'",
                MIN_PASSWORD_LEN, MAX_PASSWORD_LEN
            )));
        }
        if self.password != self.confirm {
            return Err(Error::validation("password confirmation does not match"));
        }

        Ok(ValidRegistration {
            account_id,
            name: name.to_string(),
            password: self.password.clone(),
        })
    }
}

/// Argon2 PHC string for `password`
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| Error::Storage(format!("password hashing failed: {}", e)))
}

/// Whether `password` matches the PHC string `stored`. Unparseable hashes
/// never match.
pub fn verify_password(password: &str, stored: &str) -> bool {
    match PasswordHash::new(stored) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}
