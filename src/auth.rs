//! Access tokens and the credential resolver seam.
//!
//! A token is 32 bytes from the operating system CSPRNG rendered as 64
//! lowercase hex characters. Tokens never appear in `Debug`/`Display` output
//! so they cannot leak into logs by accident.

use std::fmt;

use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::store::StoreError;

/// Number of random bytes in an access token.
pub const TOKEN_BYTES: usize = 32;

/// Length of the hex rendering of an access token.
pub const TOKEN_HEX_LEN: usize = 64;

/// Opaque per-user secret authorizing delivery requests.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AccessToken(String);

impl AccessToken {
    /// Draw a fresh token from the OS random source.
    pub fn generate() -> Self {
        let mut bytes = [0_u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Accept a caller-supplied token if it has the token shape.
    ///
    /// Returns `None` for anything that is not exactly 64 hex characters;
    /// such values can never resolve, so callers skip the lookup.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.len() != TOKEN_HEX_LEN || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self(trimmed.to_ascii_lowercase()))
    }

    /// The raw hex value, for storage and for handing back to its owner.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AccessToken").field(&"[REDACTED]").finish()
    }
}

impl fmt::Display for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// Generate a new access token string (64 hex chars).
pub fn generate_token() -> AccessToken {
    AccessToken::generate()
}

/// The user an access token belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    /// `users.id`.
    pub user_id: i64,
    /// Telegram username linked to the user, empty when unknown.
    pub username: String,
}

/// Maps tokens to users and users to their current e-mail address.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// Resolve a token. `Ok(None)` means the token is unknown.
    async fn resolve(&self, token: &AccessToken) -> Result<Option<UserIdentity>, StoreError>;

    /// Current e-mail address of a user.
    async fn email_of(&self, user_id: i64) -> Result<String, StoreError>;
}
