//! Relational store backed by SQLite.
//!
//! Holds users, their Telegram links, and e-mail change requests. The
//! schema is applied inline via `include_str!` every time a store is opened;
//! all statements are idempotent.

pub mod change_requests;

use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::auth::{AccessToken, CredentialResolver, UserIdentity};

pub use self::change_requests::{ChangeRequest, ChangeStatus, Transition};

/// Schema applied on open.
const SCHEMA_SQL: &str = include_str!("../../migrations/001_schema.sql");

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The e-mail address already belongs to another user.
    #[error("e-mail address is already registered")]
    EmailTaken,

    /// No user row with the given id.
    #[error("user {0} not found")]
    UserNotFound(i64),

    /// A column held a value the code does not understand.
    #[error("invalid {field} value: {value:?}")]
    InvalidValue {
        /// Which column contained the bad value.
        field: &'static str,
        /// The unexpected value.
        value: String,
    },
}

impl StoreError {
    /// Map unique-constraint violations on `users.email` to [`StoreError::EmailTaken`].
    fn from_write(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                if db.message().contains("email") {
                    Self::EmailTaken
                } else {
                    Self::Database(err)
                }
            }
            _ => Self::Database(err),
        }
    }
}

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

/// A Telegram account linked to a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelegramUser {
    /// Telegram user id.
    pub telegram_id: i64,
    /// Telegram username at registration time.
    pub username: String,
    /// Linked `users.id`.
    pub user_id: i64,
}

/// Result of a registration attempt.
#[derive(Debug)]
pub enum Registration {
    /// A new user was created with a fresh token.
    Created {
        /// New `users.id`.
        user_id: i64,
        /// The token generated for the user.
        token: AccessToken,
    },
    /// The Telegram account was already linked; nothing changed.
    AlreadyRegistered {
        /// Existing `users.id`.
        user_id: i64,
    },
}

/// Render a timestamp the way it is stored (RFC 3339, microseconds, `Z`).
///
/// The fixed width keeps lexical order equal to chronological order.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp.
///
/// # Errors
///
/// Returns [`StoreError::InvalidValue`] if the text is not RFC 3339.
pub fn parse_timestamp(field: &'static str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| StoreError::InvalidValue {
            field,
            value: raw.to_owned(),
        })
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Handle to the filemailer database.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the database at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema fails.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .pragma("trusted_schema", "OFF")
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open database at {}", path.display()))?;

        let store = Self::from_pool(pool)
            .await
            .context("failed to apply database schema")?;
        info!(path = %path.display(), "database opened");
        Ok(store)
    }

    /// Wrap an existing pool, applying the schema first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the schema cannot be applied.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Create a user for a Telegram account, or report that one exists.
    ///
    /// User insert and Telegram link happen in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::EmailTaken`] if another user owns `email`.
    pub async fn register_telegram_user(
        &self,
        telegram_id: i64,
        username: &str,
        email: &str,
    ) -> Result<Registration, StoreError> {
        if let Some(existing) = self.telegram_user(telegram_id).await? {
            return Ok(Registration::AlreadyRegistered {
                user_id: existing.user_id,
            });
        }

        let token = AccessToken::generate();
        let mut tx = self.pool.begin().await?;

        let (user_id,): (i64,) =
            sqlx::query_as("INSERT INTO users (email, api_key) VALUES (?1, ?2) RETURNING id")
                .bind(email)
                .bind(token.expose())
                .fetch_one(&mut *tx)
                .await
                .map_err(StoreError::from_write)?;

        sqlx::query("INSERT INTO telegram_users (telegram_id, username, user_id) VALUES (?1, ?2, ?3)")
            .bind(telegram_id)
            .bind(username)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(user_id, telegram_id, "user registered");
        Ok(Registration::Created { user_id, token })
    }

    /// Look up the Telegram link for a Telegram account.
    pub async fn telegram_user(&self, telegram_id: i64) -> Result<Option<TelegramUser>, StoreError> {
        let row: Option<(i64, String, i64)> = sqlx::query_as(
            "SELECT telegram_id, username, user_id FROM telegram_users WHERE telegram_id = ?1",
        )
        .bind(telegram_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(telegram_id, username, user_id)| TelegramUser {
            telegram_id,
            username,
            user_id,
        }))
    }

    /// Resolve a token to its user.
    pub async fn resolve_token(
        &self,
        token: &AccessToken,
    ) -> Result<Option<UserIdentity>, StoreError> {
        let row: Option<(i64, Option<String>)> = sqlx::query_as(
            "SELECT users.id, telegram_users.username \
             FROM users \
             LEFT JOIN telegram_users ON telegram_users.user_id = users.id \
             WHERE users.api_key = ?1",
        )
        .bind(token.expose())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(user_id, username)| UserIdentity {
            user_id,
            username: username.unwrap_or_default(),
        }))
    }

    /// Current e-mail of a user.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UserNotFound`] when the row is missing.
    pub async fn get_email(&self, user_id: i64) -> Result<String, StoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT email FROM users WHERE id = ?1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|(email,)| email)
            .ok_or(StoreError::UserNotFound(user_id))
    }

    /// Token of a user.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UserNotFound`] when the row is missing.
    pub async fn get_token(&self, user_id: i64) -> Result<AccessToken, StoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT api_key FROM users WHERE id = ?1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        let (raw,) = row.ok_or(StoreError::UserNotFound(user_id))?;
        AccessToken::parse(&raw).ok_or(StoreError::InvalidValue {
            field: "api_key",
            value: "[REDACTED]".to_owned(),
        })
    }
}

#[async_trait]
impl CredentialResolver for Store {
    async fn resolve(&self, token: &AccessToken) -> Result<Option<UserIdentity>, StoreError> {
        self.resolve_token(token).await
    }

    async fn email_of(&self, user_id: i64) -> Result<String, StoreError> {
        self.get_email(user_id).await
    }
}
