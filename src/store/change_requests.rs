//! Change-request records and their conditional status transitions.
//!
//! A request leaves `pending` exactly once. Every transition is a single
//! `UPDATE ... WHERE status = 'pending'`, so concurrent deciders race on
//! the row itself and only the first one observes a match.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{format_timestamp, parse_timestamp, Store, StoreError};

/// Lifecycle state of a change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    /// Waiting for an administrator decision.
    Pending,
    /// Applied to the user record. Terminal.
    Approved,
    /// Declined. Terminal.
    Rejected,
}

impl ChangeStatus {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised status.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(StoreError::InvalidValue {
                field: "status",
                value: other.to_owned(),
            }),
        }
    }
}

impl std::fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A proposal to change a user's e-mail address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRequest {
    /// Monotonically assigned id.
    pub id: i64,
    /// User whose address would change.
    pub user_id: i64,
    /// Chat the request came from; decisions are reported there.
    pub requester_chat_id: i64,
    /// The user's address when the request was created.
    pub old_email: String,
    /// Proposed address.
    pub new_email: String,
    /// Current state.
    pub status: ChangeStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Decision time, `None` while pending.
    pub processed_at: Option<DateTime<Utc>>,
}

/// Outcome of a conditional decision on a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The request was pending and now holds the new status.
    Applied(ChangeRequest),
    /// The request exists but had already left `pending`; nothing changed.
    AlreadyProcessed(ChangeRequest),
    /// No request with that id.
    NotFound,
}

const COLUMNS: &str = "id, user_id, requester_chat_id, old_email, new_email, status, created_at, processed_at";

type ChangeRow = (i64, i64, i64, String, String, String, String, Option<String>);

fn from_row(row: ChangeRow) -> Result<ChangeRequest, StoreError> {
    let (id, user_id, requester_chat_id, old_email, new_email, status, created_at, processed_at) =
        row;
    Ok(ChangeRequest {
        id,
        user_id,
        requester_chat_id,
        old_email,
        new_email,
        status: ChangeStatus::parse(&status)?,
        created_at: parse_timestamp("created_at", &created_at)?,
        processed_at: processed_at
            .as_deref()
            .map(|raw| parse_timestamp("processed_at", raw))
            .transpose()?,
    })
}

impl Store {
    /// Insert a pending request, snapshotting the user's current e-mail.
    ///
    /// The snapshot is taken by the insert statement itself, so it is the
    /// address at creation time.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UserNotFound`] if `user_id` has no row.
    pub async fn insert_change_request(
        &self,
        user_id: i64,
        requester_chat_id: i64,
        new_email: &str,
        created_at: DateTime<Utc>,
    ) -> Result<ChangeRequest, StoreError> {
        let sql = format!(
            "INSERT INTO change_requests \
                 (user_id, requester_chat_id, old_email, new_email, status, created_at) \
             SELECT id, ?2, email, ?3, 'pending', ?4 FROM users WHERE id = ?1 \
             RETURNING {COLUMNS}"
        );
        let row: Option<ChangeRow> = sqlx::query_as(&sql)
            .bind(user_id)
            .bind(requester_chat_id)
            .bind(new_email)
            .bind(format_timestamp(created_at))
            .fetch_optional(&self.pool)
            .await?;

        let request = from_row(row.ok_or(StoreError::UserNotFound(user_id))?)?;
        trace!(id = request.id, user_id, "change request inserted");
        Ok(request)
    }

    /// Fetch a request by id.
    pub async fn change_request(&self, id: i64) -> Result<Option<ChangeRequest>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM change_requests WHERE id = ?1");
        let row: Option<ChangeRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(from_row).transpose()
    }

    /// Snapshot of pending requests, newest first, ties by descending id.
    pub async fn pending_change_requests(&self) -> Result<Vec<ChangeRequest>, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM change_requests \
             WHERE status = 'pending' \
             ORDER BY created_at DESC, id DESC"
        );
        let rows: Vec<ChangeRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        rows.into_iter().map(from_row).collect()
    }

    /// Reject a pending request.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a statement fails.
    pub async fn reject_change_request(
        &self,
        id: i64,
        processed_at: DateTime<Utc>,
    ) -> Result<Transition, StoreError> {
        let mut tx = self.pool.begin().await?;
        let Some(request) =
            mark_processed(&mut tx, id, ChangeStatus::Rejected, processed_at).await?
        else {
            tx.rollback().await?;
            return self.settled(id).await;
        };
        tx.commit().await?;
        trace!(id, "change request rejected");
        Ok(Transition::Applied(request))
    }

    /// Approve a pending request and move the user to the new address.
    ///
    /// The status change and the user update commit together or not at all.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::EmailTaken`] if another user already owns the new
    /// address, or [`StoreError::UserNotFound`] if the request points at a
    /// missing user. The request stays pending in both cases.
    pub async fn approve_change_request(
        &self,
        id: i64,
        processed_at: DateTime<Utc>,
    ) -> Result<Transition, StoreError> {
        let mut tx = self.pool.begin().await?;
        let Some(request) =
            mark_processed(&mut tx, id, ChangeStatus::Approved, processed_at).await?
        else {
            tx.rollback().await?;
            return self.settled(id).await;
        };

        let updated = sqlx::query("UPDATE users SET email = ?1 WHERE id = ?2")
            .bind(&request.new_email)
            .bind(request.user_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from_write)?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::UserNotFound(request.user_id));
        }

        tx.commit().await?;
        trace!(id, user_id = request.user_id, "change request approved");
        Ok(Transition::Applied(request))
    }

    /// Classify an id whose conditional update matched nothing.
    async fn settled(&self, id: i64) -> Result<Transition, StoreError> {
        Ok(match self.change_request(id).await? {
            Some(request) => Transition::AlreadyProcessed(request),
            None => Transition::NotFound,
        })
    }
}

/// Move a request out of `pending`, returning the updated row if it matched.
async fn mark_processed(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    id: i64,
    status: ChangeStatus,
    processed_at: DateTime<Utc>,
) -> Result<Option<ChangeRequest>, StoreError> {
    let sql = format!(
        "UPDATE change_requests SET status = ?1, processed_at = ?2 \
         WHERE id = ?3 AND status = 'pending' \
         RETURNING {COLUMNS}"
    );
    let row: Option<ChangeRow> = sqlx::query_as(&sql)
        .bind(status.as_str())
        .bind(format_timestamp(processed_at))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
    row.map(from_row).transpose()
}
