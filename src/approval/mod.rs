//! E-mail change approval state machine.
//!
//! A change request starts `pending` and moves once, to `approved` or
//! `rejected`. Only the administrative chat configured at startup may
//! decide or list requests; calls from any other chat return
//! [`Decision::Ignored`] (or `None` for listings) and leave no trace for
//! the caller.
//!
//! Transitions are conditional updates in the store, so two racing
//! decisions on one id cannot both apply. Approval moves the user's
//! address in the same transaction as the status change.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};

use crate::error::FailureKind;
use crate::store::{ChangeRequest, ChangeStatus, Store, StoreError, Transition};

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// A plain-text message for one chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    /// Target chat.
    pub chat_id: i64,
    /// Message text, not markup.
    pub text: String,
    /// Request id the recipient can decide from this message, if any.
    pub decide: Option<i64>,
}

/// Outbound channel for approval notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one notice.
    async fn notify(&self, notice: &Notice) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Errors and outcomes
// ---------------------------------------------------------------------------

/// Errors from approval operations.
#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    /// The requesting Telegram account is not linked to a user.
    #[error("you are not registered")]
    NotRegistered,

    /// No request with this id.
    #[error("change request {0} not found")]
    NotFound(i64),

    /// The request already left `pending`.
    #[error("change request {id} was already {status}")]
    AlreadyProcessed {
        /// Request id.
        id: i64,
        /// Terminal status it holds.
        status: ChangeStatus,
    },

    /// Another user owns the proposed address; the request stays pending.
    #[error("e-mail address is already registered")]
    EmailTaken,

    /// The decision could not be applied consistently.
    #[error("change request {id} could not be applied: {reason}")]
    Inconsistent {
        /// Request id.
        id: i64,
        /// Underlying failure.
        reason: String,
    },

    /// Store failure outside a decision.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApprovalError {
    /// Caller-facing failure kind.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::NotRegistered | Self::NotFound(_) => FailureKind::NotFound,
            Self::AlreadyProcessed { .. } => FailureKind::AlreadyProcessed,
            Self::EmailTaken => FailureKind::Conflict,
            Self::Inconsistent { .. } => FailureKind::InternalInconsistency,
            Self::Store(_) => FailureKind::Internal,
        }
    }
}

/// Outcome of an admin-only call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The transition happened; holds the updated request.
    Applied(ChangeRequest),
    /// The caller is not the administrative chat. Nothing happened.
    Ignored,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Drives change requests through their lifecycle.
#[derive(Clone)]
pub struct ApprovalService {
    store: Store,
    notifier: Arc<dyn Notifier>,
    admin_chat_id: i64,
}

impl std::fmt::Debug for ApprovalService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalService")
            .field("admin_chat_id", &self.admin_chat_id)
            .finish_non_exhaustive()
    }
}

impl ApprovalService {
    /// Create a service deciding from `admin_chat_id`.
    pub fn new(store: Store, notifier: Arc<dyn Notifier>, admin_chat_id: i64) -> Self {
        Self {
            store,
            notifier,
            admin_chat_id,
        }
    }

    /// `true` if `chat_id` is the administrative chat.
    pub fn is_admin(&self, chat_id: i64) -> bool {
        chat_id == self.admin_chat_id
    }

    /// Record a pending change for the user linked to `telegram_id` and
    /// tell the administrators how to decide it.
    ///
    /// `new_email` is stored as given.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::NotRegistered`] if the account has no user.
    pub async fn create_request(
        &self,
        telegram_id: i64,
        chat_id: i64,
        new_email: &str,
    ) -> Result<ChangeRequest, ApprovalError> {
        let requester = self
            .store
            .telegram_user(telegram_id)
            .await?
            .ok_or(ApprovalError::NotRegistered)?;

        let request = match self
            .store
            .insert_change_request(requester.user_id, chat_id, new_email, Utc::now())
            .await
        {
            Ok(request) => request,
            Err(StoreError::UserNotFound(_)) => return Err(ApprovalError::NotRegistered),
            Err(e) => return Err(e.into()),
        };
        info!(id = request.id, user_id = request.user_id, "change request created");

        let who = if requester.username.is_empty() {
            format!("user {}", request.user_id)
        } else {
            format!("@{}", requester.username)
        };
        self.send(Notice {
            chat_id: self.admin_chat_id,
            text: format!(
                "E-mail change request #{id} from {who}\n\
                 {old} -> {new}\n\n\
                 /approve {id}\n\
                 /reject {id}",
                id = request.id,
                old = request.old_email,
                new = request.new_email,
            ),
            decide: Some(request.id),
        })
        .await;

        Ok(request)
    }

    /// Approve a pending request and move the user to the new address.
    ///
    /// # Errors
    ///
    /// [`ApprovalError::NotFound`], [`ApprovalError::AlreadyProcessed`],
    /// [`ApprovalError::EmailTaken`] (request stays pending), or
    /// [`ApprovalError::Inconsistent`] when the store cannot apply it.
    pub async fn approve(&self, id: i64, actor_chat_id: i64) -> Result<Decision, ApprovalError> {
        if !self.is_admin(actor_chat_id) {
            return Ok(Decision::Ignored);
        }

        let transition = match self.store.approve_change_request(id, Utc::now()).await {
            Ok(transition) => transition,
            Err(StoreError::EmailTaken) => return Err(ApprovalError::EmailTaken),
            Err(e) => {
                error!(id, error = %e, "change request approval failed");
                return Err(ApprovalError::Inconsistent {
                    id,
                    reason: e.to_string(),
                });
            }
        };
        let request = settle(id, transition)?;
        info!(id, user_id = request.user_id, "change request approved");

        self.send(Notice {
            chat_id: request.requester_chat_id,
            text: format!(
                "Your e-mail change was approved. Files will now be sent to {}.",
                request.new_email
            ),
            decide: None,
        })
        .await;

        Ok(Decision::Applied(request))
    }

    /// Reject a pending request. The user record is untouched.
    ///
    /// # Errors
    ///
    /// [`ApprovalError::NotFound`] or [`ApprovalError::AlreadyProcessed`].
    pub async fn reject(&self, id: i64, actor_chat_id: i64) -> Result<Decision, ApprovalError> {
        if !self.is_admin(actor_chat_id) {
            return Ok(Decision::Ignored);
        }

        let transition = self.store.reject_change_request(id, Utc::now()).await?;
        let request = settle(id, transition)?;
        info!(id, user_id = request.user_id, "change request rejected");

        self.send(Notice {
            chat_id: request.requester_chat_id,
            text: format!(
                "Your request to change your e-mail to {} was rejected.",
                request.new_email
            ),
            decide: None,
        })
        .await;

        Ok(Decision::Applied(request))
    }

    /// Pending requests, newest first. `None` for non-admin callers.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::Store`] if the query fails.
    pub async fn list_pending(
        &self,
        actor_chat_id: i64,
    ) -> Result<Option<Vec<ChangeRequest>>, ApprovalError> {
        if !self.is_admin(actor_chat_id) {
            return Ok(None);
        }
        Ok(Some(self.store.pending_change_requests().await?))
    }

    /// Notification failures never undo a committed transition.
    async fn send(&self, notice: Notice) {
        if let Err(e) = self.notifier.notify(&notice).await {
            warn!(chat_id = notice.chat_id, error = %e, "failed to deliver approval notice");
        }
    }
}

fn settle(id: i64, transition: Transition) -> Result<ChangeRequest, ApprovalError> {
    match transition {
        Transition::Applied(request) => Ok(request),
        Transition::AlreadyProcessed(request) => Err(ApprovalError::AlreadyProcessed {
            id,
            status: request.status,
        }),
        Transition::NotFound => Err(ApprovalError::NotFound(id)),
    }
}
