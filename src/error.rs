//! Caller-facing failure classification shared by the pipeline and approvals.

use serde::Serialize;

/// Coarse failure kind reported to callers alongside a stage tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Unknown token.
    Authorization,
    /// Unknown change request or user.
    NotFound,
    /// Change request no longer pending.
    AlreadyProcessed,
    /// Fetch transport failure or non-success remote status.
    TransientRemote,
    /// Fetched or advertised size exceeds the ceiling.
    SizeLimit,
    /// The delivery capability failed.
    Delivery,
    /// The e-mail address already belongs to another user.
    Conflict,
    /// Store state disagrees with itself, or a dependent write failed.
    InternalInconsistency,
    /// Any other local failure (scratch storage, database unavailable).
    Internal,
}

impl FailureKind {
    /// Short label for logs and HTTP bodies.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authorization => "authorization",
            Self::NotFound => "not_found",
            Self::AlreadyProcessed => "already_processed",
            Self::TransientRemote => "transient_remote",
            Self::SizeLimit => "size_limit",
            Self::Delivery => "delivery",
            Self::Conflict => "conflict",
            Self::InternalInconsistency => "internal_inconsistency",
            Self::Internal => "internal",
        }
    }
}
