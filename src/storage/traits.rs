//! The append-log seam for storage backends.
//!
//! The log is the source of truth: every mutation of the [`ClaimStore`] is
//! written to a [`LogSink`] before any index sees it, and all indices can be
//! regenerated by replaying the log in commit order.
//!
//! [`ClaimStore`]: crate::storage::ClaimStore

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::claim::{Claim, ClaimId};
use crate::entity::{Entity, EntityId};
use crate::error::ValidationError;
use crate::gap::{Gap, GapId, ResolutionAttempt};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The record breaks a commit invariant.
    #[error("Invariant violation: {0}")]
    InvariantViolation(#[from] ValidationError),

    /// Linking `old -> new` would close a loop in the supersession graph.
    #[error("Superseding {old} with {new} would create a cycle")]
    CycleDetected {
        /// Claim being superseded.
        old: ClaimId,
        /// Claim replacing it.
        new: ClaimId,
    },

    /// Another writer won the compare-and-set on `claim`'s pointer.
    #[error("Claim {claim} is already superseded by {by}")]
    AlreadySuperseded {
        /// Claim whose pointer was contended.
        claim: ClaimId,
        /// The winning replacement.
        by: ClaimId,
    },

    /// No claim has this id.
    #[error("Claim not found: {0}")]
    ClaimNotFound(ClaimId),

    /// No entity has this id.
    #[error("Entity not found: {0}")]
    EntityNotFound(EntityId),

    /// No gap has this id.
    #[error("Gap not found: {0}")]
    GapNotFound(GapId),

    /// Key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// The log file could not be read or written.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single committed entry of the append log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Monotonically increasing commit sequence, starting at 1.
    pub sequence: u64,
    /// When the record was appended.
    pub timestamp: DateTime<Utc>,
    /// The mutation itself.
    pub kind: LogEntryKind,
}

/// The mutation a log record carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "data", rename_all = "snake_case")]
pub enum LogEntryKind {
    /// A new entity.
    EntityPut(Entity),
    /// A new claim.
    ClaimPut(Claim),
    /// `old` was superseded by `new`.
    Supersede {
        /// Claim being superseded.
        old: ClaimId,
        /// Claim replacing it.
        new: ClaimId,
    },
    /// Full gap snapshot; the latest record for an id wins on replay.
    GapPut(Gap),
    /// An audit record for a research attempt.
    AttemptRecorded(ResolutionAttempt),
}

impl LogEntryKind {
    /// Short name of the mutation, for logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::EntityPut(_) => "entity_put",
            Self::ClaimPut(_) => "claim_put",
            Self::Supersede { .. } => "supersede",
            Self::GapPut(_) => "gap_put",
            Self::AttemptRecorded(_) => "attempt_recorded",
        }
    }
}

/// Durability backend for the append log.
///
/// # Safety Considerations
/// - `append` must be durable (to the backend's standard) before returning `Ok`
/// - a failed `append` must leave no partial record that `replay` would return
pub trait LogSink: Send + Sync {
    /// Append one record.
    fn append(&self, record: &LogRecord) -> Result<(), StorageError>;

    /// Return every intact record in commit order.
    fn replay(&self) -> Result<Vec<LogRecord>, StorageError>;

    /// Short backend name for log output.
    fn name(&self) -> &'static str;
}
