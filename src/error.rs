//! Error types for kyrograph.
//!
//! All errors are strongly typed using thiserror and are local to a single
//! claim or a single gap: no error raised for one input ever poisons
//! unrelated fact keys or gaps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::claim::{ClaimId, FactKey};
use crate::gap::{GapId, GapState};

pub use crate::storage::StorageError;

/// Malformed input. Raised at submission, before anything is committed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    /// A required field was missing or blank.
    #[error("Required field '{field}' is missing or empty")]
    EmptyField {
        /// Name of the field.
        field: String,
    },

    /// The interval ends before it starts.
    #[error("Invalid interval: valid_from ({from}) is after valid_until ({until})")]
    InvalidInterval {
        /// Start of validity.
        from: DateTime<Utc>,
        /// End of validity.
        until: DateTime<Utc>,
    },

    /// A claim must be backed by at least one source.
    #[error("Claim has no source contributions")]
    NoSources,

    /// A confidence-like value fell outside `[0, 1]`.
    #[error("{field} value {value} is out of range [0.0, 1.0]")]
    ConfidenceOutOfRange {
        /// Name of the field.
        field: String,
        /// The offending value.
        value: f64,
    },

    /// Entity names must not be blank.
    #[error("Entity name cannot be empty")]
    EmptyEntityName,

    /// An allowlist entry is not a domain or `*.suffix` wildcard.
    #[error("Invalid domain pattern '{pattern}': {reason}")]
    InvalidDomainPattern {
        /// The entry as configured.
        pattern: String,
        /// Why it was refused.
        reason: String,
    },
}

impl ValidationError {
    pub(crate) fn empty(field: &str) -> Self {
        Self::EmptyField {
            field: field.to_string(),
        }
    }
}

/// Data-integrity faults found while reasoning over stored intervals.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemporalError {
    /// The supersession links reachable from `claim` loop back on themselves.
    ///
    /// Surfaced as-is; never repaired automatically.
    #[error("Broken supersession chain at claim {claim}")]
    BrokenChain {
        /// Claim where the loop was found.
        claim: ClaimId,
    },
}

/// A safety rail that kept a gap from entering research.
///
/// Rail blocks are not fatal: the gap stays `Queued` and the violation is
/// recorded on it as its blocking reason.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "rail", rename_all = "snake_case")]
pub enum RailViolation {
    /// No research token is available.
    #[error("Research rate limit exceeded (retry in {retry_after_ms}ms)")]
    RateLimitExceeded {
        /// Time until the next token.
        retry_after_ms: u64,
    },

    /// A research domain is not on the allowlist.
    #[error("Research domain '{domain}' is not on the allowlist")]
    DomainNotAllowed {
        /// The first refused domain.
        domain: String,
    },

    /// The gap sits deeper than the follow-up ceiling.
    #[error("Gap depth {depth} exceeds ceiling {ceiling}")]
    DepthExceeded {
        /// Depth of the gap.
        depth: u32,
        /// Configured maximum depth.
        ceiling: u32,
    },

    /// Human-in-the-loop mode requires an approval first.
    #[error("Gap is awaiting operator approval")]
    AwaitingApproval,

    /// Every research worker slot is taken.
    #[error("Research concurrency limit reached ({limit} in flight)")]
    ConcurrencyLimit {
        /// Configured worker count.
        limit: usize,
    },
}

/// Top-level error type for kyrograph.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Malformed input.
    #[error("Invariant violation: {0}")]
    Validation(#[from] ValidationError),

    /// The store failed or refused a write.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Stored intervals or supersession links are inconsistent.
    #[error("Temporal error: {0}")]
    Temporal(#[from] TemporalError),

    /// The candidate contradicts trusted knowledge and was not committed.
    #[error("Conflict detected for {fact}: contradicts {} existing fact(s)", rivals.len())]
    ConflictDetected {
        /// Fact the candidate would have contributed to.
        fact: FactKey,
        /// Fact variants it contradicts.
        rivals: Vec<FactKey>,
    },

    /// A safety rail held the gap back.
    #[error("Safety rail blocked research: {0}")]
    Rail(#[from] RailViolation),

    /// The research collaborator did not answer in time.
    #[error("Research for gap {gap} timed out after {after_ms}ms")]
    ResearchTimeout {
        /// Gap being researched.
        gap: GapId,
        /// Configured call timeout.
        after_ms: u64,
    },

    /// The gap lifecycle does not allow this move.
    #[error("Gap {gap} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Gap being moved.
        gap: GapId,
        /// Current state.
        from: GapState,
        /// Requested state.
        to: GapState,
    },

    /// The research collaborator reported a failure.
    #[error("Research collaborator failed: {message}")]
    Research {
        /// Collaborator message.
        message: String,
        /// Whether another attempt may succeed.
        transient: bool,
    },

    /// Configuration could not be loaded or is inconsistent.
    #[error("Configuration error: {message}")]
    Config {
        /// What is wrong.
        message: String,
    },

    /// A bug or poisoned lock.
    #[error("Internal error: {message}")]
    Internal {
        /// What failed.
        message: String,
    },
}

impl GraphError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Returns true if this is an invariant violation, wherever it surfaced.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::Storage(StorageError::InvariantViolation(_))
        )
    }

    /// Returns true if the candidate was refused as contradicting.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::ConflictDetected { .. })
    }

    /// Returns true if a safety rail blocked research.
    #[must_use]
    pub const fn is_rail_block(&self) -> bool {
        matches!(self, Self::Rail(_))
    }

    /// Returns true if this error is retryable.
    ///
    /// Only transient research failures qualify, and only within the gap's
    /// own attempt budget. Rail blocks are deliberately not retryable here.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Research { transient, .. } => *transient,
            _ => false,
        }
    }
}

/// Result type alias for kyrograph operations.
pub type GraphResult<T> = Result<T, GraphError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::{Object, Polarity};
    use crate::entity::EntityId;
    use crate::value::Value;

    #[test]
    fn test_validation_error_interval() {
        let now = Utc::now();
        let err = ValidationError::InvalidInterval {
            from: now,
            until: now - chrono::Duration::hours(1),
        };
        assert!(err.to_string().contains("Invalid interval"));
    }

    #[test]
    fn test_confidence_out_of_range_names_field() {
        let err = ValidationError::ConfidenceOutOfRange {
            field: "authority".to_string(),
            value: 1.5,
        };
        let msg = err.to_string();
        assert!(msg.contains("authority"));
        assert!(msg.contains("1.5"));
    }

    #[test]
    fn test_rail_violation_display() {
        let err = RailViolation::DepthExceeded {
            depth: 4,
            ceiling: 3,
        };
        assert!(err.to_string().contains("ceiling 3"));
    }

    #[test]
    fn test_rail_violation_serialization() {
        let err = RailViolation::DomainNotAllowed {
            domain: "evil.example".to_string(),
        };
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("domain_not_allowed"));
        let back: RailViolation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_graph_error_classification() {
        let err: GraphError = ValidationError::NoSources.into();
        assert!(err.is_validation());
        assert!(!err.is_retryable());

        let err: GraphError = StorageError::InvariantViolation(ValidationError::NoSources).into();
        assert!(err.is_validation());

        let err: GraphError = RailViolation::AwaitingApproval.into();
        assert!(err.is_rail_block());
        assert!(!err.is_retryable());

        let err = GraphError::Research {
            message: "upstream 503".to_string(),
            transient: true,
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_conflict_detected_display() {
        let key = FactKey::new(
            EntityId::new(),
            "released",
            Object::Literal(Value::Int(2018)),
            Polarity::Affirmed,
        );
        let err = GraphError::ConflictDetected {
            fact: key.clone(),
            rivals: vec![key],
        };
        assert!(err.is_conflict());
        assert!(err.to_string().contains("1 existing fact"));
    }
}
