//! Knowledge gaps and their lifecycle.
//!
//! A gap is something the graph knows it does not know: a term used but
//! never defined, an entity with too little supporting knowledge, or a
//! contradiction that needs adjudicating. Gaps move through
//!
//! ```text
//! Detected -> Classified -> Queued -> Researching -> { Filled | Rejected | Expired }
//! ```
//!
//! driven by the [`GapLifecycleManager`]. A transient research failure with
//! budget left sends a gap from `Researching` back to `Queued`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::claim::{ClaimId, FactKey};
use crate::entity::EntityId;
use crate::error::RailViolation;

pub mod manager;
pub mod rails;
pub mod research;

pub use manager::{CycleReport, GapLifecycleManager};
pub use rails::{DomainAllowlist, SafetyRails, TokenBucket};
pub use research::{
    DetachedResearcher, ResearchError, ResearchFindings, ResearchHandle, ResearchReport, ResearchRequest,
    ResearchRuntime, Researcher,
};

/// Unique gap identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GapId(Uuid);

impl GapId {
    /// Creates a new random gap ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for GapId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for GapId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// What kind of knowledge is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapKind {
    /// An entity is referenced but never described.
    UndefinedTerm,
    /// An entity has too few claims of its own.
    MissingPrerequisite,
    /// Two fact variants contradict each other.
    Contradiction,
}

impl fmt::Display for GapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UndefinedTerm => write!(f, "undefined_term"),
            Self::MissingPrerequisite => write!(f, "missing_prerequisite"),
            Self::Contradiction => write!(f, "contradiction"),
        }
    }
}

/// Lifecycle state of a gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapState {
    /// Raised by a detector, not yet classified.
    Detected,
    /// Kind assigned; priority may still be below the floor.
    Classified,
    /// Waiting for research.
    Queued,
    /// A research call is in flight.
    Researching,
    /// Research committed at least one claim.
    Filled,
    /// Research failed permanently or found nothing admissible.
    Rejected,
    /// Budget or deadline ran out.
    Expired,
}

impl GapState {
    /// Filled, rejected and expired gaps never move again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Rejected | Self::Expired)
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Detected, Self::Classified)
                | (Self::Classified, Self::Queued)
                | (Self::Queued, Self::Researching)
                | (Self::Queued, Self::Expired)
                | (Self::Researching, Self::Filled)
                | (Self::Researching, Self::Rejected)
                | (Self::Researching, Self::Expired)
                | (Self::Researching, Self::Queued)
        )
    }
}

impl fmt::Display for GapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Detected => "detected",
            Self::Classified => "classified",
            Self::Queued => "queued",
            Self::Researching => "researching",
            Self::Filled => "filled",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for GapState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "detected" => Ok(Self::Detected),
            "classified" => Ok(Self::Classified),
            "queued" => Ok(Self::Queued),
            "researching" => Ok(Self::Researching),
            "filled" => Ok(Self::Filled),
            "rejected" => Ok(Self::Rejected),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown gap state '{other}'")),
        }
    }
}

/// What the gap is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "target", content = "key", rename_all = "snake_case")]
pub enum GapTarget {
    /// An entity as a whole.
    Entity(EntityId),
    /// One fact variant.
    Fact(FactKey),
}

impl GapTarget {
    /// The entity the gap is anchored on.
    #[must_use]
    pub const fn entity(&self) -> EntityId {
        match self {
            Self::Entity(id) => *id,
            Self::Fact(key) => key.subject,
        }
    }
}

/// The structural signal that raised the gap. Classification reads the
/// kind off the signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum GapSignal {
    /// The entity is referenced by claims but has none of its own.
    UnresolvedReference {
        /// Claims pointing at the entity.
        references: usize,
    },
    /// The entity has fewer claims than the prerequisite threshold.
    SparsePrerequisites {
        /// Claims the entity has as subject.
        claim_count: usize,
        /// Configured prerequisite threshold.
        threshold: usize,
    },
    /// The target fact is flagged as conflicting with `rival`.
    ConflictFlag {
        /// The contradicting variant.
        rival: FactKey,
    },
    /// Raised by an upstream detector.
    Reported {
        /// Kind named by the reporter.
        kind: GapKind,
    },
}

impl GapSignal {
    /// The gap kind this signal implies.
    #[must_use]
    pub const fn kind(&self) -> GapKind {
        match self {
            Self::UnresolvedReference { .. } => GapKind::UndefinedTerm,
            Self::SparsePrerequisites { .. } => GapKind::MissingPrerequisite,
            Self::ConflictFlag { .. } => GapKind::Contradiction,
            Self::Reported { kind } => *kind,
        }
    }
}

/// Research budget counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchBudget {
    /// Research calls made so far.
    pub attempts_used: u32,
    /// Research calls allowed.
    pub max_attempts: u32,
    /// Wall-clock deadline, fixed when research first starts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

impl ResearchBudget {
    /// A fresh budget of `max_attempts` calls and no deadline.
    #[must_use]
    pub const fn new(max_attempts: u32) -> Self {
        Self {
            attempts_used: 0,
            max_attempts,
            deadline: None,
        }
    }

    /// Whether no attempt is left or the deadline has passed at `now`.
    #[must_use]
    pub fn is_exhausted(&self, now: DateTime<Utc>) -> bool {
        self.attempts_used >= self.max_attempts || self.deadline.is_some_and(|d| now >= d)
    }
}

/// A knowledge gap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gap {
    /// Unique gap id.
    pub id: GapId,
    /// What the gap is about.
    pub target: GapTarget,
    /// Evidence the detector saw.
    pub signal: GapSignal,
    /// Set on classification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<GapKind>,
    /// Research priority in `[0, 1]`.
    pub priority: f64,
    /// Priority suggested by the reporter, used as a lower bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_hint: Option<f64>,
    /// Lifecycle state.
    pub state: GapState,
    /// Recursion depth: 0 for gaps detected directly, parent + 1 for
    /// gaps surfaced by filling another gap.
    pub depth: u32,
    /// The gap whose research surfaced this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<GapId>,
    /// Domains research for this gap would consult.
    #[serde(default)]
    pub target_domains: Vec<String>,
    /// Operator who approved research, in human-in-the-loop mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    /// Why the gap is still queued, if a rail blocked it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<RailViolation>,
    /// Attempt and deadline counters.
    pub budget: ResearchBudget,
    /// When the gap was detected.
    pub detected_at: DateTime<Utc>,
    /// When the gap last changed.
    pub updated_at: DateTime<Utc>,
}

impl Gap {
    /// A new `Detected` gap at depth 0.
    #[must_use]
    pub fn detected(target: GapTarget, signal: GapSignal, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: GapId::new(),
            target,
            signal,
            kind: None,
            priority: 0.0,
            priority_hint: None,
            state: GapState::Detected,
            depth: 0,
            parent: None,
            target_domains: Vec::new(),
            approved_by: None,
            blocked_by: None,
            budget: ResearchBudget::new(max_attempts),
            detected_at: now,
            updated_at: now,
        }
    }

    /// Sets the reporter's priority hint, clamped to `[0, 1]`.
    #[must_use]
    pub fn with_priority_hint(mut self, hint: f64) -> Self {
        self.priority_hint = Some(hint.clamp(0.0, 1.0));
        self
    }

    /// Sets the domains research would consult.
    #[must_use]
    pub fn with_domains(mut self, domains: Vec<String>) -> Self {
        self.target_domains = domains;
        self
    }

    /// Marks the gap as a follow-up of `parent` at `depth`.
    #[must_use]
    pub const fn with_parent(mut self, parent: GapId, depth: u32) -> Self {
        self.parent = Some(parent);
        self.depth = depth;
        self
    }

    /// The kind, from classification or else from the signal.
    #[must_use]
    pub const fn effective_kind(&self) -> GapKind {
        match self.kind {
            Some(kind) => kind,
            None => self.signal.kind(),
        }
    }

    /// Whether the gap is not yet terminal.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Whether an operator approved research.
    #[must_use]
    pub const fn is_approved(&self) -> bool {
        self.approved_by.is_some()
    }
}

/// Filter for listing gaps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GapFilter {
    /// Only gaps in this state.
    #[serde(default)]
    pub state: Option<GapState>,
    /// Only gaps at or above this priority.
    #[serde(default)]
    pub priority_min: Option<f64>,
    /// Only gaps of this kind.
    #[serde(default)]
    pub kind: Option<GapKind>,
}

impl GapFilter {
    /// Whether `gap` passes every set criterion.
    #[must_use]
    pub fn matches(&self, gap: &Gap) -> bool {
        self.state.map_or(true, |s| gap.state == s)
            && self.priority_min.map_or(true, |p| gap.priority >= p)
            && self.kind.map_or(true, |k| gap.effective_kind() == k)
    }
}

/// Outcome of one research attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// At least one candidate committed.
    Filled,
    /// Nothing admissible came back.
    Rejected,
    /// The researcher failed. A transient failure leaves the gap queued
    /// for another attempt.
    Failed {
        /// Whether the failure was transient.
        transient: bool,
    },
    /// The attempt timed out or the budget is spent; the gap expired.
    Exhausted,
}

/// Audit record of one research attempt against a gap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionAttempt {
    /// Gap the attempt was made for.
    pub gap: GapId,
    /// Query sent to the researcher.
    pub query: String,
    /// Sources the researcher reports consulting.
    #[serde(default)]
    pub sources_consulted: Vec<String>,
    /// How the attempt ended.
    pub outcome: AttemptOutcome,
    /// Claims committed from the findings.
    #[serde(default)]
    pub committed: Vec<ClaimId>,
    /// Free-form detail, such as an error message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// When the attempt settled.
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_lifecycle_transitions() {
        use GapState::*;
        assert!(Detected.can_transition_to(Classified));
        assert!(Classified.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Researching));
        assert!(Researching.can_transition_to(Filled));
        assert!(Researching.can_transition_to(Rejected));
        assert!(Researching.can_transition_to(Expired));
        assert!(Researching.can_transition_to(Queued));

        assert!(!Detected.can_transition_to(Queued));
        assert!(!Queued.can_transition_to(Filled));
        assert!(!Filled.can_transition_to(Queued));
        assert!(!Expired.can_transition_to(Researching));
    }

    #[test]
    fn test_terminal_states() {
        assert!(GapState::Filled.is_terminal());
        assert!(GapState::Rejected.is_terminal());
        assert!(GapState::Expired.is_terminal());
        assert!(!GapState::Queued.is_terminal());
    }

    #[test]
    fn test_state_parse() {
        assert_eq!("Queued".parse::<GapState>().unwrap(), GapState::Queued);
        assert!("done".parse::<GapState>().is_err());
    }

    #[test]
    fn test_signal_kind() {
        assert_eq!(
            GapSignal::UnresolvedReference { references: 2 }.kind(),
            GapKind::UndefinedTerm
        );
        assert_eq!(
            GapSignal::SparsePrerequisites {
                claim_count: 1,
                threshold: 2
            }
            .kind(),
            GapKind::MissingPrerequisite
        );
        assert_eq!(
            GapSignal::Reported {
                kind: GapKind::Contradiction
            }
            .kind(),
            GapKind::Contradiction
        );
    }

    #[test]
    fn test_budget_exhaustion() {
        let now = Utc::now();
        let mut budget = ResearchBudget::new(2);
        assert!(!budget.is_exhausted(now));

        budget.attempts_used = 2;
        assert!(budget.is_exhausted(now));

        let mut budget = ResearchBudget::new(5);
        budget.deadline = Some(now - Duration::seconds(1));
        assert!(budget.is_exhausted(now));
    }

    #[test]
    fn test_filter_matches() {
        let mut gap = Gap::detected(
            GapTarget::Entity(EntityId::new()),
            GapSignal::UnresolvedReference { references: 1 },
            3,
        );
        gap.priority = 0.6;
        gap.state = GapState::Queued;

        assert!(GapFilter::default().matches(&gap));
        assert!(GapFilter {
            state: Some(GapState::Queued),
            priority_min: Some(0.5),
            kind: Some(GapKind::UndefinedTerm),
        }
        .matches(&gap));
        assert!(!GapFilter {
            priority_min: Some(0.7),
            ..GapFilter::default()
        }
        .matches(&gap));
    }

    #[test]
    fn test_gap_serialization() {
        let mut gap = Gap::detected(
            GapTarget::Entity(EntityId::new()),
            GapSignal::Reported {
                kind: GapKind::MissingPrerequisite,
            },
            3,
        )
        .with_priority_hint(1.4);
        gap.blocked_by = Some(RailViolation::AwaitingApproval);

        assert_eq!(gap.priority_hint, Some(1.0));
        let json = serde_json::to_string(&gap).unwrap();
        let back: Gap = serde_json::from_str(&json).unwrap();
        assert_eq!(back, gap);
    }
}
