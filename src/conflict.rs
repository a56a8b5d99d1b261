//! Conflict detection for incoming claims.
//!
//! Conflicts are explicit records, not hidden errors. Before a claim is
//! committed the detector compares it with the live claims of its
//! `(subject, predicate)` slot and reports every fact variant it
//! contradicts, together with that variant's fused confidence. What happens
//! next is decided by the configured [`ConflictPolicy`].

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::claim::{Claim, ClaimId, FactKey, Modality, Polarity, SlotKey};
use crate::error::GraphResult;
use crate::fusion::FusionEngine;
use crate::storage::{ClaimQuery, ClaimStore};
use crate::time::Interval;

/// Unique identifier for a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConflictId(Uuid);

impl ConflictId {
    /// Creates a new random conflict ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why two claims cannot both hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Distinct objects for a single-valued predicate.
    ValueContradiction,
    /// The same object affirmed and denied.
    PolarityContradiction,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ValueContradiction => write!(f, "value_contradiction"),
            Self::PolarityContradiction => write!(f, "polarity_contradiction"),
        }
    }
}

/// A contradiction between an incoming claim and an existing fact variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// Unique conflict id.
    pub id: ConflictId,
    /// The `(subject, predicate)` slot both claims share.
    pub slot: SlotKey,
    /// How the two variants contradict.
    pub kind: ConflictKind,
    /// Fact variant of the incoming claim.
    pub incoming: FactKey,
    /// Fact variant it contradicts.
    pub existing: FactKey,
    /// Live claims of `existing` that contradict the incoming claim.
    pub existing_claims: Vec<ClaimId>,
    /// Fused confidence of `existing` at detection time.
    pub existing_confidence: f64,
    /// Where the validity intervals overlap.
    pub overlap: Interval,
    /// When the conflict was detected.
    pub detected_at: DateTime<Utc>,
}

/// What to do with a candidate that contradicts existing knowledge.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Commit it and flag both variants as conflicting.
    #[default]
    Flag,
    /// Supersede the rival claims when the incoming variant's fused
    /// confidence beats the rival's by at least `margin` and the incoming
    /// claim does not start earlier; flag otherwise.
    SupersedeWhenTrusted { margin: f64 },
    /// Refuse the candidate.
    Reject,
}

/// The pairwise compatibility rule.
///
/// Two claims contradict when they share a slot, their intervals overlap,
/// and either
/// - they affirm and deny the same object, and the affirming side is not a
///   mere possibility, or
/// - both commit (assertion or necessity) to different objects of a
///   single-valued predicate.
#[derive(Debug, Clone, Default)]
pub struct ContradictionRule {
    multi_valued: HashSet<String>,
}

impl ContradictionRule {
    /// A rule treating `multi_valued_predicates` as multi-valued and every other predicate as single-valued.
    #[must_use]
    pub fn new<I, S>(multi_valued_predicates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            multi_valued: multi_valued_predicates
                .into_iter()
                .map(|p| p.into().trim().to_string())
                .collect(),
        }
    }

    /// Whether `predicate` admits several objects at once.
    #[must_use]
    pub fn is_multi_valued(&self, predicate: &str) -> bool {
        self.multi_valued.contains(predicate)
    }

    /// Classifies the contradiction between `a` and `b`, if any.
    #[must_use]
    pub fn classify(&self, a: &Claim, b: &Claim) -> Option<ConflictKind> {
        if a.subject != b.subject || a.predicate != b.predicate {
            return None;
        }
        if !a.interval.overlaps(&b.interval) {
            return None;
        }

        let (pa, pb) = (a.modality.polarity(), b.modality.polarity());
        if a.object == b.object {
            if pa == pb {
                return None;
            }
            let affirming = if pa == Polarity::Affirmed { a } else { b };
            if affirming.modality == Modality::Possibility {
                return None;
            }
            return Some(ConflictKind::PolarityContradiction);
        }

        if self.is_multi_valued(&a.predicate) {
            return None;
        }
        (a.modality.is_committal() && b.modality.is_committal())
            .then_some(ConflictKind::ValueContradiction)
    }
}

/// Result of checking a candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// No contradiction.
    Accept,
    /// Commit and flag.
    Conflicted(Vec<Conflict>),
    /// Commit, then link `supersede` to the candidate. `remaining` are the
    /// conflicts the candidate was not trusted enough to override.
    Supersede {
        /// Claims the candidate replaces.
        supersede: Vec<ClaimId>,
        /// Conflicts the supersession settles.
        resolved: Vec<Conflict>,
        /// Conflicts left open.
        remaining: Vec<Conflict>,
    },
    /// Do not commit.
    Rejected(Vec<Conflict>),
}

impl Verdict {
    /// Conflicts the candidate leaves standing.
    #[must_use]
    pub fn open_conflicts(&self) -> &[Conflict] {
        match self {
            Self::Accept => &[],
            Self::Conflicted(c) | Self::Rejected(c) => c,
            Self::Supersede { remaining, .. } => remaining,
        }
    }
}

/// Validates incoming claims against the fused view of the store.
#[derive(Debug)]
pub struct ConflictDetector {
    store: Arc<ClaimStore>,
    fusion: Arc<FusionEngine>,
    policy: ConflictPolicy,
}

impl ConflictDetector {
    /// A detector applying `policy`.
    #[must_use]
    pub const fn new(
        store: Arc<ClaimStore>,
        fusion: Arc<FusionEngine>,
        policy: ConflictPolicy,
    ) -> Self {
        Self {
            store,
            fusion,
            policy,
        }
    }

    /// The configured policy.
    #[must_use]
    pub const fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Every contradiction between `candidate` and the live claims of its
    /// slot, one [`Conflict`] per contradicted fact variant.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the store cannot be read.
    pub fn detect(&self, candidate: &Claim) -> GraphResult<Vec<Conflict>> {
        let rule = self.fusion.rule();
        let slot_claims = self
            .store
            .get_claims_for(&ClaimQuery::Slot(candidate.slot_key()), None)?;

        let mut groups: Vec<(FactKey, ConflictKind, Vec<Claim>)> = Vec::new();
        for existing in slot_claims {
            if existing.is_superseded() || existing.id == candidate.id {
                continue;
            }
            let Some(kind) = rule.classify(candidate, &existing) else {
                continue;
            };
            let key = existing.fact_key();
            match groups.iter_mut().find(|(k, _, _)| *k == key) {
                Some((_, _, claims)) => claims.push(existing),
                None => groups.push((key, kind, vec![existing])),
            }
        }

        let incoming = candidate.fact_key();
        let now = Utc::now();
        let mut conflicts = Vec::with_capacity(groups.len());
        for (key, kind, claims) in groups {
            let fused = self.fusion.fuse(&key)?;
            let overlap = claims
                .iter()
                .find_map(|c| candidate.interval.intersection(&c.interval))
                .unwrap_or_else(|| candidate.interval.clone());
            conflicts.push(Conflict {
                id: ConflictId::new(),
                slot: candidate.slot_key(),
                kind,
                incoming: incoming.clone(),
                existing: key,
                existing_claims: claims.iter().map(|c| c.id).collect(),
                existing_confidence: fused.confidence,
                overlap,
                detected_at: now,
            });
        }
        Ok(conflicts)
    }

    /// Checks `candidate` and applies the policy.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the store cannot be read.
    pub fn check(&self, candidate: &Claim) -> GraphResult<Verdict> {
        let conflicts = self.detect(candidate)?;
        if conflicts.is_empty() {
            return Ok(Verdict::Accept);
        }
        debug!(
            fact = %candidate.fact_key(),
            conflicts = conflicts.len(),
            policy = ?self.policy,
            "candidate contradicts existing facts"
        );

        match self.policy {
            ConflictPolicy::Flag => Ok(Verdict::Conflicted(conflicts)),
            ConflictPolicy::Reject => Ok(Verdict::Rejected(conflicts)),
            ConflictPolicy::SupersedeWhenTrusted { margin } => {
                let incoming = self.fusion.projected(candidate)?;
                let mut supersede = Vec::new();
                let mut resolved = Vec::new();
                let mut remaining = Vec::new();

                for conflict in conflicts {
                    let trusted = incoming >= conflict.existing_confidence + margin;
                    if trusted && self.starts_no_later(&conflict.existing_claims, candidate.interval.from)? {
                        supersede.extend(conflict.existing_claims.iter().copied());
                        resolved.push(conflict);
                    } else {
                        remaining.push(conflict);
                    }
                }

                if supersede.is_empty() {
                    Ok(Verdict::Conflicted(remaining))
                } else {
                    Ok(Verdict::Supersede {
                        supersede,
                        resolved,
                        remaining,
                    })
                }
            }
        }
    }

    /// Whether every claim in `ids` is stored and starts no later than `from`.
    fn starts_no_later(&self, ids: &[ClaimId], from: DateTime<Utc>) -> GraphResult<bool> {
        for id in ids {
            match self.store.claim(*id)? {
                Some(claim) if claim.interval.from <= from => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }
}
