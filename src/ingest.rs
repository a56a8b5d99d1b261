//! The commit pipeline.
//!
//! Every claim, whether submitted by a caller or produced by gap research,
//! enters the graph here: validate, resolve entities, check for
//! contradictions, commit, apply supersession and refresh fusion. The
//! check-and-commit section runs under a per-slot lock so two claims that
//! could contradict each other never race.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::claim::{Claim, ClaimId, FactKey, Modality, Object, SlotKey};
use crate::conflict::{Conflict, ConflictDetector, Verdict};
use crate::entity::{EntityId, EntityKind};
use crate::error::{GraphError, GraphResult, ValidationError};
use crate::fusion::FusionEngine;
use crate::source::{check_unit, freshness_from_age, Source};
use crate::storage::{ClaimStore, StorageError};
use crate::time::Interval;
use crate::value::Value;

/// How a submission treats contradictions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyMode {
    /// Refuse a candidate that leaves any contradiction open.
    Strict,
    /// Commit and flag.
    #[default]
    Eventual,
    /// Skip contradiction checks.
    Force,
}

/// An entity named by id or by `(name, kind)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityRef {
    /// An existing entity.
    Id(EntityId),
    /// Resolved by name, created on first mention.
    Named {
        /// Entity name, matched case-insensitively.
        name: String,
        /// Kind used when the entity is created.
        kind: EntityKind,
    },
}

impl EntityRef {
    /// Refers to the entity called `name`.
    pub fn named(name: impl Into<String>, kind: EntityKind) -> Self {
        Self::Named {
            name: name.into(),
            kind,
        }
    }
}

impl From<EntityId> for EntityRef {
    fn from(id: EntityId) -> Self {
        Self::Id(id)
    }
}

/// Object of a candidate claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectRef {
    /// Another entity.
    Entity(EntityRef),
    /// A literal value.
    Literal(Value),
}

impl From<Value> for ObjectRef {
    fn from(value: Value) -> Self {
        Self::Literal(value)
    }
}

impl From<EntityRef> for ObjectRef {
    fn from(entity: EntityRef) -> Self {
        Self::Entity(entity)
    }
}

/// Source block of a candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    /// Source identifier, usually a URL or domain.
    pub id: String,
    /// Source authority in `[0, 1]`.
    pub authority: f64,
    /// Derived from `retrieved_at` by half-life decay when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freshness: Option<f64>,
    /// When the content was retrieved.
    pub retrieved_at: DateTime<Utc>,
}

impl SourceInfo {
    /// A source without explicit freshness.
    pub fn new(id: impl Into<String>, authority: f64, retrieved_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            authority,
            freshness: None,
            retrieved_at,
        }
    }

    /// Sets freshness explicitly.
    #[must_use]
    pub const fn with_freshness(mut self, freshness: f64) -> Self {
        self.freshness = Some(freshness);
        self
    }

    fn to_source(&self, half_life_days: f64) -> Result<Source, ValidationError> {
        let freshness = self
            .freshness
            .unwrap_or_else(|| freshness_from_age(self.retrieved_at, Utc::now(), half_life_days));
        Source::new(self.id.clone(), self.authority, freshness, self.retrieved_at)
    }
}

fn default_raw_confidence() -> f64 {
    1.0
}

/// An uncommitted claim as it arrives from extraction or research.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateClaim {
    /// Entity the claim is about.
    pub subject: EntityRef,
    /// Predicate; trimmed on commit.
    pub predicate: String,
    /// What the subject relates to.
    pub object: ObjectRef,
    /// How strongly the claim is stated.
    #[serde(default)]
    pub modality: Modality,
    /// Hedging phrases from extraction.
    #[serde(default)]
    pub hedges: Vec<String>,
    /// Where the claim comes from.
    pub source: SourceInfo,
    /// Extraction confidence.
    #[serde(default = "default_raw_confidence")]
    pub raw_confidence: f64,
    /// Defaults to the time of submission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,
    /// End of validity; open-ended when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
}

impl CandidateClaim {
    /// An assertion with full extraction confidence and no interval bounds.
    pub fn new(
        subject: impl Into<EntityRef>,
        predicate: impl Into<String>,
        object: impl Into<ObjectRef>,
        source: SourceInfo,
    ) -> Self {
        Self {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
            modality: Modality::Assertion,
            hedges: Vec::new(),
            source,
            raw_confidence: default_raw_confidence(),
            valid_from: None,
            valid_until: None,
        }
    }

    /// Sets the modality.
    #[must_use]
    pub const fn modality(mut self, modality: Modality) -> Self {
        self.modality = modality;
        self
    }

    /// Adds a hedging phrase.
    #[must_use]
    pub fn hedge(mut self, hedge: impl Into<String>) -> Self {
        self.hedges.push(hedge.into());
        self
    }

    /// Sets the extraction confidence.
    #[must_use]
    pub const fn raw_confidence(mut self, raw: f64) -> Self {
        self.raw_confidence = raw;
        self
    }

    /// Sets the start of validity.
    #[must_use]
    pub const fn valid_from(mut self, from: DateTime<Utc>) -> Self {
        self.valid_from = Some(from);
        self
    }

    /// Sets the end of validity.
    #[must_use]
    pub const fn valid_until(mut self, until: DateTime<Utc>) -> Self {
        self.valid_until = Some(until);
        self
    }

    /// Checks the candidate before any entity is resolved or created.
    ///
    /// # Errors
    ///
    /// Returns the first `ValidationError` found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_ref(&self.subject)?;
        if self.predicate.trim().is_empty() {
            return Err(ValidationError::empty("predicate"));
        }
        match &self.object {
            ObjectRef::Entity(entity) => check_ref(entity)?,
            ObjectRef::Literal(value) if value.is_empty() => {
                return Err(ValidationError::empty("object"));
            }
            ObjectRef::Literal(_) => {}
        }
        if self.source.id.trim().is_empty() {
            return Err(ValidationError::empty("source.id"));
        }
        check_unit("authority", self.source.authority)?;
        if let Some(freshness) = self.source.freshness {
            check_unit("freshness", freshness)?;
        }
        check_unit("raw_confidence", self.raw_confidence)?;
        if let Some(until) = self.valid_until {
            Interval::new(self.valid_from.unwrap_or_else(Utc::now), Some(until))?;
        }
        Ok(())
    }
}

fn check_ref(entity: &EntityRef) -> Result<(), ValidationError> {
    match entity {
        EntityRef::Id(id) if id.is_nil() => Err(ValidationError::empty("subject")),
        EntityRef::Named { name, .. } if name.trim().is_empty() => {
            Err(ValidationError::EmptyEntityName)
        }
        _ => Ok(()),
    }
}

/// What a successful commit did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitReceipt {
    /// The committed claim.
    pub claim_id: ClaimId,
    /// Fact the claim contributes to.
    pub fact: FactKey,
    /// Entities created while resolving names.
    pub created_entities: Vec<EntityId>,
    /// Contradictions left open by this commit.
    pub conflicts: Vec<Conflict>,
    /// Claims this commit superseded.
    pub superseded: Vec<ClaimId>,
    /// Fused confidence of `fact` after the commit.
    pub fused_confidence: f64,
}

const SLOT_STRIPES: usize = 256;

/// Striped per-slot write locks.
///
/// Claims that could contradict share a `(subject, predicate)` slot, so
/// serializing per slot is enough; unrelated slots rarely share a stripe.
#[derive(Debug)]
pub struct SlotLocks {
    stripes: Vec<Mutex<()>>,
}

impl Default for SlotLocks {
    fn default() -> Self {
        Self::new(SLOT_STRIPES)
    }
}

impl SlotLocks {
    /// Locks split across `stripes` stripes, at least one.
    #[must_use]
    pub fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    fn stripe(&self, slot: &SlotKey) -> usize {
        let mut hasher = DefaultHasher::new();
        slot.hash(&mut hasher);
        #[allow(clippy::cast_possible_truncation)]
        let index = hasher.finish() as usize % self.stripes.len();
        index
    }

    /// Locks the stripe owning `slot`.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the stripe is poisoned.
    pub fn lock(&self, slot: &SlotKey) -> GraphResult<MutexGuard<'_, ()>> {
        self.stripes[self.stripe(slot)]
            .lock()
            .map_err(|_| GraphError::internal("poisoned lock: slot"))
    }
}

/// Validates, checks and commits claims.
#[derive(Debug)]
pub struct CommitPipeline {
    store: Arc<ClaimStore>,
    fusion: Arc<FusionEngine>,
    detector: ConflictDetector,
    locks: SlotLocks,
    freshness_half_life_days: f64,
}

impl CommitPipeline {
    /// A pipeline committing through `detector` into `store`.
    #[must_use]
    pub fn new(
        store: Arc<ClaimStore>,
        fusion: Arc<FusionEngine>,
        detector: ConflictDetector,
        freshness_half_life_days: f64,
    ) -> Self {
        Self {
            store,
            fusion,
            detector,
            locks: SlotLocks::default(),
            freshness_half_life_days,
        }
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<ClaimStore> {
        &self.store
    }

    /// The fusion engine kept current by commits.
    #[must_use]
    pub fn fusion(&self) -> &Arc<FusionEngine> {
        &self.fusion
    }

    fn resolve(&self, entity: &EntityRef, created: &mut Vec<EntityId>) -> GraphResult<EntityId> {
        match entity {
            EntityRef::Id(id) => {
                if self.store.entity(*id)?.is_none() {
                    return Err(StorageError::EntityNotFound(*id).into());
                }
                Ok(*id)
            }
            EntityRef::Named { name, kind } => {
                let (entity, was_created) = self.store.ensure_entity(name, kind)?;
                if was_created {
                    created.push(entity.id);
                }
                Ok(entity.id)
            }
        }
    }

    /// Resolves and commits a candidate.
    ///
    /// # Errors
    ///
    /// - `Validation` for a malformed candidate.
    /// - `Storage(EntityNotFound)` for an unknown entity id.
    /// - `ConflictDetected` when the policy rejects the candidate, or in
    ///   strict mode when a contradiction would stay open.
    pub fn submit(&self, candidate: &CandidateClaim, mode: ConsistencyMode) -> GraphResult<CommitReceipt> {
        candidate.validate()?;

        let mut created = Vec::new();
        let subject = self.resolve(&candidate.subject, &mut created)?;
        let object = match &candidate.object {
            ObjectRef::Entity(entity) => Object::Entity(self.resolve(entity, &mut created)?),
            ObjectRef::Literal(value) => Object::Literal(value.clone()),
        };

        let mut builder = Claim::builder()
            .subject(subject)
            .predicate(candidate.predicate.trim())
            .object(object)
            .modality(candidate.modality)
            .contribution(
                candidate.source.to_source(self.freshness_half_life_days)?,
                candidate.raw_confidence,
            );
        for hedge in &candidate.hedges {
            builder = builder.hedge(hedge.clone());
        }
        builder = builder.valid_from(candidate.valid_from.unwrap_or_else(Utc::now));
        if let Some(until) = candidate.valid_until {
            builder = builder.valid_until(until);
        }
        let claim = builder.build()?;

        let mut receipt = self.commit_claim(claim, mode)?;
        receipt.created_entities = created;
        Ok(receipt)
    }

    /// Checks and commits an already-built claim.
    ///
    /// # Errors
    ///
    /// As [`submit`](Self::submit), minus entity resolution.
    pub fn commit_claim(&self, claim: Claim, mode: ConsistencyMode) -> GraphResult<CommitReceipt> {
        claim.validate()?;
        let fact = claim.fact_key();
        let _slot = self.locks.lock(&claim.slot_key())?;

        let verdict = match mode {
            ConsistencyMode::Force => Verdict::Accept,
            ConsistencyMode::Strict | ConsistencyMode::Eventual => self.detector.check(&claim)?,
        };

        let refuse = matches!(verdict, Verdict::Rejected(_))
            || (mode == ConsistencyMode::Strict && !verdict.open_conflicts().is_empty());
        if refuse {
            let rivals = verdict
                .open_conflicts()
                .iter()
                .map(|c| c.existing.clone())
                .collect();
            debug!(fact = %fact, mode = ?mode, "candidate refused");
            return Err(GraphError::ConflictDetected { fact, rivals });
        }

        let (to_supersede, conflicts) = match verdict {
            Verdict::Accept => (Vec::new(), Vec::new()),
            Verdict::Conflicted(conflicts) | Verdict::Rejected(conflicts) => (Vec::new(), conflicts),
            Verdict::Supersede {
                supersede,
                remaining,
                ..
            } => (supersede, remaining),
        };

        let claim_id = self.store.put_claim(claim.clone())?;
        self.fusion.absorb(&claim)?;

        let mut superseded = Vec::new();
        for old in to_supersede {
            let old_key = match self.store.claim(old)? {
                Some(c) => c.fact_key(),
                None => continue,
            };
            match self.store.supersede(old, claim_id) {
                Ok(()) => {
                    self.fusion.invalidate(&old_key)?;
                    superseded.push(old);
                }
                Err(e) => warn!(old = %old, new = %claim_id, error = %e, "supersession skipped"),
            }
        }

        let fused = self.fusion.fuse(&fact)?;
        if conflicts.is_empty() {
            debug!(claim = %claim_id, fact = %fact, confidence = fused.confidence, "claim committed");
        } else {
            info!(
                claim = %claim_id,
                fact = %fact,
                conflicts = conflicts.len(),
                "claim committed with open conflicts"
            );
        }

        Ok(CommitReceipt {
            claim_id,
            fact,
            created_entities: Vec::new(),
            conflicts,
            superseded,
            fused_confidence: fused.confidence,
        })
    }
}
