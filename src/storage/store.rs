//! The claim store: append log plus secondary indices.
//!
//! All state sits behind one `RwLock`. A write holds it for the log append
//! and the index update together, so readers always see a snapshot in which
//! every visible record is fully indexed. If the log append fails, no index
//! changes.
//!
//! Claims live in an arena addressed by slot. The only mutable field of a
//! committed claim is its supersession pointer, an `AtomicU64` holding the
//! successor's slot + 1 (0 = none), set by compare-and-set after the cycle
//! check.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::claim::{Claim, ClaimId, FactKey, SlotKey};
use crate::entity::{normalize_name, Entity, EntityId, EntityKind};
use crate::gap::{Gap, GapFilter, GapId, ResolutionAttempt};
use crate::storage::memory::MemoryLog;
use crate::storage::traits::{LogEntryKind, LogRecord, LogSink, StorageError};
use crate::time::Interval;

fn lock_err(context: &'static str) -> StorageError {
    StorageError::Backend(format!("poisoned lock: {context}"))
}

/// Which claims a lookup is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimQuery {
    /// Claims with the entity as subject or object.
    Entity(EntityId),
    /// Claims of one fact variant.
    Fact(FactKey),
    /// Claims in one `(subject, predicate)` slot, any object or polarity.
    Slot(SlotKey),
}

#[derive(Debug)]
struct StoredClaim {
    claim: Claim,
    successor: AtomicU64,
}

#[derive(Debug, Default)]
struct StoreState {
    log: Vec<LogRecord>,
    last_sequence: u64,
    entities: HashMap<EntityId, Entity>,
    entities_by_name: HashMap<String, Vec<EntityId>>,
    claims: Vec<StoredClaim>,
    by_id: HashMap<ClaimId, usize>,
    by_entity: HashMap<EntityId, Vec<usize>>,
    by_fact: HashMap<FactKey, Vec<usize>>,
    by_slot: HashMap<SlotKey, Vec<usize>>,
    by_time: BTreeMap<DateTime<Utc>, Vec<usize>>,
    gaps: HashMap<GapId, Gap>,
    attempts: HashMap<GapId, Vec<ResolutionAttempt>>,
}

impl StoreState {
    fn view(&self, slot: usize) -> Option<Claim> {
        let stored = self.claims.get(slot)?;
        let mut claim = stored.claim.clone();
        claim.superseded_by = self.successor_of(slot).map(|next| self.claims[next].claim.id);
        Some(claim)
    }

    fn successor_of(&self, slot: usize) -> Option<usize> {
        let raw = self.claims.get(slot)?.successor.load(Ordering::Acquire);
        let next = usize::try_from(raw).ok()?.checked_sub(1)?;
        (next < self.claims.len()).then_some(next)
    }

    fn slot_of(&self, id: ClaimId) -> Result<usize, StorageError> {
        self.by_id
            .get(&id)
            .copied()
            .ok_or(StorageError::ClaimNotFound(id))
    }

    fn slots_for(&self, query: &ClaimQuery) -> Vec<usize> {
        let slots = match query {
            ClaimQuery::Entity(id) => self.by_entity.get(id),
            ClaimQuery::Fact(key) => self.by_fact.get(key),
            ClaimQuery::Slot(slot) => self.by_slot.get(slot),
        };
        slots.cloned().unwrap_or_default()
    }

    /// True if `target` can be reached from `from` along supersession
    /// pointers. An existing loop counts as reachable.
    fn reaches(&self, from: usize, target: usize) -> bool {
        let mut current = from;
        for _ in 0..=self.claims.len() {
            if current == target {
                return true;
            }
            match self.successor_of(current) {
                Some(next) => current = next,
                None => return false,
            }
        }
        true
    }

    fn check_claim(&self, claim: &Claim) -> Result<(), StorageError> {
        claim.validate()?;
        if !self.entities.contains_key(&claim.subject) {
            return Err(StorageError::EntityNotFound(claim.subject));
        }
        if let Some(object) = claim.object.as_entity() {
            if !self.entities.contains_key(&object) {
                return Err(StorageError::EntityNotFound(object));
            }
        }
        if self.by_id.contains_key(&claim.id) {
            return Err(StorageError::DuplicateKey(claim.id.to_string()));
        }
        Ok(())
    }

    /// Slots of `(old, new)` after the supersession checks pass.
    ///
    /// Returns `Ok(None)` when the link already exists.
    fn check_supersede(
        &self,
        old: ClaimId,
        new: ClaimId,
    ) -> Result<Option<(usize, usize)>, StorageError> {
        let old_slot = self.slot_of(old)?;
        let new_slot = self.slot_of(new)?;

        if let Some(existing) = self.successor_of(old_slot) {
            if existing == new_slot {
                return Ok(None);
            }
            return Err(StorageError::AlreadySuperseded {
                claim: old,
                by: self.claims[existing].claim.id,
            });
        }
        if self.reaches(new_slot, old_slot) {
            return Err(StorageError::CycleDetected { old, new });
        }
        Ok(Some((old_slot, new_slot)))
    }

    fn index_entity(&mut self, entity: Entity) {
        self.entities_by_name
            .entry(entity.lookup_name())
            .or_default()
            .push(entity.id);
        self.entities.insert(entity.id, entity);
    }

    fn index_claim(&mut self, claim: Claim) {
        let slot = self.claims.len();

        self.by_id.insert(claim.id, slot);
        self.by_entity.entry(claim.subject).or_default().push(slot);
        if let Some(object) = claim.object.as_entity() {
            if object != claim.subject {
                self.by_entity.entry(object).or_default().push(slot);
            }
        }
        self.by_fact.entry(claim.fact_key()).or_default().push(slot);
        self.by_slot.entry(claim.slot_key()).or_default().push(slot);
        self.by_time
            .entry(claim.interval.from)
            .or_default()
            .push(slot);

        self.claims.push(StoredClaim {
            claim,
            successor: AtomicU64::new(0),
        });
    }

    fn link(&self, old_slot: usize, new_slot: usize) -> Result<(), StorageError> {
        let encoded = u64::try_from(new_slot + 1)
            .map_err(|_| StorageError::Backend("claim arena overflow".to_string()))?;
        self.claims[old_slot]
            .successor
            .compare_exchange(0, encoded, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|current| StorageError::AlreadySuperseded {
                claim: self.claims[old_slot].claim.id,
                by: usize::try_from(current)
                    .ok()
                    .and_then(|c| c.checked_sub(1))
                    .and_then(|c| self.claims.get(c))
                    .map_or(self.claims[old_slot].claim.id, |s| s.claim.id),
            })
    }

    fn unlink(&self, old_slot: usize) {
        self.claims[old_slot].successor.store(0, Ordering::Release);
    }

    /// Applies one record during replay or rebuild.
    fn apply(&mut self, record: &LogRecord) -> Result<(), StorageError> {
        match &record.kind {
            LogEntryKind::EntityPut(entity) => {
                entity.validate()?;
                if self.entities.contains_key(&entity.id) {
                    return Err(StorageError::DuplicateKey(entity.id.to_string()));
                }
                self.index_entity(entity.clone());
            }
            LogEntryKind::ClaimPut(claim) => {
                self.check_claim(claim)?;
                let mut claim = claim.clone();
                claim.superseded_by = None;
                claim.sequence = record.sequence;
                self.index_claim(claim);
            }
            LogEntryKind::Supersede { old, new } => {
                if let Some((old_slot, new_slot)) = self.check_supersede(*old, *new)? {
                    self.link(old_slot, new_slot)?;
                }
            }
            LogEntryKind::GapPut(gap) => {
                self.gaps.insert(gap.id, gap.clone());
            }
            LogEntryKind::AttemptRecorded(attempt) => {
                self.attempts
                    .entry(attempt.gap)
                    .or_default()
                    .push(attempt.clone());
            }
        }
        self.last_sequence = self.last_sequence.max(record.sequence);
        self.log.push(record.clone());
        Ok(())
    }
}

/// The claim store.
///
/// # Examples
///
/// ```
/// use kyrograph::{ClaimStore, Entity, EntityKind};
///
/// let store = ClaimStore::in_memory();
/// let bert = Entity::new("BERT", EntityKind::Artifact).unwrap();
/// let id = store.put_entity(bert).unwrap();
/// assert!(store.entity(id).unwrap().is_some());
/// ```
pub struct ClaimStore {
    state: RwLock<StoreState>,
    sink: Arc<dyn LogSink>,
}

impl std::fmt::Debug for ClaimStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimStore")
            .field("sink", &self.sink.name())
            .finish_non_exhaustive()
    }
}

impl ClaimStore {
    /// Creates an empty store backed by a fresh [`MemoryLog`].
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            sink: Arc::new(MemoryLog::new()),
        }
    }

    /// Opens a store over `sink`, replaying its records and rebuilding all
    /// indices.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the sink cannot be read or a replayed record
    /// is inconsistent with the ones before it.
    pub fn open(sink: Arc<dyn LogSink>) -> Result<Self, StorageError> {
        let records = sink.replay()?;
        let mut state = StoreState::default();
        for record in &records {
            state.apply(record)?;
        }
        info!(
            backend = sink.name(),
            records = records.len(),
            claims = state.claims.len(),
            entities = state.entities.len(),
            gaps = state.gaps.len(),
            "replayed claim log"
        );
        Ok(Self {
            state: RwLock::new(state),
            sink,
        })
    }

    /// Appends `kind` to the log and, only if that succeeded, applies it.
    fn commit(
        &self,
        state: &mut StoreState,
        kind: LogEntryKind,
    ) -> Result<u64, StorageError> {
        let record = LogRecord {
            sequence: state.last_sequence + 1,
            timestamp: Utc::now(),
            kind,
        };
        self.sink.append(&record)?;
        let sequence = record.sequence;
        state.last_sequence = sequence;
        state.log.push(record);
        Ok(sequence)
    }

    /// Commits an entity.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateKey` if the id is taken, `InvariantViolation` on a
    /// malformed entity, or a backend error.
    pub fn put_entity(&self, entity: Entity) -> Result<EntityId, StorageError> {
        entity.validate()?;
        let mut state = self.state.write().map_err(|_| lock_err("entity.put"))?;
        if state.entities.contains_key(&entity.id) {
            return Err(StorageError::DuplicateKey(entity.id.to_string()));
        }
        let id = entity.id;
        self.commit(&mut state, LogEntryKind::EntityPut(entity.clone()))?;
        state.index_entity(entity);
        debug!(entity = %id, "committed entity");
        Ok(id)
    }

    /// Resolves `(name, kind)` to an existing entity, creating it if absent.
    ///
    /// Names match after normalization. Returns the entity and whether it
    /// was created by this call.
    ///
    /// # Errors
    ///
    /// Returns `InvariantViolation` for a blank name, or a backend error.
    pub fn ensure_entity(
        &self,
        name: &str,
        kind: &EntityKind,
    ) -> Result<(Entity, bool), StorageError> {
        let candidate = Entity::new(name, kind.clone())?;
        let key = candidate.lookup_name();

        let mut state = self.state.write().map_err(|_| lock_err("entity.ensure"))?;
        let existing = state
            .entities_by_name
            .get(&key)
            .into_iter()
            .flatten()
            .filter_map(|id| state.entities.get(id))
            .find(|e| &e.kind == kind)
            .cloned();
        if let Some(entity) = existing {
            return Ok((entity, false));
        }

        self.commit(&mut state, LogEntryKind::EntityPut(candidate.clone()))?;
        state.index_entity(candidate.clone());
        debug!(entity = %candidate.id, name = %candidate.canonical_name, "created entity");
        Ok((candidate, true))
    }

    /// # Errors
    ///
    /// Returns `StorageError::Backend` if the lock is poisoned.
    pub fn entity(&self, id: EntityId) -> Result<Option<Entity>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("entity.get"))?;
        Ok(state.entities.get(&id).cloned())
    }

    /// Entities whose normalized name matches `name`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Backend` if the lock is poisoned.
    pub fn find_entities_by_name(&self, name: &str) -> Result<Vec<Entity>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("entity.find_by_name"))?;
        Ok(state
            .entities_by_name
            .get(&normalize_name(name))
            .into_iter()
            .flatten()
            .filter_map(|id| state.entities.get(id).cloned())
            .collect())
    }

    /// All entity ids, in no particular order.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Backend` if the lock is poisoned.
    pub fn entity_ids(&self) -> Result<Vec<EntityId>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("entity.ids"))?;
        Ok(state.entities.keys().copied().collect())
    }

    /// Commits a claim and returns its id.
    ///
    /// The store assigns `sequence` and `committed_at`; any incoming
    /// `superseded_by` is ignored.
    ///
    /// # Errors
    ///
    /// - `InvariantViolation`: missing subject/predicate/object, malformed
    ///   interval, zero sources
    /// - `EntityNotFound`: subject or object entity is not committed
    /// - `DuplicateKey`: the claim id is taken
    pub fn put_claim(&self, mut claim: Claim) -> Result<ClaimId, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("claim.put"))?;
        state.check_claim(&claim)?;

        claim.superseded_by = None;
        claim.sequence = state.last_sequence + 1;
        claim.committed_at = Utc::now();
        let id = claim.id;

        let sequence = self.commit(&mut state, LogEntryKind::ClaimPut(claim.clone()))?;
        debug_assert_eq!(sequence, claim.sequence);
        state.index_claim(claim);
        debug!(claim = %id, sequence, "committed claim");
        Ok(id)
    }

    /// # Errors
    ///
    /// Returns `StorageError::Backend` if the lock is poisoned.
    pub fn claim(&self, id: ClaimId) -> Result<Option<Claim>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("claim.get"))?;
        Ok(state.by_id.get(&id).and_then(|&slot| state.view(slot)))
    }

    /// Claims matching `query` in commit order, restricted to those whose
    /// interval contains `as_of` when given.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Backend` if the lock is poisoned.
    pub fn get_claims_for(
        &self,
        query: &ClaimQuery,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Vec<Claim>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("claim.query"))?;
        Ok(state
            .slots_for(query)
            .into_iter()
            .filter(|&slot| as_of.map_or(true, |t| state.claims[slot].claim.interval.contains(t)))
            .filter_map(|slot| state.view(slot))
            .collect())
    }

    /// Claims whose interval overlaps `range`, in commit order.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Backend` if the lock is poisoned.
    pub fn claims_in_range(&self, range: &Interval) -> Result<Vec<Claim>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("claim.range"))?;
        let starts = match range.until {
            Some(until) => state.by_time.range(..=until),
            None => state.by_time.range(..),
        };
        let mut slots: Vec<usize> = starts
            .flat_map(|(_, slots)| slots.iter().copied())
            .filter(|&slot| state.claims[slot].claim.interval.overlaps(range))
            .collect();
        slots.sort_unstable();
        Ok(slots.into_iter().filter_map(|slot| state.view(slot)).collect())
    }

    /// Number of claims with `entity` as subject.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Backend` if the lock is poisoned.
    pub fn subject_claim_count(&self, entity: EntityId) -> Result<usize, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("claim.count"))?;
        Ok(state
            .by_entity
            .get(&entity)
            .into_iter()
            .flatten()
            .filter(|&&slot| state.claims[slot].claim.subject == entity)
            .count())
    }

    /// Links `old` to its successor `new`.
    ///
    /// The link is refused if `new` already (transitively) leads back to
    /// `old`. Re-linking an existing `old -> new` pair is a no-op.
    ///
    /// # Errors
    ///
    /// - `ClaimNotFound`: either claim is unknown
    /// - `CycleDetected`: the link would close a loop
    /// - `AlreadySuperseded`: `old` already points at a different claim
    pub fn supersede(&self, old: ClaimId, new: ClaimId) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("claim.supersede"))?;
        if old == new {
            return Err(StorageError::CycleDetected { old, new });
        }
        let Some((old_slot, new_slot)) = state.check_supersede(old, new)? else {
            return Ok(());
        };

        state.link(old_slot, new_slot)?;
        if let Err(err) = self.commit(&mut state, LogEntryKind::Supersede { old, new }) {
            state.unlink(old_slot);
            return Err(err);
        }
        debug!(old = %old, new = %new, "superseded claim");
        Ok(())
    }

    /// Inserts or replaces a gap snapshot.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the log append fails.
    pub fn put_gap(&self, gap: Gap) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("gap.put"))?;
        self.commit(&mut state, LogEntryKind::GapPut(gap.clone()))?;
        state.gaps.insert(gap.id, gap);
        Ok(())
    }

    /// Atomically reads, modifies and re-commits a gap.
    ///
    /// `update` sees the current snapshot; if it returns an error nothing is
    /// written.
    ///
    /// # Errors
    ///
    /// Returns `GapNotFound`, the error produced by `update`, or a backend
    /// error.
    pub fn update_gap<E, F>(&self, id: GapId, update: F) -> Result<Gap, E>
    where
        E: From<StorageError>,
        F: FnOnce(&mut Gap) -> Result<(), E>,
    {
        let mut state = self.state.write().map_err(|_| lock_err("gap.update"))?;
        let mut gap = state
            .gaps
            .get(&id)
            .cloned()
            .ok_or(StorageError::GapNotFound(id))?;
        update(&mut gap)?;
        gap.updated_at = Utc::now();
        self.commit(&mut state, LogEntryKind::GapPut(gap.clone()))?;
        state.gaps.insert(id, gap.clone());
        Ok(gap)
    }

    /// # Errors
    ///
    /// Returns `StorageError::Backend` if the lock is poisoned.
    pub fn gap(&self, id: GapId) -> Result<Option<Gap>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("gap.get"))?;
        Ok(state.gaps.get(&id).cloned())
    }

    /// Gaps matching `filter`, highest priority first, oldest first on ties.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Backend` if the lock is poisoned.
    pub fn list_gaps(&self, filter: &GapFilter) -> Result<Vec<Gap>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("gap.list"))?;
        let mut gaps: Vec<Gap> = state
            .gaps
            .values()
            .filter(|g| filter.matches(g))
            .cloned()
            .collect();
        gaps.sort_by(|a, b| {
            b.priority
                .total_cmp(&a.priority)
                .then_with(|| a.detected_at.cmp(&b.detected_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(gaps)
    }

    /// # Errors
    ///
    /// Returns a backend error if the log append fails.
    pub fn record_attempt(&self, attempt: ResolutionAttempt) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("attempt.record"))?;
        if !state.gaps.contains_key(&attempt.gap) {
            return Err(StorageError::GapNotFound(attempt.gap));
        }
        self.commit(&mut state, LogEntryKind::AttemptRecorded(attempt.clone()))?;
        state
            .attempts
            .entry(attempt.gap)
            .or_default()
            .push(attempt);
        Ok(())
    }

    /// Attempts recorded against `gap`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Backend` if the lock is poisoned.
    pub fn attempts(&self, gap: GapId) -> Result<Vec<ResolutionAttempt>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("attempt.list"))?;
        Ok(state.attempts.get(&gap).cloned().unwrap_or_default())
    }

    /// Regenerates every index from the in-memory log.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the log no longer replays cleanly; the
    /// previous indices are kept in that case.
    pub fn rebuild_indices(&self) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("store.rebuild"))?;
        let mut rebuilt = StoreState::default();
        for record in &state.log {
            rebuilt.apply(record)?;
        }
        debug!(records = rebuilt.log.len(), "rebuilt indices");
        *state = rebuilt;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `StorageError::Backend` if the lock is poisoned.
    pub fn claim_count(&self) -> Result<usize, StorageError> {
        Ok(self.state.read().map_err(|_| lock_err("store.stats"))?.claims.len())
    }

    /// # Errors
    ///
    /// Returns `StorageError::Backend` if the lock is poisoned.
    pub fn entity_count(&self) -> Result<usize, StorageError> {
        Ok(self.state.read().map_err(|_| lock_err("store.stats"))?.entities.len())
    }

    /// Committed log records, in commit order.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Backend` if the lock is poisoned.
    pub fn log_records(&self) -> Result<Vec<LogRecord>, StorageError> {
        Ok(self.state.read().map_err(|_| lock_err("store.log"))?.log.clone())
    }

    /// Poisons the state lock so every later access fails.
    #[cfg(test)]
    pub(crate) fn poison_lock(&self) {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = self.state.write();
            panic!("store lock poisoned on purpose");
        }));
    }
}
