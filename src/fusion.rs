//! Confidence fusion.
//!
//! Each claim contributes evidence per source: `raw × authority × freshness`,
//! discounted once per hedge. Evidence for one fact variant is deduplicated
//! by source (a source counts once, at its strongest) and combined by the
//! configured [`FusionStrategy`].
//!
//! The default strategy is logistic accumulation:
//!
//! ```text
//! f(S) = (σ(a + b·S) − σ(a)) / (1 − σ(a)),   a = −1.6, b = 1.78
//! ```
//!
//! where `S` is the summed evidence. `f(0) = 0`, `f` is strictly increasing
//! and bounded by 1, so corroboration always helps and never saturates
//! early: one strong source gives about 0.40, two about 0.80, three 0.95.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::claim::{Claim, ClaimId, FactKey};
use crate::config::FusionConfig;
use crate::conflict::ContradictionRule;
use crate::error::{GraphError, GraphResult};
use crate::source::SourceId;
use crate::storage::{ClaimQuery, ClaimStore};

const LOGISTIC_PRIOR: f64 = -1.6;
const LOGISTIC_GAIN: f64 = 1.78;

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// How per-source evidence combines into one confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionStrategy {
    /// Logistic evidence accumulation.
    #[default]
    Logistic,
    /// `1 − Π(1 − eᵢ)`.
    NoisyOr,
    /// Strongest single source.
    Maximum,
}

impl FusionStrategy {
    /// Combines deduplicated per-source evidence values.
    #[must_use]
    pub fn combine<I>(self, evidence: I) -> f64
    where
        I: IntoIterator<Item = f64>,
    {
        let values = evidence.into_iter().map(|e| e.clamp(0.0, 1.0));
        let fused = match self {
            Self::Logistic => {
                let total: f64 = values.sum();
                if total <= 0.0 {
                    return 0.0;
                }
                let base = sigmoid(LOGISTIC_PRIOR);
                (sigmoid(LOGISTIC_PRIOR + LOGISTIC_GAIN * total) - base) / (1.0 - base)
            }
            Self::NoisyOr => 1.0 - values.fold(1.0, |acc, e| acc * (1.0 - e)),
            Self::Maximum => values.fold(0.0, f64::max),
        };
        fused.clamp(0.0, 1.0)
    }
}

/// Per-source evidence for one fact variant.
///
/// Absorbing keeps the maximum per source, so absorbing the same claim
/// twice changes nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvidenceAccumulator {
    by_source: BTreeMap<SourceId, f64>,
}

impl EvidenceAccumulator {
    /// An accumulator with no evidence.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `evidence` from `source`, keeping the stronger of old and new.
    pub fn absorb(&mut self, source: SourceId, evidence: f64) {
        let slot = self.by_source.entry(source).or_insert(0.0);
        if evidence > *slot {
            *slot = evidence;
        }
    }

    /// Absorbs every source of `other`.
    pub fn merge(&mut self, other: &Self) {
        for (&source, &evidence) in &other.by_source {
            self.absorb(source, evidence);
        }
    }

    /// Summed evidence across sources.
    #[must_use]
    pub fn total(&self) -> f64 {
        self.by_source.values().sum()
    }

    /// Number of distinct sources.
    #[must_use]
    pub fn source_count(&self) -> usize {
        self.by_source.len()
    }

    /// Whether nothing has been absorbed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_source.is_empty()
    }

    /// Fused confidence under `strategy`.
    #[must_use]
    pub fn confidence(&self, strategy: FusionStrategy) -> f64 {
        strategy.combine(self.by_source.values().copied())
    }
}

/// The derived, current view of one fact variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedFact {
    /// The fact variant.
    pub key: FactKey,
    /// Stable content identity of `key`.
    pub fact_id: String,
    /// Fused confidence in `[0, 1]`.
    pub confidence: f64,
    /// Whether a live contradicting variant exists.
    pub conflicted: bool,
    /// Contradicting variants that are live at the same time.
    pub rivals: Vec<FactKey>,
    /// Live claims backing this variant, in commit order.
    pub claims: Vec<ClaimId>,
    /// Distinct sources behind the confidence.
    pub source_count: usize,
    /// Strategy the confidence was computed with.
    pub strategy: FusionStrategy,
    /// Point in time for a historical view; `None` for the current one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub as_of: Option<DateTime<Utc>>,
}

/// Computes fused confidence for fact variants.
///
/// Accumulators for the current view are cached per fact key. Writers call
/// [`absorb`](Self::absorb) after committing a claim and
/// [`invalidate`](Self::invalidate) after superseding one; cache misses are
/// rebuilt from the store under the cache lock.
#[derive(Debug)]
pub struct FusionEngine {
    store: Arc<ClaimStore>,
    rule: Arc<ContradictionRule>,
    strategy: FusionStrategy,
    hedge_discount: f64,
    cache: RwLock<HashMap<FactKey, EvidenceAccumulator>>,
}

impl FusionEngine {
    /// An engine over `store` using `rule` to find rivals.
    #[must_use]
    pub fn new(store: Arc<ClaimStore>, rule: Arc<ContradictionRule>, config: &FusionConfig) -> Self {
        Self {
            store,
            rule,
            strategy: config.strategy,
            hedge_discount: config.hedge_discount.clamp(0.0, 1.0),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// The configured strategy.
    #[must_use]
    pub const fn strategy(&self) -> FusionStrategy {
        self.strategy
    }

    /// The contradiction rule used to find rivals.
    #[must_use]
    pub fn rule(&self) -> &ContradictionRule {
        &self.rule
    }

    /// Per-source evidence carried by one claim.
    #[must_use]
    pub fn evidence(&self, claim: &Claim) -> EvidenceAccumulator {
        let exponent = i32::try_from(claim.hedges.len()).unwrap_or(i32::MAX);
        let discount = self.hedge_discount.powi(exponent);
        let mut acc = EvidenceAccumulator::new();
        for contribution in &claim.contributions {
            acc.absorb(contribution.source_id(), contribution.evidence() * discount);
        }
        acc
    }

    fn accumulate<'a>(&self, claims: impl IntoIterator<Item = &'a Claim>) -> EvidenceAccumulator {
        let mut acc = EvidenceAccumulator::new();
        for claim in claims {
            acc.merge(&self.evidence(claim));
        }
        acc
    }

    fn live_claims(&self, key: &FactKey, as_of: Option<DateTime<Utc>>) -> GraphResult<Vec<Claim>> {
        Ok(self
            .store
            .get_claims_for(&ClaimQuery::Fact(key.clone()), as_of)?
            .into_iter()
            .filter(|c| !c.is_superseded())
            .collect())
    }

    fn cached(&self, key: &FactKey) -> GraphResult<EvidenceAccumulator> {
        {
            let cache = self
                .cache
                .read()
                .map_err(|_| GraphError::internal("poisoned lock: fusion.cache"))?;
            if let Some(acc) = cache.get(key) {
                return Ok(acc.clone());
            }
        }
        let mut cache = self
            .cache
            .write()
            .map_err(|_| GraphError::internal("poisoned lock: fusion.cache"))?;
        if let Some(acc) = cache.get(key) {
            return Ok(acc.clone());
        }
        // Read under the cache lock so a concurrent absorb cannot be lost.
        let acc = self.accumulate(&self.live_claims(key, None)?);
        cache.insert(key.clone(), acc.clone());
        Ok(acc)
    }

    /// Current fused view of `key`.
    ///
    /// A key with no live claims fuses to confidence 0.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the store cannot be read.
    pub fn fuse(&self, key: &FactKey) -> GraphResult<FusedFact> {
        let live = self.live_claims(key, None)?;
        let acc = self.cached(key)?;
        self.assemble(key, &live, &acc, None)
    }

    /// Fused view of `key` restricted to claims valid at `at`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the store cannot be read.
    pub fn fuse_as_of(&self, key: &FactKey, at: DateTime<Utc>) -> GraphResult<FusedFact> {
        let live = self.live_claims(key, Some(at))?;
        let acc = self.accumulate(&live);
        self.assemble(key, &live, &acc, Some(at))
    }

    /// Confidence `candidate`'s variant would have if it were committed.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the store cannot be read.
    pub fn projected(&self, candidate: &Claim) -> GraphResult<f64> {
        let key = candidate.fact_key();
        let mut acc = self.cached(&key)?;
        acc.merge(&self.evidence(candidate));
        Ok(acc.confidence(self.strategy))
    }

    /// Folds a freshly committed claim into its cached accumulator.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the cache lock is poisoned.
    pub fn absorb(&self, claim: &Claim) -> GraphResult<()> {
        let mut cache = self
            .cache
            .write()
            .map_err(|_| GraphError::internal("poisoned lock: fusion.cache"))?;
        if let Some(acc) = cache.get_mut(&claim.fact_key()) {
            acc.merge(&self.evidence(claim));
            trace!(fact = %claim.fact_key(), sources = acc.source_count(), "absorbed claim");
        }
        Ok(())
    }

    /// Drops the cached accumulator for `key`.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the cache lock is poisoned.
    pub fn invalidate(&self, key: &FactKey) -> GraphResult<()> {
        self.cache
            .write()
            .map_err(|_| GraphError::internal("poisoned lock: fusion.cache"))?
            .remove(key);
        Ok(())
    }

    /// Recomputes `key` from the store, replacing the cached accumulator.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the store cannot be read.
    pub fn recompute(&self, key: &FactKey) -> GraphResult<FusedFact> {
        self.invalidate(key)?;
        self.fuse(key)
    }

    /// Live fact variants that contradict at least one live claim of `key`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the store cannot be read.
    pub fn rivals(&self, key: &FactKey) -> GraphResult<Vec<FactKey>> {
        let live = self.live_claims(key, None)?;
        self.rivals_of(key, &live, None)
    }

    fn rivals_of(
        &self,
        key: &FactKey,
        live: &[Claim],
        as_of: Option<DateTime<Utc>>,
    ) -> GraphResult<Vec<FactKey>> {
        let mut rivals: Vec<FactKey> = Vec::new();
        if live.is_empty() {
            return Ok(rivals);
        }
        let slot = self.store.get_claims_for(&ClaimQuery::Slot(key.slot()), as_of)?;
        for other in slot.iter().filter(|c| !c.is_superseded()) {
            let other_key = other.fact_key();
            if &other_key == key || rivals.contains(&other_key) {
                continue;
            }
            if live.iter().any(|mine| self.rule.classify(mine, other).is_some()) {
                rivals.push(other_key);
            }
        }
        Ok(rivals)
    }

    fn assemble(
        &self,
        key: &FactKey,
        live: &[Claim],
        acc: &EvidenceAccumulator,
        as_of: Option<DateTime<Utc>>,
    ) -> GraphResult<FusedFact> {
        let rivals = self.rivals_of(key, live, as_of)?;
        Ok(FusedFact {
            key: key.clone(),
            fact_id: key.digest(),
            confidence: acc.confidence(self.strategy),
            conflicted: !rivals.is_empty(),
            rivals,
            claims: live.iter().map(|c| c.id).collect(),
            source_count: acc.source_count(),
            strategy: self.strategy,
            as_of,
        })
    }
}
