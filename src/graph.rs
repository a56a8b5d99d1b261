//! The knowledge graph facade.
//!
//! [`KnowledgeGraph`] wires the store, fusion, conflict detection, temporal
//! reasoning and the gap manager together and exposes the query and command
//! surface used by embedders and the transport layer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::claim::{Claim, ClaimId, FactKey, Object};
use crate::config::GraphConfig;
use crate::conflict::{ConflictDetector, ContradictionRule};
use crate::entity::EntityId;
use crate::error::GraphResult;
use crate::fusion::{FusedFact, FusionEngine};
use crate::gap::{
    CycleReport, DetachedResearcher, Gap, GapFilter, GapId, GapKind, GapLifecycleManager, GapState,
    GapTarget, Researcher, ResolutionAttempt,
};
use crate::ingest::{CandidateClaim, CommitPipeline, CommitReceipt, ConsistencyMode};
use crate::storage::ClaimStore;
use crate::temporal::{AllenRelation, TemporalReasoner};

/// A temporal knowledge graph instance.
#[derive(Debug)]
pub struct KnowledgeGraph {
    config: GraphConfig,
    store: Arc<ClaimStore>,
    fusion: Arc<FusionEngine>,
    pipeline: Arc<CommitPipeline>,
    temporal: TemporalReasoner,
    gaps: GapLifecycleManager,
}

fn open_configured_store(config: &GraphConfig) -> GraphResult<ClaimStore> {
    match &config.storage.data_dir {
        None => Ok(ClaimStore::in_memory()),
        #[cfg(feature = "persistent")]
        Some(dir) => Ok(crate::storage::persistent::open_store(
            dir,
            config.storage.sync_on_write,
        )?),
        #[cfg(not(feature = "persistent"))]
        Some(dir) => Err(crate::error::GraphError::config(format!(
            "storage.data_dir is {} but the `persistent` feature is disabled",
            dir.display()
        ))),
    }
}

impl KnowledgeGraph {
    /// Opens a graph as configured, researching gaps with `researcher`.
    ///
    /// # Errors
    ///
    /// `Config` for invalid settings, or a storage error if the log cannot
    /// be opened and replayed.
    pub fn new(config: GraphConfig, researcher: Arc<dyn Researcher>) -> GraphResult<Self> {
        config.validate()?;
        let store = Arc::new(open_configured_store(&config)?);
        Self::with_store(store, config, researcher)
    }

    /// In-memory graph with default settings and no research collaborator.
    ///
    /// # Errors
    ///
    /// `Internal` if the research workers cannot start.
    pub fn in_memory() -> GraphResult<Self> {
        Self::with_store(
            Arc::new(ClaimStore::in_memory()),
            GraphConfig::default(),
            Arc::new(DetachedResearcher),
        )
    }

    /// Builds a graph over an existing store.
    ///
    /// # Errors
    ///
    /// `Config` for invalid settings.
    pub fn with_store(
        store: Arc<ClaimStore>,
        config: GraphConfig,
        researcher: Arc<dyn Researcher>,
    ) -> GraphResult<Self> {
        config.validate()?;
        let rule = Arc::new(ContradictionRule::new(
            config.conflicts.multi_valued_predicates.iter().cloned(),
        ));
        let fusion = Arc::new(FusionEngine::new(Arc::clone(&store), rule, &config.fusion));
        let detector = ConflictDetector::new(
            Arc::clone(&store),
            Arc::clone(&fusion),
            config.conflicts.policy,
        );
        let pipeline = Arc::new(CommitPipeline::new(
            Arc::clone(&store),
            Arc::clone(&fusion),
            detector,
            config.fusion.freshness_half_life_days,
        ));
        let gaps = GapLifecycleManager::new(
            Arc::clone(&pipeline),
            researcher,
            &config.gaps,
            config.conflicts.research_mode,
        )?;
        info!(
            claims = store.claim_count()?,
            entities = store.entity_count()?,
            strategy = ?config.fusion.strategy,
            policy = ?config.conflicts.policy,
            "knowledge graph ready"
        );
        Ok(Self {
            temporal: TemporalReasoner::new(Arc::clone(&store)),
            config,
            store,
            fusion,
            pipeline,
            gaps,
        })
    }

    /// The configuration the graph was opened with.
    #[must_use]
    pub const fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// The underlying claim store.
    #[must_use]
    pub fn store(&self) -> &Arc<ClaimStore> {
        &self.store
    }

    /// The fusion engine.
    #[must_use]
    pub fn fusion(&self) -> &Arc<FusionEngine> {
        &self.fusion
    }

    /// The temporal reasoner.
    #[must_use]
    pub const fn temporal(&self) -> &TemporalReasoner {
        &self.temporal
    }

    /// The gap lifecycle manager.
    #[must_use]
    pub const fn gap_manager(&self) -> &GapLifecycleManager {
        &self.gaps
    }

    /// Submits a candidate in the default (eventual) consistency mode.
    ///
    /// # Errors
    ///
    /// See [`submit_with_mode`](Self::submit_with_mode).
    pub fn submit(&self, candidate: &CandidateClaim) -> GraphResult<CommitReceipt> {
        self.submit_with_mode(candidate, ConsistencyMode::default())
    }

    /// Submits a candidate. Contradictions the commit leaves open raise
    /// contradiction gaps, and every entity the commit created is scanned
    /// for undefined-term and missing-prerequisite gaps.
    ///
    /// # Errors
    ///
    /// `Validation` for a malformed candidate, `ConflictDetected` when the
    /// mode or policy refuses it, or a storage error.
    pub fn submit_with_mode(
        &self,
        candidate: &CandidateClaim,
        mode: ConsistencyMode,
    ) -> GraphResult<CommitReceipt> {
        let receipt = self.pipeline.submit(candidate, mode)?;
        for conflict in &receipt.conflicts {
            if let Err(e) = self.gaps.detect_contradiction(conflict) {
                warn!(fact = %conflict.incoming, error = %e, "failed to raise contradiction gap");
            }
        }
        for &entity in &receipt.created_entities {
            if let Err(e) = self.gaps.scan_entity(entity) {
                warn!(%entity, error = %e, "failed to scan new entity for gaps");
            }
        }
        Ok(receipt)
    }

    /// Current fused view of `(subject, predicate, object)` affirmed.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the store cannot be read.
    pub fn fact(
        &self,
        subject: EntityId,
        predicate: &str,
        object: impl Into<Object>,
    ) -> GraphResult<FusedFact> {
        self.fusion.fuse(&FactKey::affirmed(subject, predicate, object))
    }

    /// # Errors
    ///
    /// Returns a storage error if the store cannot be read.
    pub fn fact_by_key(&self, key: &FactKey) -> GraphResult<FusedFact> {
        self.fusion.fuse(key)
    }

    /// # Errors
    ///
    /// Returns a storage error if the store cannot be read.
    pub fn fact_as_of(&self, key: &FactKey, at: DateTime<Utc>) -> GraphResult<FusedFact> {
        self.fusion.fuse_as_of(key, at)
    }

    /// Claims about `entity` valid at `at` (now when `None`).
    ///
    /// # Errors
    ///
    /// Returns a storage error if the store cannot be read.
    pub fn entity_state(&self, entity: EntityId, at: Option<DateTime<Utc>>) -> GraphResult<Vec<Claim>> {
        self.temporal.entity_state(entity, at.unwrap_or_else(Utc::now))
    }

    /// # Errors
    ///
    /// `Temporal(BrokenChain)` if the supersession chain has a cycle.
    pub fn history(&self, key: &FactKey) -> GraphResult<Vec<Claim>> {
        self.temporal.history(key)
    }

    /// # Errors
    ///
    /// `Storage(ClaimNotFound)` for an unknown claim.
    pub fn relation(&self, a: ClaimId, b: ClaimId) -> GraphResult<AllenRelation> {
        self.temporal.relation_between(a, b)
    }

    /// Gaps filtered by state and minimum priority, highest priority first.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the store cannot be read.
    pub fn gaps(&self, state: Option<GapState>, priority_min: Option<f64>) -> GraphResult<Vec<Gap>> {
        Ok(self.store.list_gaps(&GapFilter {
            state,
            priority_min,
            kind: None,
        })?)
    }

    /// # Errors
    ///
    /// Returns a storage error if the store cannot be read.
    pub fn gap(&self, id: GapId) -> GraphResult<Option<Gap>> {
        Ok(self.store.gap(id)?)
    }

    /// # Errors
    ///
    /// Returns a storage error if the store cannot be read.
    pub fn attempts(&self, id: GapId) -> GraphResult<Vec<ResolutionAttempt>> {
        Ok(self.store.attempts(id)?)
    }

    /// # Errors
    ///
    /// See [`GapLifecycleManager::report_gap`].
    pub fn report_gap(
        &self,
        target: GapTarget,
        kind: GapKind,
        priority_hint: Option<f64>,
        domains: Vec<String>,
    ) -> GraphResult<Gap> {
        self.gaps.report_gap(target, kind, priority_hint, domains)
    }

    /// # Errors
    ///
    /// See [`GapLifecycleManager::scan_entity`].
    pub fn scan_entity(&self, entity: EntityId) -> GraphResult<Vec<Gap>> {
        self.gaps.scan_entity(entity)
    }

    /// # Errors
    ///
    /// See [`GapLifecycleManager::approve`].
    pub fn approve_gap(&self, id: GapId, approver: &str) -> GraphResult<Gap> {
        self.gaps.approve(id, approver)
    }

    /// # Errors
    ///
    /// See [`GapLifecycleManager::research`].
    pub fn research_gap(&self, id: GapId) -> GraphResult<Gap> {
        self.gaps.research(id)
    }

    /// # Errors
    ///
    /// See [`GapLifecycleManager::run_cycle`].
    pub fn run_research_cycle(&self) -> GraphResult<CycleReport> {
        self.gaps.run_cycle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use crate::entity::EntityKind;
    use crate::error::GraphError;
    use crate::ingest::{EntityRef, SourceInfo};
    use crate::value::Value;

    fn y(n: i32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(n, 1, 1, 0, 0, 0).unwrap()
    }

    fn released(year: i64, source: &str) -> CandidateClaim {
        CandidateClaim::new(
            EntityRef::named("BERT", EntityKind::Artifact),
            "released",
            Value::Int(year),
            SourceInfo::new(source, 1.0, y(2020)).with_freshness(1.0),
        )
        .raw_confidence(0.9)
        .valid_from(y(2018))
    }

    #[test]
    fn test_conflicting_submission_raises_gap() {
        let graph = KnowledgeGraph::in_memory().unwrap();
        let first = graph.submit(&released(2018, "arxiv")).unwrap();
        let second = graph.submit(&released(2017, "blog")).unwrap();
        assert_eq!(second.conflicts.len(), 1);

        let bert = first.fact.subject;
        let fact = graph.fact(bert, "released", Value::Int(2018)).unwrap();
        assert!(fact.conflicted);
        assert_eq!(fact.rivals, vec![second.fact.clone()]);

        let gaps = graph
            .store()
            .list_gaps(&GapFilter {
                state: Some(GapState::Queued),
                kind: Some(GapKind::Contradiction),
                ..GapFilter::default()
            })
            .unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].target, GapTarget::Fact(second.fact));
    }

    #[test]
    fn test_new_object_entity_raises_undefined_term_gap() {
        let graph = KnowledgeGraph::in_memory().unwrap();
        let receipt = graph
            .submit(&CandidateClaim::new(
                EntityRef::named("BERT", EntityKind::Artifact),
                "based_on",
                EntityRef::named("Transformer", EntityKind::Concept),
                SourceInfo::new("arxiv.org", 0.9, y(2020)).with_freshness(1.0),
            ))
            .unwrap();
        assert_eq!(receipt.created_entities.len(), 2);
        let Object::Entity(transformer) = receipt.fact.object else {
            panic!("object should resolve to an entity");
        };

        let gaps = graph.gaps(None, None).unwrap();
        let undefined: Vec<&Gap> = gaps
            .iter()
            .filter(|g| g.effective_kind() == GapKind::UndefinedTerm)
            .collect();
        assert_eq!(undefined.len(), 1);
        assert_eq!(undefined[0].target, GapTarget::Entity(transformer));
        assert!(gaps.iter().any(|g| g.target == GapTarget::Entity(receipt.fact.subject)
            && g.effective_kind() == GapKind::MissingPrerequisite));

        // Entities that already existed are not rescanned.
        let again = graph
            .submit(&CandidateClaim::new(
                EntityRef::named("BERT", EntityKind::Artifact),
                "based_on",
                EntityRef::named("Transformer", EntityKind::Concept),
                SourceInfo::new("aclanthology.org", 0.9, y(2020)).with_freshness(1.0),
            ))
            .unwrap();
        assert!(again.created_entities.is_empty());
        assert_eq!(graph.gaps(None, None).unwrap().len(), gaps.len());
    }

    #[test]
    fn test_entity_state_defaults_to_now() {
        let graph = KnowledgeGraph::in_memory().unwrap();
        let receipt = graph.submit(&released(2018, "arxiv")).unwrap();
        let bert = receipt.fact.subject;
        assert_eq!(graph.entity_state(bert, None).unwrap().len(), 1);
        assert!(graph.entity_state(bert, Some(y(2017))).unwrap().is_empty());
    }

    #[test]
    fn test_detached_researcher_rejects() {
        let mut config = GraphConfig::default();
        config.gaps.rails.human_in_the_loop = false;
        let graph = KnowledgeGraph::with_store(
            Arc::new(ClaimStore::in_memory()),
            config,
            Arc::new(DetachedResearcher),
        )
        .unwrap();
        let (bert, _) = graph.store().ensure_entity("BERT", &EntityKind::Artifact).unwrap();
        let gap = graph
            .report_gap(GapTarget::Entity(bert.id), GapKind::MissingPrerequisite, None, Vec::new())
            .unwrap();
        assert!(graph.research_gap(gap.id).is_err());
        assert_eq!(graph.gap(gap.id).unwrap().unwrap().state, GapState::Rejected);
    }

    #[cfg(not(feature = "persistent"))]
    #[test]
    fn test_data_dir_requires_persistent_feature() {
        let mut config = GraphConfig::default();
        config.storage.data_dir = Some("/tmp/kyrograph".into());
        let err = KnowledgeGraph::new(config, Arc::new(DetachedResearcher)).unwrap_err();
        assert!(matches!(err, GraphError::Config { .. }));
    }
}
