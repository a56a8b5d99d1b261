//! Drives gaps through their lifecycle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::claim::{FactKey, Object};
use crate::config::GapConfig;
use crate::conflict::Conflict;
use crate::entity::EntityId;
use crate::error::{GraphError, GraphResult, RailViolation};
use crate::fusion::FusionEngine;
use crate::gap::rails::SafetyRails;
use crate::gap::research::{ResearchHandle, ResearchReport, ResearchRequest, ResearchRuntime, Researcher};
use crate::gap::{
    AttemptOutcome, Gap, GapFilter, GapId, GapKind, GapSignal, GapState, GapTarget,
    ResolutionAttempt,
};
use crate::ingest::{CommitPipeline, ConsistencyMode};
use crate::storage::{ClaimQuery, ClaimStore, StorageError};

/// Claims referencing an entity at which downstream impact reaches 0.5.
const IMPACT_HALF_POINT: f64 = 4.0;

/// Outcome of one [`GapLifecycleManager::run_cycle`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    /// Queued gaps looked at.
    pub examined: usize,
    /// Gaps research filled.
    pub filled: Vec<GapId>,
    /// Gaps research rejected.
    pub rejected: Vec<GapId>,
    /// Gaps whose budget ran out.
    pub expired: Vec<GapId>,
    /// Gaps sent back to the queue after a transient failure.
    pub requeued: Vec<GapId>,
    /// Gaps a rail kept in the queue.
    pub blocked: Vec<(GapId, RailViolation)>,
    /// Gaps that failed for reasons other than a rail, with the error text.
    pub errors: Vec<(GapId, String)>,
}

struct Dispatched {
    gap: Gap,
    request: ResearchRequest,
    handle: ResearchHandle,
    started: Instant,
}

enum Admission {
    Running(Box<Dispatched>),
    Settled(Gap),
}

/// Detects, prioritizes and researches knowledge gaps.
pub struct GapLifecycleManager {
    store: Arc<ClaimStore>,
    fusion: Arc<FusionEngine>,
    pipeline: Arc<CommitPipeline>,
    researcher: Arc<dyn Researcher>,
    rails: SafetyRails,
    runtime: ResearchRuntime,
    config: GapConfig,
    research_mode: ConsistencyMode,
}

impl std::fmt::Debug for GapLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GapLifecycleManager")
            .field("rails", &self.rails)
            .field("runtime", &self.runtime)
            .field("research_mode", &self.research_mode)
            .finish_non_exhaustive()
    }
}

impl GapLifecycleManager {
    /// Creates a manager with its own rails and research pool.
    ///
    /// # Errors
    ///
    /// `Validation` for a malformed allowlist, `Internal` if the research
    /// workers cannot start.
    pub fn new(
        pipeline: Arc<CommitPipeline>,
        researcher: Arc<dyn Researcher>,
        config: &GapConfig,
        research_mode: ConsistencyMode,
    ) -> GraphResult<Self> {
        let rails = SafetyRails::from_config(&config.rails)?;
        let runtime = ResearchRuntime::start(config.concurrency)?;
        Ok(Self {
            store: Arc::clone(pipeline.store()),
            fusion: Arc::clone(pipeline.fusion()),
            pipeline,
            researcher,
            rails,
            runtime,
            config: config.clone(),
            research_mode,
        })
    }

    /// The rails guarding research.
    #[must_use]
    pub const fn rails(&self) -> &SafetyRails {
        &self.rails
    }

    fn load(&self, id: GapId) -> GraphResult<Gap> {
        self.store
            .gap(id)?
            .ok_or_else(|| StorageError::GapNotFound(id).into())
    }

    fn transition<F>(&self, id: GapId, to: GapState, update: F) -> GraphResult<Gap>
    where
        F: FnOnce(&mut Gap),
    {
        let gap = self.store.update_gap(id, |gap: &mut Gap| -> GraphResult<()> {
            if !gap.state.can_transition_to(to) {
                return Err(GraphError::InvalidTransition {
                    gap: gap.id,
                    from: gap.state,
                    to,
                });
            }
            gap.state = to;
            update(gap);
            Ok(())
        })?;
        debug!(gap = %id, state = %to, "gap transitioned");
        Ok(gap)
    }

    fn find_open<P>(&self, predicate: P) -> GraphResult<Option<Gap>>
    where
        P: Fn(&Gap) -> bool,
    {
        Ok(self
            .store
            .list_gaps(&GapFilter::default())?
            .into_iter()
            .find(|g| g.is_open() && predicate(g)))
    }

    fn open(&self, gap: Gap) -> GraphResult<Gap> {
        let id = gap.id;
        info!(gap = %id, kind = %gap.signal.kind(), depth = gap.depth, "gap detected");
        self.store.put_gap(gap)?;
        self.advance(id)
    }

    /// Records a gap raised by an upstream detector and moves it as far
    /// toward the queue as it can go. An open gap with the same target and
    /// kind is returned instead of a duplicate.
    ///
    /// # Errors
    ///
    /// `Storage(EntityNotFound)` if the target entity does not exist.
    pub fn report_gap(
        &self,
        target: GapTarget,
        kind: GapKind,
        priority_hint: Option<f64>,
        domains: Vec<String>,
    ) -> GraphResult<Gap> {
        let entity = target.entity();
        if self.store.entity(entity)?.is_none() {
            return Err(StorageError::EntityNotFound(entity).into());
        }
        if let Some(existing) = self.find_open(|g| g.target == target && g.effective_kind() == kind)? {
            return Ok(existing);
        }
        let mut gap = Gap::detected(target, GapSignal::Reported { kind }, self.config.max_attempts)
            .with_domains(domains);
        if let Some(hint) = priority_hint {
            gap = gap.with_priority_hint(hint);
        }
        self.open(gap)
    }

    /// Raises a contradiction gap for a conflict left open by a commit.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the store cannot be read or written.
    pub fn detect_contradiction(&self, conflict: &Conflict) -> GraphResult<Gap> {
        self.contradiction_gap(&conflict.incoming, &conflict.existing, None)
    }

    fn contradiction_gap(
        &self,
        fact: &FactKey,
        rival: &FactKey,
        parent: Option<&Gap>,
    ) -> GraphResult<Gap> {
        let existing = self.find_open(|g| match (&g.target, &g.signal) {
            (GapTarget::Fact(t), GapSignal::ConflictFlag { rival: r }) => {
                (t == fact && r == rival) || (t == rival && r == fact)
            }
            _ => false,
        })?;
        if let Some(gap) = existing {
            return Ok(gap);
        }
        let mut gap = Gap::detected(
            GapTarget::Fact(fact.clone()),
            GapSignal::ConflictFlag {
                rival: rival.clone(),
            },
            self.config.max_attempts,
        )
        .with_domains(self.config.default_domains.clone());
        if let Some(parent) = parent {
            gap = gap.with_parent(parent.id, parent.depth + 1);
        }
        self.open(gap)
    }

    /// Looks for undefined-term and missing-prerequisite gaps on `entity`.
    ///
    /// An entity referenced only as an object is an undefined term; one
    /// with fewer claims of its own than the prerequisite threshold is
    /// missing prerequisites.
    ///
    /// # Errors
    ///
    /// `Storage(EntityNotFound)` for an unknown entity.
    pub fn scan_entity(&self, entity: EntityId) -> GraphResult<Vec<Gap>> {
        self.scan(entity, None)
    }

    fn scan(&self, entity: EntityId, parent: Option<&Gap>) -> GraphResult<Vec<Gap>> {
        if self.store.entity(entity)?.is_none() {
            return Err(StorageError::EntityNotFound(entity).into());
        }
        let claims = self.store.get_claims_for(&ClaimQuery::Entity(entity), None)?;
        let own = claims.iter().filter(|c| c.subject == entity).count();
        let references = claims.len() - own;
        let threshold = self.config.prerequisite_threshold;

        let signal = if own == 0 && references > 0 {
            GapSignal::UnresolvedReference { references }
        } else if own < threshold {
            GapSignal::SparsePrerequisites {
                claim_count: own,
                threshold,
            }
        } else {
            return Ok(Vec::new());
        };

        let target = GapTarget::Entity(entity);
        let kind = signal.kind();
        if let Some(existing) = self.find_open(|g| g.target == target && g.effective_kind() == kind)? {
            return Ok(vec![existing]);
        }
        let mut gap = Gap::detected(target, signal, self.config.max_attempts)
            .with_domains(self.config.default_domains.clone());
        if let Some(parent) = parent {
            gap = gap.with_parent(parent.id, parent.depth + 1);
        }
        Ok(vec![self.open(gap)?])
    }

    /// `Detected → Classified`: the kind is read off the detection signal.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` unless the gap is `Detected`.
    pub fn classify(&self, id: GapId) -> GraphResult<Gap> {
        self.transition(id, GapState::Classified, |gap| {
            gap.kind = Some(gap.signal.kind());
        })
    }

    /// Priority in `[0, 1]`: the larger of the reported hint and
    /// `0.5 · impact + 0.5 · deficit`.
    ///
    /// Impact is `n / (n + 4)` for `n` claims referencing the target
    /// entity. Deficit is `1 − confidence` of the best-supported fact, or for
    /// a contradiction `1 − |c₁ − c₂|`, so evenly matched rivals rank
    /// highest.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the store cannot be read.
    pub fn priority_of(&self, gap: &Gap) -> GraphResult<f64> {
        let entity = gap.target.entity();
        let claims = self.store.get_claims_for(&ClaimQuery::Entity(entity), None)?;
        #[allow(clippy::cast_precision_loss)]
        let n = claims.len() as f64;
        let impact = n / (n + IMPACT_HALF_POINT);

        let deficit = match (&gap.target, &gap.signal) {
            (GapTarget::Fact(fact), GapSignal::ConflictFlag { rival }) => {
                let a = self.fusion.fuse(fact)?.confidence;
                let b = self.fusion.fuse(rival)?.confidence;
                1.0 - (a - b).abs()
            }
            (GapTarget::Fact(fact), _) => 1.0 - self.fusion.fuse(fact)?.confidence,
            (GapTarget::Entity(_), _) => {
                let mut best = 0.0_f64;
                for claim in claims.iter().filter(|c| c.subject == entity && !c.is_superseded()) {
                    best = best.max(self.fusion.fuse(&claim.fact_key())?.confidence);
                }
                1.0 - best
            }
        };

        let computed = 0.5 * impact + 0.5 * deficit;
        Ok(gap.priority_hint.map_or(computed, |h| h.max(computed)).clamp(0.0, 1.0))
    }

    /// `Classified → Queued` when the priority reaches the floor. Below it
    /// the gap stays classified with its priority updated.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` unless the gap is `Classified`.
    pub fn enqueue(&self, id: GapId) -> GraphResult<Gap> {
        let gap = self.load(id)?;
        if gap.state != GapState::Classified {
            return Err(GraphError::InvalidTransition {
                gap: id,
                from: gap.state,
                to: GapState::Queued,
            });
        }
        let priority = self.priority_of(&gap)?;
        if priority < self.config.priority_floor {
            debug!(gap = %id, priority, floor = self.config.priority_floor, "gap below priority floor");
            return self.store.update_gap(id, |g: &mut Gap| -> GraphResult<()> {
                g.priority = priority;
                Ok(())
            });
        }
        let gap = self.transition(id, GapState::Queued, |g| g.priority = priority)?;
        info!(gap = %id, priority, "gap queued");
        Ok(gap)
    }

    /// Moves a gap through classification and queueing as far as it goes.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the store cannot be read or written.
    pub fn advance(&self, id: GapId) -> GraphResult<Gap> {
        let mut gap = self.load(id)?;
        if gap.state == GapState::Detected {
            gap = self.classify(id)?;
        }
        if gap.state == GapState::Classified {
            gap = self.enqueue(id)?;
        }
        Ok(gap)
    }

    /// Records operator approval for research on an open gap.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` if the gap is already terminal.
    pub fn approve(&self, id: GapId, approver: &str) -> GraphResult<Gap> {
        let approver = approver.trim().to_string();
        let gap = self.store.update_gap(id, |gap: &mut Gap| -> GraphResult<()> {
            if gap.state.is_terminal() {
                return Err(GraphError::InvalidTransition {
                    gap: gap.id,
                    from: gap.state,
                    to: GapState::Researching,
                });
            }
            gap.approved_by = Some(if approver.is_empty() {
                "operator".to_string()
            } else {
                approver
            });
            if gap.blocked_by == Some(RailViolation::AwaitingApproval) {
                gap.blocked_by = None;
            }
            Ok(())
        })?;
        info!(gap = %id, approved_by = ?gap.approved_by, "gap approved");
        Ok(gap)
    }

    /// Queued gaps, highest priority first.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the store cannot be read.
    pub fn queued(&self) -> GraphResult<Vec<Gap>> {
        Ok(self.store.list_gaps(&GapFilter {
            state: Some(GapState::Queued),
            ..GapFilter::default()
        })?)
    }

    fn domains_for(&self, gap: &Gap) -> Vec<String> {
        if gap.target_domains.is_empty() {
            self.config.default_domains.clone()
        } else {
            gap.target_domains.clone()
        }
    }

    fn describe(&self, gap: &Gap) -> GraphResult<String> {
        let name = |id: EntityId| -> GraphResult<String> {
            Ok(self
                .store
                .entity(id)?
                .map_or_else(|| id.to_string(), |e| e.canonical_name))
        };
        Ok(match (&gap.target, &gap.signal) {
            (GapTarget::Fact(fact), GapSignal::ConflictFlag { rival }) => format!(
                "resolve {} {}: {} vs {}",
                name(fact.subject)?,
                fact.predicate,
                fact.object,
                rival.object
            ),
            (GapTarget::Fact(fact), _) => {
                format!("verify {} {} {}", name(fact.subject)?, fact.predicate, fact.object)
            }
            (GapTarget::Entity(id), _) => match gap.effective_kind() {
                GapKind::UndefinedTerm => format!("define {}", name(*id)?),
                GapKind::MissingPrerequisite => format!("background on {}", name(*id)?),
                GapKind::Contradiction => format!("resolve conflicting claims about {}", name(*id)?),
            },
        })
    }

    fn record(
        &self,
        gap: &Gap,
        query: &str,
        sources: Vec<String>,
        outcome: AttemptOutcome,
        report: Option<&ResearchReport>,
        note: Option<String>,
    ) -> GraphResult<()> {
        self.store.record_attempt(ResolutionAttempt {
            gap: gap.id,
            query: query.to_string(),
            sources_consulted: sources,
            outcome,
            committed: report
                .map(|r| r.committed.iter().map(|c| c.claim_id).collect())
                .unwrap_or_default(),
            note,
            at: Utc::now(),
        })?;
        Ok(())
    }

    fn block(&self, id: GapId, violation: RailViolation) -> GraphError {
        info!(gap = %id, reason = %violation, "research blocked by safety rail");
        let recorded = self.store.update_gap(id, |g: &mut Gap| -> GraphResult<()> {
            g.blocked_by = Some(violation.clone());
            Ok(())
        });
        match recorded {
            Ok(_) => GraphError::Rail(violation),
            Err(e) => e,
        }
    }

    fn dispatch(&self, id: GapId) -> GraphResult<Admission> {
        let gap = self.load(id)?;
        if gap.state != GapState::Queued {
            return Err(GraphError::InvalidTransition {
                gap: id,
                from: gap.state,
                to: GapState::Researching,
            });
        }
        let query = self.describe(&gap)?;

        if gap.budget.is_exhausted(Utc::now()) {
            let gap = self.transition(id, GapState::Expired, |_| {})?;
            self.record(
                &gap,
                &query,
                Vec::new(),
                AttemptOutcome::Exhausted,
                None,
                Some("research budget exhausted".into()),
            )?;
            info!(gap = %id, "gap expired before research");
            return Ok(Admission::Settled(gap));
        }

        let domains = self.domains_for(&gap);
        let permit = self.runtime.reserve().map_err(|v| self.block(id, v))?;
        self.rails.check(&gap, &domains).map_err(|v| self.block(id, v))?;
        self.rails.acquire_token().map_err(|v| self.block(id, v))?;

        let deadline = chrono::Duration::seconds(
            i64::try_from(self.config.research_deadline_secs).unwrap_or(i64::MAX / 1000),
        );
        let gap = self.transition(id, GapState::Researching, |g| {
            g.budget.attempts_used += 1;
            if g.budget.deadline.is_none() {
                g.budget.deadline = Some(Utc::now() + deadline);
            }
            g.blocked_by = None;
        })?;

        let request = ResearchRequest {
            gap: id,
            kind: gap.effective_kind(),
            target: gap.target.clone(),
            query,
            domains,
            depth: gap.depth,
        };
        info!(gap = %id, query = %request.query, attempt = gap.budget.attempts_used, "research started");

        let spawned = self.runtime.spawn(
            permit,
            request.clone(),
            Arc::clone(&self.researcher),
            Arc::clone(&self.pipeline),
            self.research_mode,
        );
        match spawned {
            Ok(handle) => Ok(Admission::Running(Box::new(Dispatched {
                gap,
                request,
                handle,
                started: Instant::now(),
            }))),
            Err(e) => {
                self.transition(id, GapState::Queued, |_| {})?;
                Err(e)
            }
        }
    }

    fn settle(&self, dispatched: Dispatched) -> GraphResult<Gap> {
        let Dispatched {
            gap,
            request,
            handle,
            started,
        } = dispatched;
        let timeout = Duration::from_millis(self.config.call_timeout_ms);
        let remaining = timeout.saturating_sub(started.elapsed());

        match handle.wait(remaining) {
            Ok(report) if !report.committed.is_empty() => {
                let filled = self.transition(gap.id, GapState::Filled, |_| {})?;
                self.record(
                    &filled,
                    &request.query,
                    report.sources_consulted.clone(),
                    AttemptOutcome::Filled,
                    Some(&report),
                    None,
                )?;
                info!(gap = %gap.id, committed = report.committed.len(), "gap filled");
                self.follow_up(&filled, &report)?;
                Ok(filled)
            }
            Ok(report) => {
                let rejected = self.transition(gap.id, GapState::Rejected, |_| {})?;
                self.record(
                    &rejected,
                    &request.query,
                    report.sources_consulted.clone(),
                    AttemptOutcome::Rejected,
                    Some(&report),
                    Some(format!("{} candidate(s) refused", report.refused)),
                )?;
                info!(gap = %gap.id, refused = report.refused, "gap rejected");
                Ok(rejected)
            }
            Err(err @ GraphError::ResearchTimeout { .. }) => {
                let expired = self.transition(gap.id, GapState::Expired, |_| {})?;
                self.record(
                    &expired,
                    &request.query,
                    Vec::new(),
                    AttemptOutcome::Exhausted,
                    None,
                    Some(err.to_string()),
                )?;
                warn!(gap = %gap.id, error = %err, "research timed out");
                Err(err)
            }
            Err(err) => {
                let transient = err.is_retryable();
                let (next, outcome) = if transient && !gap.budget.is_exhausted(Utc::now()) {
                    (GapState::Queued, AttemptOutcome::Failed { transient })
                } else if transient {
                    (GapState::Expired, AttemptOutcome::Exhausted)
                } else {
                    (GapState::Rejected, AttemptOutcome::Failed { transient })
                };
                let settled = self.transition(gap.id, next, |_| {})?;
                self.record(
                    &settled,
                    &request.query,
                    Vec::new(),
                    outcome,
                    None,
                    Some(err.to_string()),
                )?;
                warn!(gap = %gap.id, error = %err, state = %next, "research failed");
                Err(err)
            }
        }
    }

    /// Raises the gaps a successful fill surfaces: contradictions it left
    /// open, and entities it introduced as objects. Follow-ups sit one level
    /// deeper and are not raised past the depth ceiling.
    fn follow_up(&self, filled: &Gap, report: &ResearchReport) -> GraphResult<()> {
        if filled.depth + 1 > self.rails.max_depth() {
            return Ok(());
        }
        for receipt in &report.committed {
            for conflict in &receipt.conflicts {
                self.contradiction_gap(&conflict.incoming, &conflict.existing, Some(filled))?;
            }
        }
        for receipt in &report.committed {
            if let Object::Entity(object) = receipt.fact.object {
                if receipt.created_entities.contains(&object) {
                    self.scan(object, Some(filled))?;
                }
            }
        }
        Ok(())
    }

    /// Researches one queued gap to completion.
    ///
    /// # Errors
    ///
    /// - `Rail` if a safety rail kept the gap queued; the reason is
    ///   recorded on the gap.
    /// - `ResearchTimeout` if the call timed out; the gap is expired.
    /// - `Research` if the researcher failed; the gap is requeued while
    ///   budget remains.
    /// - `InvalidTransition` if the gap is not queued.
    pub fn research(&self, id: GapId) -> GraphResult<Gap> {
        match self.dispatch(id)? {
            Admission::Settled(gap) => Ok(gap),
            Admission::Running(dispatched) => self.settle(*dispatched),
        }
    }

    /// Dispatches every queued gap the rails admit, highest priority first,
    /// then waits for all of them.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the queue cannot be read. Per-gap
    /// failures are collected in the report.
    pub fn run_cycle(&self) -> GraphResult<CycleReport> {
        let mut report = CycleReport::default();
        let mut running = Vec::new();

        for gap in self.queued()? {
            report.examined += 1;
            match self.dispatch(gap.id) {
                Ok(Admission::Running(d)) => running.push(d),
                Ok(Admission::Settled(g)) => Self::tally(&mut report, &g),
                Err(GraphError::Rail(v)) => report.blocked.push((gap.id, v)),
                Err(e) => report.errors.push((gap.id, e.to_string())),
            }
        }

        for dispatched in running {
            let id = dispatched.gap.id;
            match self.settle(*dispatched) {
                Ok(gap) => Self::tally(&mut report, &gap),
                Err(e) => {
                    match self.store.gap(id)? {
                        Some(gap) if gap.state == GapState::Queued => report.requeued.push(id),
                        Some(gap) => Self::tally(&mut report, &gap),
                        None => {}
                    }
                    report.errors.push((id, e.to_string()));
                }
            }
        }

        info!(
            examined = report.examined,
            filled = report.filled.len(),
            blocked = report.blocked.len(),
            "research cycle finished"
        );
        Ok(report)
    }

    fn tally(report: &mut CycleReport, gap: &Gap) {
        match gap.state {
            GapState::Filled => report.filled.push(gap.id),
            GapState::Rejected => report.rejected.push(gap.id),
            GapState::Expired => report.expired.push(gap.id),
            GapState::Queued => report.requeued.push(gap.id),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::config::{FusionConfig, RailConfig, RateLimitConfig};
    use crate::conflict::{ConflictDetector, ConflictPolicy, ContradictionRule};
    use crate::entity::EntityKind;
    use crate::gap::research::{ResearchError, ResearchFindings};
    use crate::ingest::{CandidateClaim, EntityRef, SourceInfo};
    use crate::value::Value;

    fn y(n: i32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(n, 1, 1, 0, 0, 0).unwrap()
    }

    fn pipeline() -> Arc<CommitPipeline> {
        let store = Arc::new(ClaimStore::in_memory());
        let fusion = Arc::new(FusionEngine::new(
            Arc::clone(&store),
            Arc::new(ContradictionRule::default()),
            &FusionConfig::default(),
        ));
        let detector = ConflictDetector::new(Arc::clone(&store), Arc::clone(&fusion), ConflictPolicy::Flag);
        Arc::new(CommitPipeline::new(store, fusion, detector, 365.0))
    }

    fn config() -> GapConfig {
        GapConfig {
            default_domains: vec!["arxiv.org".into()],
            rails: RailConfig {
                allowlist: vec!["arxiv.org".into(), "*.acm.org".into()],
                human_in_the_loop: false,
                ..RailConfig::default()
            },
            ..GapConfig::default()
        }
    }

    fn defines(name: &'static str) -> Arc<dyn Researcher> {
        Arc::new(move |_: &ResearchRequest| -> Result<ResearchFindings, ResearchError> {
            Ok(ResearchFindings {
                candidates: vec![CandidateClaim::new(
                    EntityRef::named(name, EntityKind::Concept),
                    "is_a",
                    EntityRef::named("Neural Architecture", EntityKind::Concept),
                    SourceInfo::new("arxiv.org/abs/1706.03762", 0.9, y(2020)).with_freshness(1.0),
                )],
                sources_consulted: vec!["arxiv.org".into()],
            })
        })
    }

    fn manager(researcher: Arc<dyn Researcher>, config: &GapConfig) -> GapLifecycleManager {
        GapLifecycleManager::new(pipeline(), researcher, config, ConsistencyMode::Eventual).unwrap()
    }

    fn entity(m: &GapLifecycleManager, name: &str) -> EntityId {
        m.store.ensure_entity(name, &EntityKind::Concept).unwrap().0.id
    }

    #[test]
    fn test_report_gap_classifies_and_queues() {
        let m = manager(defines("Transformer"), &config());
        let t = entity(&m, "Transformer");
        let gap = m
            .report_gap(GapTarget::Entity(t), GapKind::UndefinedTerm, Some(0.87), Vec::new())
            .unwrap();
        assert_eq!(gap.state, GapState::Queued);
        assert_eq!(gap.kind, Some(GapKind::UndefinedTerm));
        assert!((gap.priority - 0.87).abs() < 1e-9);

        let again = m
            .report_gap(GapTarget::Entity(t), GapKind::UndefinedTerm, None, Vec::new())
            .unwrap();
        assert_eq!(again.id, gap.id);
        assert_eq!(m.queued().unwrap().len(), 1);
    }

    #[test]
    fn test_below_floor_stays_classified() {
        let mut cfg = config();
        cfg.priority_floor = 0.9;
        let m = manager(defines("Transformer"), &cfg);
        let t = entity(&m, "Transformer");
        let gap = m
            .report_gap(GapTarget::Entity(t), GapKind::MissingPrerequisite, None, Vec::new())
            .unwrap();
        assert_eq!(gap.state, GapState::Classified);
        assert!((gap.priority - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_research_fills_and_surfaces_follow_ups() {
        let m = manager(defines("Transformer"), &config());
        let t = entity(&m, "Transformer");
        let gap = m
            .report_gap(GapTarget::Entity(t), GapKind::UndefinedTerm, Some(0.8), Vec::new())
            .unwrap();

        let filled = m.research(gap.id).unwrap();
        assert_eq!(filled.state, GapState::Filled);
        assert_eq!(filled.budget.attempts_used, 1);

        let attempts = m.store.attempts(gap.id).unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].outcome, AttemptOutcome::Filled);
        assert_eq!(attempts[0].query, "define Transformer");
        assert_eq!(attempts[0].committed.len(), 1);

        let follow_ups: Vec<Gap> = m
            .store
            .list_gaps(&GapFilter::default())
            .unwrap()
            .into_iter()
            .filter(|g| g.parent == Some(gap.id))
            .collect();
        assert_eq!(follow_ups.len(), 1);
        assert_eq!(follow_ups[0].depth, 1);
        assert_eq!(follow_ups[0].effective_kind(), GapKind::UndefinedTerm);
    }

    #[test]
    fn test_rail_block_keeps_gap_queued() {
        let m = manager(defines("Transformer"), &config());
        let t = entity(&m, "Transformer");
        let gap = m
            .report_gap(
                GapTarget::Entity(t),
                GapKind::UndefinedTerm,
                Some(0.9),
                vec!["evil.example".into()],
            )
            .unwrap();

        let err = m.research(gap.id).unwrap_err();
        assert!(err.is_rail_block());
        let stuck = m.store.gap(gap.id).unwrap().unwrap();
        assert_eq!(stuck.state, GapState::Queued);
        assert_eq!(
            stuck.blocked_by,
            Some(RailViolation::DomainNotAllowed {
                domain: "evil.example".into()
            })
        );
        assert_eq!(stuck.budget.attempts_used, 0);
        assert_eq!(m.rails().bucket().available(), 10);
    }

    #[test]
    fn test_approval_gate() {
        let mut cfg = config();
        cfg.rails.human_in_the_loop = true;
        let m = manager(defines("Transformer"), &cfg);
        let t = entity(&m, "Transformer");
        let gap = m
            .report_gap(GapTarget::Entity(t), GapKind::UndefinedTerm, Some(0.9), Vec::new())
            .unwrap();

        assert!(matches!(
            m.research(gap.id),
            Err(GraphError::Rail(RailViolation::AwaitingApproval))
        ));
        let approved = m.approve(gap.id, "reviewer").unwrap();
        assert_eq!(approved.approved_by.as_deref(), Some("reviewer"));
        assert_eq!(approved.blocked_by, None);
        assert_eq!(m.research(gap.id).unwrap().state, GapState::Filled);
        assert!(m.approve(gap.id, "reviewer").is_err());
    }

    #[test]
    fn test_rate_limit_blocks_second_call() {
        let mut cfg = config();
        cfg.rails.rate_limit = RateLimitConfig {
            capacity: 1,
            refill_every_secs: 3600,
        };
        let m = manager(defines("Transformer"), &cfg);
        let a = entity(&m, "Transformer");
        let b = entity(&m, "Attention");
        let ga = m
            .report_gap(GapTarget::Entity(a), GapKind::UndefinedTerm, Some(0.9), Vec::new())
            .unwrap();
        let gb = m
            .report_gap(GapTarget::Entity(b), GapKind::UndefinedTerm, Some(0.8), Vec::new())
            .unwrap();

        let report = m.run_cycle().unwrap();
        assert_eq!(report.filled, vec![ga.id]);
        assert!(matches!(
            report.blocked.as_slice(),
            [(id, RailViolation::RateLimitExceeded { .. })] if *id == gb.id
        ));
    }

    #[test]
    fn test_fill_at_depth_ceiling_raises_no_follow_ups() {
        let contradicting: Arc<dyn Researcher> =
            Arc::new(|_: &ResearchRequest| -> Result<ResearchFindings, ResearchError> {
                Ok(ResearchFindings {
                    candidates: vec![CandidateClaim::new(
                        EntityRef::named("Transformer", EntityKind::Concept),
                        "introduced",
                        Value::Int(2018),
                        SourceInfo::new("blog.example", 0.6, y(2020)).with_freshness(1.0),
                    )
                    .valid_from(y(2017))],
                    sources_consulted: vec!["arxiv.org".into()],
                })
            });
        let mut cfg = config();
        cfg.rails.max_depth = 0;
        let m = manager(contradicting, &cfg);
        let seed = CandidateClaim::new(
            EntityRef::named("Transformer", EntityKind::Concept),
            "introduced",
            Value::Int(2017),
            SourceInfo::new("arxiv.org", 0.9, y(2020)).with_freshness(1.0),
        )
        .valid_from(y(2017));
        let seeded = m.pipeline.submit(&seed, ConsistencyMode::Eventual).unwrap();
        let gap = m
            .report_gap(
                GapTarget::Fact(seeded.fact),
                GapKind::MissingPrerequisite,
                Some(0.9),
                Vec::new(),
            )
            .unwrap();

        assert_eq!(m.research(gap.id).unwrap().state, GapState::Filled);
        let attempts = m.store.attempts(gap.id).unwrap();
        assert_eq!(attempts[0].committed.len(), 1);

        let gaps = m.store.list_gaps(&GapFilter::default()).unwrap();
        assert!(gaps.iter().all(|g| g.parent != Some(gap.id)));
        assert!(gaps.iter().all(|g| g.depth <= cfg.rails.max_depth));
    }

    #[test]
    fn test_transient_failure_requeues_until_budget_runs_out() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let flaky: Arc<dyn Researcher> =
            Arc::new(move |_: &ResearchRequest| -> Result<ResearchFindings, ResearchError> {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ResearchError::transient("upstream 503"))
            });
        let mut cfg = config();
        cfg.max_attempts = 2;
        let m = manager(flaky, &cfg);
        let t = entity(&m, "Transformer");
        let gap = m
            .report_gap(GapTarget::Entity(t), GapKind::UndefinedTerm, Some(0.9), Vec::new())
            .unwrap();

        assert!(m.research(gap.id).unwrap_err().is_retryable());
        assert_eq!(m.store.gap(gap.id).unwrap().unwrap().state, GapState::Queued);

        assert!(m.research(gap.id).is_err());
        let done = m.store.gap(gap.id).unwrap().unwrap();
        assert_eq!(done.state, GapState::Expired);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let outcomes: Vec<AttemptOutcome> = m
            .store
            .attempts(gap.id)
            .unwrap()
            .iter()
            .map(|a| a.outcome)
            .collect();
        assert_eq!(
            outcomes,
            vec![AttemptOutcome::Failed { transient: true }, AttemptOutcome::Exhausted]
        );
    }

    #[test]
    fn test_permanent_failure_rejects_gap() {
        let broken: Arc<dyn Researcher> =
            Arc::new(|_: &ResearchRequest| -> Result<ResearchFindings, ResearchError> {
                Err(ResearchError::permanent("malformed query"))
            });
        let m = manager(broken, &config());
        let t = entity(&m, "Transformer");
        let gap = m
            .report_gap(GapTarget::Entity(t), GapKind::UndefinedTerm, Some(0.9), Vec::new())
            .unwrap();

        assert!(!m.research(gap.id).unwrap_err().is_retryable());
        assert_eq!(m.store.gap(gap.id).unwrap().unwrap().state, GapState::Rejected);
        let attempts = m.store.attempts(gap.id).unwrap();
        assert_eq!(attempts[0].outcome, AttemptOutcome::Failed { transient: false });
    }

    #[test]
    fn test_timeout_expires_gap() {
        let slow: Arc<dyn Researcher> =
            Arc::new(|_: &ResearchRequest| -> Result<ResearchFindings, ResearchError> {
                std::thread::sleep(Duration::from_millis(300));
                Ok(ResearchFindings::default())
            });
        let mut cfg = config();
        cfg.call_timeout_ms = 20;
        let m = manager(slow, &cfg);
        let t = entity(&m, "Transformer");
        let gap = m
            .report_gap(GapTarget::Entity(t), GapKind::UndefinedTerm, Some(0.9), Vec::new())
            .unwrap();

        assert!(matches!(
            m.research(gap.id),
            Err(GraphError::ResearchTimeout { .. })
        ));
        assert_eq!(m.store.gap(gap.id).unwrap().unwrap().state, GapState::Expired);
    }

    #[test]
    fn test_empty_findings_reject() {
        let empty: Arc<dyn Researcher> =
            Arc::new(|_: &ResearchRequest| -> Result<ResearchFindings, ResearchError> {
                Ok(ResearchFindings::default())
            });
        let m = manager(empty, &config());
        let t = entity(&m, "Transformer");
        let gap = m
            .report_gap(GapTarget::Entity(t), GapKind::UndefinedTerm, Some(0.9), Vec::new())
            .unwrap();
        assert_eq!(m.research(gap.id).unwrap().state, GapState::Rejected);
        assert!(matches!(
            m.research(gap.id),
            Err(GraphError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_scan_entity() {
        let m = manager(defines("Transformer"), &config());
        let bert = entity(&m, "BERT");
        let candidate = CandidateClaim::new(
            bert,
            "based_on",
            EntityRef::named("Transformer", EntityKind::Concept),
            SourceInfo::new("arxiv.org", 0.9, y(2020)).with_freshness(1.0),
        );
        let receipt = m.pipeline.submit(&candidate, ConsistencyMode::Eventual).unwrap();
        let transformer = receipt.created_entities[0];

        let undefined = m.scan_entity(transformer).unwrap();
        assert_eq!(undefined.len(), 1);
        assert_eq!(
            undefined[0].signal,
            GapSignal::UnresolvedReference { references: 1 }
        );

        let sparse = m.scan_entity(bert).unwrap();
        assert_eq!(
            sparse[0].signal,
            GapSignal::SparsePrerequisites {
                claim_count: 1,
                threshold: 2
            }
        );
        assert!(m.scan_entity(EntityId::new()).is_err());
    }

    #[test]
    fn test_contradiction_priority_favors_close_rivals() {
        let m = manager(defines("BERT"), &config());
        let released = |year: i64, src: &str| {
            CandidateClaim::new(
                EntityRef::named("BERT", EntityKind::Artifact),
                "released",
                Value::Int(year),
                SourceInfo::new(src, 1.0, y(2020)).with_freshness(1.0),
            )
            .raw_confidence(0.9)
            .valid_from(y(2018))
        };
        m.pipeline.submit(&released(2018, "arxiv"), ConsistencyMode::Eventual).unwrap();
        let receipt = m.pipeline.submit(&released(2017, "blog"), ConsistencyMode::Eventual).unwrap();
        let gap = m.detect_contradiction(&receipt.conflicts[0]).unwrap();
        assert_eq!(gap.effective_kind(), GapKind::Contradiction);
        // Equal confidence on both sides: deficit 1, impact 2/6.
        assert!((gap.priority - (0.5 * (2.0 / 6.0) + 0.5)).abs() < 1e-9);
        assert_eq!(
            m.detect_contradiction(&receipt.conflicts[0]).unwrap().id,
            gap.id
        );
    }
}
