//! Interval reasoning over stored claims.
//!
//! Allen's interval algebra classifies how two validity intervals relate;
//! an open end (`valid_until == None`) is +∞. On top of that the reasoner
//! answers "what held at time t" and threads supersession links into a
//! single ordered history.
//!
//! Nothing here writes to the store.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::claim::{Claim, ClaimId, FactKey};
use crate::entity::EntityId;
use crate::error::{GraphResult, TemporalError};
use crate::storage::{ClaimQuery, ClaimStore};
use crate::time::{Interval, IntervalEnd};

/// The thirteen Allen interval relations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllenRelation {
    /// `a` ends before `b` starts.
    Before,
    /// `a` ends exactly where `b` starts.
    Meets,
    /// `a` starts first and ends inside `b`.
    Overlaps,
    /// Same start, `a` ends first.
    Starts,
    /// `a` lies strictly inside `b`.
    During,
    /// Same end, `a` starts later.
    Finishes,
    /// Same start and end.
    Equals,
    /// Same end, `a` starts first.
    FinishedBy,
    /// `b` lies strictly inside `a`.
    Contains,
    /// Same start, `b` ends first.
    StartedBy,
    /// `b` starts first and ends inside `a`.
    OverlappedBy,
    /// `b` ends exactly where `a` starts.
    MetBy,
    /// `a` starts after `b` ends.
    After,
}

impl AllenRelation {
    /// The relation of `b` to `a` given the relation of `a` to `b`.
    #[must_use]
    pub const fn inverse(self) -> Self {
        match self {
            Self::Before => Self::After,
            Self::Meets => Self::MetBy,
            Self::Overlaps => Self::OverlappedBy,
            Self::Starts => Self::StartedBy,
            Self::During => Self::Contains,
            Self::Finishes => Self::FinishedBy,
            Self::Equals => Self::Equals,
            Self::FinishedBy => Self::Finishes,
            Self::Contains => Self::During,
            Self::StartedBy => Self::Starts,
            Self::OverlappedBy => Self::Overlaps,
            Self::MetBy => Self::Meets,
            Self::After => Self::Before,
        }
    }

    /// True when the two intervals share no instant.
    #[must_use]
    pub const fn is_disjoint(self) -> bool {
        matches!(self, Self::Before | Self::Meets | Self::MetBy | Self::After)
    }
}

impl fmt::Display for AllenRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Before => "before",
            Self::Meets => "meets",
            Self::Overlaps => "overlaps",
            Self::Starts => "starts",
            Self::During => "during",
            Self::Finishes => "finishes",
            Self::Equals => "equals",
            Self::FinishedBy => "finished_by",
            Self::Contains => "contains",
            Self::StartedBy => "started_by",
            Self::OverlappedBy => "overlapped_by",
            Self::MetBy => "met_by",
            Self::After => "after",
        };
        write!(f, "{s}")
    }
}

/// Classifies how `a` relates to `b`.
///
/// # Examples
///
/// ```
/// use kyrograph::{relation, AllenRelation, Interval};
/// use chrono::{TimeZone, Utc};
///
/// let y = |n| Utc.with_ymd_and_hms(n, 1, 1, 0, 0, 0).unwrap();
/// let a = Interval::closed(y(2015), y(2019)).unwrap();
/// let b = Interval::starting_at(y(2019));
///
/// assert_eq!(relation(&a, &b), AllenRelation::Meets);
/// ```
#[must_use]
pub fn relation(a: &Interval, b: &Interval) -> AllenRelation {
    use std::cmp::Ordering::{Equal, Greater, Less};

    let (a1, a2) = (IntervalEnd::At(a.from), a.end());
    let (b1, b2) = (IntervalEnd::At(b.from), b.end());

    if a2 < b1 {
        return AllenRelation::Before;
    }
    if a2 == b1 && a1 < a2 {
        return AllenRelation::Meets;
    }
    if b2 < a1 {
        return AllenRelation::After;
    }
    if b2 == a1 && b1 < b2 {
        return AllenRelation::MetBy;
    }

    match (a1.cmp(&b1), a2.cmp(&b2)) {
        (Equal, Equal) => AllenRelation::Equals,
        (Equal, Less) => AllenRelation::Starts,
        (Equal, Greater) => AllenRelation::StartedBy,
        (Greater, Equal) => AllenRelation::Finishes,
        (Less, Equal) => AllenRelation::FinishedBy,
        (Greater, Less) => AllenRelation::During,
        (Less, Greater) => AllenRelation::Contains,
        (Less, Less) => AllenRelation::Overlaps,
        (Greater, Greater) => AllenRelation::OverlappedBy,
    }
}

/// Keeps, per fact key, the most specific claim: non-superseded first,
/// then latest `valid_from`, then latest commit. Output is in commit order.
#[must_use]
pub fn most_specific(claims: Vec<Claim>) -> Vec<Claim> {
    let mut best: HashMap<FactKey, Claim> = HashMap::new();
    for claim in claims {
        let key = claim.fact_key();
        let replace = best.get(&key).map_or(true, |current| {
            let rank = |c: &Claim| (!c.is_superseded(), c.interval.from, c.sequence);
            rank(&claim) > rank(current)
        });
        if replace {
            best.insert(key, claim);
        }
    }
    let mut chosen: Vec<Claim> = best.into_values().collect();
    chosen.sort_by_key(|c| c.sequence);
    chosen
}

/// Orders claims into a single history: by `valid_from`, ties by commit
/// sequence, with every claim placed before the claim that supersedes it.
///
/// Supersession links are re-verified here rather than trusted: a link
/// cycle among `claims` fails with `BrokenChain`. Links to claims outside
/// the input are ignored.
///
/// # Errors
///
/// Returns `TemporalError::BrokenChain` naming a claim on the cycle.
pub fn thread_chain(claims: Vec<Claim>) -> Result<Vec<Claim>, TemporalError> {
    let index: HashMap<ClaimId, usize> = claims
        .iter()
        .enumerate()
        .map(|(i, c)| (c.id, i))
        .collect();

    // Walk each link chain once; a revisit inside one walk is a cycle.
    let mut settled: HashSet<usize> = HashSet::new();
    for start in 0..claims.len() {
        let mut on_path: HashSet<usize> = HashSet::new();
        let mut current = Some(start);
        while let Some(i) = current {
            if settled.contains(&i) {
                break;
            }
            if !on_path.insert(i) {
                return Err(TemporalError::BrokenChain {
                    claim: claims[i].id,
                });
            }
            current = claims[i]
                .superseded_by
                .and_then(|next| index.get(&next).copied());
        }
        settled.extend(on_path);
    }

    let mut pending = vec![0usize; claims.len()];
    for claim in &claims {
        if let Some(&next) = claim.superseded_by.as_ref().and_then(|n| index.get(n)) {
            pending[next] += 1;
        }
    }

    let rank = |i: usize| (claims[i].interval.from, claims[i].sequence, i);
    let mut ready: BinaryHeap<Reverse<(DateTime<Utc>, u64, usize)>> = (0..claims.len())
        .filter(|&i| pending[i] == 0)
        .map(|i| Reverse(rank(i)))
        .collect();

    let mut order = Vec::with_capacity(claims.len());
    while let Some(Reverse((_, _, i))) = ready.pop() {
        order.push(i);
        if let Some(&next) = claims[i].superseded_by.as_ref().and_then(|n| index.get(n)) {
            pending[next] -= 1;
            if pending[next] == 0 {
                ready.push(Reverse(rank(next)));
            }
        }
    }

    if order.len() != claims.len() {
        let stuck = (0..claims.len())
            .find(|i| pending[*i] > 0)
            .map_or_else(ClaimId::new, |i| claims[i].id);
        return Err(TemporalError::BrokenChain { claim: stuck });
    }

    let mut slots: Vec<Option<Claim>> = claims.into_iter().map(Some).collect();
    Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
}

/// Read-only temporal queries over a [`ClaimStore`].
#[derive(Debug, Clone)]
pub struct TemporalReasoner {
    store: Arc<ClaimStore>,
}

impl TemporalReasoner {
    /// A reasoner over `store`.
    #[must_use]
    pub const fn new(store: Arc<ClaimStore>) -> Self {
        Self { store }
    }

    /// Allen relation between two stored claims.
    ///
    /// # Errors
    ///
    /// Returns `ClaimNotFound` if either claim is unknown.
    pub fn relation_between(&self, a: ClaimId, b: ClaimId) -> GraphResult<AllenRelation> {
        let a = self.load(a)?;
        let b = self.load(b)?;
        Ok(relation(&a.interval, &b.interval))
    }

    /// Claims matching `query` whose interval contains `at`, reduced to the
    /// most specific claim per fact key.
    ///
    /// A superseded claim is returned only when no non-superseded claim of
    /// the same fact key covers `at`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the store cannot be read.
    pub fn as_of(&self, query: &ClaimQuery, at: DateTime<Utc>) -> GraphResult<Vec<Claim>> {
        let covering = self.store.get_claims_for(query, Some(at))?;
        Ok(most_specific(covering))
    }

    /// Everything that held about `entity` at `at` (as subject or object).
    ///
    /// # Errors
    ///
    /// Returns a storage error if the store cannot be read.
    pub fn entity_state(&self, entity: EntityId, at: DateTime<Utc>) -> GraphResult<Vec<Claim>> {
        self.as_of(&ClaimQuery::Entity(entity), at)
    }

    /// The full history of a fact key as one linear chain.
    ///
    /// Claims that superseded the key's claims are followed and included,
    /// even when they belong to another fact key.
    ///
    /// # Errors
    ///
    /// Returns `BrokenChain` if the supersession links loop.
    pub fn history(&self, key: &FactKey) -> GraphResult<Vec<Claim>> {
        let mut claims = self.store.get_claims_for(&ClaimQuery::Fact(key.clone()), None)?;
        let mut seen: HashSet<ClaimId> = claims.iter().map(|c| c.id).collect();

        let mut frontier: Vec<ClaimId> = claims.iter().filter_map(|c| c.superseded_by).collect();
        while let Some(next) = frontier.pop() {
            if !seen.insert(next) {
                continue;
            }
            let successor = self.load(next)?;
            if let Some(after) = successor.superseded_by {
                frontier.push(after);
            }
            claims.push(successor);
        }

        Ok(thread_chain(claims)?)
    }

    fn load(&self, id: ClaimId) -> GraphResult<Claim> {
        self.store
            .claim(id)?
            .ok_or_else(|| crate::storage::StorageError::ClaimNotFound(id).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use crate::claim::Object;
    use crate::entity::{Entity, EntityKind};
    use crate::source::Source;
    use crate::value::Value;

    fn y(n: i32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(n, 1, 1, 0, 0, 0).unwrap()
    }

    fn span(from: i32, until: Option<i32>) -> Interval {
        Interval::new(y(from), until.map(y)).unwrap()
    }

    fn claim(subject: EntityId, object: impl Into<Object>, from: i32, until: Option<i32>) -> Claim {
        Claim::builder()
            .subject(subject)
            .predicate("ceo")
            .object(object)
            .contribution(Source::new("registry", 1.0, 1.0, y(2020)).unwrap(), 0.9)
            .interval(span(from, until))
            .build()
            .unwrap()
    }

    #[test]
    fn test_all_thirteen_relations() {
        use AllenRelation::*;
        let base = span(2010, Some(2020));
        let cases = [
            (span(2000, Some(2005)), Before),
            (span(2000, Some(2010)), Meets),
            (span(2005, Some(2015)), Overlaps),
            (span(2010, Some(2015)), Starts),
            (span(2012, Some(2018)), During),
            (span(2015, Some(2020)), Finishes),
            (span(2010, Some(2020)), Equals),
            (span(2005, Some(2020)), FinishedBy),
            (span(2005, Some(2025)), Contains),
            (span(2010, Some(2025)), StartedBy),
            (span(2015, Some(2025)), OverlappedBy),
            (span(2020, Some(2025)), MetBy),
            (span(2021, Some(2025)), After),
        ];
        for (a, expected) in cases {
            assert_eq!(relation(&a, &base), expected, "{a}");
            assert_eq!(relation(&base, &a), expected.inverse(), "inverse of {a}");
        }
    }

    #[test]
    fn test_open_end_is_infinite() {
        use AllenRelation::*;
        let a = span(2015, Some(2019));
        let b = span(2019, None);
        assert_eq!(relation(&a, &b), Meets);
        assert_eq!(relation(&b, &a), MetBy);

        assert_eq!(relation(&span(2010, None), &span(2010, None)), Equals);
        assert_eq!(relation(&span(2012, None), &span(2010, None)), Finishes);
        assert_eq!(relation(&span(2010, Some(2012)), &span(2010, None)), Starts);
        assert_eq!(relation(&span(2012, Some(2014)), &span(2010, None)), During);
        assert_eq!(relation(&span(2008, Some(2014)), &span(2010, None)), Overlaps);
    }

    #[test]
    fn test_instant_relations() {
        let point = span(2012, Some(2012));
        assert_eq!(relation(&point, &span(2010, Some(2015))), AllenRelation::During);
        assert_eq!(relation(&point, &point.clone()), AllenRelation::Equals);
        assert_eq!(relation(&point, &span(2012, Some(2015))), AllenRelation::Starts);
    }

    #[test]
    fn test_disjointness() {
        assert!(AllenRelation::Meets.is_disjoint());
        assert!(!AllenRelation::Overlaps.is_disjoint());
    }

    #[test]
    fn test_most_specific_prefers_live_then_latest_start() {
        let s = EntityId::new();
        let mut old = claim(s, Value::text("alice"), 2010, None);
        old.sequence = 1;
        let mut newer = claim(s, Value::text("alice"), 2015, None);
        newer.sequence = 2;
        let mut superseded = claim(s, Value::text("alice"), 2018, None);
        superseded.sequence = 3;
        superseded.superseded_by = Some(ClaimId::new());

        let chosen = most_specific(vec![old, newer.clone(), superseded.clone()]);
        assert_eq!(chosen.len(), 1);
        assert_eq!(chosen[0].id, newer.id);

        let chosen = most_specific(vec![superseded.clone()]);
        assert_eq!(chosen[0].id, superseded.id);
    }

    #[test]
    fn test_thread_chain_orders_by_start_then_sequence() {
        let s = EntityId::new();
        let mut a = claim(s, Value::text("a"), 2015, None);
        a.sequence = 5;
        let mut b = claim(s, Value::text("b"), 2010, None);
        b.sequence = 9;
        let mut c = claim(s, Value::text("c"), 2010, None);
        c.sequence = 7;

        let ordered: Vec<_> = thread_chain(vec![a.clone(), b.clone(), c.clone()])
            .unwrap()
            .into_iter()
            .map(|x| x.id)
            .collect();
        assert_eq!(ordered, vec![c.id, b.id, a.id]);
    }

    #[test]
    fn test_thread_chain_respects_supersession() {
        let s = EntityId::new();
        // Successor starts earlier than the claim it replaces (a correction).
        let mut fix = claim(s, Value::text("fix"), 2012, None);
        fix.sequence = 2;
        let mut wrong = claim(s, Value::text("wrong"), 2014, None);
        wrong.sequence = 1;
        wrong.superseded_by = Some(fix.id);

        let ordered: Vec<_> = thread_chain(vec![fix.clone(), wrong.clone()])
            .unwrap()
            .into_iter()
            .map(|x| x.id)
            .collect();
        assert_eq!(ordered, vec![wrong.id, fix.id]);
    }

    #[test]
    fn test_thread_chain_detects_cycle() {
        let s = EntityId::new();
        let mut a = claim(s, Value::text("a"), 2010, None);
        let mut b = claim(s, Value::text("b"), 2011, None);
        let mut c = claim(s, Value::text("c"), 2012, None);
        a.superseded_by = Some(b.id);
        b.superseded_by = Some(c.id);
        c.superseded_by = Some(a.id);

        let err = thread_chain(vec![a.clone(), b.clone(), c.clone()]).unwrap_err();
        let TemporalError::BrokenChain { claim: stuck } = err;
        assert!([a.id, b.id, c.id].contains(&stuck));

        let mut solo = claim_with_self_loop(s);
        solo.sequence = 1;
        assert!(thread_chain(vec![solo]).is_err());
    }

    fn claim_with_self_loop(s: EntityId) -> Claim {
        let mut c = claim(s, Value::text("loop"), 2010, None);
        c.superseded_by = Some(c.id);
        c
    }

    #[test]
    fn test_reasoner_as_of_and_history() {
        let store = Arc::new(ClaimStore::in_memory());
        let acme = store
            .put_entity(Entity::new("Acme", EntityKind::Organization).unwrap())
            .unwrap();
        let a = store.put_claim(claim(acme, Value::text("alice"), 2015, Some(2019))).unwrap();
        let b = store.put_claim(claim(acme, Value::text("bob"), 2019, None)).unwrap();
        store.supersede(a, b).unwrap();

        let reasoner = TemporalReasoner::new(Arc::clone(&store));
        assert_eq!(reasoner.relation_between(a, b).unwrap(), AllenRelation::Meets);

        let mid = Utc.with_ymd_and_hms(2018, 6, 1, 0, 0, 0).unwrap();
        let state: Vec<_> = reasoner.entity_state(acme, mid).unwrap().iter().map(|c| c.id).collect();
        assert_eq!(state, vec![a]);

        let alice = FactKey::affirmed(acme, "ceo", Value::text("alice"));
        let history: Vec<_> = reasoner.history(&alice).unwrap().iter().map(|c| c.id).collect();
        assert_eq!(history, vec![a, b]);
    }
}
