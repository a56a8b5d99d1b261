//! Interval reasoning end to end: as-of queries, Allen relations and
//! supersession chains.

use chrono::{DateTime, TimeZone, Utc};

use kyrograph::storage::ClaimQuery;
use kyrograph::{
    AllenRelation, CandidateClaim, ConsistencyMode, EntityKind, EntityRef, KnowledgeGraph, SlotKey, SourceInfo,
    StorageError,
};

fn day(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

fn employer(org: &str, from: DateTime<Utc>) -> CandidateClaim {
    CandidateClaim::new(
        EntityRef::named("Ada Researcher", EntityKind::Person),
        "employer",
        EntityRef::named(org, EntityKind::Organization),
        SourceInfo::new("orcid.org", 0.9, day(2021, 1, 1)).with_freshness(1.0),
    )
    .raw_confidence(0.9)
    .valid_from(from)
}

#[test]
fn as_of_selects_the_interval_in_force() {
    let graph = KnowledgeGraph::in_memory().unwrap();
    let a = graph
        .submit(&employer("Google", day(2015, 1, 1)).valid_until(day(2019, 1, 1)))
        .unwrap();
    let b = graph.submit(&employer("OpenAI", day(2019, 1, 1))).unwrap();
    assert!(b.conflicts.is_empty());

    let slot = ClaimQuery::Slot(SlotKey {
        subject: a.fact.subject,
        predicate: "employer".to_string(),
    });

    let mid_2018 = graph.temporal().as_of(&slot, day(2018, 6, 1)).unwrap();
    assert_eq!(mid_2018.iter().map(|c| c.id).collect::<Vec<_>>(), vec![a.claim_id]);

    let in_2020 = graph.temporal().as_of(&slot, day(2020, 1, 1)).unwrap();
    assert_eq!(in_2020.iter().map(|c| c.id).collect::<Vec<_>>(), vec![b.claim_id]);

    // The boundary instant belongs to B only: A's end is exclusive.
    let boundary = graph.temporal().as_of(&slot, day(2019, 1, 1)).unwrap();
    assert_eq!(boundary.iter().map(|c| c.id).collect::<Vec<_>>(), vec![b.claim_id]);

    assert_eq!(graph.relation(a.claim_id, b.claim_id).unwrap(), AllenRelation::Meets);
    assert_eq!(graph.relation(b.claim_id, a.claim_id).unwrap(), AllenRelation::MetBy);
}

#[test]
fn entity_state_follows_time() {
    let graph = KnowledgeGraph::in_memory().unwrap();
    let a = graph
        .submit(&employer("Google", day(2015, 1, 1)).valid_until(day(2019, 1, 1)))
        .unwrap();
    graph.submit(&employer("OpenAI", day(2019, 1, 1))).unwrap();
    let ada = a.fact.subject;

    assert_eq!(graph.entity_state(ada, Some(day(2014, 1, 1))).unwrap().len(), 0);
    assert_eq!(graph.entity_state(ada, Some(day(2016, 1, 1))).unwrap().len(), 1);
    assert_eq!(graph.entity_state(ada, Some(day(2024, 1, 1))).unwrap().len(), 1);
}

#[test]
fn supersession_cannot_form_a_cycle() {
    let graph = KnowledgeGraph::in_memory().unwrap();
    let x = graph
        .submit_with_mode(&employer("Google", day(2015, 1, 1)), ConsistencyMode::Force)
        .unwrap();
    let y = graph
        .submit_with_mode(&employer("DeepMind", day(2016, 1, 1)), ConsistencyMode::Force)
        .unwrap();

    graph.store().supersede(x.claim_id, y.claim_id).unwrap();
    let err = graph.store().supersede(y.claim_id, x.claim_id).unwrap_err();
    assert!(matches!(err, StorageError::CycleDetected { .. }));

    let old = graph.store().claim(x.claim_id).unwrap().unwrap();
    assert_eq!(old.superseded_by, Some(y.claim_id));
    assert_eq!(graph.store().claim(y.claim_id).unwrap().unwrap().superseded_by, None);
}

#[test]
fn history_threads_the_supersession_chain() {
    let graph = KnowledgeGraph::in_memory().unwrap();
    let first = graph.submit(&employer("Google", day(2015, 1, 1))).unwrap();
    let second = graph.submit(&employer("Google", day(2015, 1, 1))).unwrap();
    graph.store().supersede(first.claim_id, second.claim_id).unwrap();

    let chain = graph.history(&first.fact).unwrap();
    assert_eq!(
        chain.iter().map(|c| c.id).collect::<Vec<_>>(),
        vec![first.claim_id, second.claim_id]
    );
}
