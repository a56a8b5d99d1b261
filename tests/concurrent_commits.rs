//! Concurrent submissions: per-slot serialization must leave fusion and
//! entity resolution exactly as a sequential run would.

use std::sync::Arc;
use std::thread;

use chrono::{TimeZone, Utc};

use kyrograph::{CandidateClaim, EntityKind, EntityRef, FactKey, KnowledgeGraph, SourceInfo, Value};

const THREADS: usize = 8;
const PER_THREAD: usize = 25;

fn claim(subject: &str, predicate: &str, source: String) -> CandidateClaim {
    let retrieved = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
    CandidateClaim::new(
        EntityRef::named(subject, EntityKind::Artifact),
        predicate,
        Value::Int(2018),
        SourceInfo::new(source, 0.2, retrieved).with_freshness(1.0),
    )
    .raw_confidence(0.05)
    .valid_from(Utc.with_ymd_and_hms(2018, 1, 1, 0, 0, 0).unwrap())
}

fn sequential_confidence(sources: usize) -> f64 {
    let graph = KnowledgeGraph::in_memory().unwrap();
    let mut last = 0.0;
    for s in 0..sources {
        last = graph
            .submit(&claim("BERT", "released", format!("src-{s}")))
            .unwrap()
            .fused_confidence;
    }
    last
}

#[test]
fn parallel_agreeing_sources_fuse_like_sequential() {
    let graph = Arc::new(KnowledgeGraph::in_memory().unwrap());

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let graph = Arc::clone(&graph);
            thread::spawn(move || {
                let mut key: Option<FactKey> = None;
                for i in 0..PER_THREAD {
                    let receipt = graph
                        .submit(&claim("BERT", "released", format!("src-{}", t * PER_THREAD + i)))
                        .unwrap();
                    assert!(receipt.conflicts.is_empty());
                    key = Some(receipt.fact);
                }
                key.unwrap()
            })
        })
        .collect();
    let keys: Vec<FactKey> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(keys.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(graph.store().entity_count().unwrap(), 1);
    assert_eq!(graph.store().claim_count().unwrap(), THREADS * PER_THREAD);

    let fused = graph.fact_by_key(&keys[0]).unwrap();
    assert_eq!(fused.source_count, THREADS * PER_THREAD);
    let expected = sequential_confidence(THREADS * PER_THREAD);
    assert!((fused.confidence - expected).abs() < 1e-9);

    let recomputed = graph.fusion().recompute(&keys[0]).unwrap();
    assert!((recomputed.confidence - fused.confidence).abs() < 1e-12);
}

#[test]
fn unrelated_slots_do_not_interfere() {
    let graph = Arc::new(KnowledgeGraph::in_memory().unwrap());

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let graph = Arc::clone(&graph);
            thread::spawn(move || {
                let subject = format!("model-{t}");
                for i in 0..PER_THREAD {
                    graph
                        .submit(&claim(&subject, "released", format!("src-{i}")))
                        .unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(graph.store().entity_count().unwrap(), THREADS);
    let expected = sequential_confidence(PER_THREAD);
    for t in 0..THREADS {
        let entity = graph
            .store()
            .find_entities_by_name(&format!("model-{t}"))
            .unwrap()
            .pop()
            .unwrap();
        let fused = graph.fact(entity.id, "released", Value::Int(2018)).unwrap();
        assert_eq!(fused.source_count, PER_THREAD);
        assert!((fused.confidence - expected).abs() < 1e-9);
    }
}
