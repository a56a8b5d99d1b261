//! Confidence fusion properties over the public graph API.

use chrono::{TimeZone, Utc};

use kyrograph::{
    CandidateClaim, ConsistencyMode, EntityKind, EntityRef, FusionStrategy, KnowledgeGraph, SourceInfo, Value,
};

fn released(year: i64, source: &str, raw: f64) -> CandidateClaim {
    let retrieved = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
    CandidateClaim::new(
        EntityRef::named("BERT", EntityKind::Artifact),
        "released",
        Value::Int(year),
        SourceInfo::new(source, 1.0, retrieved).with_freshness(1.0),
    )
    .raw_confidence(raw)
    .valid_from(Utc.with_ymd_and_hms(2018, 10, 11, 0, 0, 0).unwrap())
}

#[test]
fn agreeing_sources_reach_anchor_confidences() {
    let graph = KnowledgeGraph::in_memory().unwrap();
    let mut seen = Vec::new();
    for source in ["arxiv.org", "aclanthology.org", "github.com"] {
        seen.push(graph.submit(&released(2018, source, 0.9)).unwrap().fused_confidence);
    }
    assert!((seen[0] - 0.40).abs() < 0.01, "one source: {}", seen[0]);
    assert!((seen[1] - 0.80).abs() < 0.005, "two sources: {}", seen[1]);
    assert!(seen[2] >= 0.95, "three sources: {}", seen[2]);
    assert!(seen.windows(2).all(|w| w[1] >= w[0]));
}

#[test]
fn fusion_is_order_independent() {
    let sources = [("a", 0.9), ("b", 0.6), ("c", 0.75), ("d", 0.3)];
    let orders: [[usize; 4]; 4] = [[0, 1, 2, 3], [3, 2, 1, 0], [1, 3, 0, 2], [2, 0, 3, 1]];

    let mut results = Vec::new();
    for order in orders {
        let graph = KnowledgeGraph::in_memory().unwrap();
        let mut last = 0.0;
        for i in order {
            let (source, raw) = sources[i];
            last = graph.submit(&released(2018, source, raw)).unwrap().fused_confidence;
        }
        results.push(last);
    }
    for r in &results {
        assert!((r - results[0]).abs() < 1e-9);
    }
}

#[test]
fn repeated_source_does_not_stack() {
    let graph = KnowledgeGraph::in_memory().unwrap();
    let first = graph.submit(&released(2018, "arxiv.org", 0.9)).unwrap();
    let again = graph.submit(&released(2018, "arxiv.org", 0.9)).unwrap();
    assert!((first.fused_confidence - again.fused_confidence).abs() < 1e-12);
    assert_eq!(graph.fact_by_key(&first.fact).unwrap().source_count, 1);
}

#[test]
fn conflicting_values_are_both_preserved() {
    let graph = KnowledgeGraph::in_memory().unwrap();
    let a = graph.submit(&released(2017, "blog.example", 0.9)).unwrap();
    let b = graph
        .submit_with_mode(&released(2018, "arxiv.org", 0.9), ConsistencyMode::Eventual)
        .unwrap();
    assert_eq!(b.conflicts.len(), 1);
    assert!(b.superseded.is_empty());

    let fa = graph.fact_by_key(&a.fact).unwrap();
    let fb = graph.fact_by_key(&b.fact).unwrap();
    assert!(fa.conflicted && fb.conflicted);
    assert_eq!(fa.rivals, vec![b.fact.clone()]);
    assert_eq!(fb.rivals, vec![a.fact.clone()]);
    assert!(fa.confidence > 0.0 && fb.confidence > 0.0);
}

#[test]
fn strategies_are_commutative_and_bounded() {
    let evidence = [0.9, 0.2, 0.55, 0.7];
    let mut reversed = evidence;
    reversed.reverse();
    for strategy in [FusionStrategy::Logistic, FusionStrategy::NoisyOr, FusionStrategy::Maximum] {
        let forward = strategy.combine(evidence);
        let backward = strategy.combine(reversed);
        assert!((forward - backward).abs() < 1e-12, "{strategy:?}");
        assert!((0.0..=1.0).contains(&forward));
        assert!(forward >= strategy.combine(evidence[..3].iter().copied()));
    }
}
