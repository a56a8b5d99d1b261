//! # kyrograph - a temporal knowledge hypergraph
//!
//! kyrograph stores provenance-bearing claims about entities, fuses
//! independent sources into a single confidence per fact, reasons about
//! when facts hold, flags contradictions and tracks what the graph does
//! not yet know as research gaps.
//!
//! ## Core Concepts
//!
//! - **Claim**: an immutable `(subject, predicate, object)` statement with a
//!   validity interval, a modality and source contributions
//! - **Fused fact**: the combined confidence of every live claim on a fact key
//! - **Conflict**: two claims on the same slot that cannot both hold over
//!   an overlapping interval
//! - **Gap**: a detected hole in knowledge, driven through a bounded
//!   research lifecycle behind safety rails
//!
//! ## Usage
//!
//! ```rust
//! use chrono::Utc;
//! use kyrograph::{CandidateClaim, EntityKind, EntityRef, KnowledgeGraph, SourceInfo, Value};
//!
//! # fn main() -> Result<(), kyrograph::GraphError> {
//! let graph = KnowledgeGraph::in_memory()?;
//!
//! let receipt = graph.submit(&CandidateClaim::new(
//!     EntityRef::named("BERT", EntityKind::Artifact),
//!     "released",
//!     Value::Int(2018),
//!     SourceInfo::new("arxiv.org", 0.9, Utc::now()),
//! ))?;
//!
//! let fused = graph.fact_by_key(&receipt.fact)?;
//! assert!(fused.confidence > 0.0);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod claim;
pub mod entity;
pub mod error;
pub mod source;
pub mod time;
pub mod value;

// Storage and configuration
pub mod config;
pub mod storage;

// Reasoning components
pub mod conflict;
pub mod fusion;
pub mod gap;
pub mod ingest;
pub mod temporal;

pub mod graph;

#[cfg(feature = "transport-grpc")]
pub mod transport;

// Re-export primary types at crate root for convenience
pub use claim::{Claim, ClaimBuilder, ClaimId, Contribution, FactKey, Modality, Object, Polarity, SlotKey};
pub use config::{ConflictConfig, FusionConfig, GapConfig, GraphConfig, RailConfig, StorageConfig};
pub use conflict::{Conflict, ConflictDetector, ConflictId, ConflictKind, ConflictPolicy, ContradictionRule, Verdict};
pub use entity::{Entity, EntityId, EntityKind};
pub use error::{GraphError, GraphResult, RailViolation, StorageError, TemporalError, ValidationError};
pub use fusion::{EvidenceAccumulator, FusedFact, FusionEngine, FusionStrategy};
pub use gap::{
    AttemptOutcome, CycleReport, Gap, GapFilter, GapId, GapKind, GapLifecycleManager, GapState, GapTarget,
    ResearchError, ResearchFindings, ResearchRequest, Researcher, ResolutionAttempt,
};
pub use graph::KnowledgeGraph;
pub use ingest::{CandidateClaim, CommitReceipt, ConsistencyMode, EntityRef, ObjectRef, SourceInfo};
pub use source::{Source, SourceId};
pub use storage::ClaimStore;
pub use temporal::{relation, AllenRelation, TemporalReasoner};
pub use time::Interval;
pub use value::Value;
