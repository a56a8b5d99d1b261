//! Claims: the hyperedges of the knowledge graph.
//!
//! A claim states that `subject predicate object` holds, under a modality,
//! over a validity interval, backed by one or more source contributions.
//! Once committed a claim is immutable except for its supersession pointer.

use std::fmt;

use blake3::Hasher;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::EntityId;
use crate::error::ValidationError;
use crate::source::{check_unit, Source, SourceId};
use crate::time::Interval;
use crate::value::Value;

/// Unique claim identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimId(Uuid);

impl ClaimId {
    /// Creates a new random claim ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ClaimId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClaimId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ClaimId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// How strongly a claim states its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    /// "X is Y"
    #[default]
    Assertion,
    /// "X may be Y"
    Possibility,
    /// "X must be Y"
    Necessity,
    /// "X is not Y"
    Negation,
}

impl Modality {
    /// Negations deny their object; every other modality affirms it.
    #[must_use]
    pub const fn polarity(self) -> Polarity {
        match self {
            Self::Negation => Polarity::Negated,
            _ => Polarity::Affirmed,
        }
    }

    /// Assertions and necessities commit to their object; possibilities
    /// and negations do not exclude other objects.
    #[must_use]
    pub const fn is_committal(self) -> bool {
        matches!(self, Self::Assertion | Self::Necessity)
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Assertion => write!(f, "assertion"),
            Self::Possibility => write!(f, "possibility"),
            Self::Necessity => write!(f, "necessity"),
            Self::Negation => write!(f, "negation"),
        }
    }
}

/// Whether a fact variant affirms or denies its object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    /// The fact holds.
    #[default]
    Affirmed,
    /// The fact is denied.
    Negated,
}

/// The object of a claim: another entity or a literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Object {
    /// A reference to another entity.
    Entity(EntityId),
    /// A literal value.
    Literal(Value),
}

impl Object {
    /// True for a nil entity reference or an empty literal.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Entity(id) => id.is_nil(),
            Self::Literal(v) => v.is_empty(),
        }
    }

    /// The referenced entity, if the object is one.
    #[must_use]
    pub const fn as_entity(&self) -> Option<EntityId> {
        match self {
            Self::Entity(id) => Some(*id),
            Self::Literal(_) => None,
        }
    }

    fn canonical(&self) -> String {
        match self {
            Self::Entity(id) => format!("entity:{id}"),
            Self::Literal(v) => format!("{}:{v}", v.type_name()),
        }
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entity(id) => write!(f, "<{id}>"),
            Self::Literal(v) => write!(f, "{v}"),
        }
    }
}

impl From<EntityId> for Object {
    fn from(id: EntityId) -> Self {
        Self::Entity(id)
    }
}

impl From<Value> for Object {
    fn from(v: Value) -> Self {
        Self::Literal(v)
    }
}

/// `(subject, predicate)`: the scope within which claims can contradict.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotKey {
    /// Entity the slot is about.
    pub subject: EntityId,
    /// Normalized predicate.
    pub predicate: String,
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.subject, self.predicate)
    }
}

/// Identity of a fused fact: `(subject, predicate, object)` plus polarity.
///
/// A negation of `(s, p, o)` is a separate variant of the same triple, so
/// "X released 2018" and "X not released 2018" fuse independently.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FactKey {
    /// Entity the fact is about.
    pub subject: EntityId,
    /// Normalized predicate.
    pub predicate: String,
    /// What the subject relates to.
    pub object: Object,
    /// Whether the fact is affirmed or denied.
    #[serde(default)]
    pub polarity: Polarity,
}

impl FactKey {
    /// Creates a key, trimming the predicate.
    #[must_use]
    pub fn new(
        subject: EntityId,
        predicate: impl Into<String>,
        object: Object,
        polarity: Polarity,
    ) -> Self {
        Self {
            subject,
            predicate: predicate.into().trim().to_string(),
            object,
            polarity,
        }
    }

    /// The affirmative variant of `(subject, predicate, object)`.
    #[must_use]
    pub fn affirmed(subject: EntityId, predicate: impl Into<String>, object: impl Into<Object>) -> Self {
        Self::new(subject, predicate, object.into(), Polarity::Affirmed)
    }

    /// The `(subject, predicate)` slot this fact belongs to.
    #[must_use]
    pub fn slot(&self) -> SlotKey {
        SlotKey {
            subject: self.subject,
            predicate: self.predicate.clone(),
        }
    }

    /// The same triple with the opposite polarity.
    #[must_use]
    pub fn negated(&self) -> Self {
        Self {
            polarity: match self.polarity {
                Polarity::Affirmed => Polarity::Negated,
                Polarity::Negated => Polarity::Affirmed,
            },
            ..self.clone()
        }
    }

    /// Stable hex digest used as the external fact id.
    #[must_use]
    pub fn digest(&self) -> String {
        let mut h = Hasher::new();
        h.update(self.subject.as_uuid().as_bytes());
        h.update(b"\x1f");
        h.update(self.predicate.as_bytes());
        h.update(b"\x1f");
        h.update(self.object.canonical().as_bytes());
        h.update(match self.polarity {
            Polarity::Affirmed => b"\x1f+",
            Polarity::Negated => b"\x1f-",
        });
        h.finalize().to_hex().to_string()
    }
}

impl fmt::Display for FactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let not = match self.polarity {
            Polarity::Affirmed => "",
            Polarity::Negated => "not ",
        };
        write!(f, "({} {} {not}{})", self.subject, self.predicate, self.object)
    }
}

/// One source's backing of a claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    /// The backing source.
    pub source: Source,
    /// Extraction confidence before source weighting, in `[0, 1]`.
    pub raw_confidence: f64,
}

impl Contribution {
    /// Backing by `source` at extraction confidence `raw_confidence`.
    #[must_use]
    pub const fn new(source: Source, raw_confidence: f64) -> Self {
        Self {
            source,
            raw_confidence,
        }
    }

    /// Id of the backing source.
    #[must_use]
    pub const fn source_id(&self) -> SourceId {
        self.source.id
    }

    /// `raw × authority × freshness`, before hedge discounting.
    #[must_use]
    pub fn evidence(&self) -> f64 {
        (self.raw_confidence * self.source.weight()).clamp(0.0, 1.0)
    }
}

/// A committed or candidate claim.
///
/// `superseded_by` and `sequence` are owned by the store: they are ignored
/// on input and populated on every read. Fused confidence is not a claim
/// field; it lives on the derived [`FusedFact`](crate::fusion::FusedFact).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    /// Unique claim id.
    pub id: ClaimId,
    /// Entity the claim is about.
    pub subject: EntityId,
    /// Normalized predicate.
    pub predicate: String,
    /// What the subject relates to.
    pub object: Object,
    /// How strongly the claim states its content.
    #[serde(default)]
    pub modality: Modality,
    /// Hedging phrases from extraction ("reportedly", "may").
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hedges: Vec<String>,
    /// Sources backing the claim; never empty once committed.
    pub contributions: Vec<Contribution>,
    /// When the claim holds.
    pub interval: Interval,
    /// The claim that replaced this one, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<ClaimId>,
    /// When the store accepted the claim.
    pub committed_at: DateTime<Utc>,
    /// Position in the append log; 0 until committed.
    #[serde(default)]
    pub sequence: u64,
}

impl Claim {
    /// Starts building a claim.
    pub fn builder() -> ClaimBuilder {
        ClaimBuilder::new()
    }

    /// The fused fact this claim contributes to.
    #[must_use]
    pub fn fact_key(&self) -> FactKey {
        FactKey {
            subject: self.subject,
            predicate: self.predicate.clone(),
            object: self.object.clone(),
            polarity: self.modality.polarity(),
        }
    }

    /// The slot this claim can contradict within.
    #[must_use]
    pub fn slot_key(&self) -> SlotKey {
        SlotKey {
            subject: self.subject,
            predicate: self.predicate.clone(),
        }
    }

    /// Whether a later claim replaced this one.
    pub const fn is_superseded(&self) -> bool {
        self.superseded_by.is_some()
    }

    /// Whether the claim holds at `time`.
    pub fn is_valid_at(&self, time: DateTime<Utc>) -> bool {
        self.interval.contains(time)
    }

    /// Checks the commit invariants: non-empty subject, predicate and
    /// object; a well-formed interval; at least one contribution; all
    /// weights in `[0, 1]`.
    ///
    /// # Errors
    ///
    /// Returns the first `ValidationError` found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.subject.is_nil() {
            return Err(ValidationError::empty("subject"));
        }
        if self.predicate.trim().is_empty() {
            return Err(ValidationError::empty("predicate"));
        }
        if self.object.is_empty() {
            return Err(ValidationError::empty("object"));
        }
        self.interval.validate()?;
        if self.contributions.is_empty() {
            return Err(ValidationError::NoSources);
        }
        for c in &self.contributions {
            c.source.validate()?;
            check_unit("raw_confidence", c.raw_confidence)?;
        }
        Ok(())
    }
}

/// Builder for constructing claims.
#[derive(Debug, Default)]
pub struct ClaimBuilder {
    id: Option<ClaimId>,
    subject: Option<EntityId>,
    predicate: Option<String>,
    object: Option<Object>,
    modality: Modality,
    hedges: Vec<String>,
    contributions: Vec<Contribution>,
    interval: Option<Interval>,
}

impl ClaimBuilder {
    /// An empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets an explicit id; a random one is generated otherwise.
    #[must_use]
    pub const fn id(mut self, id: ClaimId) -> Self {
        self.id = Some(id);
        self
    }

    /// Sets the subject entity.
    #[must_use]
    pub const fn subject(mut self, subject: EntityId) -> Self {
        self.subject = Some(subject);
        self
    }

    /// Sets the predicate.
    #[must_use]
    pub fn predicate(mut self, predicate: impl Into<String>) -> Self {
        self.predicate = Some(predicate.into());
        self
    }

    /// Sets the object.
    #[must_use]
    pub fn object(mut self, object: impl Into<Object>) -> Self {
        self.object = Some(object.into());
        self
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

    /// Adds a source contribution.
    #[must_use]
    pub fn contribution(mut self, source: Source, raw_confidence: f64) -> Self {
        self.contributions.push(Contribution::new(source, raw_confidence));
        self
    }

    /// Sets the whole validity interval.
    #[must_use]
    pub fn interval(mut self, interval: Interval) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Sets the start of validity, keeping any end already set.
    #[must_use]
    pub fn valid_from(mut self, from: DateTime<Utc>) -> Self {
        let until = self.interval.as_ref().and_then(|i| i.until);
        self.interval = Some(Interval { from, until });
        self
    }

    /// Sets the end of validity. An unset start defaults to the Unix epoch.
    #[must_use]
    pub fn valid_until(mut self, until: DateTime<Utc>) -> Self {
        let from = self
            .interval
            .as_ref()
            .map_or(DateTime::UNIX_EPOCH, |i| i.from);
        self.interval = Some(Interval {
            from,
            until: Some(until),
        });
        self
    }

    /// Builds the claim.
    ///
    /// An unset interval defaults to "valid from now, still true".
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` if required fields are missing or any
    /// claim invariant is violated.
    pub fn build(self) -> Result<Claim, ValidationError> {
        let subject = self.subject.ok_or_else(|| ValidationError::empty("subject"))?;
        let predicate = self
            .predicate
            .ok_or_else(|| ValidationError::empty("predicate"))?
            .trim()
            .to_string();
        let object = self.object.ok_or_else(|| ValidationError::empty("object"))?;

        let claim = Claim {
            id: self.id.unwrap_or_default(),
            subject,
            predicate,
            object,
            modality: self.modality,
            hedges: self.hedges,
            contributions: self.contributions,
            interval: self.interval.unwrap_or_else(Interval::from_now),
            superseded_by: None,
            committed_at: Utc::now(),
            sequence: 0,
        };
        claim.validate()?;
        Ok(claim)
    }
}
