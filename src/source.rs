//! Source and provenance types.
//!
//! A source is where a contribution came from: a paper, a page, an API. It
//! carries two weights in `[0, 1]` that scale every piece of evidence it
//! contributes: `authority` (how much the source is trusted at all) and
//! `freshness` (how current it was at retrieval).

use std::fmt;

use blake3::Hasher;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Stable source identifier, derived from the source's external key.
///
/// The same key always maps to the same id, so re-submitting evidence from a
/// known source is recognized as the same source during fusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(Uuid);

impl SourceId {
    /// Derives the id for an external source key (`arxiv:1810.04805`, a URL, …).
    #[must_use]
    pub fn from_key(key: &str) -> Self {
        let mut h = Hasher::new();
        h.update(b"kyrograph/source/");
        h.update(key.trim().as_bytes());
        let hash = h.finalize();

        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&hash.as_bytes()[..16]);
        Self(Uuid::from_bytes(bytes))
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Checks that a weight lies in `[0, 1]` (NaN fails).
pub(crate) fn check_unit(field: &str, value: f64) -> Result<(), ValidationError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::ConfidenceOutOfRange {
            field: field.to_string(),
            value,
        })
    }
}

/// Freshness from age by exponential half-life decay.
///
/// A source retrieved `half_life_days` ago scores 0.5; retrieval in the
/// future (clock skew) scores 1.0.
#[must_use]
pub fn freshness_from_age(
    retrieved_at: DateTime<Utc>,
    now: DateTime<Utc>,
    half_life_days: f64,
) -> f64 {
    if half_life_days <= 0.0 || !half_life_days.is_finite() {
        return 1.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let age_days = (now - retrieved_at).num_seconds() as f64 / 86_400.0;
    if age_days <= 0.0 {
        return 1.0;
    }
    0.5_f64.powf(age_days / half_life_days).clamp(0.0, 1.0)
}

/// A source of evidence.
///
/// # Examples
///
/// ```
/// use kyrograph::Source;
/// use chrono::Utc;
///
/// let paper = Source::new("arxiv:1810.04805", 0.9, 1.0, Utc::now()).unwrap();
/// assert!((paper.weight() - 0.9).abs() < 1e-12);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    /// Content-derived id, stable across runs.
    pub id: SourceId,

    /// External key the id was derived from.
    pub key: String,

    /// How much the source is trusted, in `[0, 1]`.
    pub authority: f64,

    /// How current the content is, in `[0, 1]`.
    pub freshness: f64,

    /// When the content was retrieved.
    pub retrieved_at: DateTime<Utc>,
}

impl Source {
    /// Creates a source.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` for a blank key or weights outside `[0, 1]`.
    pub fn new(
        key: impl Into<String>,
        authority: f64,
        freshness: f64,
        retrieved_at: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        let key = key.into().trim().to_string();
        let source = Self {
            id: SourceId::from_key(&key),
            key,
            authority,
            freshness,
            retrieved_at,
        };
        source.validate()?;
        Ok(source)
    }

    /// Validates key and weights.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` for a blank key or weights outside `[0, 1]`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.key.is_empty() {
            return Err(ValidationError::empty("source.id"));
        }
        check_unit("authority", self.authority)?;
        check_unit("freshness", self.freshness)
    }

    /// Combined weight applied to every contribution from this source.
    #[must_use]
    pub fn weight(&self) -> f64 {
        self.authority * self.freshness
    }
}
