//! Entity types and identity management.
//!
//! Entities are the vertices claims hang off. Identity is immutable: once an
//! entity is committed its id, name and kind never change.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Globally unique, stable entity identifier.
///
/// # Examples
///
/// ```
/// use kyrograph::EntityId;
///
/// let id = EntityId::new();
/// assert!(!id.is_nil());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(Uuid);

impl EntityId {
    /// Creates a new random entity ID.
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

    /// Returns true if this is a nil (all zeros) UUID.
    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    /// Creates a nil entity ID (sentinel for "missing subject").
    #[must_use]
    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EntityId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::str::FromStr for EntityId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Type tag of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A protocol, standard or algorithm
    Protocol,
    /// A company, institution, or group
    Organization,
    /// A named individual
    Person,
    /// An abstract concept or idea
    Concept,
    /// A model, paper, dataset or other made thing
    Artifact,
    /// Something that happened at a point or span in time
    Event,
    /// A place
    Location,
    /// A domain-specific kind
    Custom(String),
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol => write!(f, "protocol"),
            Self::Organization => write!(f, "organization"),
            Self::Person => write!(f, "person"),
            Self::Concept => write!(f, "concept"),
            Self::Artifact => write!(f, "artifact"),
            Self::Event => write!(f, "event"),
            Self::Location => write!(f, "location"),
            Self::Custom(name) => write!(f, "custom:{name}"),
        }
    }
}

/// Normalizes an entity name for by-name lookup: trimmed, inner whitespace
/// collapsed, ASCII lowercase.
#[must_use]
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase()
}

/// A stable identity anchor for claims.
///
/// # Examples
///
/// ```
/// use kyrograph::{Entity, EntityKind};
///
/// let bert = Entity::new("BERT", EntityKind::Artifact).unwrap();
/// assert_eq!(bert.canonical_name, "BERT");
/// assert_eq!(bert.lookup_name(), "bert");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    /// Unique entity id.
    pub id: EntityId,

    /// Display name, trimmed.
    pub canonical_name: String,

    /// What sort of thing the entity is.
    pub kind: EntityKind,

    /// Reference into an external ontology (e.g. `wikidata:Q61726893`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ontology_ref: Option<String>,

    /// When the entity was first recorded.
    pub created_at: DateTime<Utc>,
}

impl Entity {
    /// Creates a new entity with the given name and kind.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::EmptyEntityName` for a blank name.
    pub fn new(name: impl Into<String>, kind: EntityKind) -> Result<Self, ValidationError> {
        Self::with_id(EntityId::new(), name, kind)
    }

    /// Creates a new entity with a specific ID.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::EmptyEntityName` for a blank name.
    pub fn with_id(
        id: EntityId,
        name: impl Into<String>,
        kind: EntityKind,
    ) -> Result<Self, ValidationError> {
        let name = name.into().trim().to_string();
        if name.is_empty() {
            return Err(ValidationError::EmptyEntityName);
        }
        Ok(Self {
            id,
            canonical_name: name,
            kind,
            ontology_ref: None,
            created_at: Utc::now(),
        })
    }

    /// Attaches an external ontology reference.
    #[must_use]
    pub fn with_ontology_ref(mut self, reference: impl Into<String>) -> Self {
        self.ontology_ref = Some(reference.into());
        self
    }

    /// The key this entity is indexed under for by-name resolution.
    #[must_use]
    pub fn lookup_name(&self) -> String {
        normalize_name(&self.canonical_name)
    }

    /// Re-checks identity invariants on records that bypassed the constructor.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` on a nil id or blank name.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_nil() {
            return Err(ValidationError::empty("entity.id"));
        }
        if self.canonical_name.trim().is_empty() {
            return Err(ValidationError::EmptyEntityName);
        }
        Ok(())
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Entity {}

impl std::hash::Hash for Entity {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_id_creation() {
        let id1 = EntityId::new();
        let id2 = EntityId::new();
        assert_ne!(id1, id2);
        assert!(!id1.is_nil());
        assert!(EntityId::nil().is_nil());
    }

    #[test]
    fn test_entity_id_parse() {
        let id = EntityId::new();
        let parsed: EntityId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<EntityId>().is_err());
    }

    #[test]
    fn test_entity_new_trims_name() {
        let e = Entity::new("  Transformer ", EntityKind::Concept).unwrap();
        assert_eq!(e.canonical_name, "Transformer");
        assert!(e.ontology_ref.is_none());
    }

    #[test]
    fn test_entity_empty_name_rejected() {
        assert_eq!(
            Entity::new("   ", EntityKind::Concept).unwrap_err(),
            ValidationError::EmptyEntityName
        );
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("  Google   Brain "), "google brain");
        assert_eq!(normalize_name("BERT"), "bert");
    }

    #[test]
    fn test_entity_equality_by_id() {
        let a = Entity::new("BERT", EntityKind::Artifact).unwrap();
        let mut b = a.clone();
        b.canonical_name = "bert-base".to_string();
        assert_eq!(a, b);
    }

    #[test]
    fn test_entity_kind_display() {
        assert_eq!(EntityKind::Protocol.to_string(), "protocol");
        assert_eq!(EntityKind::Custom("gene".into()).to_string(), "custom:gene");
    }

    #[test]
    fn test_entity_serialization() {
        let e = Entity::new("TCP", EntityKind::Protocol)
            .unwrap()
            .with_ontology_ref("wikidata:Q8803");
        let json = serde_json::to_string(&e).unwrap();
        let back: Entity = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, e.id);
        assert_eq!(back.ontology_ref.as_deref(), Some("wikidata:Q8803"));
        assert!(back.validate().is_ok());
    }
}
