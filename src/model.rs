//! Diagram model: entities, fields, and foreign-key connections.
//!
//! DESIGN
//! ======
//! The model is plain data. Only the mutation layer (`crate::mutation`) builds
//! new values from old ones, and only the engine commits them. Entities are
//! kept in a `BTreeMap` keyed by name so every pass over the diagram (routing,
//! snapshots, tests) sees the same order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Default rendered width of an entity card when no measurement is known.
pub const DEFAULT_ENTITY_WIDTH: f64 = 250.0;

/// Height of the entity header band.
pub const ENTITY_HEADER_HEIGHT: f64 = 40.0;

/// Height of one field row.
pub const FIELD_ROW_HEIGHT: f64 = 28.0;

// =============================================================================
// GEOMETRY PRIMITIVES
// =============================================================================

/// Canvas position of an entity's top-left corner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    #[must_use]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Straight-line distance to another position.
    #[must_use]
    pub fn distance_to(self, other: Position) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// Measured size of a rendered entity card.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
}

impl Rect {
    #[must_use]
    pub fn new(origin: Position, size: Size) -> Self {
        Self { left: origin.x, top: origin.y, right: origin.x + size.width, bottom: origin.y + size.height }
    }
}

// =============================================================================
// FIELDS
// =============================================================================

/// Key role of a field. The variants are mutually exclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyRole {
    #[default]
    Normal,
    Primary,
    Foreign,
}

impl KeyRole {
    /// Next role in the toggle cycle `NORMAL → PRIMARY → FOREIGN → NORMAL`.
    #[must_use]
    pub fn next(self) -> Self {
        match self {
            Self::Normal => Self::Primary,
            Self::Primary => Self::Foreign,
            Self::Foreign => Self::Normal,
        }
    }
}

/// Foreign-key relationship from a field to a target entity field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub target_entity: String,
    pub target_field: i64,
    /// Display identity of the relationship (the foreign-key name).
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default)]
    pub animated: bool,
}

/// A column of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    /// Unique within the owning entity. Temporary while `pending` is set.
    pub id: i64,
    pub name: String,
    pub data_type: String,
    #[serde(default)]
    pub role: KeyRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<Connection>,
    /// Set while the id is a locally assigned placeholder awaiting confirmation.
    #[serde(default, skip_serializing)]
    pub pending: bool,
}

impl Field {
    #[must_use]
    pub fn new(id: i64, name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self { id, name: name.into(), data_type: data_type.into(), role: KeyRole::Normal, connection: None, pending: false }
    }

    #[must_use]
    pub fn with_role(mut self, role: KeyRole) -> Self {
        self.role = role;
        self
    }

    #[must_use]
    pub fn with_connection(mut self, connection: Connection) -> Self {
        self.role = KeyRole::Foreign;
        self.connection = Some(connection);
        self
    }
}

// =============================================================================
// ENTITIES
// =============================================================================

/// A table node in the diagram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Stable name, unique among live entities.
    pub name: String,
    /// Server-side numeric identity, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<i64>,
    pub position: Position,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Size>,
    #[serde(default)]
    pub fields: Vec<Field>,
}

impl Entity {
    #[must_use]
    pub fn new(name: impl Into<String>, position: Position) -> Self {
        Self { name: name.into(), model_id: None, position, size: None, fields: Vec::new() }
    }

    #[must_use]
    pub fn with_field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    #[must_use]
    pub fn field(&self, id: i64) -> Option<&Field> {
        self.fields.iter().find(|f| f.id == id)
    }

    pub(crate) fn field_mut(&mut self, id: i64) -> Option<&mut Field> {
        self.fields.iter_mut().find(|f| f.id == id)
    }

    /// Bounding box, using the measured size or an estimate from the field count.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn bounds(&self) -> Rect {
        let size = self.size.unwrap_or(Size {
            width: DEFAULT_ENTITY_WIDTH,
            height: ENTITY_HEADER_HEIGHT + FIELD_ROW_HEIGHT * self.fields.len() as f64,
        });
        Rect::new(self.position, size)
    }
}

// =============================================================================
// DIAGRAM
// =============================================================================

/// One outgoing connection, flattened for routing.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionRef<'a> {
    pub source_entity: &'a str,
    pub source_field: i64,
    pub connection: &'a Connection,
}

/// The full client-visible diagram.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diagram {
    entities: BTreeMap<String, Entity>,
}

impl Diagram {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_entities(entities: impl IntoIterator<Item = Entity>) -> Self {
        Self { entities: entities.into_iter().map(|e| (e.name.clone(), e)).collect() }
    }

    #[must_use]
    pub fn entity(&self, name: &str) -> Option<&Entity> {
        self.entities.get(name)
    }

    /// Look up an entity by its server-side numeric id.
    #[must_use]
    pub fn entity_by_model_id(&self, model_id: i64) -> Option<&Entity> {
        self.entities.values().find(|e| e.model_id == Some(model_id))
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Every outgoing connection in entity-name then field order.
    pub fn connections(&self) -> impl Iterator<Item = ConnectionRef<'_>> {
        self.entities.values().flat_map(|entity| {
            entity.fields.iter().filter_map(move |field| {
                field.connection.as_ref().map(|connection| ConnectionRef {
                    source_entity: entity.name.as_str(),
                    source_field: field.id,
                    connection,
                })
            })
        })
    }

    pub(crate) fn upsert(&mut self, entity: Entity) {
        self.entities.insert(entity.name.clone(), entity);
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<Entity> {
        self.entities.remove(name)
    }
}

impl Serialize for Diagram {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        DiagramDocument { entities: self.entities.values().cloned().collect() }.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Diagram {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let doc = DiagramDocument::deserialize(deserializer)?;
        Ok(Self::from_entities(doc.entities))
    }
}

/// Bootstrap document shape: `{"entities": [...]}`.
#[derive(Serialize, Deserialize)]
struct DiagramDocument {
    #[serde(default)]
    entities: Vec<Entity>,
}

#[cfg(test)]
#[path = "model_test.rs"]
mod tests;
