//! Connector attachment sides, with memory.
//!
//! DESIGN
//! ======
//! A connector runs from a field's anchor on the source entity to a field's
//! anchor on the target entity. Each anchor sits on the left or right edge.
//! When the two entities are horizontally disjoint the answer is forced; when
//! they overlap any side is defensible, so the last recorded side wins. That
//! hysteresis keeps a line from flipping while an entity is dragged across
//! another one.
//!
//! The memory ([`HandleStore`]) is keyed by source entity, target entity and
//! field pair, and is written to disk so sides also survive a restart.
//! [`resolve_all`] does every read and write for one refresh in a single pass,
//! and forgets keys whose connector was not drawn in that pass.

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::model::{Diagram, Rect};

// =============================================================================
// SIDES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

impl Side {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Right => "right",
        }
    }
}

/// Which end of a connector a handle belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleRole {
    Source,
    Target,
}

/// Resolved sides for both ends of one connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Sides {
    pub source: Side,
    pub target: Side,
}

/// Pick attachment sides from horizontal extents.
///
/// Disjoint extents force the facing sides. Overlapping extents reuse
/// `previous` on both ends, or `Right` when nothing was ever recorded.
#[must_use]
pub fn resolve_sides(source: Rect, target: Rect, previous: Option<Side>) -> Sides {
    if source.right < target.left {
        Sides { source: Side::Right, target: Side::Left }
    } else if source.left > target.right {
        Sides { source: Side::Left, target: Side::Right }
    } else {
        let side = previous.unwrap_or(Side::Right);
        Sides { source: side, target: side }
    }
}

/// Anchor identifier for a field's handle, e.g. `orders-3-right-source`.
#[must_use]
pub fn handle_id(entity: &str, field: i64, side: Side, role: HandleRole) -> String {
    let role = match role {
        HandleRole::Source => "source",
        HandleRole::Target => "target",
    };
    format!("{entity}-{field}-{}-{role}", side.as_str())
}

/// Memory key for one connector. Independent of the sides chosen.
#[must_use]
pub fn assignment_key(source_entity: &str, source_field: i64, target_entity: &str, target_field: i64) -> String {
    format!("{source_entity}.{source_field}->{target_entity}.{target_field}")
}

// =============================================================================
// HANDLE STORE
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum HandleStoreError {
    #[error("handle store io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("handle store encode: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Remembered source side per connector key, optionally backed by a JSON file.
#[derive(Debug, Default)]
pub struct HandleStore {
    path: Option<PathBuf>,
    sides: BTreeMap<String, Side>,
    dirty: bool,
}

impl HandleStore {
    /// Memory that is never written anywhere.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load from `path`. A missing file starts empty; so does an unreadable
    /// document, after a warning.
    ///
    /// # Errors
    ///
    /// Returns [`HandleStoreError::Io`] when the file exists but cannot be read.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, HandleStoreError> {
        let path = path.into();
        let sides = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<BTreeMap<String, Side>>(&bytes) {
                Ok(sides) => sides,
                Err(e) => {
                    warn!(error = %e, path = %path.display(), "geometry: corrupt handle store, starting empty");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(HandleStoreError::Io { path, source }),
        };
        debug!(path = %path.display(), entries = sides.len(), "geometry: handle store loaded");
        Ok(Self { path: Some(path), sides, dirty: false })
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Side> {
        self.sides.get(key).copied()
    }

    /// Remember `side` for `key`. Returns `true` when this changed the memory.
    pub fn record(&mut self, key: &str, side: Side) -> bool {
        if self.sides.get(key) == Some(&side) {
            return false;
        }
        self.sides.insert(key.to_owned(), side);
        self.dirty = true;
        true
    }

    /// Forget every key not in `live`. Returns how many were dropped.
    pub fn retain_keys(&mut self, live: &HashSet<&str>) -> usize {
        let before = self.sides.len();
        self.sides.retain(|key, _| live.contains(key.as_str()));
        let dropped = before - self.sides.len();
        if dropped > 0 {
            self.dirty = true;
        }
        dropped
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sides.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sides.is_empty()
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write to the backing file if anything changed since the last save.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be written or moved into place.
    pub async fn save(&mut self) -> Result<(), HandleStoreError> {
        if !self.dirty {
            return Ok(());
        }
        let Some(path) = self.path.clone() else {
            self.dirty = false;
            return Ok(());
        };

        let body = serde_json::to_vec_pretty(&self.sides)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &body)
            .await
            .map_err(|source| HandleStoreError::Io { path: tmp.clone(), source })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| HandleStoreError::Io { path: path.clone(), source })?;

        self.dirty = false;
        debug!(path = %path.display(), entries = self.sides.len(), "geometry: handle store saved");
        Ok(())
    }
}

// =============================================================================
// ROUTES
// =============================================================================

/// Everything the presentation layer needs to draw one connector.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorRoute {
    pub key: String,
    pub name: String,
    pub source_entity: String,
    pub source_field: i64,
    pub target_entity: String,
    pub target_field: i64,
    pub sides: Sides,
    pub source_handle: String,
    pub target_handle: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    pub animated: bool,
}

/// Resolve every connector in `diagram`, recording the chosen sides in `store`.
///
/// Connectors whose target entity is missing are skipped. Memory for
/// connectors that were not resolved is dropped.
pub fn resolve_all(diagram: &Diagram, store: &mut HandleStore) -> Vec<ConnectorRoute> {
    let mut routes = Vec::new();
    for conn in diagram.connections() {
        let (Some(source), Some(target)) =
            (diagram.entity(conn.source_entity), diagram.entity(&conn.connection.target_entity))
        else {
            debug!(source = conn.source_entity, target = %conn.connection.target_entity, "geometry: dangling connector");
            continue;
        };

        let key = assignment_key(
            conn.source_entity,
            conn.source_field,
            &conn.connection.target_entity,
            conn.connection.target_field,
        );
        let sides = resolve_sides(source.bounds(), target.bounds(), store.get(&key));
        store.record(&key, sides.source);

        routes.push(ConnectorRoute {
            source_handle: handle_id(&source.name, conn.source_field, sides.source, HandleRole::Source),
            target_handle: handle_id(&target.name, conn.connection.target_field, sides.target, HandleRole::Target),
            key,
            name: conn.connection.name.clone(),
            source_entity: source.name.clone(),
            source_field: conn.source_field,
            target_entity: target.name.clone(),
            target_field: conn.connection.target_field,
            sides,
            color: conn.connection.color.clone(),
            animated: conn.connection.animated,
        });
    }

    let live: HashSet<&str> = routes.iter().map(|r| r.key.as_str()).collect();
    let dropped = store.retain_keys(&live);
    if dropped > 0 {
        debug!(dropped, "geometry: forgot sides of removed connectors");
    }
    routes
}

#[cfg(test)]
#[path = "geometry_test.rs"]
mod tests;
