//! Diagram state transitions.
//!
//! DESIGN
//! ======
//! `apply` is a pure function of (current diagram, edit). It never touches the
//! diagram it reads: every entity it changes is cloned into a draft, and the
//! result is a `Patch` holding complete replacement entities. An edit that
//! fails validation yields an error and no patch, so a caller can never observe
//! half an edit.
//!
//! Local actions and inbound broadcasts both go through `apply`, which keeps
//! the two paths from interpreting an edit differently.

use std::collections::{BTreeMap, BTreeSet};

use crate::model::{Connection, Diagram, Entity, Field, KeyRole, Position};

// =============================================================================
// EDITS
// =============================================================================

/// One atomic change to the diagram.
#[derive(Debug, Clone, PartialEq)]
pub enum Edit {
    MoveEntity { entity: String, position: Position },
    UpdateField { entity: String, field: i64, name: Option<String>, data_type: Option<String> },
    /// Put the field into `role`. `Primary` and `Normal` drop any connection.
    SetKeyRole { entity: String, field: i64, role: KeyRole },
    /// Return the field to `Normal`, but only if it currently holds `role`.
    ReleaseKeyRole { entity: String, field: i64, role: KeyRole },
    AddField { entity: String, field: Field, ordinal: usize },
    /// Give a field its authoritative id. Only an `own` confirmation may claim
    /// a pending placeholder; any other inserts the announced field.
    ConfirmField {
        entity: String,
        ordinal: usize,
        temp_id: i64,
        real_id: i64,
        name: String,
        data_type: String,
        own: bool,
    },
    DeleteField { entity: String, field: i64 },
    Connect { entity: String, field: i64, connection: Connection },
    Disconnect { entity: String, field: i64 },
    AddEntity { entity: Entity },
    RenameEntity { from: String, to: String },
    DeleteEntity { entity: String },
}

impl Edit {
    /// Name of the entity the edit is addressed to.
    #[must_use]
    pub fn entity_name(&self) -> &str {
        match self {
            Self::MoveEntity { entity, .. }
            | Self::UpdateField { entity, .. }
            | Self::SetKeyRole { entity, .. }
            | Self::ReleaseKeyRole { entity, .. }
            | Self::AddField { entity, .. }
            | Self::ConfirmField { entity, .. }
            | Self::DeleteField { entity, .. }
            | Self::Connect { entity, .. }
            | Self::Disconnect { entity, .. }
            | Self::DeleteEntity { entity } => entity,
            Self::AddEntity { entity } => &entity.name,
            Self::RenameEntity { from, .. } => from,
        }
    }
}

/// Validation failure for an edit. Nothing has been mutated when this is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EditError {
    #[error("unknown entity `{0}`")]
    UnknownEntity(String),
    #[error("unknown field {field} on entity `{entity}`")]
    UnknownField { entity: String, field: i64 },
    #[error("foreign key target {entity}.{field} does not exist")]
    UnknownTarget { entity: String, field: i64 },
    #[error("entity `{0}` already exists")]
    DuplicateEntity(String),
    #[error("field {field} already exists on entity `{entity}`")]
    DuplicateField { entity: String, field: i64 },
    #[error("name must not be empty")]
    EmptyName,
}

// =============================================================================
// PATCH
// =============================================================================

/// Complete replacement entities plus removed entity names.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    pub upserts: Vec<Entity>,
    pub removals: Vec<String>,
}

impl Patch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }
}

impl Diagram {
    /// Commit a patch produced by [`apply`]. Removals run before upserts so a
    /// rename lands as remove-old, insert-new.
    pub fn commit(&mut self, patch: Patch) {
        for name in &patch.removals {
            self.remove(name);
        }
        for entity in patch.upserts {
            self.upsert(entity);
        }
    }
}

// =============================================================================
// APPLY
// =============================================================================

/// Compute the patch for `edit` against `diagram`.
///
/// # Errors
///
/// Returns an [`EditError`] when the edit addresses something that does not
/// exist or would break a uniqueness rule.
pub fn apply(diagram: &Diagram, edit: &Edit) -> Result<Patch, EditError> {
    let mut draft = Draft::new(diagram);

    match edit {
        Edit::MoveEntity { entity, position } => {
            draft.entity_mut(entity)?.position = *position;
        }
        Edit::UpdateField { entity, field, name, data_type } => {
            if name.as_deref().is_some_and(|n| n.trim().is_empty()) {
                return Err(EditError::EmptyName);
            }
            let target = draft.field_mut(entity, *field)?;
            if let Some(name) = name {
                target.name.clone_from(name);
            }
            if let Some(data_type) = data_type {
                target.data_type.clone_from(data_type);
            }
        }
        Edit::SetKeyRole { entity, field, role } => {
            set_role(draft.field_mut(entity, *field)?, *role);
        }
        Edit::ReleaseKeyRole { entity, field, role } => {
            let current = draft.peek_field(entity, *field)?.role;
            if current != *role {
                return Ok(Patch::default());
            }
            set_role(draft.field_mut(entity, *field)?, KeyRole::Normal);
        }
        Edit::AddField { entity, field, ordinal } => {
            let target = draft.entity_mut(entity)?;
            if target.field(field.id).is_some() {
                return Err(EditError::DuplicateField { entity: entity.clone(), field: field.id });
            }
            let at = (*ordinal).min(target.fields.len());
            target.fields.insert(at, field.clone());
        }
        Edit::ConfirmField { entity, ordinal, temp_id, real_id, name, data_type, own } => {
            if !(*own && claim_placeholder(&mut draft, entity, *ordinal, *temp_id, *real_id)?) {
                insert_confirmed(&mut draft, entity, *ordinal, *temp_id, *real_id, name, data_type)?;
            }
        }
        Edit::DeleteField { entity, field } => {
            let target = draft.entity_mut(entity)?;
            let before = target.fields.len();
            target.fields.retain(|f| f.id != *field);
            if target.fields.len() == before {
                return Err(EditError::UnknownField { entity: entity.clone(), field: *field });
            }
            draft.edit_connections(
                |c| c.target_entity == *entity && c.target_field == *field,
                |f| f.connection = None,
            );
        }
        Edit::Connect { entity, field, connection } => {
            let target_known = draft
                .peek(&connection.target_entity)
                .is_some_and(|e| e.field(connection.target_field).is_some());
            if !target_known {
                return Err(EditError::UnknownTarget {
                    entity: connection.target_entity.clone(),
                    field: connection.target_field,
                });
            }
            let source = draft.field_mut(entity, *field)?;
            source.role = KeyRole::Foreign;
            source.connection = Some(connection.clone());
        }
        Edit::Disconnect { entity, field } => {
            draft.field_mut(entity, *field)?.connection = None;
        }
        Edit::AddEntity { entity } => {
            if entity.name.trim().is_empty() {
                return Err(EditError::EmptyName);
            }
            if draft.peek(&entity.name).is_some() {
                return Err(EditError::DuplicateEntity(entity.name.clone()));
            }
            draft.insert(entity.clone());
        }
        Edit::RenameEntity { from, to } => {
            if to.trim().is_empty() {
                return Err(EditError::EmptyName);
            }
            if from == to {
                return Ok(Patch::default());
            }
            if draft.peek(to).is_some() {
                return Err(EditError::DuplicateEntity(to.clone()));
            }
            let mut renamed = draft.entity_mut(from)?.clone();
            renamed.name.clone_from(to);
            draft.remove(from);
            draft.insert(renamed);
            draft.edit_connections(|c| c.target_entity == *from, |f| {
                if let Some(c) = f.connection.as_mut() {
                    c.target_entity.clone_from(to);
                }
            });
        }
        Edit::DeleteEntity { entity } => {
            if draft.peek(entity).is_none() {
                return Err(EditError::UnknownEntity(entity.clone()));
            }
            draft.remove(entity);
            draft.edit_connections(|c| c.target_entity == *entity, |f| f.connection = None);
        }
    }

    Ok(draft.into_patch())
}

fn set_role(field: &mut Field, role: KeyRole) {
    field.role = role;
    if role != KeyRole::Foreign {
        field.connection = None;
    }
}

/// Swap our pending placeholder for the real id. `false` if there is none.
fn claim_placeholder(
    draft: &mut Draft<'_>,
    entity: &str,
    ordinal: usize,
    temp_id: i64,
    real_id: i64,
) -> Result<bool, EditError> {
    let current = draft.peek(entity).ok_or_else(|| EditError::UnknownEntity(entity.to_owned()))?;

    // Placeholder at the announced ordinal first; the id is only a fallback.
    let slot = current
        .fields
        .get(ordinal)
        .filter(|f| f.pending)
        .map(|_| ordinal)
        .or_else(|| current.fields.iter().position(|f| f.pending && f.id == temp_id));
    let Some(index) = slot else {
        return Ok(false);
    };

    let old_id = current.fields[index].id;
    let target = draft.entity_mut(entity)?;
    if target.fields.iter().any(|f| f.id == real_id) {
        // Already confirmed through another path; drop the placeholder.
        target.fields.remove(index);
    } else {
        let field = &mut target.fields[index];
        field.id = real_id;
        field.pending = false;
    }
    draft.edit_connections(
        |c| c.target_entity == entity && c.target_field == old_id,
        |f| {
            if let Some(c) = f.connection.as_mut() {
                c.target_field = real_id;
            }
        },
    );
    Ok(true)
}

/// Record a confirmed field announced by someone else. Pending fields are ours
/// and never match.
fn insert_confirmed(
    draft: &mut Draft<'_>,
    entity: &str,
    ordinal: usize,
    temp_id: i64,
    real_id: i64,
    name: &str,
    data_type: &str,
) -> Result<(), EditError> {
    let current = draft.peek(entity).ok_or_else(|| EditError::UnknownEntity(entity.to_owned()))?;
    if current.field(real_id).is_some() {
        return Ok(());
    }

    let target = draft.entity_mut(entity)?;
    if let Some(existing) = target.fields.iter_mut().find(|f| !f.pending && f.id == temp_id) {
        existing.id = real_id;
    } else {
        let at = ordinal.min(target.fields.len());
        target.fields.insert(at, Field::new(real_id, name, data_type));
    }
    Ok(())
}

// =============================================================================
// DRAFT
// =============================================================================

/// Copy-on-write view over a diagram. Entities are cloned on first mutation.
struct Draft<'a> {
    base: &'a Diagram,
    touched: BTreeMap<String, Entity>,
    removed: BTreeSet<String>,
}

impl<'a> Draft<'a> {
    fn new(base: &'a Diagram) -> Self {
        Self { base, touched: BTreeMap::new(), removed: BTreeSet::new() }
    }

    fn peek(&self, name: &str) -> Option<&Entity> {
        if self.removed.contains(name) {
            return None;
        }
        self.touched.get(name).or_else(|| self.base.entity(name))
    }

    fn peek_field(&self, entity: &str, field: i64) -> Result<&Field, EditError> {
        self.peek(entity)
            .ok_or_else(|| EditError::UnknownEntity(entity.to_owned()))?
            .field(field)
            .ok_or_else(|| EditError::UnknownField { entity: entity.to_owned(), field })
    }

    fn entity_mut(&mut self, name: &str) -> Result<&mut Entity, EditError> {
        if self.removed.contains(name) {
            return Err(EditError::UnknownEntity(name.to_owned()));
        }
        if !self.touched.contains_key(name) {
            let original = self.base.entity(name).ok_or_else(|| EditError::UnknownEntity(name.to_owned()))?;
            self.touched.insert(name.to_owned(), original.clone());
        }
        self.touched.get_mut(name).ok_or_else(|| EditError::UnknownEntity(name.to_owned()))
    }

    fn field_mut(&mut self, entity: &str, field: i64) -> Result<&mut Field, EditError> {
        self.entity_mut(entity)?
            .field_mut(field)
            .ok_or_else(|| EditError::UnknownField { entity: entity.to_owned(), field })
    }

    fn insert(&mut self, entity: Entity) {
        self.removed.remove(&entity.name);
        self.touched.insert(entity.name.clone(), entity);
    }

    fn remove(&mut self, name: &str) {
        self.touched.remove(name);
        if self.base.entity(name).is_some() {
            self.removed.insert(name.to_owned());
        }
    }

    fn live_names(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = self.base.entities().map(|e| e.name.clone()).collect();
        names.extend(self.touched.keys().cloned());
        names.retain(|n| !self.removed.contains(n));
        names.into_iter().collect()
    }

    /// Run `update` on every field whose connection satisfies `matches`,
    /// across all live entities.
    fn edit_connections(&mut self, matches: impl Fn(&Connection) -> bool, update: impl Fn(&mut Field)) {
        for name in self.live_names() {
            let hit = self
                .peek(&name)
                .is_some_and(|e| e.fields.iter().any(|f| f.connection.as_ref().is_some_and(&matches)));
            if !hit {
                continue;
            }
            if let Ok(entity) = self.entity_mut(&name) {
                for field in &mut entity.fields {
                    if field.connection.as_ref().is_some_and(&matches) {
                        update(field);
                    }
                }
            }
        }
    }

    fn into_patch(self) -> Patch {
        Patch { upserts: self.touched.into_values().collect(), removals: self.removed.into_iter().collect() }
    }
}

#[cfg(test)]
#[path = "mutation_test.rs"]
mod tests;
