//! Optimistic mutation engine: the only owner of client-visible diagram state.
//!
//! ARCHITECTURE
//! ============
//! ```text
//! local action ──► mutation::apply ──► commit ──► Router::build_envelope ──► Outbox
//! inbound text ──► Router::route (echo filter) ──► Replica (MessageHandler)
//!                                                      └─► mutation::apply ──► commit
//! ```
//!
//! Both paths run the same pure transition function, so a local edit and its
//! remote counterpart cannot be interpreted differently. Every call reads the
//! diagram as it is at that moment; nothing holds a snapshot across calls.
//!
//! PENDING FIELDS
//! ==============
//! A newly added field gets a timestamp-based temporary id and is marked
//! pending. Edits to a pending field apply locally but are not transmitted,
//! because the server cannot address it yet. When the `ADD_ATTRIBUTE`
//! confirmation of our own add arrives carrying `realAttributeId`, the
//! placeholder is swapped for the real id (matched by ordinal). A peer's
//! confirmation never touches a placeholder; its field is inserted instead. If the placeholder was edited in the
//! meantime, one `FIELD_UPDATE` carries the local name and type to the server.
//! A placeholder deleted before its confirmation is deleted on the server by
//! real id once the confirmation arrives.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::model::{Connection, Diagram, Entity, Field, KeyRole, Position};
use crate::mutation::{self, Edit, EditError};
use crate::protocol::envelope::now_ms;
use crate::protocol::{
    AddAttribute, AddModel, DeleteAttribute, DeleteModel, EchoReason, ErrorNotice, FieldUpdate, ForeignKeyConnect,
    ForeignKeyDisconnect, ForeignKeyToggle, Message, MessageHandler, NodePosition, PrimaryKeyToggle, RouteOutcome,
    Router, UpdateModelName,
};

// =============================================================================
// OUTBOX
// =============================================================================

/// Where the engine hands finished payloads. Injected at construction.
pub trait Outbox {
    /// Transmit `payload` to `destination`. Returns `false` if it was dropped.
    fn publish(&self, destination: &str, payload: String) -> bool;
    fn is_connected(&self) -> bool;
}

// =============================================================================
// REPLICA
// =============================================================================

/// Diagram plus the bookkeeping inbound handlers need.
#[derive(Default)]
struct Replica {
    diagram: Diagram,
    revision: u64,
    /// Placeholders deleted locally before their confirmation: (entity, temp id).
    dropped_placeholders: HashSet<(String, i64)>,
    /// Messages to send once routing returns.
    followups: Vec<Message>,
    notices: Vec<ErrorNotice>,
}

impl Replica {
    fn commit(&mut self, edit: &Edit) -> Result<(), EditError> {
        let patch = mutation::apply(&self.diagram, edit)?;
        if !patch.is_empty() {
            self.diagram.commit(patch);
            self.revision += 1;
        }
        Ok(())
    }

    /// Apply a remote edit. Failures mean the edit no longer fits local state.
    fn commit_remote(&mut self, edit: &Edit) {
        if let Err(e) = self.commit(edit) {
            debug!(error = %e, entity = edit.entity_name(), "engine: remote edit not applicable");
        }
    }

    /// Entity name for an inbound payload: by name first, then by model id.
    fn resolve(&self, name: &str, model_id: Option<i64>) -> String {
        if self.diagram.entity(name).is_some() {
            return name.to_owned();
        }
        model_id
            .and_then(|id| self.diagram.entity_by_model_id(id))
            .map_or_else(|| name.to_owned(), |e| e.name.clone())
    }

    fn on_confirmation(&mut self, msg: AddAttribute, real_id: i64, own: bool) {
        let entity = self.resolve(&msg.model_name, msg.model_id);

        if own && self.dropped_placeholders.remove(&(entity.clone(), msg.attribute_id)) {
            debug!(%entity, real_id, "engine: confirmed field was deleted locally");
            self.followups.push(Message::DeleteAttribute(DeleteAttribute {
                model_name: entity,
                model_id: msg.model_id,
                attribute_id: real_id,
            }));
            return;
        }

        let placeholder = self.diagram.entity(&entity).filter(|_| own).and_then(|e| {
            e.fields
                .get(msg.ordinal)
                .filter(|f| f.pending)
                .or_else(|| e.fields.iter().find(|f| f.pending && f.id == msg.attribute_id))
                .cloned()
        });

        self.commit_remote(&Edit::ConfirmField {
            entity: entity.clone(),
            ordinal: msg.ordinal,
            temp_id: msg.attribute_id,
            real_id,
            name: msg.name.clone(),
            data_type: msg.data_type.clone(),
            own,
        });

        if let Some(local) = placeholder
            && (local.name != msg.name || local.data_type != msg.data_type)
        {
            debug!(%entity, real_id, "engine: replaying local edits of confirmed field");
            self.followups.push(Message::FieldUpdate(FieldUpdate {
                model_name: entity,
                model_id: msg.model_id,
                attribute_id: real_id,
                name: Some(local.name),
                data_type: Some(local.data_type),
            }));
        }
    }
}

impl MessageHandler for Replica {
    fn on_node_position(&mut self, msg: NodePosition) {
        let entity = self.resolve(&msg.model_name, msg.model_id);
        self.commit_remote(&Edit::MoveEntity { entity, position: Position::new(msg.x, msg.y) });
    }

    fn on_field_update(&mut self, msg: FieldUpdate) {
        let entity = self.resolve(&msg.model_name, msg.model_id);
        self.commit_remote(&Edit::UpdateField {
            entity,
            field: msg.attribute_id,
            name: msg.name,
            data_type: msg.data_type,
        });
    }

    fn on_toggle_primary_key(&mut self, msg: PrimaryKeyToggle) {
        let entity = self.resolve(&msg.model_name, msg.model_id);
        let field = msg.attribute_id;
        if msg.is_primary_key {
            self.commit_remote(&Edit::SetKeyRole { entity, field, role: KeyRole::Primary });
        } else {
            self.commit_remote(&Edit::ReleaseKeyRole { entity, field, role: KeyRole::Primary });
        }
    }

    fn on_toggle_foreign_key(&mut self, msg: ForeignKeyToggle) {
        let entity = self.resolve(&msg.model_name, msg.model_id);
        let field = msg.attribute_id;
        if msg.is_foreign_key {
            self.commit_remote(&Edit::SetKeyRole { entity, field, role: KeyRole::Foreign });
        } else {
            self.commit_remote(&Edit::ReleaseKeyRole { entity, field, role: KeyRole::Foreign });
        }
    }

    fn on_add_attribute(&mut self, msg: AddAttribute, echo: Option<EchoReason>) {
        if let Some(real_id) = msg.real_attribute_id {
            self.on_confirmation(msg, real_id, echo.is_some());
            return;
        }
        let entity = self.resolve(&msg.model_name, msg.model_id);
        let field = Field::new(msg.attribute_id, msg.name, msg.data_type);
        self.commit_remote(&Edit::AddField { entity, field, ordinal: msg.ordinal });
    }

    fn on_delete_attribute(&mut self, msg: DeleteAttribute) {
        let entity = self.resolve(&msg.model_name, msg.model_id);
        self.commit_remote(&Edit::DeleteField { entity, field: msg.attribute_id });
    }

    fn on_foreign_key_connect(&mut self, msg: ForeignKeyConnect) {
        let entity = self.resolve(&msg.model_name, msg.model_id);
        let connection = Connection {
            target_entity: msg.target_model_name,
            target_field: msg.target_attribute_id,
            name: msg.foreign_key_name,
            color: msg.color,
            animated: msg.animated,
        };
        self.commit_remote(&Edit::Connect { entity, field: msg.attribute_id, connection });
    }

    fn on_foreign_key_disconnect(&mut self, msg: ForeignKeyDisconnect) {
        let entity = self.resolve(&msg.model_name, msg.model_id);
        self.commit_remote(&Edit::Disconnect { entity, field: msg.attribute_id });
    }

    fn on_add_model(&mut self, msg: AddModel) {
        let mut entity = Entity::new(msg.model_name, Position::new(msg.x, msg.y));
        entity.model_id = msg.model_id;
        entity.fields = msg.fields;
        self.commit_remote(&Edit::AddEntity { entity });
    }

    fn on_update_model_name(&mut self, msg: UpdateModelName) {
        let from = self.resolve(&msg.old_name, msg.model_id);
        self.commit_remote(&Edit::RenameEntity { from, to: msg.new_name });
    }

    fn on_delete_model(&mut self, msg: DeleteModel) {
        let entity = self.resolve(&msg.model_name, msg.model_id);
        self.commit_remote(&Edit::DeleteEntity { entity });
    }

    fn on_error(&mut self, msg: ErrorNotice) {
        warn!(message = %msg.message, code = ?msg.code, "engine: server reported error");
        self.notices.push(msg);
    }
}

// =============================================================================
// ENGINE
// =============================================================================

pub struct DiagramEngine<O> {
    replica: Replica,
    router: Router,
    outbox: O,
    destination_prefix: String,
    last_temp_id: i64,
}

impl<O: Outbox> DiagramEngine<O> {
    #[must_use]
    pub fn new(outbox: O, router: Router, destination_prefix: impl Into<String>) -> Self {
        Self {
            replica: Replica::default(),
            router,
            outbox,
            destination_prefix: destination_prefix.into(),
            last_temp_id: 0,
        }
    }

    #[must_use]
    pub fn diagram(&self) -> &Diagram {
        &self.replica.diagram
    }

    /// Bumped on every committed change; lets callers skip redundant refreshes.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.replica.revision
    }

    #[must_use]
    pub fn outbox(&self) -> &O {
        &self.outbox
    }

    #[must_use]
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Replace the whole diagram, e.g. after a bootstrap fetch.
    pub fn load(&mut self, diagram: Diagram) {
        self.replica.diagram = diagram;
        self.replica.dropped_placeholders.clear();
        self.replica.revision += 1;
    }

    /// Adopt the session id of a fresh connection.
    ///
    /// A new session forgets placeholders deleted before their confirmation;
    /// a confirmation still in flight then lands as an ordinary field.
    pub fn set_session(&mut self, session_id: Option<String>) {
        let dropped = self.replica.dropped_placeholders.len();
        if dropped > 0 && self.router.session_id() != session_id.as_deref() {
            debug!(dropped, "engine: forgetting deleted placeholders across reconnect");
            self.replica.dropped_placeholders.clear();
        }
        self.router.set_session(session_id);
    }

    /// Server error notices received since the last call.
    pub fn take_notices(&mut self) -> Vec<ErrorNotice> {
        std::mem::take(&mut self.replica.notices)
    }

    // -------------------------------------------------------------------------
    // Inbound
    // -------------------------------------------------------------------------

    /// Parse, filter, and apply one inbound message. `None` if unparseable.
    pub fn handle_inbound(&mut self, raw: &str) -> Option<RouteOutcome> {
        let envelope = Router::parse(raw)?;
        let outcome = self.router.route(envelope, &mut self.replica);
        for message in std::mem::take(&mut self.replica.followups) {
            self.transmit(&message);
        }
        Some(outcome)
    }

    // -------------------------------------------------------------------------
    // Local actions
    // -------------------------------------------------------------------------

    /// Move an entity and broadcast the position.
    ///
    /// # Errors
    ///
    /// [`EditError::UnknownEntity`] if `entity` does not exist.
    pub fn move_entity(&mut self, entity: &str, position: Position) -> Result<(), EditError> {
        self.replica.commit(&Edit::MoveEntity { entity: entity.to_owned(), position })?;
        let model_id = self.model_id(entity);
        self.transmit(&Message::NodePosition(NodePosition {
            model_name: entity.to_owned(),
            model_id,
            x: position.x,
            y: position.y,
        }));
        Ok(())
    }

    /// Move an entity locally only, for drag previews.
    ///
    /// # Errors
    ///
    /// [`EditError::UnknownEntity`] if `entity` does not exist.
    pub fn preview_position(&mut self, entity: &str, position: Position) -> Result<(), EditError> {
        self.replica.commit(&Edit::MoveEntity { entity: entity.to_owned(), position })
    }

    /// Rename a field and/or change its type.
    ///
    /// # Errors
    ///
    /// Unknown entity or field, or an empty name.
    pub fn update_field(
        &mut self,
        entity: &str,
        field: i64,
        name: Option<String>,
        data_type: Option<String>,
    ) -> Result<(), EditError> {
        self.replica.commit(&Edit::UpdateField {
            entity: entity.to_owned(),
            field,
            name: name.clone(),
            data_type: data_type.clone(),
        })?;
        if self.is_pending(entity, field) {
            return Ok(());
        }
        let model_id = self.model_id(entity);
        self.transmit(&Message::FieldUpdate(FieldUpdate {
            model_name: entity.to_owned(),
            model_id,
            attribute_id: field,
            name,
            data_type,
        }));
        Ok(())
    }

    /// Advance the key role one step: `NORMAL → PRIMARY → FOREIGN → NORMAL`.
    ///
    /// # Errors
    ///
    /// Unknown entity or field.
    pub fn cycle_key_role(&mut self, entity: &str, field: i64) -> Result<KeyRole, EditError> {
        let next = self.current_role(entity, field)?.next();
        self.set_key_role(entity, field, next)?;
        Ok(next)
    }

    /// Put a field into `role`, notifying peers with explicit-set semantics:
    /// entering `PRIMARY`/`FOREIGN` sends that flag `true`, returning to
    /// `NORMAL` sends `false` for the role that was left.
    ///
    /// # Errors
    ///
    /// Unknown entity or field.
    pub fn set_key_role(&mut self, entity: &str, field: i64, role: KeyRole) -> Result<(), EditError> {
        let previous = self.current_role(entity, field)?;
        self.replica.commit(&Edit::SetKeyRole { entity: entity.to_owned(), field, role })?;
        if previous == role || self.is_pending(entity, field) {
            return Ok(());
        }

        let model_name = entity.to_owned();
        let model_id = self.model_id(entity);
        let primary = |is_primary_key| {
            Message::TogglePrimaryKey(PrimaryKeyToggle {
                model_name: model_name.clone(),
                model_id,
                attribute_id: field,
                is_primary_key,
            })
        };
        let foreign = |is_foreign_key| {
            Message::ToggleForeignKey(ForeignKeyToggle {
                model_name: model_name.clone(),
                model_id,
                attribute_id: field,
                is_foreign_key,
            })
        };
        let message = match (role, previous) {
            (KeyRole::Primary, _) => primary(true),
            (KeyRole::Foreign, _) => foreign(true),
            (KeyRole::Normal, KeyRole::Primary) => primary(false),
            (KeyRole::Normal, _) => foreign(false),
        };
        self.transmit(&message);
        Ok(())
    }

    /// Append a field under a temporary id. Returns that id.
    ///
    /// # Errors
    ///
    /// Unknown entity or an empty name.
    pub fn add_field(&mut self, entity: &str, name: &str, data_type: &str) -> Result<i64, EditError> {
        if name.trim().is_empty() {
            return Err(EditError::EmptyName);
        }
        let target = self.replica.diagram.entity(entity).ok_or_else(|| EditError::UnknownEntity(entity.to_owned()))?;
        let ordinal = target.fields.len();
        let temp_id = next_temp_id(&mut self.last_temp_id, target);

        let mut field = Field::new(temp_id, name, data_type);
        field.pending = true;
        self.replica.commit(&Edit::AddField { entity: entity.to_owned(), field, ordinal })?;

        let model_id = self.model_id(entity);
        self.transmit(&Message::AddAttribute(AddAttribute {
            model_name: entity.to_owned(),
            model_id,
            attribute_id: temp_id,
            name: name.to_owned(),
            data_type: data_type.to_owned(),
            ordinal,
            real_attribute_id: None,
        }));
        Ok(temp_id)
    }

    /// Delete a field and every connection into it.
    ///
    /// # Errors
    ///
    /// Unknown entity or field.
    pub fn delete_field(&mut self, entity: &str, field: i64) -> Result<(), EditError> {
        let pending = self.is_pending(entity, field);
        self.replica.commit(&Edit::DeleteField { entity: entity.to_owned(), field })?;
        if pending {
            self.replica.dropped_placeholders.insert((entity.to_owned(), field));
            return Ok(());
        }
        let model_id = self.model_id(entity);
        self.transmit(&Message::DeleteAttribute(DeleteAttribute {
            model_name: entity.to_owned(),
            model_id,
            attribute_id: field,
        }));
        Ok(())
    }

    /// Point a field at a target entity/field.
    ///
    /// # Errors
    ///
    /// [`EditError::UnknownTarget`] when the target does not exist; nothing is
    /// changed or sent in that case.
    pub fn connect(&mut self, entity: &str, field: i64, connection: Connection) -> Result<(), EditError> {
        self.replica.commit(&Edit::Connect { entity: entity.to_owned(), field, connection: connection.clone() })?;
        if self.is_pending(entity, field) {
            return Ok(());
        }
        let model_id = self.model_id(entity);
        self.transmit(&Message::ForeignKeyConnect(ForeignKeyConnect {
            model_name: entity.to_owned(),
            model_id,
            attribute_id: field,
            target_model_name: connection.target_entity,
            target_attribute_id: connection.target_field,
            foreign_key_name: connection.name,
            color: connection.color,
            animated: connection.animated,
        }));
        Ok(())
    }

    /// Remove a field's connection, keeping its role.
    ///
    /// # Errors
    ///
    /// Unknown entity or field.
    pub fn disconnect(&mut self, entity: &str, field: i64) -> Result<(), EditError> {
        self.replica.commit(&Edit::Disconnect { entity: entity.to_owned(), field })?;
        if self.is_pending(entity, field) {
            return Ok(());
        }
        let model_id = self.model_id(entity);
        self.transmit(&Message::ForeignKeyDisconnect(ForeignKeyDisconnect {
            model_name: entity.to_owned(),
            model_id,
            attribute_id: field,
        }));
        Ok(())
    }

    /// # Errors
    ///
    /// Duplicate or empty entity name.
    pub fn add_entity(&mut self, entity: Entity) -> Result<(), EditError> {
        let message = Message::AddModel(AddModel {
            model_name: entity.name.clone(),
            model_id: entity.model_id,
            x: entity.position.x,
            y: entity.position.y,
            fields: entity.fields.clone(),
        });
        self.replica.commit(&Edit::AddEntity { entity })?;
        self.transmit(&message);
        Ok(())
    }

    /// # Errors
    ///
    /// Unknown source, taken or empty new name.
    pub fn rename_entity(&mut self, from: &str, to: &str) -> Result<(), EditError> {
        let model_id = self.model_id(from);
        self.replica.commit(&Edit::RenameEntity { from: from.to_owned(), to: to.to_owned() })?;
        if from == to {
            return Ok(());
        }
        self.transmit(&Message::UpdateModelName(UpdateModelName {
            model_id,
            old_name: from.to_owned(),
            new_name: to.to_owned(),
        }));
        Ok(())
    }

    /// # Errors
    ///
    /// Unknown entity.
    pub fn delete_entity(&mut self, entity: &str) -> Result<(), EditError> {
        let model_id = self.model_id(entity);
        self.replica.commit(&Edit::DeleteEntity { entity: entity.to_owned() })?;
        self.transmit(&Message::DeleteModel(DeleteModel { model_name: entity.to_owned(), model_id }));
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    fn transmit(&mut self, message: &Message) -> bool {
        let kind = message.kind();
        if !self.outbox.is_connected() {
            debug!(?kind, "engine: offline, edit kept local");
            return false;
        }
        let payload = match self.router.build_envelope(message).and_then(|env| env.to_json()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, ?kind, "engine: failed to encode outbound message");
                return false;
            }
        };
        self.outbox.publish(&kind.destination_under(&self.destination_prefix), payload)
    }

    fn current_role(&self, entity: &str, field: i64) -> Result<KeyRole, EditError> {
        self.replica
            .diagram
            .entity(entity)
            .ok_or_else(|| EditError::UnknownEntity(entity.to_owned()))?
            .field(field)
            .map(|f| f.role)
            .ok_or_else(|| EditError::UnknownField { entity: entity.to_owned(), field })
    }

    fn is_pending(&self, entity: &str, field: i64) -> bool {
        self.replica.diagram.entity(entity).and_then(|e| e.field(field)).is_some_and(|f| f.pending)
    }

    fn model_id(&self, entity: &str) -> Option<i64> {
        self.replica.diagram.entity(entity).and_then(|e| e.model_id)
    }
}

/// Seconds-since-epoch id, bumped past the last one issued and past any id
/// already on the entity.
fn next_temp_id(last: &mut i64, entity: &Entity) -> i64 {
    let mut id = (now_ms() / 1000).max(*last + 1);
    while entity.field(id).is_some() {
        id += 1;
    }
    *last = id;
    id
}

#[cfg(test)]
#[path = "engine_test.rs"]
mod tests;
