use std::cell::{Cell, RefCell};

use serde_json::json;

use super::*;
use crate::protocol::{EchoReason, Envelope, MessageType};

// =============================================================================
// FIXTURES
// =============================================================================

struct RecordingOutbox {
    connected: Cell<bool>,
    sent: RefCell<Vec<(String, String)>>,
}

impl Outbox for RecordingOutbox {
    fn publish(&self, destination: &str, payload: String) -> bool {
        self.sent.borrow_mut().push((destination.to_owned(), payload));
        true
    }

    fn is_connected(&self) -> bool {
        self.connected.get()
    }
}

fn fk(target: &str, field: i64) -> Connection {
    Connection { target_entity: target.into(), target_field: field, name: format!("fk_{target}"), color: None, animated: false }
}

/// users(1 id PK, 2 email) and orders(10 id PK, 11 user_id FK -> users.1).
fn sample() -> Diagram {
    let mut users = Entity::new("users", Position::new(0.0, 0.0))
        .with_field(Field::new(1, "id", "BIGINT").with_role(KeyRole::Primary))
        .with_field(Field::new(2, "email", "TEXT"));
    users.model_id = Some(100);
    let mut orders = Entity::new("orders", Position::new(400.0, 0.0))
        .with_field(Field::new(10, "id", "BIGINT").with_role(KeyRole::Primary))
        .with_field(Field::new(11, "user_id", "BIGINT").with_connection(fk("users", 1)));
    orders.model_id = Some(200);
    Diagram::from_entities([users, orders])
}

fn engine() -> DiagramEngine<RecordingOutbox> {
    let outbox = RecordingOutbox { connected: Cell::new(true), sent: RefCell::new(Vec::new()) };
    let mut engine = DiagramEngine::new(outbox, Router::default(), "/app/diagram");
    engine.set_session(Some("me".into()));
    engine.load(sample());
    engine
}

fn sent(engine: &DiagramEngine<RecordingOutbox>) -> Vec<(String, Envelope)> {
    engine
        .outbox()
        .sent
        .borrow()
        .iter()
        .map(|(dest, payload)| (dest.clone(), Envelope::from_json(payload).expect("valid envelope")))
        .collect()
}

fn raw_sent(engine: &DiagramEngine<RecordingOutbox>) -> Vec<String> {
    engine.outbox().sent.borrow().iter().map(|(_, payload)| payload.clone()).collect()
}

fn inbound(kind: &str, session: &str, data: serde_json::Value) -> String {
    json!({"type": kind, "data": data, "sessionId": session, "timestamp": 1}).to_string()
}

fn field<'a>(engine: &'a DiagramEngine<RecordingOutbox>, entity: &str, id: i64) -> &'a Field {
    engine.diagram().entity(entity).and_then(|e| e.field(id)).expect("field exists")
}

// =============================================================================
// LOCAL ACTIONS
// =============================================================================

#[test]
fn move_entity_applies_and_sends_position() {
    let mut engine = engine();
    engine.move_entity("users", Position::new(50.0, 60.0)).expect("move");

    assert_eq!(engine.diagram().entity("users").map(|e| e.position), Some(Position::new(50.0, 60.0)));
    let out = sent(&engine);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].0, "/app/diagram/node-position");
    assert_eq!(out[0].1.kind, MessageType::NodePositionUpdate);
    assert_eq!(out[0].1.session_id, "me");
    assert_eq!(out[0].1.data["modelId"], 100);
    assert_eq!(out[0].1.data["x"], 50.0);
}

#[test]
fn preview_position_stays_local() {
    let mut engine = engine();
    engine.preview_position("users", Position::new(5.0, 5.0)).expect("preview");
    assert_eq!(engine.diagram().entity("users").map(|e| e.position), Some(Position::new(5.0, 5.0)));
    assert!(sent(&engine).is_empty());
}

#[test]
fn offline_edits_apply_without_sending() {
    let mut engine = engine();
    engine.outbox().connected.set(false);

    engine.update_field("users", 2, Some("mail".into()), None).expect("update");
    assert_eq!(field(&engine, "users", 2).name, "mail");
    assert!(sent(&engine).is_empty());
    assert_eq!(engine.router().pending_len(), 0);
}

#[test]
fn connect_to_unknown_target_is_rejected_untouched() {
    let mut engine = engine();
    let before = engine.diagram().clone();
    let revision = engine.revision();

    let err = engine.connect("users", 2, fk("ghost", 9)).expect_err("unknown target");
    assert_eq!(err, EditError::UnknownTarget { entity: "ghost".into(), field: 9 });
    assert_eq!(engine.diagram(), &before);
    assert_eq!(engine.revision(), revision);
    assert!(sent(&engine).is_empty());
}

#[test]
fn connect_sends_foreign_key_connect() {
    let mut engine = engine();
    engine.connect("users", 2, fk("orders", 10)).expect("connect");

    assert_eq!(field(&engine, "users", 2).role, KeyRole::Foreign);
    let out = sent(&engine);
    assert_eq!(out[0].0, "/app/diagram/foreign-key-connect");
    assert_eq!(out[0].1.data["targetModelName"], "orders");
    assert_eq!(out[0].1.data["targetAttributeId"], 10);
}

#[test]
fn disconnect_keeps_role_and_sends() {
    let mut engine = engine();
    engine.disconnect("orders", 11).expect("disconnect");
    assert!(field(&engine, "orders", 11).connection.is_none());
    assert_eq!(field(&engine, "orders", 11).role, KeyRole::Foreign);
    assert_eq!(sent(&engine)[0].1.kind, MessageType::ForeignKeyDisconnect);
}

#[test]
fn delete_field_removes_incoming_connectors() {
    let mut engine = engine();
    engine.delete_field("users", 1).expect("delete");

    assert!(engine.diagram().entity("users").and_then(|e| e.field(1)).is_none());
    assert!(field(&engine, "orders", 11).connection.is_none());
    let out = sent(&engine);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].1.kind, MessageType::DeleteAttribute);
    assert_eq!(out[0].1.data["attributeId"], 1);
}

#[test]
fn key_role_cycle_sends_explicit_flags() {
    let mut engine = engine();
    assert_eq!(engine.cycle_key_role("users", 2).expect("primary"), KeyRole::Primary);
    assert_eq!(engine.cycle_key_role("users", 2).expect("foreign"), KeyRole::Foreign);
    assert_eq!(engine.cycle_key_role("users", 2).expect("normal"), KeyRole::Normal);

    let flags: Vec<(MessageType, serde_json::Value)> = sent(&engine)
        .into_iter()
        .map(|(_, env)| {
            let flag = env.data.get("isPrimaryKey").or_else(|| env.data.get("isForeignKey")).cloned();
            (env.kind, flag.unwrap_or_default())
        })
        .collect();
    assert_eq!(
        flags,
        vec![
            (MessageType::TogglePrimaryKey, json!(true)),
            (MessageType::ToggleForeignKey, json!(true)),
            (MessageType::ToggleForeignKey, json!(false)),
        ]
    );
}

#[test]
fn primary_foreign_normal_round_trip_leaves_plain_field() {
    let mut engine = engine();
    assert!(field(&engine, "orders", 11).connection.is_some());

    engine.set_key_role("orders", 11, KeyRole::Primary).expect("primary");
    engine.set_key_role("orders", 11, KeyRole::Foreign).expect("foreign");
    engine.set_key_role("orders", 11, KeyRole::Normal).expect("normal");

    let f = field(&engine, "orders", 11);
    assert_eq!(f.role, KeyRole::Normal);
    assert!(f.connection.is_none());
}

#[test]
fn setting_same_role_sends_nothing() {
    let mut engine = engine();
    engine.set_key_role("users", 1, KeyRole::Primary).expect("same role");
    assert!(sent(&engine).is_empty());
}

#[test]
fn entity_lifecycle_messages() {
    let mut engine = engine();
    engine.add_entity(Entity::new("items", Position::new(10.0, 10.0))).expect("add");
    engine.rename_entity("users", "people").expect("rename");
    engine.delete_entity("items").expect("delete");

    assert_eq!(field(&engine, "orders", 11).connection.as_ref().map(|c| c.target_entity.as_str()), Some("people"));
    let kinds: Vec<MessageType> = sent(&engine).into_iter().map(|(_, env)| env.kind).collect();
    assert_eq!(kinds, vec![MessageType::AddModel, MessageType::UpdateModelName, MessageType::DeleteModel]);

    let rename = &sent(&engine)[1].1;
    assert_eq!(rename.data["oldName"], "users");
    assert_eq!(rename.data["modelId"], 100);
}

#[test]
fn duplicate_entity_is_rejected() {
    let mut engine = engine();
    let err = engine.add_entity(Entity::new("users", Position::default())).expect_err("duplicate");
    assert_eq!(err, EditError::DuplicateEntity("users".into()));
    assert!(sent(&engine).is_empty());
}

// =============================================================================
// PENDING FIELDS
// =============================================================================

#[test]
fn add_field_uses_pending_temp_id() {
    let mut engine = engine();
    let temp = engine.add_field("users", "created_at", "TIMESTAMP").expect("add");

    let added = field(&engine, "users", temp);
    assert!(added.pending);
    let out = sent(&engine);
    assert_eq!(out[0].0, "/app/diagram/add-attribute");
    assert_eq!(out[0].1.data["attributeId"], temp);
    assert_eq!(out[0].1.data["ordinal"], 2);
    assert!(out[0].1.data.get("realAttributeId").is_none());

    let second = engine.add_field("users", "updated_at", "TIMESTAMP").expect("add");
    assert!(second > temp);
}

#[test]
fn confirmation_replaces_temporary_field() {
    let mut engine = engine();
    let mut placeholder = Field::new(1_699_999_999, "created_at", "TIMESTAMP");
    placeholder.pending = true;
    let mut entities: Vec<Entity> = sample().entities().cloned().collect();
    for entity in &mut entities {
        if entity.name == "users" {
            entity.fields.push(placeholder.clone());
        }
    }
    engine.load(Diagram::from_entities(entities));

    let confirmation = inbound(
        "ADD_ATTRIBUTE",
        "me",
        json!({"modelName": "users", "attributeId": 1_699_999_999, "name": "created_at",
               "dataType": "TIMESTAMP", "ordinal": 2, "realAttributeId": 42}),
    );
    assert_eq!(engine.handle_inbound(&confirmation), Some(RouteOutcome::Dispatched(MessageType::AddAttribute)));

    let users = engine.diagram().entity("users").expect("users");
    let matching: Vec<&Field> = users.fields.iter().filter(|f| f.name == "created_at").collect();
    assert_eq!(matching.len(), 1);
    assert_eq!(matching[0].id, 42);
    assert!(!matching[0].pending);

    // A repeated confirmation is idempotent.
    engine.handle_inbound(&confirmation);
    assert_eq!(engine.diagram().entity("users").map(|e| e.fields.len()), Some(3));
}

#[test]
fn own_add_echo_then_confirmation_yields_one_field() {
    let mut engine = engine();
    let temp = engine.add_field("users", "created_at", "TIMESTAMP").expect("add");
    let echo = raw_sent(&engine).remove(0);

    assert_eq!(engine.handle_inbound(&echo), Some(RouteOutcome::Echo(EchoReason::SessionId)));
    let confirmation = inbound(
        "ADD_ATTRIBUTE",
        "me",
        json!({"modelName": "users", "attributeId": temp, "name": "created_at",
               "dataType": "TIMESTAMP", "ordinal": 2, "realAttributeId": 42}),
    );
    engine.handle_inbound(&confirmation);

    let users = engine.diagram().entity("users").expect("users");
    assert_eq!(users.fields.len(), 3);
    assert_eq!(users.fields[2].id, 42);
    assert!(users.field(temp).is_none());
}

#[test]
fn pending_edits_stay_local_then_replay_on_confirmation() {
    let mut engine = engine();
    let temp = engine.add_field("users", "created", "TEXT").expect("add");
    engine.update_field("users", temp, Some("created_at".into()), Some("TIMESTAMP".into())).expect("rename");
    engine.set_key_role("users", temp, KeyRole::Primary).expect("role");
    assert_eq!(sent(&engine).len(), 1);

    engine.handle_inbound(&inbound(
        "ADD_ATTRIBUTE",
        "me",
        json!({"modelName": "users", "attributeId": temp, "name": "created",
               "dataType": "TEXT", "ordinal": 2, "realAttributeId": 77}),
    ));

    let confirmed = field(&engine, "users", 77);
    assert_eq!(confirmed.name, "created_at");
    let out = sent(&engine);
    assert_eq!(out.len(), 2);
    assert_eq!(out[1].1.kind, MessageType::FieldUpdate);
    assert_eq!(out[1].1.data["attributeId"], 77);
    assert_eq!(out[1].1.data["name"], "created_at");
    assert_eq!(out[1].1.data["dataType"], "TIMESTAMP");
}

#[test]
fn peer_confirmation_at_same_ordinal_leaves_placeholder_alone() {
    let mut engine = engine();
    let temp = engine.add_field("users", "phone", "TEXT").expect("add");
    let mut own_add: serde_json::Value = serde_json::from_str(&raw_sent(&engine)[0]).expect("json");

    engine.handle_inbound(&inbound(
        "ADD_ATTRIBUTE",
        "peer",
        json!({"modelName": "users", "attributeId": 555, "name": "nickname",
               "dataType": "TEXT", "ordinal": 2, "realAttributeId": 77}),
    ));

    let users = engine.diagram().entity("users").expect("users");
    let fields: Vec<(i64, &str, bool)> = users.fields.iter().map(|f| (f.id, f.name.as_str(), f.pending)).collect();
    assert_eq!(fields, vec![(1, "id", false), (2, "email", false), (77, "nickname", false), (temp, "phone", true)]);
    assert_eq!(sent(&engine).len(), 1, "a peer's field is never renamed");

    own_add["data"]["realAttributeId"] = json!(78);
    engine.handle_inbound(&own_add.to_string());

    let users = engine.diagram().entity("users").expect("users");
    let fields: Vec<(i64, &str, bool)> = users.fields.iter().map(|f| (f.id, f.name.as_str(), f.pending)).collect();
    assert_eq!(fields, vec![(1, "id", false), (2, "email", false), (77, "nickname", false), (78, "phone", false)]);
    assert_eq!(sent(&engine).len(), 1);
}

#[test]
fn pending_field_deleted_before_confirmation_is_deleted_remotely() {
    let mut engine = engine();
    let temp = engine.add_field("users", "scratch", "TEXT").expect("add");
    engine.delete_field("users", temp).expect("delete");
    assert_eq!(sent(&engine).len(), 1);

    engine.handle_inbound(&inbound(
        "ADD_ATTRIBUTE",
        "me",
        json!({"modelName": "users", "attributeId": temp, "name": "scratch",
               "dataType": "TEXT", "ordinal": 2, "realAttributeId": 88}),
    ));

    assert!(engine.diagram().entity("users").and_then(|e| e.field(88)).is_none());
    let out = sent(&engine);
    assert_eq!(out.len(), 2);
    assert_eq!(out[1].1.kind, MessageType::DeleteAttribute);
    assert_eq!(out[1].1.data["attributeId"], 88);
}

#[test]
fn reconnect_forgets_deleted_placeholders() {
    let mut engine = engine();
    let temp = engine.add_field("users", "scratch", "TEXT").expect("add");
    engine.delete_field("users", temp).expect("delete");
    let mut own_add: serde_json::Value = serde_json::from_str(&raw_sent(&engine)[0]).expect("json");

    engine.set_session(Some("after".into()));
    own_add["data"]["realAttributeId"] = json!(88);
    engine.handle_inbound(&own_add.to_string());

    // The server kept the field, so the replica now shows it too.
    assert_eq!(field(&engine, "users", 88).name, "scratch");
    assert_eq!(sent(&engine).len(), 1);
}

// =============================================================================
// INBOUND
// =============================================================================

#[test]
fn echoes_after_reconnect_do_not_duplicate() {
    let mut engine = engine();
    engine.set_session(Some("before".into()));
    engine.move_entity("users", Position::new(1.0, 2.0)).expect("move");
    engine.add_field("orders", "total", "NUMERIC").expect("add");
    engine.update_field("users", 2, Some("mail".into()), None).expect("rename");
    engine.disconnect("orders", 11).expect("disconnect");
    let expected = engine.diagram().clone();

    // Reconnect under a new session; the broker then relays our old traffic.
    engine.set_session(Some("after".into()));
    for echo in raw_sent(&engine) {
        assert_eq!(engine.handle_inbound(&echo), Some(RouteOutcome::Echo(EchoReason::MessageId)));
    }

    assert_eq!(engine.diagram(), &expected);
    assert_eq!(engine.router().pending_len(), 0);
}

#[test]
fn peer_edits_apply_through_same_transitions() {
    let mut engine = engine();
    engine.handle_inbound(&inbound(
        "FIELD_UPDATE",
        "peer",
        json!({"modelName": "users", "attributeId": 2, "name": "email_address"}),
    ));
    engine.handle_inbound(&inbound(
        "TOGGLE_PRIMARY_KEY",
        "peer",
        json!({"modelName": "orders", "attributeId": 11, "isPrimaryKey": true}),
    ));

    assert_eq!(field(&engine, "users", 2).name, "email_address");
    assert_eq!(field(&engine, "users", 2).data_type, "TEXT");
    assert_eq!(field(&engine, "orders", 11).role, KeyRole::Primary);
    assert!(field(&engine, "orders", 11).connection.is_none());
    assert!(sent(&engine).is_empty());
}

#[test]
fn inbound_release_only_clears_matching_role() {
    let mut engine = engine();
    engine.handle_inbound(&inbound(
        "TOGGLE_FOREIGN_KEY",
        "peer",
        json!({"modelName": "users", "attributeId": 1, "isForeignKey": false}),
    ));
    assert_eq!(field(&engine, "users", 1).role, KeyRole::Primary);

    engine.handle_inbound(&inbound(
        "TOGGLE_PRIMARY_KEY",
        "peer",
        json!({"modelName": "users", "attributeId": 1, "isPrimaryKey": false}),
    ));
    assert_eq!(field(&engine, "users", 1).role, KeyRole::Normal);
}

#[test]
fn inbound_falls_back_to_model_id() {
    let mut engine = engine();
    engine.handle_inbound(&inbound(
        "NODE_POSITION_UPDATE",
        "peer",
        json!({"modelName": "stale-name", "modelId": 200, "x": 9.0, "y": 8.0}),
    ));
    assert_eq!(engine.diagram().entity("orders").map(|e| e.position), Some(Position::new(9.0, 8.0)));
}

#[test]
fn inbound_model_lifecycle() {
    let mut engine = engine();
    engine.handle_inbound(&inbound(
        "ADD_MODEL",
        "peer",
        json!({"modelName": "items", "modelId": 300, "x": 1.0, "y": 1.0,
               "fields": [{"id": 30, "name": "sku", "dataType": "TEXT"}]}),
    ));
    engine.handle_inbound(&inbound(
        "UPDATE_MODEL_NAME",
        "peer",
        json!({"modelId": 300, "oldName": "items", "newName": "products"}),
    ));
    assert_eq!(engine.diagram().entity("products").map(|e| e.fields.len()), Some(1));

    engine.handle_inbound(&inbound("DELETE_MODEL", "peer", json!({"modelName": "users"})));
    assert!(engine.diagram().entity("users").is_none());
    assert!(field(&engine, "orders", 11).connection.is_none());

    // Replays of applied lifecycle edits are ignored.
    let revision = engine.revision();
    engine.handle_inbound(&inbound("DELETE_MODEL", "peer", json!({"modelName": "users"})));
    assert_eq!(engine.revision(), revision);
}

#[test]
fn inbound_connect_to_missing_target_is_ignored() {
    let mut engine = engine();
    let before = engine.diagram().clone();
    engine.handle_inbound(&inbound(
        "FOREIGN_KEY_CONNECT",
        "peer",
        json!({"modelName": "users", "attributeId": 2, "targetModelName": "ghost",
               "targetAttributeId": 1, "foreignKeyName": "fk_ghost"}),
    ));
    assert_eq!(engine.diagram(), &before);
}

#[test]
fn error_notices_are_collected() {
    let mut engine = engine();
    engine.handle_inbound(&inbound("ERROR", "server", json!({"message": "not allowed", "code": "E_PERM"})));
    let notices = engine.take_notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].code.as_deref(), Some("E_PERM"));
    assert!(engine.take_notices().is_empty());
}

#[test]
fn garbage_inbound_is_dropped() {
    let mut engine = engine();
    let revision = engine.revision();
    assert_eq!(engine.handle_inbound("{{nope"), None);
    assert_eq!(engine.revision(), revision);
}
