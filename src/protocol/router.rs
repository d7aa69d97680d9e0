//! Inbound dispatch with echo suppression, and outbound envelope building.
//!
//! DESIGN
//! ======
//! Echo detection runs in two layers, in order:
//! 1. the envelope's session id equals ours;
//! 2. the envelope's message id is still in the pending tracker.
//!
//! The first covers brokers that relay the sender's session id. The second
//! covers brokers that rewrite it, and echoes that arrive after a reconnect
//! has changed our session id. Either hit suppresses dispatch. The id check
//! always runs so a matched id is consumed even when the session already
//! identified the echo.
//!
//! `ADD_ATTRIBUTE` envelopes carrying `realAttributeId` are confirmations and
//! are dispatched even when they echo our own add; the server id reaches the
//! originator no other way. The handler is told whether the confirmation was
//! an echo, since only our own confirmations may claim a local placeholder.
//!
//! TRADE-OFFS
//! ==========
//! Message ids are a SHA-256 digest of the outbound JSON snapshot, truncated.
//! A collision with a peer's id would drop that peer's message; this is
//! accepted as a filter false positive.

use std::fmt::Write;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::envelope::{
    AddAttribute, AddModel, DeleteAttribute, DeleteModel, Envelope, EnvelopeError, ErrorNotice, FieldUpdate,
    ForeignKeyConnect, ForeignKeyDisconnect, ForeignKeyToggle, Message, MessageType, NodePosition,
    PrimaryKeyToggle, UpdateModelName, now_ms,
};
use super::pending::PendingTracker;

const MESSAGE_ID_HEX_LEN: usize = 32;

// =============================================================================
// HANDLER
// =============================================================================

/// Typed receiver for routed messages. Unimplemented kinds are ignored.
///
/// `on_add_attribute` receives `Some(reason)` only for a confirmation that
/// echoes our own add; every other dispatched message is foreign.
pub trait MessageHandler {
    fn on_node_position(&mut self, _msg: NodePosition) {}
    fn on_field_update(&mut self, _msg: FieldUpdate) {}
    fn on_toggle_primary_key(&mut self, _msg: PrimaryKeyToggle) {}
    fn on_toggle_foreign_key(&mut self, _msg: ForeignKeyToggle) {}
    fn on_add_attribute(&mut self, _msg: AddAttribute, _echo: Option<EchoReason>) {}
    fn on_delete_attribute(&mut self, _msg: DeleteAttribute) {}
    fn on_foreign_key_connect(&mut self, _msg: ForeignKeyConnect) {}
    fn on_foreign_key_disconnect(&mut self, _msg: ForeignKeyDisconnect) {}
    fn on_add_model(&mut self, _msg: AddModel) {}
    fn on_update_model_name(&mut self, _msg: UpdateModelName) {}
    fn on_delete_model(&mut self, _msg: DeleteModel) {}
    fn on_error(&mut self, _msg: ErrorNotice) {}
}

/// Why an envelope was suppressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoReason {
    SessionId,
    MessageId,
}

/// Result of routing one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Dispatched(MessageType),
    Echo(EchoReason),
    /// Header was valid but the payload did not fit the message type.
    Malformed(MessageType),
}

// =============================================================================
// ROUTER
// =============================================================================

pub struct Router {
    session_id: Option<String>,
    pending: PendingTracker,
    sequence: u64,
}

impl Router {
    #[must_use]
    pub fn new(pending_ttl: Duration, pending_capacity: usize) -> Self {
        Self { session_id: None, pending: PendingTracker::new(pending_ttl, pending_capacity), sequence: 0 }
    }

    /// Adopt the session id of a freshly connected transport.
    pub fn set_session(&mut self, session_id: Option<String>) {
        self.session_id = session_id;
    }

    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Parse raw inbound text. Malformed input is logged and dropped.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Envelope> {
        match Envelope::from_json(raw) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                warn!(error = %e, len = raw.len(), "router: dropping malformed envelope");
                None
            }
        }
    }

    /// Suppress echoes of our own traffic, then dispatch to `handler`.
    pub fn route(&mut self, envelope: Envelope, handler: &mut impl MessageHandler) -> RouteOutcome {
        let echo = self.echo_reason(&envelope);
        if let Some(reason) = echo
            && !envelope.is_attribute_confirmation()
        {
            debug!(kind = ?envelope.kind, ?reason, "router: echo suppressed");
            return RouteOutcome::Echo(reason);
        }

        let kind = envelope.kind;
        let message = match envelope.message() {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, ?kind, "router: dropping malformed payload");
                return RouteOutcome::Malformed(kind);
            }
        };

        match message {
            Message::NodePosition(m) => handler.on_node_position(m),
            Message::FieldUpdate(m) => handler.on_field_update(m),
            Message::TogglePrimaryKey(m) => handler.on_toggle_primary_key(m),
            Message::ToggleForeignKey(m) => handler.on_toggle_foreign_key(m),
            Message::AddAttribute(m) => handler.on_add_attribute(m, echo),
            Message::DeleteAttribute(m) => handler.on_delete_attribute(m),
            Message::ForeignKeyConnect(m) => handler.on_foreign_key_connect(m),
            Message::ForeignKeyDisconnect(m) => handler.on_foreign_key_disconnect(m),
            Message::AddModel(m) => handler.on_add_model(m),
            Message::UpdateModelName(m) => handler.on_update_model_name(m),
            Message::DeleteModel(m) => handler.on_delete_model(m),
            Message::Error(m) => handler.on_error(m),
        }
        RouteOutcome::Dispatched(kind)
    }

    fn echo_reason(&mut self, envelope: &Envelope) -> Option<EchoReason> {
        let by_id = envelope
            .message_id
            .as_deref()
            .is_some_and(|id| self.pending.matches(id));
        let by_session = !envelope.session_id.is_empty()
            && self.session_id.as_deref() == Some(envelope.session_id.as_str());

        if by_session {
            Some(EchoReason::SessionId)
        } else if by_id {
            Some(EchoReason::MessageId)
        } else {
            None
        }
    }

    /// Build an outbound envelope, stamping and registering a fresh message id.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Json`] if the payload cannot be serialized.
    pub fn build_envelope(&mut self, message: &Message) -> Result<Envelope, EnvelopeError> {
        let data = message.to_data()?;
        let session_id = self.session_id.clone().unwrap_or_default();
        let timestamp = now_ms();
        self.sequence += 1;

        let snapshot = serde_json::json!({
            "type": message.kind(),
            "data": &data,
            "sessionId": &session_id,
            "timestamp": timestamp,
            "sequence": self.sequence,
        });
        let message_id = content_id(&serde_json::to_vec(&snapshot)?);
        self.pending.register(message_id.clone());

        Ok(Envelope { kind: message.kind(), data, session_id, message_id: Some(message_id), timestamp })
    }
}

impl Default for Router {
    fn default() -> Self {
        Self { session_id: None, pending: PendingTracker::default(), sequence: 0 }
    }
}

fn content_id(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(MESSAGE_ID_HEX_LEN);
    for b in digest.iter().take(MESSAGE_ID_HEX_LEN / 2) {
        // Writing into a String cannot fail.
        if write!(out, "{b:02x}").is_err() {
            break;
        }
    }
    out
}

#[cfg(test)]
#[path = "router_test.rs"]
mod tests;
