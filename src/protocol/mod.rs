//! Wire protocol: envelopes, typed payloads, echo filtering, and routing.
//!
//! ARCHITECTURE
//! ============
//! Every diagram edit travels as an [`Envelope`]: a message type, a JSON
//! payload, the sender's session id, an optional message id, and a client
//! timestamp. The [`Router`] is the only place envelopes are built or read:
//! outbound it stamps ids and remembers them, inbound it drops echoes of our
//! own traffic and hands typed payloads to a [`MessageHandler`].

pub mod envelope;
pub mod pending;
pub mod router;

pub use envelope::{
    AddAttribute, AddModel, DeleteAttribute, DeleteModel, Envelope, EnvelopeError, ErrorNotice, FieldUpdate,
    ForeignKeyConnect, ForeignKeyDisconnect, ForeignKeyToggle, Message, MessageType, NodePosition,
    PrimaryKeyToggle, UpdateModelName,
};
pub use pending::PendingTracker;
pub use router::{EchoReason, MessageHandler, RouteOutcome, Router};
