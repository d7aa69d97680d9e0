//! Client driver: the single task that owns all client-visible state.
//!
//! ARCHITECTURE
//! ============
//! ```text
//! ClientHandle ──commands──►┐
//!                           │
//! connection task ─events──►├──► driver task ──► DiagramEngine ──► ConnectionHandle
//!                           │     │  DragCoalescer
//! drag deadline ─sleep_until┘     │  HandleStore
//!                                 └──► watch<DiagramView>, mpsc<ClientEvent>
//! ```
//!
//! Every input is a message to one task, so the engine, the drag table and the
//! handle memory need no locks. Drag debounce timers are deadlines the loop
//! sleeps on; when one fires the commit is built from the table as it is then.
//!
//! LIFECYCLE
//! =========
//! 1. Ask the connection task to connect.
//! 2. Fetch the diagram once; report an empty diagram so a caller can seed it.
//! 3. Loop: commands, connection events, drag deadlines. After each turn,
//!    re-resolve connector sides and publish a fresh [`DiagramView`].
//! 4. On shutdown: flush drag commits, persist handle memory, disconnect.

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::bootstrap::DiagramSource;
use crate::config::SyncConfig;
use crate::connection::{self, ConnectionEvent, ConnectionHandle, ConnectionState, Transport};
use crate::drag::DragCoalescer;
use crate::engine::DiagramEngine;
use crate::geometry::{ConnectorRoute, HandleStore, resolve_all};
use crate::model::{Connection, Diagram, Entity, KeyRole, Position};
use crate::mutation::EditError;
use crate::protocol::{Envelope, ErrorNotice, Message, MessageType, Router};

// =============================================================================
// PUBLIC TYPES
// =============================================================================

/// Input accepted by the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    /// Move without a gesture, committed immediately.
    MoveEntity { entity: String, position: Position },
    DragStart { entity: String },
    DragMove { entity: String, position: Position },
    DragEnd { entity: String, position: Position },
    UpdateField { entity: String, field: i64, name: Option<String>, data_type: Option<String> },
    CycleKeyRole { entity: String, field: i64 },
    SetKeyRole { entity: String, field: i64, role: KeyRole },
    AddField { entity: String, name: String, data_type: String },
    DeleteField { entity: String, field: i64 },
    ConnectField { entity: String, field: i64, connection: Connection },
    DisconnectField { entity: String, field: i64 },
    AddEntity { entity: Entity },
    RenameEntity { from: String, to: String },
    DeleteEntity { entity: String },
    /// Re-fetch the diagram from the bootstrap service.
    Refresh,
    InitSampleData,
    Reconnect,
    Disconnect,
    Shutdown,
}

/// Something the presentation layer should surface.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Rejected { action: &'static str, error: EditError },
    BrokerError(ErrorNotice),
    BootstrapFailed(String),
    /// Bootstrap returned no entities; offer to initialise sample data.
    EmptyDiagram,
    PersistenceFailed(String),
    GaveUp { attempts: u32, last_error: String },
}

/// Snapshot published after every change.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagramView {
    pub diagram: Diagram,
    pub routes: Vec<ConnectorRoute>,
    pub connection: ConnectionState,
    pub revision: u64,
}

/// Caller side of a running client.
pub struct ClientHandle {
    commands: mpsc::UnboundedSender<ClientCommand>,
    view: watch::Receiver<DiagramView>,
    events: mpsc::UnboundedReceiver<ClientEvent>,
    task: JoinHandle<()>,
}

impl ClientHandle {
    /// Queue a command. Returns `false` once the driver has stopped.
    pub fn send(&self, command: ClientCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    #[must_use]
    pub fn view(&self) -> watch::Receiver<DiagramView> {
        self.view.clone()
    }

    #[must_use]
    pub fn current(&self) -> DiagramView {
        self.view.borrow().clone()
    }

    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.events.recv().await
    }

    /// Ask the driver to shut down and wait for it.
    pub async fn shutdown(self) {
        if self.commands.send(ClientCommand::Shutdown).is_err() {
            debug!("client: driver already stopped");
        }
        if let Err(e) = self.task.await {
            warn!(error = %e, "client: driver task failed");
        }
    }
}

pub struct SyncClient;

impl SyncClient {
    /// Start the connection task and the driver task.
    pub fn spawn<T: Transport, S: DiagramSource>(
        config: SyncConfig,
        transport: T,
        source: S,
        handles: HandleStore,
    ) -> ClientHandle {
        let (conn, conn_events) = connection::spawn(config.connection.clone(), transport);
        let router = Router::new(config.pending.ttl, config.pending.capacity);
        let engine = DiagramEngine::new(conn.clone(), router, config.connection.destination_prefix.clone());

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(DiagramView {
            diagram: Diagram::new(),
            routes: Vec::new(),
            connection: ConnectionState::Disconnected,
            revision: 0,
        });

        let driver = Driver {
            engine,
            conn,
            conn_events,
            drag: DragCoalescer::new(config.drag),
            handles,
            source,
            commands: cmd_rx,
            events: event_tx,
            view: view_tx,
            connection_state: ConnectionState::Disconnected,
            loaded: false,
            published: None,
        };
        let task = tokio::spawn(driver.run());

        ClientHandle { commands: cmd_tx, view: view_rx, events: event_rx, task }
    }
}

// =============================================================================
// DRIVER
// =============================================================================

struct Driver<S> {
    engine: DiagramEngine<ConnectionHandle>,
    conn: ConnectionHandle,
    conn_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    drag: DragCoalescer,
    handles: HandleStore,
    source: S,
    commands: mpsc::UnboundedReceiver<ClientCommand>,
    events: mpsc::UnboundedSender<ClientEvent>,
    view: watch::Sender<DiagramView>,
    connection_state: ConnectionState,
    /// A diagram has been fetched; until then handle memory is left untouched.
    loaded: bool,
    /// Engine revision and connection state of the last published view.
    published: Option<(u64, ConnectionState)>,
}

impl<S: DiagramSource> Driver<S> {
    async fn run(mut self) {
        self.conn.connect();
        self.bootstrap().await;
        self.publish().await;

        loop {
            let deadline = self.drag.next_deadline();
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(ClientCommand::Shutdown) | None => break,
                    Some(cmd) => self.on_command(cmd).await,
                },
                Some(event) = self.conn_events.recv() => self.on_connection_event(event),
                () = wait_for(deadline) => self.commit_due(Instant::now()),
            }
            self.publish().await;
        }

        self.shutdown().await;
    }

    async fn bootstrap(&mut self) {
        match self.source.fetch_diagram().await {
            Ok(diagram) => {
                let empty = diagram.is_empty();
                self.drag.discard();
                self.engine.load(diagram);
                self.loaded = true;
                if empty {
                    self.emit(ClientEvent::EmptyDiagram);
                }
            }
            Err(e) => {
                warn!(error = %e, "client: bootstrap failed");
                self.emit(ClientEvent::BootstrapFailed(e.to_string()));
            }
        }
    }

    async fn on_command(&mut self, cmd: ClientCommand) {
        let result = match cmd {
            ClientCommand::MoveEntity { entity, position } => {
                self.engine.move_entity(&entity, position).map_err(|e| ("move entity", e))
            }
            ClientCommand::DragStart { entity } => self.drag_start(&entity).map_err(|e| ("drag", e)),
            ClientCommand::DragMove { entity, position } => {
                self.drag_move(&entity, position);
                Ok(())
            }
            ClientCommand::DragEnd { entity, position } => {
                self.drag_end(&entity, position);
                Ok(())
            }
            ClientCommand::UpdateField { entity, field, name, data_type } => {
                self.engine.update_field(&entity, field, name, data_type).map_err(|e| ("update field", e))
            }
            ClientCommand::CycleKeyRole { entity, field } => {
                self.engine.cycle_key_role(&entity, field).map(|_| ()).map_err(|e| ("toggle key", e))
            }
            ClientCommand::SetKeyRole { entity, field, role } => {
                self.engine.set_key_role(&entity, field, role).map_err(|e| ("set key", e))
            }
            ClientCommand::AddField { entity, name, data_type } => {
                self.engine.add_field(&entity, &name, &data_type).map(|_| ()).map_err(|e| ("add field", e))
            }
            ClientCommand::DeleteField { entity, field } => {
                self.engine.delete_field(&entity, field).map_err(|e| ("delete field", e))
            }
            ClientCommand::ConnectField { entity, field, connection } => {
                self.engine.connect(&entity, field, connection).map_err(|e| ("connect", e))
            }
            ClientCommand::DisconnectField { entity, field } => {
                self.engine.disconnect(&entity, field).map_err(|e| ("disconnect", e))
            }
            ClientCommand::AddEntity { entity } => self.engine.add_entity(entity).map_err(|e| ("add entity", e)),
            ClientCommand::RenameEntity { from, to } => {
                self.engine.rename_entity(&from, &to).map_err(|e| ("rename entity", e))
            }
            ClientCommand::DeleteEntity { entity } => {
                self.engine.delete_entity(&entity).map_err(|e| ("delete entity", e))
            }
            ClientCommand::Refresh => {
                self.bootstrap().await;
                Ok(())
            }
            ClientCommand::InitSampleData => {
                match self.source.init_sample_data().await {
                    Ok(()) => self.bootstrap().await,
                    Err(e) => {
                        warn!(error = %e, "client: sample data initialisation failed");
                        self.emit(ClientEvent::BootstrapFailed(e.to_string()));
                    }
                }
                Ok(())
            }
            ClientCommand::Reconnect => {
                self.conn.connect();
                Ok(())
            }
            ClientCommand::Disconnect => {
                self.conn.disconnect();
                Ok(())
            }
            // Handled by the loop.
            ClientCommand::Shutdown => Ok(()),
        };

        if let Err((action, error)) = result {
            debug!(action, error = %error, "client: edit rejected");
            self.emit(ClientEvent::Rejected { action, error });
        }
    }

    // -------------------------------------------------------------------------
    // Drag
    // -------------------------------------------------------------------------

    fn drag_start(&mut self, entity: &str) -> Result<(), EditError> {
        let start = self
            .engine
            .diagram()
            .entity(entity)
            .map(|e| e.position)
            .ok_or_else(|| EditError::UnknownEntity(entity.to_owned()))?;
        self.drag.begin(entity, start);
        Ok(())
    }

    fn drag_move(&mut self, entity: &str, position: Position) {
        let Some(preview) = self.drag.sample(entity, position, Instant::now()) else {
            return;
        };
        if let Err(e) = self.engine.preview_position(entity, preview) {
            debug!(entity, error = %e, "client: preview for vanished entity");
        }
    }

    fn drag_end(&mut self, entity: &str, position: Position) {
        if !self.drag.is_dragging(entity) {
            debug!(entity, "client: drag end without start");
            return;
        }
        let scheduled = self.drag.end(entity, position, Instant::now());
        if scheduled && let Err(e) = self.engine.preview_position(entity, position) {
            debug!(entity, error = %e, "client: drag ended on vanished entity");
        }
    }

    fn commit_due(&mut self, now: Instant) {
        for commit in self.drag.take_due(now) {
            if let Err(e) = self.engine.move_entity(&commit.entity, commit.position) {
                debug!(entity = %commit.entity, error = %e, "client: drag commit for vanished entity");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Connection
    // -------------------------------------------------------------------------

    fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StateChanged(state) => {
                self.connection_state = state;
            }
            ConnectionEvent::Connected { session_id } => {
                info!(%session_id, "client: session established");
                self.engine.set_session(Some(session_id));
            }
            ConnectionEvent::Message(body) => {
                self.engine.handle_inbound(&body);
                for notice in self.engine.take_notices() {
                    self.emit(ClientEvent::BrokerError(notice));
                }
            }
            ConnectionEvent::ErrorQueue(body) => {
                let notice = error_notice(&body);
                warn!(message = %notice.message, code = ?notice.code, "client: broker reported error");
                self.emit(ClientEvent::BrokerError(notice));
            }
            ConnectionEvent::GaveUp { attempts, last_error } => {
                self.emit(ClientEvent::GaveUp { attempts, last_error });
            }
        }
    }

    // -------------------------------------------------------------------------
    // Output
    // -------------------------------------------------------------------------

    async fn publish(&mut self) {
        let stamp = (self.engine.revision(), self.connection_state);
        if self.published == Some(stamp) {
            return;
        }
        self.published = Some(stamp);

        let routes = if self.loaded { resolve_all(self.engine.diagram(), &mut self.handles) } else { Vec::new() };
        if let Err(e) = self.handles.save().await {
            warn!(error = %e, "client: failed to persist handle memory");
            self.emit(ClientEvent::PersistenceFailed(e.to_string()));
        }

        self.view.send_replace(DiagramView {
            diagram: self.engine.diagram().clone(),
            routes,
            connection: self.connection_state,
            revision: stamp.0,
        });
    }

    fn emit(&self, event: ClientEvent) {
        if self.events.send(event).is_err() {
            debug!("client: event receiver dropped");
        }
    }

    async fn shutdown(&mut self) {
        let pending = self.drag.flush();
        info!(commits = pending.len(), "client: shutting down");
        for commit in pending {
            if let Err(e) = self.engine.move_entity(&commit.entity, commit.position) {
                debug!(entity = %commit.entity, error = %e, "client: flush for vanished entity");
            }
        }
        self.publish().await;
        self.conn.disconnect();
    }
}

/// Sleep until `deadline`, or forever when there is none.
async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Private-queue bodies are either `ERROR` envelopes or plain text.
fn error_notice(body: &str) -> ErrorNotice {
    if let Ok(envelope) = Envelope::from_json(body)
        && envelope.kind == MessageType::Error
        && let Ok(Message::Error(notice)) = envelope.message()
    {
        return notice;
    }
    ErrorNotice { message: body.trim().to_owned(), code: None }
}

#[cfg(test)]
#[path = "client_test.rs"]
mod tests;
