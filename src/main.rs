use std::path::PathBuf;

use clap::Parser;
use erdsync::bootstrap::{BootstrapError, HttpDiagramSource};
use erdsync::config::{ConfigError, SyncConfig};
use erdsync::connection::WsTransport;
use erdsync::geometry::{HandleStore, HandleStoreError};
use erdsync::{ClientEvent, SyncClient};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    #[error(transparent)]
    Handles(#[from] HandleStoreError),
    #[error("failed to listen for ctrl-c: {0}")]
    Signal(std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "erdsync", about = "Headless collaborative ER-diagram sync client")]
struct Cli {
    /// Broker WebSocket endpoint.
    #[arg(long, env = "ERDSYNC_WS_URL")]
    ws_url: Option<String>,

    /// Base URL of the diagram service.
    #[arg(long, env = "ERDSYNC_HTTP_URL")]
    http_url: Option<String>,

    /// File that remembers connector sides between runs.
    #[arg(long, env = "ERDSYNC_HANDLES_PATH")]
    handles_path: Option<PathBuf>,

    /// Seed the diagram with sample data when it comes back empty.
    #[arg(long)]
    init_sample_data: bool,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let dotenv = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    if let Err(e) = dotenv
        && !e.not_found()
    {
        warn!(error = %e, "erdsync: ignoring unreadable .env");
    }

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env()?;
    if let Some(url) = cli.ws_url {
        config.connection.url = url;
    }
    if let Some(url) = cli.http_url {
        config.bootstrap.base_url = url;
    }
    if cli.handles_path.is_some() {
        config.handles_path = cli.handles_path;
    }

    let handles = match &config.handles_path {
        Some(path) => HandleStore::load(path).await?,
        None => HandleStore::in_memory(),
    };
    let source = HttpDiagramSource::new(&config.bootstrap)?;
    info!(url = %config.connection.url, service = %config.bootstrap.base_url, "erdsync: starting");

    let mut client = SyncClient::spawn(config, WsTransport, source, handles);
    let mut view = client.view();

    loop {
        tokio::select! {
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = view.borrow_and_update();
                info!(
                    revision = current.revision,
                    connection = ?current.connection,
                    entities = current.diagram.len(),
                    connectors = current.routes.len(),
                    "erdsync: diagram updated"
                );
            }
            event = client.next_event() => match event {
                Some(ClientEvent::EmptyDiagram) if cli.init_sample_data => {
                    info!("erdsync: diagram empty, requesting sample data");
                    client.send(erdsync::ClientCommand::InitSampleData);
                }
                Some(event) => log_event(&event),
                None => break,
            },
            signal = tokio::signal::ctrl_c() => {
                signal.map_err(CliError::Signal)?;
                info!("erdsync: shutdown requested");
                break;
            }
        }
    }

    client.shutdown().await;
    Ok(())
}

fn log_event(event: &ClientEvent) {
    match event {
        ClientEvent::Rejected { action, error } => warn!(action, %error, "erdsync: edit rejected"),
        ClientEvent::BrokerError(notice) => {
            warn!(message = %notice.message, code = ?notice.code, "erdsync: broker error");
        }
        ClientEvent::BootstrapFailed(message) => error!(%message, "erdsync: bootstrap failed"),
        ClientEvent::EmptyDiagram => info!("erdsync: diagram is empty"),
        ClientEvent::PersistenceFailed(message) => warn!(%message, "erdsync: handle memory not saved"),
        ClientEvent::GaveUp { attempts, last_error } => {
            error!(attempts, %last_error, "erdsync: broker unreachable, giving up");
        }
    }
}
