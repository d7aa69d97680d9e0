//! Initial diagram fetch over request/response HTTP.
//!
//! Thin wrapper around two endpoints. Parsing is a pure function so it can be
//! tested without a server.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::BootstrapConfig;
use crate::model::Diagram;

const CONNECT_TIMEOUT_CAP: Duration = Duration::from_secs(10);
const DIAGRAM_PATH: &str = "/api/diagram";
const SAMPLE_DATA_PATH: &str = "/api/diagram/sample-data";

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("http client build failed: {0}")]
    ClientBuild(String),
    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },
    #[error("{url} returned {status}: {body}")]
    Status { url: String, status: u16, body: String },
    #[error("malformed diagram document: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Where the initial diagram comes from.
#[async_trait]
pub trait DiagramSource: Send + Sync + 'static {
    /// # Errors
    ///
    /// Any transport, status, or parse failure.
    async fn fetch_diagram(&self) -> Result<Diagram, BootstrapError>;

    /// Ask the service to seed an empty diagram with sample entities.
    ///
    /// # Errors
    ///
    /// Any transport or status failure.
    async fn init_sample_data(&self) -> Result<(), BootstrapError>;
}

// =============================================================================
// HTTP SOURCE
// =============================================================================

pub struct HttpDiagramSource {
    http: reqwest::Client,
    base_url: String,
}

impl HttpDiagramSource {
    /// # Errors
    ///
    /// Returns [`BootstrapError::ClientBuild`] if the TLS backend fails to initialise.
    pub fn new(config: &BootstrapConfig) -> Result<Self, BootstrapError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout.min(CONNECT_TIMEOUT_CAP))
            .build()
            .map_err(|e| BootstrapError::ClientBuild(e.to_string()))?;
        Ok(Self { http, base_url: config.base_url.trim_end_matches('/').to_owned() })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn send(&self, request: reqwest::RequestBuilder, url: &str) -> Result<String, BootstrapError> {
        let response = request
            .send()
            .await
            .map_err(|e| BootstrapError::Request { url: url.to_owned(), message: e.to_string() })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| BootstrapError::Request { url: url.to_owned(), message: e.to_string() })?;

        if !(200..300).contains(&status) {
            return Err(BootstrapError::Status { url: url.to_owned(), status, body });
        }
        Ok(body)
    }
}

#[async_trait]
impl DiagramSource for HttpDiagramSource {
    async fn fetch_diagram(&self) -> Result<Diagram, BootstrapError> {
        let url = self.url(DIAGRAM_PATH);
        debug!(%url, "bootstrap: fetching diagram");
        let body = self.send(self.http.get(&url), &url).await?;
        let diagram = parse_diagram(&body)?;
        info!(entities = diagram.len(), "bootstrap: diagram fetched");
        Ok(diagram)
    }

    async fn init_sample_data(&self) -> Result<(), BootstrapError> {
        let url = self.url(SAMPLE_DATA_PATH);
        self.send(self.http.post(&url), &url).await?;
        info!("bootstrap: sample data initialised");
        Ok(())
    }
}

// =============================================================================
// PARSING
// =============================================================================

/// Decode a bootstrap document. An empty body is an empty diagram.
///
/// # Errors
///
/// Returns [`BootstrapError::Parse`] for anything that is not a diagram document.
pub fn parse_diagram(body: &str) -> Result<Diagram, BootstrapError> {
    if body.trim().is_empty() {
        return Ok(Diagram::new());
    }
    Ok(serde_json::from_str(body)?)
}

#[cfg(test)]
#[path = "bootstrap_test.rs"]
mod tests;
