use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::http::StatusCode;
use axum::routing::{get, post};

use super::*;
use crate::model::KeyRole;

const DOCUMENT: &str = r#"{
  "entities": [
    {"name": "users", "modelId": 1, "position": {"x": 0, "y": 0},
     "fields": [{"id": 1, "name": "id", "dataType": "BIGINT", "role": "PRIMARY"}]},
    {"name": "orders", "modelId": 2, "position": {"x": 400, "y": 0},
     "fields": [{"id": 10, "name": "user_id", "dataType": "BIGINT", "role": "FOREIGN",
                 "connection": {"targetEntity": "users", "targetField": 1, "name": "fk_orders_users"}}]}
  ]
}"#;

async fn serve(app: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

fn source(base_url: String) -> HttpDiagramSource {
    let config = BootstrapConfig { base_url, timeout: Duration::from_secs(5) };
    HttpDiagramSource::new(&config).expect("client")
}

#[test]
fn parse_reads_entities_and_connections() {
    let diagram = parse_diagram(DOCUMENT).expect("parse");
    assert_eq!(diagram.len(), 2);
    let orders = diagram.entity("orders").expect("orders");
    assert_eq!(orders.model_id, Some(2));
    assert_eq!(orders.fields[0].role, KeyRole::Foreign);
    assert_eq!(diagram.connections().count(), 1);
    assert!(orders.fields.iter().all(|f| !f.pending));
}

#[test]
fn parse_empty_body_is_empty_diagram() {
    assert!(parse_diagram("").expect("empty").is_empty());
    assert!(parse_diagram("{}").expect("no entities").is_empty());
}

#[test]
fn parse_rejects_garbage() {
    assert!(matches!(parse_diagram("[1, 2"), Err(BootstrapError::Parse(_))));
}

#[tokio::test]
async fn fetch_diagram_over_http() {
    let app = axum::Router::new().route("/api/diagram", get(|| async { DOCUMENT }));
    let base = serve(app).await;

    let diagram = source(format!("{base}/")).fetch_diagram().await.expect("fetch");
    assert!(diagram.entity("users").is_some());
}

#[tokio::test]
async fn non_success_status_is_an_error() {
    let app = axum::Router::new()
        .route("/api/diagram", get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "maintenance") }));
    let base = serve(app).await;

    let err = source(base).fetch_diagram().await.expect_err("503");
    match err {
        BootstrapError::Status { status, body, url } => {
            assert_eq!(status, 503);
            assert_eq!(body, "maintenance");
            assert!(url.ends_with("/api/diagram"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn init_sample_data_posts() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let app = axum::Router::new().route(
        "/api/diagram/sample-data",
        post(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                StatusCode::NO_CONTENT
            }
        }),
    );
    let base = serve(app).await;

    source(base).init_sample_data().await.expect("init");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unreachable_service_is_a_request_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let err = source(format!("http://{addr}")).fetch_diagram().await.expect_err("refused");
    assert!(matches!(err, BootstrapError::Request { .. }));
}
