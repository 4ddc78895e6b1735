//! HttpCasClient against a fake Kubo-style RPC server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Multipart, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use common::cas::{CasClient, CasError, HttpCasClient, LinkKind};
use common::ledger::ContentKey;
use serde_json::json;
use url::Url;

/// (decoded filename, content type) of every uploaded part
type Uploads = Arc<Mutex<Vec<(String, String)>>>;

const SLOW: &str = "QmSlow";

fn decode(raw: &str) -> String {
    url::form_urlencoded::parse(format!("n={}", raw).as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap_or_default()
}

async fn add(State(uploads): State<Uploads>, mut multipart: Multipart) -> Response {
    let mut lines = Vec::new();
    let mut root = None;
    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = decode(field.file_name().unwrap_or_default());
        let content_type = field.content_type().unwrap_or_default().to_string();
        let _ = field.bytes().await.unwrap();
        uploads.lock().unwrap().push((name.clone(), content_type));
        if name.contains('/') {
            lines.push(json!({ "Name": name, "Hash": format!("Qm{}", name.len()) }).to_string());
        } else {
            root = Some(name);
        }
    }
    // the root is always reported last
    let root = root.unwrap_or_else(|| "single".to_string());
    lines.push(json!({ "Name": root, "Hash": "QmRoot" }).to_string());
    lines.join("\n").into_response()
}

fn rpc_error(message: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "Message": message, "Code": 0, "Type": "error" })),
    )
        .into_response()
}

async fn ls(Query(params): Query<HashMap<String, String>>) -> Response {
    match params.get("arg").map(String::as_str) {
        Some("QmGood") => Json(json!({
            "Objects": [{
                "Hash": "QmGood",
                "Links": [
                    { "Name": "report.pdf", "Hash": "QmFile", "Size": 4, "Type": 2 },
                    { "Name": "nested", "Hash": "QmDir", "Size": 0, "Type": 1 },
                    { "Name": "upload_info.toml", "Hash": "QmInfo", "Size": 61, "Type": 2 }
                ]
            }]
        }))
        .into_response(),
        Some(SLOW) => {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Json(json!({ "Objects": [] })).into_response()
        }
        Some("QmGarbage") => "definitely not json".into_response(),
        _ => rpc_error("block was not found locally (offline): ipld: could not find node"),
    }
}

async fn pin(Query(params): Query<HashMap<String, String>>) -> Response {
    match params.get("arg").map(String::as_str) {
        Some("QmGood") => Json(json!({ "Pins": ["QmGood"] })).into_response(),
        Some(SLOW) => {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Json(json!({ "Pins": [SLOW] })).into_response()
        }
        _ => rpc_error("pin: datastore is locked"),
    }
}

async fn cat(Query(params): Query<HashMap<String, String>>) -> Response {
    match params.get("arg").map(String::as_str) {
        Some("QmFile") => "data".into_response(),
        _ => rpc_error("no link named \"x\" under QmGood"),
    }
}

async fn id() -> Response {
    Json(json!({ "ID": "12D3KooWFakeNode", "Addresses": [] })).into_response()
}

async fn spawn_fake_node() -> (Url, Uploads) {
    let uploads = Uploads::default();
    let app = Router::new()
        .route("/api/v0/add", post(add))
        .route("/api/v0/ls", post(ls))
        .route("/api/v0/pin/add", post(pin))
        .route("/api/v0/cat", post(cat))
        .route("/api/v0/id", post(id))
        .with_state(uploads.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (Url::parse(&format!("http://{}", addr)).unwrap(), uploads)
}

#[tokio::test]
async fn test_add_uploads_directory_and_returns_root() {
    let (url, uploads) = spawn_fake_node().await;
    let client = HttpCasClient::new(&url).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let staged = dir.path().join("report.pdf");
    std::fs::create_dir_all(&staged).unwrap();
    std::fs::write(staged.join("report.pdf"), b"data").unwrap();
    std::fs::write(staged.join("upload_info.toml"), b"filename = \"report.pdf\"\n").unwrap();

    let key = client.add(&staged).await.unwrap();
    assert_eq!(key, ContentKey::new("QmRoot"));

    let uploads = uploads.lock().unwrap().clone();
    assert_eq!(
        uploads,
        vec![
            ("report.pdf".to_string(), "application/x-directory".to_string()),
            (
                "report.pdf/report.pdf".to_string(),
                "application/octet-stream".to_string()
            ),
            (
                "report.pdf/upload_info.toml".to_string(),
                "application/octet-stream".to_string()
            ),
        ]
    );
}

#[tokio::test]
async fn test_ls_maps_link_types() {
    let (url, _) = spawn_fake_node().await;
    let client = HttpCasClient::new(&url).unwrap();

    let links = client
        .ls(&ContentKey::new("QmGood"), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(links.len(), 3);
    assert_eq!(links[0].name, "report.pdf");
    assert_eq!(links[0].kind, LinkKind::File);
    assert_eq!(links[0].size, 4);
    assert_eq!(links[1].kind, LinkKind::Directory);
    assert_eq!(links[2].key, ContentKey::new("QmInfo"));
}

#[tokio::test]
async fn test_missing_content_is_not_found() {
    let (url, _) = spawn_fake_node().await;
    let client = HttpCasClient::new(&url).unwrap();
    let key = ContentKey::new("QmMissing");

    let err = client.ls(&key, Duration::from_secs(5)).await.unwrap_err();
    assert!(matches!(err, CasError::NotFound(k) if k == key));

    let err = client.get(&key, Duration::from_secs(5)).await.unwrap_err();
    assert!(matches!(err, CasError::NotFound(_)));
}

#[tokio::test]
async fn test_slow_lookup_times_out_as_not_found() {
    let (url, _) = spawn_fake_node().await;
    let client = HttpCasClient::new(&url).unwrap();

    let err = client
        .ls(&ContentKey::new(SLOW), Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, CasError::NotFound(_)));
}

#[tokio::test]
async fn test_unparsable_listing_is_malformed() {
    let (url, _) = spawn_fake_node().await;
    let client = HttpCasClient::new(&url).unwrap();

    let err = client
        .ls(&ContentKey::new("QmGarbage"), Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, CasError::Malformed(_)));
}

#[tokio::test]
async fn test_pin_outcomes() {
    let (url, _) = spawn_fake_node().await;
    let client = HttpCasClient::new(&url).unwrap();

    client
        .pin(&ContentKey::new("QmGood"), true, Duration::from_secs(5))
        .await
        .unwrap();

    let err = client
        .pin(&ContentKey::new(SLOW), true, Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, CasError::PinTimeout(_)));

    let err = client
        .pin(&ContentKey::new("QmOther"), true, Duration::from_secs(5))
        .await
        .unwrap_err();
    match err {
        CasError::Http(status, message) => {
            assert_eq!(status.as_u16(), 500);
            assert_eq!(message, "pin: datastore is locked");
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_get_and_node_id() {
    let (url, _) = spawn_fake_node().await;
    let client = HttpCasClient::new(&url).unwrap();

    let data = client
        .get(&ContentKey::new("QmFile"), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(&data[..], b"data");
    assert_eq!(client.node_id().await.unwrap(), "12D3KooWFakeNode");
}

#[tokio::test]
async fn test_unreachable_daemon_is_storage_unavailable() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let url = Url::parse(&format!("http://{}", addr)).unwrap();
    let client = HttpCasClient::new(&url).unwrap();
    let err = client.node_id().await.unwrap_err();
    assert!(matches!(err, CasError::StorageUnavailable(_)));
}
