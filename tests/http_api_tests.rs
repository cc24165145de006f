use base64::Engine;
use echofiles::filestore::{EffectiveConfig, Filestore};
use echofiles::server::{router, AppState};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

// Minimal manual HTTP/1.1 client: one request per connection.
async fn call(addr: &str, method: &str, path: &str, user: Option<&str>, body: Option<Value>) -> (u16, Value) {
    let mut conn = TcpStream::connect(addr).await.unwrap();
    let payload = body.map(|b| b.to_string()).unwrap_or_default();
    let mut req = format!("{method} {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\nx-request-id: test-req\r\n");
    if let Some(u) = user {
        req.push_str(&format!("x-user-id: {u}\r\n"));
    }
    if !payload.is_empty() {
        req.push_str(&format!("content-type: application/json\r\ncontent-length: {}\r\n", payload.len()));
    }
    req.push_str("\r\n");
    req.push_str(&payload);
    conn.write_all(req.as_bytes()).await.unwrap();
    let mut raw = Vec::new();
    conn.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8_lossy(&raw).to_string();
    let status: u16 = text.split_whitespace().nth(1).unwrap().parse().unwrap();
    let body = text.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or("");
    echofiles::tprintln!("{method} {path} -> {status} {body}");
    (status, serde_json::from_str(body).unwrap_or(Value::Null))
}

async fn start(cfg: EffectiveConfig) -> String {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let app = router(AppState { filestore: Filestore::in_memory(cfg) });
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

#[tokio::test]
async fn folder_and_upload_flow() {
    let addr = start(EffectiveConfig::default()).await;
    let (st, docs) = call(&addr, "POST", "/api/folders/create", Some("alice"), Some(json!({"name": "Docs"}))).await;
    assert_eq!(st, 201);
    assert_eq!(docs["path"], "/Docs");
    assert_eq!(docs["isFolder"], true);
    let docs_id = docs["id"].as_str().unwrap().to_string();

    let content = base64::engine::general_purpose::STANDARD.encode(b"hello world");
    let (st, file) = call(
        &addr,
        "POST",
        "/api/files/upload",
        Some("alice"),
        Some(json!({"name": "a.txt", "contentType": "text/plain", "content": content, "parentId": docs_id})),
    )
    .await;
    assert_eq!(st, 201);
    assert_eq!(file["size"], 11);
    assert_eq!(file["path"], "/Docs/a.txt");

    let (st, listed) = call(&addr, "GET", &format!("/api/files?parentId={docs_id}"), Some("alice"), None).await;
    assert_eq!(st, 200);
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let (st, crumbs) = call(&addr, "GET", &format!("/api/files/{}/breadcrumbs", file["id"].as_str().unwrap()), Some("alice"), None).await;
    assert_eq!(st, 200);
    assert_eq!(crumbs[0]["name"], "Docs");
    assert_eq!(crumbs[1]["name"], "a.txt");
}

#[tokio::test]
async fn toggles_delete_and_empty_trash() {
    let addr = start(EffectiveConfig::default()).await;
    let (_, f) = call(&addr, "POST", "/api/folders/create", Some("alice"), Some(json!({"name": "Old"}))).await;
    let id = f["id"].as_str().unwrap().to_string();

    let (st, starred) = call(&addr, "PATCH", &format!("/api/files/{id}/star"), Some("alice"), None).await;
    assert_eq!(st, 200);
    assert_eq!(starred["isStarred"], true);

    let (st, err) = call(&addr, "DELETE", &format!("/api/files/{id}/delete"), Some("alice"), None).await;
    assert_eq!(st, 409);
    assert_eq!(err["code"], "not_trashed");

    let (_, trashed) = call(&addr, "PATCH", &format!("/api/files/{id}/trash"), Some("alice"), None).await;
    assert_eq!(trashed["isTrash"], true);
    let (_, counts) = call(&addr, "GET", "/api/files/counts", Some("alice"), None).await;
    assert_eq!(counts, json!({"all": 0, "starred": 0, "trash": 1}));

    let (st, out) = call(&addr, "DELETE", "/api/files/empty-trash", Some("alice"), None).await;
    assert_eq!(st, 200);
    assert_eq!(out["deletedCount"], 1);
    let (st, _) = call(&addr, "GET", &format!("/api/files/{id}"), Some("alice"), None).await;
    assert_eq!(st, 404);
}

#[tokio::test]
async fn error_statuses() {
    let addr = start(EffectiveConfig { max_upload_bytes: 4, ..EffectiveConfig::default() }).await;
    let (st, err) = call(&addr, "GET", "/api/files", None, None).await;
    assert_eq!(st, 401);
    assert_eq!(err["type"], "auth");

    let (st, err) = call(&addr, "POST", "/api/folders/create", Some("alice"), Some(json!({"name": "a/b"}))).await;
    assert_eq!(st, 400);
    assert_eq!(err["code"], "invalid_name");

    let (_, f) = call(&addr, "POST", "/api/folders/create", Some("alice"), Some(json!({"name": "Mine"}))).await;
    let id = f["id"].as_str().unwrap().to_string();
    let (st, err) = call(&addr, "PATCH", &format!("/api/files/{id}/star"), Some("bob"), None).await;
    assert_eq!(st, 403);
    assert_eq!(err["code"], "ownership_mismatch");

    let (st, _) = call(&addr, "GET", "/api/files?userId=bob", Some("alice"), None).await;
    assert_eq!(st, 403);

    let (st, err) = call(&addr, "PATCH", &format!("/api/files/{id}/move"), Some("alice"), Some(json!({"parentId": id}))).await;
    assert_eq!(st, 409);
    assert_eq!(err["code"], "cycle_detected");

    let big = base64::engine::general_purpose::STANDARD.encode(b"too large");
    let (st, err) = call(
        &addr,
        "POST",
        "/api/files/upload",
        Some("alice"),
        Some(json!({"name": "x.txt", "contentType": "text/plain", "content": big})),
    )
    .await;
    assert_eq!(st, 400);
    assert_eq!(err["code"], "invalid_content");

    let (st, _) = call(&addr, "GET", "/api/files/not-a-uuid", Some("alice"), None).await;
    assert_eq!(st, 400);
}

#[tokio::test]
async fn rename_and_views_over_http() {
    let addr = start(EffectiveConfig::default()).await;
    let (_, d) = call(&addr, "POST", "/api/folders/create", Some("alice"), Some(json!({"name": "Docs", "dedupToken": "t1"}))).await;
    let (_, again) = call(&addr, "POST", "/api/folders/create", Some("alice"), Some(json!({"name": "Docs", "dedupToken": "t1"}))).await;
    assert_eq!(d["id"], again["id"]);
    let id = d["id"].as_str().unwrap().to_string();

    let (st, renamed) = call(&addr, "PATCH", &format!("/api/files/{id}/rename"), Some("alice"), Some(json!({"name": "Papers"}))).await;
    assert_eq!(st, 200);
    assert_eq!(renamed["path"], "/Papers");

    call(&addr, "PATCH", &format!("/api/files/{id}/star"), Some("alice"), None).await;
    let (_, starred) = call(&addr, "GET", "/api/files?view=starred", Some("alice"), None).await;
    assert_eq!(starred.as_array().unwrap().len(), 1);
    let (st, _) = call(&addr, "GET", "/api/files?view=recent", Some("alice"), None).await;
    assert_eq!(st, 400);
}

#[tokio::test]
async fn malformed_requests_get_error_bodies() {
    let addr = start(EffectiveConfig::default()).await;
    let (st, listed) = call(&addr, "GET", "/api/files?parentId=&view=", Some("alice"), None).await;
    assert_eq!(st, 200);
    assert_eq!(listed, json!([]));

    let (st, err) = call(&addr, "GET", "/api/files?parentId=nope", Some("alice"), None).await;
    assert_eq!(st, 400);
    assert_eq!(err["type"], "user_input");
    assert_eq!(err["code"], "invalid_query");

    let (st, err) = call(&addr, "POST", "/api/folders/create", Some("alice"), Some(json!({"nam": 1}))).await;
    assert_eq!(st, 400);
    assert_eq!(err["code"], "invalid_body");
    assert!(err["message"].as_str().unwrap().contains("name"));

    let (_, f) = call(&addr, "POST", "/api/folders/create", Some("alice"), Some(json!({"name": "Docs"}))).await;
    let id = f["id"].as_str().unwrap().to_string();
    let (st, err) = call(&addr, "PATCH", &format!("/api/files/{id}/move"), Some("alice"), Some(json!({"parentId": 7}))).await;
    assert_eq!(st, 400);
    assert_eq!(err["code"], "invalid_body");
}
