use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use zylith_gateway::{finalize_config, router, serve, AppState};

async fn spawn(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        serve(listener, app).await.expect("serve");
    });
    addr
}

/// Upstream standing in for both the ASP and the node; counts node hits.
async fn upstream(rpc_hits: Arc<AtomicUsize>) -> SocketAddr {
    let app = Router::new()
        .route("/deposit/root", get(|| async { Json("0xabc") }))
        .route(
            "/deposit/echo",
            get(|uri: Uri| async move { Json(json!({ "uri": uri.to_string() })) }),
        )
        .route(
            "/deposit/proof/:index",
            get(|| async {
                (
                    StatusCode::NOT_FOUND,
                    Json(json!({ "error": "Leaf not found at index", "index": 9 })),
                )
                    .into_response()
            }),
        )
        .route(
            "/rpc",
            post(|State(hits): State<Arc<AtomicUsize>>, Json(body): Json<Value>| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Json(json!({ "jsonrpc": "2.0", "id": body["id"].clone(), "result": "0x2a" }))
            }),
        )
        .with_state(rpc_hits);
    spawn(app).await
}

async fn gateway(upstream: SocketAddr, burst: u64) -> String {
    let raw = toml::from_str(&format!(
        r#"
bind_addr = "127.0.0.1:0"
asp_url = "http://{upstream}"
rpc_url = "http://{upstream}/rpc"
cors_allow_origins = ["*"]
rate_limit_per_minute = 1
rate_limit_burst = {burst}
"#
    ))
    .expect("toml");
    let config = finalize_config(raw).expect("config");
    let app = router(AppState::new(config).expect("state")).expect("router");
    format!("http://{}", spawn(app).await)
}

#[tokio::test]
async fn asp_requests_are_forwarded_verbatim() {
    let hits = Arc::new(AtomicUsize::new(0));
    let base = gateway(upstream(hits).await, 50).await;
    let client = reqwest::Client::new();

    let health: Value = client
        .get(format!("{base}/health"))
        .send()
        .await
        .expect("health")
        .json()
        .await
        .expect("json");
    assert_eq!(health["status"], "ok");

    let root: Value = client
        .get(format!("{base}/asp/deposit/root"))
        .send()
        .await
        .expect("root")
        .json()
        .await
        .expect("json");
    assert_eq!(root, json!("0xabc"));

    let echo: Value = client
        .get(format!("{base}/asp/deposit/echo?fresh=1&limit=2"))
        .send()
        .await
        .expect("echo")
        .json()
        .await
        .expect("json");
    assert_eq!(echo["uri"], "/deposit/echo?fresh=1&limit=2");
}

#[tokio::test]
async fn asp_errors_keep_upstream_status() {
    let hits = Arc::new(AtomicUsize::new(0));
    let base = gateway(upstream(hits).await, 50).await;
    let response = reqwest::get(format!("{base}/asp/deposit/proof/9"))
        .await
        .expect("proof");
    assert_eq!(response.status().as_u16(), 404);
    let body: Value = response.json().await.expect("json");
    assert_eq!(body["status"], 404);
    assert!(body["detail"]
        .as_str()
        .expect("detail")
        .contains("Leaf not found"));
}

#[tokio::test]
async fn rpc_forwards_valid_calls_and_rejects_malformed_ones() {
    let hits = Arc::new(AtomicUsize::new(0));
    let base = gateway(upstream(hits.clone()).await, 50).await;
    let client = reqwest::Client::new();

    let body: Value = client
        .post(format!("{base}/rpc"))
        .json(&json!({ "jsonrpc": "2.0", "method": "starknet_blockNumber", "params": [], "id": 7 }))
        .send()
        .await
        .expect("rpc")
        .json()
        .await
        .expect("json");
    assert_eq!(body["result"], "0x2a");
    assert_eq!(body["id"], 7);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    for bad in [
        "{not json".to_string(),
        json!({ "method": "starknet_blockNumber" }).to_string(),
        json!([]).to_string(),
    ] {
        let response = client
            .post(format!("{base}/rpc"))
            .header("content-type", "application/json")
            .body(bad)
            .send()
            .await
            .expect("rpc");
        assert_eq!(response.status().as_u16(), 400);
        let body: Value = response.json().await.expect("json");
        assert!(body["error"].is_string());
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rate_limit_applies_per_client() {
    let hits = Arc::new(AtomicUsize::new(0));
    let base = gateway(upstream(hits).await, 2).await;
    let client = reqwest::Client::new();
    for _ in 0..2 {
        let response = client.get(format!("{base}/health")).send().await.expect("health");
        assert_eq!(response.status().as_u16(), 200);
    }
    let response = client.get(format!("{base}/health")).send().await.expect("health");
    assert_eq!(response.status().as_u16(), 429);
}
