//! `/asp/*` and `/rpc` pass-through. The gateway never reshapes successful upstream bodies.

use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, DefaultBodyLimit, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::middleware::{from_fn_with_state, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::Value;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;
use url::Url;

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::limiter::{client_ip, RateLimiter};

const ASP_PREFIX: &str = "/asp/";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    client: reqwest::Client,
    rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| GatewayError::Internal(format!("http client: {e}")))?;
        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_limit_per_minute,
            config.rate_limit_burst,
        ));
        Ok(Self {
            config: Arc::new(config),
            client,
            rate_limiter,
        })
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

pub fn router(state: AppState) -> Result<Router, Box<dyn Error>> {
    let cors = build_cors(&state.config.cors_allow_origins)?;
    let max_body_bytes = state.config.max_body_bytes;
    let request_timeout = state.config.request_timeout;
    Ok(Router::new()
        .route("/health", get(health))
        .route("/asp/*path", get(forward_asp).post(forward_asp))
        .route("/rpc", post(forward_rpc))
        .layer(from_fn_with_state(state.clone(), rate_limit))
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(request_timeout))
                .layer(cors),
        ))
}

/// Serves with peer addresses attached, which the rate limiter needs.
pub async fn serve(listener: tokio::net::TcpListener, app: Router) -> std::io::Result<()> {
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await
}

fn build_cors(origins: &[String]) -> Result<CorsLayer, Box<dyn Error>> {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);
    if origins.iter().any(|o| o == "*") {
        return Ok(base.allow_origin(Any));
    }
    let values = origins
        .iter()
        .map(|origin| HeaderValue::from_str(origin))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(base.allow_origin(values))
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn rate_limit(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    if req.method() == Method::OPTIONS {
        return next.run(req).await;
    }
    let ip = client_ip(req.headers(), addr, state.config.trust_proxy);
    if !state.rate_limiter.allow(ip) {
        debug!(%ip, "rate limited");
        return GatewayError::RateLimited.into_response();
    }
    next.run(req).await
}

/// Path and query after `/asp/` go to the ASP unchanged.
async fn forward_asp(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let rest = uri
        .path()
        .strip_prefix(ASP_PREFIX)
        .ok_or_else(|| GatewayError::BadRequest("expected an /asp/ path".to_string()))?;
    let target = asp_target(&state.config.asp_url, rest, uri.query());
    let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .map_err(|_| GatewayError::BadRequest(format!("unsupported method {method}")))?;

    let mut request = state.client.request(method.clone(), target.clone());
    if let Some(content_type) = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
    {
        request = request.header(reqwest::header::CONTENT_TYPE, content_type);
    }
    if !body.is_empty() {
        request = request.body(body.to_vec());
    }
    let upstream = request.send().await?;
    debug!(%method, path = %target.path(), status = upstream.status().as_u16(), "asp forwarded");
    relay(upstream).await
}

async fn forward_rpc(State(state): State<AppState>, body: Bytes) -> Result<Response, GatewayError> {
    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| GatewayError::BadRequest(format!("invalid json: {e}")))?;
    validate_jsonrpc(&payload).map_err(GatewayError::BadRequest)?;
    let upstream = state
        .client
        .post(state.config.rpc_url.clone())
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body.to_vec())
        .send()
        .await?;
    debug!(status = upstream.status().as_u16(), "rpc forwarded");
    relay(upstream).await
}

fn asp_target(base: &Url, rest: &str, query: Option<&str>) -> Url {
    let mut target = base.clone();
    let prefix = base.path().trim_end_matches('/').to_string();
    target.set_path(&format!("{prefix}/{rest}"));
    target.set_query(query);
    target
}

/// Successful answers pass through with their status and content type. Anything else becomes
/// an upstream error carrying the body text.
async fn relay(upstream: reqwest::Response) -> Result<Response, GatewayError> {
    let status = upstream.status().as_u16();
    let content_type = upstream
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let body = upstream.bytes().await?;
    if !(200..300).contains(&status) {
        return Err(GatewayError::Upstream {
            status,
            detail: String::from_utf8_lossy(&body).into_owned(),
        });
    }
    let code = StatusCode::from_u16(status)
        .map_err(|e| GatewayError::Internal(format!("upstream status: {e}")))?;
    let mut response = Response::builder().status(code);
    if let Some(content_type) = content_type {
        response = response.header(header::CONTENT_TYPE, content_type);
    }
    response
        .body(Body::from(body))
        .map_err(|e| GatewayError::Internal(e.to_string()))
}

/// A single call object or a non-empty batch of them.
pub fn validate_jsonrpc(payload: &Value) -> Result<(), String> {
    match payload {
        Value::Object(_) => validate_call(payload),
        Value::Array(calls) if calls.is_empty() => Err("empty batch".to_string()),
        Value::Array(calls) => calls
            .iter()
            .enumerate()
            .try_for_each(|(i, call)| validate_call(call).map_err(|e| format!("batch[{i}]: {e}"))),
        _ => Err("expected a JSON-RPC object or batch".to_string()),
    }
}

fn validate_call(call: &Value) -> Result<(), String> {
    let call = call
        .as_object()
        .ok_or_else(|| "call must be an object".to_string())?;
    if call.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Err("jsonrpc must be \"2.0\"".to_string());
    }
    match call.get("method").and_then(Value::as_str) {
        Some(method) if !method.trim().is_empty() => {}
        _ => return Err("method must be a non-empty string".to_string()),
    }
    match call.get("params") {
        None | Some(Value::Array(_)) | Some(Value::Object(_)) => {}
        Some(_) => return Err("params must be an array or object".to_string()),
    }
    match call.get("id") {
        None | Some(Value::Null) | Some(Value::String(_)) | Some(Value::Number(_)) => Ok(()),
        Some(_) => Err("id must be a string, number or null".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_calls_and_batches() {
        let call = json!({ "jsonrpc": "2.0", "method": "starknet_blockNumber", "id": 1 });
        validate_jsonrpc(&call).expect("single");
        let with_params = json!({ "jsonrpc": "2.0", "method": "starknet_call", "params": { "request": {} }, "id": "a" });
        validate_jsonrpc(&json!([call, with_params])).expect("batch");
    }

    #[test]
    fn rejects_malformed_calls() {
        for bad in [
            json!("starknet_blockNumber"),
            json!([]),
            json!({ "method": "starknet_blockNumber" }),
            json!({ "jsonrpc": "1.0", "method": "x" }),
            json!({ "jsonrpc": "2.0", "method": 5 }),
            json!({ "jsonrpc": "2.0", "method": "x", "params": "p" }),
            json!({ "jsonrpc": "2.0", "method": "x", "id": [1] }),
            json!([{ "jsonrpc": "2.0", "method": "x" }, 3]),
        ] {
            assert!(validate_jsonrpc(&bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn asp_target_keeps_base_path_and_query() {
        let base = Url::parse("http://asp.local/v1/").expect("url");
        let target = asp_target(&base, "deposit/proof/3", Some("fresh=1"));
        assert_eq!(target.as_str(), "http://asp.local/v1/deposit/proof/3?fresh=1");
        let bare = Url::parse("http://asp.local").expect("url");
        assert_eq!(
            asp_target(&bare, "deposit/root", None).as_str(),
            "http://asp.local/deposit/root"
        );
    }
}
