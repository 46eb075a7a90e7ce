//! HTTP/JSON peer transport.
//!
//! | Route | Method | Body |
//! |---|---|---|
//! | `/push` | POST | `{"records": [..]}` → `{"accepted": n}` |
//! | `/pull` | GET | snapshot JSON |
//! | `/keys?pattern=..` | GET | `{"keys": [..]}` |

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::node::Node;
use crate::replication::PeerTransport;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    pub records: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushResponse {
    pub accepted: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeysQuery {
    #[serde(default)]
    pub pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysResponse {
    pub keys: Vec<String>,
}

#[derive(Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn url(addr: &str, path: &str) -> String {
        let addr = addr.trim_end_matches('/');
        if addr.starts_with("http://") || addr.starts_with("https://") {
            format!("{addr}/{path}")
        } else {
            format!("http://{addr}/{path}")
        }
    }
}

fn transport_error(addr: &str) -> impl FnOnce(reqwest::Error) -> Error + '_ {
    move |e| Error::Unreachable(format!("{addr}: {e}"))
}

fn decode_error(addr: &str) -> impl FnOnce(reqwest::Error) -> Error + '_ {
    move |e| Error::Malformed(format!("response from {addr}: {e}"))
}

impl PeerTransport for HttpTransport {
    async fn push(&self, addr: &str, records: Vec<String>) -> Result<usize> {
        let resp = self
            .client
            .post(Self::url(addr, "push"))
            .json(&PushRequest { records })
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(transport_error(addr))?;
        let body: PushResponse = resp.json().await.map_err(decode_error(addr))?;
        Ok(body.accepted)
    }

    async fn pull(&self, addr: &str) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get(Self::url(addr, "pull"))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(transport_error(addr))?;
        let bytes = resp.bytes().await.map_err(transport_error(addr))?;
        Ok(bytes.to_vec())
    }

    async fn keys(&self, addr: &str, pattern: &str) -> Result<Vec<String>> {
        let resp = self
            .client
            .get(Self::url(addr, "keys"))
            .query(&[("pattern", pattern)])
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(transport_error(addr))?;
        let body: KeysResponse = resp.json().await.map_err(decode_error(addr))?;
        Ok(body.keys)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Malformed(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict { .. } => StatusCode::CONFLICT,
            Error::QueueFull | Error::Closed => StatusCode::SERVICE_UNAVAILABLE,
            Error::PartialPush { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// Routes a peer uses to replicate into `node`.
pub fn router<T: PeerTransport>(node: Arc<Node<T>>) -> Router {
    Router::new()
        .route("/push", post(handle_push::<T>))
        .route("/pull", get(handle_pull::<T>))
        .route("/keys", get(handle_keys::<T>))
        .with_state(node)
}

async fn handle_push<T: PeerTransport>(
    State(node): State<Arc<Node<T>>>,
    Json(req): Json<PushRequest>,
) -> Result<Json<PushResponse>> {
    let accepted = node.handle_push(&req.records).await?;
    Ok(Json(PushResponse { accepted }))
}

async fn handle_pull<T: PeerTransport>(State(node): State<Arc<Node<T>>>) -> Result<Response> {
    let snapshot = node.handle_pull()?;
    Ok(([(header::CONTENT_TYPE, "application/json")], snapshot).into_response())
}

async fn handle_keys<T: PeerTransport>(
    State(node): State<Arc<Node<T>>>,
    Query(query): Query<KeysQuery>,
) -> Result<Json<KeysResponse>> {
    let keys = node.handle_keys(&query.pattern)?;
    Ok(Json(KeysResponse { keys }))
}
