//! HTTP transport
//!
//! Server side: an axum [`router`] exposing a [`DhtNode`]'s RPC endpoints.
//! Client side: [`HttpRpc`], the reqwest-backed [`PeerRpc`].
//!
//! | Route | Body | Reply |
//! |---|---|---|
//! | `POST /ping` | `{}` | `{ok, id}` |
//! | `POST /store` | `{key, value}` | `{ok}` |
//! | `POST /find_node` | `{target}` | `{ok, contacts}` |
//! | `POST /find_value` | `{key}` | `{ok, value}` or `{ok, contacts}` |
//! | `GET /chunks/{hash}` | | raw bytes |
//! | `PUT /chunks/{hash}` | raw bytes | `{ok}` |

use crate::id::NodeId;
use crate::node::DhtNode;
use crate::routing::Contact;
use crate::rpc::{
    AckResponse, ErrorResponse, FindNodeRequest, FindNodeResponse, FindValueOutcome,
    FindValueRequest, FindValueResponse, PeerRpc, PingResponse, StoreRequest,
};
use crate::{DhtError, Result};
use async_trait::async_trait;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use chunkdht_core::PeerAddr;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpListener;

impl IntoResponse for DhtError {
    fn into_response(self) -> Response {
        let status = match &self {
            DhtError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            DhtError::NotFound(_) => StatusCode::NOT_FOUND,
            DhtError::PeerUnreachable(_) => StatusCode::BAD_GATEWAY,
            DhtError::DataCorruption { .. } | DhtError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorResponse {
            ok: false,
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

fn json_body<T>(body: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    body.map(|Json(inner)| inner)
        .map_err(|rejection| DhtError::InvalidRequest(rejection.body_text()))
}

/// Router serving `node`'s RPC endpoints
pub fn router(node: DhtNode) -> Router {
    Router::new()
        .route("/ping", post(ping))
        .route("/store", post(store))
        .route("/find_node", post(find_node))
        .route("/find_value", post(find_value))
        .route("/chunks/{hash}", get(get_chunk).put(put_chunk))
        .with_state(node)
}

/// Serve `node` on an already-bound listener until `shutdown` resolves
pub async fn serve<F>(node: DhtNode, listener: TcpListener, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(node))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn ping(State(node): State<DhtNode>) -> Json<PingResponse> {
    Json(PingResponse {
        ok: true,
        id: node.handle_ping(),
    })
}

async fn store(
    State(node): State<DhtNode>,
    body: std::result::Result<Json<StoreRequest>, JsonRejection>,
) -> Result<Json<AckResponse>> {
    let req = json_body(body)?;
    node.handle_store(req.key, req.value).await?;
    Ok(Json(AckResponse::ok()))
}

async fn find_node(
    State(node): State<DhtNode>,
    body: std::result::Result<Json<FindNodeRequest>, JsonRejection>,
) -> Result<Json<FindNodeResponse>> {
    let req = json_body(body)?;
    if req.target.is_empty() {
        return Err(DhtError::InvalidRequest("missing target".to_string()));
    }
    let contacts = node.handle_find_node(&NodeId::for_key(&req.target)).await;
    Ok(Json(FindNodeResponse { ok: true, contacts }))
}

async fn find_value(
    State(node): State<DhtNode>,
    body: std::result::Result<Json<FindValueRequest>, JsonRejection>,
) -> Result<Json<FindValueResponse>> {
    let req = json_body(body)?;
    if req.key.is_empty() {
        return Err(DhtError::InvalidRequest("missing key".to_string()));
    }
    let outcome = node.handle_find_value(&req.key).await;
    Ok(Json(FindValueResponse::from(outcome)))
}

async fn get_chunk(State(node): State<DhtNode>, Path(hash): Path<String>) -> Result<Response> {
    let data = node.handle_get_chunk(&hash).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        data,
    )
        .into_response())
}

async fn put_chunk(
    State(node): State<DhtNode>,
    Path(hash): Path<String>,
    body: Bytes,
) -> Result<Json<AckResponse>> {
    node.handle_put_chunk(&hash, &body).await?;
    Ok(Json(AckResponse::ok()))
}

/// reqwest-backed [`PeerRpc`]
#[derive(Clone)]
pub struct HttpRpc {
    client: reqwest::Client,
    chunk_timeout: Duration,
}

impl HttpRpc {
    /// Client whose every request gives up after `timeout`
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DhtError::InvalidRequest(format!("HTTP client setup failed: {}", e)))?;
        Ok(Self {
            client,
            chunk_timeout: timeout,
        })
    }

    /// Deadline for chunk transfers, overriding the RPC timeout
    pub fn with_chunk_timeout(mut self, timeout: Duration) -> Self {
        self.chunk_timeout = timeout;
        self
    }

    async fn call<Req, Resp>(&self, to: &PeerAddr, procedure: &str, body: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized + Sync,
        Resp: DeserializeOwned,
    {
        let url = format!("{}/{}", to.base_url(), procedure);
        let unreachable = |e: reqwest::Error| DhtError::PeerUnreachable(format!("{} {}: {}", to, procedure, e));

        self.client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(unreachable)?
            .error_for_status()
            .map_err(unreachable)?
            .json::<Resp>()
            .await
            .map_err(unreachable)
    }

    fn chunk_url(to: &PeerAddr, hash: &str) -> String {
        format!("{}/chunks/{}", to.base_url(), hash)
    }
}

#[async_trait]
impl PeerRpc for HttpRpc {
    async fn ping(&self, to: &PeerAddr) -> Result<NodeId> {
        let resp: PingResponse = self.call(to, "ping", &serde_json::json!({})).await?;
        Ok(resp.id)
    }

    async fn store(&self, to: &PeerAddr, key: &str, value: &Value) -> Result<()> {
        let body = serde_json::json!({ "key": key, "value": value });
        let _: AckResponse = self.call(to, "store", &body).await?;
        Ok(())
    }

    async fn find_node(&self, to: &PeerAddr, target: &NodeId) -> Result<Vec<Contact>> {
        let body = FindNodeRequest {
            target: target.to_hex(),
        };
        let resp: FindNodeResponse = self.call(to, "find_node", &body).await?;
        Ok(resp.contacts)
    }

    async fn find_value(&self, to: &PeerAddr, key: &str) -> Result<FindValueOutcome> {
        let body = FindValueRequest { key: key.to_string() };
        let resp: FindValueResponse = self.call(to, "find_value", &body).await?;
        Ok(resp.into())
    }

    async fn get_chunk(&self, to: &PeerAddr, hash: &str) -> Result<Bytes> {
        let unreachable = |e: reqwest::Error| DhtError::PeerUnreachable(format!("{} get_chunk: {}", to, e));
        self.client
            .get(Self::chunk_url(to, hash))
            .timeout(self.chunk_timeout)
            .send()
            .await
            .map_err(unreachable)?
            .error_for_status()
            .map_err(unreachable)?
            .bytes()
            .await
            .map_err(unreachable)
    }

    async fn put_chunk(&self, to: &PeerAddr, hash: &str, data: Bytes) -> Result<()> {
        let unreachable = |e: reqwest::Error| DhtError::PeerUnreachable(format!("{} put_chunk: {}", to, e));
        self.client
            .put(Self::chunk_url(to, hash))
            .timeout(self.chunk_timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data)
            .send()
            .await
            .map_err(unreachable)?
            .error_for_status()
            .map_err(unreachable)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DhtConfig;
    use chunkdht_core::chunk::sha256_hex;
    use serde_json::json;
    use tempfile::TempDir;

    /// Bind an ephemeral port, start a node on it, return the node
    async fn spawn_node(dir: &TempDir, seed: &str) -> DhtNode {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let node = DhtNode::open(
            DhtConfig::with_seed(seed),
            PeerAddr::new("127.0.0.1", port),
            dir.path().join(seed),
        )
        .await
        .unwrap();
        tokio::spawn(serve(node.clone(), listener, std::future::pending()));
        node
    }

    fn rpc() -> HttpRpc {
        HttpRpc::new(Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_ping_store_find_value_over_http() {
        let dir = TempDir::new().unwrap();
        let a = spawn_node(&dir, "http-a").await;
        let b = spawn_node(&dir, "http-b").await;
        a.add_contact(b.contact()).await;
        let rpc = rpc();

        assert_eq!(rpc.ping(a.addr()).await.unwrap(), *a.id());

        let key = "aa".repeat(32);
        rpc.store(a.addr(), &key, &json!({"peers": [{"host": "x", "port": 1}]}))
            .await
            .unwrap();
        match rpc.find_value(a.addr(), &key).await.unwrap() {
            FindValueOutcome::Value(v) => assert_eq!(v["peers"][0]["host"], "x"),
            other => panic!("expected value, got {:?}", other),
        }

        match rpc.find_value(a.addr(), "bb").await.unwrap() {
            FindValueOutcome::Contacts(contacts) => {
                assert_eq!(contacts.len(), 2);
                assert!(contacts.iter().any(|c| c.id == *b.id() && c.addr == *b.addr()));
            }
            other => panic!("expected contacts, got {:?}", other),
        }

        let found = rpc.find_node(a.addr(), b.id()).await.unwrap();
        assert_eq!(found[0].id, *b.id());
    }

    #[tokio::test]
    async fn test_store_without_key_is_bad_request() {
        let dir = TempDir::new().unwrap();
        let a = spawn_node(&dir, "http-bad").await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/store", a.addr().base_url()))
            .json(&json!({"value": 1}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 400);

        let resp = client
            .post(format!("{}/store", a.addr().base_url()))
            .body("not json")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 400);
    }

    #[tokio::test]
    async fn test_chunk_endpoint_status_codes() {
        let dir = TempDir::new().unwrap();
        let a = spawn_node(&dir, "http-chunks").await;
        let rpc = rpc();
        let client = reqwest::Client::new();
        let base = a.addr().base_url();

        let data = Bytes::from_static(b"served bytes");
        let hash = sha256_hex(&data);
        rpc.put_chunk(a.addr(), &hash, data.clone()).await.unwrap();
        assert_eq!(rpc.get_chunk(a.addr(), &hash).await.unwrap(), data);

        let resp = client.get(format!("{}/chunks/zzzz", base)).send().await.unwrap();
        assert_eq!(resp.status().as_u16(), 400);

        let missing = sha256_hex(b"missing");
        let resp = client.get(format!("{}/chunks/{}", base, missing)).send().await.unwrap();
        assert_eq!(resp.status().as_u16(), 404);

        std::fs::write(a.chunk_store().dir().join(&hash), b"rotted").unwrap();
        let resp = client.get(format!("{}/chunks/{}", base, hash)).send().await.unwrap();
        assert_eq!(resp.status().as_u16(), 500);

        // Mismatched upload is refused
        assert!(rpc
            .put_chunk(a.addr(), &missing, Bytes::from_static(b"not it"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_unreachable_peer_maps_to_peer_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = rpc().ping(&PeerAddr::new("127.0.0.1", port)).await.unwrap_err();
        assert!(matches!(err, DhtError::PeerUnreachable(_)));
    }
}
