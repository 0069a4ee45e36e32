//! Outbound connections to physical storage nodes
//!
//! A `NodeClient` is the only way the proxy talks to a node. The HTTP
//! implementation speaks a small contract:
//!
//! ```text
//! GET    /health                                   liveness probe
//! POST   /rpc/:method?replica_path=                accessor (streaming ones stream both ways)
//! POST   /transactions/:tx/prepare/:method?replica_path=   → {"fingerprint": hex}
//! POST   /transactions/:tx/commit                  apply prepared change
//! POST   /transactions/:tx/abort                   discard prepared change
//! POST   /repositories/replicate                   pull replica from a source node
//! DELETE /repositories?replica_path=               remove replica
//! GET    /repositories/snapshot?relative_path=     bundle stream
//! ```
//!
//! Every request carries the node's bearer token and its storage name.

use crate::common::{encode_segment, Error, NodeConfig, Result, Vote};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Header naming the storage a request is meant for
pub const STORAGE_HEADER: &str = "X-Repoward-Storage";

/// Streamed request or response body
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Operations the proxy performs against one physical node
#[tonic::async_trait]
pub trait NodeClient: Send + Sync + 'static {
    /// Liveness probe bounded by `timeout`
    async fn check(&self, timeout: Duration) -> Result<()>;

    /// Unary accessor
    async fn call(&self, method: &str, replica_path: &str, payload: Bytes) -> Result<Bytes>;

    /// Streaming accessor; the request body is forwarded as it arrives
    async fn call_stream(
        &self,
        method: &str,
        replica_path: &str,
        payload: ByteStream,
    ) -> Result<ByteStream>;

    /// Execute a mutator up to the point of applying it and return the
    /// fingerprint of the result it would apply.
    async fn prepare(
        &self,
        transaction_id: u64,
        method: &str,
        replica_path: &str,
        payload: Bytes,
    ) -> Result<Vote>;

    /// Apply the prepared change, returning the RPC response
    async fn commit(&self, transaction_id: u64) -> Result<Bytes>;

    async fn abort(&self, transaction_id: u64) -> Result<()>;

    /// Bring `replica_path` up to date from `source`
    async fn replicate(&self, replica_path: &str, source: &NodeConfig) -> Result<()>;

    async fn remove(&self, replica_path: &str) -> Result<()>;

    /// Full repository bundle
    async fn snapshot(&self, relative_path: &str) -> Result<ByteStream>;
}

/// Produces clients for configured nodes
pub trait Dialer: Send + Sync {
    fn dial(&self, node: &NodeConfig) -> Result<Arc<dyn NodeClient>>;
}

/// A configured node plus its client
#[derive(Clone)]
pub struct Node {
    pub virtual_storage: String,
    pub config: NodeConfig,
    pub client: Arc<dyn NodeClient>,
}

impl Node {
    pub fn storage(&self) -> &str {
        &self.config.storage
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("virtual_storage", &self.virtual_storage)
            .field("storage", &self.config.storage)
            .field("address", &self.config.address)
            .finish()
    }
}

/// Translate a connection string into the base URL of the node's HTTP API.
///
/// `tcp://` maps to `http://` and `tls://` to `https://`.
pub fn parse_address(address: &str) -> Result<reqwest::Url> {
    let invalid = || Error::InvalidConnectionString(address.to_string());

    let normalized = if let Some(rest) = address.strip_prefix("tcp://") {
        format!("http://{}", rest)
    } else if let Some(rest) = address.strip_prefix("tls://") {
        format!("https://{}", rest)
    } else if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        return Err(invalid());
    };

    let url = reqwest::Url::parse(&normalized).map_err(|_| invalid())?;
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid());
    }
    Ok(url)
}

/// Dials nodes over HTTP with a shared connection pool
#[derive(Clone)]
pub struct HttpDialer {
    client: reqwest::Client,
}

impl HttpDialer {
    pub fn new(request_timeout: Option<Duration>) -> Result<Self> {
        let mut builder = reqwest::Client::builder().pool_idle_timeout(Duration::from_secs(90));
        if let Some(timeout) = request_timeout {
            builder = builder.connect_timeout(timeout);
        }
        Ok(Self {
            client: builder.build()?,
        })
    }
}

impl Dialer for HttpDialer {
    fn dial(&self, node: &NodeConfig) -> Result<Arc<dyn NodeClient>> {
        let base = parse_address(&node.address)?;
        Ok(Arc::new(HttpNodeClient {
            http: self.client.clone(),
            base: base.as_str().trim_end_matches('/').to_string(),
            storage: node.storage.clone(),
            token: node.token.clone(),
        }))
    }
}

#[derive(Serialize, Deserialize)]
struct PrepareResponse {
    fingerprint: String,
}

#[derive(Serialize, Deserialize)]
struct ReplicateRequest<'a> {
    replica_path: &'a str,
    source_storage: &'a str,
    source_address: &'a str,
    source_token: &'a str,
}

/// HTTP client for a single node
pub struct HttpNodeClient {
    http: reqwest::Client,
    base: String,
    storage: String,
    token: String,
}

impl HttpNodeClient {
    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}{}", self.base, path))
            .header(STORAGE_HEADER, &self.storage);
        if !self.token.is_empty() {
            builder = builder.bearer_auth(&self.token);
        }
        builder
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(Error::NodeStatus {
            status: status.as_u16(),
            message,
        })
    }

    fn stream(&self, response: reqwest::Response) -> ByteStream {
        let node = self.storage.clone();
        Box::pin(
            response
                .bytes_stream()
                .map(move |chunk| chunk.map_err(|e| Error::from(e).on_node(node.clone()))),
        )
    }

    fn on_node<T>(&self, result: Result<T>) -> Result<T> {
        result.map_err(|e| e.on_node(self.storage.clone()))
    }
}

#[tonic::async_trait]
impl NodeClient for HttpNodeClient {
    async fn check(&self, timeout: Duration) -> Result<()> {
        let builder = self.request(reqwest::Method::GET, "/health").timeout(timeout);
        self.on_node(self.send(builder).await.map(|_| ()))
    }

    async fn call(&self, method: &str, replica_path: &str, payload: Bytes) -> Result<Bytes> {
        let builder = self
            .request(
                reqwest::Method::POST,
                &format!("/rpc/{}", encode_segment(method)),
            )
            .query(&[("replica_path", replica_path)])
            .body(payload);
        let result: Result<Bytes> = async { Ok(self.send(builder).await?.bytes().await?) }.await;
        self.on_node(result)
    }

    async fn call_stream(
        &self,
        method: &str,
        replica_path: &str,
        payload: ByteStream,
    ) -> Result<ByteStream> {
        let builder = self
            .request(
                reqwest::Method::POST,
                &format!("/rpc/{}", encode_segment(method)),
            )
            .query(&[("replica_path", replica_path)])
            .body(reqwest::Body::wrap_stream(payload));
        let response = self.on_node(self.send(builder).await)?;
        Ok(self.stream(response))
    }

    async fn prepare(
        &self,
        transaction_id: u64,
        method: &str,
        replica_path: &str,
        payload: Bytes,
    ) -> Result<Vote> {
        let builder = self
            .request(
                reqwest::Method::POST,
                &format!(
                    "/transactions/{}/prepare/{}",
                    transaction_id,
                    encode_segment(method)
                ),
            )
            .query(&[("replica_path", replica_path)])
            .body(payload);
        let result: Result<Vote> = async {
            let prepared: PrepareResponse = self.send(builder).await?.json().await?;
            Vote::from_hex(&prepared.fingerprint)
        }
        .await;
        self.on_node(result)
    }

    async fn commit(&self, transaction_id: u64) -> Result<Bytes> {
        let builder = self.request(
            reqwest::Method::POST,
            &format!("/transactions/{}/commit", transaction_id),
        );
        let result: Result<Bytes> = async { Ok(self.send(builder).await?.bytes().await?) }.await;
        self.on_node(result)
    }

    async fn abort(&self, transaction_id: u64) -> Result<()> {
        let builder = self.request(
            reqwest::Method::POST,
            &format!("/transactions/{}/abort", transaction_id),
        );
        self.on_node(self.send(builder).await.map(|_| ()))
    }

    async fn replicate(&self, replica_path: &str, source: &NodeConfig) -> Result<()> {
        let builder = self
            .request(reqwest::Method::POST, "/repositories/replicate")
            .json(&ReplicateRequest {
                replica_path,
                source_storage: &source.storage,
                source_address: &source.address,
                source_token: &source.token,
            });
        self.on_node(self.send(builder).await.map(|_| ()))
    }

    async fn remove(&self, replica_path: &str) -> Result<()> {
        let builder = self
            .request(reqwest::Method::DELETE, "/repositories")
            .query(&[("replica_path", replica_path)]);
        self.on_node(self.send(builder).await.map(|_| ()))
    }

    async fn snapshot(&self, relative_path: &str) -> Result<ByteStream> {
        let builder = self
            .request(reqwest::Method::GET, "/repositories/snapshot")
            .query(&[("relative_path", relative_path)]);
        let response = self.on_node(self.send(builder).await)?;
        Ok(self.stream(response))
    }
}
