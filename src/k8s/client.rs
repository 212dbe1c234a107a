// Client creation plus the Kubernetes-backed page source and stream connector
use crate::error::Result as KwResult;
use crate::k8s::watch::config::{CLOSE_ABNORMAL, CLOSE_NORMAL};
use crate::k8s::watch::errors::{TransportError, WatchError};
use crate::k8s::watch::kinds::ResourceKind;
use crate::k8s::watch::paginator::{Page, PageSource};
use crate::k8s::watch::query::{WatchQuery, list_request, object_request};
use crate::k8s::watch::transport::{Connector, Socket, SocketFrame};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{AsyncBufReadExt, StreamExt};
use hyper::http::{self, HeaderName, HeaderValue, Uri};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ListMeta;
use k8s_openapi::serde_json::Value;
use kube::{Client, Config};
use serde::Deserialize;
use tracing::{debug, warn};

/// Create a new k8s client to interact with k8s cluster api
///
/// # Errors
///
/// Will return `Err` if the kube config can not be inferred or the client
/// can not be built from it
pub async fn new(custom_user_agent: Option<&str>) -> KwResult<Client> {
    let mut config = Config::infer().await?;

    // kube 2.x takes extra headers straight on the Config
    if let Some(user_agent) = custom_user_agent {
        match HeaderValue::from_str(user_agent) {
            Ok(header_value) => config
                .headers
                .push((HeaderName::from_static("user-agent"), header_value)),
            Err(e) => warn!("⚠️  Ignoring invalid user agent {:?}: {}", user_agent, e),
        }
    }

    let client = Client::try_from(config)?;
    Ok(client)
}

/// Collection response body: `{items, metadata: {resourceVersion, continue}}`
#[derive(Deserialize)]
struct RawList {
    #[serde(default)]
    items: Option<Vec<Value>>,
    #[serde(default)]
    metadata: ListMeta,
}

/// Bulk and single-object reads against the API server
#[derive(Clone)]
pub struct KubeSource {
    client: Client,
}

impl KubeSource {
    #[must_use]
    pub const fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PageSource for KubeSource {
    async fn list_page(
        &self,
        kind: &ResourceKind,
        query: &WatchQuery,
        page_size: u32,
        continue_token: Option<&str>,
    ) -> Result<Page, WatchError> {
        let request = list_request(kind, query, page_size, continue_token)?;
        debug!("📥 GET {}", request.uri());
        let list: RawList = self.client.request(request).await?;
        Ok(Page {
            items: list.items.unwrap_or_default(),
            resource_version: list.metadata.resource_version.unwrap_or_default(),
            continue_token: list.metadata.continue_.filter(|token| !token.is_empty()),
        })
    }

    async fn get_object(&self, kind: &ResourceKind, query: &WatchQuery) -> Result<Value, WatchError> {
        let request = object_request(kind, query)?;
        debug!("📥 GET {}", request.uri());
        Ok(self.client.request::<Value>(request).await?)
    }
}

/// Opens watch streams through the client's own HTTP stack.
///
/// Accepts either a bare `path?query` or an absolute `ws(s)://` URL, of
/// which only the path and query are used.
#[derive(Clone)]
pub struct KubeConnector {
    client: Client,
}

impl KubeConnector {
    #[must_use]
    pub const fn new(client: Client) -> Self {
        Self { client }
    }
}

fn path_and_query(url: &str) -> Result<String, TransportError> {
    let uri: Uri = url.parse().map_err(|e: http::uri::InvalidUri| TransportError::Connect(e.to_string()))?;
    uri.path_and_query()
        .map(ToString::to_string)
        .ok_or_else(|| TransportError::Connect(format!("no path in {url}")))
}

#[async_trait]
impl Connector for KubeConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Socket>, TransportError> {
        let request = http::Request::get(path_and_query(url)?)
            .body(Vec::new())
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let body = self
            .client
            .request_stream(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(Box::new(LineSocket {
            lines: body.lines().boxed(),
            ended: false,
        }))
    }
}

/// Newline-delimited watch body presented as a socket of text frames
struct LineSocket {
    lines: BoxStream<'static, std::io::Result<String>>,
    ended: bool,
}

#[async_trait]
impl Socket for LineSocket {
    async fn recv(&mut self) -> Option<SocketFrame> {
        if self.ended {
            return None;
        }
        match self.lines.next().await {
            Some(Ok(line)) => Some(SocketFrame::Text(line)),
            Some(Err(e)) => {
                self.ended = true;
                Some(SocketFrame::Close {
                    code: CLOSE_ABNORMAL,
                    reason: e.to_string(),
                })
            }
            None => {
                self.ended = true;
                Some(SocketFrame::Close {
                    code: CLOSE_NORMAL,
                    reason: "watch ended".to_string(),
                })
            }
        }
    }

    async fn send(&mut self, _data: String) -> Result<(), TransportError> {
        Err(TransportError::SendUnsupported)
    }

    async fn close(&mut self) {
        self.ended = true;
        self.lines = futures::stream::empty().boxed();
    }
}
