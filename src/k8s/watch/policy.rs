/**
 * Sync policy: streaming with a polling fallback
 *
 * Decided once per subscription at start. Kinds that support the `watch`
 * verb get an initial paginated read whose final resourceVersion seeds a
 * streaming transport; everything else, and any stream that cannot be kept
 * alive, is re-read on a timer.
 */
use super::config::WatchConfig;
use super::errors::WatchError;
use super::kinds::ResourceKind;
use super::paginator::{PageSource, Paginator, ReadOutcome};
use super::query::{StreamEndpoint, WatchQuery, watch_path};
use super::registry::SubscriptionContext;
use super::store::{Change, StoreEvent, WatchData, resource_version_of};
use super::transport::{Connector, DestroyReason, Transport, TransportEvent};
use k8s_openapi::serde_json::{self, Value};
use serde::Deserialize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Streaming,
    Polling,
}

impl SyncMode {
    #[must_use]
    pub fn for_kind(kind: &ResourceKind) -> Self {
        if kind.supports_watch() {
            Self::Streaming
        } else {
            Self::Polling
        }
    }
}

/// How a live tail ended
#[derive(Debug, Clone, PartialEq, Eq)]
enum TailOutcome {
    Released,
    /// The server no longer has our resourceVersion; relist
    Expired,
    /// The transport gave up; degrade to polling
    Failed(String),
}

/// One decoded line of a watch stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamLine {
    Change(Change),
    Bookmark(String),
    Error { code: Option<u16>, message: String },
}

#[derive(Deserialize)]
struct RawWatchEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    object: Value,
}

/// Decode one newline-delimited watch event
///
/// # Errors
///
/// Returns the decode error for malformed lines or unknown event types
pub fn parse_line(line: &str) -> Result<StreamLine, serde_json::Error> {
    let raw: RawWatchEvent = serde_json::from_str(line)?;
    match raw.event_type.as_str() {
        "ADDED" => Ok(StreamLine::Change(Change::Added(raw.object))),
        "MODIFIED" => Ok(StreamLine::Change(Change::Modified(raw.object))),
        "DELETED" => Ok(StreamLine::Change(Change::Deleted(raw.object))),
        "BOOKMARK" => Ok(StreamLine::Bookmark(
            resource_version_of(&raw.object).unwrap_or_default().to_string(),
        )),
        "ERROR" => Ok(StreamLine::Error {
            code: raw.object["code"].as_u64().and_then(|c| u16::try_from(c).ok()),
            message: raw.object["message"].as_str().unwrap_or_default().to_string(),
        }),
        other => Err(serde::de::Error::custom(format!("unknown watch event type {other}"))),
    }
}

/// Starts and runs the sync task behind each new subscription
#[derive(Clone)]
pub struct SyncPolicy {
    source: Arc<dyn PageSource>,
    connector: Arc<dyn Connector>,
    endpoint: Option<StreamEndpoint>,
    config: WatchConfig,
}

impl SyncPolicy {
    #[must_use]
    pub fn new(source: Arc<dyn PageSource>, connector: Arc<dyn Connector>, config: WatchConfig) -> Self {
        Self {
            source,
            connector,
            endpoint: None,
            config,
        }
    }

    /// Hand the connector absolute `ws(s)://` URLs instead of bare paths
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: StreamEndpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Spawn the sync task for a freshly acquired subscription
    pub fn start(&self, ctx: SubscriptionContext, kind: ResourceKind, query: WatchQuery) -> JoinHandle<()> {
        let policy = self.clone();
        tokio::spawn(async move { policy.run(ctx, kind, query).await })
    }

    async fn run(self, ctx: SubscriptionContext, kind: ResourceKind, query: WatchQuery) {
        let mode = SyncMode::for_kind(&kind);
        debug!("🔀 {} syncs by {:?}", ctx.id(), mode);
        let mut read_now = true;
        if mode == SyncMode::Streaming {
            match self.stream(&ctx, &kind, &query).await {
                TailOutcome::Released | TailOutcome::Expired => return,
                TailOutcome::Failed(reason) => {
                    warn!("⚠️  Streaming for {} failed ({}), falling back to polling", ctx.id(), reason);
                    ctx.dispatch(StoreEvent::Error(WatchError::ConnectionLost(reason)));
                    // the initial read already landed; the next read is a regular poll
                    read_now = false;
                }
            }
        }
        self.poll(&ctx, &kind, &query, read_now).await;
        debug!("🏁 Sync task for {} finished", ctx.id());
    }

    fn paginator(&self, kind: &ResourceKind, query: &WatchQuery) -> Paginator {
        Paginator::new(self.source.clone(), kind.clone(), query.clone(), self.config.page_size)
    }

    /// Initial read then live tail, relisting whenever the stream expires.
    /// Never returns `Expired`.
    async fn stream(&self, ctx: &SubscriptionContext, kind: &ResourceKind, query: &WatchQuery) -> TailOutcome {
        loop {
            let Some(resource_version) = self.read_until_loaded(ctx, kind, query).await else {
                return TailOutcome::Released;
            };
            match self.tail(ctx, kind, query, resource_version).await {
                TailOutcome::Expired => info!("♻️  Watch for {} expired, relisting", ctx.id()),
                outcome => return outcome,
            }
        }
    }

    /// Repeat the initial read, spaced by the retry interval, until it
    /// succeeds. Returns the handoff resourceVersion, or `None` on release.
    async fn read_until_loaded(
        &self,
        ctx: &SubscriptionContext,
        kind: &ResourceKind,
        query: &WatchQuery,
    ) -> Option<String> {
        loop {
            let retry = match self.read_once(ctx, kind, query).await {
                Ok(Some(resource_version)) => return Some(resource_version),
                Ok(None) => return None,
                Err(error) => {
                    warn!("❌ Initial read for {} failed: {}", ctx.id(), error);
                    ctx.dispatch(StoreEvent::Error(error));
                    self.interval_for(query)
                }
            };
            if !ctx.sleep(retry).await {
                return None;
            }
        }
    }

    /// One full read: every page of a list, or the single object.
    async fn read_once(
        &self,
        ctx: &SubscriptionContext,
        kind: &ResourceKind,
        query: &WatchQuery,
    ) -> Result<Option<String>, WatchError> {
        let paginator = self.paginator(kind, query);
        if query.is_object() {
            let object = paginator.read_object().await?;
            let resource_version = resource_version_of(&object).map(ToString::to_string);
            let dispatched = ctx.dispatch(StoreEvent::Replace {
                data: WatchData::Object(object),
                resource_version: resource_version.clone(),
                complete: true,
            });
            return Ok(dispatched.then(|| resource_version.unwrap_or_default()));
        }

        match paginator
            .initial_read(ctx.liveness(), |event| {
                ctx.dispatch(event);
            })
            .await
        {
            ReadOutcome::Completed {
                resource_version,
                pages,
            } => {
                debug!("📚 Initial read for {} done in {} pages at rv {}", ctx.id(), pages, resource_version);
                Ok(ctx.is_live().then_some(resource_version))
            }
            ReadOutcome::Failed(error) => Err(error),
            ReadOutcome::Abandoned => Ok(None),
        }
    }

    const fn interval_for(&self, query: &WatchQuery) -> std::time::Duration {
        if query.is_object() {
            self.config.object_poll_interval
        } else {
            self.config.list_poll_interval
        }
    }

    /// Follow the stream from `resource_version` until released, expired or failed
    async fn tail(
        &self,
        ctx: &SubscriptionContext,
        kind: &ResourceKind,
        query: &WatchQuery,
        resource_version: String,
    ) -> TailOutcome {
        let first = match watch_path(kind, query, &resource_version) {
            Ok(path) => path,
            Err(e) => return TailOutcome::Failed(e.to_string()),
        };
        let resume = Arc::new(Mutex::new(resource_version));
        let url = {
            let resume = resume.clone();
            let kind = kind.clone();
            let query = query.clone();
            let endpoint = self.endpoint.clone();
            move || {
                let resource_version = resume.lock().unwrap_or_else(PoisonError::into_inner).clone();
                let path = watch_path(&kind, &query, &resource_version).unwrap_or_else(|_| first.clone());
                endpoint.as_ref().map_or_else(|| path.clone(), |e| e.url(&path))
            }
        };

        let (handle, mut events) = Transport::open(self.connector.clone(), url, self.config.transport.clone());
        if !ctx.register_transport(handle.clone()) {
            return TailOutcome::Released;
        }

        loop {
            let event = tokio::select! {
                () = ctx.released() => return TailOutcome::Released,
                event = events.recv() => event,
            };
            let lines = match event {
                Some(TransportEvent::Open) => {
                    debug!("🔌 Stream open for {}", ctx.id());
                    continue;
                }
                Some(TransportEvent::Message(line)) => vec![line],
                Some(TransportEvent::BulkMessage(lines)) => lines,
                Some(TransportEvent::Close { code, reason }) => {
                    debug!("🔌 Stream for {} closed ({} {})", ctx.id(), code, reason);
                    continue;
                }
                Some(TransportEvent::Error(e)) => {
                    debug!("⚠️  Stream error for {}: {}", ctx.id(), e);
                    continue;
                }
                Some(TransportEvent::Destroy(DestroyReason::Requested)) | None => {
                    return if ctx.is_live() {
                        TailOutcome::Failed("stream destroyed".to_string())
                    } else {
                        TailOutcome::Released
                    };
                }
                Some(TransportEvent::Destroy(reason)) => return TailOutcome::Failed(format!("{reason:?}")),
            };

            if apply_lines(ctx, &lines, &resume) {
                handle.destroy();
                return TailOutcome::Expired;
            }
        }
    }

    /// Re-read on a fixed interval until released
    async fn poll(&self, ctx: &SubscriptionContext, kind: &ResourceKind, query: &WatchQuery, mut read_now: bool) {
        let interval = self.interval_for(query);
        info!("⏱️  Polling {} every {:?}", ctx.id(), interval);
        loop {
            if read_now {
                match self.read_once(ctx, kind, query).await {
                    Ok(Some(_)) => {}
                    Ok(None) => return,
                    Err(error) => {
                        warn!("❌ Poll for {} failed: {}", ctx.id(), error);
                        ctx.dispatch(StoreEvent::Error(error));
                    }
                }
            }
            read_now = true;
            if !ctx.sleep(interval).await {
                return;
            }
        }
    }
}

/// Apply a delivery of stream lines. Consecutive changes are coalesced into
/// one store mutation. Returns true when the stream reported 410 Gone.
fn apply_lines(ctx: &SubscriptionContext, lines: &[String], resume: &Mutex<String>) -> bool {
    let mut changes = Vec::new();
    let flush = |changes: &mut Vec<Change>| {
        if !changes.is_empty() {
            ctx.dispatch(StoreEvent::Modified(std::mem::take(changes)));
        }
    };
    let advance = |resource_version: &str| {
        if !resource_version.is_empty() {
            *resume.lock().unwrap_or_else(PoisonError::into_inner) = resource_version.to_string();
        }
    };

    for line in lines.iter().filter(|l| !l.trim().is_empty()) {
        match parse_line(line) {
            Ok(StreamLine::Change(change)) => {
                if let Some(rv) = resource_version_of(change.object()) {
                    advance(rv);
                }
                changes.push(change);
            }
            Ok(StreamLine::Bookmark(resource_version)) => {
                flush(&mut changes);
                advance(&resource_version);
                ctx.dispatch(StoreEvent::Bookmark(resource_version));
            }
            Ok(StreamLine::Error { code: Some(410), message }) => {
                flush(&mut changes);
                debug!("⌛ {} got 410 Gone: {}", ctx.id(), message);
                return true;
            }
            Ok(StreamLine::Error { code, message }) => {
                flush(&mut changes);
                ctx.dispatch(StoreEvent::Error(WatchError::fetch(code, message)));
            }
            Err(e) => warn!("⚠️  Skipping undecodable watch event for {}: {}", ctx.id(), e),
        }
    }
    flush(&mut changes);
    false
}
