use anyhow::{Context, anyhow};
use chrono::Local;
use clap::Parser;
use itertools::Itertools;
use kwatch::k8s::USER_AGENT;
use kwatch::k8s::client::{self, KubeConnector, KubeSource};
use kwatch::k8s::watch::config::{DEFAULT_FLUSH_INTERVAL_MS, DEFAULT_PAGE_SIZE};
use kwatch::k8s::watch::store::WatchData;
use kwatch::k8s::watch::{
    KindCatalog, KindRef, ResourceStore, StoreAdapter, SubscriptionRegistry, SyncPolicy, WatchConfig,
    WatchQuery, WatchResult,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Watch one Kubernetes collection or object and print every change
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Resource kind as group/version/Kind, or version/Kind for core kinds
    #[arg(short, long, default_value = "v1/Pod")]
    kind: String,

    /// Namespace to watch; all namespaces when omitted
    #[arg(short, long)]
    namespace: Option<String>,

    /// Label selector, e.g. app=web,tier in (a,b)
    #[arg(short = 'l', long)]
    selector: Option<String>,

    /// Field selector, e.g. status.phase=Running
    #[arg(long)]
    field_selector: Option<String>,

    /// Watch a single object by name
    #[arg(long)]
    name: Option<String>,

    /// Read only the first N items
    #[arg(long)]
    limit: Option<u32>,

    /// Items per page during the initial read
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    page_size: u32,

    /// Coalesce up to N stream events between flushes (0 delivers each at once)
    #[arg(long, default_value_t = 0)]
    buffer: usize,

    /// Buffer flush interval in milliseconds
    #[arg(long, default_value_t = DEFAULT_FLUSH_INTERVAL_MS)]
    flush_ms: u64,

    /// Fall back to polling if the stream is not open within this many seconds
    #[arg(long)]
    connect_timeout_secs: Option<u64>,

    /// Cluster label kept in the subscription identity
    #[arg(long)]
    cluster: Option<String>,
}

impl Args {
    fn config(&self) -> WatchConfig {
        let mut config = WatchConfig {
            page_size: self.page_size,
            ..WatchConfig::default()
        };
        config.transport.buffer_capacity = self.buffer;
        config.transport.flush_interval = Duration::from_millis(self.flush_ms);
        config.transport.connect_timeout = self.connect_timeout_secs.map(Duration::from_secs);
        config
    }

    fn query(&self) -> WatchQuery {
        let mut query = self.name.as_deref().map_or_else(WatchQuery::list, WatchQuery::object);
        if let Some(namespace) = &self.namespace {
            query = query.namespace(namespace);
        }
        if let Some(selector) = &self.selector {
            query = query.labels(selector);
        }
        if let Some(selector) = &self.field_selector {
            query = query.fields(selector);
        }
        if let Some(limit) = self.limit {
            query = query.limit(limit);
        }
        if let Some(cluster) = &self.cluster {
            query = query.cluster(cluster);
        }
        query
    }
}

fn name_of(object: &k8s_openapi::serde_json::Value) -> &str {
    object["metadata"]["name"].as_str().unwrap_or("?")
}

fn describe(result: &WatchResult) -> String {
    let data = match &result.data {
        WatchData::List(items) if items.len() > 5 => {
            format!("{} items: {}, ...", items.len(), items.iter().take(5).map(name_of).join(", "))
        }
        WatchData::List(items) => format!("{} items: {}", items.len(), items.iter().map(name_of).join(", ")),
        WatchData::Object(object) => format!("object {}", name_of(object)),
    };
    let error = result
        .error
        .as_ref()
        .map_or_else(String::new, |e| format!(" error=\"{e}\""));
    format!(
        "{} loaded={} {}{}",
        Local::now().format("%H:%M:%S%.3f"),
        result.loaded,
        data,
        error
    )
}

fn discovery_outcome(joined: Result<kwatch::error::Result<usize>, JoinError>) -> anyhow::Result<usize> {
    let count = joined
        .context("discovery task")?
        .context("discovering resource kinds")?;
    info!("📚 Discovered {} resource kinds", count);
    Ok(count)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kwatch=info")))
        .with_writer(std::io::stderr)
        .init();

    let _ = rustls::crypto::CryptoProvider::install_default(rustls::crypto::aws_lc_rs::default_provider());

    let kind = KindRef::parse(&args.kind).ok_or_else(|| anyhow!("invalid kind {:?}", args.kind))?;
    let client = client::new(Some(USER_AGENT)).await.context("creating kube client")?;

    let catalog = Arc::new(KindCatalog::new());
    let mut discovery = {
        let catalog = catalog.clone();
        let client = client.clone();
        tokio::spawn(async move { catalog.discover(client).await })
    };

    let policy = SyncPolicy::new(
        Arc::new(KubeSource::new(client.clone())),
        Arc::new(KubeConnector::new(client)),
        args.config(),
    );
    let registry = Arc::new(SubscriptionRegistry::new(Arc::new(ResourceStore::new())));
    let adapter = StoreAdapter::new(registry, catalog, policy);

    let mut handle = adapter.subscribe(&kind, args.query());
    info!("👀 Watching {}", handle.id());
    println!("{}", describe(&handle.current()));

    let mut settled = false;
    let mut discovered = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Interrupted, unsubscribing");
                break;
            }
            joined = &mut discovery, if !discovered => {
                discovered = true;
                if let Err(e) = discovery_outcome(joined) {
                    // the kind can never resolve without a catalog
                    error!("❌ {:#}", e);
                    handle.unsubscribe();
                    return Err(e);
                }
            }
            next = handle.changed(), if !settled => match next {
                Some(result) => println!("{}", describe(&result)),
                // unknown kind: the last answer stands until Ctrl-C
                None => settled = true,
            },
        }
    }

    handle.unsubscribe();
    Ok(())
}
