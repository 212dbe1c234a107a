/**
 * Resource-kind registry
 *
 * Answers "does kind X support watch?" and "is kind X namespaced?" for the
 * sync policy, and tracks whether discovery has finished so unknown kinds
 * are only reported once the answer is final.
 */
use crate::error::Result;
use kube::Client;
use kube::discovery::{Discovery, Scope, verbs};
use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};
use tokio::sync::watch;
use tracing::{debug, info};

/// Group/version/kind triple identifying a resource kind
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KindRef {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl KindRef {
    #[must_use]
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        }
    }

    /// Parse `Kind`-qualified references: `v1/Pod`, `apps/v1/Deployment`, or
    /// the `~`-separated form `apps~v1~Deployment` (`core` for the core group).
    #[must_use]
    pub fn parse(reference: &str) -> Option<Self> {
        let sep = if reference.contains('~') { '~' } else { '/' };
        let parts: Vec<&str> = reference.split(sep).map(str::trim).collect();
        if parts.iter().any(|p| p.is_empty()) {
            return None;
        }
        match parts.as_slice() {
            [version, kind] => Some(Self::new("", version, kind)),
            [group, version, kind] => {
                let group = if *group == "core" { "" } else { group };
                Some(Self::new(group, version, kind))
            }
            _ => None,
        }
    }
}

impl fmt::Display for KindRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let group = if self.group.is_empty() { "core" } else { &self.group };
        write!(f, "{group}~{}~{}", self.version, self.kind)
    }
}

/// What the client knows about one resource kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceKind {
    pub reference: KindRef,
    pub plural: String,
    pub namespaced: bool,
    pub verbs: Vec<String>,
}

impl ResourceKind {
    /// A namespaced kind supporting `list`, `get` and `watch`
    #[must_use]
    pub fn new(reference: KindRef, plural: &str) -> Self {
        Self {
            reference,
            plural: plural.to_string(),
            namespaced: true,
            verbs: vec![
                verbs::LIST.to_string(),
                verbs::GET.to_string(),
                verbs::WATCH.to_string(),
            ],
        }
    }

    #[must_use]
    pub fn cluster_scoped(mut self) -> Self {
        self.namespaced = false;
        self
    }

    #[must_use]
    pub fn with_verbs(mut self, supported: &[&str]) -> Self {
        self.verbs = supported.iter().map(ToString::to_string).collect();
        self
    }

    #[must_use]
    pub fn supports_watch(&self) -> bool {
        self.verbs.iter().any(|v| v == verbs::WATCH)
    }

    /// Collection path, e.g. `/apis/apps/v1/namespaces/default/deployments`.
    ///
    /// The namespace segment is dropped for cluster-scoped kinds and when no
    /// namespace is given (all-namespaces read).
    #[must_use]
    pub fn collection_path(&self, namespace: Option<&str>) -> String {
        let prefix = if self.reference.group.is_empty() {
            format!("/api/{}", self.reference.version)
        } else {
            format!("/apis/{}/{}", self.reference.group, self.reference.version)
        };
        match namespace {
            Some(ns) if self.namespaced && !ns.is_empty() => {
                format!("{prefix}/namespaces/{ns}/{}", self.plural)
            }
            _ => format!("{prefix}/{}", self.plural),
        }
    }
}

/// Registry of resource kinds plus a "discovery finished" flag
#[derive(Debug)]
pub struct KindCatalog {
    kinds: RwLock<HashMap<KindRef, ResourceKind>>,
    loaded: watch::Sender<bool>,
}

impl Default for KindCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl KindCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self {
            kinds: RwLock::new(HashMap::new()),
            loaded: watch::Sender::new(false),
        }
    }

    pub fn insert(&self, kind: ResourceKind) {
        let mut kinds = self.kinds.write().unwrap_or_else(PoisonError::into_inner);
        kinds.insert(kind.reference.clone(), kind);
    }

    #[must_use]
    pub fn lookup(&self, reference: &KindRef) -> Option<ResourceKind> {
        let kinds = self.kinds.read().unwrap_or_else(PoisonError::into_inner);
        kinds.get(reference).cloned()
    }

    /// Flag discovery as complete; wakes every consumer waiting on an unknown kind
    pub fn mark_loaded(&self) {
        self.loaded.send_replace(true);
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        *self.loaded.borrow()
    }

    #[must_use]
    pub fn loaded_receiver(&self) -> watch::Receiver<bool> {
        self.loaded.subscribe()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.kinds.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Populate the catalog from the API server's discovery endpoints and
    /// mark it loaded.
    ///
    /// # Errors
    ///
    /// Returns an error if discovery against the cluster fails
    pub async fn discover(&self, client: Client) -> Result<usize> {
        let discovery = Discovery::new(client).run().await?;
        let mut count = 0;
        for group in discovery.groups() {
            for (resource, caps) in group.recommended_resources() {
                let reference = KindRef::new(&resource.group, &resource.version, &resource.kind);
                debug!("📚 Discovered kind {} ({})", reference, resource.plural);
                self.insert(ResourceKind {
                    reference,
                    plural: resource.plural.clone(),
                    namespaced: matches!(caps.scope, Scope::Namespaced),
                    verbs: caps.operations.clone(),
                });
                count += 1;
            }
        }
        self.mark_loaded();
        info!("📚 Kind catalog loaded with {} kinds", count);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_ref_parsing() {
        assert_eq!(KindRef::parse("v1/Pod"), Some(KindRef::new("", "v1", "Pod")));
        assert_eq!(
            KindRef::parse("apps/v1/Deployment"),
            Some(KindRef::new("apps", "v1", "Deployment"))
        );
        assert_eq!(KindRef::parse("core~v1~Pod"), Some(KindRef::new("", "v1", "Pod")));
        assert_eq!(KindRef::parse("Pod"), None);
        assert_eq!(KindRef::parse("apps//Deployment"), None);
        assert_eq!(KindRef::new("", "v1", "Pod").to_string(), "core~v1~Pod");
    }

    #[test]
    fn test_collection_paths() {
        let pods = ResourceKind::new(KindRef::new("", "v1", "Pod"), "pods");
        assert_eq!(pods.collection_path(Some("default")), "/api/v1/namespaces/default/pods");
        assert_eq!(pods.collection_path(None), "/api/v1/pods");

        let nodes = ResourceKind::new(KindRef::new("", "v1", "Node"), "nodes").cluster_scoped();
        assert_eq!(nodes.collection_path(Some("default")), "/api/v1/nodes");

        let deployments = ResourceKind::new(KindRef::new("apps", "v1", "Deployment"), "deployments");
        assert_eq!(
            deployments.collection_path(Some("prod")),
            "/apis/apps/v1/namespaces/prod/deployments"
        );
    }

    #[test]
    fn test_watch_verb_detection() {
        let pods = ResourceKind::new(KindRef::new("", "v1", "Pod"), "pods");
        assert!(pods.supports_watch());
        let reviews = pods.with_verbs(&["create"]);
        assert!(!reviews.supports_watch());
    }

    #[tokio::test]
    async fn test_catalog_loaded_flag() {
        let catalog = KindCatalog::new();
        let mut rx = catalog.loaded_receiver();
        assert!(!catalog.is_loaded());
        assert!(catalog.is_empty());

        catalog.insert(ResourceKind::new(KindRef::new("", "v1", "Pod"), "pods"));
        assert!(catalog.lookup(&KindRef::new("", "v1", "Pod")).is_some());

        catalog.mark_loaded();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        assert!(catalog.is_loaded());
    }
}
