/**
 * Consumer-facing boundary of the watch layer
 *
 * `StoreAdapter::subscribe` hands back a `WatchHandle` whose snapshots are
 * `(data, loaded, error)` tuples. Snapshots are memoized per subscription:
 * while the underlying data is unchanged every consumer of that
 * subscription sees the same `Arc`. Dropping the handle detaches it.
 */
use super::errors::WatchError;
use super::kinds::{KindCatalog, KindRef};
use super::policy::SyncPolicy;
use super::query::{SubscriptionId, WatchQuery};
use super::registry::SubscriptionRegistry;
use super::store::{WatchData, WatchSlot};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::debug;

/// What a consumer sees
#[derive(Debug, Clone, PartialEq)]
pub struct WatchResult {
    pub data: WatchData,
    pub loaded: bool,
    pub error: Option<WatchError>,
}

impl WatchResult {
    fn unresolved(object: bool) -> Self {
        Self {
            data: WatchData::empty(object),
            loaded: false,
            error: None,
        }
    }

    fn no_model(object: bool, kind: &KindRef) -> Self {
        Self {
            data: WatchData::empty(object),
            loaded: true,
            error: Some(WatchError::NoModel { kind: kind.to_string() }),
        }
    }

    fn from_slot(slot: &WatchSlot) -> Self {
        Self {
            data: slot.data.clone(),
            loaded: slot.loaded,
            error: slot.load_error.clone(),
        }
    }
}

struct Memo {
    /// `(generation, revision)` of the slot the value was built from
    version: Option<(u64, u64)>,
    value: Arc<WatchResult>,
}

struct Inner {
    registry: Arc<SubscriptionRegistry>,
    catalog: Arc<KindCatalog>,
    policy: SyncPolicy,
    memo: Mutex<HashMap<SubscriptionId, Memo>>,
}

/// Entry point for consumers. Cheap to clone.
#[derive(Clone)]
pub struct StoreAdapter {
    inner: Arc<Inner>,
}

impl StoreAdapter {
    #[must_use]
    pub fn new(registry: Arc<SubscriptionRegistry>, catalog: Arc<KindCatalog>, policy: SyncPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                catalog,
                policy,
                memo: Mutex::new(HashMap::new()),
            }),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.inner.registry
    }

    #[must_use]
    pub fn catalog(&self) -> &Arc<KindCatalog> {
        &self.inner.catalog
    }

    /// Start watching `kind` filtered by `query`.
    ///
    /// Must be called inside a tokio runtime: the first subscriber of a
    /// query spawns its sync task. A kind missing from the catalog starts
    /// nothing; the handle waits for discovery and attaches if the kind
    /// shows up, or reports `NoModel` if it does not.
    #[must_use]
    pub fn subscribe(&self, kind: &KindRef, query: WatchQuery) -> WatchHandle {
        let id = SubscriptionId::new(kind, &query);
        let mut handle = WatchHandle {
            adapter: self.clone(),
            id,
            kind: kind.clone(),
            query,
            state: HandleState::Pending(self.inner.catalog.loaded_receiver()),
            last: None,
        };
        handle.try_attach();
        handle
    }

    fn acquire(&self, kind: &KindRef, id: &SubscriptionId, query: &WatchQuery) -> Option<watch::Receiver<WatchSlot>> {
        let resource = self.inner.catalog.lookup(kind)?;
        let policy = &self.inner.policy;
        self.inner.registry.acquire(id, |ctx| {
            policy.start(ctx, resource, query.clone());
        });
        self.inner.registry.store().subscribe(id)
    }

    fn release(&self, id: &SubscriptionId) {
        if self.inner.registry.release(id) {
            self.inner.memo.lock().unwrap_or_else(PoisonError::into_inner).remove(id);
        }
    }

    /// Drop the memo of a subscription that never started
    fn forget(&self, id: &SubscriptionId) {
        if self.inner.registry.ref_count(id) == 0 {
            self.inner.memo.lock().unwrap_or_else(PoisonError::into_inner).remove(id);
        }
    }

    /// Reuse the memoized snapshot when the slot generation and revision are
    /// unchanged or the freshly built value is deeply equal to it.
    fn resolve(
        &self,
        id: &SubscriptionId,
        version: Option<(u64, u64)>,
        build: impl FnOnce() -> WatchResult,
    ) -> Arc<WatchResult> {
        let mut memo = self.inner.memo.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = memo.get(id) {
            if version.is_some() && entry.version == version {
                return entry.value.clone();
            }
        }
        let candidate = build();
        if let Some(entry) = memo.get_mut(id) {
            if *entry.value == candidate {
                entry.version = version;
                return entry.value.clone();
            }
        }
        let value = Arc::new(candidate);
        memo.insert(
            id.clone(),
            Memo {
                version,
                value: value.clone(),
            },
        );
        value
    }
}

enum HandleState {
    /// Kind not in the catalog yet; watching the catalog's loaded flag
    Pending(watch::Receiver<bool>),
    Attached(watch::Receiver<WatchSlot>),
    Detached,
}

/// One consumer's subscription. Dropping it releases the subscription.
pub struct WatchHandle {
    adapter: StoreAdapter,
    id: SubscriptionId,
    kind: KindRef,
    query: WatchQuery,
    state: HandleState,
    last: Option<Arc<WatchResult>>,
}

impl WatchHandle {
    #[must_use]
    pub const fn id(&self) -> &SubscriptionId {
        &self.id
    }

    /// Whether this handle holds a reference on a live subscription
    #[must_use]
    pub fn is_attached(&self) -> bool {
        matches!(self.state, HandleState::Attached(_))
    }

    fn try_attach(&mut self) {
        if !matches!(self.state, HandleState::Pending(_)) {
            return;
        }
        if let Some(rx) = self.adapter.acquire(&self.kind, &self.id, &self.query) {
            debug!("🔗 Consumer attached to {}", self.id);
            self.state = HandleState::Attached(rx);
        }
    }

    /// Current snapshot, available synchronously
    pub fn current(&mut self) -> Arc<WatchResult> {
        self.try_attach();
        let object = self.query.is_object();
        let snapshot = match &mut self.state {
            HandleState::Attached(rx) => {
                let slot = rx.borrow_and_update();
                self.adapter
                    .resolve(&self.id, Some((slot.generation, slot.revision)), || WatchResult::from_slot(&slot))
            }
            HandleState::Pending(rx) => {
                let loaded = *rx.borrow_and_update();
                let kind = &self.kind;
                self.adapter.resolve(&self.id, None, || {
                    if loaded {
                        WatchResult::no_model(object, kind)
                    } else {
                        WatchResult::unresolved(object)
                    }
                })
            }
            HandleState::Detached => self
                .last
                .clone()
                .unwrap_or_else(|| Arc::new(WatchResult::unresolved(object))),
        };
        self.last = Some(snapshot.clone());
        snapshot
    }

    /// Wait for the next snapshot that differs from the last one returned.
    /// `None` once the subscription can no longer change.
    pub async fn changed(&mut self) -> Option<Arc<WatchResult>> {
        loop {
            let alive = match &mut self.state {
                HandleState::Pending(rx) => rx.changed().await.is_ok(),
                HandleState::Attached(rx) => rx.changed().await.is_ok(),
                HandleState::Detached => false,
            };
            if !alive {
                return None;
            }
            let previous = self.last.clone();
            let next = self.current();
            if previous.as_ref().is_none_or(|p| !Arc::ptr_eq(p, &next)) {
                return Some(next);
            }
        }
    }

    /// Detach now. Equivalent to dropping the handle.
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        match std::mem::replace(&mut self.state, HandleState::Detached) {
            HandleState::Attached(_) => {
                debug!("🔓 Consumer detached from {}", self.id);
                self.adapter.release(&self.id);
            }
            HandleState::Pending(_) => self.adapter.forget(&self.id),
            HandleState::Detached => {}
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.detach();
    }
}
