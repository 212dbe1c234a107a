/**
 * Reference-counted subscription multiplexer
 *
 * For each subscription id at most one sync task (and its transport or poll
 * timer) runs, however many consumers acquired it. The subscription table
 * and the transport handles it owns are private to the registry; sync tasks
 * reach the store only through their `SubscriptionContext`, which rechecks
 * liveness under the table lock before every mutation.
 */
use super::query::SubscriptionId;
use super::store::{ResourceStore, StoreEvent, WatchSlot};
use super::transport::TransportHandle;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

struct Entry {
    ref_count: usize,
    generation: u64,
    liveness: CancellationToken,
    transports: Vec<TransportHandle>,
}

#[derive(Default)]
struct Table {
    entries: HashMap<SubscriptionId, Entry>,
    next_generation: u64,
}

impl Table {
    fn live_entry(&mut self, id: &SubscriptionId, generation: u64) -> Option<&mut Entry> {
        self.entries
            .get_mut(id)
            .filter(|entry| entry.generation == generation && !entry.liveness.is_cancelled())
    }
}

fn lock(table: &Mutex<Table>) -> MutexGuard<'_, Table> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A sync task's view of the subscription it serves
#[derive(Clone)]
pub struct SubscriptionContext {
    id: SubscriptionId,
    generation: u64,
    liveness: CancellationToken,
    store: Arc<ResourceStore>,
    table: Weak<Mutex<Table>>,
}

impl SubscriptionContext {
    #[must_use]
    pub const fn id(&self) -> &SubscriptionId {
        &self.id
    }

    /// True while at least one consumer holds the subscription
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.liveness.is_cancelled()
    }

    #[must_use]
    pub const fn liveness(&self) -> &CancellationToken {
        &self.liveness
    }

    /// Resolves once the last consumer released the subscription
    pub async fn released(&self) {
        self.liveness.cancelled().await;
    }

    /// Apply an event to this subscription's slot.
    ///
    /// A no-op returning false once the subscription was released, even if
    /// the same id has since been acquired again by someone else.
    pub fn dispatch(&self, event: StoreEvent) -> bool {
        let Some(table) = self.table.upgrade() else {
            return false;
        };
        let mut table = lock(&table);
        if table.live_entry(&self.id, self.generation).is_none() {
            trace!("Dropping {:?} for released subscription {}", event, self.id);
            return false;
        }
        self.store.dispatch(&self.id, event)
    }

    /// Hand a transport to the registry so release destroys it synchronously.
    /// A transport registered after release is destroyed on the spot.
    pub fn register_transport(&self, handle: TransportHandle) -> bool {
        let Some(table) = self.table.upgrade() else {
            handle.destroy();
            return false;
        };
        let mut table = lock(&table);
        match table.live_entry(&self.id, self.generation) {
            Some(entry) => {
                entry.transports.retain(|t| !t.is_destroyed());
                entry.transports.push(handle);
                true
            }
            None => {
                drop(table);
                handle.destroy();
                false
            }
        }
    }

    /// Timer that stops early on release. Returns false if released.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            () = self.liveness.cancelled() => false,
            () = sleep(duration) => self.is_live(),
        }
    }
}

/// Owner of every live subscription
pub struct SubscriptionRegistry {
    table: Arc<Mutex<Table>>,
    store: Arc<ResourceStore>,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new(store: Arc<ResourceStore>) -> Self {
        Self {
            table: Arc::new(Mutex::new(Table::default())),
            store,
        }
    }

    #[must_use]
    pub const fn store(&self) -> &Arc<ResourceStore> {
        &self.store
    }

    /// Attach a consumer to `id`.
    ///
    /// The first acquire creates the slot, emits `Started` and calls `start`
    /// exactly once; later acquires only bump the count and see the cached
    /// slot immediately. Returns whether `start` ran.
    pub fn acquire<F>(&self, id: &SubscriptionId, start: F) -> bool
    where
        F: FnOnce(SubscriptionContext),
    {
        let context = {
            let mut table = lock(&self.table);
            if let Some(entry) = table.entries.get_mut(id) {
                entry.ref_count += 1;
                debug!("➕ {} now has {} consumers", id, entry.ref_count);
                return false;
            }

            table.next_generation += 1;
            let generation = table.next_generation;
            let liveness = CancellationToken::new();
            table.entries.insert(
                id.clone(),
                Entry {
                    ref_count: 1,
                    generation,
                    liveness: liveness.clone(),
                    transports: Vec::new(),
                },
            );
            self.store.set(id, WatchSlot::new(id.is_object()).with_generation(generation));
            self.store.dispatch(id, StoreEvent::Started);

            SubscriptionContext {
                id: id.clone(),
                generation,
                liveness,
                store: self.store.clone(),
                table: Arc::downgrade(&self.table),
            }
        };

        info!("▶️  Starting subscription {}", id);
        start(context);
        true
    }

    /// Detach a consumer from `id`.
    ///
    /// When the count reaches zero the transports are destroyed, the poll
    /// timer is cancelled, `Stopped` is emitted and the slot is removed, all
    /// before returning. Returns whether the subscription stopped.
    pub fn release(&self, id: &SubscriptionId) -> bool {
        let mut table = lock(&self.table);
        let Some(entry) = table.entries.get_mut(id) else {
            warn!("⚠️  Release of unknown subscription {}", id);
            return false;
        };
        entry.ref_count = entry.ref_count.saturating_sub(1);
        if entry.ref_count > 0 {
            debug!("➖ {} now has {} consumers", id, entry.ref_count);
            return false;
        }

        if let Some(entry) = table.entries.remove(id) {
            entry.liveness.cancel();
            for transport in &entry.transports {
                transport.destroy();
            }
        }
        self.store.dispatch(id, StoreEvent::Stopped);
        self.store.remove(id);
        drop(table);

        info!("⏹️  Stopped subscription {}", id);
        true
    }

    #[must_use]
    pub fn ref_count(&self, id: &SubscriptionId) -> usize {
        lock(&self.table).entries.get(id).map_or(0, |entry| entry.ref_count)
    }

    #[must_use]
    pub fn active_subscriptions(&self) -> usize {
        lock(&self.table).entries.len()
    }

    #[must_use]
    pub fn subscription_ids(&self) -> Vec<SubscriptionId> {
        lock(&self.table).entries.keys().cloned().collect()
    }
}

impl Drop for SubscriptionRegistry {
    fn drop(&mut self) {
        let mut table = lock(&self.table);
        for (_, entry) in table.entries.drain() {
            entry.liveness.cancel();
            for transport in &entry.transports {
                transport.destroy();
            }
        }
    }
}
