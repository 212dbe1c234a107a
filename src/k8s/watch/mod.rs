/**
 * Resource watch and synchronization layer
 *
 * Keeps a local reactive store consistent with the API server: paginated
 * bulk reads, streaming tails with reconnect and backoff, a polling
 * fallback, and reference-counted sharing of one network subscription
 * between any number of consumers.
 */
pub mod adapter;
pub mod config;
pub mod errors;
pub mod kinds;
pub mod paginator;
pub mod policy;
pub mod query;
pub mod registry;
pub mod store;
pub mod transport;

pub use adapter::{StoreAdapter, WatchHandle, WatchResult};
pub use config::WatchConfig;
pub use errors::{TransportError, WatchError};
pub use kinds::{KindCatalog, KindRef, ResourceKind};
pub use paginator::{Page, PageSource, Paginator};
pub use policy::{SyncMode, SyncPolicy};
pub use query::{Selector, StreamEndpoint, SubscriptionId, WatchQuery};
pub use registry::{SubscriptionContext, SubscriptionRegistry};
pub use store::{ResourceStore, StoreEvent, WatchData, WatchSlot};
pub use transport::{Connector, Socket, SocketFrame, Transport, TransportEvent, TransportOptions};
