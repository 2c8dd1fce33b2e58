// Protocol engine for the PV access server: resource table, object pools,
// per-client channel lifecycle, the subscription pipeline and the framer
// that drives them.
//
// Lock order, outermost first: server admission gate, client send lock,
// provisional name index, server resource table, client channel slab. Pool
// locks are leaves held only for push/pop.
use caserve_db::Database;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;

pub mod channel;
pub mod client;
pub mod dispatch;
pub mod event;
pub mod pool;
pub mod restable;
mod rw;

pub use channel::{Channel, Subscription};
pub use client::Client;
pub use dispatch::{Origin, Session};
pub use pool::{Pool, PoolStats, Recycle};
pub use restable::{Key, KeyKind, ResTable, TableError, TableStats};

pub mod ids {
    // Process-unique identifiers for log correlation.
    use std::fmt;
    use std::sync::atomic::{AtomicU64, Ordering};

    macro_rules! id_type {
        ($name:ident, $prefix:literal) => {
            #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
            pub struct $name(u64);

            impl $name {
                // Allocate the next ID in this namespace.
                pub fn next() -> Self {
                    static NEXT: AtomicU64 = AtomicU64::new(1);
                    Self(NEXT.fetch_add(1, Ordering::Relaxed))
                }

                pub fn as_u64(&self) -> u64 {
                    self.0
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, concat!($prefix, "-{}"), self.0)
                }
            }
        };
    }

    id_type!(ClientId, "client");
}

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("framing error: {0}")]
    Frame(#[from] caserve_wire::Error),
    #[error("lifetime violation: {0}")]
    LifetimeViolation(String),
    #[error("session closed")]
    Closed,
}

/// Engine tuning shared by every session.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Resource table capacity hint; the table never grows.
    pub table_size: usize,
    /// Declared payloads above this size are fatal to the connection.
    pub max_frame_bytes: usize,
    /// Outbound high-water mark per client.
    pub max_send_bytes: usize,
    pub put_notify_timeout: Duration,
    /// Objects placed on each free list at startup.
    pub preallocate: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            table_size: 4096,
            max_frame_bytes: 1024 * 1024,
            max_send_bytes: 1024 * 1024,
            put_notify_timeout: Duration::from_secs(10),
            preallocate: 64,
        }
    }
}

/// Where a channel lives: its owner and the owner's slab slot.
#[derive(Debug, Clone)]
pub(crate) struct ChannelRef {
    pub(crate) owner: Weak<Client>,
    pub(crate) slot: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerStats {
    pub clients: usize,
    pub resources: TableStats,
    pub channels: PoolStats,
    pub subscriptions: PoolStats,
}

/// Shared engine state. One per process, passed to every session.
///
/// ```
/// use caserve_core::{EngineConfig, Server};
/// use caserve_db::MemoryDatabase;
/// use std::sync::Arc;
///
/// let server = Server::new(Arc::new(MemoryDatabase::new()), EngineConfig::default())
///     .expect("server");
/// assert_eq!(server.stats().clients, 0);
/// server.shutdown();
/// ```
pub struct Server {
    me: Weak<Server>,
    pub(crate) db: Arc<dyn Database>,
    pub(crate) config: EngineConfig,
    // sid -> channel location, for every live channel of every client.
    pub(crate) resources: Mutex<ResTable<ChannelRef>>,
    // Connected clients keyed by identity.
    clients: Mutex<ResTable<Weak<Client>>>,
    pub(crate) channel_pool: Pool<Channel>,
    pub(crate) event_pool: Pool<Subscription>,
    next_sid: AtomicU32,
    pub(crate) next_event_id: AtomicU64,
    // Owns channels created by datagram searches until a stream claims them.
    provisional: Arc<Client>,
    // PV name -> sid of the provisional channel answering searches for it.
    pub(crate) provisional_names: Mutex<ResTable<u32>>,
    // False once shutdown begins. Each request holds a read guard while it
    // runs, so shutdown waits for requests already in flight.
    admission: RwLock<bool>,
    // Runtime that parks notify requests when the caller has none.
    runtime: Option<Handle>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Server {
    /// Create the engine. When called inside a tokio runtime, that runtime
    /// also serves notify completions for sessions driven from plain threads.
    pub fn new(db: Arc<dyn Database>, config: EngineConfig) -> Result<Arc<Self>, TableError> {
        let resources = ResTable::create(config.table_size)?;
        let clients = ResTable::create(config.table_size)?;
        let provisional_names = ResTable::create(config.table_size)?;
        let channel_pool = Pool::with_preallocated("channel", config.preallocate);
        let event_pool = Pool::with_preallocated("subscription", config.preallocate);
        let provisional = Arc::new(Client::new("provisional", config.max_send_bytes));
        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            db,
            config,
            resources: Mutex::new(resources),
            clients: Mutex::new(clients),
            channel_pool,
            event_pool,
            next_sid: AtomicU32::new(1),
            next_event_id: AtomicU64::new(1),
            provisional,
            provisional_names: Mutex::new(provisional_names),
            admission: RwLock::new(true),
            runtime: Handle::try_current().ok(),
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub(crate) fn weak(&self) -> Weak<Server> {
        self.me.clone()
    }

    pub fn provisional(&self) -> &Arc<Client> {
        &self.provisional
    }

    /// Register a new connection. Sessions are the only callers, and they
    /// disconnect on drop.
    pub(crate) fn connect(&self, label: impl Into<String>) -> Arc<Client> {
        let client = Arc::new(Client::new(label, self.config.max_send_bytes));
        self.register(&client);
        metrics::gauge!("caserve_clients_active").increment(1.0);
        tracing::info!(client = %client.id(), peer = client.label(), "client connected");
        client
    }

    // Identity keys only collide with entries whose client is already gone,
    // so such an entry is replaced.
    fn register(&self, client: &Arc<Client>) {
        let key = Key::Pointer(Arc::as_ptr(client) as usize);
        let mut clients = self.clients.lock();
        if clients
            .lookup(key)
            .is_some_and(|entry| entry.upgrade().is_none())
        {
            tracing::debug!(client = %client.id(), "stale client entry replaced");
            let _ = clients.remove(key);
        }
        if let Err(err) = clients.insert(key, Arc::downgrade(client)) {
            tracing::error!(client = %client.id(), error = %err, "client registration failed");
        }
    }

    /// Tear a connection down, returning its channels and subscriptions to
    /// their pools. Safe to call more than once.
    pub fn disconnect(&self, client: &Arc<Client>) {
        if !client.close() {
            return;
        }
        let released = self.teardown(client);
        let key = Key::Pointer(Arc::as_ptr(client) as usize);
        if self.clients.lock().remove(key).is_ok() {
            metrics::gauge!("caserve_clients_active").decrement(1.0);
        }
        tracing::info!(
            client = %client.id(),
            peer = client.label(),
            channels = released,
            "client disconnected"
        );
    }

    /// Admit one request. `None` once shutdown has begun.
    pub(crate) fn admit(&self) -> Option<RwLockReadGuard<'_, bool>> {
        let open = self.admission.read();
        if *open { Some(open) } else { None }
    }

    pub fn is_shut_down(&self) -> bool {
        !*self.admission.read()
    }

    /// Runtime for tasks that outlive the request that started them.
    pub(crate) fn runtime(&self) -> Option<Handle> {
        self.runtime.clone().or_else(|| Handle::try_current().ok())
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    pub(crate) fn allocate_sid(&self, resources: &ResTable<ChannelRef>) -> Option<u32> {
        // Skip ids still held by long-lived channels after wraparound.
        for _ in 0..64 {
            let sid = self.next_sid.fetch_add(1, Ordering::Relaxed);
            if sid != 0 && !resources.contains(Key::Unsigned(sid)) {
                return Some(sid);
            }
        }
        None
    }

    /// Bytes ready for the transport. Coalesced deliveries held back by
    /// output backpressure are flushed once the buffer has been drained.
    pub fn take_outbound(&self, client: &Arc<Client>) -> Option<bytes::Bytes> {
        let mut out = client.reply();
        let taken = out.take();
        if out.state.deferred && !out.state.events_off {
            out.state.deferred = false;
            self.flush_modified(client, &mut out);
        }
        taken.or_else(|| out.take())
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            clients: self.clients.lock().len(),
            resources: self.resources.lock().stats(),
            channels: self.channel_pool.stats(),
            subscriptions: self.event_pool.stats(),
        }
    }

    /// Stop admitting requests, wait for the ones in flight, disconnect
    /// every client, then verify nothing leaked.
    pub fn shutdown(&self) {
        *self.admission.write() = false;
        let clients: Vec<Arc<Client>> = self
            .clients
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        for client in &clients {
            self.disconnect(client);
        }
        self.teardown(&self.provisional);
        self.provisional_names.lock().clear();
        let resources = self.resources.lock();
        assert!(
            resources.is_empty(),
            "{} channels still registered at shutdown",
            resources.len()
        );
        drop(resources);
        let channels = self.channel_pool.drain_assert_empty();
        let subscriptions = self.event_pool.drain_assert_empty();
        tracing::info!(channels, subscriptions, "engine shut down");
    }
}
