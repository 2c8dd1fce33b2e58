use bytes::Bytes;
use caserve_wire::DbrType;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::{
    Completer, Completion, Database, DbAddr, DbError, DbResult, EventCallback, EventMask, PvValue,
    SubscriptionToken, pending,
};

struct Monitor {
    name: Arc<str>,
    mask: EventMask,
    callback: EventCallback,
}

struct DeferredGet {
    name: Arc<str>,
    dbr_type: DbrType,
    count: u32,
    completer: Completer<DbResult<Bytes>>,
}

struct DeferredPut {
    name: Arc<str>,
    dbr_type: DbrType,
    count: u32,
    data: Vec<u8>,
    completer: Completer<DbResult<()>>,
}

#[derive(Default)]
struct Inner {
    records: HashMap<Arc<str>, PvValue>,
    monitors: HashMap<u64, Monitor>,
}

/// Record store held entirely in memory.
///
/// Every successful put posts a `VALUE | LOG` event to matching monitors.
/// Callbacks run on the caller's thread after the store lock is released.
#[derive(Default)]
pub struct MemoryDatabase {
    inner: RwLock<Inner>,
    next_token: AtomicU64,
    defer_gets: AtomicBool,
    deferred_gets: Mutex<Vec<DeferredGet>>,
    defer_puts: AtomicBool,
    deferred_puts: Mutex<Vec<DeferredPut>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a record.
    pub fn add_record(&self, name: impl Into<Arc<str>>, value: PvValue) {
        let name = name.into();
        tracing::debug!(record = %name, native_type = ?value.native_type(), "record added");
        self.inner.write().records.insert(name, value);
    }

    pub fn record_names(&self) -> Vec<Arc<str>> {
        let mut names: Vec<_> = self.inner.read().records.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn value(&self, name: &str) -> Option<PvValue> {
        self.inner.read().records.get(name).cloned()
    }

    /// Replace a record's value and post a value event. Returns the number of
    /// monitors notified.
    pub fn set(&self, name: &str, value: PvValue) -> DbResult<usize> {
        {
            let mut inner = self.inner.write();
            let current = inner
                .records
                .get_mut(name)
                .ok_or_else(|| DbError::NotFound(name.to_string()))?;
            if current.native_type() != value.native_type() {
                return Err(DbError::TypeMismatch);
            }
            *current = value;
        }
        Ok(self.post_event(name, EventMask::VALUE.union(EventMask::LOG)))
    }

    /// Invoke every monitor on `name` whose mask intersects `mask`.
    pub fn post_event(&self, name: &str, mask: EventMask) -> usize {
        let callbacks: Vec<EventCallback> = self
            .inner
            .read()
            .monitors
            .values()
            .filter(|monitor| &*monitor.name == name && monitor.mask.intersects(mask))
            .map(|monitor| Arc::clone(&monitor.callback))
            .collect();
        for callback in &callbacks {
            callback(mask);
        }
        callbacks.len()
    }

    pub fn monitor_count(&self) -> usize {
        self.inner.read().monitors.len()
    }

    /// When enabled, `get_notify` parks each request until
    /// [`complete_deferred_gets`](Self::complete_deferred_gets) runs.
    pub fn defer_get_notify(&self, enabled: bool) {
        self.defer_gets.store(enabled, Ordering::SeqCst);
    }

    pub fn deferred_get_count(&self) -> usize {
        self.deferred_gets.lock().len()
    }

    /// Read and complete every parked get with the value current at the
    /// time of completion. Returns how many waiters were still listening.
    pub fn complete_deferred_gets(&self) -> usize {
        let parked = std::mem::take(&mut *self.deferred_gets.lock());
        let mut delivered = 0;
        for get in parked {
            let result = self.read(&get.name, get.dbr_type, get.count);
            if get.completer.complete(result) {
                delivered += 1;
            }
        }
        delivered
    }

    /// When enabled, `put_notify` parks each request until
    /// [`complete_deferred_puts`](Self::complete_deferred_puts) runs.
    pub fn defer_put_notify(&self, enabled: bool) {
        self.defer_puts.store(enabled, Ordering::SeqCst);
    }

    pub fn deferred_put_count(&self) -> usize {
        self.deferred_puts.lock().len()
    }

    /// Apply and complete every parked put. Returns how many waiters were
    /// still listening.
    pub fn complete_deferred_puts(&self) -> usize {
        let parked = std::mem::take(&mut *self.deferred_puts.lock());
        let mut delivered = 0;
        for put in parked {
            let result = self.apply_put(&put.name, put.dbr_type, put.count, &put.data);
            if put.completer.complete(result) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Drop every parked put without completing it.
    pub fn abandon_deferred_puts(&self) -> usize {
        let parked = std::mem::take(&mut *self.deferred_puts.lock());
        parked.len()
    }

    fn read(&self, name: &str, dbr_type: DbrType, count: u32) -> DbResult<Bytes> {
        let inner = self.inner.read();
        let value = inner
            .records
            .get(name)
            .ok_or_else(|| DbError::NotFound(name.to_string()))?;
        value.encode(dbr_type, count)
    }

    fn apply_put(&self, name: &str, dbr_type: DbrType, count: u32, data: &[u8]) -> DbResult<()> {
        {
            let mut inner = self.inner.write();
            let value = inner
                .records
                .get_mut(name)
                .ok_or_else(|| DbError::NotFound(name.to_string()))?;
            value.apply(dbr_type, count, data)?;
        }
        self.post_event(name, EventMask::VALUE.union(EventMask::LOG));
        Ok(())
    }
}

impl Database for MemoryDatabase {
    fn resolve(&self, name: &str) -> Option<DbAddr> {
        let inner = self.inner.read();
        let (key, value) = inner.records.get_key_value(name)?;
        Some(DbAddr {
            name: Arc::clone(key),
            native_type: value.native_type(),
            element_count: value.len() as u32,
        })
    }

    fn get(&self, addr: &DbAddr, dbr_type: DbrType, count: u32) -> DbResult<Bytes> {
        self.read(&addr.name, dbr_type, count)
    }

    fn get_notify(
        &self,
        addr: &DbAddr,
        dbr_type: DbrType,
        count: u32,
    ) -> Completion<DbResult<Bytes>> {
        if !self.defer_gets.load(Ordering::SeqCst) {
            return Completion::Ready(self.get(addr, dbr_type, count));
        }
        let (completer, completion) = pending();
        self.deferred_gets.lock().push(DeferredGet {
            name: Arc::clone(&addr.name),
            dbr_type,
            count,
            completer,
        });
        completion
    }

    fn put(&self, addr: &DbAddr, dbr_type: DbrType, count: u32, data: &[u8]) -> DbResult<()> {
        self.apply_put(&addr.name, dbr_type, count, data)
    }

    fn put_notify(
        &self,
        addr: &DbAddr,
        dbr_type: DbrType,
        count: u32,
        data: &[u8],
    ) -> Completion<DbResult<()>> {
        if !self.defer_puts.load(Ordering::SeqCst) {
            return Completion::Ready(self.put(addr, dbr_type, count, data));
        }
        let (completer, completion) = pending();
        self.deferred_puts.lock().push(DeferredPut {
            name: Arc::clone(&addr.name),
            dbr_type,
            count,
            data: data.to_vec(),
            completer,
        });
        completion
    }

    fn subscribe(
        &self,
        addr: &DbAddr,
        mask: EventMask,
        callback: EventCallback,
    ) -> DbResult<SubscriptionToken> {
        let mut inner = self.inner.write();
        let (name, _) = inner
            .records
            .get_key_value(&addr.name)
            .ok_or_else(|| DbError::NotFound(addr.name.to_string()))?;
        let name = Arc::clone(name);
        let token = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        inner.monitors.insert(
            token,
            Monitor {
                name,
                mask,
                callback,
            },
        );
        Ok(SubscriptionToken(token))
    }

    fn unsubscribe(&self, token: SubscriptionToken) -> DbResult<()> {
        self.inner
            .write()
            .monitors
            .remove(&token.0)
            .map(|_| ())
            .ok_or(DbError::NoSuchSubscription(token.0))
    }
}
