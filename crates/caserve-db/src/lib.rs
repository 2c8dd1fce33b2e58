// Interface the protocol engine consumes from the record database, plus an
// in-memory implementation used by the service and by tests.
use bytes::Bytes;
use caserve_wire::DbrType;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;

mod memory;
mod value;

pub use memory::MemoryDatabase;
pub use value::PvValue;

pub type DbResult<T> = std::result::Result<T, DbError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    #[error("no such process variable: {0}")]
    NotFound(String),
    #[error("element count {requested} out of range (native {native})")]
    BadCount { requested: u32, native: u32 },
    #[error("value cannot be converted to the requested type")]
    TypeMismatch,
    #[error("short payload: need {needed} bytes, have {have}")]
    ShortPayload { needed: usize, have: usize },
    #[error("unknown subscription token {0}")]
    NoSuchSubscription(u64),
}

/// Resolved location of a process variable.
///
/// Cheap to clone; the engine keeps one per channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DbAddr {
    pub name: Arc<str>,
    pub native_type: DbrType,
    pub element_count: u32,
}

/// Change classes a subscription can select.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventMask(u16);

impl EventMask {
    pub const VALUE: Self = Self(0x1);
    pub const LOG: Self = Self(0x2);
    pub const ALARM: Self = Self(0x4);
    pub const PROPERTY: Self = Self(0x8);

    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl fmt::Debug for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventMask({:#06x})", self.0)
    }
}

/// Invoked by the database whenever a subscribed record posts an event whose
/// class intersects the subscription mask. May run on any thread.
pub type EventCallback = Arc<dyn Fn(EventMask) + Send + Sync>;

/// Handle for a registration made with [`Database::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(pub u64);

/// Result of an operation that may finish later.
#[derive(Debug)]
pub enum Completion<T> {
    Ready(T),
    Pending(oneshot::Receiver<T>),
}

/// Completing side of a pending operation. Consumed on use, so an operation
/// completes at most once.
#[derive(Debug)]
pub struct Completer<T>(oneshot::Sender<T>);

impl<T> Completer<T> {
    /// Deliver the result. Returns `false` when the waiter is gone.
    pub fn complete(self, value: T) -> bool {
        self.0.send(value).is_ok()
    }
}

/// Create a pending completion and the handle that finishes it.
///
/// ```
/// use caserve_db::{Completion, pending};
///
/// let (completer, completion) = pending::<u32>();
/// assert!(completer.complete(7));
/// let Completion::Pending(mut rx) = completion else { unreachable!() };
/// assert_eq!(rx.try_recv().expect("ready"), 7);
/// ```
pub fn pending<T>() -> (Completer<T>, Completion<T>) {
    let (tx, rx) = oneshot::channel();
    (Completer(tx), Completion::Pending(rx))
}

/// Record database operations used by the protocol engine.
///
/// Implementations must invoke subscription callbacks without holding locks
/// that `get`/`put` also take, since the engine may read the current value
/// from inside the delivery path.
pub trait Database: Send + Sync {
    fn resolve(&self, name: &str) -> Option<DbAddr>;

    fn get(&self, addr: &DbAddr, dbr_type: DbrType, count: u32) -> DbResult<Bytes>;

    fn get_notify(
        &self,
        addr: &DbAddr,
        dbr_type: DbrType,
        count: u32,
    ) -> Completion<DbResult<Bytes>> {
        Completion::Ready(self.get(addr, dbr_type, count))
    }

    fn put(&self, addr: &DbAddr, dbr_type: DbrType, count: u32, data: &[u8]) -> DbResult<()>;

    fn put_notify(
        &self,
        addr: &DbAddr,
        dbr_type: DbrType,
        count: u32,
        data: &[u8],
    ) -> Completion<DbResult<()>> {
        Completion::Ready(self.put(addr, dbr_type, count, data))
    }

    fn subscribe(
        &self,
        addr: &DbAddr,
        mask: EventMask,
        callback: EventCallback,
    ) -> DbResult<SubscriptionToken>;

    fn unsubscribe(&self, token: SubscriptionToken) -> DbResult<()>;
}
