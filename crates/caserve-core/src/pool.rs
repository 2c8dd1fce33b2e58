// Free lists for channel and subscription records.
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Reset an object before it goes back on a free list.
pub trait Recycle {
    fn recycle(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Handed out and not yet released.
    pub outstanding: usize,
    /// Waiting on the free list.
    pub free: usize,
    /// Fresh heap allocations over the pool's lifetime.
    pub allocated: usize,
}

/// LIFO free list with heap fallback.
///
/// The lock guards only the push or pop itself.
///
/// ```
/// use caserve_core::pool::{Pool, Recycle};
///
/// #[derive(Default)]
/// struct Slot(u32);
///
/// impl Recycle for Slot {
///     fn recycle(&mut self) {
///         self.0 = 0;
///     }
/// }
///
/// let pool = Pool::<Slot>::new("slot");
/// let mut slot = pool.acquire();
/// slot.0 = 5;
/// pool.release(slot);
/// assert_eq!(pool.acquire().0, 0);
/// assert_eq!(pool.stats().allocated, 1);
/// ```
#[derive(Debug)]
pub struct Pool<T> {
    name: &'static str,
    free: Mutex<Vec<Box<T>>>,
    outstanding: AtomicUsize,
    allocated: AtomicUsize,
}

impl<T: Recycle + Default> Pool<T> {
    pub fn new(name: &'static str) -> Self {
        Self::with_preallocated(name, 0)
    }

    /// Create a pool whose free list already holds `count` objects.
    pub fn with_preallocated(name: &'static str, count: usize) -> Self {
        let free = (0..count).map(|_| Box::<T>::default()).collect();
        Self {
            name,
            free: Mutex::new(free),
            outstanding: AtomicUsize::new(0),
            allocated: AtomicUsize::new(count),
        }
    }

    pub fn acquire(&self) -> Box<T> {
        let reused = self.free.lock().pop();
        let item = match reused {
            Some(item) => item,
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("caserve_pool_alloc_total", "pool" => self.name).increment(1);
                Box::default()
            }
        };
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        item
    }

    pub fn release(&self, mut item: Box<T>) {
        item.recycle();
        self.free.lock().push(item);
        let previous = self.outstanding.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(previous > 0, "{} pool released more than acquired", self.name);
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            outstanding: self.outstanding.load(Ordering::Relaxed),
            free: self.free.lock().len(),
            allocated: self.allocated.load(Ordering::Relaxed),
        }
    }

    /// Free every pooled object. Panics if any object is still handed out.
    pub fn drain_assert_empty(&self) -> usize {
        let outstanding = self.outstanding.load(Ordering::Acquire);
        assert_eq!(
            outstanding, 0,
            "{} pool drained with {outstanding} objects outstanding",
            self.name
        );
        std::mem::take(&mut *self.free.lock()).len()
    }
}
