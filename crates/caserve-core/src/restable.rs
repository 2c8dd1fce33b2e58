// Fixed-size bucket hash table mapping identifiers to values.
// Integer, pointer-identity and string keys share one table; a key only
// matches another key of the same kind.
use std::iter;

/// Identifiers handed to clients are 32 bits wide, so the index never needs
/// more bits than that.
const ID_BITS: u32 = u32::BITS;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TableError {
    #[error("identifier already in use")]
    DuplicateId,
    #[error("unknown identifier")]
    UnknownId,
    #[error("table of {requested} entries needs more than 32 index bits")]
    TableTooLarge { requested: usize },
    #[error("out of memory allocating table")]
    OutOfMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    Unsigned,
    Pointer,
    Str,
}

/// Borrowed lookup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key<'a> {
    Unsigned(u32),
    /// Object identity, usually `Arc::as_ptr(..) as usize`.
    Pointer(usize),
    Str(&'a str),
}

impl Key<'_> {
    pub fn kind(&self) -> KeyKind {
        match self {
            Self::Unsigned(_) => KeyKind::Unsigned,
            Self::Pointer(_) => KeyKind::Pointer,
            Self::Str(_) => KeyKind::Str,
        }
    }

    fn to_owned_key(self) -> StoredKey {
        match self {
            Self::Unsigned(id) => StoredKey::Unsigned(id),
            Self::Pointer(addr) => StoredKey::Pointer(addr),
            Self::Str(name) => StoredKey::Str(name.into()),
        }
    }
}

#[derive(Debug)]
enum StoredKey {
    Unsigned(u32),
    Pointer(usize),
    Str(Box<str>),
}

impl StoredKey {
    fn matches(&self, key: Key<'_>) -> bool {
        match (self, key) {
            (Self::Unsigned(stored), Key::Unsigned(id)) => *stored == id,
            (Self::Pointer(stored), Key::Pointer(addr)) => *stored == addr,
            (Self::Str(stored), Key::Str(name)) => &**stored == name,
            _ => false,
        }
    }
}

type Link<V> = Option<Box<Entry<V>>>;

#[derive(Debug)]
struct Entry<V> {
    key: StoredKey,
    value: V,
    next: Link<V>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableStats {
    pub buckets: usize,
    pub entries: usize,
    pub longest_chain: usize,
}

/// Separate-chaining table over a power-of-two bucket array sized once at
/// creation. It never rehashes.
///
/// ```
/// use caserve_core::restable::{Key, ResTable, TableError};
///
/// let mut table = ResTable::create(16).expect("table");
/// table.insert(Key::Unsigned(7), "seven").expect("insert");
/// assert_eq!(table.insert(Key::Unsigned(7), "again"), Err(TableError::DuplicateId));
/// assert_eq!(table.lookup(Key::Unsigned(7)), Some(&"seven"));
/// assert_eq!(table.remove(Key::Unsigned(7)), Ok("seven"));
/// table.destroy();
/// ```
#[derive(Debug)]
pub struct ResTable<V> {
    buckets: Vec<Link<V>>,
    bits: u32,
    mask: u64,
    len: usize,
}

impl<V> ResTable<V> {
    /// Create a table with at least `capacity_hint` buckets.
    pub fn create(capacity_hint: usize) -> Result<Self, TableError> {
        let wanted = capacity_hint.max(1) as u64;
        let mut bits = 0;
        while (1u64 << bits) < wanted {
            bits += 1;
            if bits > ID_BITS {
                return Err(TableError::TableTooLarge {
                    requested: capacity_hint,
                });
            }
        }
        let count = 1usize << bits;
        let mut buckets = Vec::new();
        buckets
            .try_reserve_exact(count)
            .map_err(|_| TableError::OutOfMemory)?;
        buckets.resize_with(count, || None);
        Ok(Self {
            buckets,
            bits,
            mask: (1u64 << bits) - 1,
            len: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert a new entry. An existing entry with an equal key of the same
    /// kind is left in place and the insert fails.
    pub fn insert(&mut self, key: Key<'_>, value: V) -> Result<(), TableError> {
        let index = self.bucket_of(key);
        if chain(&self.buckets[index]).any(|entry| entry.key.matches(key)) {
            return Err(TableError::DuplicateId);
        }
        let bucket = &mut self.buckets[index];
        let next = bucket.take();
        *bucket = Some(Box::new(Entry {
            key: key.to_owned_key(),
            value,
            next,
        }));
        self.len += 1;
        Ok(())
    }

    pub fn lookup(&self, key: Key<'_>) -> Option<&V> {
        chain(&self.buckets[self.bucket_of(key)])
            .find(|entry| entry.key.matches(key))
            .map(|entry| &entry.value)
    }

    pub fn lookup_mut(&mut self, key: Key<'_>) -> Option<&mut V> {
        let index = self.bucket_of(key);
        let mut link = self.buckets[index].as_deref_mut();
        while let Some(entry) = link {
            if entry.key.matches(key) {
                return Some(&mut entry.value);
            }
            link = entry.next.as_deref_mut();
        }
        None
    }

    pub fn contains(&self, key: Key<'_>) -> bool {
        self.lookup(key).is_some()
    }

    /// Unlink and return the entry for `key`.
    pub fn remove(&mut self, key: Key<'_>) -> Result<V, TableError> {
        let index = self.bucket_of(key);
        let mut link = &mut self.buckets[index];
        while link.as_ref().is_some_and(|entry| !entry.key.matches(key)) {
            link = &mut link.as_mut().expect("checked above").next;
        }
        let mut removed = link.take().ok_or(TableError::UnknownId)?;
        *link = removed.next.take();
        self.len -= 1;
        Ok(removed.value)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> + '_ {
        self.buckets
            .iter()
            .flat_map(|head| chain(head).map(|entry| &entry.value))
    }

    pub fn stats(&self) -> TableStats {
        TableStats {
            buckets: self.buckets.len(),
            entries: self.len,
            longest_chain: self
                .buckets
                .iter()
                .map(|head| chain(head).count())
                .max()
                .unwrap_or(0),
        }
    }

    /// Drop every entry. Returns how many there were.
    pub fn clear(&mut self) -> usize {
        for bucket in &mut self.buckets {
            let mut link = bucket.take();
            while let Some(mut entry) = link {
                link = entry.next.take();
            }
        }
        std::mem::take(&mut self.len)
    }

    /// Tear the table down. The owner must have removed every entry.
    pub fn destroy(self) {
        assert!(
            self.is_empty(),
            "resource table destroyed with {} live entries",
            self.len
        );
    }

    fn bucket_of(&self, key: Key<'_>) -> usize {
        let hash = match key {
            Key::Unsigned(id) => self.fold(u64::from(id)),
            Key::Pointer(addr) => self.fold(addr as u64),
            Key::Str(name) => self.poly(name),
        };
        hash as usize
    }

    // XOR successive `bits`-wide slices of the key together.
    fn fold(&self, id: u64) -> u64 {
        if self.bits == 0 {
            return 0;
        }
        let mut hash = id;
        let mut src = id >> self.bits;
        while src != 0 {
            hash ^= src;
            src >>= self.bits;
        }
        hash & self.mask
    }

    // Position-weighted byte sum reduced by the bucket count.
    fn poly(&self, name: &str) -> u64 {
        let mut hash = 0u64;
        for (position, byte) in name.bytes().enumerate() {
            hash = hash.wrapping_add(u64::from(byte).wrapping_mul(position as u64 + 1));
        }
        hash & self.mask
    }
}

fn chain<V>(head: &Link<V>) -> impl Iterator<Item = &Entry<V>> {
    iter::successors(head.as_deref(), |entry| entry.next.as_deref())
}
