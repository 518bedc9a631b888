//! Byte-bounded LRU cache over `(row, col)` cells.

use std::collections::{BTreeMap, HashMap, HashSet};

/// Fixed per-entry overhead charged against the cache capacity, on top of
/// the value's byte length.
pub(crate) const ENTRY_HEADER_SIZE: usize = 32;

/// A cached cell value plus its recency stamp.
struct CacheSlot {
    value: String,
    recency: u64,
}

/// Outcome of a cache insertion.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum CachePut {
    /// Entry stored; carries the `(row, col, value)` entries evicted to make
    /// room, in eviction order, which the owner must write back to disk.
    Stored(Vec<(String, String, String)>),

    /// The single entry is larger than the whole cache and was not stored.
    /// The owner must persist it to disk directly.
    Oversized,
}

/// Strict-LRU cache with a fixed byte capacity. Eviction happens on insert
/// until the new entry fits; evicted entries are handed back to the caller
/// for write-back.
pub(crate) struct LruCache {
    /// Capacity in bytes.
    capacity: usize,

    /// Sum of charged sizes of all current entries. Always <= capacity.
    curr_size: usize,

    /// Monotonic recency clock; higher stamp = more recently used.
    tick: u64,

    /// Map from cell key -> slot.
    entries: HashMap<(String, String), CacheSlot>,

    /// Recency stamp -> cell key index; the smallest stamp is the LRU entry.
    order: BTreeMap<u64, (String, String)>,
}

impl LruCache {
    /// Creates a cache with the given byte capacity.
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "invalid cache capacity {}", capacity);
        LruCache {
            capacity,
            curr_size: 0,
            tick: 0,
            entries: HashMap::new(),
            order: BTreeMap::new(),
        }
    }

    /// Charged size of a value.
    #[inline]
    fn charged_size(value: &str) -> usize {
        ENTRY_HEADER_SIZE + value.len()
    }

    /// Inserts or updates a cell. The updated entry becomes the most
    /// recently used. Evicts LRU entries until the new entry fits.
    pub(crate) fn put(
        &mut self,
        row: &str,
        col: &str,
        value: String,
    ) -> CachePut {
        let charged = Self::charged_size(&value);
        if charged > self.capacity {
            return CachePut::Oversized;
        }

        // drop any existing version of this cell first
        self.remove(row, col);

        // evict from the LRU end until the new entry fits
        let mut evicted = Vec::new();
        while self.curr_size + charged > self.capacity {
            let (_, key) = self
                .order
                .pop_first()
                .expect("cache accounting out of sync");
            let slot = self.entries.remove(&key).unwrap();
            self.curr_size -= Self::charged_size(&slot.value);
            evicted.push((key.0, key.1, slot.value));
        }

        self.tick += 1;
        let key = (row.to_string(), col.to_string());
        self.order.insert(self.tick, key.clone());
        self.entries.insert(
            key,
            CacheSlot {
                value,
                recency: self.tick,
            },
        );
        self.curr_size += charged;

        CachePut::Stored(evicted)
    }

    /// Looks up a cell, refreshing its recency on hit.
    pub(crate) fn get(&mut self, row: &str, col: &str) -> Option<String> {
        let key = (row.to_string(), col.to_string());
        let slot = self.entries.get_mut(&key)?;

        self.tick += 1;
        self.order.remove(&slot.recency);
        self.order.insert(self.tick, key);
        slot.recency = self.tick;

        Some(slot.value.clone())
    }

    /// Removes a cell if present. Returns true iff it was cached.
    pub(crate) fn remove(&mut self, row: &str, col: &str) -> bool {
        let key = (row.to_string(), col.to_string());
        match self.entries.remove(&key) {
            Some(slot) => {
                self.order.remove(&slot.recency);
                self.curr_size -= Self::charged_size(&slot.value);
                true
            }
            None => false,
        }
    }

    /// All distinct rows with at least one cached cell.
    pub(crate) fn rows(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut rows = Vec::new();
        for (row, _) in self.entries.keys() {
            if seen.insert(row.clone()) {
                rows.push(row.clone());
            }
        }
        rows
    }

    /// Cached columns of a row, or `None` if the row has no cached cells.
    pub(crate) fn cols_in_row(&self, row: &str) -> Option<Vec<String>> {
        let cols: Vec<String> = self
            .entries
            .keys()
            .filter(|(r, _)| r == row)
            .map(|(_, c)| c.clone())
            .collect();
        if cols.is_empty() {
            None
        } else {
            Some(cols)
        }
    }

    /// Current total of charged sizes.
    #[inline]
    pub(crate) fn total_size(&self) -> usize {
        self.curr_size
    }

    /// Number of cached cells.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
