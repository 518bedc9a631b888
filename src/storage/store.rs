//! Lock-aware cell store: LRU cache with write-back to per-cell sstable
//! files, plus the row lock table.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::storage::{CachePut, LruCache};
use crate::utils::PaxkvError;

use tokio::fs;

/// Sentinel lock token that disables lock enforcement. Reserved for trusted
/// internal paths.
pub const LOCK_BYPASS: &str = "LOCK_BYPASS";

/// Sentinel lock token meaning "no lock asserted".
pub const NO_LOCK: &str = "-";

/// A row lock is treated as implicitly released once this much time has
/// elapsed since acquisition.
const LOCK_MAX_DURATION: Duration = Duration::from_secs(10);

/// File extension of per-cell files under the sstable root.
const CELL_FILE_EXT: &str = ".dat";

/// Per-row advisory lock record.
struct LockRecord {
    lock_id: String,
    acquired_at: Instant,
}

impl LockRecord {
    fn expired(&self) -> bool {
        self.acquired_at.elapsed() > LOCK_MAX_DURATION
    }
}

/// The cell store backing one replica. Cells live either in the LRU cache
/// (authoritative while cached) or in a file `<root>/<row>/<col>.dat`; the
/// cache is write-back, so eviction flushes to disk.
pub struct Store {
    /// Root directory of per-cell sstable files.
    root: PathBuf,

    /// Write-back LRU cache.
    cache: LruCache,

    /// Configured cache capacity, kept for reconstructing on `clear()`.
    cache_capacity: usize,

    /// Map from row -> advisory lock record. Expiry is checked lazily at
    /// access time.
    locks: HashMap<String, LockRecord>,
}

impl Store {
    /// Creates a store rooted at the given sstable directory.
    pub fn new(root: impl Into<PathBuf>, cache_capacity: usize) -> Self {
        Store {
            root: root.into(),
            cache: LruCache::new(cache_capacity),
            cache_capacity,
            locks: HashMap::new(),
        }
    }

    /// Is the row inaccessible to the given lock token? True iff the token
    /// is not the bypass sentinel, the row has a live lock, and the held
    /// token differs from the caller's.
    fn is_locked(&self, row: &str, lock_id: &str) -> bool {
        if lock_id == LOCK_BYPASS {
            return false;
        }
        match self.locks.get(row) {
            Some(rec) => !rec.expired() && rec.lock_id != lock_id,
            None => false,
        }
    }

    /// Unconditional write of a cell. Returns false iff denied by a lock.
    pub async fn put(
        &mut self,
        row: &str,
        col: &str,
        value: &str,
        lock_id: &str,
    ) -> Result<bool, PaxkvError> {
        if self.is_locked(row, lock_id) {
            return Ok(false);
        }

        match self.cache.put(row, col, value.to_string()) {
            CachePut::Stored(evicted) => {
                for (erow, ecol, evalue) in evicted {
                    self.flush_to_disk(&erow, &ecol, &evalue).await?;
                }
            }
            CachePut::Oversized => {
                // value larger than the whole cache: straight to disk
                self.flush_to_disk(row, col, value).await?;
            }
        }
        Ok(true)
    }

    /// Reads a cell. `Ok(None)` covers both "absent" and "lock denied".
    pub async fn get(
        &mut self,
        row: &str,
        col: &str,
        lock_id: &str,
    ) -> Result<Option<String>, PaxkvError> {
        if self.is_locked(row, lock_id) {
            return Ok(None);
        }

        if let Some(value) = self.cache.get(row, col) {
            return Ok(Some(value));
        }

        // cache miss: fall back to disk, populating the cache on a hit.
        // An oversized value stays disk-only; a fill eviction writes back.
        match self.read_from_disk(row, col).await? {
            Some(value) => {
                if let CachePut::Stored(evicted) =
                    self.cache.put(row, col, value.clone())
                {
                    for (erow, ecol, evalue) in evicted {
                        self.flush_to_disk(&erow, &ecol, &evalue).await?;
                    }
                }
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Conditional write: succeeds iff the current value equals `expected`
    /// byte-for-byte.
    pub async fn cput(
        &mut self,
        row: &str,
        col: &str,
        expected: &str,
        new_value: &str,
        lock_id: &str,
    ) -> Result<bool, PaxkvError> {
        if self.is_locked(row, lock_id) {
            return Ok(false);
        }

        match self.get(row, col, lock_id).await? {
            Some(curr) if curr == expected => {
                self.put(row, col, new_value, lock_id).await
            }
            _ => Ok(false),
        }
    }

    /// Removes a cell from cache and disk. Succeeds even if absent; returns
    /// false only when denied by a lock.
    pub async fn delete(
        &mut self,
        row: &str,
        col: &str,
        lock_id: &str,
    ) -> Result<bool, PaxkvError> {
        if self.is_locked(row, lock_id) {
            return Ok(false);
        }

        self.cache.remove(row, col);

        let path = self.cell_path(row, col);
        if fs::try_exists(&path).await? {
            fs::remove_file(&path).await?;
        }

        // drop the row directory once its last cell is gone
        let row_dir = self.root.join(row);
        if fs::try_exists(&row_dir).await? {
            let mut entries = fs::read_dir(&row_dir).await?;
            if entries.next_entry().await?.is_none() {
                fs::remove_dir(&row_dir).await?;
            }
        }

        Ok(true)
    }

    /// Acquires the row lock under the given token. Fails iff a live lock
    /// under a different token exists.
    pub fn set_nx(&mut self, row: &str, lock_id: &str) -> bool {
        if self.is_locked(row, lock_id) {
            return false;
        }
        self.locks.insert(
            row.to_string(),
            LockRecord {
                lock_id: lock_id.to_string(),
                acquired_at: Instant::now(),
            },
        );
        true
    }

    /// Removes the row lock record unconditionally. Ownership verification
    /// happens above this layer.
    pub fn del_lock(&mut self, row: &str) -> bool {
        self.locks.remove(row);
        true
    }

    /// All rows: union of cached rows and on-disk row directories.
    /// Duplicates are permitted; callers de-duplicate when needed.
    pub async fn get_all_rows(&self) -> Result<Vec<String>, PaxkvError> {
        let mut rows = self.cache.rows();

        if fs::try_exists(&self.root).await? {
            let mut entries = fs::read_dir(&self.root).await?;
            while let Some(entry) = entries.next_entry().await? {
                rows.push(entry.file_name().to_string_lossy().into_owned());
            }
        }

        Ok(rows)
    }

    /// Columns of a row: union of cached columns and on-disk cell files
    /// (without the `.dat` suffix). `Ok(None)` covers both "no such row"
    /// and "lock denied".
    pub async fn get_cols_in_row(
        &self,
        row: &str,
        lock_id: &str,
    ) -> Result<Option<Vec<String>>, PaxkvError> {
        if self.is_locked(row, lock_id) {
            return Ok(None);
        }

        let mut cols = Vec::new();
        let cached = self.cache.cols_in_row(row);
        if let Some(cached_cols) = &cached {
            cols.extend(cached_cols.iter().cloned());
        }

        let row_dir = self.root.join(row);
        let on_disk = fs::try_exists(&row_dir).await?;
        if !on_disk && cached.is_none() {
            return Ok(None);
        }

        if on_disk {
            let mut entries = fs::read_dir(&row_dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let col = name
                    .strip_suffix(CELL_FILE_EXT)
                    .unwrap_or(&name)
                    .to_string();
                cols.push(col);
            }
        }

        Ok(Some(cols))
    }

    /// Wipes the whole sstable directory, the cache, and the lock table.
    pub async fn clear(&mut self) -> Result<(), PaxkvError> {
        if fs::try_exists(&self.root).await? {
            fs::remove_dir_all(&self.root).await?;
        }
        self.cache = LruCache::new(self.cache_capacity);
        self.locks.clear();
        Ok(())
    }

    fn cell_path(&self, row: &str, col: &str) -> PathBuf {
        self.root.join(row).join(format!("{}{}", col, CELL_FILE_EXT))
    }

    /// Writes a cell file: the `row-col` header line, then the value bytes
    /// as received from the caller — base64 text in practice, since the
    /// server never decodes values (see DESIGN.md, open question 7).
    async fn flush_to_disk(
        &self,
        row: &str,
        col: &str,
        value: &str,
    ) -> Result<(), PaxkvError> {
        let row_dir = self.root.join(row);
        if !fs::try_exists(&row_dir).await? {
            fs::create_dir_all(&row_dir).await?;
        }

        let content = format!("{}-{}\n{}", row, col, value);
        fs::write(self.cell_path(row, col), content).await?;
        Ok(())
    }

    /// Reads a cell file back, validating the header line against the
    /// expected key. A mismatching or missing header means "not found".
    async fn read_from_disk(
        &self,
        row: &str,
        col: &str,
    ) -> Result<Option<String>, PaxkvError> {
        let path = self.cell_path(row, col);
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }

        let bytes = fs::read(&path).await?;
        let header_end = match bytes.iter().position(|&b| b == b'\n') {
            Some(pos) => pos,
            None => return Ok(None),
        };
        let header = String::from_utf8_lossy(&bytes[..header_end]);
        if header != format!("{}-{}", row, col) {
            return Ok(None);
        }

        let value = String::from_utf8(bytes[header_end + 1..].to_vec())?;
        Ok(Some(value))
    }

    /// Rewinds a lock's acquisition time, for expiry tests.
    #[cfg(test)]
    fn age_lock(&mut self, row: &str, age: Duration) {
        if let Some(rec) = self.locks.get_mut(row) {
            rec.acquired_at = Instant::now().checked_sub(age).unwrap();
        }
    }
}

#[cfg(test)]
mod store_tests {
    use super::*;
    use crate::storage::ENTRY_HEADER_SIZE;

    async fn fresh_store(name: &str, cache_capacity: usize) -> Store {
        let root = format!("/tmp/paxkv-test-store-{}", name);
        let _ = fs::remove_dir_all(&root).await;
        Store::new(root, cache_capacity)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn put_get_roundtrip() -> Result<(), PaxkvError> {
        let mut store = fresh_store("roundtrip", 4096).await;
        assert!(store.put("row1", "col1", "value1", NO_LOCK).await?);
        assert_eq!(
            store.get("row1", "col1", NO_LOCK).await?,
            Some("value1".into())
        );
        assert!(store.put("row1", "col1", "value2", NO_LOCK).await?);
        assert_eq!(
            store.get("row1", "col1", NO_LOCK).await?,
            Some("value2".into())
        );
        assert_eq!(store.get("row1", "col2", NO_LOCK).await?, None);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn cput_fencepost() -> Result<(), PaxkvError> {
        let mut store = fresh_store("cput", 4096).await;
        store.put("abc", "bcd", "5", NO_LOCK).await?;
        assert!(store.cput("abc", "bcd", "5", "6", NO_LOCK).await?);
        assert_eq!(
            store.get("abc", "bcd", NO_LOCK).await?,
            Some("6".into())
        );
        assert!(!store.cput("abc", "bcd", "5", "7", NO_LOCK).await?);
        assert_eq!(
            store.get("abc", "bcd", NO_LOCK).await?,
            Some("6".into())
        );
        // CPUT on an absent cell fails
        assert!(!store.cput("abc", "xyz", "5", "7", NO_LOCK).await?);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn delete_absent_succeeds() -> Result<(), PaxkvError> {
        let mut store = fresh_store("delete", 4096).await;
        assert!(store.delete("row1", "col1", NO_LOCK).await?);
        store.put("row1", "col1", "value1", NO_LOCK).await?;
        assert!(store.delete("row1", "col1", NO_LOCK).await?);
        assert_eq!(store.get("row1", "col1", NO_LOCK).await?, None);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn delete_reaches_written_back_cell() -> Result<(), PaxkvError> {
        // small cache: first cell gets written back when second arrives
        let cap = 2 * (ENTRY_HEADER_SIZE + 6);
        let mut store = fresh_store("delete-wb", cap).await;
        store.put("row1", "col1", "value1", NO_LOCK).await?;
        store.put("row1", "col2", "value2", NO_LOCK).await?;
        store.put("row1", "col3", "value3", NO_LOCK).await?;
        assert!(store.delete("row1", "col1", NO_LOCK).await?);
        assert_eq!(store.get("row1", "col1", NO_LOCK).await?, None);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn eviction_then_get_reads_disk() -> Result<(), PaxkvError> {
        let cap = 2 * (ENTRY_HEADER_SIZE + 6);
        let mut store = fresh_store("evict", cap).await;
        store.put("r1", "c", "value1", NO_LOCK).await?;
        store.put("r2", "c", "value2", NO_LOCK).await?;
        store.put("r3", "c", "value3", NO_LOCK).await?;
        // r1 was evicted to disk; the read fills it back into the cache
        assert_eq!(
            store.get("r1", "c", NO_LOCK).await?,
            Some("value1".into())
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn oversized_value_bypasses_cache() -> Result<(), PaxkvError> {
        let cap = 1024;
        let mut store = fresh_store("oversized", cap).await;
        let big = "x".repeat(2 * cap);
        assert!(store.put("big", "one", &big, NO_LOCK).await?);
        assert_eq!(store.cache.len(), 0);
        assert_eq!(store.get("big", "one", NO_LOCK).await?, Some(big));
        // the get fill path must not have cached it either
        assert_eq!(store.cache.len(), 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn lock_exclusivity_and_expiry() -> Result<(), PaxkvError> {
        let mut store = fresh_store("locks", 4096).await;
        store.put("row1", "col1", "value1", NO_LOCK).await?;

        assert!(store.set_nx("row1", "t1"));
        // same token may re-acquire; a different one may not
        assert!(store.set_nx("row1", "t1"));
        assert!(!store.set_nx("row1", "t2"));

        // non-owners are denied, the owner and the bypass token are not
        assert_eq!(store.get("row1", "col1", NO_LOCK).await?, None);
        assert!(!store.put("row1", "col1", "v", NO_LOCK).await?);
        assert_eq!(
            store.get("row1", "col1", "t1").await?,
            Some("value1".into())
        );
        assert_eq!(
            store.get("row1", "col1", LOCK_BYPASS).await?,
            Some("value1".into())
        );

        // releasing frees the row for other tokens
        assert!(store.del_lock("row1"));
        assert!(store.set_nx("row1", "t2"));

        // an expired lock behaves as released
        store.age_lock("row1", LOCK_MAX_DURATION + Duration::from_secs(1));
        assert_eq!(
            store.get("row1", "col1", NO_LOCK).await?,
            Some("value1".into())
        );
        assert!(store.set_nx("row1", "t3"));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn rows_and_cols_union() -> Result<(), PaxkvError> {
        let cap = 2 * (ENTRY_HEADER_SIZE + 6);
        let mut store = fresh_store("enum", cap).await;
        store.put("r1", "c1", "value1", NO_LOCK).await?;
        store.put("r1", "c2", "value2", NO_LOCK).await?;
        store.put("r2", "c1", "value3", NO_LOCK).await?;

        let mut rows = store.get_all_rows().await?;
        rows.sort();
        rows.dedup();
        assert_eq!(rows, vec!["r1".to_string(), "r2".to_string()]);

        let mut cols = store.get_cols_in_row("r1", NO_LOCK).await?.unwrap();
        cols.sort();
        cols.dedup();
        assert_eq!(cols, vec!["c1".to_string(), "c2".to_string()]);

        assert_eq!(store.get_cols_in_row("r9", NO_LOCK).await?, None);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn header_mismatch_treated_as_absent() -> Result<(), PaxkvError> {
        let mut store = fresh_store("header", 4096).await;
        let row_dir = store.root.join("row1");
        fs::create_dir_all(&row_dir).await?;
        fs::write(row_dir.join("col1.dat"), "garbage-header\nvalue")
            .await?;
        assert_eq!(store.get("row1", "col1", NO_LOCK).await?, None);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn clear_wipes_everything() -> Result<(), PaxkvError> {
        let mut store = fresh_store("clear", 4096).await;
        store.put("r1", "c1", "value1", NO_LOCK).await?;
        store.set_nx("r1", "t1");
        store.clear().await?;
        assert_eq!(store.get("r1", "c1", NO_LOCK).await?, None);
        assert!(store.set_nx("r1", "t2"));
        assert!(store.get_all_rows().await?.is_empty());
        Ok(())
    }
}
