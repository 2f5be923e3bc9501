//! redb-backed data store.
//!
//! One [`DataStore`] wraps one redb database file and exposes the
//! transactional contract the rest of the crate builds on: snapshot
//! readers, a single serialized writer, named sub-databases, and ordered
//! scans.
//!
//! # Borrowing contract
//!
//! Values handed out by `get` are owned copies. Scans hand borrowed
//! slices to a visitor callback; the borrow is confined to the callback
//! so nothing can outlive the transaction that backs it. Callers that
//! want to keep data copy it inside the visitor.

use std::path::{Path, PathBuf};

use redb::{
    Database, MultimapTableDefinition, ReadableMultimapTable, ReadableTable,
    ReadableTableMetadata, TableDefinition, TableError,
};
use tracing::{debug, info, instrument, warn};

use super::schema::{StoreMetadata, INTERNAL_META_TREE, METADATA_KEY, SCHEMA_VERSION};
use crate::error::{Error, Result, StorageError};

/// Byte-keyed table definition for a named tree.
fn tree(name: &str) -> TableDefinition<'_, &'static [u8], &'static [u8]> {
    TableDefinition::new(name)
}

/// Byte-keyed multimap definition for a named tree with duplicate keys.
fn multimap(name: &str) -> MultimapTableDefinition<'_, &'static [u8], &'static [u8]> {
    MultimapTableDefinition::new(name)
}

/// Statistics for one named tree.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TreeStat {
    /// Number of entries.
    pub entries: u64,
    /// Height of the B-tree.
    pub tree_height: u32,
    /// Number of leaf pages.
    pub leaf_pages: u64,
    /// Number of branch pages.
    pub branch_pages: u64,
    /// Bytes of stored key/value data in leaves.
    pub stored_bytes: u64,
}

/// A data store bound to one redb database file.
///
/// Readers see a consistent snapshot taken at transaction start and
/// never block the writer. At most one write transaction is active at a
/// time; a committed write is durable before the next command is
/// acknowledged. Dropping an uncommitted [`WriteTxn`] aborts it.
#[derive(Debug)]
pub struct DataStore {
    db: Database,
    metadata: StoreMetadata,
    path: PathBuf,
}

impl DataStore {
    /// Opens or creates a store at the given path.
    ///
    /// A new store is initialized with fresh [`StoreMetadata`]; an
    /// existing one is validated against [`SCHEMA_VERSION`] and its
    /// `last_opened_at` stamp is refreshed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is corrupted, locked by another
    /// process, or carries an incompatible schema version.
    #[instrument(fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let existed = path.exists();

        debug!(existed, "Opening data store");

        let db = Database::builder()
            .create(path)
            .map_err(StorageError::from)?;

        if existed {
            Self::open_existing(db, path.to_path_buf())
        } else {
            Self::initialize_new(db, path.to_path_buf())
        }
    }

    /// Initializes a fresh store with metadata.
    fn initialize_new(db: Database, path: PathBuf) -> Result<Self> {
        info!("Initializing new store");

        let metadata = StoreMetadata::new();
        let write_txn = db.begin_write().map_err(StorageError::from)?;
        {
            let mut meta = write_txn.open_table(tree(INTERNAL_META_TREE))?;
            let bytes = bincode::serialize(&metadata).map_err(StorageError::from)?;
            meta.insert(METADATA_KEY, bytes.as_slice())?;
        }
        write_txn.commit().map_err(StorageError::from)?;

        info!(schema_version = SCHEMA_VERSION, "Store initialized");
        Ok(Self { db, metadata, path })
    }

    /// Opens and validates an existing store.
    fn open_existing(db: Database, path: PathBuf) -> Result<Self> {
        let read_txn = db.begin_read().map_err(StorageError::from)?;
        let metadata = {
            let meta = read_txn
                .open_table(tree(INTERNAL_META_TREE))
                .map_err(|e| StorageError::corrupted(format!("Cannot open metadata tree: {}", e)))?;
            let bytes = meta
                .get(METADATA_KEY)
                .map_err(StorageError::from)?
                .ok_or_else(|| StorageError::corrupted("Missing store metadata"))?;
            bincode::deserialize::<StoreMetadata>(bytes.value())
                .map_err(|e| StorageError::corrupted(format!("Invalid metadata format: {}", e)))?
        };
        drop(read_txn);

        if metadata.schema_version != SCHEMA_VERSION {
            warn!(
                expected = SCHEMA_VERSION,
                found = metadata.schema_version,
                "Schema version mismatch"
            );
            return Err(Error::Storage(StorageError::SchemaVersionMismatch {
                expected: SCHEMA_VERSION,
                found: metadata.schema_version,
            }));
        }

        let mut metadata = metadata;
        metadata.touch();

        let write_txn = db.begin_write().map_err(StorageError::from)?;
        {
            let mut meta = write_txn.open_table(tree(INTERNAL_META_TREE))?;
            let bytes = bincode::serialize(&metadata).map_err(StorageError::from)?;
            meta.insert(METADATA_KEY, bytes.as_slice())?;
        }
        write_txn.commit().map_err(StorageError::from)?;

        debug!(schema_version = metadata.schema_version, "Store opened");
        Ok(Self { db, metadata, path })
    }

    /// Rewrites the stored metadata for the current schema version.
    ///
    /// Used by the `Upgrade` protocol command. Opens the store without
    /// the version gate and stamps it with [`SCHEMA_VERSION`]. Returns
    /// true if the version actually changed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Corrupted`] if no metadata record can be
    /// read at all.
    pub fn upgrade(path: impl AsRef<Path>) -> Result<bool> {
        let db = Database::builder()
            .create(path.as_ref())
            .map_err(StorageError::from)?;

        let read_txn = db.begin_read().map_err(StorageError::from)?;
        let mut metadata = {
            let meta = read_txn
                .open_table(tree(INTERNAL_META_TREE))
                .map_err(|e| StorageError::corrupted(format!("Cannot open metadata tree: {}", e)))?;
            let bytes = meta
                .get(METADATA_KEY)
                .map_err(StorageError::from)?
                .ok_or_else(|| StorageError::corrupted("Missing store metadata"))?;
            bincode::deserialize::<StoreMetadata>(bytes.value())
                .map_err(|e| StorageError::corrupted(format!("Invalid metadata format: {}", e)))?
        };
        drop(read_txn);

        let changed = metadata.schema_version != SCHEMA_VERSION;
        metadata.schema_version = SCHEMA_VERSION;
        metadata.touch();

        let write_txn = db.begin_write().map_err(StorageError::from)?;
        {
            let mut meta = write_txn.open_table(tree(INTERNAL_META_TREE))?;
            let bytes = bincode::serialize(&metadata).map_err(StorageError::from)?;
            meta.insert(METADATA_KEY, bytes.as_slice())?;
        }
        write_txn.commit().map_err(StorageError::from)?;

        if changed {
            info!(version = SCHEMA_VERSION, "Store upgraded");
        }
        Ok(changed)
    }

    /// Begins a read-only snapshot transaction.
    ///
    /// Multiple readers may be active concurrently; none blocks the
    /// writer. The snapshot pins database space until dropped.
    pub fn begin_read(&self) -> Result<ReadTxn> {
        let txn = self.db.begin_read().map_err(StorageError::from)?;
        Ok(ReadTxn { txn })
    }

    /// Begins the (single) write transaction.
    pub fn begin_write(&self) -> Result<WriteTxn> {
        let txn = self.db.begin_write().map_err(StorageError::from)?;
        Ok(WriteTxn { txn })
    }

    /// Returns the store metadata read at open time.
    pub fn metadata(&self) -> &StoreMetadata {
        &self.metadata
    }

    /// Returns the path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A read-only snapshot.
///
/// All reads observe the store as of transaction start.
pub struct ReadTxn {
    txn: redb::ReadTransaction,
}

/// Treats a missing table as an empty one for read paths.
macro_rules! table_or_return {
    ($open:expr, $missing:expr) => {
        match $open {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok($missing),
            Err(e) => return Err(StorageError::from(e).into()),
        }
    };
}

impl ReadTxn {
    /// Reads one value as an owned copy.
    ///
    /// A missing tree or key yields `Ok(None)`; absence is not an error
    /// for readers.
    pub fn get(&self, tree_name: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let table = table_or_return!(self.txn.open_table(tree(tree_name)), None);
        let value = table
            .get(key)
            .map_err(StorageError::from)?
            .map(|guard| guard.value().to_vec());
        Ok(value)
    }

    /// Scans entries in key order starting at `start` (or the first key).
    ///
    /// The visitor receives borrowed key/value slices valid only for the
    /// duration of the call and returns `true` to continue. Returns the
    /// number of entries visited.
    pub fn scan(
        &self,
        tree_name: &str,
        start: Option<&[u8]>,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<usize> {
        let table = table_or_return!(self.txn.open_table(tree(tree_name)), 0);
        let iter = match start {
            Some(start) => table.range(start..).map_err(StorageError::from)?,
            None => table.range::<&[u8]>(..).map_err(StorageError::from)?,
        };
        let mut visited = 0;
        for entry in iter {
            let (key, value) = entry.map_err(StorageError::from)?;
            visited += 1;
            if !visit(key.value(), value.value()) {
                break;
            }
        }
        Ok(visited)
    }

    /// Scans an inclusive key range in ascending order.
    pub fn scan_range(
        &self,
        tree_name: &str,
        from: &[u8],
        to: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<usize> {
        let table = table_or_return!(self.txn.open_table(tree(tree_name)), 0);
        let iter = table.range(from..=to).map_err(StorageError::from)?;
        let mut visited = 0;
        for entry in iter {
            let (key, value) = entry.map_err(StorageError::from)?;
            visited += 1;
            if !visit(key.value(), value.value()) {
                break;
            }
        }
        Ok(visited)
    }

    /// Scans an inclusive key range in descending order.
    pub fn scan_range_rev(
        &self,
        tree_name: &str,
        from: &[u8],
        to: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<usize> {
        let table = table_or_return!(self.txn.open_table(tree(tree_name)), 0);
        let iter = table.range(from..=to).map_err(StorageError::from)?;
        let mut visited = 0;
        for entry in iter.rev() {
            let (key, value) = entry.map_err(StorageError::from)?;
            visited += 1;
            if !visit(key.value(), value.value()) {
                break;
            }
        }
        Ok(visited)
    }

    /// Collects all multimap values stored under a key.
    pub fn multimap_get(&self, tree_name: &str, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        let table = table_or_return!(
            self.txn.open_multimap_table(multimap(tree_name)),
            Vec::new()
        );
        let mut out = Vec::new();
        for value in table.get(key).map_err(StorageError::from)? {
            out.push(value.map_err(StorageError::from)?.value().to_vec());
        }
        Ok(out)
    }

    /// Scans a multimap over an inclusive key range in ascending order.
    ///
    /// The visitor receives each `(key, value)` pair.
    pub fn multimap_scan_range(
        &self,
        tree_name: &str,
        from: &[u8],
        to: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<usize> {
        let table = table_or_return!(self.txn.open_multimap_table(multimap(tree_name)), 0);
        let iter = table.range(from..=to).map_err(StorageError::from)?;
        let mut visited = 0;
        'outer: for entry in iter {
            let (key, values) = entry.map_err(StorageError::from)?;
            for value in values {
                let value = value.map_err(StorageError::from)?;
                visited += 1;
                if !visit(key.value(), value.value()) {
                    break 'outer;
                }
            }
        }
        Ok(visited)
    }

    /// Returns statistics for a tree, or `None` if it does not exist.
    pub fn stat(&self, tree_name: &str) -> Result<Option<TreeStat>> {
        let table = table_or_return!(self.txn.open_table(tree(tree_name)), None);
        let stats = table.stats().map_err(StorageError::from)?;
        Ok(Some(TreeStat {
            entries: table.len().map_err(StorageError::from)?,
            tree_height: stats.tree_height(),
            leaf_pages: stats.leaf_pages(),
            branch_pages: stats.branch_pages(),
            stored_bytes: stats.stored_bytes(),
        }))
    }
}

/// The single write transaction.
///
/// Commits atomically via [`WriteTxn::commit`]; dropping without commit
/// aborts and rolls back every change made through it.
pub struct WriteTxn {
    txn: redb::WriteTransaction,
}

impl WriteTxn {
    /// Writes one key/value pair, creating the tree on first use.
    pub fn put(&mut self, tree_name: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let mut table = self
            .txn
            .open_table(tree(tree_name))
            .map_err(StorageError::from)?;
        table.insert(key, value).map_err(StorageError::from)?;
        Ok(())
    }

    /// Deletes one key. Returns true if it was present.
    pub fn delete(&mut self, tree_name: &str, key: &[u8]) -> Result<bool> {
        let mut table = match self.txn.open_table(tree(tree_name)) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(false),
            Err(e) => return Err(StorageError::from(e).into()),
        };
        let removed = table.remove(key).map_err(StorageError::from)?.is_some();
        Ok(removed)
    }

    /// Reads one value through the write transaction (sees uncommitted
    /// writes of this transaction).
    pub fn get(&self, tree_name: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let table = table_or_return!(self.txn.open_table(tree(tree_name)), None);
        let value = table
            .get(key)
            .map_err(StorageError::from)?
            .map(|guard| guard.value().to_vec());
        Ok(value)
    }

    /// Scans in key order, like [`ReadTxn::scan`], but observing
    /// uncommitted writes.
    pub fn scan(
        &self,
        tree_name: &str,
        start: Option<&[u8]>,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<usize> {
        let table = table_or_return!(self.txn.open_table(tree(tree_name)), 0);
        let iter = match start {
            Some(start) => table.range(start..).map_err(StorageError::from)?,
            None => table.range::<&[u8]>(..).map_err(StorageError::from)?,
        };
        let mut visited = 0;
        for entry in iter {
            let (key, value) = entry.map_err(StorageError::from)?;
            visited += 1;
            if !visit(key.value(), value.value()) {
                break;
            }
        }
        Ok(visited)
    }

    /// Scans an inclusive key range in ascending order, observing
    /// uncommitted writes.
    pub fn scan_range(
        &self,
        tree_name: &str,
        from: &[u8],
        to: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<usize> {
        let table = table_or_return!(self.txn.open_table(tree(tree_name)), 0);
        let iter = table.range(from..=to).map_err(StorageError::from)?;
        let mut visited = 0;
        for entry in iter {
            let (key, value) = entry.map_err(StorageError::from)?;
            visited += 1;
            if !visit(key.value(), value.value()) {
                break;
            }
        }
        Ok(visited)
    }

    /// Inserts a multimap pair. Returns true if the pair was new.
    pub fn multimap_insert(&mut self, tree_name: &str, key: &[u8], value: &[u8]) -> Result<bool> {
        let mut table = self
            .txn
            .open_multimap_table(multimap(tree_name))
            .map_err(StorageError::from)?;
        let existed = table.insert(key, value).map_err(StorageError::from)?;
        Ok(!existed)
    }

    /// Removes a multimap pair. Returns true if it was present.
    pub fn multimap_remove(&mut self, tree_name: &str, key: &[u8], value: &[u8]) -> Result<bool> {
        let mut table = match self.txn.open_multimap_table(multimap(tree_name)) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(false),
            Err(e) => return Err(StorageError::from(e).into()),
        };
        Ok(table.remove(key, value).map_err(StorageError::from)?)
    }

    /// Collects all multimap values under a key, observing uncommitted
    /// writes.
    pub fn multimap_get(&self, tree_name: &str, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        let table = table_or_return!(
            self.txn.open_multimap_table(multimap(tree_name)),
            Vec::new()
        );
        let mut out = Vec::new();
        for value in table.get(key).map_err(StorageError::from)? {
            out.push(value.map_err(StorageError::from)?.value().to_vec());
        }
        Ok(out)
    }

    /// Commits the transaction. Durable once this returns.
    pub fn commit(self) -> Result<()> {
        self.txn.commit().map_err(StorageError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_creates_new_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("entitystore");

        assert!(!path.exists());
        let store = DataStore::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(store.metadata().schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn test_metadata_preserved_across_opens() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("entitystore");

        let store = DataStore::open(&path).unwrap();
        let created_at = store.metadata().created_at;
        drop(store);

        std::thread::sleep(std::time::Duration::from_millis(2));
        let store = DataStore::open(&path).unwrap();
        assert_eq!(store.metadata().created_at, created_at);
        assert!(store.metadata().last_opened_at > created_at);
    }

    #[test]
    fn test_put_get_roundtrip() {
        let dir = tempdir().unwrap();
        let store = DataStore::open(dir.path().join("db")).unwrap();

        let mut txn = store.begin_write().unwrap();
        txn.put("entity.mail.main", b"key1", b"value1").unwrap();
        txn.commit().unwrap();

        let read = store.begin_read().unwrap();
        assert_eq!(
            read.get("entity.mail.main", b"key1").unwrap(),
            Some(b"value1".to_vec())
        );
        assert_eq!(read.get("entity.mail.main", b"missing").unwrap(), None);
        assert_eq!(read.get("no.such.tree", b"key1").unwrap(), None);
    }

    #[test]
    fn test_uncommitted_write_rolls_back() {
        let dir = tempdir().unwrap();
        let store = DataStore::open(dir.path().join("db")).unwrap();

        {
            let mut txn = store.begin_write().unwrap();
            txn.put("t", b"k", b"v").unwrap();
            // dropped without commit
        }

        let read = store.begin_read().unwrap();
        assert_eq!(read.get("t", b"k").unwrap(), None);
    }

    #[test]
    fn test_reader_sees_snapshot() {
        let dir = tempdir().unwrap();
        let store = DataStore::open(dir.path().join("db")).unwrap();

        let mut txn = store.begin_write().unwrap();
        txn.put("t", b"k", b"v1").unwrap();
        txn.commit().unwrap();

        let read = store.begin_read().unwrap();

        let mut txn = store.begin_write().unwrap();
        txn.put("t", b"k", b"v2").unwrap();
        txn.commit().unwrap();

        // Snapshot taken before the second commit still sees v1.
        assert_eq!(read.get("t", b"k").unwrap(), Some(b"v1".to_vec()));

        let fresh = store.begin_read().unwrap();
        assert_eq!(fresh.get("t", b"k").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_scan_in_key_order() {
        let dir = tempdir().unwrap();
        let store = DataStore::open(dir.path().join("db")).unwrap();

        let mut txn = store.begin_write().unwrap();
        txn.put("t", b"b", b"2").unwrap();
        txn.put("t", b"a", b"1").unwrap();
        txn.put("t", b"c", b"3").unwrap();
        txn.commit().unwrap();

        let read = store.begin_read().unwrap();
        let mut keys = Vec::new();
        read.scan("t", None, &mut |k, _v| {
            keys.push(k.to_vec());
            true
        })
        .unwrap();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

        // Scan from a start key.
        let mut keys = Vec::new();
        read.scan("t", Some(b"b"), &mut |k, _v| {
            keys.push(k.to_vec());
            true
        })
        .unwrap();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_scan_early_stop() {
        let dir = tempdir().unwrap();
        let store = DataStore::open(dir.path().join("db")).unwrap();

        let mut txn = store.begin_write().unwrap();
        for i in 0u8..10 {
            txn.put("t", &[i], &[i]).unwrap();
        }
        txn.commit().unwrap();

        let read = store.begin_read().unwrap();
        let mut seen = 0;
        read.scan("t", None, &mut |_k, _v| {
            seen += 1;
            seen < 3
        })
        .unwrap();
        assert_eq!(seen, 3);
    }

    #[test]
    fn test_scan_range_rev() {
        let dir = tempdir().unwrap();
        let store = DataStore::open(dir.path().join("db")).unwrap();

        let mut txn = store.begin_write().unwrap();
        for i in 1u8..=5 {
            txn.put("t", &[i], &[i]).unwrap();
        }
        txn.commit().unwrap();

        let read = store.begin_read().unwrap();
        let mut keys = Vec::new();
        read.scan_range_rev("t", &[2], &[4], &mut |k, _v| {
            keys.push(k[0]);
            true
        })
        .unwrap();
        assert_eq!(keys, vec![4, 3, 2]);
    }

    #[test]
    fn test_multimap_duplicates() {
        let dir = tempdir().unwrap();
        let store = DataStore::open(dir.path().join("db")).unwrap();

        let mut txn = store.begin_write().unwrap();
        assert!(txn.multimap_insert("idx", b"thread-1", b"mail-a").unwrap());
        assert!(txn.multimap_insert("idx", b"thread-1", b"mail-b").unwrap());
        // Duplicate pair is reported as not-new.
        assert!(!txn.multimap_insert("idx", b"thread-1", b"mail-a").unwrap());
        txn.commit().unwrap();

        let read = store.begin_read().unwrap();
        let values = read.multimap_get("idx", b"thread-1").unwrap();
        assert_eq!(values.len(), 2);
        assert!(values.contains(&b"mail-a".to_vec()));
        assert!(values.contains(&b"mail-b".to_vec()));

        let mut txn = store.begin_write().unwrap();
        assert!(txn.multimap_remove("idx", b"thread-1", b"mail-a").unwrap());
        assert!(!txn.multimap_remove("idx", b"thread-1", b"mail-a").unwrap());
        txn.commit().unwrap();

        let read = store.begin_read().unwrap();
        assert_eq!(read.multimap_get("idx", b"thread-1").unwrap().len(), 1);
    }

    #[test]
    fn test_stat() {
        let dir = tempdir().unwrap();
        let store = DataStore::open(dir.path().join("db")).unwrap();

        assert_eq!(store.begin_read().unwrap().stat("t").unwrap(), None);

        let mut txn = store.begin_write().unwrap();
        txn.put("t", b"a", b"1").unwrap();
        txn.put("t", b"b", b"2").unwrap();
        txn.commit().unwrap();

        let stat = store.begin_read().unwrap().stat("t").unwrap().unwrap();
        assert_eq!(stat.entries, 2);
        assert!(stat.tree_height >= 1);
    }

    #[test]
    fn test_upgrade_is_idempotent_on_current_version() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let store = DataStore::open(&path).unwrap();
        drop(store);

        assert!(!DataStore::upgrade(&path).unwrap());
        // Still opens fine.
        DataStore::open(&path).unwrap();
    }
}
