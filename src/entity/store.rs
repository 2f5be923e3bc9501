//! The revisioned, typed entity store.
//!
//! Wraps the [`DataStore`] with entity semantics: every mutation writes a
//! full snapshot record keyed by `(id, revision)`, bumps the per-instance
//! revision clock, appends to the revision log, and maintains the
//! secondary indices declared by the type registry.
//!
//! Mutations normally run inside a pipeline-managed transaction
//! ([`EntityStore::start_transaction`] / [`EntityStore::commit_transaction`]);
//! called standalone, each mutation opens and commits its own transaction.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, instrument, trace, warn};

use super::types::{Entity, EntityMetadata, StoredRecord, TypeRegistry};
use crate::error::{Error, NotFoundError, Result, StorageError};
use crate::storage::schema::{
    self, RevisionLogEntry, CLEANUP_REVISION_KEY, ENTITY_STORE_FILE, INTERNAL_META_TREE,
    MAX_REVISION_KEY, REVISION_LOG_TREE,
};
use crate::storage::{DataStore, ReadTxn, WriteTxn};
use crate::types::{EntityId, EntityType, PropertyName, Revision};
use crate::value::{PropertyMap, Value};

/// Subdirectory of the instance dir holding staged blob payloads.
const BLOB_DIR: &str = "blobs";

/// Expands a value into its index entries.
///
/// Lists fan out to one entry per element; `Null` produces none.
fn index_values(value: &Value) -> Vec<Vec<u8>> {
    match value {
        Value::Null => Vec::new(),
        Value::List(items) => items
            .iter()
            .filter(|v| !v.is_null())
            .map(Value::index_bytes)
            .collect(),
        other => vec![other.index_bytes()],
    }
}

/// The typed, revisioned store for one resource instance.
pub struct EntityStore {
    store: DataStore,
    registry: Arc<TypeRegistry>,
    blob_dir: PathBuf,
    txn: Option<WriteTxn>,
    committed_max: Revision,
    pending_max: Revision,
}

impl EntityStore {
    /// Opens the entity store inside an instance directory.
    ///
    /// Creates `<dir>/entitystore` and `<dir>/blobs/` if absent and
    /// restores the persisted `max_revision`.
    #[instrument(skip(registry), fields(dir = %dir.as_ref().display()))]
    pub fn open(dir: impl AsRef<Path>, registry: Arc<TypeRegistry>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let blob_dir = dir.join(BLOB_DIR);
        fs::create_dir_all(&blob_dir)?;

        let store = DataStore::open(dir.join(ENTITY_STORE_FILE))?;

        let max = {
            let read = store.begin_read()?;
            read.get(INTERNAL_META_TREE, MAX_REVISION_KEY)?
                .and_then(|bytes| bytes.try_into().ok().map(Revision::from_be_bytes))
                .unwrap_or(Revision::ZERO)
        };

        debug!(max_revision = max.get(), "Entity store opened");

        Ok(Self {
            store,
            registry,
            blob_dir,
            txn: None,
            committed_max: max,
            pending_max: max,
        })
    }

    /// The registry this store validates and indexes against.
    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// The directory managed payloads are staged into.
    pub fn blob_dir(&self) -> &Path {
        &self.blob_dir
    }

    /// Highest committed-or-pending revision.
    pub fn max_revision(&self) -> Revision {
        self.pending_max
    }

    // ========================================================================
    // Transaction control (driven by the pipeline)
    // ========================================================================

    /// Opens the write transaction for a batch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PreconditionFailed`] if one is already open.
    pub fn start_transaction(&mut self) -> Result<()> {
        if self.txn.is_some() {
            return Err(Error::precondition("write transaction already open"));
        }
        self.txn = Some(self.store.begin_write()?);
        Ok(())
    }

    /// Commits the open transaction; all batched mutations become
    /// durable and the revision clock advances for readers.
    pub fn commit_transaction(&mut self) -> Result<()> {
        let txn = self
            .txn
            .take()
            .ok_or_else(|| Error::precondition("no write transaction open"))?;
        txn.commit()?;
        self.committed_max = self.pending_max;
        Ok(())
    }

    /// Aborts the open transaction, rolling back every mutation in the
    /// batch and rewinding the revision clock.
    pub fn abort_transaction(&mut self) {
        self.txn = None;
        self.pending_max = self.committed_max;
    }

    /// True while a batch transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    /// Runs `op` inside the open transaction, or inside a one-shot
    /// transaction when none is open.
    fn with_txn<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.txn.is_some() {
            return op(self);
        }
        self.start_transaction()?;
        match op(self) {
            Ok(value) => {
                self.commit_transaction()?;
                Ok(value)
            }
            Err(err) => {
                self.abort_transaction();
                Err(err)
            }
        }
    }

    fn txn_mut(&mut self) -> &mut WriteTxn {
        self.txn.as_mut().expect("transaction is open")
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Adds a new entity, allocating the next revision.
    ///
    /// The entity's id must not already be present (not even as a
    /// tombstone). All present properties are treated as changed.
    pub fn add(&mut self, entity: Entity) -> Result<Revision> {
        self.with_txn(|store| store.add_inner(entity))
    }

    fn add_inner(&mut self, mut entity: Entity) -> Result<Revision> {
        let entity_type = entity.entity_type().clone();
        let id = entity.id();

        if self.contains_in_txn(&entity_type, &id)? {
            return Err(Error::precondition(format!(
                "an entity with id {} already exists",
                id
            )));
        }

        if let Some(caps) = self.registry.capabilities(&entity_type) {
            caps.schema.validate(entity.properties())?;
        }
        self.stage_blobs(&mut entity)?;

        let revision = self.pending_max.next();
        entity.metadata.revision = revision;
        entity.mark_all_changed();

        trace!(
            entity_type = %entity_type,
            id = %id,
            revision = revision.get(),
            "add entity"
        );

        self.write_record(&entity)?;
        self.update_indices(&entity_type, &id, None, Some(&entity), None)?;
        self.append_revision_log(revision, &entity_type, &id)?;
        self.bump_max_revision(revision)?;
        Ok(revision)
    }

    /// Applies a delta to the latest record and writes a new revision.
    ///
    /// Properties in `delta` are set, properties in `deletions` are
    /// unset; everything else carries over. Index entries are refreshed
    /// only for the changed properties.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if the entity does not exist,
    /// [`Error::PreconditionFailed`] if it has been deleted.
    pub fn modify(
        &mut self,
        entity_type: &EntityType,
        id: &EntityId,
        delta: PropertyMap,
        deletions: &[PropertyName],
        replay_to_source: bool,
    ) -> Result<Revision> {
        self.with_txn(|store| {
            let current = store.read_latest_in_txn(entity_type, id)?.ok_or_else(|| {
                Error::from(NotFoundError::entity(entity_type.as_str(), id))
            })?;
            let new = Self::apply_delta(&current, delta, deletions, replay_to_source);
            store.write_modified_inner(&current, new)
        })
    }

    /// Builds the successor entity from the current record and a delta.
    ///
    /// The changed-properties set of the result contains exactly the
    /// delta and deletion names.
    pub fn apply_delta(
        current: &Entity,
        delta: PropertyMap,
        deletions: &[PropertyName],
        replay_to_source: bool,
    ) -> Entity {
        let mut new = current.clone();
        new.metadata.changed_properties = BTreeSet::new();
        new.metadata.replay_to_source = replay_to_source;
        for (name, value) in delta.iter() {
            new.set(name.clone(), value.clone());
        }
        for name in deletions {
            new.unset(name);
        }
        new
    }

    /// Writes an already-merged successor record for `current`.
    ///
    /// Used by the pipeline after preprocessors have run over the merged
    /// entity. Index entries are refreshed for `new.changed_properties`.
    pub fn write_modified(&mut self, current: &Entity, new: Entity) -> Result<Revision> {
        let current = current.clone();
        self.with_txn(move |store| store.write_modified_inner(&current, new))
    }

    fn write_modified_inner(&mut self, current: &Entity, mut new: Entity) -> Result<Revision> {
        if current.is_deleted() {
            return Err(Error::precondition(format!(
                "cannot modify deleted entity {}",
                current.id()
            )));
        }
        let entity_type = new.entity_type().clone();
        let id = new.id();

        if let Some(caps) = self.registry.capabilities(&entity_type) {
            caps.schema.validate(new.properties())?;
        }
        self.stage_blobs(&mut new)?;

        let revision = self.pending_max.next();
        new.metadata.revision = revision;
        new.metadata.deleted = false;

        trace!(
            entity_type = %entity_type,
            id = %id,
            revision = revision.get(),
            changed = new.metadata.changed_properties.len(),
            "modify entity"
        );

        let changed = new.metadata.changed_properties.clone();
        self.write_record(&new)?;
        self.update_indices(&entity_type, &id, Some(current), Some(&new), Some(&changed))?;
        self.append_revision_log(revision, &entity_type, &id)?;
        self.bump_max_revision(revision)?;
        Ok(revision)
    }

    /// Writes a tombstone revision and removes all index entries that
    /// referenced the latest state.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if the entity does not exist,
    /// [`Error::PreconditionFailed`] if it is already deleted.
    pub fn remove(
        &mut self,
        entity_type: &EntityType,
        id: &EntityId,
        replay_to_source: bool,
    ) -> Result<Revision> {
        let entity_type = entity_type.clone();
        let id = *id;
        self.with_txn(move |store| {
            let current = store
                .read_latest_in_txn(&entity_type, &id)?
                .ok_or_else(|| Error::from(NotFoundError::entity(entity_type.as_str(), id)))?;
            if current.is_deleted() {
                return Err(Error::precondition(format!(
                    "entity {} is already deleted",
                    id
                )));
            }

            let revision = store.pending_max.next();
            let mut tombstone = Entity::with_id(entity_type.clone(), id);
            tombstone.metadata = EntityMetadata {
                revision,
                deleted: true,
                replay_to_source,
                changed_properties: current.properties().names().cloned().collect(),
            };

            trace!(entity_type = %entity_type, id = %id, revision = revision.get(), "remove entity");

            store.write_record(&tombstone)?;
            store.update_indices(&entity_type, &id, Some(&current), None, None)?;
            store.append_revision_log(revision, &entity_type, &id)?;
            store.bump_max_revision(revision)?;
            Ok(revision)
        })
    }

    /// Prunes all records with revision < `threshold`, keeping the last
    /// surviving record of each live entity. Tombstones older than the
    /// threshold are removed entirely together with their log entries.
    ///
    /// Returns true if anything was removed.
    pub fn cleanup_revisions(&mut self, threshold: Revision) -> Result<bool> {
        self.with_txn(|store| store.cleanup_inner(threshold))
    }

    fn cleanup_inner(&mut self, threshold: Revision) -> Result<bool> {
        // Collect candidates first; mutating while scanning is not
        // supported by the transaction wrapper.
        let mut candidates: Vec<(Revision, RevisionLogEntry)> = Vec::new();
        {
            let txn = self.txn.as_ref().expect("transaction is open");
            txn.scan(REVISION_LOG_TREE, None, &mut |key, value| {
                let Ok(rev_bytes) = <[u8; 8]>::try_from(key) else {
                    return true;
                };
                let revision = Revision::from_be_bytes(rev_bytes);
                if revision >= threshold {
                    return false;
                }
                if let Ok(entry) = bincode::deserialize::<RevisionLogEntry>(value) {
                    candidates.push((revision, entry));
                }
                true
            })?;
        }

        let mut removed_any = false;
        for (revision, entry) in candidates {
            let latest = self.latest_record_in_txn(&entry.entity_type, &entry.id)?;
            let Some((latest_revision, latest_record)) = latest else {
                continue;
            };

            let is_latest = revision == latest_revision;
            let prune = !is_latest || latest_record.deleted;
            if !prune {
                continue;
            }

            let main = schema::entity_main_tree(&entry.entity_type);
            let key = schema::entity_revision_key(&entry.id, revision);
            let txn = self.txn_mut();
            txn.delete(&main, &key)?;
            txn.delete(REVISION_LOG_TREE, &schema::revision_log_key(revision))?;
            removed_any = true;
        }

        let threshold_bytes = threshold.to_be_bytes();
        self.txn_mut()
            .put(INTERNAL_META_TREE, CLEANUP_REVISION_KEY, &threshold_bytes)?;

        debug!(threshold = threshold.get(), removed_any, "cleanup revisions");
        Ok(removed_any)
    }

    // ========================================================================
    // Composite lookups (maintained by preprocessors)
    // ========================================================================

    /// Writes an entry in a composite lookup tree (e.g. messageId → threadId).
    pub fn lookup_put(
        &mut self,
        entity_type: &EntityType,
        name: &str,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        let tree = schema::lookup_tree(entity_type, name);
        let key = key.to_vec();
        let value = value.to_vec();
        self.with_txn(move |store| store.txn_mut().put(&tree, &key, &value))
    }

    /// Reads an entry from a composite lookup tree.
    pub fn lookup_get(
        &self,
        entity_type: &EntityType,
        name: &str,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let tree = schema::lookup_tree(entity_type, name);
        match &self.txn {
            Some(txn) => txn.get(&tree, key),
            None => self.store.begin_read()?.get(&tree, key),
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Returns the latest non-deleted record, or `None` if the entity is
    /// missing or deleted.
    pub fn read_latest(&self, entity_type: &EntityType, id: &EntityId) -> Result<Option<Entity>> {
        match &self.txn {
            Some(_) => self.read_latest_in_txn(entity_type, id),
            None => self.snapshot()?.read_latest(entity_type, id),
        }
    }

    /// Point-in-time read of a specific revision record.
    pub fn read_revision(
        &self,
        entity_type: &EntityType,
        id: &EntityId,
        revision: Revision,
    ) -> Result<Entity> {
        if let Some(txn) = &self.txn {
            let main = schema::entity_main_tree(entity_type);
            let key = schema::entity_revision_key(id, revision);
            let bytes = txn
                .get(&main, &key)?
                .ok_or_else(|| NotFoundError::revision(id, revision.get()))?;
            let record: StoredRecord = bincode::deserialize(&bytes).map_err(StorageError::from)?;
            return Ok(record.into_entity(entity_type.clone(), *id, revision));
        }
        self.snapshot()?.read_revision(entity_type, id, revision)
    }

    /// True if any record for the id exists, including tombstones.
    pub fn contains(&self, entity_type: &EntityType, id: &EntityId) -> Result<bool> {
        match &self.txn {
            Some(_) => self.contains_in_txn(entity_type, id),
            None => self.snapshot()?.contains(entity_type, id),
        }
    }

    /// Ids of entities whose indexed property currently equals `value`.
    pub fn index_lookup(
        &self,
        entity_type: &EntityType,
        property: &PropertyName,
        value: &Value,
    ) -> Result<Vec<EntityId>> {
        match &self.txn {
            Some(txn) => {
                let tree = schema::index_tree(entity_type, property);
                let ids = txn.multimap_get(&tree, &value.index_bytes())?;
                Ok(ids.iter().filter_map(|b| EntityId::from_slice(b)).collect())
            }
            None => self.snapshot()?.index_lookup(entity_type, property, value),
        }
    }

    /// Walks the revision log over `[from, to]` in revision order.
    pub fn scan_revisions(
        &self,
        from: Revision,
        to: Revision,
        visit: &mut dyn FnMut(Revision, &RevisionLogEntry) -> bool,
    ) -> Result<()> {
        self.snapshot()?.scan_revisions(from, to, visit)
    }

    /// Takes a read snapshot for query execution.
    ///
    /// The snapshot pins database space until dropped; values read from
    /// it are owned copies.
    pub fn snapshot(&self) -> Result<EntityReader> {
        Ok(EntityReader {
            txn: self.store.begin_read()?,
            registry: Arc::clone(&self.registry),
            max_revision: self.committed_max,
        })
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn contains_in_txn(&self, entity_type: &EntityType, id: &EntityId) -> Result<bool> {
        Ok(self
            .latest_record_in_txn(entity_type, id)?
            .is_some())
    }

    fn read_latest_in_txn(
        &self,
        entity_type: &EntityType,
        id: &EntityId,
    ) -> Result<Option<Entity>> {
        let Some((revision, record)) = self.latest_record_in_txn(entity_type, id)? else {
            return Ok(None);
        };
        if record.deleted {
            return Ok(None);
        }
        Ok(Some(record.into_entity(entity_type.clone(), *id, revision)))
    }

    fn latest_record_in_txn(
        &self,
        entity_type: &EntityType,
        id: &EntityId,
    ) -> Result<Option<(Revision, StoredRecord)>> {
        let main = schema::entity_main_tree(entity_type);
        let from = schema::entity_range_start(id);
        let to = schema::entity_range_end(id);
        let mut found: Option<(Revision, StoredRecord)> = None;
        let mut decode_error = false;

        let mut visit = |key: &[u8], value: &[u8]| {
            if let Some((_, revision)) = schema::decode_entity_revision_key(key) {
                match bincode::deserialize::<StoredRecord>(value) {
                    Ok(record) => found = Some((revision, record)),
                    Err(_) => decode_error = true,
                }
            }
            false
        };

        match &self.txn {
            Some(txn) => {
                // The write transaction wrapper has no reverse scan;
                // walk forward and keep the last record.
                let mut last: Option<(Vec<u8>, Vec<u8>)> = None;
                txn.scan_range(&main, &from, &to, &mut |k, v| {
                    last = Some((k.to_vec(), v.to_vec()));
                    true
                })?;
                if let Some((k, v)) = last {
                    visit(&k, &v);
                }
            }
            None => {
                let read = self.store.begin_read()?;
                read.scan_range_rev(&main, &from, &to, &mut visit)?;
            }
        }

        if decode_error {
            return Err(StorageError::corrupted(format!(
                "undecodable entity record for {}",
                id
            ))
            .into());
        }
        Ok(found)
    }

    fn write_record(&mut self, entity: &Entity) -> Result<()> {
        let main = schema::entity_main_tree(entity.entity_type());
        let key = schema::entity_revision_key(&entity.id(), entity.revision());
        let bytes = bincode::serialize(&StoredRecord::from_entity(entity))
            .map_err(StorageError::from)?;
        self.txn_mut().put(&main, &key, &bytes)
    }

    fn append_revision_log(
        &mut self,
        revision: Revision,
        entity_type: &EntityType,
        id: &EntityId,
    ) -> Result<()> {
        let entry = RevisionLogEntry {
            entity_type: entity_type.clone(),
            id: *id,
        };
        let bytes = bincode::serialize(&entry).map_err(StorageError::from)?;
        self.txn_mut()
            .put(REVISION_LOG_TREE, &schema::revision_log_key(revision), &bytes)
    }

    fn bump_max_revision(&mut self, revision: Revision) -> Result<()> {
        debug_assert_eq!(revision, self.pending_max.next());
        self.pending_max = revision;
        let bytes = revision.to_be_bytes();
        self.txn_mut()
            .put(INTERNAL_META_TREE, MAX_REVISION_KEY, &bytes)
    }

    /// Refreshes secondary index entries.
    ///
    /// With `changed = None` every indexed property is refreshed (add
    /// and remove paths); otherwise only properties in the change set.
    fn update_indices(
        &mut self,
        entity_type: &EntityType,
        id: &EntityId,
        old: Option<&Entity>,
        new: Option<&Entity>,
        changed: Option<&BTreeSet<PropertyName>>,
    ) -> Result<()> {
        let indexed: Vec<PropertyName> = self
            .registry
            .index_properties(entity_type)
            .iter()
            .filter(|p| changed.map_or(true, |set| set.contains(*p)))
            .cloned()
            .collect();

        for property in indexed {
            let tree = schema::index_tree(entity_type, &property);
            if let Some(old) = old {
                if let Some(value) = old.get(property.as_str()) {
                    for bytes in index_values(value) {
                        self.txn_mut()
                            .multimap_remove(&tree, &bytes, id.as_bytes())?;
                    }
                }
            }
            if let Some(new) = new {
                if let Some(value) = new.get(property.as_str()) {
                    for bytes in index_values(value) {
                        self.txn_mut()
                            .multimap_insert(&tree, &bytes, id.as_bytes())?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Moves externally staged blob values into the managed blob dir.
    fn stage_blobs(&self, entity: &mut Entity) -> Result<()> {
        let staged: Vec<(PropertyName, PathBuf)> = entity
            .properties()
            .iter()
            .filter_map(|(name, value)| match value {
                Value::Blob(path) if !path.starts_with(&self.blob_dir) => {
                    Some((name.clone(), path.clone()))
                }
                _ => None,
            })
            .collect();

        for (name, source) in staged {
            let target = self
                .blob_dir
                .join(format!("{}_{}", entity.id(), name));
            if fs::rename(&source, &target).is_err() {
                // Cross-device staging falls back to copy + remove.
                fs::copy(&source, &target)?;
                fs::remove_file(&source)?;
            }
            debug!(property = %name, target = %target.display(), "staged blob");
            entity.set(name, Value::Blob(target));
        }
        Ok(())
    }
}

impl std::fmt::Debug for EntityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityStore")
            .field("path", &self.store.path())
            .field("max_revision", &self.pending_max)
            .field("in_transaction", &self.txn.is_some())
            .finish_non_exhaustive()
    }
}

/// A read snapshot over the entity store.
///
/// All reads observe the store as of snapshot creation. Queries hold one
/// of these for their whole execution; live queries keep it until the
/// next revision cycle.
pub struct EntityReader {
    txn: ReadTxn,
    registry: Arc<TypeRegistry>,
    max_revision: Revision,
}

impl EntityReader {
    /// Highest revision committed when the snapshot was taken.
    pub fn max_revision(&self) -> Revision {
        self.max_revision
    }

    /// Returns the latest non-deleted record, or `None`.
    pub fn read_latest(&self, entity_type: &EntityType, id: &EntityId) -> Result<Option<Entity>> {
        let Some((revision, record)) = self.latest_record(entity_type, id)? else {
            return Ok(None);
        };
        if record.deleted {
            return Ok(None);
        }
        Ok(Some(record.into_entity(entity_type.clone(), *id, revision)))
    }

    /// Point-in-time read of a specific revision record.
    pub fn read_revision(
        &self,
        entity_type: &EntityType,
        id: &EntityId,
        revision: Revision,
    ) -> Result<Entity> {
        let main = schema::entity_main_tree(entity_type);
        let key = schema::entity_revision_key(id, revision);
        let bytes = self
            .txn
            .get(&main, &key)?
            .ok_or_else(|| NotFoundError::revision(id, revision.get()))?;
        let record: StoredRecord = bincode::deserialize(&bytes).map_err(StorageError::from)?;
        Ok(record.into_entity(entity_type.clone(), *id, revision))
    }

    /// True if any record for the id exists, including tombstones.
    pub fn contains(&self, entity_type: &EntityType, id: &EntityId) -> Result<bool> {
        Ok(self.latest_record(entity_type, id)?.is_some())
    }

    /// Ids of entities whose indexed property equals `value`.
    pub fn index_lookup(
        &self,
        entity_type: &EntityType,
        property: &PropertyName,
        value: &Value,
    ) -> Result<Vec<EntityId>> {
        let tree = schema::index_tree(entity_type, property);
        let ids = self.txn.multimap_get(&tree, &value.index_bytes())?;
        Ok(ids.iter().filter_map(|b| EntityId::from_slice(b)).collect())
    }

    /// Scans an index over an inclusive value range in index order.
    ///
    /// The visitor receives `(value_bytes, id)`; return false to stop.
    pub fn index_scan(
        &self,
        entity_type: &EntityType,
        property: &PropertyName,
        from: &[u8],
        to: &[u8],
        visit: &mut dyn FnMut(&[u8], EntityId) -> bool,
    ) -> Result<()> {
        let tree = schema::index_tree(entity_type, property);
        self.txn.multimap_scan_range(&tree, from, to, &mut |key, value| {
            match EntityId::from_slice(value) {
                Some(id) => visit(key, id),
                None => true,
            }
        })?;
        Ok(())
    }

    /// Visits the latest record of every entity of a type, including
    /// tombstones when `include_deleted` is set.
    ///
    /// Return false from the visitor to stop.
    pub fn scan_type_latest(
        &self,
        entity_type: &EntityType,
        include_deleted: bool,
        visit: &mut dyn FnMut(Entity) -> bool,
    ) -> Result<()> {
        let main = schema::entity_main_tree(entity_type);
        let mut pending: Option<(EntityId, Revision, Vec<u8>)> = None;
        let mut stopped = false;

        let mut emit = |staged: (EntityId, Revision, Vec<u8>)| -> Result<bool> {
            let (id, revision, bytes) = staged;
            let record: StoredRecord =
                bincode::deserialize(&bytes).map_err(StorageError::from)?;
            if record.deleted && !include_deleted {
                return Ok(true);
            }
            Ok(visit(record.into_entity(entity_type.clone(), id, revision)))
        };

        let mut scan_result: Result<()> = Ok(());
        self.txn.scan(&main, None, &mut |key, value| {
            let Some((id, revision)) = schema::decode_entity_revision_key(key) else {
                return true;
            };
            // Keys sort by (id, revision); when the id changes, the
            // buffered record is the previous entity's latest.
            if let Some(staged) = pending.take() {
                if staged.0 != id {
                    match emit(staged) {
                        Ok(true) => {}
                        Ok(false) => {
                            stopped = true;
                            return false;
                        }
                        Err(e) => {
                            scan_result = Err(e);
                            return false;
                        }
                    }
                }
            }
            pending = Some((id, revision, value.to_vec()));
            true
        })?;
        scan_result?;

        if !stopped {
            if let Some(staged) = pending {
                emit(staged)?;
            }
        }
        Ok(())
    }

    /// Walks the revision log over `[from, to]` in revision order.
    pub fn scan_revisions(
        &self,
        from: Revision,
        to: Revision,
        visit: &mut dyn FnMut(Revision, &RevisionLogEntry) -> bool,
    ) -> Result<()> {
        self.txn.scan_range(
            REVISION_LOG_TREE,
            &schema::revision_log_key(from),
            &schema::revision_log_key(to),
            &mut |key, value| {
                let Ok(rev_bytes) = <[u8; 8]>::try_from(key) else {
                    return true;
                };
                let revision = Revision::from_be_bytes(rev_bytes);
                match bincode::deserialize::<RevisionLogEntry>(value) {
                    Ok(entry) => visit(revision, &entry),
                    Err(_) => {
                        warn!(revision = revision.get(), "undecodable revision log entry");
                        true
                    }
                }
            },
        )?;
        Ok(())
    }

    /// Reads an entry from a composite lookup tree.
    pub fn lookup_get(
        &self,
        entity_type: &EntityType,
        name: &str,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let tree = schema::lookup_tree(entity_type, name);
        self.txn.get(&tree, key)
    }

    /// The registry the snapshot was taken against.
    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    fn latest_record(
        &self,
        entity_type: &EntityType,
        id: &EntityId,
    ) -> Result<Option<(Revision, StoredRecord)>> {
        let main = schema::entity_main_tree(entity_type);
        let from = schema::entity_range_start(id);
        let to = schema::entity_range_end(id);
        let mut found: Option<(Revision, Vec<u8>)> = None;
        self.txn.scan_range_rev(&main, &from, &to, &mut |key, value| {
            if let Some((_, revision)) = schema::decode_entity_revision_key(key) {
                found = Some((revision, value.to_vec()));
            }
            false
        })?;
        match found {
            Some((revision, bytes)) => {
                let record =
                    bincode::deserialize::<StoredRecord>(&bytes).map_err(|_| {
                        StorageError::corrupted(format!("undecodable entity record for {}", id))
                    })?;
                Ok(Some((revision, record)))
            }
            None => Ok(None),
        }
    }
}
