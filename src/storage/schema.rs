//! Store layout, tree naming, and key encoding.
//!
//! Each resource instance owns two redb database files:
//!
//! - `entitystore` — entities, secondary indices, the revision log
//! - `synchronizationstore` — remote-id maps, sync state, command queues
//!
//! Within a store, named sub-databases (redb tables) follow a fixed
//! naming scheme:
//!
//! ```text
//! entity.<type>.main       revisioned records, key = [id:16][revision_be:8]
//! index.<type>.<property>  multimap, key = property value bytes, value = id
//! lookup.<type>.<name>     plain tree for composite lookups (e.g. messageId→threadId)
//! revision.log             key = revision_be, value = (type, id)
//! remote_id.<type>         remote id bytes → local id
//! remote_id.<type>.reverse local id → remote id bytes
//! queue.<name>             key = sequence_be, value = queue item
//! queue.<name>.dead        dead-lettered queue items
//! __internal.meta          store metadata, revision watermarks
//! ```
//!
//! Tree names starting with `__internal` are reserved and invisible to
//! queries.

use serde::{Deserialize, Serialize};

use crate::types::{EntityId, EntityType, PropertyName, Revision, Timestamp};

/// Current schema version.
///
/// Increment this when making breaking changes to the layout. A store
/// with a different version refuses to open until upgraded.
pub const SCHEMA_VERSION: u32 = 1;

/// File name of the primary store inside the instance directory.
pub const ENTITY_STORE_FILE: &str = "entitystore";

/// File name of the synchronization store inside the instance directory.
pub const SYNCHRONIZATION_STORE_FILE: &str = "synchronizationstore";

/// Name of the internal metadata tree.
pub const INTERNAL_META_TREE: &str = "__internal.meta";

/// Name of the revision log tree.
pub const REVISION_LOG_TREE: &str = "revision.log";

/// Metadata key for the serialized [`StoreMetadata`].
pub const METADATA_KEY: &[u8] = b"store_metadata";

/// Metadata key for the persisted `max_revision`.
pub const MAX_REVISION_KEY: &[u8] = b"max_revision";

/// Metadata key for the persisted cleanup marker.
pub const CLEANUP_REVISION_KEY: &[u8] = b"cleanup_revision";

/// Metadata key for the replay high-watermark (synchronization store).
pub const LAST_REPLAYED_REVISION_KEY: &[u8] = b"last_replayed_revision";

/// Prefix reserved for internal tree names.
pub const INTERNAL_PREFIX: &str = "__internal";

/// Returns the primary tree name for an entity type.
pub fn entity_main_tree(entity_type: &EntityType) -> String {
    format!("entity.{}.main", entity_type)
}

/// Returns the secondary index tree name for a type/property pair.
pub fn index_tree(entity_type: &EntityType, property: &PropertyName) -> String {
    format!("index.{}.{}", entity_type, property)
}

/// Returns the composite lookup tree name for a type.
pub fn lookup_tree(entity_type: &EntityType, name: &str) -> String {
    format!("lookup.{}.{}", entity_type, name)
}

/// Returns the remote-id → local-id tree name for a type.
pub fn remote_id_tree(entity_type: &EntityType) -> String {
    format!("remote_id.{}", entity_type)
}

/// Returns the local-id → remote-id tree name for a type.
pub fn remote_id_reverse_tree(entity_type: &EntityType) -> String {
    format!("remote_id.{}.reverse", entity_type)
}

/// Returns the queue tree name for a queue.
pub fn queue_tree(name: &str) -> String {
    format!("queue.{}", name)
}

/// Returns the dead-letter tree name for a queue.
pub fn queue_dead_tree(name: &str) -> String {
    format!("queue.{}.dead", name)
}

/// Returns true for tree names hidden from queries.
pub fn is_internal_tree(name: &str) -> bool {
    name.starts_with(INTERNAL_PREFIX)
}

// ============================================================================
// Key encoding
// ============================================================================

/// Encodes the primary-record key `[entity_id: 16][revision_be: 8]`.
///
/// Big-endian revisions make a forward scan over one entity's key range
/// visit revisions in ascending order.
#[inline]
pub fn entity_revision_key(id: &EntityId, revision: Revision) -> [u8; 24] {
    let mut key = [0u8; 24];
    key[..16].copy_from_slice(id.as_bytes());
    key[16..].copy_from_slice(&revision.to_be_bytes());
    key
}

/// Decodes a primary-record key back into `(id, revision)`.
///
/// Returns `None` if the key is not 24 bytes.
#[inline]
pub fn decode_entity_revision_key(key: &[u8]) -> Option<(EntityId, Revision)> {
    if key.len() != 24 {
        return None;
    }
    let id = EntityId::from_slice(&key[..16])?;
    let mut rev = [0u8; 8];
    rev.copy_from_slice(&key[16..]);
    Some((id, Revision::from_be_bytes(rev)))
}

/// Start of the key range covering all revisions of one entity.
#[inline]
pub fn entity_range_start(id: &EntityId) -> [u8; 24] {
    entity_revision_key(id, Revision::ZERO)
}

/// End of the key range covering all revisions of one entity (inclusive).
#[inline]
pub fn entity_range_end(id: &EntityId) -> [u8; 24] {
    entity_revision_key(id, Revision(u64::MAX))
}

/// Encodes a revision-log key.
#[inline]
pub fn revision_log_key(revision: Revision) -> [u8; 8] {
    revision.to_be_bytes()
}

// ============================================================================
// Store metadata
// ============================================================================

/// Store metadata kept in the internal metadata tree.
///
/// Serialized with bincode under [`METADATA_KEY`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreMetadata {
    /// Schema version for compatibility checking.
    pub schema_version: u32,

    /// Timestamp when the store was created.
    pub created_at: Timestamp,

    /// Last time the store was opened (updated on each open).
    pub last_opened_at: Timestamp,
}

impl StoreMetadata {
    /// Creates metadata for a fresh store.
    pub fn new() -> Self {
        let now = Timestamp::now();
        Self {
            schema_version: SCHEMA_VERSION,
            created_at: now,
            last_opened_at: now,
        }
    }

    /// Updates the last_opened_at timestamp.
    pub fn touch(&mut self) {
        self.last_opened_at = Timestamp::now();
    }

    /// Checks if this metadata is compatible with the current schema.
    pub fn is_compatible(&self) -> bool {
        self.schema_version == SCHEMA_VERSION
    }
}

impl Default for StoreMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// Entry recorded in the revision log for each committed revision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RevisionLogEntry {
    /// Type of the changed entity.
    pub entity_type: EntityType,
    /// Id of the changed entity.
    pub id: EntityId,
}
