//! Persistent remote-id ↔ local-id mapping.
//!
//! One bidirectional map per entity type, stored in the synchronization
//! store so it survives restarts. For a given `(type, remote_id)` at
//! most one local id exists at any time; recording a mapping replaces
//! stale entries in both directions.

use std::sync::Arc;

use tracing::trace;

use crate::error::Result;
use crate::storage::schema::{remote_id_reverse_tree, remote_id_tree};
use crate::storage::DataStore;
use crate::types::{EntityId, EntityType, RemoteId};

/// The persistent remote-id map of one resource instance.
#[derive(Clone)]
pub struct RemoteIdMap {
    store: Arc<DataStore>,
}

impl RemoteIdMap {
    /// Creates a map over the synchronization store.
    pub fn new(store: Arc<DataStore>) -> Self {
        Self { store }
    }

    /// Records `remote_id ↔ local_id`, replacing any stale mapping of
    /// either side.
    pub fn record(
        &self,
        entity_type: &EntityType,
        remote_id: &RemoteId,
        local_id: EntityId,
    ) -> Result<()> {
        let forward = remote_id_tree(entity_type);
        let reverse = remote_id_reverse_tree(entity_type);

        let mut txn = self.store.begin_write()?;
        // Drop a previous remote id of this local entity.
        if let Some(old_remote) = txn.get(&reverse, local_id.as_bytes())? {
            txn.delete(&forward, &old_remote)?;
        }
        // Drop a previous local id of this remote id.
        if let Some(old_local) = txn.get(&forward, remote_id.as_bytes())? {
            txn.delete(&reverse, &old_local)?;
        }
        txn.put(&forward, remote_id.as_bytes(), local_id.as_bytes())?;
        txn.put(&reverse, local_id.as_bytes(), remote_id.as_bytes())?;
        txn.commit()?;

        trace!(entity_type = %entity_type, remote = %remote_id, local = %local_id, "recorded remote id");
        Ok(())
    }

    /// Resolves a remote id to its local entity id.
    pub fn resolve_remote(
        &self,
        entity_type: &EntityType,
        remote_id: &RemoteId,
    ) -> Result<Option<EntityId>> {
        let read = self.store.begin_read()?;
        Ok(read
            .get(&remote_id_tree(entity_type), remote_id.as_bytes())?
            .and_then(|bytes| EntityId::from_slice(&bytes)))
    }

    /// Resolves a local entity id to its remote id.
    pub fn resolve_local(
        &self,
        entity_type: &EntityType,
        local_id: &EntityId,
    ) -> Result<Option<RemoteId>> {
        let read = self.store.begin_read()?;
        Ok(read
            .get(&remote_id_reverse_tree(entity_type), local_id.as_bytes())?
            .map(|bytes| RemoteId::new(String::from_utf8_lossy(&bytes).into_owned())))
    }

    /// Removes the mapping of a local entity. Returns true if one
    /// existed.
    pub fn remove_by_local(&self, entity_type: &EntityType, local_id: &EntityId) -> Result<bool> {
        let forward = remote_id_tree(entity_type);
        let reverse = remote_id_reverse_tree(entity_type);

        let mut txn = self.store.begin_write()?;
        let removed = match txn.get(&reverse, local_id.as_bytes())? {
            Some(remote) => {
                txn.delete(&forward, &remote)?;
                txn.delete(&reverse, local_id.as_bytes())?;
                true
            }
            None => false,
        };
        txn.commit()?;
        Ok(removed)
    }
}

impl std::fmt::Debug for RemoteIdMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteIdMap").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_map(dir: &std::path::Path) -> RemoteIdMap {
        let store = Arc::new(DataStore::open(dir.join("synchronizationstore")).unwrap());
        RemoteIdMap::new(store)
    }

    #[test]
    fn test_record_and_resolve_both_directions() {
        let dir = tempdir().unwrap();
        let map = open_map(dir.path());
        let mail = EntityType::new("mail");
        let remote = RemoteId::new("r-1");
        let local = EntityId::new();

        map.record(&mail, &remote, local).unwrap();

        assert_eq!(map.resolve_remote(&mail, &remote).unwrap(), Some(local));
        assert_eq!(map.resolve_local(&mail, &local).unwrap(), Some(remote));
    }

    #[test]
    fn test_at_most_one_local_per_remote() {
        let dir = tempdir().unwrap();
        let map = open_map(dir.path());
        let mail = EntityType::new("mail");
        let remote = RemoteId::new("r-1");
        let first = EntityId::new();
        let second = EntityId::new();

        map.record(&mail, &remote, first).unwrap();
        map.record(&mail, &remote, second).unwrap();

        assert_eq!(map.resolve_remote(&mail, &remote).unwrap(), Some(second));
        // The stale reverse entry is gone.
        assert_eq!(map.resolve_local(&mail, &first).unwrap(), None);
    }

    #[test]
    fn test_remote_id_change_replaces_forward_entry() {
        let dir = tempdir().unwrap();
        let map = open_map(dir.path());
        let mail = EntityType::new("mail");
        let local = EntityId::new();

        map.record(&mail, &RemoteId::new("old"), local).unwrap();
        map.record(&mail, &RemoteId::new("new"), local).unwrap();

        assert_eq!(
            map.resolve_remote(&mail, &RemoteId::new("old")).unwrap(),
            None
        );
        assert_eq!(
            map.resolve_local(&mail, &local).unwrap(),
            Some(RemoteId::new("new"))
        );
    }

    #[test]
    fn test_mapping_survives_reopen() {
        let dir = tempdir().unwrap();
        let mail = EntityType::new("mail");
        let remote = RemoteId::new("r-1");
        let local = EntityId::new();
        {
            let map = open_map(dir.path());
            map.record(&mail, &remote, local).unwrap();
        }
        let map = open_map(dir.path());
        assert_eq!(map.resolve_remote(&mail, &remote).unwrap(), Some(local));
    }

    #[test]
    fn test_mappings_scoped_per_type() {
        let dir = tempdir().unwrap();
        let map = open_map(dir.path());
        let remote = RemoteId::new("1");
        let mail_local = EntityId::new();
        let folder_local = EntityId::new();

        map.record(&EntityType::new("mail"), &remote, mail_local)
            .unwrap();
        map.record(&EntityType::new("folder"), &remote, folder_local)
            .unwrap();

        assert_eq!(
            map.resolve_remote(&EntityType::new("mail"), &remote).unwrap(),
            Some(mail_local)
        );
        assert_eq!(
            map.resolve_remote(&EntityType::new("folder"), &remote)
                .unwrap(),
            Some(folder_local)
        );
    }

    #[test]
    fn test_remove_by_local() {
        let dir = tempdir().unwrap();
        let map = open_map(dir.path());
        let mail = EntityType::new("mail");
        let remote = RemoteId::new("r-1");
        let local = EntityId::new();

        map.record(&mail, &remote, local).unwrap();
        assert!(map.remove_by_local(&mail, &local).unwrap());
        assert!(!map.remove_by_local(&mail, &local).unwrap());
        assert_eq!(map.resolve_remote(&mail, &remote).unwrap(), None);
    }
}
