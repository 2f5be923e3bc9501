//! The sync session handed to a source adaptor.
//!
//! All writes a source adaptor wants to make go through here: the
//! session translates observed remote state into commands on the
//! synchronizer queue, which the pipeline applies after the adaptor
//! returns. Reads go against a snapshot taken at session start.

use std::collections::BTreeSet;

use tracing::{debug, trace};

use super::remoteid::RemoteIdMap;
use crate::entity::{Entity, EntityReader};
use crate::error::Result;
use crate::pipeline::Command;
use crate::queue::CommandQueue;
use crate::types::{EntityId, EntityType, PropertyName, RemoteId, Revision};
use crate::value::{PropertyMap, Value};

/// Mediates between one `synchronize` call and the local store.
pub struct SyncSession<'a> {
    reader: EntityReader,
    remote_ids: &'a RemoteIdMap,
    queue: &'a CommandQueue,
    last_replayed: Revision,
    affected: Vec<EntityId>,
    new_content_folders: BTreeSet<EntityId>,
}

impl<'a> SyncSession<'a> {
    pub(crate) fn new(
        reader: EntityReader,
        remote_ids: &'a RemoteIdMap,
        queue: &'a CommandQueue,
        last_replayed: Revision,
    ) -> Self {
        Self {
            reader,
            remote_ids,
            queue,
            last_replayed,
            affected: Vec::new(),
            new_content_folders: BTreeSet::new(),
        }
    }

    /// Reports one remotely observed entity.
    ///
    /// Resolution order: an existing remote-id mapping wins; otherwise
    /// `merge_criteria` properties are used to adopt a matching local
    /// entity; otherwise a new local entity is created. A modify command
    /// is emitted only when property values actually differ, so
    /// re-reporting identical state creates no revision.
    ///
    /// Properties carrying a local, not-yet-replayed change are not
    /// overwritten by the remote value (the local change wins until it
    /// has been replayed).
    ///
    /// Returns the local entity id.
    pub fn create_or_modify(
        &mut self,
        entity_type: &EntityType,
        remote_id: &RemoteId,
        entity: Entity,
        merge_criteria: &[PropertyName],
    ) -> Result<EntityId> {
        if let Some(local_id) = self.remote_ids.resolve_remote(entity_type, remote_id)? {
            if self.reader.contains(entity_type, &local_id)? {
                if let Some(current) = self.reader.read_latest(entity_type, &local_id)? {
                    self.emit_remote_modify(entity_type, &current, &entity)?;
                }
                // A local tombstone stays deleted; the deletion has not
                // been replayed yet.
                self.affected.push(local_id);
                return Ok(local_id);
            }
            // Mapping recorded but the entity never materialized (crash
            // between mapping and commit): re-emit the creation.
            self.emit_create(entity_type, local_id, &entity)?;
            self.affected.push(local_id);
            return Ok(local_id);
        }

        // No mapping; try to adopt an existing local entity by the merge
        // criteria (e.g. a mail matched by messageId).
        for criterion in merge_criteria {
            let Some(value) = entity.get(criterion.as_str()) else {
                continue;
            };
            let hits = self.reader.index_lookup(entity_type, criterion, value)?;
            if let Some(local_id) = hits.first() {
                if let Some(current) = self.reader.read_latest(entity_type, local_id)? {
                    debug!(
                        entity_type = %entity_type,
                        remote = %remote_id,
                        local = %local_id,
                        criterion = %criterion,
                        "adopting local entity for remote id"
                    );
                    self.remote_ids.record(entity_type, remote_id, *local_id)?;
                    self.emit_remote_modify(entity_type, &current, &entity)?;
                    self.affected.push(*local_id);
                    return Ok(*local_id);
                }
            }
        }

        // Genuinely new.
        let local_id = EntityId::new();
        self.remote_ids.record(entity_type, remote_id, local_id)?;
        self.emit_create(entity_type, local_id, &entity)?;
        self.affected.push(local_id);
        Ok(local_id)
    }

    /// Walks all local entities of a type and emits a delete for each
    /// whose remote id the predicate rejects (i.e. it is no longer
    /// present upstream). Returns the number of deletions emitted.
    pub fn scan_for_removals(
        &mut self,
        entity_type: &EntityType,
        exists_upstream: &mut dyn FnMut(&RemoteId) -> bool,
    ) -> Result<usize> {
        let mut local_ids = Vec::new();
        self.reader
            .scan_type_latest(entity_type, false, &mut |entity| {
                local_ids.push(entity.id());
                true
            })?;

        let mut removed = 0;
        for local_id in local_ids {
            let Some(remote_id) = self.remote_ids.resolve_local(entity_type, &local_id)? else {
                // Never synced; a pending local creation is not a removal.
                continue;
            };
            if exists_upstream(&remote_id) {
                continue;
            }
            trace!(entity_type = %entity_type, local = %local_id, remote = %remote_id, "remote entity vanished");
            self.queue.enqueue(
                Command::Delete {
                    entity_type: entity_type.clone(),
                    id: local_id,
                    replay_to_source: false,
                }
                .encode()?,
            )?;
            self.remote_ids.remove_by_local(entity_type, &local_id)?;
            self.affected.push(local_id);
            removed += 1;
        }
        Ok(removed)
    }

    /// Resolves a remote id to a local id (e.g. a parent folder).
    pub fn resolve_remote_id(
        &self,
        entity_type: &EntityType,
        remote_id: &RemoteId,
    ) -> Result<Option<EntityId>> {
        self.remote_ids.resolve_remote(entity_type, remote_id)
    }

    /// Resolves a local id back to its remote id.
    pub fn resolve_local_id(
        &self,
        entity_type: &EntityType,
        local_id: &EntityId,
    ) -> Result<Option<RemoteId>> {
        self.remote_ids.resolve_local(entity_type, local_id)
    }

    /// Read access to the snapshot this session works against.
    pub fn reader(&self) -> &EntityReader {
        &self.reader
    }

    pub(crate) fn into_outcome(self) -> SessionOutcome {
        SessionOutcome {
            affected: self.affected,
            new_content_folders: self.new_content_folders.into_iter().collect(),
        }
    }

    fn emit_create(
        &mut self,
        entity_type: &EntityType,
        local_id: EntityId,
        entity: &Entity,
    ) -> Result<()> {
        if entity_type.as_str() == "mail" {
            if let Some(folder) = entity.get("folder").and_then(Value::as_id) {
                self.new_content_folders.insert(folder);
            }
        }
        self.queue.enqueue(
            Command::Create {
                entity_type: entity_type.clone(),
                id: Some(local_id),
                properties: entity.properties().clone(),
                replay_to_source: false,
            }
            .encode()?,
        )?;
        Ok(())
    }

    /// Emits a modify for the properties that actually changed,
    /// honoring local-wins for unreplayed local changes.
    fn emit_remote_modify(
        &mut self,
        entity_type: &EntityType,
        current: &Entity,
        incoming: &Entity,
    ) -> Result<()> {
        let locally_pending =
            current.metadata.replay_to_source && current.revision() > self.last_replayed;

        let mut delta = PropertyMap::new();
        for (name, value) in incoming.properties().iter() {
            if current.get(name.as_str()) == Some(value) {
                continue;
            }
            if locally_pending && current.metadata.changed_properties.contains(name) {
                trace!(property = %name, "keeping unreplayed local value over remote");
                continue;
            }
            delta.set(name.clone(), value.clone());
        }
        if delta.is_empty() {
            return Ok(());
        }

        self.queue.enqueue(
            Command::Modify {
                entity_type: entity_type.clone(),
                id: current.id(),
                delta,
                deletions: Vec::new(),
                replay_to_source: false,
                target_resource: None,
                remove_entity: false,
            }
            .encode()?,
        )?;
        Ok(())
    }
}

/// What a session observed, used for notifications after the pipeline
/// applied the queued commands.
#[derive(Debug, Default)]
pub(crate) struct SessionOutcome {
    pub affected: Vec<EntityId>,
    pub new_content_folders: Vec<EntityId>,
}
