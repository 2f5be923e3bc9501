//! Live query maintenance.
//!
//! A [`LiveQuery`] keeps a query's result set current across revisions.
//! After every committed revision the owner replays the revision log in
//! the range `(last_seen, max]` against a fresh snapshot, and each
//! changed entity of the query's type is classified as now-matching,
//! still-matching, no-longer-matching, or irrelevant, producing
//! added/modified/removed events. Reduced queries re-evaluate the
//! affected group and emit a single modified event when the group's
//! representative is unchanged.
//!
//! Dropping the `LiveQuery` releases no storage by itself — snapshots
//! are only held for the duration of one update cycle.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::trace;

use super::{execute, matches_filters, synthesize_group, Comparator, Query};
use crate::entity::{Entity, EntityReader};
use crate::error::Result;
use crate::notification::{codes, Notification, NotificationKind};
use crate::types::{EntityId, PropertyName, Revision};
use crate::value::Value;

/// A change to a live result set.
#[derive(Clone, Debug, PartialEq)]
pub enum ResultEvent {
    /// An entity (or reduce row) entered the result set.
    Added(Entity),
    /// An entity (or reduce row) in the result set changed.
    Modified(Entity),
    /// The entity (or the group represented by this id) left the result
    /// set.
    Removed(EntityId),
    /// Sync status of a result-set member changed (only with the
    /// `update_status` flag).
    StatusChanged {
        /// The affected member.
        id: EntityId,
        /// One of the `SYNC_*` codes.
        code: u32,
    },
}

#[derive(Clone, Debug)]
struct GroupState {
    representative: EntityId,
}

/// Incremental state of one live query.
pub struct LiveQuery {
    query: Query,
    last_seen: Revision,
    /// Plain queries: ids currently in the result set.
    members: HashSet<EntityId>,
    /// Reduced queries: group key bytes → group state.
    groups: HashMap<Vec<u8>, GroupState>,
    /// Reduced queries: member id → its group key.
    entity_groups: HashMap<EntityId, Vec<u8>>,
}

impl LiveQuery {
    /// Executes the query once and returns the live handle together
    /// with the initial result set.
    pub fn initialize(reader: &EntityReader, query: Query) -> Result<(Self, Vec<Entity>)> {
        let initial = execute(reader, &query)?;

        let mut live = Self {
            last_seen: reader.max_revision(),
            members: HashSet::new(),
            groups: HashMap::new(),
            entity_groups: HashMap::new(),
            query,
        };

        if live.query.reduce.is_some() {
            // Track every member, not just representatives: removal and
            // group moves need the previous group of any member.
            let mut flat = live.query.clone();
            flat.reduce = None;
            flat.limit = None;
            for member in execute(reader, &flat)? {
                let key = live.group_key(&member);
                live.entity_groups.insert(member.id(), key);
            }
            for row in &initial {
                let key = live.group_key(row);
                live.groups.insert(
                    key,
                    GroupState {
                        representative: row.id(),
                    },
                );
            }
        } else {
            live.members = initial.iter().map(Entity::id).collect();
        }

        Ok((live, initial))
    }

    /// The underlying query.
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// The revision this query has fully incorporated. Cleanup must not
    /// prune beyond it while the query is alive.
    pub fn pinned_revision(&self) -> Revision {
        self.last_seen
    }

    /// Replays revisions committed since the last update and returns
    /// the resulting events.
    pub fn process_revision_update(&mut self, reader: &EntityReader) -> Result<Vec<ResultEvent>> {
        let max = reader.max_revision();
        if max <= self.last_seen {
            return Ok(Vec::new());
        }

        // Dedupe changed ids; only the latest state matters for
        // classification.
        let mut changed: BTreeMap<EntityId, ()> = BTreeMap::new();
        reader.scan_revisions(
            Revision(self.last_seen.get() + 1),
            max,
            &mut |_revision, entry| {
                if entry.entity_type == self.query.entity_type {
                    changed.insert(entry.id, ());
                }
                true
            },
        )?;

        // Subquery filters are re-resolved against the fresh snapshot.
        let mut effective = self.query.filters.clone();
        for subquery in &self.query.subqueries {
            let inner = execute(reader, &subquery.query)?;
            let ids: Vec<Value> = inner.iter().map(|e| Value::IdRef(e.id())).collect();
            effective.insert(subquery.property.clone(), Comparator::In(ids));
        }

        let mut events = Vec::new();
        for (id, ()) in changed {
            if self.query.reduce.is_some() {
                self.classify_reduced(reader, &effective, id, &mut events)?;
            } else {
                self.classify_plain(reader, &effective, id, &mut events)?;
            }
        }

        trace!(
            from = self.last_seen.get(),
            to = max.get(),
            events = events.len(),
            "live query advanced"
        );
        self.last_seen = max;
        Ok(events)
    }

    /// Folds a sync-status notification into the update stream.
    ///
    /// Returns status events for affected result-set members when the
    /// `update_status` flag is set.
    pub fn handle_notification(&self, notification: &Notification) -> Vec<ResultEvent> {
        if !self.query.flags.update_status || notification.kind != NotificationKind::Info {
            return Vec::new();
        }
        if !matches!(
            notification.code,
            codes::SYNC_IN_PROGRESS | codes::SYNC_SUCCESS | codes::SYNC_ERROR
        ) {
            return Vec::new();
        }
        notification
            .entities
            .iter()
            .filter(|id| self.members.contains(id) || self.entity_groups.contains_key(id))
            .map(|id| ResultEvent::StatusChanged {
                id: *id,
                code: notification.code,
            })
            .collect()
    }

    fn matches(
        &self,
        effective: &BTreeMap<PropertyName, Comparator>,
        entity: &Entity,
    ) -> bool {
        if let Some(ids) = &self.query.ids {
            if !ids.contains(&entity.id()) {
                return false;
            }
        }
        matches_filters(entity, effective)
    }

    fn classify_plain(
        &mut self,
        reader: &EntityReader,
        effective: &BTreeMap<PropertyName, Comparator>,
        id: EntityId,
        events: &mut Vec<ResultEvent>,
    ) -> Result<()> {
        let latest = reader.read_latest(&self.query.entity_type, &id)?;
        let matches_now = latest
            .as_ref()
            .is_some_and(|entity| self.matches(effective, entity));
        let was_member = self.members.contains(&id);

        match (matches_now, was_member) {
            (true, false) => {
                self.members.insert(id);
                events.push(ResultEvent::Added(self.render(latest.expect("matched"))));
            }
            (true, true) => {
                events.push(ResultEvent::Modified(self.render(latest.expect("matched"))));
            }
            (false, true) => {
                self.members.remove(&id);
                events.push(ResultEvent::Removed(id));
            }
            (false, false) => {}
        }
        Ok(())
    }

    fn classify_reduced(
        &mut self,
        reader: &EntityReader,
        effective: &BTreeMap<PropertyName, Comparator>,
        id: EntityId,
        events: &mut Vec<ResultEvent>,
    ) -> Result<()> {
        let latest = reader.read_latest(&self.query.entity_type, &id)?;
        let matches_now = latest
            .as_ref()
            .is_some_and(|entity| self.matches(effective, entity));

        let old_key = self.entity_groups.get(&id).cloned();
        let new_key = if matches_now {
            latest.as_ref().map(|entity| self.group_key(entity))
        } else {
            None
        };

        if old_key == new_key && old_key.is_none() {
            return Ok(());
        }

        match &new_key {
            Some(key) => {
                self.entity_groups.insert(id, key.clone());
            }
            None => {
                self.entity_groups.remove(&id);
            }
        }

        let mut affected: Vec<Vec<u8>> = Vec::new();
        if let Some(key) = old_key {
            affected.push(key);
        }
        if let Some(key) = new_key {
            if !affected.contains(&key) {
                affected.push(key);
            }
        }

        for key in affected {
            self.reevaluate_group(reader, effective, key, events)?;
        }
        Ok(())
    }

    /// Recomputes one group from the snapshot and emits the difference
    /// against the tracked state.
    fn reevaluate_group(
        &mut self,
        reader: &EntityReader,
        effective: &BTreeMap<PropertyName, Comparator>,
        key: Vec<u8>,
        events: &mut Vec<ResultEvent>,
    ) -> Result<()> {
        let reduce = self.query.reduce.clone().expect("reduced query");

        // Current group members: everyone tracked under this key,
        // re-validated against the snapshot.
        let member_ids: Vec<EntityId> = self
            .entity_groups
            .iter()
            .filter(|(_, k)| **k == key)
            .map(|(id, _)| *id)
            .collect();
        let mut members = Vec::new();
        for id in member_ids {
            if let Some(entity) = reader.read_latest(&self.query.entity_type, &id)? {
                if self.matches(effective, &entity) {
                    members.push(entity);
                }
            }
        }

        let previous = self.groups.get(&key).cloned();
        if members.is_empty() {
            if let Some(previous) = previous {
                events.push(ResultEvent::Removed(previous.representative));
                self.groups.remove(&key);
            }
            return Ok(());
        }

        let row = synthesize_group(&reduce, &members);
        let representative = row.id();

        match previous {
            None => {
                events.push(ResultEvent::Added(self.render(row)));
            }
            Some(previous) if previous.representative == representative => {
                events.push(ResultEvent::Modified(self.render(row)));
            }
            Some(previous) => {
                // The group slot changes identity: removed + added.
                events.push(ResultEvent::Removed(previous.representative));
                events.push(ResultEvent::Added(self.render(row)));
            }
        }
        self.groups.insert(key, GroupState { representative });
        Ok(())
    }

    fn render(&self, entity: Entity) -> Entity {
        if self.query.requested.is_empty() {
            return entity;
        }
        super::project(&entity, &self.query.requested)
    }

    fn reduce_property(&self) -> &PropertyName {
        &self.query.reduce.as_ref().expect("reduced query").property
    }

    fn group_key(&self, entity: &Entity) -> Vec<u8> {
        match entity.get(self.reduce_property().as_str()) {
            Some(value) if !value.is_null() => {
                let mut key = vec![0u8];
                key.extend(value.index_bytes());
                key
            }
            // Entities without the reduce property are singleton groups.
            _ => {
                let mut key = vec![1u8];
                key.extend(entity.id().as_bytes());
                key
            }
        }
    }
}

impl std::fmt::Debug for LiveQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveQuery")
            .field("entity_type", &self.query.entity_type)
            .field("last_seen", &self.last_seen)
            .field("members", &self.members.len())
            .field("groups", &self.groups.len())
            .finish_non_exhaustive()
    }
}
