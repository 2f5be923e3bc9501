//! The write path: commands → preprocessors → entity store → revision.
//!
//! The pipeline is the only writer of the entity store. It folds
//! back-to-back commands into one write transaction (a *batch*), runs
//! the registered per-type preprocessors inside it, and publishes
//! exactly one revision-update notification per committed batch.
//!
//! Any preprocessor or entity-store error aborts the whole batch; the
//! offending command is reported to its originator and the queue decides
//! whether it is retried or dead-lettered.

pub mod preprocessor;

use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace, warn};

pub use preprocessor::{
    Action, EventPropertyExtractor, LookupWrite, MailPropertyExtractor, PreprocessContext,
    Preprocessor, SpecialPurposeProcessor, ThreadIndexer,
};

use crate::config::Config;
use crate::entity::{Entity, EntityReader, EntityStore};
use crate::error::{Error, NotFoundError, Result};
use crate::notification::{codes, Notification, NotificationBus};
use crate::queue::{CommandQueue, FlushKind, NackOutcome};
use crate::types::{EntityId, EntityType, PropertyName, Revision};
use crate::value::PropertyMap;

/// A decoded pipeline command.
///
/// Commands arrive length-prefixed from the wire or from the durable
/// queues and are bincode-encoded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Create a new entity.
    Create {
        /// Target entity type.
        entity_type: EntityType,
        /// Explicit id; a fresh one is allocated when absent.
        id: Option<EntityId>,
        /// Initial property bag.
        properties: PropertyMap,
        /// Whether the creation must be replayed to the source.
        replay_to_source: bool,
    },
    /// Modify an existing entity.
    Modify {
        /// Target entity type.
        entity_type: EntityType,
        /// Target entity.
        id: EntityId,
        /// Properties to set.
        delta: PropertyMap,
        /// Properties to unset.
        deletions: Vec<PropertyName>,
        /// Whether the modification must be replayed to the source.
        replay_to_source: bool,
        /// When set, the entity is copied to this resource instance
        /// instead of modified in place.
        target_resource: Option<String>,
        /// Together with `target_resource`: delete the local entity
        /// after the copy succeeded (a move).
        remove_entity: bool,
    },
    /// Delete an entity (writes a tombstone revision).
    Delete {
        /// Target entity type.
        entity_type: EntityType,
        /// Target entity.
        id: EntityId,
        /// Whether the deletion must be replayed to the source.
        replay_to_source: bool,
    },
    /// Flush barrier: completes once all earlier work of the queue it
    /// rode in on has been processed.
    FlushBarrier {
        /// Correlation id echoed in the flush-completion notification.
        id: String,
        /// Which work the barrier waits for.
        kind: FlushKind,
    },
}

impl Command {
    /// Encodes the command for a queue or wire payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| Error::invalid_payload(format!("unencodable command: {}", e)))
    }

    /// Decodes a command payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPayload`] for undecodable bytes; such
    /// commands are dropped with a warning.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| Error::invalid_payload(format!("undecodable command: {}", e)))
    }
}

/// Ships entity copies to other resource instances (client interface
/// stand-in for inter-resource moves).
pub trait ResourceMover: Send {
    /// Creates `entity` in the target resource instance.
    fn create_in_resource(&mut self, target: &str, entity: &Entity) -> Result<()>;
}

/// Per-command outcome inside a batch.
#[derive(Clone, Debug, PartialEq)]
pub enum Applied {
    /// A revision was written.
    Mutation(Revision),
    /// A preprocessor dropped the modification; no revision.
    Dropped,
    /// A flush barrier was recorded.
    Flush(String, FlushKind),
    /// The entity was shipped to another resource.
    Moved,
}

/// Result of committing a batch.
#[derive(Debug, Default)]
pub struct CommitOutcome {
    /// New max revision if the batch wrote anything.
    pub revision: Option<Revision>,
    /// Flush barriers that must complete elsewhere (replay /
    /// synchronization flushes are owned by the synchronizer).
    pub forwarded_flushes: Vec<(String, FlushKind)>,
}

/// Result of draining a command queue.
#[derive(Debug, Default)]
pub struct DrainOutcome {
    /// Commands applied and acknowledged.
    pub processed: usize,
    /// New max revision if anything committed.
    pub revision: Option<Revision>,
    /// Flush barriers forwarded to the synchronizer.
    pub forwarded_flushes: Vec<(String, FlushKind)>,
    /// Sequence number of a command that failed and aborted the batch.
    pub failed: Option<u64>,
}

struct BatchState {
    reader: EntityReader,
    started: Instant,
    items: usize,
    revision_changed: bool,
    flushes: Vec<(String, FlushKind)>,
}

/// The single-threaded write pipeline of one resource instance.
pub struct Pipeline {
    store: EntityStore,
    preprocessors: HashMap<EntityType, Vec<Box<dyn Preprocessor>>>,
    mover: Option<Box<dyn ResourceMover>>,
    bus: NotificationBus,
    config: Config,
    batch: Option<BatchState>,
}

impl Pipeline {
    /// Creates a pipeline over the given entity store.
    pub fn new(store: EntityStore, bus: NotificationBus, config: Config) -> Self {
        Self {
            store,
            preprocessors: HashMap::new(),
            mover: None,
            bus,
            config,
            batch: None,
        }
    }

    /// Registers the preprocessor chain for one entity type, replacing
    /// any previous chain.
    pub fn set_preprocessors(
        &mut self,
        entity_type: impl Into<EntityType>,
        preprocessors: Vec<Box<dyn Preprocessor>>,
    ) {
        self.preprocessors.insert(entity_type.into(), preprocessors);
    }

    /// Registers the inter-resource mover.
    pub fn set_resource_mover(&mut self, mover: Box<dyn ResourceMover>) {
        self.mover = Some(mover);
    }

    /// Read access to the underlying entity store.
    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    /// Mutable access for maintenance operations (cleanup).
    pub fn store_mut(&mut self) -> &mut EntityStore {
        &mut self.store
    }

    /// The bus this pipeline publishes to.
    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    // ========================================================================
    // Batch state machine: Idle → Open → Committing → Idle
    // ========================================================================

    /// Opens a batch transaction.
    pub fn start_batch(&mut self) -> Result<()> {
        if self.batch.is_some() {
            return Err(Error::precondition("batch already open"));
        }
        self.store.start_transaction()?;
        let reader = self.store.snapshot()?;
        for chain in self.preprocessors.values_mut() {
            for preprocessor in chain {
                preprocessor.start_batch();
            }
        }
        self.batch = Some(BatchState {
            reader,
            started: Instant::now(),
            items: 0,
            revision_changed: false,
            flushes: Vec::new(),
        });
        trace!("batch opened");
        Ok(())
    }

    /// True while a batch is open.
    pub fn batch_is_open(&self) -> bool {
        self.batch.is_some()
    }

    /// True when the open batch hit its soft item count or latency bound.
    pub fn batch_is_full(&self) -> bool {
        self.batch.as_ref().is_some_and(|batch| {
            batch.items >= self.config.batch_soft_limit
                || batch.started.elapsed() >= self.config.batch_max_latency
        })
    }

    /// Commits the open batch.
    ///
    /// Publishes one revision-update notification if any command wrote a
    /// revision, and the flush-completion for every user-queue barrier
    /// in the batch.
    #[instrument(skip(self))]
    pub fn commit_batch(&mut self) -> Result<CommitOutcome> {
        let batch = self
            .batch
            .take()
            .ok_or_else(|| Error::precondition("no batch open"))?;
        for chain in self.preprocessors.values_mut() {
            for preprocessor in chain {
                preprocessor.finalize_batch();
            }
        }

        let mut outcome = CommitOutcome::default();
        if batch.revision_changed {
            self.store.commit_transaction()?;
            let revision = self.store.max_revision();
            debug!(
                revision = revision.get(),
                items = batch.items,
                elapsed_ms = batch.started.elapsed().as_millis() as u64,
                "batch committed"
            );
            self.bus.publish(Notification::revision_update(revision));
            outcome.revision = Some(revision);
        } else {
            // Nothing was written; avoid an empty revision bump.
            self.store.abort_transaction();
        }

        for (id, kind) in batch.flushes {
            if kind == FlushKind::UserQueue {
                self.bus.publish(Notification::flush_completion(id));
            } else {
                outcome.forwarded_flushes.push((id, kind));
            }
        }
        Ok(outcome)
    }

    /// Aborts the open batch, rolling back all of its commands.
    pub fn abort_batch(&mut self) {
        if self.batch.take().is_some() {
            self.store.abort_transaction();
            debug!("batch aborted");
        }
    }

    /// Applies one command inside the open batch.
    pub fn apply(&mut self, command: &Command) -> Result<Applied> {
        if self.batch.is_none() {
            return Err(Error::precondition("no batch open"));
        }

        let applied = match command {
            Command::Create {
                entity_type,
                id,
                properties,
                replay_to_source,
            } => self.apply_create(entity_type, *id, properties.clone(), *replay_to_source)?,
            Command::Modify {
                entity_type,
                id,
                delta,
                deletions,
                replay_to_source,
                target_resource,
                remove_entity,
            } => self.apply_modify(
                entity_type,
                id,
                delta.clone(),
                deletions,
                *replay_to_source,
                target_resource.as_deref(),
                *remove_entity,
            )?,
            Command::Delete {
                entity_type,
                id,
                replay_to_source,
            } => self.apply_delete(entity_type, id, *replay_to_source)?,
            Command::FlushBarrier { id, kind } => {
                let batch = self.batch.as_mut().expect("batch is open");
                batch.flushes.push((id.clone(), *kind));
                Applied::Flush(id.clone(), *kind)
            }
        };

        let batch = self.batch.as_mut().expect("batch is open");
        batch.items += 1;
        Ok(applied)
    }

    /// Opens a batch, applies one command, and commits.
    ///
    /// Convenience for callers outside the queue-drain path (tests, the
    /// synchronizer's direct maintenance writes).
    pub fn submit(&mut self, command: &Command) -> Result<Applied> {
        self.start_batch()?;
        match self.apply(command) {
            Ok(applied) => {
                self.commit_batch()?;
                Ok(applied)
            }
            Err(err) => {
                self.abort_batch();
                Err(err)
            }
        }
    }

    /// Drains up to one batch worth of commands from a queue.
    ///
    /// Commands are acknowledged only after the batch committed
    /// (at-least-once). A failing command aborts the whole batch and is
    /// nacked; earlier commands of the batch are reprocessed on the next
    /// drain. Undecodable payloads are dropped with a warning.
    #[instrument(skip(self, queue), fields(queue = queue.name()))]
    pub fn drain_queue(&mut self, queue: &CommandQueue) -> Result<DrainOutcome> {
        let entries = queue.peek(self.config.batch_soft_limit)?;
        if entries.is_empty() {
            return Ok(DrainOutcome::default());
        }

        self.start_batch()?;
        let mut applied = Vec::new();
        for entry in entries {
            let command = match Command::decode(&entry.item.payload) {
                Ok(command) => command,
                Err(err) => {
                    warn!(seq = entry.seq, error = %err, "dropping invalid command");
                    queue.ack(entry.seq)?;
                    continue;
                }
            };
            match self.apply(&command) {
                Ok(_) => applied.push(entry.seq),
                Err(err) if err.is_fatal() => {
                    self.abort_batch();
                    return Err(err);
                }
                Err(err) => {
                    warn!(seq = entry.seq, error = %err, "command failed, aborting batch");
                    self.abort_batch();
                    if queue.nack(entry.seq)? == NackOutcome::DeadLettered {
                        self.bus.publish(Notification::error(
                            codes::ERROR_DEAD_LETTER,
                            format!("command {} exceeded its retry cap: {}", entry.seq, err),
                        ));
                    }
                    return Ok(DrainOutcome {
                        failed: Some(entry.seq),
                        ..DrainOutcome::default()
                    });
                }
            }
        }

        let commit = self.commit_batch()?;
        for seq in &applied {
            queue.ack(*seq)?;
        }
        Ok(DrainOutcome {
            processed: applied.len(),
            revision: commit.revision,
            forwarded_flushes: commit.forwarded_flushes,
            failed: None,
        })
    }

    /// Cleans up revisions older than `threshold` in its own batch.
    pub fn cleanup_revisions(&mut self, threshold: Revision) -> Result<bool> {
        if self.batch.is_some() {
            return Err(Error::precondition("cleanup requires an idle pipeline"));
        }
        self.store.cleanup_revisions(threshold)
    }

    // ========================================================================
    // Command application
    // ========================================================================

    fn apply_create(
        &mut self,
        entity_type: &EntityType,
        id: Option<EntityId>,
        properties: PropertyMap,
        replay_to_source: bool,
    ) -> Result<Applied> {
        if let Some(id) = id {
            if self.store.contains(entity_type, &id)? {
                return Err(Error::precondition(format!(
                    "an entity with id {} already exists",
                    id
                )));
            }
        }

        let mut entity = match id {
            Some(id) => Entity::with_id(entity_type.clone(), id),
            None => Entity::new(entity_type.clone()),
        };
        for (name, value) in properties.iter() {
            entity.set(name.clone(), value.clone());
        }
        entity.metadata.replay_to_source = replay_to_source;

        let (action, followups, lookups) = self.preprocess_new(entity_type, &mut entity)?;
        let applied = match action {
            Action::Keep => {
                let revision = self.store.add(entity)?;
                self.batch.as_mut().expect("batch is open").revision_changed = true;
                self.apply_lookups(entity_type, lookups)?;
                Applied::Mutation(revision)
            }
            Action::Drop | Action::DeleteEntity => {
                trace!(entity_type = %entity_type, "creation dropped by preprocessor");
                Applied::Dropped
            }
            Action::MoveToResource(_) | Action::CopyToResource(_) => {
                warn!("preprocessor requested a move during creation; ignoring");
                let revision = self.store.add(entity)?;
                self.batch.as_mut().expect("batch is open").revision_changed = true;
                self.apply_lookups(entity_type, lookups)?;
                Applied::Mutation(revision)
            }
        };
        self.apply_followups(followups)?;
        Ok(applied)
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_modify(
        &mut self,
        entity_type: &EntityType,
        id: &EntityId,
        delta: PropertyMap,
        deletions: &[PropertyName],
        replay_to_source: bool,
        target_resource: Option<&str>,
        remove_entity: bool,
    ) -> Result<Applied> {
        let current = self
            .store
            .read_latest(entity_type, id)?
            .ok_or_else(|| Error::from(NotFoundError::entity(entity_type.as_str(), id)))?;
        let mut new = EntityStore::apply_delta(&current, delta, deletions, replay_to_source);

        if let Some(target) = target_resource {
            return self.ship_to_resource(entity_type, &current, new, target, remove_entity);
        }

        let (action, followups, lookups) = self.preprocess_modified(entity_type, &current, &mut new)?;
        let applied = match action {
            Action::Keep => {
                let revision = self.store.write_modified(&current, new)?;
                self.batch.as_mut().expect("batch is open").revision_changed = true;
                self.apply_lookups(entity_type, lookups)?;
                Applied::Mutation(revision)
            }
            Action::Drop => Applied::Dropped,
            Action::DeleteEntity => {
                let revision = self.store.remove(entity_type, id, replay_to_source)?;
                self.batch.as_mut().expect("batch is open").revision_changed = true;
                Applied::Mutation(revision)
            }
            Action::MoveToResource(target) => {
                return self.ship_to_resource(entity_type, &current, new, &target, true);
            }
            Action::CopyToResource(target) => {
                return self.ship_to_resource(entity_type, &current, new, &target, false);
            }
        };
        self.apply_followups(followups)?;
        Ok(applied)
    }

    fn apply_delete(
        &mut self,
        entity_type: &EntityType,
        id: &EntityId,
        replay_to_source: bool,
    ) -> Result<Applied> {
        let current = self
            .store
            .read_latest(entity_type, id)?
            .ok_or_else(|| Error::from(NotFoundError::entity(entity_type.as_str(), id)))?;

        let followups = self.preprocess_deleted(entity_type, &current)?;
        let revision = self.store.remove(entity_type, id, replay_to_source)?;
        self.batch.as_mut().expect("batch is open").revision_changed = true;
        self.apply_followups(followups)?;
        Ok(Applied::Mutation(revision))
    }

    /// Ships an entity copy to another resource; on a move, the local
    /// delete is emitted only after the copy succeeded.
    fn ship_to_resource(
        &mut self,
        entity_type: &EntityType,
        current: &Entity,
        mut copy: Entity,
        target: &str,
        remove_entity: bool,
    ) -> Result<Applied> {
        let mover = self
            .mover
            .as_mut()
            .ok_or_else(|| Error::precondition("no resource mover registered"))?;
        copy.mark_all_changed();
        mover.create_in_resource(target, &copy)?;
        debug!(entity = %current.id(), target, remove_entity, "entity shipped to resource");

        if remove_entity {
            self.store.remove(entity_type, &current.id(), true)?;
            self.batch.as_mut().expect("batch is open").revision_changed = true;
        }
        Ok(Applied::Moved)
    }

    fn apply_followups(&mut self, followups: Vec<Command>) -> Result<()> {
        for followup in followups {
            self.apply(&followup)?;
            // apply() counted the follow-up as a batch item; that is
            // intentional, it is real work in this batch.
        }
        Ok(())
    }

    /// Persists the composite lookup entries a preprocessor produced.
    fn apply_lookups(&mut self, entity_type: &EntityType, lookups: Vec<LookupWrite>) -> Result<()> {
        for lookup in lookups {
            self.store
                .lookup_put(entity_type, &lookup.name, &lookup.key, &lookup.value)?;
        }
        Ok(())
    }

    // ========================================================================
    // Preprocessor invocation
    // ========================================================================

    fn preprocess_new(
        &mut self,
        entity_type: &EntityType,
        entity: &mut Entity,
    ) -> Result<(Action, Vec<Command>, Vec<LookupWrite>)> {
        let batch = self.batch.as_ref().expect("batch is open");
        let mut followups = Vec::new();
        let mut lookups = Vec::new();
        let mut action = Action::Keep;
        if let Some(chain) = self.preprocessors.get_mut(entity_type) {
            let mut ctx = PreprocessContext {
                reader: &batch.reader,
                followups: &mut followups,
                lookups: &mut lookups,
            };
            for preprocessor in chain {
                action = preprocessor.new_entity(entity, &mut ctx)?;
                if action != Action::Keep {
                    break;
                }
            }
        }
        Ok((action, followups, lookups))
    }

    fn preprocess_modified(
        &mut self,
        entity_type: &EntityType,
        old: &Entity,
        new: &mut Entity,
    ) -> Result<(Action, Vec<Command>, Vec<LookupWrite>)> {
        let batch = self.batch.as_ref().expect("batch is open");
        let mut followups = Vec::new();
        let mut lookups = Vec::new();
        let mut action = Action::Keep;
        if let Some(chain) = self.preprocessors.get_mut(entity_type) {
            let mut ctx = PreprocessContext {
                reader: &batch.reader,
                followups: &mut followups,
                lookups: &mut lookups,
            };
            for preprocessor in chain {
                action = preprocessor.modified_entity(old, new, &mut ctx)?;
                if action != Action::Keep {
                    break;
                }
            }
        }
        Ok((action, followups, lookups))
    }

    fn preprocess_deleted(
        &mut self,
        entity_type: &EntityType,
        old: &Entity,
    ) -> Result<Vec<Command>> {
        let batch = self.batch.as_ref().expect("batch is open");
        let mut followups = Vec::new();
        let mut lookups = Vec::new();
        if let Some(chain) = self.preprocessors.get_mut(entity_type) {
            let mut ctx = PreprocessContext {
                reader: &batch.reader,
                followups: &mut followups,
                lookups: &mut lookups,
            };
            for preprocessor in chain {
                preprocessor.deleted_entity(old, &mut ctx)?;
            }
        }
        Ok(followups)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("batch_open", &self.batch.is_some())
            .field("preprocessed_types", &self.preprocessors.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::TypeRegistry;
    use crate::notification::NotificationKind;
    use crate::value::Value;
    use tempfile::tempdir;

    fn make_pipeline(dir: &std::path::Path) -> (Pipeline, crate::notification::NotificationSubscription) {
        let store = EntityStore::open(dir, TypeRegistry::standard()).unwrap();
        let bus = NotificationBus::new(64);
        let sub = bus.subscribe();
        (Pipeline::new(store, bus, Config::default()), sub)
    }

    fn create_event(summary: &str) -> Command {
        let mut properties = PropertyMap::new();
        properties.set("summary", Value::String(summary.into()));
        Command::Create {
            entity_type: EntityType::new("event"),
            id: None,
            properties,
            replay_to_source: false,
        }
    }

    #[test]
    fn test_batch_emits_single_revision_notification() {
        let dir = tempdir().unwrap();
        let (mut pipeline, sub) = make_pipeline(dir.path());

        pipeline.start_batch().unwrap();
        pipeline.apply(&create_event("a")).unwrap();
        pipeline.apply(&create_event("b")).unwrap();
        pipeline.apply(&create_event("c")).unwrap();
        let outcome = pipeline.commit_batch().unwrap();

        assert_eq!(outcome.revision, Some(Revision(3)));
        let notifications = sub.drain();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].kind, NotificationKind::RevisionUpdate);
        assert_eq!(notifications[0].revision, Some(Revision(3)));
    }

    #[test]
    fn test_empty_batch_commits_without_notification() {
        let dir = tempdir().unwrap();
        let (mut pipeline, sub) = make_pipeline(dir.path());

        pipeline.start_batch().unwrap();
        let outcome = pipeline.commit_batch().unwrap();
        assert_eq!(outcome.revision, None);
        assert!(sub.drain().is_empty());
    }

    #[test]
    fn test_apply_requires_open_batch() {
        let dir = tempdir().unwrap();
        let (mut pipeline, _sub) = make_pipeline(dir.path());
        assert!(pipeline.apply(&create_event("x")).is_err());
    }

    #[test]
    fn test_modify_applies_delta_and_deletions() {
        let dir = tempdir().unwrap();
        let (mut pipeline, _sub) = make_pipeline(dir.path());
        let event_type = EntityType::new("event");

        let applied = pipeline.submit(&create_event("a")).unwrap();
        let Applied::Mutation(_) = applied else {
            panic!("expected mutation")
        };

        // Find the created entity.
        let reader = pipeline.store().snapshot().unwrap();
        let mut id = None;
        reader
            .scan_type_latest(&event_type, false, &mut |entity| {
                id = Some(entity.id());
                true
            })
            .unwrap();
        let id = id.unwrap();

        let mut delta = PropertyMap::new();
        delta.set("description", Value::String("details".into()));
        pipeline
            .submit(&Command::Modify {
                entity_type: event_type.clone(),
                id,
                delta,
                deletions: vec![PropertyName::new("summary")],
                replay_to_source: false,
                target_resource: None,
                remove_entity: false,
            })
            .unwrap();

        let entity = pipeline
            .store()
            .read_latest(&event_type, &id)
            .unwrap()
            .unwrap();
        assert_eq!(
            entity.get("description").and_then(Value::as_str),
            Some("details")
        );
        assert!(entity.get("summary").is_none());
    }

    #[test]
    fn test_drain_queue_processes_and_acks() {
        let dir = tempdir().unwrap();
        let (mut pipeline, _sub) = make_pipeline(dir.path());
        let queue_store =
            std::sync::Arc::new(crate::storage::DataStore::open(dir.path().join("syncstore")).unwrap());
        let queue = CommandQueue::open(queue_store, "inbound", 3);

        queue.enqueue(create_event("a").encode().unwrap()).unwrap();
        queue.enqueue(create_event("b").encode().unwrap()).unwrap();

        let outcome = pipeline.drain_queue(&queue).unwrap();
        assert_eq!(outcome.processed, 2);
        assert_eq!(outcome.revision, Some(Revision(2)));
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_failing_command_aborts_whole_batch() {
        let dir = tempdir().unwrap();
        let (mut pipeline, _sub) = make_pipeline(dir.path());
        let queue_store =
            std::sync::Arc::new(crate::storage::DataStore::open(dir.path().join("syncstore")).unwrap());
        let queue = CommandQueue::open(queue_store, "inbound", 3);

        queue.enqueue(create_event("good").encode().unwrap()).unwrap();
        // Modify of a non-existent entity fails.
        let bad = Command::Modify {
            entity_type: EntityType::new("event"),
            id: EntityId::new(),
            delta: PropertyMap::new(),
            deletions: vec![],
            replay_to_source: false,
            target_resource: None,
            remove_entity: false,
        };
        let bad_seq = queue.enqueue(bad.encode().unwrap()).unwrap();

        let outcome = pipeline.drain_queue(&queue).unwrap();
        assert_eq!(outcome.failed, Some(bad_seq));
        assert_eq!(outcome.processed, 0);
        // Batch rolled back: the good command is still queued, nothing
        // committed.
        assert_eq!(pipeline.store().max_revision(), Revision::ZERO);
        assert_eq!(queue.len().unwrap(), 2);
    }

    #[test]
    fn test_repeated_failure_dead_letters_and_unblocks() {
        let dir = tempdir().unwrap();
        let (mut pipeline, sub) = make_pipeline(dir.path());
        let queue_store =
            std::sync::Arc::new(crate::storage::DataStore::open(dir.path().join("syncstore")).unwrap());
        let queue = CommandQueue::open(queue_store, "inbound", 2);

        let bad = Command::Delete {
            entity_type: EntityType::new("event"),
            id: EntityId::new(),
            replay_to_source: false,
        };
        queue.enqueue(bad.encode().unwrap()).unwrap();
        queue.enqueue(create_event("after").encode().unwrap()).unwrap();

        // Two drains exhaust the retry cap of 2.
        pipeline.drain_queue(&queue).unwrap();
        pipeline.drain_queue(&queue).unwrap();
        assert_eq!(queue.dead_letters().unwrap().len(), 1);
        assert!(sub
            .drain()
            .iter()
            .any(|n| n.kind == NotificationKind::Error && n.code == codes::ERROR_DEAD_LETTER));

        // The queue is unblocked now.
        let outcome = pipeline.drain_queue(&queue).unwrap();
        assert_eq!(outcome.processed, 1);
        assert_eq!(pipeline.store().max_revision(), Revision(1));
    }

    #[test]
    fn test_invalid_payload_dropped_with_warning() {
        let dir = tempdir().unwrap();
        let (mut pipeline, _sub) = make_pipeline(dir.path());
        let queue_store =
            std::sync::Arc::new(crate::storage::DataStore::open(dir.path().join("syncstore")).unwrap());
        let queue = CommandQueue::open(queue_store, "inbound", 3);

        queue.enqueue(b"\xff\xff not a command".to_vec()).unwrap();
        queue.enqueue(create_event("ok").encode().unwrap()).unwrap();

        let outcome = pipeline.drain_queue(&queue).unwrap();
        assert_eq!(outcome.processed, 1);
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_flush_barrier_completes_after_batch() {
        let dir = tempdir().unwrap();
        let (mut pipeline, sub) = make_pipeline(dir.path());
        let queue_store =
            std::sync::Arc::new(crate::storage::DataStore::open(dir.path().join("syncstore")).unwrap());
        let queue = CommandQueue::open(queue_store, "inbound", 3);

        queue.enqueue(create_event("x").encode().unwrap()).unwrap();
        let barrier = Command::FlushBarrier {
            id: "flush-1".into(),
            kind: FlushKind::UserQueue,
        };
        queue.enqueue(barrier.encode().unwrap()).unwrap();

        pipeline.drain_queue(&queue).unwrap();

        let notifications = sub.drain();
        // Revision update first, then the flush completion.
        assert_eq!(notifications[0].kind, NotificationKind::RevisionUpdate);
        assert_eq!(notifications[1].kind, NotificationKind::FlushCompletion);
        assert_eq!(notifications[1].id, "flush-1");
    }

    #[test]
    fn test_replay_flush_is_forwarded() {
        let dir = tempdir().unwrap();
        let (mut pipeline, _sub) = make_pipeline(dir.path());

        pipeline.start_batch().unwrap();
        pipeline
            .apply(&Command::FlushBarrier {
                id: "r1".into(),
                kind: FlushKind::ReplayQueue,
            })
            .unwrap();
        let outcome = pipeline.commit_batch().unwrap();
        assert_eq!(
            outcome.forwarded_flushes,
            vec![("r1".to_string(), FlushKind::ReplayQueue)]
        );
    }

    #[test]
    fn test_mail_preprocessing_chain() {
        let dir = tempdir().unwrap();
        let (mut pipeline, _sub) = make_pipeline(dir.path());
        pipeline.set_preprocessors(
            "mail",
            vec![
                Box::new(MailPropertyExtractor),
                Box::new(ThreadIndexer::default()),
            ],
        );

        let raw = b"Subject: hi\r\nFrom: a@x\r\nMessage-ID: <m1@x>\r\n\r\nbody".to_vec();
        let mut properties = PropertyMap::new();
        properties.set("mimeMessage", Value::Bytes(raw));
        pipeline
            .submit(&Command::Create {
                entity_type: EntityType::new("mail"),
                id: None,
                properties,
                replay_to_source: false,
            })
            .unwrap();

        let reader = pipeline.store().snapshot().unwrap();
        let mut found = None;
        reader
            .scan_type_latest(&EntityType::new("mail"), false, &mut |entity| {
                found = Some(entity);
                true
            })
            .unwrap();
        let mail = found.unwrap();
        assert_eq!(mail.get("subject").and_then(Value::as_str), Some("hi"));
        assert_eq!(mail.get("messageId").and_then(Value::as_str), Some("<m1@x>"));
        assert!(mail.get("threadId").is_some());
    }

    #[test]
    fn test_special_purpose_folder_autocreated_in_same_batch() {
        let dir = tempdir().unwrap();
        let (mut pipeline, _sub) = make_pipeline(dir.path());
        pipeline.set_preprocessors(
            "mail",
            vec![Box::new(SpecialPurposeProcessor::default())],
        );

        let mut properties = PropertyMap::new();
        properties.set("draft", Value::Bool(true));
        pipeline
            .submit(&Command::Create {
                entity_type: EntityType::new("mail"),
                id: None,
                properties,
                replay_to_source: false,
            })
            .unwrap();

        // The drafts folder was created in the same batch.
        let reader = pipeline.store().snapshot().unwrap();
        let folders = reader
            .index_lookup(
                &EntityType::new("folder"),
                &PropertyName::new("specialpurpose"),
                &Value::String("drafts".into()),
            )
            .unwrap();
        assert_eq!(folders.len(), 1);

        // And the mail points at it.
        let mut mail = None;
        reader
            .scan_type_latest(&EntityType::new("mail"), false, &mut |entity| {
                mail = Some(entity);
                true
            })
            .unwrap();
        assert_eq!(
            mail.unwrap().get("folder").and_then(Value::as_id),
            Some(folders[0])
        );
    }

    struct RecordingMover(std::sync::Arc<std::sync::Mutex<Vec<(String, EntityId)>>>);

    impl ResourceMover for RecordingMover {
        fn create_in_resource(&mut self, target: &str, entity: &Entity) -> Result<()> {
            if target == "broken" {
                return Err(Error::precondition("target resource unavailable"));
            }
            self.0
                .lock()
                .unwrap()
                .push((target.to_string(), entity.id()));
            Ok(())
        }
    }

    #[test]
    fn test_move_to_resource_deletes_after_successful_copy() {
        let dir = tempdir().unwrap();
        let (mut pipeline, _sub) = make_pipeline(dir.path());
        let shipped = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        pipeline.set_resource_mover(Box::new(RecordingMover(std::sync::Arc::clone(&shipped))));
        let event_type = EntityType::new("event");

        pipeline.submit(&create_event("movable")).unwrap();
        let reader = pipeline.store().snapshot().unwrap();
        let mut id = None;
        reader
            .scan_type_latest(&event_type, false, &mut |entity| {
                id = Some(entity.id());
                true
            })
            .unwrap();
        let id = id.unwrap();

        pipeline
            .submit(&Command::Modify {
                entity_type: event_type.clone(),
                id,
                delta: PropertyMap::new(),
                deletions: vec![],
                replay_to_source: false,
                target_resource: Some("other-resource".into()),
                remove_entity: true,
            })
            .unwrap();

        assert_eq!(shipped.lock().unwrap().len(), 1);
        assert!(pipeline
            .store()
            .read_latest(&event_type, &id)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_failed_copy_aborts_local_delete() {
        let dir = tempdir().unwrap();
        let (mut pipeline, _sub) = make_pipeline(dir.path());
        pipeline.set_resource_mover(Box::new(RecordingMover(Default::default())));
        let event_type = EntityType::new("event");

        pipeline.submit(&create_event("stuck")).unwrap();
        let reader = pipeline.store().snapshot().unwrap();
        let mut id = None;
        reader
            .scan_type_latest(&event_type, false, &mut |entity| {
                id = Some(entity.id());
                true
            })
            .unwrap();
        let id = id.unwrap();

        let result = pipeline.submit(&Command::Modify {
            entity_type: event_type.clone(),
            id,
            delta: PropertyMap::new(),
            deletions: vec![],
            replay_to_source: false,
            target_resource: Some("broken".into()),
            remove_entity: true,
        });
        assert!(result.is_err());

        // The entity is still there.
        assert!(pipeline
            .store()
            .read_latest(&event_type, &id)
            .unwrap()
            .is_some());
    }
}
