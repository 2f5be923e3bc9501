//! The synchronizer: a cooperative scheduler over one source.
//!
//! Sync requests (synchronize, change replay, inspections, flush
//! barriers, login/logout) are processed one at a time on the resource's
//! event loop. The synchronizer never writes the entity store directly:
//! remote observations become commands on the synchronizer queue, which
//! the pipeline applies. Local revisions flagged `replay_to_source` are
//! pushed back to the source in revision order with a persisted
//! high-watermark, transient-failure backoff, and dead-lettering.

pub mod remoteid;
pub mod session;
pub mod source;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

pub use remoteid::RemoteIdMap;
pub use session::SyncSession;
pub use source::{SourceAdaptor, SyncScope};

use crate::config::Config;
use crate::error::{Error, Result, SourceError};
use crate::notification::{codes, Notification, NotificationBus};
use crate::pipeline::Pipeline;
use crate::queue::{CommandQueue, FlushKind, QueueItem, SYNCHRONIZER_QUEUE};
use crate::secret::SecretStore;
use crate::storage::schema::{queue_dead_tree, INTERNAL_META_TREE, LAST_REPLAYED_REVISION_KEY};
use crate::storage::DataStore;
use crate::types::{EntityId, EntityType, PropertyName, Revision, Timestamp};
use crate::value::Value;

/// An inspection request against the local store or the connection.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Inspection {
    /// Correlation id echoed in the result notification.
    pub id: String,
    /// What to inspect.
    pub kind: InspectionKind,
}

/// The inspectable conditions.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum InspectionKind {
    /// A property of an entity must have the expected value.
    Property {
        /// Entity type.
        entity_type: EntityType,
        /// Entity id.
        id: EntityId,
        /// Property to inspect.
        property: PropertyName,
        /// Expected value.
        expected: Value,
    },
    /// An entity must (not) exist.
    Existence {
        /// Entity type.
        entity_type: EntityType,
        /// Entity id.
        id: EntityId,
        /// Whether the entity is expected to exist.
        exists: bool,
    },
    /// The source connection must be alive.
    Connection,
}

/// A request on the synchronizer's cooperative queue.
#[derive(Debug)]
pub enum SyncRequest {
    /// Pull remote state for a scope.
    Synchronize(SyncScope),
    /// Replay local revisions to the source.
    ReplayChanges,
    /// Run an inspection.
    Inspect(Inspection),
    /// Barrier: completes when all earlier requests completed.
    Flush {
        /// Correlation id for the completion notification.
        id: String,
        /// Which queue the barrier belongs to.
        kind: FlushKind,
    },
    /// Establish the source connection (requires a secret for
    /// credentialed sources).
    Login,
    /// Cancel pending synchronization and disconnect.
    Logout,
}

/// The cooperative scheduler for one source.
pub struct Synchronizer {
    resource_id: String,
    adaptor: Box<dyn SourceAdaptor>,
    pipeline: Rc<RefCell<Pipeline>>,
    sync_store: Arc<DataStore>,
    sync_queue: CommandQueue,
    remote_ids: RemoteIdMap,
    secrets: SecretStore,
    bus: NotificationBus,
    config: Config,
    requests: VecDeque<SyncRequest>,
    /// Credentialed requests waiting for a secret.
    parked: Vec<SyncRequest>,
    connected: bool,
}

impl Synchronizer {
    /// Wires a synchronizer over the given collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        resource_id: impl Into<String>,
        adaptor: Box<dyn SourceAdaptor>,
        pipeline: Rc<RefCell<Pipeline>>,
        sync_store: Arc<DataStore>,
        secrets: SecretStore,
        bus: NotificationBus,
        config: Config,
    ) -> Self {
        let sync_queue = CommandQueue::open(
            Arc::clone(&sync_store),
            SYNCHRONIZER_QUEUE,
            config.queue_retry_cap,
        );
        let remote_ids = RemoteIdMap::new(Arc::clone(&sync_store));
        Self {
            resource_id: resource_id.into(),
            adaptor,
            pipeline,
            sync_store,
            sync_queue,
            remote_ids,
            secrets,
            bus,
            config,
            requests: VecDeque::new(),
            parked: Vec::new(),
            connected: false,
        }
    }

    /// The persistent remote-id map.
    pub fn remote_ids(&self) -> &RemoteIdMap {
        &self.remote_ids
    }

    /// Enqueues a request, applying the merge rules: overlapping
    /// synchronize requests coalesce, logout cancels pending
    /// synchronization and aborts the adaptor.
    pub fn enqueue(&mut self, request: SyncRequest) {
        match request {
            SyncRequest::Synchronize(scope) => {
                for queued in &mut self.requests {
                    if let SyncRequest::Synchronize(existing) = queued {
                        existing.merge(&scope);
                        debug!("coalesced synchronize request");
                        return;
                    }
                }
                self.requests.push_back(SyncRequest::Synchronize(scope));
            }
            SyncRequest::ReplayChanges => {
                // One pending replay sweep covers everything committed
                // so far; duplicates add nothing.
                if !self
                    .requests
                    .iter()
                    .any(|queued| matches!(queued, SyncRequest::ReplayChanges))
                {
                    self.requests.push_back(SyncRequest::ReplayChanges);
                }
            }
            SyncRequest::Logout => {
                let before = self.requests.len();
                self.requests
                    .retain(|queued| !matches!(queued, SyncRequest::Synchronize(_)));
                self.parked
                    .retain(|queued| !matches!(queued, SyncRequest::Synchronize(_)));
                if self.requests.len() < before {
                    debug!("logout cancelled pending synchronization");
                }
                self.adaptor.abort();
                self.requests.push_back(SyncRequest::Logout);
            }
            other => self.requests.push_back(other),
        }
    }

    /// True while runnable requests are queued.
    pub fn has_pending(&self) -> bool {
        !self.requests.is_empty()
    }

    /// True while requests are parked waiting for a secret.
    pub fn has_parked(&self) -> bool {
        !self.parked.is_empty()
    }

    /// Resumes parked requests after a secret arrived.
    pub fn secret_available(&mut self) {
        if self.parked.is_empty() {
            return;
        }
        debug!(count = self.parked.len(), "resuming parked requests");
        for request in self.parked.drain(..).rev() {
            self.requests.push_front(request);
        }
    }

    /// Processes the next runnable request. Returns false when the
    /// queue is empty.
    pub async fn process_next(&mut self) -> Result<bool> {
        let Some(request) = self.requests.pop_front() else {
            return Ok(false);
        };

        // Credentialed work parks until the secret store signals the
        // secret; everything behind it keeps flowing.
        if self.requires_secret(&request) && self.secret().is_none() {
            debug!("parking credentialed request until a secret arrives");
            self.parked.push(request);
            return Ok(true);
        }

        match request {
            SyncRequest::Synchronize(scope) => {
                if let Err(err) = self.handle_synchronize(&scope).await {
                    if err.is_fatal() {
                        return Err(err);
                    }
                    self.publish_failure(&err);
                }
            }
            SyncRequest::ReplayChanges => {
                if let Err(err) = self.handle_replay().await {
                    if err.is_fatal() {
                        return Err(err);
                    }
                    self.publish_failure(&err);
                }
            }
            SyncRequest::Inspect(inspection) => self.handle_inspect(&inspection).await?,
            SyncRequest::Flush { id, .. } => {
                // FIFO ordering guarantees everything enqueued before
                // the barrier has completed by now.
                self.bus.publish(Notification::flush_completion(id));
            }
            SyncRequest::Login => {
                if let Err(err) = self.ensure_connected().await {
                    self.publish_failure(&err);
                }
            }
            SyncRequest::Logout => self.handle_logout().await,
        }
        Ok(true)
    }

    /// Drains the request queue.
    pub async fn run_pending(&mut self) -> Result<()> {
        while self.process_next().await? {}
        Ok(())
    }

    /// The replay high-watermark: the highest local revision already
    /// reflected upstream.
    pub fn last_replayed_revision(&self) -> Result<Revision> {
        let read = self.sync_store.begin_read()?;
        Ok(read
            .get(INTERNAL_META_TREE, LAST_REPLAYED_REVISION_KEY)?
            .and_then(|bytes| bytes.try_into().ok().map(Revision::from_be_bytes))
            .unwrap_or(Revision::ZERO))
    }

    fn set_last_replayed_revision(&self, revision: Revision) -> Result<()> {
        let mut txn = self.sync_store.begin_write()?;
        txn.put(
            INTERNAL_META_TREE,
            LAST_REPLAYED_REVISION_KEY,
            &revision.to_be_bytes(),
        )?;
        txn.commit()?;
        Ok(())
    }

    fn secret(&self) -> Option<String> {
        self.secrets.secret(&self.resource_id)
    }

    fn requires_secret(&self, request: &SyncRequest) -> bool {
        self.adaptor.needs_secret()
            && !self.connected
            && matches!(
                request,
                SyncRequest::Synchronize(_) | SyncRequest::ReplayChanges | SyncRequest::Login
            )
    }

    async fn ensure_connected(&mut self) -> Result<()> {
        if self.connected {
            return Ok(());
        }
        let secret = if self.adaptor.needs_secret() {
            self.secret()
                .ok_or_else(|| Error::auth(self.resource_id.clone()))?
        } else {
            String::new()
        };
        self.adaptor.connect(&secret).await?;
        self.connected = true;
        self.bus
            .publish(Notification::status(codes::STATUS_CONNECTED, ""));
        info!(resource = %self.resource_id, "source connected");
        Ok(())
    }

    #[instrument(skip(self, scope))]
    async fn handle_synchronize(&mut self, scope: &SyncScope) -> Result<()> {
        self.bus
            .publish(Notification::status(codes::STATUS_BUSY, "synchronizing"));
        self.bus.publish(Notification::sync_in_progress(Vec::new()));
        self.ensure_connected().await?;

        let outcome = {
            let reader = self.pipeline.borrow().store().snapshot()?;
            let mut session = SyncSession::new(
                reader,
                &self.remote_ids,
                &self.sync_queue,
                self.last_replayed_revision()?,
            );
            self.adaptor.synchronize(scope, &mut session).await?;
            session.into_outcome()
        };

        self.apply_sync_queue()?;

        for folder in &outcome.new_content_folders {
            self.bus
                .publish(Notification::new_content_available(*folder));
        }
        self.bus
            .publish(Notification::sync_success(outcome.affected));
        self.bus
            .publish(Notification::status(codes::STATUS_CONNECTED, ""));
        Ok(())
    }

    /// Applies everything the session queued through the pipeline.
    fn apply_sync_queue(&self) -> Result<()> {
        loop {
            let outcome = self.pipeline.borrow_mut().drain_queue(&self.sync_queue)?;
            if outcome.processed == 0 && outcome.failed.is_none() {
                return Ok(());
            }
            // A failed command retries (and eventually dead-letters)
            // through the queue's own retry accounting.
        }
    }

    #[instrument(skip(self))]
    async fn handle_replay(&mut self) -> Result<()> {
        self.ensure_connected().await?;

        let watermark = self.last_replayed_revision()?;
        let reader = self.pipeline.borrow().store().snapshot()?;
        let max = reader.max_revision();
        if max <= watermark {
            return Ok(());
        }

        let mut pending = Vec::new();
        reader.scan_revisions(Revision(watermark.get() + 1), max, &mut |revision, entry| {
            pending.push((revision, entry.clone()));
            true
        })?;

        let total = pending.len() as u64;
        for (done, (revision, entry)) in pending.into_iter().enumerate() {
            self.bus
                .publish(Notification::progress(done as u64, total));
            let record = match reader.read_revision(&entry.entity_type, &entry.id, revision) {
                Ok(record) => record,
                // Cleaned up since; nothing left to replay.
                Err(err) if err.is_not_found() => {
                    self.set_last_replayed_revision(revision)?;
                    continue;
                }
                Err(err) => return Err(err),
            };

            if record.metadata.replay_to_source {
                self.replay_one(&entry.entity_type, &record).await?;
                self.bus.publish(Notification::revision_replayed(revision));
            }
            self.set_last_replayed_revision(revision)?;
        }
        self.bus.publish(Notification::progress(total, total));
        Ok(())
    }

    /// Replays a single revision record with backoff on transient
    /// failures; permanent failures are dead-lettered.
    async fn replay_one(
        &mut self,
        entity_type: &EntityType,
        record: &crate::entity::Entity,
    ) -> Result<()> {
        let id = record.id();
        let mapping = self.remote_ids.resolve_local(entity_type, &id)?;
        let mut attempt: u32 = 0;

        loop {
            let result = if record.is_deleted() {
                match &mapping {
                    Some(remote_id) => self
                        .adaptor
                        .replay_delete(entity_type, remote_id)
                        .await
                        .map(|()| {
                            self.remote_ids.remove_by_local(entity_type, &id).map(|_| ())
                        }),
                    // Never reached the source; nothing to delete.
                    None => return Ok(()),
                }
            } else if let Some(remote_id) = &mapping {
                self.adaptor
                    .replay_modify(entity_type, remote_id, record)
                    .await
                    .map(|new_remote| match new_remote {
                        Some(new_remote) => self.remote_ids.record(entity_type, &new_remote, id),
                        None => Ok(()),
                    })
            } else {
                self.adaptor
                    .replay_create(entity_type, record)
                    .await
                    .map(|remote_id| self.remote_ids.record(entity_type, &remote_id, id))
            };

            match result {
                Ok(map_update) => {
                    map_update?;
                    self.bus.publish(Notification::sync_success(vec![id]));
                    return Ok(());
                }
                Err(err @ Error::Source(SourceError::Transient(_)))
                    if attempt < self.config.queue_retry_cap =>
                {
                    let backoff = self
                        .config
                        .replay_backoff_base
                        .saturating_mul(2u32.saturating_pow(attempt))
                        .min(self.config.replay_backoff_max);
                    warn!(
                        entity = %id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "transient replay failure, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err @ Error::Source(SourceError::Connection(_))) => {
                    // The source went away; leave the watermark so the
                    // item is retried on the next replay request.
                    self.connected = false;
                    return Err(err);
                }
                Err(err) => {
                    self.dead_letter_replay(entity_type, record, &err)?;
                    self.bus
                        .publish(Notification::sync_error(vec![id], err.to_string()));
                    self.bus.publish(Notification::error(
                        codes::ERROR_DEAD_LETTER,
                        format!("replay of {} failed permanently: {}", id, err),
                    ));
                    return Ok(());
                }
            }
        }
    }

    /// Parks an unreplayable revision in the replay dead-letter tree.
    fn dead_letter_replay(
        &self,
        entity_type: &EntityType,
        record: &crate::entity::Entity,
        err: &Error,
    ) -> Result<()> {
        warn!(entity = %record.id(), error = %err, "dead-lettering replay item");
        let item = QueueItem {
            enqueued_at: Timestamp::now(),
            retries: self.config.queue_retry_cap,
            payload: bincode::serialize(&(
                entity_type.clone(),
                record.id(),
                record.revision(),
                err.to_string(),
            ))
            .map_err(crate::error::StorageError::from)?,
        };
        let mut txn = self.sync_store.begin_write()?;
        txn.put(
            &queue_dead_tree("replay"),
            &record.revision().to_be_bytes(),
            &bincode::serialize(&item).map_err(crate::error::StorageError::from)?,
        )?;
        txn.commit()?;
        Ok(())
    }

    async fn handle_inspect(&mut self, inspection: &Inspection) -> Result<()> {
        let failure = match &inspection.kind {
            InspectionKind::Property {
                entity_type,
                id,
                property,
                expected,
            } => {
                let reader = self.pipeline.borrow().store().snapshot()?;
                match reader.read_latest(entity_type, id)? {
                    Some(entity) => match entity.get(property.as_str()) {
                        Some(actual) if actual == expected => None,
                        actual => Some(format!(
                            "property {} is {:?}, expected {}",
                            property, actual, expected
                        )),
                    },
                    None => Some(format!("entity {} not found", id)),
                }
            }
            InspectionKind::Existence {
                entity_type,
                id,
                exists,
            } => {
                let reader = self.pipeline.borrow().store().snapshot()?;
                let found = reader.read_latest(entity_type, id)?.is_some();
                if found == *exists {
                    None
                } else {
                    Some(format!("entity {} exists: {}, expected {}", id, found, exists))
                }
            }
            InspectionKind::Connection => match self.adaptor.check_connection().await {
                Ok(()) => None,
                Err(err) => Some(err.to_string()),
            },
        };

        self.bus
            .publish(Notification::inspection(inspection.id.clone(), failure));
        Ok(())
    }

    async fn handle_logout(&mut self) {
        self.adaptor.abort();
        if let Err(err) = self.adaptor.logout().await {
            warn!(error = %err, "logout reported an error");
        }
        self.connected = false;
        self.bus
            .publish(Notification::status(codes::STATUS_OFFLINE, "logged out"));
        info!(resource = %self.resource_id, "source disconnected");
    }

    /// Maps a request failure to status / error notifications.
    fn publish_failure(&mut self, err: &Error) {
        let code = match err {
            Error::Source(SourceError::Connection(_)) => {
                self.connected = false;
                codes::ERROR_CONNECTION
            }
            Error::Auth { .. } => codes::ERROR_AUTH,
            Error::Storage(crate::error::StorageError::Full(_)) => codes::ERROR_STORAGE_FULL,
            Error::Storage(crate::error::StorageError::Corrupted(_)) => {
                codes::ERROR_STORAGE_CORRUPT
            }
            _ => codes::ERROR_GENERAL,
        };
        self.bus
            .publish(Notification::status(codes::STATUS_ERROR, err.to_string()));
        self.bus.publish(Notification::error(code, err.to_string()));
        self.bus
            .publish(Notification::sync_error(Vec::new(), err.to_string()));
    }
}

impl std::fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synchronizer")
            .field("resource", &self.resource_id)
            .field("pending", &self.requests.len())
            .field("parked", &self.parked.len())
            .field("connected", &self.connected)
            .finish_non_exhaustive()
    }
}
