//! The resource instance worker.
//!
//! Wires the stores, pipeline, queues, synchronizer, listener, and
//! notification bus into one single-threaded worker. All work runs
//! cooperatively on a tokio `LocalSet`: the listener accepts clients and
//! enqueues work, the event loop drains the inbound queue through the
//! pipeline and drives the synchronizer, and notifications fan out to
//! every connected client.
//!
//! A process-level lockfile guarantees at most one worker per instance
//! directory.

use std::cell::{Cell, RefCell};
use std::fs::{self, OpenOptions};
use std::rc::Rc;
use std::sync::Arc;

use fs2::FileExt;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::context::ResourceContext;
use crate::entity::{Entity, EntityStore};
use crate::error::{Error, Result, StorageError};
use crate::listener::{Listener, ListenerShared};
use crate::notification::{codes, Notification, NotificationBus, NotificationSubscription};
use crate::pipeline::{
    Command, EventPropertyExtractor, MailPropertyExtractor, Pipeline, ResourceMover,
    SpecialPurposeProcessor, ThreadIndexer,
};
use crate::query::{self, LiveQuery, Query};
use crate::queue::{CommandQueue, INBOUND_QUEUE};
use crate::storage::schema::SYNCHRONIZATION_STORE_FILE;
use crate::storage::DataStore;
use crate::sync::{SourceAdaptor, SyncRequest, Synchronizer};
use crate::types::Revision;

/// One running resource instance.
pub struct Resource {
    context: ResourceContext,
    pipeline: Rc<RefCell<Pipeline>>,
    synchronizer: Synchronizer,
    inbound: CommandQueue,
    bus: NotificationBus,
    shared: Rc<ListenerShared>,
    sync_requests: mpsc::UnboundedReceiver<SyncRequest>,
    _lockfile: std::fs::File,
}

impl Resource {
    /// Assembles a worker for the given context and source adaptor.
    ///
    /// Acquires the instance lockfile; a second worker on the same
    /// instance fails with [`StorageError::Locked`].
    #[instrument(skip(context, adaptor), fields(instance = %context.instance_id))]
    pub fn new(context: ResourceContext, adaptor: Box<dyn SourceAdaptor>) -> Result<Self> {
        fs::create_dir_all(&context.instance_dir)?;

        let lockfile = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(context.lockfile_path())?;
        lockfile
            .try_lock_exclusive()
            .map_err(|_| Error::Storage(StorageError::Locked))?;

        let bus = NotificationBus::new(context.config.notification_buffer);

        let entity_store =
            EntityStore::open(&context.instance_dir, Arc::clone(&context.registry))?;
        let mut pipeline = Pipeline::new(entity_store, bus.clone(), context.config.clone());
        pipeline.set_preprocessors(
            "mail",
            vec![
                Box::new(MailPropertyExtractor),
                Box::new(ThreadIndexer::default()),
                Box::new(SpecialPurposeProcessor::default()),
            ],
        );
        pipeline.set_preprocessors(
            "folder",
            vec![Box::new(SpecialPurposeProcessor::default())],
        );
        pipeline.set_preprocessors("event", vec![Box::new(EventPropertyExtractor)]);
        let pipeline = Rc::new(RefCell::new(pipeline));

        let sync_store = Arc::new(DataStore::open(
            context.instance_dir.join(SYNCHRONIZATION_STORE_FILE),
        )?);
        let inbound = CommandQueue::open(
            Arc::clone(&sync_store),
            INBOUND_QUEUE,
            context.config.queue_retry_cap,
        );

        let synchronizer = Synchronizer::new(
            context.instance_id.clone(),
            adaptor,
            Rc::clone(&pipeline),
            sync_store,
            context.secrets.clone(),
            bus.clone(),
            context.config.clone(),
        );

        let (sync_tx, sync_rx) = mpsc::unbounded_channel();
        let shared = Rc::new(ListenerShared {
            pipeline: Rc::clone(&pipeline),
            sync_requests: sync_tx,
            inbound: inbound.clone(),
            secrets: context.secrets.clone(),
            bus: bus.clone(),
            config: context.config.clone(),
            resource_id: context.instance_id.clone(),
            work_available: Rc::new(Notify::new()),
            shutdown: Rc::new(Notify::new()),
            shutdown_requested: Rc::new(Cell::new(false)),
            client_count: Rc::new(Cell::new(0)),
            secret_arrived: Rc::new(Cell::new(false)),
        });

        info!(dir = %context.instance_dir.display(), "resource instance assembled");
        Ok(Self {
            context,
            pipeline,
            synchronizer,
            inbound,
            bus,
            shared,
            sync_requests: sync_rx,
            _lockfile: lockfile,
        })
    }

    /// Stamps both stores of an instance with the current schema
    /// version.
    ///
    /// Run this *before* constructing the worker (the stores must not be
    /// open). Returns true if any store actually changed version.
    pub fn upgrade_stores(context: &ResourceContext) -> Result<bool> {
        let entity_changed = DataStore::upgrade(
            context
                .instance_dir
                .join(crate::storage::schema::ENTITY_STORE_FILE),
        )?;
        let sync_changed =
            DataStore::upgrade(context.instance_dir.join(SYNCHRONIZATION_STORE_FILE))?;
        Ok(entity_changed || sync_changed)
    }

    /// The context this worker was built from.
    pub fn context(&self) -> &ResourceContext {
        &self.context
    }

    /// The notification bus.
    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    /// Subscribes to notifications.
    pub fn subscribe(&self) -> NotificationSubscription {
        self.bus.subscribe()
    }

    /// Registers the inter-resource mover used by move/copy commands.
    pub fn set_resource_mover(&self, mover: Box<dyn ResourceMover>) {
        self.pipeline.borrow_mut().set_resource_mover(mover);
    }

    /// Current max revision of the entity store.
    pub fn max_revision(&self) -> Revision {
        self.pipeline.borrow().store().max_revision()
    }

    /// Enqueues a client command as if it arrived over the socket.
    pub fn enqueue_command(&self, command: &Command) -> Result<u64> {
        let seq = self.inbound.enqueue(command.encode()?)?;
        self.shared.work_available.notify_one();
        Ok(seq)
    }

    /// Enqueues a synchronizer request.
    pub fn request_sync(&mut self, request: SyncRequest) {
        self.synchronizer.enqueue(request);
        self.shared.work_available.notify_one();
    }

    /// Executes a one-shot query against the current state.
    pub fn execute_query(&self, query: &Query) -> Result<Vec<Entity>> {
        let reader = self.pipeline.borrow().store().snapshot()?;
        query::execute(&reader, query)
    }

    /// Starts a live query, returning the handle and the initial result.
    pub fn live_query(&self, query: Query) -> Result<(LiveQuery, Vec<Entity>)> {
        let reader = self.pipeline.borrow().store().snapshot()?;
        LiveQuery::initialize(&reader, query)
    }

    /// Advances a live query against the current state.
    pub fn advance_live_query(&self, live: &mut LiveQuery) -> Result<Vec<query::ResultEvent>> {
        let reader = self.pipeline.borrow().store().snapshot()?;
        live.process_revision_update(&reader)
    }

    /// Prunes revisions below `threshold`, respecting live query pins.
    ///
    /// `pinned` is the lowest revision any active live query still
    /// needs; the effective threshold never exceeds it.
    pub fn cleanup_revisions(
        &self,
        threshold: Revision,
        pinned: Option<Revision>,
    ) -> Result<bool> {
        let effective = match pinned {
            Some(pinned) if pinned < threshold => Revision(pinned.get() + 1),
            _ => threshold,
        };
        self.pipeline.borrow_mut().cleanup_revisions(effective)
    }

    /// Processes everything currently pending: inbound commands, then
    /// synchronizer requests, until both queues are idle.
    ///
    /// This is the inner step of [`run`](Self::run); tests drive it
    /// directly without a socket.
    pub async fn run_until_idle(&mut self) -> Result<()> {
        loop {
            while let Ok(request) = self.sync_requests.try_recv() {
                self.synchronizer.enqueue(request);
            }
            if self.shared.secret_arrived.replace(false) {
                self.synchronizer.secret_available();
            }

            let mut worked = false;
            loop {
                let outcome = self.pipeline.borrow_mut().drain_queue(&self.inbound)?;
                for (id, kind) in outcome.forwarded_flushes {
                    self.synchronizer.enqueue(SyncRequest::Flush { id, kind });
                }
                if outcome.revision.is_some() {
                    // Freshly committed local revisions may need replay.
                    self.synchronizer.enqueue(SyncRequest::ReplayChanges);
                }
                let progressed = outcome.processed > 0 || outcome.failed.is_some();
                worked |= progressed;
                if !progressed {
                    break;
                }
            }

            while self.synchronizer.process_next().await? {
                worked = true;
            }

            if !worked {
                return Ok(());
            }
        }
    }

    /// Runs the worker: binds the socket, serves clients, and processes
    /// work until shutdown is requested or the idle timeout elapses
    /// after the last client disconnected.
    ///
    /// Must be driven from inside a [`tokio::task::LocalSet`].
    pub async fn run(mut self) -> Result<()> {
        let socket_path = self.context.socket_path();
        let listener = Listener::bind(&socket_path, Rc::clone(&self.shared))?;
        let listener_task = tokio::task::spawn_local(listener.run());

        let result = self.event_loop().await;

        // Stop accepting, drop connections, release the socket file.
        self.shared.shutdown_requested.set(true);
        self.shared.shutdown.notify_waiters();
        let _ = listener_task.await;
        let _ = fs::remove_file(&socket_path);

        if let Err(err) = &result {
            self.bus.publish(Notification::error(
                if matches!(err, Error::Storage(StorageError::Full(_))) {
                    codes::ERROR_STORAGE_FULL
                } else {
                    codes::ERROR_STORAGE_CORRUPT
                },
                err.to_string(),
            ));
            warn!(error = %err, "worker terminating on fatal error");
        }
        self.bus
            .publish(Notification::status(codes::STATUS_OFFLINE, "shutting down"));
        info!(instance = %self.context.instance_id, "worker stopped");
        result
    }

    async fn event_loop(&mut self) -> Result<()> {
        loop {
            self.run_until_idle().await?;

            if self.shared.shutdown_requested.get() {
                debug!("shutdown requested");
                return Ok(());
            }

            let idle = self.shared.client_count.get() == 0
                && self.inbound.is_empty()?
                && !self.synchronizer.has_pending();

            let work = self.shared.work_available.notified();
            let stop = self.shared.shutdown.notified();
            match self.context.config.idle_timeout {
                Some(timeout) if idle => {
                    tokio::select! {
                        _ = work => {}
                        _ = stop => return Ok(()),
                        _ = tokio::time::sleep(timeout) => {
                            if self.shared.client_count.get() == 0
                                && self.inbound.is_empty()?
                                && !self.synchronizer.has_pending()
                            {
                                info!("idle timeout elapsed, shutting down");
                                return Ok(());
                            }
                        }
                    }
                }
                _ => {
                    tokio::select! {
                        _ = work => {}
                        _ = stop => return Ok(()),
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("instance", &self.context.instance_id)
            .field("clients", &self.shared.client_count.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::source::SyncScope;
    use crate::sync::SyncSession;
    use async_trait::async_trait;
    use tempfile::tempdir;

    struct NullSource;

    #[async_trait(?Send)]
    impl SourceAdaptor for NullSource {
        async fn connect(&mut self, _secret: &str) -> Result<()> {
            Ok(())
        }
        async fn synchronize(
            &mut self,
            _scope: &SyncScope,
            _session: &mut SyncSession<'_>,
        ) -> Result<()> {
            Ok(())
        }
        async fn replay_create(
            &mut self,
            _entity_type: &crate::types::EntityType,
            _entity: &Entity,
        ) -> Result<crate::types::RemoteId> {
            Ok(crate::types::RemoteId::new("r"))
        }
        async fn replay_modify(
            &mut self,
            _entity_type: &crate::types::EntityType,
            _remote_id: &crate::types::RemoteId,
            _entity: &Entity,
        ) -> Result<Option<crate::types::RemoteId>> {
            Ok(None)
        }
        async fn replay_delete(
            &mut self,
            _entity_type: &crate::types::EntityType,
            _remote_id: &crate::types::RemoteId,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn make_resource(dir: &std::path::Path) -> Resource {
        let context =
            ResourceContext::new("instance1", "dummy", dir, Config::default()).unwrap();
        Resource::new(context, Box::new(NullSource)).unwrap()
    }

    #[test]
    fn test_lockfile_prevents_second_worker() {
        let dir = tempdir().unwrap();
        let _first = make_resource(dir.path());

        let context =
            ResourceContext::new("instance1", "dummy", dir.path(), Config::default()).unwrap();
        let second = Resource::new(context, Box::new(NullSource));
        assert!(matches!(
            second.unwrap_err(),
            Error::Storage(StorageError::Locked)
        ));
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = tempdir().unwrap();
        {
            let _resource = make_resource(dir.path());
        }
        // A new worker can start now.
        let _resource = make_resource(dir.path());
    }

    #[tokio::test]
    async fn test_commands_processed_until_idle() {
        let dir = tempdir().unwrap();
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let mut resource = make_resource(dir.path());

                let mut properties = crate::value::PropertyMap::new();
                properties.set("summary", crate::value::Value::String("A".into()));
                resource
                    .enqueue_command(&Command::Create {
                        entity_type: crate::types::EntityType::new("event"),
                        id: None,
                        properties,
                        replay_to_source: false,
                    })
                    .unwrap();

                resource.run_until_idle().await.unwrap();
                assert_eq!(resource.max_revision(), Revision(1));
                assert_eq!(
                    resource
                        .execute_query(&Query::new("event"))
                        .unwrap()
                        .len(),
                    1
                );
            })
            .await;
    }
}
