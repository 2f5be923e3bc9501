//! Notifications and the in-process notification bus.
//!
//! Every interesting state change in a worker — a committed revision, a
//! sync status transition, a flush barrier completing — is published as
//! a [`Notification`]. Subscribers (the listener forwarding to clients,
//! live queries, tests) receive their own bounded channel; a subscriber
//! that falls behind loses notifications with a warning rather than
//! stalling the publisher. Consumers that must not miss state (live
//! queries) are designed to resynchronize from the revision log, so a
//! dropped `RevisionUpdate` is recovered by the next one.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use atomic_waker::AtomicWaker;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{EntityId, Revision};

/// Kind tag of a notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationKind {
    /// A new revision was committed; `revision` carries the new maximum.
    RevisionUpdate,
    /// Connection/busy/error status of the synchronizer.
    Status,
    /// Informational sync-progress transitions (see [`codes`]).
    Info,
    /// An error surfaced to clients.
    Error,
    /// A flush barrier completed; `id` carries the barrier id.
    FlushCompletion,
    /// Progress of a long-running operation.
    Progress,
    /// New content arrived in a folder (`entities` carries the folder).
    NewContentAvailable,
    /// Result of an inspection request; `id` carries the inspection id.
    Inspection,
    /// A local revision was replayed to the source.
    RevisionReplayed,
}

/// Documented small-integer codes carried by notifications.
pub mod codes {
    /// Status: worker is offline with respect to its source.
    pub const STATUS_OFFLINE: u32 = 0;
    /// Status: worker is connected to its source.
    pub const STATUS_CONNECTED: u32 = 1;
    /// Status: worker is busy synchronizing.
    pub const STATUS_BUSY: u32 = 2;
    /// Status: worker hit an error talking to its source.
    pub const STATUS_ERROR: u32 = 3;

    /// Info: synchronization of the listed entities started.
    pub const SYNC_IN_PROGRESS: u32 = 1;
    /// Info: synchronization of the listed entities succeeded.
    pub const SYNC_SUCCESS: u32 = 2;
    /// Info: synchronization of the listed entities failed.
    pub const SYNC_ERROR: u32 = 3;

    /// Error: unspecified failure.
    pub const ERROR_GENERAL: u32 = 1;
    /// Error: the source is unreachable.
    pub const ERROR_CONNECTION: u32 = 2;
    /// Error: missing or rejected credentials.
    pub const ERROR_AUTH: u32 = 3;
    /// Error: the local store is full.
    pub const ERROR_STORAGE_FULL: u32 = 4;
    /// Error: the local store is corrupt.
    pub const ERROR_STORAGE_CORRUPT: u32 = 5;
    /// Error: a command exceeded its retry cap and was dead-lettered.
    pub const ERROR_DEAD_LETTER: u32 = 6;
}

/// A notification pushed to clients and in-process subscribers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// What happened.
    pub kind: NotificationKind,
    /// Kind-specific code, see [`codes`].
    pub code: u32,
    /// Correlation id (flush barrier id, inspection id), if any.
    pub id: String,
    /// Entities affected by this notification.
    pub entities: Vec<EntityId>,
    /// Human-readable message, possibly empty.
    pub message: String,
    /// Revision carried by revision-update / replay notifications.
    pub revision: Option<Revision>,
    /// Progress as `(current, total)` for `Progress` notifications.
    pub progress: Option<(u64, u64)>,
}

impl Notification {
    fn base(kind: NotificationKind) -> Self {
        Self {
            kind,
            code: 0,
            id: String::new(),
            entities: Vec::new(),
            message: String::new(),
            revision: None,
            progress: None,
        }
    }

    /// A committed revision update.
    pub fn revision_update(revision: Revision) -> Self {
        Self {
            revision: Some(revision),
            ..Self::base(NotificationKind::RevisionUpdate)
        }
    }

    /// A synchronizer status transition.
    pub fn status(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            ..Self::base(NotificationKind::Status)
        }
    }

    /// Sync started for the listed entities.
    pub fn sync_in_progress(entities: Vec<EntityId>) -> Self {
        Self {
            code: codes::SYNC_IN_PROGRESS,
            entities,
            ..Self::base(NotificationKind::Info)
        }
    }

    /// Sync succeeded for the listed entities.
    pub fn sync_success(entities: Vec<EntityId>) -> Self {
        Self {
            code: codes::SYNC_SUCCESS,
            entities,
            ..Self::base(NotificationKind::Info)
        }
    }

    /// Sync failed for the listed entities.
    pub fn sync_error(entities: Vec<EntityId>, message: impl Into<String>) -> Self {
        Self {
            code: codes::SYNC_ERROR,
            entities,
            message: message.into(),
            ..Self::base(NotificationKind::Info)
        }
    }

    /// An error surfaced to clients.
    pub fn error(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            ..Self::base(NotificationKind::Error)
        }
    }

    /// A flush barrier with the given id completed.
    pub fn flush_completion(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::base(NotificationKind::FlushCompletion)
        }
    }

    /// Progress of a long-running operation.
    pub fn progress(current: u64, total: u64) -> Self {
        Self {
            progress: Some((current, total)),
            ..Self::base(NotificationKind::Progress)
        }
    }

    /// New content arrived in the given folder.
    pub fn new_content_available(folder: EntityId) -> Self {
        Self {
            entities: vec![folder],
            ..Self::base(NotificationKind::NewContentAvailable)
        }
    }

    /// Result of an inspection; `failure` is `None` on success.
    pub fn inspection(id: impl Into<String>, failure: Option<String>) -> Self {
        Self {
            id: id.into(),
            code: u32::from(failure.is_some()),
            message: failure.unwrap_or_default(),
            ..Self::base(NotificationKind::Inspection)
        }
    }

    /// A local revision was replayed to the source.
    pub fn revision_replayed(revision: Revision) -> Self {
        Self {
            revision: Some(revision),
            ..Self::base(NotificationKind::RevisionReplayed)
        }
    }
}

struct Subscriber {
    sender: Sender<Notification>,
    waker: Arc<AtomicWaker>,
}

struct BusInner {
    subscribers: Mutex<Vec<Subscriber>>,
    capacity: usize,
}

/// Fan-out bus for [`Notification`]s.
///
/// Cloning is cheap; all clones publish to the same subscriber set.
#[derive(Clone)]
pub struct NotificationBus {
    inner: Arc<BusInner>,
}

impl NotificationBus {
    /// Creates a bus whose subscriber channels hold `capacity` pending
    /// notifications each.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(Vec::new()),
                capacity,
            }),
        }
    }

    /// Registers a new subscriber.
    pub fn subscribe(&self) -> NotificationSubscription {
        let (sender, receiver) = bounded(self.inner.capacity);
        let waker = Arc::new(AtomicWaker::new());
        let mut subscribers = self.inner.subscribers.lock().expect("bus lock");
        subscribers.push(Subscriber {
            sender,
            waker: Arc::clone(&waker),
        });
        NotificationSubscription { receiver, waker }
    }

    /// Publishes a notification to every live subscriber.
    ///
    /// Disconnected subscribers are pruned; full subscriber channels
    /// lose the notification with a warning.
    pub fn publish(&self, notification: Notification) {
        let mut subscribers = self.inner.subscribers.lock().expect("bus lock");
        subscribers.retain(|subscriber| {
            match subscriber.sender.try_send(notification.clone()) {
                Ok(()) => {
                    subscriber.waker.wake();
                    true
                }
                Err(TrySendError::Full(dropped)) => {
                    warn!(kind = ?dropped.kind, "slow notification subscriber, dropping");
                    subscriber.waker.wake();
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            }
        });
    }

    /// Number of live subscribers (pruned lazily on publish).
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().expect("bus lock").len()
    }
}

impl std::fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// One subscriber's end of the bus.
///
/// Usable both synchronously ([`try_next`](Self::try_next),
/// [`recv_timeout`](Self::recv_timeout)) and as a [`Stream`]. Dropping
/// the subscription unregisters it on the next publish.
pub struct NotificationSubscription {
    receiver: Receiver<Notification>,
    waker: Arc<AtomicWaker>,
}

impl NotificationSubscription {
    /// Pops the next pending notification, if any.
    pub fn try_next(&self) -> Option<Notification> {
        self.receiver.try_recv().ok()
    }

    /// Blocks up to `timeout` for the next notification.
    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Option<Notification> {
        self.receiver.recv_timeout(timeout).ok()
    }

    /// Drains everything currently pending.
    pub fn drain(&self) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(notification) = self.receiver.try_recv() {
            out.push(notification);
        }
        out
    }
}

impl Stream for NotificationSubscription {
    type Item = Notification;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        // Register first so a publish between try_recv and return wakes us.
        self.waker.register(cx.waker());
        match self.receiver.try_recv() {
            Ok(notification) => Poll::Ready(Some(notification)),
            Err(crossbeam_channel::TryRecvError::Empty) => Poll::Pending,
            Err(crossbeam_channel::TryRecvError::Disconnected) => Poll::Ready(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_reaches_all_subscribers() {
        let bus = NotificationBus::new(16);
        let sub1 = bus.subscribe();
        let sub2 = bus.subscribe();

        bus.publish(Notification::revision_update(Revision(1)));

        for sub in [&sub1, &sub2] {
            let n = sub.try_next().unwrap();
            assert_eq!(n.kind, NotificationKind::RevisionUpdate);
            assert_eq!(n.revision, Some(Revision(1)));
        }
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let bus = NotificationBus::new(16);
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        drop(sub);
        bus.publish(Notification::status(codes::STATUS_CONNECTED, ""));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_full_subscriber_drops_but_stays_subscribed() {
        let bus = NotificationBus::new(1);
        let sub = bus.subscribe();

        bus.publish(Notification::revision_update(Revision(1)));
        bus.publish(Notification::revision_update(Revision(2)));
        assert_eq!(bus.subscriber_count(), 1);

        // The first notification survived; the overflow was dropped.
        let n = sub.try_next().unwrap();
        assert_eq!(n.revision, Some(Revision(1)));
        assert!(sub.try_next().is_none());

        // Still receives after draining.
        bus.publish(Notification::revision_update(Revision(3)));
        assert_eq!(sub.try_next().unwrap().revision, Some(Revision(3)));
    }

    #[test]
    fn test_drain() {
        let bus = NotificationBus::new(16);
        let sub = bus.subscribe();
        bus.publish(Notification::sync_in_progress(vec![]));
        bus.publish(Notification::sync_success(vec![]));

        let drained = sub.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].code, codes::SYNC_IN_PROGRESS);
        assert_eq!(drained[1].code, codes::SYNC_SUCCESS);
    }

    #[tokio::test]
    async fn test_stream_wakes_on_publish() {
        use futures::StreamExt;

        let bus = NotificationBus::new(16);
        let mut sub = bus.subscribe();

        let publisher = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            bus.publish(Notification::flush_completion("f1"));
        });

        let notification = sub.next().await.unwrap();
        assert_eq!(notification.kind, NotificationKind::FlushCompletion);
        assert_eq!(notification.id, "f1");
        publisher.join().unwrap();
    }

    #[test]
    fn test_constructor_shapes() {
        let n = Notification::sync_error(vec![EntityId::nil()], "boom");
        assert_eq!(n.kind, NotificationKind::Info);
        assert_eq!(n.code, codes::SYNC_ERROR);
        assert_eq!(n.entities.len(), 1);
        assert_eq!(n.message, "boom");

        let n = Notification::inspection("i1", Some("mismatch".into()));
        assert_eq!(n.code, 1);
        let n = Notification::inspection("i1", None);
        assert_eq!(n.code, 0);

        let n = Notification::progress(3, 10);
        assert_eq!(n.progress, Some((3, 10)));
    }
}
