//! The local-socket protocol endpoint.
//!
//! Accepts any number of client connections on a Unix-domain socket,
//! decodes length-prefixed frames, dispatches commands, and pushes
//! notifications back. A connection must open with a handshake; the
//! server answers it with a completion and the current revision.
//!
//! Entity commands are acknowledged once durably enqueued; processing
//! failures surface later through notifications (and ultimately the
//! dead-letter area). Each connection has a bounded outbound channel so
//! one slow client cannot stall the worker.

use std::cell::{Cell, RefCell};
use std::path::Path;
use std::rc::Rc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Notify};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::notification::{Notification, NotificationKind};
use crate::pipeline::{Command, Pipeline};
use crate::protocol::{
    decode_payload, encode_payload, CommandCompletionPayload, CommandId, FlushPayload, Frame,
    FrameCodec, HandshakePayload, InspectionPayload, NotificationPayload, RevisionPayload,
    SecretPayload, SynchronizePayload,
};
use crate::queue::{CommandQueue, FlushKind};
use crate::secret::SecretStore;
use crate::sync::{SyncRequest, SyncScope};
use crate::NotificationBus;

/// State shared between the listener, its connections, and the resource
/// event loop. Everything lives on one thread.
///
/// The synchronizer is owned exclusively by the event loop; connections
/// hand it requests through `sync_requests` so no borrow is ever held
/// across a suspension point.
pub(crate) struct ListenerShared {
    pub pipeline: Rc<RefCell<Pipeline>>,
    pub sync_requests: mpsc::UnboundedSender<SyncRequest>,
    pub inbound: CommandQueue,
    pub secrets: SecretStore,
    pub bus: NotificationBus,
    pub config: Config,
    pub resource_id: String,
    /// Signalled whenever new work (commands, sync requests) arrived.
    pub work_available: Rc<Notify>,
    /// Signalled once to stop the listener and the event loop.
    pub shutdown: Rc<Notify>,
    pub shutdown_requested: Rc<Cell<bool>>,
    pub client_count: Rc<Cell<usize>>,
    /// Set when a secret arrived; the event loop unparks credentialed
    /// requests.
    pub secret_arrived: Rc<Cell<bool>>,
}

pub(crate) struct Listener {
    socket: UnixListener,
    shared: Rc<ListenerShared>,
}

impl Listener {
    /// Binds the socket, replacing a stale file from a previous run.
    pub fn bind(path: &Path, shared: Rc<ListenerShared>) -> Result<Self> {
        let _ = std::fs::remove_file(path);
        let socket = UnixListener::bind(path)?;
        info!(path = %path.display(), "listening");
        Ok(Self { socket, shared })
    }

    /// Accept loop; runs until shutdown is signalled.
    pub async fn run(self) {
        loop {
            // The flag catches a shutdown signalled between loop
            // iterations, before the notified future re-registers.
            if self.shared.shutdown_requested.get() {
                break;
            }
            tokio::select! {
                accepted = self.socket.accept() => match accepted {
                    Ok((stream, _)) => {
                        let shared = Rc::clone(&self.shared);
                        shared.client_count.set(shared.client_count.get() + 1);
                        tokio::task::spawn_local(async move {
                            if let Err(err) = handle_connection(stream, Rc::clone(&shared)).await {
                                debug!(error = %err, "connection ended with error");
                            }
                            shared.client_count.set(shared.client_count.get() - 1);
                            // Wake the event loop so it can start the
                            // idle-shutdown clock.
                            shared.work_available.notify_one();
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                    }
                },
                _ = self.shared.shutdown.notified() => break,
            }
        }
    }
}

/// Builds the push frame for a notification.
fn notification_frame(notification: &Notification) -> Result<Frame> {
    match notification.kind {
        NotificationKind::RevisionUpdate => Ok(Frame::new(
            0,
            CommandId::RevisionUpdate,
            encode_payload(&RevisionPayload {
                revision: notification.revision.unwrap_or_default(),
            })?,
        )),
        NotificationKind::RevisionReplayed => Ok(Frame::new(
            0,
            CommandId::RevisionReplayed,
            encode_payload(&RevisionPayload {
                revision: notification.revision.unwrap_or_default(),
            })?,
        )),
        _ => Ok(Frame::new(
            0,
            CommandId::Notification,
            encode_payload(&NotificationPayload {
                notification: notification.clone(),
            })?,
        )),
    }
}

fn completion_frame(message_id: u32, success: bool, message: &str) -> Frame {
    let payload = encode_payload(&CommandCompletionPayload {
        completed_message_id: message_id,
        success,
        message: message.to_string(),
    })
    .expect("completion payload always encodes");
    Frame::new(message_id, CommandId::CommandCompletion, payload)
}

async fn handle_connection(stream: UnixStream, shared: Rc<ListenerShared>) -> Result<()> {
    let framed = Framed::new(stream, FrameCodec::new(shared.config.max_frame_size));
    let (mut sink, mut frames) = framed.split();

    // Bounded outbound channel: a single writer task preserves frame
    // order and applies backpressure per connection.
    let (tx, mut rx) = mpsc::channel::<Frame>(64);
    let writer = tokio::task::spawn_local(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(frame).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Handshake must come first.
    let client_name = match frames.next().await {
        Some(Ok(frame)) if frame.command() == CommandId::Handshake => {
            let handshake: HandshakePayload =
                decode_payload(&frame.payload).unwrap_or(HandshakePayload {
                    name: "unknown".into(),
                });
            let _ = tx.send(completion_frame(frame.message_id, true, "")).await;
            // Tell the new client where the store stands.
            let revision = shared.pipeline.borrow().store().max_revision();
            let _ = tx
                .send(Frame::new(
                    0,
                    CommandId::RevisionUpdate,
                    encode_payload(&RevisionPayload { revision })?,
                ))
                .await;
            handshake.name
        }
        Some(Ok(frame)) => {
            warn!(command = frame.command().name(), "expected handshake");
            let _ = tx
                .send(completion_frame(frame.message_id, false, "handshake required"))
                .await;
            drop(tx);
            let _ = writer.await;
            return Err(Error::invalid_payload("handshake required"));
        }
        Some(Err(err)) => return Err(err.into()),
        None => return Ok(()),
    };
    info!(client = %client_name, "client connected");

    // Forward every bus notification to this client.
    let mut subscription = shared.bus.subscribe();
    let forward_tx = tx.clone();
    let forwarder = tokio::task::spawn_local(async move {
        while let Some(notification) = subscription.next().await {
            match notification_frame(&notification) {
                Ok(frame) => {
                    if forward_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(err) => warn!(error = %err, "unencodable notification"),
            }
        }
    });

    while let Some(frame) = frames.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                warn!(client = %client_name, error = %err, "bad frame, closing");
                break;
            }
        };
        let (success, message) = dispatch(&frame, &shared);
        if tx
            .send(completion_frame(frame.message_id, success, &message))
            .await
            .is_err()
        {
            break;
        }
    }

    info!(client = %client_name, "client disconnected");
    forwarder.abort();
    drop(tx);
    let _ = writer.await;
    Ok(())
}

/// Routes one client command. Returns `(success, message)` for the
/// completion.
fn dispatch(frame: &Frame, shared: &ListenerShared) -> (bool, String) {
    match frame.command() {
        CommandId::Ping => (true, String::new()),
        CommandId::CreateEntity | CommandId::ModifyEntity | CommandId::DeleteEntity => {
            // Validate before enqueueing so garbage is rejected at the
            // door rather than wedging the queue.
            let decoded = match Command::decode(&frame.payload) {
                Ok(command) => command,
                Err(err) => return (false, err.to_string()),
            };
            let matches_id = matches!(
                (&decoded, frame.command()),
                (Command::Create { .. }, CommandId::CreateEntity)
                    | (Command::Modify { .. }, CommandId::ModifyEntity)
                    | (Command::Delete { .. }, CommandId::DeleteEntity)
            );
            if !matches_id {
                return (false, "payload does not match command id".into());
            }
            match shared.inbound.enqueue(frame.payload.clone()) {
                Ok(_) => {
                    shared.work_available.notify_one();
                    (true, String::new())
                }
                Err(err) => (false, err.to_string()),
            }
        }
        CommandId::Flush => match decode_payload::<FlushPayload>(&frame.payload) {
            Ok(flush) => {
                let result = match flush.kind {
                    FlushKind::UserQueue => shared
                        .inbound
                        .enqueue(
                            Command::FlushBarrier {
                                id: flush.id,
                                kind: FlushKind::UserQueue,
                            }
                            .encode()
                            .expect("barrier always encodes"),
                        )
                        .map(|_| ()),
                    kind => {
                        let _ = shared
                            .sync_requests
                            .send(SyncRequest::Flush { id: flush.id, kind });
                        Ok(())
                    }
                };
                match result {
                    Ok(()) => {
                        shared.work_available.notify_one();
                        (true, String::new())
                    }
                    Err(err) => (false, err.to_string()),
                }
            }
            Err(err) => (false, err.to_string()),
        },
        CommandId::Synchronize => match decode_payload::<SynchronizePayload>(&frame.payload) {
            Ok(payload) => {
                let scope = if payload.entity_types.is_empty() {
                    SyncScope::all()
                } else {
                    SyncScope::of_types(payload.entity_types)
                };
                let _ = shared
                    .sync_requests
                    .send(SyncRequest::Synchronize(scope));
                shared.work_available.notify_one();
                (true, String::new())
            }
            Err(err) => (false, err.to_string()),
        },
        CommandId::Inspection => match decode_payload::<InspectionPayload>(&frame.payload) {
            Ok(payload) => {
                let _ = shared
                    .sync_requests
                    .send(SyncRequest::Inspect(payload.inspection));
                shared.work_available.notify_one();
                (true, String::new())
            }
            Err(err) => (false, err.to_string()),
        },
        CommandId::Secret => match decode_payload::<SecretPayload>(&frame.payload) {
            Ok(payload) => {
                shared.secrets.insert(&shared.resource_id, payload.secret);
                shared.secret_arrived.set(true);
                shared.work_available.notify_one();
                (true, String::new())
            }
            Err(err) => (false, err.to_string()),
        },
        CommandId::Shutdown => {
            shared.shutdown_requested.set(true);
            shared.shutdown.notify_waiters();
            // Leave a permit in case the event loop was not parked yet.
            shared.work_available.notify_one();
            (true, String::new())
        }
        CommandId::Upgrade => {
            // The stores were version-checked at open; an open worker is
            // always current.
            (true, "storage schema is current".into())
        }
        CommandId::Handshake => (false, "duplicate handshake".into()),
        other => (false, format!("unsupported command {}", other.name())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Revision;

    #[test]
    fn test_notification_frame_mapping() {
        let frame =
            notification_frame(&Notification::revision_update(Revision(7))).unwrap();
        assert_eq!(frame.command(), CommandId::RevisionUpdate);
        let payload: RevisionPayload = decode_payload(&frame.payload).unwrap();
        assert_eq!(payload.revision, Revision(7));

        let frame = notification_frame(&Notification::flush_completion("f1")).unwrap();
        assert_eq!(frame.command(), CommandId::Notification);
        let payload: NotificationPayload = decode_payload(&frame.payload).unwrap();
        assert_eq!(payload.notification.id, "f1");
    }

    #[test]
    fn test_completion_frame_shape() {
        let frame = completion_frame(9, false, "nope");
        assert_eq!(frame.message_id, 9);
        assert_eq!(frame.command(), CommandId::CommandCompletion);
        let payload: CommandCompletionPayload = decode_payload(&frame.payload).unwrap();
        assert_eq!(payload.completed_message_id, 9);
        assert!(!payload.success);
        assert_eq!(payload.message, "nope");
    }
}
