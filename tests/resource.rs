//! Worker-level tests: flush barriers through the event loop, the
//! socket protocol round trip, notification delivery to clients, and
//! idle shutdown.

use std::time::Duration;

use async_trait::async_trait;
use estuary::entity::Entity;
use estuary::notification::NotificationKind;
use estuary::pipeline::Command;
use estuary::protocol::{
    decode_payload, encode_payload, CommandCompletionPayload, CommandId, FlushPayload, Frame,
    FrameCodec, HandshakePayload, NotificationPayload, RevisionPayload, SecretPayload,
};
use estuary::queue::FlushKind;
use estuary::sync::{SyncScope, SyncSession};
use estuary::{
    Config, EntityType, PropertyMap, Query, RemoteId, Resource, ResourceContext, Revision,
    SourceAdaptor, Value,
};
use futures::{SinkExt, StreamExt};
use tempfile::tempdir;
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

struct NullSource;

#[async_trait(?Send)]
impl SourceAdaptor for NullSource {
    async fn connect(&mut self, _secret: &str) -> estuary::Result<()> {
        Ok(())
    }
    async fn synchronize(
        &mut self,
        _scope: &SyncScope,
        _session: &mut SyncSession<'_>,
    ) -> estuary::Result<()> {
        Ok(())
    }
    async fn replay_create(
        &mut self,
        _entity_type: &EntityType,
        _entity: &Entity,
    ) -> estuary::Result<RemoteId> {
        Ok(RemoteId::new("r"))
    }
    async fn replay_modify(
        &mut self,
        _entity_type: &EntityType,
        _remote_id: &RemoteId,
        _entity: &Entity,
    ) -> estuary::Result<Option<RemoteId>> {
        Ok(None)
    }
    async fn replay_delete(
        &mut self,
        _entity_type: &EntityType,
        _remote_id: &RemoteId,
    ) -> estuary::Result<()> {
        Ok(())
    }
}

fn make_resource(dir: &std::path::Path, config: Config) -> Resource {
    let context = ResourceContext::new("account1", "dummy", dir, config).unwrap();
    Resource::new(context, Box::new(NullSource)).unwrap()
}

fn create_event_command(summary: &str) -> Command {
    let mut properties = PropertyMap::new();
    properties.set("summary", Value::String(summary.into()));
    Command::Create {
        entity_type: EntityType::new("event"),
        id: None,
        properties,
        replay_to_source: false,
    }
}

// ============================================================================
// Scenario S5: flush barrier ordering
// ============================================================================

#[tokio::test]
async fn test_flush_completion_arrives_after_revision_update() {
    let dir = tempdir().unwrap();
    let mut resource = make_resource(dir.path(), Config::default());
    let subscription = resource.subscribe();

    resource
        .enqueue_command(&create_event_command("flush me"))
        .unwrap();
    resource
        .enqueue_command(&Command::FlushBarrier {
            id: "X".into(),
            kind: FlushKind::UserQueue,
        })
        .unwrap();

    resource.run_until_idle().await.unwrap();

    let notifications = subscription.drain();
    let revision_at = notifications
        .iter()
        .position(|n| n.kind == NotificationKind::RevisionUpdate && n.revision == Some(Revision(1)))
        .expect("revision update for the create");
    let flush_at = notifications
        .iter()
        .position(|n| n.kind == NotificationKind::FlushCompletion && n.id == "X")
        .expect("flush completion with id X");
    assert!(
        revision_at < flush_at,
        "flush completion must come after the create's revision"
    );
}

// ============================================================================
// Socket protocol round trip
// ============================================================================

async fn next_frame(
    framed: &mut Framed<UnixStream, FrameCodec>,
) -> Frame {
    tokio::time::timeout(Duration::from_secs(5), framed.next())
        .await
        .expect("timed out waiting for frame")
        .expect("connection closed")
        .expect("frame decode failed")
}

/// Waits for a completion of `message_id`, skipping pushed frames.
async fn await_completion(
    framed: &mut Framed<UnixStream, FrameCodec>,
    message_id: u32,
) -> CommandCompletionPayload {
    loop {
        let frame = next_frame(framed).await;
        if frame.command() == CommandId::CommandCompletion {
            let payload: CommandCompletionPayload = decode_payload(&frame.payload).unwrap();
            if payload.completed_message_id == message_id {
                return payload;
            }
        }
    }
}

#[tokio::test]
async fn test_socket_handshake_create_and_shutdown() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let dir = tempdir().unwrap();
            let resource = make_resource(dir.path(), Config::default());
            let socket_path = resource.context().socket_path();
            let worker = tokio::task::spawn_local(resource.run());

            // Wait for the socket to appear.
            for _ in 0..200 {
                if socket_path.exists() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            let stream = UnixStream::connect(&socket_path).await.unwrap();
            let mut framed = Framed::new(stream, FrameCodec::new(16 * 1024 * 1024));

            // Handshake → completion + current revision.
            framed
                .send(Frame::new(
                    1,
                    CommandId::Handshake,
                    encode_payload(&HandshakePayload {
                        name: "test-client".into(),
                    })
                    .unwrap(),
                ))
                .await
                .unwrap();
            let completion = await_completion(&mut framed, 1).await;
            assert!(completion.success);
            let revision_frame = next_frame(&mut framed).await;
            assert_eq!(revision_frame.command(), CommandId::RevisionUpdate);
            let revision: RevisionPayload = decode_payload(&revision_frame.payload).unwrap();
            assert_eq!(revision.revision, Revision::ZERO);

            // Ping.
            framed
                .send(Frame::new(2, CommandId::Ping, Vec::new()))
                .await
                .unwrap();
            assert!(await_completion(&mut framed, 2).await.success);

            // Create an entity; the revision update is pushed once the
            // pipeline commits.
            framed
                .send(Frame::new(
                    3,
                    CommandId::CreateEntity,
                    create_event_command("over the wire").encode().unwrap(),
                ))
                .await
                .unwrap();
            assert!(await_completion(&mut framed, 3).await.success);
            loop {
                let frame = next_frame(&mut framed).await;
                if frame.command() == CommandId::RevisionUpdate {
                    let payload: RevisionPayload = decode_payload(&frame.payload).unwrap();
                    if payload.revision == Revision(1) {
                        break;
                    }
                }
            }

            // Flush barrier: completion notification follows the data.
            framed
                .send(Frame::new(
                    4,
                    CommandId::Flush,
                    encode_payload(&FlushPayload {
                        id: "wire-flush".into(),
                        kind: FlushKind::UserQueue,
                    })
                    .unwrap(),
                ))
                .await
                .unwrap();
            assert!(await_completion(&mut framed, 4).await.success);
            loop {
                let frame = next_frame(&mut framed).await;
                if frame.command() == CommandId::Notification {
                    let payload: NotificationPayload = decode_payload(&frame.payload).unwrap();
                    if payload.notification.kind == NotificationKind::FlushCompletion
                        && payload.notification.id == "wire-flush"
                    {
                        break;
                    }
                }
            }

            // A mismatched payload is rejected with a failed completion.
            framed
                .send(Frame::new(
                    5,
                    CommandId::DeleteEntity,
                    create_event_command("not a delete").encode().unwrap(),
                ))
                .await
                .unwrap();
            let completion = await_completion(&mut framed, 5).await;
            assert!(!completion.success);

            // Secrets are accepted.
            framed
                .send(Frame::new(
                    6,
                    CommandId::Secret,
                    encode_payload(&SecretPayload {
                        secret: "hunter2".into(),
                    })
                    .unwrap(),
                ))
                .await
                .unwrap();
            assert!(await_completion(&mut framed, 6).await.success);

            // Shutdown stops the worker.
            framed
                .send(Frame::new(7, CommandId::Shutdown, Vec::new()))
                .await
                .unwrap();
            assert!(await_completion(&mut framed, 7).await.success);
            drop(framed);

            tokio::time::timeout(Duration::from_secs(5), worker)
                .await
                .expect("worker did not stop")
                .unwrap()
                .unwrap();
        })
        .await;
}

#[tokio::test]
async fn test_connection_without_handshake_is_rejected() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let dir = tempdir().unwrap();
            let resource = make_resource(dir.path(), Config::default());
            let socket_path = resource.context().socket_path();
            let worker = tokio::task::spawn_local(resource.run());

            for _ in 0..200 {
                if socket_path.exists() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            let stream = UnixStream::connect(&socket_path).await.unwrap();
            let mut framed = Framed::new(stream, FrameCodec::new(1024));

            framed
                .send(Frame::new(1, CommandId::Ping, Vec::new()))
                .await
                .unwrap();
            let completion = await_completion(&mut framed, 1).await;
            assert!(!completion.success);
            assert!(completion.message.contains("handshake"));

            worker.abort();
            let _ = worker.await;
        })
        .await;
}

// ============================================================================
// Idle shutdown and state persistence
// ============================================================================

#[tokio::test]
async fn test_worker_shuts_down_when_idle() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let dir = tempdir().unwrap();
            let config = Config {
                idle_timeout: Some(Duration::from_millis(50)),
                ..Default::default()
            };
            let resource = make_resource(dir.path(), config);

            // No clients ever connect; the worker exits on its own.
            tokio::time::timeout(Duration::from_secs(5), resource.run())
                .await
                .expect("idle shutdown did not happen")
                .unwrap();
        })
        .await;
}

#[tokio::test]
async fn test_live_query_and_pinned_cleanup() {
    let dir = tempdir().unwrap();
    let mut resource = make_resource(dir.path(), Config::default());

    resource
        .enqueue_command(&create_event_command("first"))
        .unwrap();
    resource.run_until_idle().await.unwrap();

    let (mut live, initial) = resource.live_query(Query::new("event")).unwrap();
    assert_eq!(initial.len(), 1);

    resource
        .enqueue_command(&create_event_command("second"))
        .unwrap();
    resource.run_until_idle().await.unwrap();

    let events = resource.advance_live_query(&mut live).unwrap();
    assert_eq!(events.len(), 1);

    // The live query pins revision 2; an aggressive cleanup threshold is
    // clamped to it.
    resource
        .cleanup_revisions(Revision(100), Some(live.pinned_revision()))
        .unwrap();
    // Both entities still resolve.
    assert_eq!(resource.execute_query(&Query::new("event")).unwrap().len(), 2);
}

#[tokio::test]
async fn test_state_survives_worker_restart() {
    let dir = tempdir().unwrap();
    {
        let mut resource = make_resource(dir.path(), Config::default());
        resource
            .enqueue_command(&create_event_command("durable"))
            .unwrap();
        resource.run_until_idle().await.unwrap();
        assert_eq!(resource.max_revision(), Revision(1));
    }

    // Upgrading current stores is a no-op.
    let context = ResourceContext::new("account1", "dummy", dir.path(), Config::default()).unwrap();
    assert!(!Resource::upgrade_stores(&context).unwrap());

    let resource = make_resource(dir.path(), Config::default());
    assert_eq!(resource.max_revision(), Revision(1));
    let events = resource.execute_query(&Query::new("event")).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(
        events[0].get("summary").and_then(Value::as_str),
        Some("durable")
    );
}
