//! Integration tests for the revisioned entity store.
//!
//! Covers the create/modify/delete round trip, revision history,
//! cleanup semantics, index consistency, and persistence across
//! reopens, plus property-based checks of the revision invariants.

use estuary::entity::{Entity, EntityStore, TypeRegistry};
use estuary::{EntityId, EntityType, PropertyName, PropertyMap, Revision, Value};
use proptest::prelude::*;
use tempfile::tempdir;

fn open_store(dir: &std::path::Path) -> EntityStore {
    EntityStore::open(dir, TypeRegistry::standard()).unwrap()
}

fn event(summary: &str) -> Entity {
    let mut entity = Entity::new("event");
    entity.set("summary", Value::String(summary.into()));
    entity
}

// ============================================================================
// Round trip and revision history
// ============================================================================

#[test]
fn test_create_modify_delete_round_trip() {
    let dir = tempdir().unwrap();
    let mut store = open_store(dir.path());
    let event_type = EntityType::new("event");

    // Create.
    let entity = event("A");
    let id = entity.id();
    assert_eq!(store.add(entity).unwrap(), Revision(1));
    assert_eq!(store.max_revision(), Revision(1));
    let read = store.read_latest(&event_type, &id).unwrap().unwrap();
    assert_eq!(read.get("summary").and_then(Value::as_str), Some("A"));

    // Modify.
    let mut delta = PropertyMap::new();
    delta.set("summary", Value::String("B".into()));
    assert_eq!(
        store.modify(&event_type, &id, delta, &[], false).unwrap(),
        Revision(2)
    );
    assert_eq!(store.max_revision(), Revision(2));
    assert_eq!(
        store
            .read_latest(&event_type, &id)
            .unwrap()
            .unwrap()
            .get("summary")
            .and_then(Value::as_str),
        Some("B")
    );
    assert_eq!(
        store
            .read_revision(&event_type, &id, Revision(1))
            .unwrap()
            .get("summary")
            .and_then(Value::as_str),
        Some("A")
    );

    // Delete.
    assert_eq!(store.remove(&event_type, &id, false).unwrap(), Revision(3));
    assert_eq!(store.max_revision(), Revision(3));
    assert!(store.read_latest(&event_type, &id).unwrap().is_none());
    assert!(store.contains(&event_type, &id).unwrap());

    // Cleanup past the tombstone removes the entity entirely.
    assert!(store.cleanup_revisions(Revision(4)).unwrap());
    assert!(!store.contains(&event_type, &id).unwrap());
}

#[test]
fn test_full_property_set_round_trips() {
    let dir = tempdir().unwrap();
    let mut store = open_store(dir.path());
    let event_type = EntityType::new("event");

    let mut entity = Entity::new("event");
    entity.set("summary", Value::String("standup".into()));
    entity.set("recurring", Value::Bool(true));
    entity.set(
        "dtStart",
        Value::Timestamp(estuary::Timestamp::from_millis(1_700_000_000_000)),
    );
    entity.set("description", Value::Null);
    let id = entity.id();
    let expected = entity.properties().clone();

    store.add(entity).unwrap();
    let read = store.read_latest(&event_type, &id).unwrap().unwrap();
    assert_eq!(read.properties(), &expected);
}

// ============================================================================
// Record counts (universal invariant 1)
// ============================================================================

/// Counts physical records for an entity by probing every revision.
fn record_count(store: &EntityStore, entity_type: &EntityType, id: &EntityId, max: u64) -> usize {
    (1..=max)
        .filter(|rev| {
            store
                .read_revision(entity_type, id, Revision(*rev))
                .is_ok()
        })
        .count()
}

#[test]
fn test_n_writes_produce_n_records_until_cleanup() {
    let dir = tempdir().unwrap();
    let mut store = open_store(dir.path());
    let event_type = EntityType::new("event");

    let entity = event("v0");
    let id = entity.id();
    store.add(entity).unwrap();
    for i in 1..=4 {
        let mut delta = PropertyMap::new();
        delta.set("summary", Value::String(format!("v{}", i)));
        store.modify(&event_type, &id, delta, &[], false).unwrap();
    }

    // 5 mutations → 5 records.
    assert_eq!(record_count(&store, &event_type, &id, 10), 5);

    // Cleanup below the latest: exactly one survivor.
    store.cleanup_revisions(Revision(5)).unwrap();
    assert_eq!(record_count(&store, &event_type, &id, 10), 1);
    let latest = store.read_latest(&event_type, &id).unwrap().unwrap();
    assert_eq!(latest.revision(), Revision(5));
    assert_eq!(latest.get("summary").and_then(Value::as_str), Some("v4"));
}

// ============================================================================
// Revision log (universal invariant 2, 5)
// ============================================================================

#[test]
fn test_revision_log_has_one_entry_per_revision() {
    let dir = tempdir().unwrap();
    let mut store = open_store(dir.path());
    let event_type = EntityType::new("event");

    let a = event("a");
    let a_id = a.id();
    store.add(a).unwrap();
    let b = event("b");
    store.add(b).unwrap();
    store.remove(&event_type, &a_id, false).unwrap();

    let mut seen = Vec::new();
    store
        .scan_revisions(Revision(1), store.max_revision(), &mut |rev, entry| {
            seen.push((rev.get(), entry.id));
            true
        })
        .unwrap();

    // Dense, ordered, one entry per revision.
    assert_eq!(seen.len(), 3);
    for (i, (rev, _)) in seen.iter().enumerate() {
        assert_eq!(*rev, i as u64 + 1);
    }
    // Each entry resolves to an entity whose highest record at that
    // point carries that revision.
    assert_eq!(seen[0].1, a_id);
    assert_eq!(seen[2].1, a_id);
}

// ============================================================================
// Persistence
// ============================================================================

#[test]
fn test_store_state_survives_reopen() {
    let dir = tempdir().unwrap();
    let event_type = EntityType::new("event");
    let id;
    {
        let mut store = open_store(dir.path());
        let entity = event("persisted");
        id = entity.id();
        store.add(entity).unwrap();
        let mut delta = PropertyMap::new();
        delta.set("summary", Value::String("persisted-2".into()));
        store.modify(&event_type, &id, delta, &[], false).unwrap();
    }

    let store = open_store(dir.path());
    assert_eq!(store.max_revision(), Revision(2));
    let read = store.read_latest(&event_type, &id).unwrap().unwrap();
    assert_eq!(
        read.get("summary").and_then(Value::as_str),
        Some("persisted-2")
    );
    // History is intact too.
    assert!(store.read_revision(&event_type, &id, Revision(1)).is_ok());
}

// ============================================================================
// Property-based invariants
// ============================================================================

/// One random mutation step against a single entity.
#[derive(Clone, Debug)]
enum Step {
    Modify(String),
    DeleteAndRecreate,
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => "[a-z]{1,8}".prop_map(Step::Modify),
        1 => Just(Step::DeleteAndRecreate),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_revisions_are_dense_and_monotone(steps in proptest::collection::vec(step_strategy(), 1..20)) {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        let event_type = EntityType::new("event");

        let entity = event("initial");
        let mut id = entity.id();
        store.add(entity).unwrap();
        let mut expected = 1u64;

        for step in steps {
            match step {
                Step::Modify(summary) => {
                    let mut delta = PropertyMap::new();
                    delta.set("summary", Value::String(summary));
                    store.modify(&event_type, &id, delta, &[], false).unwrap();
                    expected += 1;
                }
                Step::DeleteAndRecreate => {
                    store.remove(&event_type, &id, false).unwrap();
                    let fresh = event("recreated");
                    id = fresh.id();
                    store.add(fresh).unwrap();
                    expected += 2;
                }
            }
            prop_assert_eq!(store.max_revision(), Revision(expected));
        }

        // The revision log is dense over the whole run.
        let mut count = 0u64;
        store.scan_revisions(Revision(1), store.max_revision(), &mut |rev, _| {
            count += 1;
            assert_eq!(rev.get(), count);
            true
        }).unwrap();
        prop_assert_eq!(count, expected);
    }

    #[test]
    fn prop_index_matches_latest_state(threads in proptest::collection::vec("[a-c]", 1..12)) {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        let mail_type = EntityType::new("mail");
        let thread_property = PropertyName::new("threadId");

        // One mail, re-pointed at random threads.
        let mut mail = Entity::new("mail");
        mail.set("threadId", Value::String(threads[0].clone()));
        let id = mail.id();
        store.add(mail).unwrap();

        for thread in &threads[1..] {
            let mut delta = PropertyMap::new();
            delta.set("threadId", Value::String(thread.clone()));
            store.modify(&mail_type, &id, delta, &[], false).unwrap();
        }

        // Exactly the final thread's index entry references the mail.
        let last = threads.last().unwrap();
        for candidate in ["a", "b", "c"] {
            let hits = store
                .index_lookup(&mail_type, &thread_property, &Value::String(candidate.into()))
                .unwrap();
            if candidate == last.as_str() {
                prop_assert_eq!(hits, vec![id]);
            } else {
                prop_assert!(hits.is_empty());
            }
        }
    }
}
