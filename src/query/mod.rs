//! The declarative query engine.
//!
//! A [`Query`] is a value describing what to return: entity type,
//! per-property filters, an optional explicit id set, sort, limit,
//! reduce (group-by with representative selection and aggregates), bloom
//! (seed expansion by shared property value), projection, and subquery
//! filters resolved against other types.
//!
//! Execution runs against a read snapshot ([`EntityReader`]) in fixed
//! stages: seed → stream → filter → sort → reduce → bloom → project.
//! Live queries additionally maintain their result set incrementally;
//! see [`live`].

pub mod filter;
pub mod live;

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use tracing::trace;

pub use filter::Comparator;
pub use live::{LiveQuery, ResultEvent};

use crate::entity::{Entity, EntityReader};
use crate::error::Result;
use crate::types::{EntityId, EntityType, PropertyName};
use crate::value::{Value, ValueKind};

/// Sort direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    /// Smallest value first.
    Ascending,
    /// Largest value first.
    Descending,
}

/// Sort specification.
///
/// With no explicit direction, timestamp-typed properties sort
/// descending (newest first) and everything else ascending.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SortSpec {
    /// Property to sort by.
    pub property: PropertyName,
    /// Explicit direction, if any.
    pub direction: Option<SortDirection>,
}

/// Representative selection within a reduce group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Selector {
    /// The member with the largest value of the property.
    Max(PropertyName),
    /// The member with the smallest value of the property.
    Min(PropertyName),
}

/// Aggregate computed across the members of a reduce group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Aggregate {
    /// Number of group members, stored as `count`.
    Count,
    /// All member values of a property, stored as `collected.<name>`.
    Collect {
        /// Property collected from each member.
        property: PropertyName,
        /// Name under `collected.` on the synthesized entity.
        name: String,
    },
}

/// Group-by with representative selection and aggregates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reduce {
    /// Property whose value partitions entities into groups.
    pub property: PropertyName,
    /// How the group representative is chosen.
    pub selector: Selector,
    /// Aggregates computed per group.
    pub aggregates: Vec<Aggregate>,
}

/// Behavioral query flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryFlags {
    /// Keep the query alive and stream updates.
    pub live: bool,
    /// Fold per-entity sync status transitions into the update stream.
    pub update_status: bool,
    /// Include current sync status in the initial result.
    pub include_status: bool,
}

/// A subquery filter: the property must reference an entity matched by
/// the inner query (over a different type).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubqueryFilter {
    /// Reference property on the outer type.
    pub property: PropertyName,
    /// Query producing the accepted id set.
    pub query: Box<Query>,
}

/// A declarative query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Entity type to return.
    pub entity_type: EntityType,
    /// Property filters, all of which must match.
    pub filters: BTreeMap<PropertyName, Comparator>,
    /// Optional explicit id set.
    pub ids: Option<Vec<EntityId>>,
    /// Sort specification.
    pub sort: Option<SortSpec>,
    /// Maximum number of results.
    pub limit: Option<usize>,
    /// Group-by reduction.
    pub reduce: Option<Reduce>,
    /// Seed-expansion property (e.g. `threadId` for thread expansion).
    pub bloom: Option<PropertyName>,
    /// Properties the consumer will read; empty means all.
    pub requested: Vec<PropertyName>,
    /// Behavioral flags.
    pub flags: QueryFlags,
    /// Subquery filters.
    pub subqueries: Vec<SubqueryFilter>,
}

impl Query {
    /// Creates a query returning all entities of a type.
    pub fn new(entity_type: impl Into<EntityType>) -> Self {
        Self {
            entity_type: entity_type.into(),
            filters: BTreeMap::new(),
            ids: None,
            sort: None,
            limit: None,
            reduce: None,
            bloom: None,
            requested: Vec::new(),
            flags: QueryFlags::default(),
            subqueries: Vec::new(),
        }
    }

    /// Adds a property filter.
    pub fn filter(mut self, property: impl Into<PropertyName>, comparator: Comparator) -> Self {
        self.filters.insert(property.into(), comparator);
        self
    }

    /// Restricts to an explicit id set.
    pub fn with_ids(mut self, ids: Vec<EntityId>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Sorts by a property with the default direction for its kind.
    pub fn sort_by(mut self, property: impl Into<PropertyName>) -> Self {
        self.sort = Some(SortSpec {
            property: property.into(),
            direction: None,
        });
        self
    }

    /// Sorts by a property with an explicit direction.
    pub fn sort_direction(
        mut self,
        property: impl Into<PropertyName>,
        direction: SortDirection,
    ) -> Self {
        self.sort = Some(SortSpec {
            property: property.into(),
            direction: Some(direction),
        });
        self
    }

    /// Caps the number of results.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Groups by a property, keeping one representative per group.
    pub fn reduce(mut self, reduce: Reduce) -> Self {
        self.reduce = Some(reduce);
        self
    }

    /// Expands the result set to all entities sharing the property value
    /// with a seed.
    pub fn bloom(mut self, property: impl Into<PropertyName>) -> Self {
        self.bloom = Some(property.into());
        self
    }

    /// Restricts returned properties.
    pub fn request(mut self, properties: impl IntoIterator<Item = PropertyName>) -> Self {
        self.requested = properties.into_iter().collect();
        self
    }

    /// Marks the query live.
    pub fn live(mut self) -> Self {
        self.flags.live = true;
        self
    }

    /// Adds sync-status transitions to the update stream.
    pub fn update_status(mut self) -> Self {
        self.flags.update_status = true;
        self.flags.live = true;
        self
    }

    /// Adds a subquery filter.
    pub fn subquery(mut self, property: impl Into<PropertyName>, query: Query) -> Self {
        self.subqueries.push(SubqueryFilter {
            property: property.into(),
            query: Box::new(query),
        });
        self
    }
}

/// Ready-made queries for common client needs.
pub mod standard {
    use super::*;

    /// All mails in a folder, newest first.
    pub fn mails_in_folder(folder: EntityId) -> Query {
        Query::new("mail")
            .filter("folder", Comparator::Equals(Value::IdRef(folder)))
            .sort_by("date")
    }

    /// One row per thread in a folder: the newest mail represents the
    /// thread, with member count and collected senders.
    pub fn threads_in_folder(folder: EntityId) -> Query {
        Query::new("mail")
            .filter("folder", Comparator::Equals(Value::IdRef(folder)))
            .reduce(Reduce {
                property: PropertyName::new("threadId"),
                selector: Selector::Max(PropertyName::new("date")),
                aggregates: vec![
                    Aggregate::Count,
                    Aggregate::Collect {
                        property: PropertyName::new("sender"),
                        name: "senders".into(),
                    },
                ],
            })
            .sort_by("date")
    }

    /// The full thread a mail belongs to, oldest first.
    pub fn full_thread(mail: EntityId) -> Query {
        Query::new("mail")
            .with_ids(vec![mail])
            .bloom("threadId")
            .sort_direction("date", SortDirection::Ascending)
    }

    /// All completed todos.
    pub fn completed_todos() -> Query {
        Query::new("todo").filter(
            "status",
            Comparator::Equals(Value::String("COMPLETED".into())),
        )
    }

    /// Contacts whose display name matches the words.
    pub fn contacts_matching(text: &str) -> Query {
        Query::new("contact").filter("fn", Comparator::Fulltext(text.into()))
    }
}

// ============================================================================
// Execution
// ============================================================================

/// Sort key implementing the query ordering: missing values last, the
/// configured direction for present values, entity id ascending as the
/// tie-break.
#[derive(Clone, Debug)]
struct SortKey {
    value: Option<Value>,
    descending: bool,
    id: EntityId,
}

impl SortKey {
    fn of(entity: &Entity, sort: &SortSpec, descending: bool) -> Self {
        Self {
            value: entity.get(sort.property.as_str()).cloned(),
            descending,
            id: entity.id(),
        }
    }

    fn cmp(&self, other: &Self) -> Ordering {
        let by_value = match (&self.value, &other.value) {
            (Some(a), Some(b)) => {
                let ord = a.total_cmp(b);
                if self.descending {
                    ord.reverse()
                } else {
                    ord
                }
            }
            // Missing values sort last regardless of direction.
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        by_value.then_with(|| self.id.cmp(&other.id))
    }
}

struct HeapEntry {
    key: SortKey,
    entity: Entity,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key.cmp(&other.key) == Ordering::Equal
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

/// Resolves the effective sort direction for a query.
fn effective_direction(reader: &EntityReader, query: &Query, sort: &SortSpec) -> bool {
    match sort.direction {
        Some(SortDirection::Descending) => true,
        Some(SortDirection::Ascending) => false,
        None => reader
            .registry()
            .capabilities(&query.entity_type)
            .and_then(|caps| caps.schema.kinds_of(&sort.property))
            .is_some_and(|kinds| kinds.contains(&ValueKind::Timestamp)),
    }
}

/// Executes a query against a snapshot, producing the full result set.
pub fn execute(reader: &EntityReader, query: &Query) -> Result<Vec<Entity>> {
    // Subquery filters resolve first into id-set comparators.
    let mut effective = query.filters.clone();
    for subquery in &query.subqueries {
        let inner = execute(reader, &subquery.query)?;
        let ids: Vec<Value> = inner.iter().map(|e| Value::IdRef(e.id())).collect();
        effective.insert(subquery.property.clone(), Comparator::In(ids));
    }

    let candidates = seed_candidates(reader, query, &effective)?;
    trace!(
        entity_type = %query.entity_type,
        candidates = candidates.len(),
        "query seeded"
    );

    // Filter stage: read each candidate's latest record and apply the
    // full filter map.
    let mut matched: Vec<Entity> = Vec::new();
    let mut seen: HashSet<EntityId> = HashSet::new();
    for id in candidates {
        if !seen.insert(id) {
            continue;
        }
        let Some(entity) = reader.read_latest(&query.entity_type, &id)? else {
            continue;
        };
        if matches_filters(&entity, &effective) {
            matched.push(entity);
        }
    }

    let mut results = sort_entities(reader, query, matched);

    if let Some(reduce) = &query.reduce {
        results = reduce_entities(reader, query, reduce, results)?;
    }

    if let Some(bloom) = &query.bloom {
        results = bloom_entities(reader, query, bloom, results)?;
    }

    if let Some(limit) = query.limit {
        results.truncate(limit);
    }

    if !query.requested.is_empty() {
        results = results
            .iter()
            .map(|entity| project(entity, &query.requested))
            .collect();
    }
    Ok(results)
}

/// Picks the seed candidate set: explicit ids, the most selective
/// available index, or a full type scan.
fn seed_candidates(
    reader: &EntityReader,
    query: &Query,
    filters: &BTreeMap<PropertyName, Comparator>,
) -> Result<Vec<EntityId>> {
    if let Some(ids) = &query.ids {
        return Ok(ids.clone());
    }

    let indexed = reader.registry().index_properties(&query.entity_type);
    for (property, comparator) in filters {
        if !comparator.index_assisted() || !indexed.contains(property) {
            continue;
        }
        let mut ids = Vec::new();
        match comparator {
            Comparator::Equals(value) => {
                ids.extend(reader.index_lookup(&query.entity_type, property, value)?);
            }
            Comparator::In(values) => {
                for value in values {
                    ids.extend(reader.index_lookup(&query.entity_type, property, value)?);
                }
            }
            Comparator::Range { from, to } => {
                reader.index_scan(
                    &query.entity_type,
                    property,
                    &from.index_bytes(),
                    &to.index_bytes(),
                    &mut |_value, id| {
                        ids.push(id);
                        true
                    },
                )?;
            }
            _ => unreachable!("index_assisted() gated above"),
        }
        return Ok(ids);
    }

    // Full type scan.
    let mut ids = Vec::new();
    reader.scan_type_latest(&query.entity_type, false, &mut |entity| {
        ids.push(entity.id());
        true
    })?;
    Ok(ids)
}

/// Applies the full filter map to one entity.
pub(crate) fn matches_filters(
    entity: &Entity,
    filters: &BTreeMap<PropertyName, Comparator>,
) -> bool {
    filters
        .iter()
        .all(|(property, comparator)| comparator.matches(entity.get(property.as_str())))
}

/// Sort stage: bounded heap under a limit, plain sort otherwise.
fn sort_entities(reader: &EntityReader, query: &Query, entities: Vec<Entity>) -> Vec<Entity> {
    let Some(sort) = &query.sort else {
        return entities;
    };
    let descending = effective_direction(reader, query, sort);

    // Reduce and bloom need the whole ordered set; only a plain query
    // can use the bounded heap.
    let bounded = query.limit.filter(|_| query.reduce.is_none() && query.bloom.is_none());
    if let Some(limit) = bounded {
        let mut heap = std::collections::BinaryHeap::with_capacity(limit + 1);
        for entity in entities {
            let key = SortKey::of(&entity, sort, descending);
            heap.push(HeapEntry { key, entity });
            if heap.len() > limit {
                heap.pop();
            }
        }
        return heap
            .into_sorted_vec()
            .into_iter()
            .map(|entry| entry.entity)
            .collect();
    }

    let mut entities = entities;
    entities.sort_by(|a, b| {
        SortKey::of(a, sort, descending).cmp(&SortKey::of(b, sort, descending))
    });
    entities
}

/// Reduce stage: group, select representatives, compute aggregates.
fn reduce_entities(
    reader: &EntityReader,
    query: &Query,
    reduce: &Reduce,
    entities: Vec<Entity>,
) -> Result<Vec<Entity>> {
    // BTreeMap keyed by the group value's index bytes keeps group output
    // order deterministic.
    let mut groups: BTreeMap<Vec<u8>, Vec<Entity>> = BTreeMap::new();
    let mut ungrouped: Vec<Entity> = Vec::new();
    for entity in entities {
        match entity.get(reduce.property.as_str()) {
            Some(value) if !value.is_null() => {
                groups.entry(value.index_bytes()).or_default().push(entity);
            }
            // Entities without the reduce property form singleton rows.
            _ => ungrouped.push(entity),
        }
    }

    let mut rows = Vec::new();
    for members in groups.into_values() {
        rows.push(synthesize_group(reduce, &members));
    }
    for entity in ungrouped {
        rows.push(synthesize_group(reduce, &[entity]));
    }

    // Re-sort rows: grouping destroyed the sort order of stage 4.
    Ok(sort_entities(reader, query, rows))
}

/// Builds the synthesized row for one reduce group.
pub(crate) fn synthesize_group(reduce: &Reduce, members: &[Entity]) -> Entity {
    let representative = select_representative(&reduce.selector, members);
    let mut row = representative.clone();
    for aggregate in &reduce.aggregates {
        match aggregate {
            Aggregate::Count => {
                row.set("count", Value::I64(members.len() as i64));
            }
            Aggregate::Collect { property, name } => {
                let collected: Vec<Value> = members
                    .iter()
                    .filter_map(|member| member.get(property.as_str()).cloned())
                    .collect();
                row.set(format!("collected.{}", name).as_str(), Value::List(collected));
            }
        }
    }
    row.metadata.changed_properties.clear();
    row
}

/// Picks the group representative; ties break by entity id ascending.
pub(crate) fn select_representative<'a>(selector: &Selector, members: &'a [Entity]) -> &'a Entity {
    let (property, want_max) = match selector {
        Selector::Max(property) => (property, true),
        Selector::Min(property) => (property, false),
    };
    members
        .iter()
        .reduce(|best, candidate| {
            let ord = match (
                best.get(property.as_str()),
                candidate.get(property.as_str()),
            ) {
                (Some(a), Some(b)) => a.total_cmp(b),
                (Some(_), None) => Ordering::Greater,
                (None, Some(_)) => Ordering::Less,
                (None, None) => Ordering::Equal,
            };
            let candidate_wins = match ord {
                Ordering::Equal => candidate.id() < best.id(),
                Ordering::Less => want_max,
                Ordering::Greater => !want_max,
            };
            if candidate_wins {
                candidate
            } else {
                best
            }
        })
        .expect("groups are never empty")
}

/// Bloom stage: expand each seed by shared property value, union, dedupe.
fn bloom_entities(
    reader: &EntityReader,
    query: &Query,
    bloom: &PropertyName,
    seeds: Vec<Entity>,
) -> Result<Vec<Entity>> {
    let mut seen: BTreeSet<EntityId> = seeds.iter().map(Entity::id).collect();
    let mut expanded = seeds;

    let seed_values: Vec<Value> = expanded
        .iter()
        .filter_map(|seed| seed.get(bloom.as_str()).cloned())
        .collect();
    for value in seed_values {
        let expansion = Query::new(query.entity_type.clone())
            .filter(bloom.clone(), Comparator::Equals(value));
        for entity in execute(reader, &expansion)? {
            if seen.insert(entity.id()) {
                expanded.push(entity);
            }
        }
    }

    Ok(sort_entities(reader, query, expanded))
}

/// Projection stage: keep only the requested properties.
pub(crate) fn project(entity: &Entity, requested: &[PropertyName]) -> Entity {
    let mut projected = Entity::with_id(entity.entity_type().clone(), entity.id());
    projected.metadata = entity.metadata.clone();
    for name in requested {
        if let Some(value) = entity.get(name.as_str()) {
            projected.set(name.clone(), value.clone());
        }
    }
    projected.metadata.changed_properties = entity.metadata.changed_properties.clone();
    projected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityStore, TypeRegistry};
    use crate::types::Timestamp;
    use tempfile::tempdir;

    fn store(dir: &std::path::Path) -> EntityStore {
        EntityStore::open(dir, TypeRegistry::standard()).unwrap()
    }

    fn add_mail(
        store: &mut EntityStore,
        thread: &str,
        date: i64,
        sender: &str,
        folder: Option<EntityId>,
    ) -> EntityId {
        let mut mail = Entity::new("mail");
        mail.set("threadId", Value::String(thread.into()));
        mail.set("date", Value::Timestamp(Timestamp::from_millis(date)));
        mail.set("sender", Value::String(sender.into()));
        if let Some(folder) = folder {
            mail.set("folder", Value::IdRef(folder));
        }
        let id = mail.id();
        store.add(mail).unwrap();
        id
    }

    #[test]
    fn test_full_scan_and_equals_filter() {
        let dir = tempdir().unwrap();
        let mut store = store(dir.path());
        add_mail(&mut store, "t1", 100, "a@x", None);
        add_mail(&mut store, "t2", 200, "b@x", None);

        let reader = store.snapshot().unwrap();
        let all = execute(&reader, &Query::new("mail")).unwrap();
        assert_eq!(all.len(), 2);

        let filtered = execute(
            &reader,
            &Query::new("mail").filter("threadId", Comparator::Equals(Value::String("t1".into()))),
        )
        .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(
            filtered[0].get("sender").and_then(Value::as_str),
            Some("a@x")
        );
    }

    #[test]
    fn test_sort_descending_default_for_dates() {
        let dir = tempdir().unwrap();
        let mut store = store(dir.path());
        add_mail(&mut store, "t", 100, "a@x", None);
        add_mail(&mut store, "t", 300, "c@x", None);
        add_mail(&mut store, "t", 200, "b@x", None);

        let reader = store.snapshot().unwrap();
        let results = execute(&reader, &Query::new("mail").sort_by("date")).unwrap();
        let senders: Vec<&str> = results
            .iter()
            .map(|e| e.get("sender").and_then(Value::as_str).unwrap())
            .collect();
        assert_eq!(senders, vec!["c@x", "b@x", "a@x"]);
    }

    #[test]
    fn test_limit_with_bounded_heap() {
        let dir = tempdir().unwrap();
        let mut store = store(dir.path());
        for i in 0..10 {
            add_mail(&mut store, "t", i * 10, &format!("s{}@x", i), None);
        }

        let reader = store.snapshot().unwrap();
        let results =
            execute(&reader, &Query::new("mail").sort_by("date").limit(3)).unwrap();
        assert_eq!(results.len(), 3);
        let dates: Vec<i64> = results
            .iter()
            .map(|e| e.get("date").and_then(Value::as_timestamp).unwrap().as_millis())
            .collect();
        assert_eq!(dates, vec![90, 80, 70]);
    }

    #[test]
    fn test_sort_ties_break_by_id_ascending() {
        let dir = tempdir().unwrap();
        let mut store = store(dir.path());
        let id1 = add_mail(&mut store, "t", 100, "a@x", None);
        let id2 = add_mail(&mut store, "t", 100, "b@x", None);
        let mut expected = vec![id1, id2];
        expected.sort();

        let reader = store.snapshot().unwrap();
        let results = execute(&reader, &Query::new("mail").sort_by("date")).unwrap();
        let got: Vec<EntityId> = results.iter().map(Entity::id).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_index_seeded_query_matches_scan() {
        let dir = tempdir().unwrap();
        let mut store = store(dir.path());
        let folder = EntityId::new();
        add_mail(&mut store, "t1", 1, "a@x", Some(folder));
        add_mail(&mut store, "t2", 2, "b@x", Some(EntityId::new()));

        let reader = store.snapshot().unwrap();
        // `folder` is indexed, so this runs off the index.
        let results = execute(
            &reader,
            &Query::new("mail").filter("folder", Comparator::Equals(Value::IdRef(folder))),
        )
        .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].get("sender").and_then(Value::as_str), Some("a@x"));
    }

    #[test]
    fn test_range_filter_on_date_index() {
        let dir = tempdir().unwrap();
        let mut store = store(dir.path());
        for i in 1..=5 {
            add_mail(&mut store, "t", i * 100, &format!("s{}@x", i), None);
        }

        let reader = store.snapshot().unwrap();
        let results = execute(
            &reader,
            &Query::new("mail").filter(
                "date",
                Comparator::Range {
                    from: Value::Timestamp(Timestamp::from_millis(200)),
                    to: Value::Timestamp(Timestamp::from_millis(400)),
                },
            ),
        )
        .unwrap();
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn test_scenario_s3_reduce() {
        let dir = tempdir().unwrap();
        let mut store = store(dir.path());
        add_mail(&mut store, "T", 10_00, "a@x", None);
        add_mail(&mut store, "T", 9_00, "b@x", None);
        let newest = add_mail(&mut store, "T", 11_00, "c@x", None);

        let reader = store.snapshot().unwrap();
        let query = Query::new("mail").reduce(Reduce {
            property: PropertyName::new("threadId"),
            selector: Selector::Max(PropertyName::new("date")),
            aggregates: vec![
                Aggregate::Count,
                Aggregate::Collect {
                    property: PropertyName::new("sender"),
                    name: "senders".into(),
                },
            ],
        });
        let results = execute(&reader, &query).unwrap();

        assert_eq!(results.len(), 1);
        let row = &results[0];
        assert_eq!(row.id(), newest);
        assert_eq!(row.get("count").and_then(Value::as_i64), Some(3));
        assert_eq!(
            row.get("collected.senders").and_then(Value::as_list).map(<[Value]>::len),
            Some(3)
        );
    }

    #[test]
    fn test_scenario_s4_subquery() {
        let dir = tempdir().unwrap();
        let mut store = store(dir.path());

        let mut f1 = Entity::new("folder");
        f1.set("specialpurpose", Value::String("p1".into()));
        let f1_id = f1.id();
        store.add(f1).unwrap();
        let mut f2 = Entity::new("folder");
        f2.set("specialpurpose", Value::String("p2".into()));
        store.add(f2).unwrap();

        let m1 = add_mail(&mut store, "t", 1, "a@x", Some(f1_id));
        add_mail(&mut store, "t", 2, "b@x", Some(EntityId::new()));

        let reader = store.snapshot().unwrap();
        let query = Query::new("mail").subquery(
            "folder",
            Query::new("folder").filter(
                "specialpurpose",
                Comparator::Contains(Value::String("p1".into())),
            ),
        );
        let results = execute(&reader, &query).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id(), m1);
    }

    #[test]
    fn test_bloom_thread_expansion() {
        let dir = tempdir().unwrap();
        let mut store = store(dir.path());
        let seed = add_mail(&mut store, "T", 100, "a@x", None);
        add_mail(&mut store, "T", 200, "b@x", None);
        add_mail(&mut store, "other", 300, "c@x", None);

        let reader = store.snapshot().unwrap();
        let results = execute(&reader, &standard::full_thread(seed)).unwrap();
        assert_eq!(results.len(), 2);
        // Ascending by date per the standard query.
        assert_eq!(results[0].id(), seed);
    }

    #[test]
    fn test_projection() {
        let dir = tempdir().unwrap();
        let mut store = store(dir.path());
        add_mail(&mut store, "t", 100, "a@x", None);

        let reader = store.snapshot().unwrap();
        let results = execute(
            &reader,
            &Query::new("mail").request([PropertyName::new("sender")]),
        )
        .unwrap();
        assert_eq!(results[0].get("sender").and_then(Value::as_str), Some("a@x"));
        assert!(results[0].get("threadId").is_none());
        assert!(results[0].get("date").is_none());
    }

    #[test]
    fn test_ids_filter() {
        let dir = tempdir().unwrap();
        let mut store = store(dir.path());
        let id1 = add_mail(&mut store, "t", 1, "a@x", None);
        add_mail(&mut store, "t", 2, "b@x", None);

        let reader = store.snapshot().unwrap();
        let results = execute(&reader, &Query::new("mail").with_ids(vec![id1])).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id(), id1);
    }

    #[test]
    fn test_deleted_entities_excluded() {
        let dir = tempdir().unwrap();
        let mut store = store(dir.path());
        let id = add_mail(&mut store, "t", 1, "a@x", None);
        store.remove(&EntityType::new("mail"), &id, false).unwrap();

        let reader = store.snapshot().unwrap();
        assert!(execute(&reader, &Query::new("mail")).unwrap().is_empty());
        assert!(execute(&reader, &Query::new("mail").with_ids(vec![id]))
            .unwrap()
            .is_empty());
    }
}
