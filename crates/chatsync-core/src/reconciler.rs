use std::{cmp::Ordering, collections::HashSet, fmt, hash::Hash};

use serde::{Deserialize, Serialize};

use crate::types::{Message, MessageId, Room, RoomId};

/// Row type that can live in a [`ViewCollection`].
pub trait Entity: Clone + fmt::Debug + Send + Sync + 'static {
    /// Identifier unique within the entity's table.
    type Id: Copy
        + Eq
        + Hash
        + fmt::Debug
        + fmt::Display
        + From<i64>
        + Into<i64>
        + Send
        + Sync
        + 'static;

    fn id(&self) -> Self::Id;

    /// ISO-8601 creation timestamp used as the sort key.
    fn created_at(&self) -> Option<&str>;
}

impl Entity for Room {
    type Id = RoomId;

    fn id(&self) -> RoomId {
        self.id
    }

    fn created_at(&self) -> Option<&str> {
        self.created_at.as_deref()
    }
}

impl Entity for Message {
    type Id = MessageId;

    fn id(&self) -> MessageId {
        self.id
    }

    fn created_at(&self) -> Option<&str> {
        self.created_at.as_deref()
    }
}

/// Display order of a view.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SortDirection {
    /// Descending creation time (room list).
    NewestFirst,
    /// Ascending creation time (message history).
    OldestFirst,
}

/// Lexical comparison of creation timestamps; a missing side compares equal.
pub fn compare_created_at(a: Option<&str>, b: Option<&str>, direction: SortDirection) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => match direction {
            SortDirection::OldestFirst => a.cmp(b),
            SortDirection::NewestFirst => b.cmp(a),
        },
        _ => Ordering::Equal,
    }
}

/// Incremental change applied to a collection.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewOp<E: Entity> {
    /// Union a snapshot batch into the collection.
    Snapshot(Vec<E>),
    /// Append one hydrated live insert.
    Insert(E),
    /// Remove by identifier.
    Delete(E::Id),
}

/// Result of applying one [`ViewOp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The collection changed (or a snapshot merged with nothing new).
    Applied { added: usize, removed: usize },
    /// Insert for an identifier already present; absorbed.
    Duplicate,
    /// Delete for an identifier not present; absorbed.
    Absent,
}

/// Canonical ordered, deduplicated view of one entity stream.
///
/// Every mutating call leaves the collection unique by identifier and ordered
/// by [`compare_created_at`]. Entries are only removed by an explicit delete.
#[derive(Debug, Clone)]
pub struct ViewCollection<E: Entity> {
    items: Vec<E>,
    ids: HashSet<E::Id>,
    direction: SortDirection,
}

impl<E: Entity> ViewCollection<E> {
    pub fn new(direction: SortDirection) -> Self {
        Self {
            items: Vec::new(),
            ids: HashSet::new(),
            direction,
        }
    }

    /// Current entries in display order.
    pub fn items(&self) -> &[E] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn direction(&self) -> SortDirection {
        self.direction
    }

    pub fn contains(&self, id: E::Id) -> bool {
        self.ids.contains(&id)
    }

    pub fn get(&self, id: E::Id) -> Option<&E> {
        if !self.contains(id) {
            return None;
        }
        self.items.iter().find(|item| item.id() == id)
    }

    pub fn apply(&mut self, op: ViewOp<E>) -> ApplyOutcome {
        match op {
            ViewOp::Snapshot(rows) => ApplyOutcome::Applied {
                added: self.apply_snapshot_batch(rows),
                removed: 0,
            },
            ViewOp::Insert(item) => self.apply_insert(item),
            ViewOp::Delete(id) => self.apply_delete(id),
        }
    }

    /// Union a snapshot batch by identifier and re-sort.
    ///
    /// Entries already present keep their current copy. Returns how many rows
    /// were new.
    pub fn apply_snapshot_batch(&mut self, rows: Vec<E>) -> usize {
        let before = self.items.len();
        for row in rows {
            if self.ids.insert(row.id()) {
                self.items.push(row);
            }
        }
        let added = self.items.len() - before;
        if added > 0 {
            self.resort();
        }
        added
    }

    /// Append a hydrated insert unless its identifier is already present.
    pub fn apply_insert(&mut self, item: E) -> ApplyOutcome {
        if !self.ids.insert(item.id()) {
            return ApplyOutcome::Duplicate;
        }
        self.items.push(item);
        self.resort();
        ApplyOutcome::Applied {
            added: 1,
            removed: 0,
        }
    }

    /// Remove the entry with `id` if present.
    pub fn apply_delete(&mut self, id: E::Id) -> ApplyOutcome {
        if !self.ids.remove(&id) {
            return ApplyOutcome::Absent;
        }
        self.items.retain(|item| item.id() != id);
        ApplyOutcome::Applied {
            added: 0,
            removed: 1,
        }
    }

    /// Whether timestamped entries appear in display order.
    pub fn is_ordered(&self) -> bool {
        let mut timed = self.items.iter().filter_map(Entity::created_at);
        let Some(mut previous) = timed.next() else {
            return true;
        };
        for current in timed {
            if compare_created_at(Some(previous), Some(current), self.direction)
                == Ordering::Greater
            {
                return false;
            }
            previous = current;
        }
        true
    }

    // Entries without a timestamp keep their slot; timestamped entries are
    // stably sorted among the remaining slots. This keeps the comparator a
    // total order for `sort_by`.
    fn resort(&mut self) {
        let direction = self.direction;
        let mut timed = Vec::with_capacity(self.items.len());
        let mut layout = Vec::with_capacity(self.items.len());
        for item in self.items.drain(..) {
            if item.created_at().is_some() {
                layout.push(None);
                timed.push(item);
            } else {
                layout.push(Some(item));
            }
        }

        timed.sort_by(|a, b| compare_created_at(a.created_at(), b.created_at(), direction));

        let mut timed = timed.into_iter();
        self.items = layout
            .into_iter()
            .filter_map(|slot| slot.or_else(|| timed.next()))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use proptest::prelude::*;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        id: i64,
        created_at: Option<String>,
        body: &'static str,
    }

    impl Entity for Item {
        type Id = i64;

        fn id(&self) -> i64 {
            self.id
        }

        fn created_at(&self) -> Option<&str> {
            self.created_at.as_deref()
        }
    }

    fn item(id: i64, created_at: &str) -> Item {
        Item {
            id,
            created_at: Some(created_at.to_owned()),
            body: "",
        }
    }

    fn ids(collection: &ViewCollection<Item>) -> Vec<i64> {
        collection.items().iter().map(|item| item.id).collect()
    }

    #[test]
    fn snapshot_union_sorts_newest_first() {
        let mut rooms = ViewCollection::new(SortDirection::NewestFirst);
        let added = rooms.apply_snapshot_batch(vec![
            item(1, "2026-01-01T00:00:01Z"),
            item(3, "2026-01-01T00:00:03Z"),
            item(2, "2026-01-01T00:00:02Z"),
        ]);

        assert_eq!(added, 3);
        assert_eq!(ids(&rooms), vec![3, 2, 1]);
    }

    #[test]
    fn descending_snapshot_is_displayed_oldest_first_for_history() {
        let mut history = ViewCollection::new(SortDirection::OldestFirst);
        history.apply_snapshot_batch(vec![
            item(3, "2026-01-01T00:00:03Z"),
            item(2, "2026-01-01T00:00:02Z"),
            item(1, "2026-01-01T00:00:01Z"),
        ]);

        assert_eq!(ids(&history), vec![1, 2, 3]);
    }

    #[test]
    fn snapshot_keeps_existing_live_copy() {
        let mut rooms = ViewCollection::new(SortDirection::NewestFirst);
        rooms.apply_insert(Item {
            body: "live",
            ..item(5, "2026-01-01T00:00:05Z")
        });

        let added = rooms.apply_snapshot_batch(vec![
            Item {
                body: "snapshot",
                ..item(5, "2026-01-01T00:00:05Z")
            },
            item(4, "2026-01-01T00:00:04Z"),
        ]);

        assert_eq!(added, 1);
        assert_eq!(rooms.get(5).map(|item| item.body), Some("live"));
        assert_eq!(ids(&rooms), vec![5, 4]);
    }

    #[test]
    fn duplicate_insert_is_absorbed() {
        let mut history = ViewCollection::new(SortDirection::OldestFirst);
        assert_eq!(
            history.apply_insert(item(1, "2026-01-01T00:00:01Z")),
            ApplyOutcome::Applied {
                added: 1,
                removed: 0
            }
        );
        assert_eq!(
            history.apply_insert(item(1, "2026-01-01T00:00:01Z")),
            ApplyOutcome::Duplicate
        );
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn delete_of_unknown_identifier_is_absorbed() {
        let mut history = ViewCollection::new(SortDirection::OldestFirst);
        history.apply_snapshot_batch(vec![
            item(1, "2026-01-01T00:00:01Z"),
            item(2, "2026-01-01T00:00:02Z"),
            item(3, "2026-01-01T00:00:03Z"),
            item(4, "2026-01-01T00:00:04Z"),
        ]);

        assert_eq!(history.apply_delete(99), ApplyOutcome::Absent);
        assert_eq!(history.len(), 4);
    }

    #[test]
    fn delete_does_not_block_a_later_insert() {
        let mut rooms = ViewCollection::new(SortDirection::NewestFirst);
        assert_eq!(rooms.apply_delete(8), ApplyOutcome::Absent);
        rooms.apply_insert(item(8, "2026-01-01T00:00:08Z"));
        assert!(rooms.contains(8));
    }

    #[test]
    fn out_of_order_live_inserts_end_up_sorted() {
        let mut history = ViewCollection::new(SortDirection::OldestFirst);
        for (id, ts) in [
            (3, "2026-01-01T00:00:03Z"),
            (1, "2026-01-01T00:00:01Z"),
            (2, "2026-01-01T00:00:02Z"),
        ] {
            history.apply(ViewOp::Insert(item(id, ts)));
        }
        assert_eq!(ids(&history), vec![1, 2, 3]);
    }

    #[test]
    fn missing_timestamps_keep_their_slot() {
        let mut history = ViewCollection::new(SortDirection::OldestFirst);
        history.apply_snapshot_batch(vec![
            item(2, "2026-01-01T00:00:02Z"),
            Item {
                id: 9,
                created_at: None,
                body: "",
            },
            item(1, "2026-01-01T00:00:01Z"),
        ]);

        assert_eq!(ids(&history), vec![1, 9, 2]);
        assert!(history.is_ordered());
    }

    fn arb_item() -> impl Strategy<Value = Item> {
        (0i64..16, proptest::option::weighted(0.9, 0u8..40)).prop_map(|(id, ts)| Item {
            id,
            created_at: ts.map(|second| format!("2026-01-01T00:00:{second:02}Z")),
            body: "",
        })
    }

    fn arb_op() -> impl Strategy<Value = ViewOp<Item>> {
        prop_oneof![
            proptest::collection::vec(arb_item(), 0..6).prop_map(ViewOp::Snapshot),
            arb_item().prop_map(ViewOp::Insert),
            (0i64..16).prop_map(ViewOp::Delete),
        ]
    }

    fn arb_direction() -> impl Strategy<Value = SortDirection> {
        prop_oneof![
            Just(SortDirection::NewestFirst),
            Just(SortDirection::OldestFirst)
        ]
    }

    proptest! {
        #[test]
        fn every_interleaving_stays_unique_and_ordered(
            direction in arb_direction(),
            ops in proptest::collection::vec(arb_op(), 0..40),
        ) {
            let mut collection = ViewCollection::new(direction);
            for op in ops {
                collection.apply(op);
                let mut seen = HashSet::new();
                prop_assert!(collection.items().iter().all(|item| seen.insert(item.id)));
                prop_assert!(collection.is_ordered());
                prop_assert_eq!(seen.len(), collection.len());
            }
        }

        #[test]
        fn only_deletes_remove_entries(
            ops in proptest::collection::vec(arb_op(), 0..40),
        ) {
            let mut collection: ViewCollection<Item> = ViewCollection::new(SortDirection::NewestFirst);
            for op in ops {
                let before: HashSet<i64> = collection.items().iter().map(|item| item.id).collect();
                let deleted = match &op {
                    ViewOp::Delete(id) => Some(*id),
                    _ => None,
                };
                collection.apply(op);
                for id in before {
                    prop_assert!(collection.contains(id) || deleted == Some(id));
                }
            }
        }

        #[test]
        fn repeated_insert_is_idempotent(
            seed in proptest::collection::vec(arb_item(), 0..10),
            extra in arb_item(),
        ) {
            let mut once = ViewCollection::new(SortDirection::OldestFirst);
            once.apply_snapshot_batch(seed.clone());
            once.apply_insert(extra.clone());

            let mut twice = ViewCollection::new(SortDirection::OldestFirst);
            twice.apply_snapshot_batch(seed);
            twice.apply_insert(extra.clone());
            twice.apply_insert(extra);

            prop_assert_eq!(once.items(), twice.items());
        }

        #[test]
        fn delete_before_insert_leaves_item_present(
            seed in proptest::collection::vec(arb_item(), 0..10),
            extra in arb_item(),
        ) {
            let mut collection = ViewCollection::new(SortDirection::NewestFirst);
            collection.apply_snapshot_batch(seed);
            collection.apply_delete(extra.id);
            collection.apply_insert(extra.clone());
            prop_assert!(collection.contains(extra.id));
        }
    }
}
