use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use crate::Component;
use crate::points::Slot;
use crate::tree::KdTree;

/// Where a live id sits in the forest.
#[derive(Debug, Clone, Copy)]
struct DelEntry {
    generation: usize,
    slot: Slot,
}

/// Dynamic spatial index over `DIM`-dimensional points keyed by `Id`.
///
/// Insert, remove and update are amortized O(log n) tree work; box queries
/// visit every non-empty generation. Operating on an id that is not live
/// (or inserting one that is) is a caller bug and panics in debug builds.
#[derive(Debug, Clone)]
pub struct PointIndex<const DIM: usize, C, Id> {
    generations: Vec<KdTree<DIM, C, Id>>,
    del_entries: HashMap<Id, DelEntry>,
    /// Slots across all generations, tombstoned ones included.
    entries: usize,
    /// Tombstoned slots.
    deleted: usize,
}

impl<const DIM: usize, C, Id> Default for PointIndex<DIM, C, Id>
where
    C: Component,
    Id: Copy + Eq + Hash + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<const DIM: usize, C, Id> PointIndex<DIM, C, Id>
where
    C: Component,
    Id: Copy + Eq + Hash + Debug,
{
    pub fn new() -> Self {
        assert!(DIM > 0, "PointIndex needs at least one dimension");
        Self {
            generations: Vec::new(),
            del_entries: HashMap::new(),
            entries: 0,
            deleted: 0,
        }
    }

    /// Number of live points.
    pub fn len(&self) -> usize {
        self.entries - self.deleted
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: Id) -> bool {
        self.del_entries.contains_key(&id)
    }

    /// Current position of a live id.
    pub fn position(&self, id: Id) -> Option<[C; DIM]> {
        let entry = self.del_entries.get(&id)?;
        Some(self.generations[entry.generation].point(entry.slot))
    }

    /// Number of non-empty generations.
    pub fn generation_count(&self) -> usize {
        self.generations.iter().filter(|g| !g.is_empty()).count()
    }

    /// Adds `id` at `point`. `id` must not be live and every component of
    /// `point` must be finite.
    pub fn insert(&mut self, point: [C; DIM], id: Id) {
        debug_assert!(
            point.iter().all(|c| c.is_finite()),
            "PointIndex::insert: non-finite point {point:?} for id {id:?}"
        );
        let live = self.del_entries.contains_key(&id);
        debug_assert!(!live, "PointIndex::insert: id {id:?} is already live");
        if live {
            self.remove(id);
        }

        let mut carry = KdTree::single(point, id);
        let mut level = 0;
        loop {
            if level == self.generations.len() {
                self.generations.push(carry);
                break;
            }
            if self.generations[level].is_empty() {
                self.generations[level] = carry;
                break;
            }
            let occupied = std::mem::replace(&mut self.generations[level], KdTree::empty());
            carry = KdTree::merge(&carry, &occupied);
            level += 1;
        }
        self.reindex(level);
        self.entries += 1;
    }

    /// Removes a live `id`. Returns `false` (and panics in debug builds) if
    /// it was not live.
    pub fn remove(&mut self, id: Id) -> bool {
        debug_assert!(
            self.del_entries.contains_key(&id),
            "PointIndex::remove: id {id:?} is not live"
        );
        let Some(entry) = self.del_entries.remove(&id) else {
            return false;
        };
        self.generations[entry.generation].remove(entry.slot);
        self.deleted += 1;
        assert!(
            self.deleted <= self.entries,
            "PointIndex: {} tombstones for {} slots",
            self.deleted,
            self.entries
        );
        if self.deleted >= self.entries.div_ceil(2) {
            self.compact();
        }
        true
    }

    /// Moves a live `id` to `point`.
    pub fn update(&mut self, point: [C; DIM], id: Id) {
        self.remove(id);
        self.insert(point, id);
    }

    /// Calls `f` for every live point inside the inclusive box `[min, max]`.
    /// Order is unspecified.
    pub fn range_query(&self, min: &[C; DIM], max: &[C; DIM], mut f: impl FnMut(&[C; DIM], Id)) {
        for generation in &self.generations {
            generation.range_query(min, max, &mut f);
        }
    }

    /// Ids of every live point inside the inclusive box `[min, max]`.
    pub fn ids_in_box(&self, min: &[C; DIM], max: &[C; DIM]) -> Vec<Id> {
        let mut out = Vec::new();
        self.range_query(min, max, |_, id| out.push(id));
        out
    }

    /// Visits every live point.
    pub fn for_each(&self, mut f: impl FnMut(&[C; DIM], Id)) {
        for generation in &self.generations {
            generation.for_each_live(|_, point, id| f(point, id));
        }
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }

    /// Drops every tombstone by rebuilding the forest from the live points.
    ///
    /// Generation `i` is rebuilt iff bit `i` of the live count is set, so the
    /// power-of-two layout holds for any live count.
    pub fn compact(&mut self) {
        let live = self.len();
        let mut points = Vec::with_capacity(live);
        let mut ids = Vec::with_capacity(live);
        for generation in &self.generations {
            generation.for_each_live(|_, point, id| {
                points.push(*point);
                ids.push(id);
            });
        }
        assert_eq!(points.len(), live, "PointIndex: live count out of sync with tombstones");

        tracing::debug!(
            live,
            tombstones = self.deleted,
            generations = self.generations.len(),
            "compacting point index"
        );

        self.generations.clear();
        self.del_entries = HashMap::with_capacity(live);
        let mut taken = 0;
        let mut level = 0;
        while live >> level != 0 {
            let size = 1usize << level;
            if live & size != 0 {
                let range = taken..taken + size;
                self.generations
                    .push(KdTree::build(points[range.clone()].to_vec(), ids[range].to_vec()));
                taken += size;
            } else {
                self.generations.push(KdTree::empty());
            }
            level += 1;
        }
        for level in 0..self.generations.len() {
            self.reindex(level);
        }
        self.entries = live;
        self.deleted = 0;
    }

    fn reindex(&mut self, generation: usize) {
        let del_entries = &mut self.del_entries;
        self.generations[generation].for_each_live(|slot, _, id| {
            del_entries.insert(id, DelEntry { generation, slot });
        });
    }
}
