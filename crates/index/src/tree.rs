use crate::Component;
use crate::points::{Slot, SortedIndices, SortedPoints};

const NO_NODE: Slot = Slot::MAX;

/// One generation of the forest: a static balanced k-d tree with mutable
/// tombstones.
///
/// The tree is implicit: node `k` has children `2k + 1` and `2k + 2`, and
/// `nodes[k]` is the slot of the point splitting at that node. Node `k` at
/// depth `l` splits on axis `l % DIM`.
#[derive(Debug, Clone)]
pub(crate) struct KdTree<const DIM: usize, C, Id> {
    items: SortedPoints<DIM, C>,
    ids: Vec<Id>,
    nodes: Vec<Slot>,
    deleted: Vec<bool>,
}

impl<const DIM: usize, C: Component, Id: Copy> KdTree<DIM, C, Id> {
    pub fn empty() -> Self {
        Self {
            items: SortedPoints::empty(),
            ids: Vec::new(),
            nodes: Vec::new(),
            deleted: Vec::new(),
        }
    }

    pub fn single(point: [C; DIM], id: Id) -> Self {
        Self {
            items: SortedPoints::single(point),
            ids: vec![id],
            nodes: vec![0],
            deleted: vec![false],
        }
    }

    /// Builds a tree over `points`, with `ids[i]` belonging to `points[i]`.
    pub fn build(points: Vec<[C; DIM]>, ids: Vec<Id>) -> Self {
        debug_assert_eq!(points.len(), ids.len());
        let items = SortedPoints::from_points(points);
        Self::from_sorted(items, ids, None)
    }

    /// Merges two generations into one of combined capacity, carrying their
    /// tombstones over.
    pub fn merge(a: &Self, b: &Self) -> Self {
        let items = SortedPoints::merge(&a.items, &b.items);
        let mut ids = Vec::with_capacity(a.capacity() + b.capacity());
        ids.extend_from_slice(&a.ids);
        ids.extend_from_slice(&b.ids);
        let mut deleted = Vec::with_capacity(ids.len());
        deleted.extend_from_slice(&a.deleted);
        deleted.extend_from_slice(&b.deleted);
        Self::from_sorted(items, ids, Some(deleted))
    }

    fn from_sorted(items: SortedPoints<DIM, C>, ids: Vec<Id>, deleted: Option<Vec<bool>>) -> Self {
        let n = items.len();
        let mut nodes = vec![NO_NODE; n];
        if n > 0 {
            let mut markers = vec![false; n];
            layout(&mut nodes, 0, 0, &items.indices, &mut markers);
        }
        Self {
            items,
            ids,
            nodes,
            deleted: deleted.unwrap_or_else(|| vec![false; n]),
        }
    }

    /// Slot count, tombstoned slots included.
    pub fn capacity(&self) -> usize {
        self.items.len()
    }

    /// Whether this generation never held anything.
    pub fn is_empty(&self) -> bool {
        self.capacity() == 0
    }

    pub fn point(&self, slot: Slot) -> [C; DIM] {
        self.items.points[slot as usize]
    }

    pub fn is_deleted(&self, slot: Slot) -> bool {
        self.deleted[slot as usize]
    }

    pub fn remove(&mut self, slot: Slot) {
        let mark = &mut self.deleted[slot as usize];
        debug_assert!(!*mark, "slot {slot} tombstoned twice");
        *mark = true;
    }

    /// Visits every untombstoned slot.
    pub fn for_each_live(&self, mut f: impl FnMut(Slot, &[C; DIM], Id)) {
        for (slot, (point, &id)) in self.items.points.iter().zip(&self.ids).enumerate() {
            let slot = slot as Slot;
            if !self.is_deleted(slot) {
                f(slot, point, id);
            }
        }
    }

    pub fn range_query(&self, min: &[C; DIM], max: &[C; DIM], f: &mut impl FnMut(&[C; DIM], Id)) {
        self.query_node(0, 0, min, max, f);
    }

    fn query_node(
        &self,
        node: usize,
        axis: usize,
        min: &[C; DIM],
        max: &[C; DIM],
        f: &mut impl FnMut(&[C; DIM], Id),
    ) {
        let Some(&slot) = self.nodes.get(node) else {
            return;
        };
        if slot == NO_NODE {
            return;
        }
        let point = &self.items.points[slot as usize];
        let split = point[axis];
        let left = 2 * node + 1;
        let right = 2 * node + 2;
        let next_axis = (axis + 1) % DIM;

        if min[axis] > split {
            self.query_node(right, next_axis, min, max, f);
        } else if max[axis] < split {
            self.query_node(left, next_axis, min, max, f);
        } else {
            self.query_node(right, next_axis, min, max, f);
            self.query_node(left, next_axis, min, max, f);
            if self.is_deleted(slot) {
                return;
            }
            let inside = (0..DIM).all(|d| point[d] >= min[d] && point[d] <= max[d]);
            if inside {
                f(point, self.ids[slot as usize]);
            }
        }
    }
}

/// Places the median of `sorted` along `axis` at `node` and recurses into
/// both halves with the next axis.
fn layout<const DIM: usize>(
    nodes: &mut Vec<Slot>,
    node: usize,
    axis: usize,
    sorted: &SortedIndices<DIM>,
    markers: &mut [bool],
) {
    let split = sorted.split(axis, markers);
    if node >= nodes.len() {
        nodes.resize(node + 1, NO_NODE);
    }
    nodes[node] = split.pivot;
    let next_axis = (axis + 1) % DIM;
    if !split.left.is_empty() {
        layout(nodes, 2 * node + 1, next_axis, &split.left, markers);
    }
    if !split.right.is_empty() {
        layout(nodes, 2 * node + 2, next_axis, &split.right, markers);
    }
}
