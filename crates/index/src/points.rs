use std::cmp::Ordering;

use crate::Component;

/// Slot of a point inside one generation.
pub(crate) type Slot = u32;

pub(crate) fn cmp_component<C: Component>(a: C, b: C) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

/// Slots of a point set, permuted once per axis so that each permutation is
/// sorted by that axis.
#[derive(Debug, Clone)]
pub(crate) struct SortedIndices<const DIM: usize> {
    axes: [Vec<Slot>; DIM],
}

/// Result of splitting [`SortedIndices`] at the median of one axis.
pub(crate) struct Split<const DIM: usize> {
    pub left: SortedIndices<DIM>,
    pub right: SortedIndices<DIM>,
    pub pivot: Slot,
}

impl<const DIM: usize> SortedIndices<DIM> {
    fn identity(n: usize) -> Self {
        Self {
            axes: std::array::from_fn(|_| (0..n as Slot).collect()),
        }
    }

    fn with_capacity(n: usize) -> Self {
        Self {
            axes: std::array::from_fn(|_| Vec::with_capacity(n)),
        }
    }

    pub fn len(&self) -> usize {
        self.axes.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn axis(&self, axis: usize) -> &[Slot] {
        &self.axes[axis]
    }

    /// Splits at the median of `axis` into the slots sorted before the pivot,
    /// the pivot itself, and the slots sorted after it.
    ///
    /// Every other axis keeps its sorted order on both sides. `markers` must
    /// be all `false` and at least as long as the highest slot; it is left
    /// all `false` again.
    pub fn split(&self, axis: usize, markers: &mut [bool]) -> Split<DIM> {
        let sorted = &self.axes[axis];
        let left_n = sorted.len() / 2;
        let pivot = sorted[left_n];
        let right_n = sorted.len() - left_n - 1;

        for &slot in &sorted[..left_n] {
            markers[slot as usize] = true;
        }

        let mut left = Self::with_capacity(left_n);
        let mut right = Self::with_capacity(right_n);
        for d in 0..DIM {
            if d == axis {
                left.axes[d].extend_from_slice(&sorted[..left_n]);
                right.axes[d].extend_from_slice(&sorted[left_n + 1..]);
                continue;
            }
            for &slot in &self.axes[d] {
                if slot == pivot {
                    continue;
                }
                if markers[slot as usize] {
                    left.axes[d].push(slot);
                } else {
                    right.axes[d].push(slot);
                }
            }
        }

        for &slot in &sorted[..left_n] {
            markers[slot as usize] = false;
        }

        Split { left, right, pivot }
    }
}

/// A point set together with its per-axis sort orders.
#[derive(Debug, Clone)]
pub(crate) struct SortedPoints<const DIM: usize, C> {
    pub points: Vec<[C; DIM]>,
    pub indices: SortedIndices<DIM>,
}

impl<const DIM: usize, C: Component> SortedPoints<DIM, C> {
    pub fn empty() -> Self {
        Self {
            points: Vec::new(),
            indices: SortedIndices::with_capacity(0),
        }
    }

    pub fn single(point: [C; DIM]) -> Self {
        Self {
            points: vec![point],
            indices: SortedIndices::identity(1),
        }
    }

    /// Sorts `points` along every axis. O(n log n) per axis.
    pub fn from_points(points: Vec<[C; DIM]>) -> Self {
        let mut indices = SortedIndices::identity(points.len());
        for (d, order) in indices.axes.iter_mut().enumerate() {
            order.sort_by(|&i, &j| cmp_component(points[i as usize][d], points[j as usize][d]));
        }
        Self { points, indices }
    }

    /// Merges two sorted sets in linear time. Slots of `b` are shifted past
    /// the slots of `a`.
    pub fn merge(a: &Self, b: &Self) -> Self {
        let offset = a.len() as Slot;
        let mut points = Vec::with_capacity(a.len() + b.len());
        points.extend_from_slice(&a.points);
        points.extend_from_slice(&b.points);

        let mut indices = SortedIndices::with_capacity(points.len());
        for d in 0..DIM {
            let (xs, ys) = (a.indices.axis(d), b.indices.axis(d));
            let dst = &mut indices.axes[d];
            let (mut i, mut j) = (0, 0);
            while i < xs.len() && j < ys.len() {
                let (ia, jb) = (xs[i], ys[j] + offset);
                if cmp_component(points[ia as usize][d], points[jb as usize][d]) != Ordering::Greater {
                    dst.push(ia);
                    i += 1;
                } else {
                    dst.push(jb);
                    j += 1;
                }
            }
            dst.extend_from_slice(&xs[i..]);
            dst.extend(ys[j..].iter().map(|&s| s + offset));
        }
        Self { points, indices }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }
}
