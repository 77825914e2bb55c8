//! Dynamic point index: insert, remove, move and box-query point-located ids
//! without rebuilding on every mutation.
//!
//! The index is a forest of static, perfectly balanced k-d trees whose sizes
//! are successive powers of two. Inserting a point builds a one-element tree
//! and merges it upwards while a tree of the same size exists, the way a
//! binary counter carries. Removal only sets a tombstone; once at least half
//! of all slots are tombstoned the forest is rebuilt from the live points.
//!
//! # Invariants
//! - Every live id maps to exactly one untombstoned slot.
//! - Generation `i` holds either nothing or exactly `2^i` slots.
//! - `deleted <= entries` at all times; a violation aborts.
//!
//! The index is not thread-safe by contract: mutation and queries happen on
//! the thread that owns the simulation tick.

mod forest;
mod points;
mod tree;

pub use forest::PointIndex;

use std::fmt::Debug;

/// Scalar coordinate type a [`PointIndex`] can store.
///
/// Ordering must be total over the values actually inserted. Floating point
/// components must be finite: a NaN compares equal to everything and breaks
/// the per-axis sort order the trees are built from.
pub trait Component: Copy + PartialOrd + Debug {
    /// Whether the value can be ordered against every other stored value.
    fn is_finite(self) -> bool {
        true
    }
}

macro_rules! impl_component {
    ($($t:ty),*) => {
        $(impl Component for $t {})*
    };
}

impl_component!(i8, i16, i32, i64, u8, u16, u32, u64);

impl Component for f32 {
    fn is_finite(self) -> bool {
        f32::is_finite(self)
    }
}

impl Component for f64 {
    fn is_finite(self) -> bool {
        f64::is_finite(self)
    }
}
