use glam::IVec3;

/// Offsets of every chunk on the surface of a cube of Chebyshev radius `d`,
/// cached per radius.
///
/// Within a shell, offsets are ordered by Euclidean distance from the centre
/// (face centres first, corners last). The sort is stable so equal-distance
/// offsets keep their scan order.
#[derive(Debug, Clone, Default)]
pub struct RingCache {
    rings: Vec<Vec<IVec3>>,
}

impl RingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offsets for shell `d`. Negative radii have no offsets.
    pub fn ring(&mut self, d: i32) -> &[IVec3] {
        if d < 0 {
            return &[];
        }
        let d = d as usize;
        while self.rings.len() <= d {
            let next = self.rings.len() as i32;
            self.rings.push(shell(next));
        }
        &self.rings[d]
    }

    /// Number of shells computed so far.
    pub fn cached(&self) -> usize {
        self.rings.len()
    }
}

/// Walks the shell in y, z, x order, visiting only its surface.
fn shell(d: i32) -> Vec<IVec3> {
    if d == 0 {
        return vec![IVec3::ZERO];
    }
    let side = 2 * d + 1;
    let inner = 2 * d - 1;
    let mut offsets = Vec::with_capacity((side.pow(3) - inner.pow(3)) as usize);
    for y in -d..=d {
        for z in -d..=d {
            if y.abs() == d || z.abs() == d {
                offsets.extend((-d..=d).map(|x| IVec3::new(x, y, z)));
            } else {
                offsets.push(IVec3::new(-d, y, z));
                offsets.push(IVec3::new(d, y, z));
            }
        }
    }
    offsets.sort_by_key(|p| p.length_squared());
    offsets
}
