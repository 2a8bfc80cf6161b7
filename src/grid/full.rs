//! Cartesian-decomposed dense grid for one component of the combination.

use crate::combi_error::CombiError;
use crate::comm::collectives;
use crate::comm::communicator::{CommTag, Communicator};
use crate::element::CombiElement;
use crate::grid::{points_1d, DomainDecomposition};
use crate::scheme::LevelVector;

/// One anisotropic full grid, distributed over the ranks of a process group.
///
/// Storage is row-major with dimension 0 fastest. Hierarchical indices run
/// `0..=2^l` per dimension; grids without boundary store only the interior
/// and treat the ends as zero.
#[derive(Clone, Debug)]
pub struct DistributedFullGrid<E: CombiElement> {
    level: LevelVector,
    boundary: Vec<bool>,
    decomp: DomainDecomposition,
    my_coords: Vec<usize>,
    /// Storage-index slab per dimension: `[lo, lo + n_local)`.
    lo: Vec<usize>,
    n_local: Vec<usize>,
    n_global: Vec<usize>,
    data: Vec<E>,
}

impl<E: CombiElement> DistributedFullGrid<E> {
    pub fn new(
        level: LevelVector,
        boundary: Vec<bool>,
        decomp: DomainDecomposition,
        local_rank: usize,
    ) -> Result<Self, CombiError> {
        let dim = level.len();
        if boundary.len() != dim || decomp.dim() != dim {
            return Err(CombiError::InvalidConfig(
                "level, boundary and decomposition dimensions disagree".into(),
            ));
        }
        decomp.validate_nonempty(&level, &boundary)?;
        let my_coords = decomp.coords_of_rank(local_rank);
        let mut lo = Vec::with_capacity(dim);
        let mut n_local = Vec::with_capacity(dim);
        let mut n_global = Vec::with_capacity(dim);
        for d in 0..dim {
            let (a, b) = decomp.storage_range(d, my_coords[d], level[d], boundary[d]);
            lo.push(a);
            n_local.push(b - a);
            n_global.push(points_1d(level[d], boundary[d]));
        }
        let data = vec![E::default(); n_local.iter().product()];
        Ok(Self {
            level,
            boundary,
            decomp,
            my_coords,
            lo,
            n_local,
            n_global,
            data,
        })
    }

    pub fn dim(&self) -> usize {
        self.level.len()
    }

    pub fn level(&self) -> &LevelVector {
        &self.level
    }

    pub fn boundary(&self) -> &[bool] {
        &self.boundary
    }

    pub fn decomposition(&self) -> &DomainDecomposition {
        &self.decomp
    }

    pub fn cartesian_coords(&self) -> &[usize] {
        &self.my_coords
    }

    pub fn nr_local_elements(&self) -> usize {
        self.data.len()
    }

    pub fn local_shape(&self) -> &[usize] {
        &self.n_local
    }

    pub fn global_shape(&self) -> &[usize] {
        &self.n_global
    }

    pub fn data(&self) -> &[E] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [E] {
        &mut self.data
    }

    /// Per-dimension storage indices (local) of a local linear index.
    pub fn local_axis_indices(&self, mut li: usize) -> Vec<usize> {
        let mut idx = vec![0usize; self.dim()];
        for d in 0..self.dim() {
            idx[d] = li % self.n_local[d];
            li /= self.n_local[d];
        }
        idx
    }

    /// Local linear index of per-dimension local storage indices.
    #[inline]
    pub fn local_linear_index(&self, idx: &[usize]) -> usize {
        let mut li = 0usize;
        for d in (0..self.dim()).rev() {
            li = li * self.n_local[d] + idx[d];
        }
        li
    }

    /// Hierarchical index of a local storage index along `d`.
    #[inline]
    pub fn hier_index(&self, d: usize, local_idx: usize) -> u64 {
        (self.lo[d] + local_idx) as u64 + if self.boundary[d] { 0 } else { 1 }
    }

    /// Local storage index of a hierarchical index along `d`, if owned here.
    #[inline]
    pub fn local_idx_of_hier(&self, d: usize, hier: u64) -> Option<usize> {
        let storage = hier as i64 - if self.boundary[d] { 0 } else { 1 };
        if storage < 0 {
            return None;
        }
        let storage = storage as usize;
        if storage < self.lo[d] || storage >= self.lo[d] + self.n_local[d] {
            return None;
        }
        Some(storage - self.lo[d])
    }

    /// Unit-cube coordinates of a local linear index.
    pub fn coords_local(&self, li: usize) -> Vec<f64> {
        let idx = self.local_axis_indices(li);
        (0..self.dim())
            .map(|d| self.hier_index(d, idx[d]) as f64 / (1u64 << self.level[d]) as f64)
            .collect()
    }

    /// Overwrite every local point from a coordinate function.
    pub fn fill_with(&mut self, f: impl Fn(&[f64]) -> E) {
        for li in 0..self.data.len() {
            let x = self.coords_local(li);
            self.data[li] = f(&x);
        }
    }

    /// Gather the dense global grid on `root` of the group communicator.
    /// Returns `None` on non-root ranks.
    pub fn gather_full_grid<C: Communicator>(
        &self,
        lcomm: &C,
        root: usize,
        tag: CommTag,
    ) -> Result<Option<Vec<E>>, CombiError> {
        let gathered = collectives::gatherv(lcomm, root, tag, &self.data)?;
        let Some((flat, counts)) = gathered else {
            return Ok(None);
        };

        let dim = self.dim();
        let mut dense = vec![E::default(); self.n_global.iter().product()];
        let mut cursor = 0usize;
        for (rank, &count) in counts.iter().enumerate() {
            let block = &flat[cursor..cursor + count];
            cursor += count;
            let coords = self.decomp.coords_of_rank(rank);
            let ranges: Vec<(usize, usize)> = (0..dim)
                .map(|d| self.decomp.storage_range(d, coords[d], self.level[d], self.boundary[d]))
                .collect();
            let shape: Vec<usize> = ranges.iter().map(|&(a, b)| b - a).collect();
            debug_assert_eq!(count, shape.iter().product::<usize>());
            for (bi, &value) in block.iter().enumerate() {
                let mut rest = bi;
                let mut gi = 0usize;
                let mut stride = 1usize;
                for d in 0..dim {
                    let local = rest % shape[d];
                    rest /= shape[d];
                    gi += (ranges[d].0 + local) * stride;
                    stride *= self.n_global[d];
                }
                dense[gi] = value;
            }
        }
        Ok(Some(dense))
    }
}

/// Number of points of a dense grid of the given level.
pub fn dense_len(level: &LevelVector, boundary: &[bool]) -> usize {
    (0..level.len())
        .map(|d| points_1d(level[d], boundary[d]))
        .product()
}

/// Unit-cube coordinates of a dense grid point by linear index (dimension 0
/// fastest, matching the gathered storage order).
pub fn dense_coords(level: &LevelVector, boundary: &[bool], mut gi: usize) -> Vec<f64> {
    (0..level.len())
        .map(|d| {
            let n = points_1d(level[d], boundary[d]);
            let idx = gi % n;
            gi /= n;
            let hier = idx + if boundary[d] { 0 } else { 1 };
            hier as f64 / (1u64 << level[d]) as f64
        })
        .collect()
}

/// Multilinear interpolation on a gathered dense grid. Points outside the
/// stored index range (the virtual boundary of interior grids) contribute
/// zero.
pub fn interpolate_dense<E: CombiElement>(
    dense: &[E],
    level: &LevelVector,
    boundary: &[bool],
    x: &[f64],
) -> E {
    let dim = level.len();
    debug_assert_eq!(x.len(), dim);

    // cell base index and interpolation weight per dimension
    let mut base = vec![0u64; dim];
    let mut frac = vec![0f64; dim];
    for d in 0..dim {
        let n = (1u64 << level[d]) as f64;
        let scaled = x[d].clamp(0.0, 1.0) * n;
        if scaled >= n {
            base[d] = (n - 1.0) as u64;
            frac[d] = 1.0;
        } else {
            base[d] = scaled.floor() as u64;
            frac[d] = scaled - scaled.floor();
        }
    }

    let value_at = |hier: &[u64]| -> E {
        let mut gi = 0usize;
        let mut stride = 1usize;
        for d in 0..dim {
            let storage = if boundary[d] {
                hier[d] as i64
            } else {
                hier[d] as i64 - 1
            };
            let n = points_1d(level[d], boundary[d]);
            if storage < 0 || storage >= n as i64 {
                return E::default();
            }
            gi += storage as usize * stride;
            stride *= n;
        }
        dense[gi]
    };

    let mut acc = E::default();
    let mut corner = vec![0u64; dim];
    for c in 0..(1usize << dim) {
        let mut w = 1f64;
        for d in 0..dim {
            if (c >> d) & 1 == 1 {
                corner[d] = base[d] + 1;
                w *= frac[d];
            } else {
                corner[d] = base[d];
                w *= 1.0 - frac[d];
            }
        }
        acc += value_at(&corner).scale(w);
    }
    acc
}
