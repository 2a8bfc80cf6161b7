//! Uniform distributed sparse grid: the hierarchical subspaces shared by a
//! process group, partitioned with the same coordinate cuts as the
//! component grids so all transfers stay rank-local.

use hashbrown::HashMap;

use crate::combi_error::CombiError;
use crate::element::CombiElement;
use crate::grid::full::DistributedFullGrid;
use crate::grid::DomainDecomposition;
use crate::scheme::{dominates, subspace_levels, LevelVector};

/// One hierarchical subspace: its level, the local element count on this
/// rank, and the offset into the flat buffer once allocated.
#[derive(Clone, Debug)]
pub struct SubspaceEntry {
    pub level: LevelVector,
    pub size: usize,
    pub offset: usize,
}

/// Write mode for incoming subspace payloads.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WriteMode {
    /// Overwrite with the incoming, already-reduced data.
    Assign,
    /// Accumulate the incoming data onto the local data.
    Accumulate,
}

/// The union of hierarchical subspaces used by one process group.
///
/// The subspace table enumerates every level vector up to the reference
/// maximum in ascending lexicographic order; this order is identical on
/// every rank, group, and system, which is what makes the flat buffer
/// all-reducible and the common-subspace slices comparable across systems.
pub struct DistributedSparseGridUniform<E: CombiElement> {
    boundary: Vec<bool>,
    decomp: DomainDecomposition,
    my_coords: Vec<usize>,
    subspaces: Vec<SubspaceEntry>,
    index: HashMap<LevelVector, usize>,
    data: Vec<E>,
    allocated: bool,
}

impl<E: CombiElement> DistributedSparseGridUniform<E> {
    /// Create the subspace table for reference level `lmax`; all sizes start
    /// at zero until grids are registered and sizes are unified.
    pub fn new(
        lmax: &LevelVector,
        boundary: Vec<bool>,
        decomp: DomainDecomposition,
        local_rank: usize,
    ) -> Result<Self, CombiError> {
        if lmax.len() != boundary.len() || lmax.len() != decomp.dim() {
            return Err(CombiError::InvalidConfig(
                "sparse grid level, boundary and decomposition dimensions disagree".into(),
            ));
        }
        let my_coords = decomp.coords_of_rank(local_rank);
        let levels = subspace_levels(lmax, &boundary);
        let mut index = HashMap::with_capacity(levels.len());
        let subspaces: Vec<SubspaceEntry> = levels
            .into_iter()
            .enumerate()
            .map(|(i, level)| {
                index.insert(level.clone(), i);
                SubspaceEntry {
                    level,
                    size: 0,
                    offset: 0,
                }
            })
            .collect();
        Ok(Self {
            boundary,
            decomp,
            my_coords,
            subspaces,
            index,
            data: Vec::new(),
            allocated: false,
        })
    }

    pub fn dim(&self) -> usize {
        self.boundary.len()
    }

    pub fn num_subspaces(&self) -> usize {
        self.subspaces.len()
    }

    pub fn subspace(&self, i: usize) -> &SubspaceEntry {
        &self.subspaces[i]
    }

    pub fn index_of(&self, level: &LevelVector) -> Option<usize> {
        self.index.get(level).copied()
    }

    /// Total local element count.
    pub fn size(&self) -> usize {
        self.subspaces.iter().map(|s| s.size).sum()
    }

    pub fn is_allocated(&self) -> bool {
        self.allocated
    }

    /// Per-dimension local point indices of a subspace on this rank.
    fn local_axes(&self, level: &LevelVector) -> Vec<Vec<u64>> {
        (0..self.dim())
            .map(|d| {
                self.decomp
                    .local_subspace_indices(d, self.my_coords[d], level[d])
            })
            .collect()
    }

    /// The geometric local size of a subspace on this rank.
    fn local_size(&self, level: &LevelVector) -> usize {
        self.local_axes(level).iter().map(|a| a.len()).product()
    }

    /// Record that a component grid of this level contributes here: every
    /// dominated subspace gets its geometric local size.
    pub fn register_level(&mut self, level: &LevelVector) {
        for i in 0..self.subspaces.len() {
            if self.subspaces[i].size == 0 && dominates(level, &self.subspaces[i].level) {
                self.subspaces[i].size = self.local_size(&self.subspaces[i].level);
            }
        }
        self.allocated = false;
    }

    pub fn subspace_data_sizes(&self) -> Vec<u64> {
        self.subspaces.iter().map(|s| s.size as u64).collect()
    }

    pub fn set_subspace_data_sizes(&mut self, sizes: &[u64]) -> Result<(), CombiError> {
        if sizes.len() != self.subspaces.len() {
            return Err(CombiError::ThirdLevelLayout(format!(
                "{} subspace sizes for a table of {}",
                sizes.len(),
                self.subspaces.len()
            )));
        }
        for (entry, &size) in self.subspaces.iter_mut().zip(sizes) {
            entry.size = size as usize;
        }
        self.allocated = false;
        Ok(())
    }

    /// Overwrite one subspace's local size (third-level size unification).
    pub fn set_subspace_size(&mut self, i: usize, size: u64) {
        self.subspaces[i].size = size as usize;
        self.allocated = false;
    }

    /// Lay out and zero the flat buffer.
    pub fn allocate(&mut self) {
        let mut offset = 0usize;
        for entry in &mut self.subspaces {
            entry.offset = offset;
            offset += entry.size;
        }
        self.data = vec![E::default(); offset];
        self.allocated = true;
    }

    /// Zero all subspace data, allocating on first use.
    pub fn zero(&mut self) {
        if !self.allocated {
            self.allocate();
        } else {
            self.data.fill(E::default());
        }
    }

    pub fn deallocate(&mut self) {
        self.data = Vec::new();
        self.allocated = false;
    }

    pub fn flat_data(&self) -> &[E] {
        &self.data
    }

    pub fn flat_data_mut(&mut self) -> &mut [E] {
        &mut self.data
    }

    pub fn subspace_data(&self, i: usize) -> &[E] {
        let s = &self.subspaces[i];
        &self.data[s.offset..s.offset + s.size]
    }

    pub fn subspace_data_mut(&mut self, i: usize) -> &mut [E] {
        let s = &self.subspaces[i];
        let (offset, size) = (s.offset, s.size);
        &mut self.data[offset..offset + size]
    }

    /// Local sizes of a subspace selection, in selection order.
    pub fn sizes_of(&self, selection: &[usize]) -> Vec<u64> {
        selection
            .iter()
            .map(|&i| self.subspaces[i].size as u64)
            .collect()
    }

    /// Concatenated local data of a subspace selection, in selection order.
    pub fn concat_subspaces(&self, selection: &[usize]) -> Vec<E> {
        let mut out = Vec::with_capacity(selection.iter().map(|&i| self.subspaces[i].size).sum());
        for &i in selection {
            out.extend_from_slice(self.subspace_data(i));
        }
        out
    }

    /// Write a concatenated payload back into a subspace selection.
    pub fn write_subspaces(
        &mut self,
        selection: &[usize],
        payload: &[E],
        mode: WriteMode,
    ) -> Result<(), CombiError> {
        let expected: usize = selection.iter().map(|&i| self.subspaces[i].size).sum();
        if payload.len() != expected {
            return Err(CombiError::ThirdLevelLayout(format!(
                "subspace payload holds {} elements, selection needs {}",
                payload.len(),
                expected
            )));
        }
        let mut cursor = 0usize;
        for &i in selection {
            let dst = self.subspace_data_mut(i);
            let src = &payload[cursor..cursor + dst.len()];
            cursor += dst.len();
            match mode {
                WriteMode::Assign => dst.copy_from_slice(src),
                WriteMode::Accumulate => {
                    for (d, &s) in dst.iter_mut().zip(src) {
                        *d += s;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Scatter a hierarchised component grid into the sparse grid, weighted by
/// its combination coefficient. Subspaces beyond the sparse grid's reference
/// level stay on the component grid untouched.
pub fn add_full_grid_to_sparse_grid<E: CombiElement>(
    dfg: &DistributedFullGrid<E>,
    coeff: f64,
    dsg: &mut DistributedSparseGridUniform<E>,
) -> Result<(), CombiError> {
    transfer(dfg, dsg, |dfg_value, dsg_value| {
        *dsg_value += dfg_value.scale(coeff);
    })
}

/// Overwrite a component grid's hierarchical data from the (combined)
/// sparse grid.
pub fn extract_full_grid_from_sparse_grid<E: CombiElement>(
    dsg: &DistributedSparseGridUniform<E>,
    dfg: &mut DistributedFullGrid<E>,
) -> Result<(), CombiError> {
    // mirror of the scatter: iterate identically, copy the other way
    let dim = dfg.dim();
    for si in 0..dsg.num_subspaces() {
        if !dominates(dfg.level(), &dsg.subspaces[si].level) || dsg.subspaces[si].size == 0 {
            continue;
        }
        let level = dsg.subspaces[si].level.clone();
        let axes = dsg.local_axes(&level);
        let src = dsg.subspace_data(si);
        let mut k = 0usize;
        for_each_point(&axes, dim, |point| {
            let li = dfg_linear_index(dfg, &level, point);
            dfg.data_mut()[li] = src[k];
            k += 1;
        });
        debug_assert_eq!(k, dsg.subspaces[si].size);
    }
    Ok(())
}

fn transfer<E: CombiElement>(
    dfg: &DistributedFullGrid<E>,
    dsg: &mut DistributedSparseGridUniform<E>,
    mut apply: impl FnMut(E, &mut E),
) -> Result<(), CombiError> {
    if !dsg.is_allocated() {
        return Err(CombiError::SignalOrder {
            signal: crate::manager::signals::Signal::Combine,
            reason: "sparse grid not allocated; INIT_DSGUS must run first".into(),
        });
    }
    let dim = dfg.dim();
    for si in 0..dsg.num_subspaces() {
        if !dominates(dfg.level(), &dsg.subspaces[si].level) || dsg.subspaces[si].size == 0 {
            continue;
        }
        let level = dsg.subspaces[si].level.clone();
        let axes = dsg.local_axes(&level);
        let expected = dsg.subspaces[si].size;
        let dst_offset = dsg.subspaces[si].offset;
        let mut k = 0usize;
        for_each_point(&axes, dim, |point| {
            let li = dfg_linear_index(dfg, &level, point);
            apply(dfg.data()[li], &mut dsg.data[dst_offset + k]);
            k += 1;
        });
        if k != expected {
            return Err(CombiError::ThirdLevelLayout(format!(
                "subspace {:?} holds {} local points but {} were transferred",
                level, expected, k
            )));
        }
    }
    Ok(())
}

/// Iterate the Cartesian product of per-dimension subspace indices, with
/// dimension 0 fastest: the fixed enumeration order of subspace payloads.
fn for_each_point(axes: &[Vec<u64>], dim: usize, mut visit: impl FnMut(&[u64])) {
    if axes.iter().any(|a| a.is_empty()) {
        return;
    }
    let mut pos = vec![0usize; dim];
    let mut point = vec![0u64; dim];
    loop {
        for d in 0..dim {
            point[d] = axes[d][pos[d]];
        }
        visit(&point);
        let mut carried = true;
        for d in 0..dim {
            pos[d] += 1;
            if pos[d] < axes[d].len() {
                carried = false;
                break;
            }
            pos[d] = 0;
        }
        if carried {
            break;
        }
    }
}

/// Local linear index in `dfg` of a subspace point given by its per-level
/// indices. The coordinate cuts are shared, so a locally owned subspace
/// point is always locally owned by every containing component grid.
fn dfg_linear_index<E: CombiElement>(
    dfg: &DistributedFullGrid<E>,
    sub_level: &LevelVector,
    point: &[u64],
) -> usize {
    let dim = dfg.dim();
    let mut idx = vec![0usize; dim];
    for d in 0..dim {
        let hier = if sub_level[d] == 0 {
            point[d] << dfg.level()[d]
        } else {
            point[d] << (dfg.level()[d] - sub_level[d])
        };
        idx[d] = dfg
            .local_idx_of_hier(d, hier)
            .expect("subspace point must be local to the containing grid");
    }
    dfg.local_linear_index(&idx)
}
