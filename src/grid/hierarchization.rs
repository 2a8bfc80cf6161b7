//! Change of basis between nodal and hierarchical representations on a
//! distributed full grid.
//!
//! The transform factorises over dimensions. Along a dimension owned by a
//! single rank the poles (1-D lines) are transformed in place; along a
//! partitioned dimension the ranks sharing a pole exchange their blocks
//! first, transform complete lines, and keep their own segment.

use crate::combi_error::CombiError;
use crate::comm::collectives;
use crate::comm::communicator::{CommTag, Communicator, SubComm};
use crate::element::CombiElement;
use crate::grid::full::DistributedFullGrid;
use crate::scheme::LevelType;

#[derive(Copy, Clone, PartialEq, Eq)]
enum Direction {
    Nodal2Hier,
    Hier2Nodal,
}

/// Nodal → hierarchical, in place.
pub fn hierarchize<E: CombiElement, C: Communicator>(
    dfg: &mut DistributedFullGrid<E>,
    lcomm: &SubComm<C>,
    pole_tag: impl Fn(usize) -> CommTag,
) -> Result<(), CombiError> {
    for d in 0..dfg.dim() {
        transform_dim(dfg, d, lcomm, pole_tag(d), Direction::Nodal2Hier)?;
    }
    Ok(())
}

/// Hierarchical → nodal, in place.
pub fn dehierarchize<E: CombiElement, C: Communicator>(
    dfg: &mut DistributedFullGrid<E>,
    lcomm: &SubComm<C>,
    pole_tag: impl Fn(usize) -> CommTag,
) -> Result<(), CombiError> {
    for d in (0..dfg.dim()).rev() {
        transform_dim(dfg, d, lcomm, pole_tag(d), Direction::Hier2Nodal)?;
    }
    Ok(())
}

/// Hierarchise a 1-D pole covering hierarchical indices `0..=2^level`.
/// Finer levels first, so parent values are still nodal when a surplus is
/// taken.
fn hierarchize_line<E: CombiElement>(u: &mut [E], level: LevelType) {
    let n = 1usize << level;
    debug_assert_eq!(u.len(), n + 1);
    for lev in (1..=level).rev() {
        let h = 1usize << (level - lev);
        let mut i = h;
        while i < n {
            u[i] = u[i] - (u[i - h] + u[i + h]).scale(0.5);
            i += 2 * h;
        }
    }
}

/// Inverse of [`hierarchize_line`]: coarse levels first.
fn dehierarchize_line<E: CombiElement>(u: &mut [E], level: LevelType) {
    let n = 1usize << level;
    debug_assert_eq!(u.len(), n + 1);
    for lev in 1..=level {
        let h = 1usize << (level - lev);
        let mut i = h;
        while i < n {
            u[i] = u[i] + (u[i - h] + u[i + h]).scale(0.5);
            i += 2 * h;
        }
    }
}

#[inline]
fn linear_index(idx: &[usize], shape: &[usize]) -> usize {
    let mut li = 0usize;
    for d in (0..idx.len()).rev() {
        li = li * shape[d] + idx[d];
    }
    li
}

fn transform_dim<E: CombiElement, C: Communicator>(
    dfg: &mut DistributedFullGrid<E>,
    d: usize,
    lcomm: &SubComm<C>,
    tag: CommTag,
    dir: Direction,
) -> Result<(), CombiError> {
    let dim = dfg.dim();
    let level_d = dfg.level()[d];
    let boundary_d = dfg.boundary()[d];
    let p_d = dfg.decomposition().parallelization()[d];
    let shape = dfg.local_shape().to_vec();
    let hier_offset = if boundary_d { 0usize } else { 1usize };

    // Blocks of every rank on my pole, in slab order, plus their storage
    // ranges along `d`. Serial dimension: just my own block.
    let decomp = dfg.decomposition().clone();
    let (blocks, ranges, peer_shapes) = if p_d == 1 {
        let (lo, hi) = decomp.storage_range(d, 0, level_d, boundary_d);
        (vec![dfg.data().to_vec()], vec![(lo, hi)], vec![shape.clone()])
    } else {
        let my_coords = dfg.cartesian_coords().to_vec();
        let members: Vec<usize> = (0..p_d)
            .map(|k| {
                let mut c = my_coords.clone();
                c[d] = k;
                decomp.rank_of_coords(&c)
            })
            .collect();
        let pole = lcomm.subset(&members, tag).ok_or_else(|| {
            CombiError::comm(lcomm.rank(), "rank missing from its own pole communicator")
        })?;
        let blocks = collectives::allgatherv(&pole, CommTag(0), dfg.data())?;
        let ranges: Vec<(usize, usize)> = (0..p_d)
            .map(|k| decomp.storage_range(d, k, level_d, boundary_d))
            .collect();
        let peer_shapes: Vec<Vec<usize>> = ranges
            .iter()
            .map(|&(a, b)| {
                let mut s = shape.clone();
                s[d] = b - a;
                s
            })
            .collect();
        (blocks, ranges, peer_shapes)
    };

    // Iterate my lines along `d`: every local index tuple with idx[d] = 0.
    let my_lo = ranges[if p_d == 1 { 0 } else { dfg.cartesian_coords()[d] }].0;
    let n_full = 1usize << level_d;
    let mut line = vec![E::default(); n_full + 1];
    let mut idx = vec![0usize; dim];
    loop {
        // assemble the complete pole from the blocks
        for v in line.iter_mut() {
            *v = E::default();
        }
        for (k, block) in blocks.iter().enumerate() {
            let (plo, phi) = ranges[k];
            let pshape = &peer_shapes[k];
            let mut pidx = idx.clone();
            for s in plo..phi {
                pidx[d] = s - plo;
                line[s + hier_offset] = block[linear_index(&pidx, pshape)];
            }
        }

        match dir {
            Direction::Nodal2Hier => hierarchize_line(&mut line, level_d),
            Direction::Hier2Nodal => dehierarchize_line(&mut line, level_d),
        }

        // keep my segment
        let mut widx = idx.clone();
        for s in 0..shape[d] {
            widx[d] = s;
            let li = dfg.local_linear_index(&widx);
            dfg.data_mut()[li] = line[my_lo + s + hier_offset];
        }

        // odometer over the other dimensions
        let mut carried = true;
        for e in 0..dim {
            if e == d {
                continue;
            }
            idx[e] += 1;
            if idx[e] < shape[e] {
                carried = false;
                break;
            }
            idx[e] = 0;
        }
        if carried {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::DomainDecomposition;
    use std::sync::Arc;

    fn serial_comm() -> SubComm<crate::comm::communicator::RayonComm> {
        let world = Arc::new(crate::comm::communicator::RayonComm::new(0, 1));
        SubComm::split(&world, vec![0], CommTag(0x7600)).unwrap()
    }

    fn paraboloid(x: &[f64]) -> f64 {
        let sign = if x.len() % 2 == 1 { 1.0 } else { -1.0 };
        x.iter().fold(sign, |acc, &c| acc * c * (c - 1.0))
    }

    #[test]
    fn line_kernels_invert_each_other() {
        let mut u: Vec<f64> = (0..=8).map(|i| (i as f64 * 0.37).sin()).collect();
        let orig = u.clone();
        hierarchize_line(&mut u, 3);
        assert_ne!(u, orig);
        dehierarchize_line(&mut u, 3);
        for (a, b) in u.iter().zip(&orig) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn surplus_of_level_one_midpoint() {
        // u(0) = 1, u(1/2) = 4, u(1) = 3 -> surplus 4 - (1+3)/2 = 2
        let mut u = vec![1.0, 4.0, 3.0];
        hierarchize_line(&mut u, 1);
        assert_eq!(u, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn roundtrip_2d_boundary_and_interior() {
        for boundary in [true, false] {
            let lvl = vec![3, 4];
            let dd = DomainDecomposition::uniform(&[1, 1], &lvl, false).unwrap();
            let mut g: DistributedFullGrid<f64> =
                DistributedFullGrid::new(lvl, vec![boundary; 2], dd, 0).unwrap();
            g.fill_with(paraboloid);
            let nodal = g.data().to_vec();
            let comm = serial_comm();
            hierarchize(&mut g, &comm, |d| CommTag(0x7610 + d as u16 * 4)).unwrap();
            dehierarchize(&mut g, &comm, |d| CommTag(0x7610 + d as u16 * 4)).unwrap();
            for (a, b) in g.data().iter().zip(&nodal) {
                assert!((a - b).abs() < 1e-12, "boundary={}", boundary);
            }
        }
    }

    #[test]
    fn surpluses_agree_across_grid_levels() {
        // the hierarchical surplus of a shared subspace point only depends on
        // values at that point's ancestors, which every containing grid holds
        let comm = serial_comm();
        let mut grids = Vec::new();
        for lvl in [vec![2, 2], vec![3, 3], vec![3, 2]] {
            let dd = DomainDecomposition::uniform(&[1, 1], &lvl, false).unwrap();
            let mut g: DistributedFullGrid<f64> =
                DistributedFullGrid::new(lvl.clone(), vec![true, true], dd, 0).unwrap();
            g.fill_with(paraboloid);
            hierarchize(&mut g, &comm, |d| CommTag(0x7620 + d as u16 * 4)).unwrap();
            grids.push(g);
        }
        // point (0.5, 0.25) lives in subspace (1, 2), present in all three
        for g in &grids {
            let i0 = 1u64 << (g.level()[0] - 1);
            let i1 = 1u64 << (g.level()[1] - 2);
            let li = g.local_linear_index(&[
                g.local_idx_of_hier(0, i0).unwrap(),
                g.local_idx_of_hier(1, i1).unwrap(),
            ]);
            let reference = {
                let g0 = &grids[0];
                let li0 = g0.local_linear_index(&[
                    g0.local_idx_of_hier(0, 2).unwrap(),
                    g0.local_idx_of_hier(1, 1).unwrap(),
                ]);
                g0.data()[li0]
            };
            assert!((g.data()[li] - reference).abs() < 1e-12);
        }
    }

    #[test]
    fn complex_elements_roundtrip() {
        use num_complex::Complex64;
        let lvl = vec![3, 3];
        let dd = DomainDecomposition::uniform(&[1, 1], &lvl, false).unwrap();
        let mut g: DistributedFullGrid<Complex64> =
            DistributedFullGrid::new(lvl, vec![true, true], dd, 0).unwrap();
        g.fill_with(|x| Complex64::new(paraboloid(x), x[0] - x[1]));
        let nodal = g.data().to_vec();
        let comm = serial_comm();
        hierarchize(&mut g, &comm, |d| CommTag(0x7660 + d as u16 * 4)).unwrap();
        dehierarchize(&mut g, &comm, |d| CommTag(0x7660 + d as u16 * 4)).unwrap();
        for (a, b) in g.data().iter().zip(&nodal) {
            assert!((*a - *b).norm() < 1e-5);
        }
    }

    #[test]
    fn pole_exchange_matches_serial_transform() {
        // split dimension 0 over two ranks and compare against the serial result
        let lvl = vec![4, 3];
        let serial = {
            let dd = DomainDecomposition::uniform(&[1, 1], &lvl, false).unwrap();
            let mut g: DistributedFullGrid<f64> =
                DistributedFullGrid::new(lvl.clone(), vec![true, true], dd, 0).unwrap();
            g.fill_with(paraboloid);
            let comm = serial_comm();
            hierarchize(&mut g, &comm, |d| CommTag(0x7630 + d as u16 * 4)).unwrap();
            g
        };

        let lvl2 = lvl.clone();
        let handles: Vec<_> = (0..2)
            .map(|rank| {
                let lvl = lvl2.clone();
                std::thread::spawn(move || {
                    let world = Arc::new(crate::comm::communicator::RayonComm::new(rank, 2));
                    let lcomm = SubComm::split(&world, vec![0, 1], CommTag(0x7640)).unwrap();
                    let dd = DomainDecomposition::uniform(&[2, 1], &lvl, false).unwrap();
                    let mut g: DistributedFullGrid<f64> =
                        DistributedFullGrid::new(lvl, vec![true, true], dd, rank).unwrap();
                    g.fill_with(paraboloid);
                    hierarchize(&mut g, &lcomm, |d| CommTag(0x7650 + d as u16 * 4)).unwrap();
                    g
                })
            })
            .collect();
        let parts: Vec<DistributedFullGrid<f64>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        for g in &parts {
            for li in 0..g.nr_local_elements() {
                let idx = g.local_axis_indices(li);
                let h0 = g.hier_index(0, idx[0]);
                let h1 = g.hier_index(1, idx[1]);
                let sli = serial.local_linear_index(&[
                    serial.local_idx_of_hier(0, h0).unwrap(),
                    serial.local_idx_of_hier(1, h1).unwrap(),
                ]);
                assert!((g.data()[li] - serial.data()[sli]).abs() < 1e-12);
            }
        }
    }
}
