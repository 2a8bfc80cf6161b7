//! Per-rank grid checkpoints: raw element data plus a JSON header.
//!
//! A grid of `P` ranks produces `P` pairs `{base}_{rank}.raw` /
//! `{base}_{rank}.raw_header`. The header records everything needed to
//! reinterpret the raw bytes: level, boundary, decomposition, element type
//! and byte order.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::combi_error::CombiError;
use crate::element::{CombiElement, ElementKind};
use crate::grid::full::DistributedFullGrid;
use crate::scheme::LevelVector;

const CHECKPOINT_VERSION: u32 = 1;

/// Header written next to every `.raw` piece.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CheckpointHeader {
    pub version: u32,
    pub level: LevelVector,
    pub boundary: Vec<bool>,
    /// Per-dimension storage cut starts of the full decomposition.
    pub decomposition: Vec<Vec<u64>>,
    /// Cartesian coordinates of the rank that wrote this piece.
    pub cartesian_coords: Vec<usize>,
    pub element: ElementKind,
    /// Always "little"; recorded for forensic value.
    pub byte_order: String,
    pub num_elements: usize,
}

fn piece_paths(base: &str, rank: usize) -> (PathBuf, PathBuf) {
    (
        PathBuf::from(format!("{}_{}.raw", base, rank)),
        PathBuf::from(format!("{}_{}.raw_header", base, rank)),
    )
}

/// Write this rank's piece of the grid.
pub fn write_dfg_checkpoint<E: CombiElement>(
    dfg: &DistributedFullGrid<E>,
    base: &str,
    rank: usize,
) -> Result<PathBuf, CombiError> {
    let header = CheckpointHeader {
        version: CHECKPOINT_VERSION,
        level: dfg.level().clone(),
        boundary: dfg.boundary().to_vec(),
        decomposition: dfg
            .decomposition()
            .storage_cut_starts(dfg.level(), dfg.boundary()),
        cartesian_coords: dfg.cartesian_coords().to_vec(),
        element: E::KIND,
        byte_order: "little".into(),
        num_elements: dfg.nr_local_elements(),
    };
    let (raw_path, header_path) = piece_paths(base, rank);
    let mut raw = fs::File::create(&raw_path)?;
    raw.write_all(bytemuck::cast_slice(dfg.data()))?;
    fs::write(&header_path, serde_json::to_vec_pretty(&header)?)?;
    Ok(raw_path)
}

/// Read back one piece: header plus element data.
pub fn read_checkpoint_piece<E: CombiElement>(
    base: &str,
    rank: usize,
) -> Result<(CheckpointHeader, Vec<E>), CombiError> {
    let (raw_path, header_path) = piece_paths(base, rank);
    let header: CheckpointHeader = serde_json::from_slice(&fs::read(&header_path)?)?;
    if header.element != E::KIND {
        return Err(CombiError::Wire(format!(
            "checkpoint holds {:?} elements, requested {:?}",
            header.element,
            E::KIND
        )));
    }
    let bytes = fs::read(&raw_path)?;
    let expected = header.num_elements * std::mem::size_of::<E>();
    if bytes.len() != expected {
        return Err(CombiError::Wire(format!(
            "checkpoint piece {} holds {} bytes, header says {}",
            raw_path.display(),
            bytes.len(),
            expected
        )));
    }
    Ok((header, bytemuck::pod_collect_to_vec(&bytes)))
}

/// Remove the files of one piece, ignoring pieces that never existed.
pub fn remove_checkpoint_piece(base: &str, rank: usize) {
    let (raw_path, header_path) = piece_paths(base, rank);
    let _ = fs::remove_file(raw_path);
    let _ = fs::remove_file(header_path);
}

/// Helper for tests and tooling: does the pair exist?
pub fn checkpoint_piece_exists(base: &str, rank: usize) -> bool {
    let (raw_path, header_path) = piece_paths(base, rank);
    Path::new(&raw_path).exists() && Path::new(&header_path).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::DomainDecomposition;

    #[test]
    fn write_read_roundtrip() {
        let lvl = vec![2, 2];
        let dd = DomainDecomposition::uniform(&[1, 1], &lvl, false).unwrap();
        let mut g: DistributedFullGrid<f64> =
            DistributedFullGrid::new(lvl.clone(), vec![true, true], dd, 0).unwrap();
        g.fill_with(|x| x[0] - x[1]);

        let dir = std::env::temp_dir().join("combigrid_checkpoint_test");
        fs::create_dir_all(&dir).unwrap();
        let base = dir.join("piece").to_string_lossy().into_owned();

        write_dfg_checkpoint(&g, &base, 0).unwrap();
        assert!(checkpoint_piece_exists(&base, 0));
        let (header, data): (CheckpointHeader, Vec<f64>) =
            read_checkpoint_piece(&base, 0).unwrap();
        assert_eq!(header.level, lvl);
        assert_eq!(header.byte_order, "little");
        assert_eq!(data, g.data());

        remove_checkpoint_piece(&base, 0);
        assert!(!checkpoint_piece_exists(&base, 0));
    }

    #[test]
    fn element_kind_mismatch_is_rejected() {
        let lvl = vec![1, 1];
        let dd = DomainDecomposition::uniform(&[1, 1], &lvl, false).unwrap();
        let g: DistributedFullGrid<f64> =
            DistributedFullGrid::new(lvl, vec![true, true], dd, 0).unwrap();

        let dir = std::env::temp_dir().join("combigrid_checkpoint_kind_test");
        fs::create_dir_all(&dir).unwrap();
        let base = dir.join("piece").to_string_lossy().into_owned();
        write_dfg_checkpoint(&g, &base, 0).unwrap();
        let res: Result<(CheckpointHeader, Vec<num_complex::Complex64>), _> =
            read_checkpoint_piece(&base, 0);
        assert!(res.is_err());
        remove_checkpoint_piece(&base, 0);
    }
}
