//! Payload encodings for signals that carry more than a frame. Shared by
//! the manager (encoder) and the workers (decoder).

use crate::combi_error::CombiError;
use crate::comm::wire::{WireReader, WireWriter};
use crate::scheme::LevelVector;

pub fn encode_common_levels(common: &[LevelVector]) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.put_u64(common.len() as u64);
    for level in common {
        w.put_u32_seq(level);
    }
    w.finish()
}

pub fn decode_common_levels(bytes: &[u8]) -> Result<Vec<LevelVector>, CombiError> {
    let mut r = WireReader::new(bytes);
    let n = r.get_u64("common subspace count")? as usize;
    (0..n).map(|_| r.get_u32_seq("common subspace")).collect()
}

/// Common subspace list plus one unified size row per local rank
/// (`num_grids * |common|` entries each).
pub fn encode_size_update(common: &[LevelVector], rows: &[Vec<u64>]) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.put_bytes(&encode_common_levels(common));
    w.put_u64(rows.len() as u64);
    for row in rows {
        w.put_u64_seq(row);
    }
    w.finish()
}

#[allow(clippy::type_complexity)]
pub fn decode_size_update(bytes: &[u8]) -> Result<(Vec<LevelVector>, Vec<Vec<u64>>), CombiError> {
    let mut r = WireReader::new(bytes);
    let common = decode_common_levels(r.get_bytes("common subspace block")?)?;
    let nrows = r.get_u64("size row count")? as usize;
    let rows = (0..nrows)
        .map(|_| r.get_u64_seq("size row"))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((common, rows))
}

pub fn encode_leval(leval: &LevelVector) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.put_u32_seq(leval);
    w.finish()
}

pub fn decode_leval(bytes: &[u8]) -> Result<LevelVector, CombiError> {
    WireReader::new(bytes).get_u32_seq("evaluation level")
}

pub fn encode_parallel_eval(leval: &LevelVector, path: &str) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.put_u32_seq(leval);
    w.put_str(path);
    w.finish()
}

pub fn decode_parallel_eval(bytes: &[u8]) -> Result<(LevelVector, String), CombiError> {
    let mut r = WireReader::new(bytes);
    let leval = r.get_u32_seq("evaluation level")?;
    let path = r.get_str("checkpoint path")?;
    Ok((leval, path))
}

pub fn encode_coords(coords: &[Vec<f64>]) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.put_u64(coords.len() as u64);
    let dim = coords.first().map_or(0, |c| c.len());
    w.put_u64(dim as u64);
    for c in coords {
        for &x in c {
            w.put_f64(x);
        }
    }
    w.finish()
}

pub fn decode_coords(bytes: &[u8]) -> Result<Vec<Vec<f64>>, CombiError> {
    let mut r = WireReader::new(bytes);
    let n = r.get_u64("coordinate count")? as usize;
    let dim = r.get_u64("coordinate dimension")? as usize;
    (0..n)
        .map(|_| (0..dim).map(|_| r.get_f64("coordinate")).collect())
        .collect()
}
