//! Decomposition of a combination scheme across the systems of a
//! third-level reduction, and the common-subspace set they share.

use crate::combi_error::CombiError;
use crate::scheme::{componentwise_max, dominates, CombiScheme, LevelType, LevelVector};

/// One system's share of a decomposed scheme plus the subspaces common to
/// every system's share.
#[derive(Clone, Debug)]
pub struct ThirdLevelScheme {
    pub part: CombiScheme,
    pub common_subspaces: Vec<LevelVector>,
}

/// Split `scheme` across `num_systems` systems and return the share of
/// `system_number` together with the common-subspace set.
///
/// With fewer than two systems no decomposition is performed: the share is
/// the whole scheme and nothing is common.
pub fn create_third_level_scheme(
    scheme: &CombiScheme,
    boundary: &[bool],
    system_number: usize,
    num_systems: usize,
) -> Result<ThirdLevelScheme, CombiError> {
    if scheme.is_empty() {
        return Err(CombiError::InvalidScheme(
            "cannot decompose an empty scheme".into(),
        ));
    }
    if num_systems < 2 {
        return Ok(ThirdLevelScheme {
            part: scheme.clone(),
            common_subspaces: Vec::new(),
        });
    }
    if system_number >= num_systems {
        return Err(CombiError::InvalidScheme(format!(
            "system number {} out of range for {} systems",
            system_number, num_systems
        )));
    }

    let parts = decompose_scheme(scheme, num_systems)?;
    let part_levels: Vec<&[LevelVector]> = parts.iter().map(|p| p.levels()).collect();
    let common_subspaces = common_subspaces(&part_levels, boundary);
    Ok(ThirdLevelScheme {
        part: parts[system_number].clone(),
        common_subspaces,
    })
}

/// Disjoint decomposition of the scheme into per-system parts whose union is
/// the input.
///
/// The current policy splits the ordered list at its midpoint: lower half to
/// system 0, upper half to system 1. A smarter partitioner minimising the
/// common-subspace volume may be substituted as long as the parts stay
/// disjoint and exhaustive. More than two systems is an open problem.
pub fn decompose_scheme(
    scheme: &CombiScheme,
    num_systems: usize,
) -> Result<Vec<CombiScheme>, CombiError> {
    if num_systems != 2 {
        return Err(CombiError::InvalidScheme(format!(
            "scheme decomposition is only defined for 2 systems, got {}",
            num_systems
        )));
    }
    if scheme.len() < 2 {
        return Err(CombiError::InvalidScheme(
            "need at least one grid per system to decompose".into(),
        ));
    }
    let mid = scheme.len() / 2;
    let lower = CombiScheme::from_parts(
        scheme.levels()[..mid].to_vec(),
        scheme.coeffs()[..mid].to_vec(),
    )?;
    let upper = CombiScheme::from_parts(
        scheme.levels()[mid..].to_vec(),
        scheme.coeffs()[mid..].to_vec(),
    )?;
    Ok(vec![lower, upper])
}

/// Subspaces shared by every part of a decomposed scheme, in deterministic
/// (ascending lexicographic) enumeration order.
///
/// Let `M[d]` be the smallest over parts of the largest level in dimension
/// `d`; every subspace `σ ≤ M` is a candidate, and it is retained iff each
/// part contains at least one grid dominating it.
pub fn common_subspaces(parts: &[&[LevelVector]], boundary: &[bool]) -> Vec<LevelVector> {
    debug_assert!(!parts.is_empty() && parts.iter().all(|p| !p.is_empty()));
    let dim = parts[0][0].len();

    let mut max_common = vec![LevelType::MAX; dim];
    for part in parts {
        let part_max = componentwise_max(part);
        for d in 0..dim {
            max_common[d] = max_common[d].min(part_max[d]);
        }
    }

    let candidates = crate::scheme::subspace_levels(&max_common, boundary);
    let shared = |sub: &LevelVector| {
        parts
            .iter()
            .all(|part| part.iter().any(|level| dominates(level, sub)))
    };
    // ordered collects keep the enumeration order, so both backends are
    // deterministic across systems
    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;
        candidates.into_par_iter().filter(|s| shared(s)).collect()
    }
    #[cfg(not(feature = "rayon"))]
    {
        candidates.into_iter().filter(|s| shared(s)).collect()
    }
}
