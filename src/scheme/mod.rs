//! Combination schemes: anisotropic level vectors and their coefficients.

pub mod file;
pub mod third_level;

use crate::combi_error::CombiError;

/// One resolution level along one dimension.
pub type LevelType = u32;

/// Ordered sequence of levels identifying one anisotropic resolution.
pub type LevelVector = Vec<LevelType>;

/// `a` dominates `b` componentwise.
#[inline]
pub fn dominates(a: &[LevelType], b: &[LevelType]) -> bool {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).all(|(x, y)| x >= y)
}

/// Componentwise maximum of a non-empty set of level vectors.
pub fn componentwise_max(levels: &[LevelVector]) -> LevelVector {
    debug_assert!(!levels.is_empty());
    let dim = levels[0].len();
    (0..dim)
        .map(|d| levels.iter().map(|l| l[d]).max().unwrap_or(0))
        .collect()
}

fn binomial(n: usize, k: usize) -> f64 {
    let mut acc = 1.0f64;
    for i in 0..k {
        acc = acc * (n - i) as f64 / (i + 1) as f64;
    }
    acc
}

/// Enumerate all non-negative integer vectors of length `dim` with the given
/// component sum, in ascending lexicographic order.
fn enumerate_with_sum(dim: usize, total: LevelType) -> Vec<LevelVector> {
    fn rec(dim: usize, total: LevelType, prefix: &mut LevelVector, out: &mut Vec<LevelVector>) {
        if dim == 1 {
            prefix.push(total);
            out.push(prefix.clone());
            prefix.pop();
            return;
        }
        for x in 0..=total {
            prefix.push(x);
            rec(dim - 1, total - x, prefix, out);
            prefix.pop();
        }
    }
    let mut out = Vec::new();
    rec(dim, total, &mut Vec::with_capacity(dim), &mut out);
    out
}

/// All subspace level vectors between the boundary-dependent minimum and
/// `max` componentwise, ascending lexicographically. Dimensions with
/// boundary start at level 0 (the two boundary points); interior dimensions
/// start at level 1. This is the subspace set of a full tensor sparse grid
/// at level `max`.
pub fn subspace_levels(max: &[LevelType], boundary: &[bool]) -> Vec<LevelVector> {
    fn rec(
        max: &[LevelType],
        boundary: &[bool],
        d: usize,
        current: &mut LevelVector,
        out: &mut Vec<LevelVector>,
    ) {
        if d == max.len() {
            out.push(current.clone());
            return;
        }
        let lo = if boundary[d] { 0 } else { 1 };
        for l in lo..=max[d] {
            current.push(l);
            rec(max, boundary, d + 1, current, out);
            current.pop();
        }
    }
    let mut out = Vec::new();
    rec(max, boundary, 0, &mut Vec::with_capacity(max.len()), &mut out);
    out
}

/// A finite list of (level vector, coefficient) pairs.
///
/// Invariant for classical schemes: the coefficients of all grids containing
/// any fixed subspace sum to one, which is what makes the hierarchical
/// combination reproduce interpolants exactly.
#[derive(Clone, Debug, PartialEq)]
pub struct CombiScheme {
    levels: Vec<LevelVector>,
    coeffs: Vec<f64>,
}

impl CombiScheme {
    /// The classical combination scheme between `lmin` and `lmax`.
    ///
    /// Requires `lmax - lmin` to be the same in every dimension. Grids on
    /// diagonal `q` carry coefficient `(-1)^q * C(d-1, q)`.
    pub fn classical(lmin: &LevelVector, lmax: &LevelVector) -> Result<Self, CombiError> {
        let dim = lmin.len();
        if dim == 0 || lmax.len() != dim {
            return Err(CombiError::InvalidScheme(
                "lmin and lmax must be non-empty and of equal dimension".into(),
            ));
        }
        if !dominates(lmax, lmin) {
            return Err(CombiError::InvalidScheme(format!(
                "lmax {:?} does not dominate lmin {:?}",
                lmax, lmin
            )));
        }
        if lmin.iter().any(|&l| l == 0) {
            return Err(CombiError::InvalidScheme(
                "minimum levels must be positive".into(),
            ));
        }
        let diff = lmax[0] - lmin[0];
        if (0..dim).any(|d| lmax[d] - lmin[d] != diff) {
            return Err(CombiError::InvalidScheme(format!(
                "classical scheme needs a uniform level difference, got lmin {:?} lmax {:?}",
                lmin, lmax
            )));
        }

        let mut levels = Vec::new();
        let mut coeffs = Vec::new();
        let qmax = (dim as LevelType - 1).min(diff);
        for q in 0..=qmax {
            let sign = if q % 2 == 0 { 1.0 } else { -1.0 };
            let coeff = sign * binomial(dim - 1, q as usize);
            for delta in enumerate_with_sum(dim, diff - q) {
                let level: LevelVector = lmin.iter().zip(&delta).map(|(&a, &b)| a + b).collect();
                levels.push(level);
                coeffs.push(coeff);
            }
        }
        Ok(Self { levels, coeffs })
    }

    /// Build a scheme from explicit parts, e.g. a scheme file or one system's
    /// share of a decomposed scheme.
    pub fn from_parts(levels: Vec<LevelVector>, coeffs: Vec<f64>) -> Result<Self, CombiError> {
        if levels.is_empty() || levels.len() != coeffs.len() {
            return Err(CombiError::InvalidScheme(format!(
                "{} levels but {} coefficients",
                levels.len(),
                coeffs.len()
            )));
        }
        let dim = levels[0].len();
        if dim == 0 || levels.iter().any(|l| l.len() != dim) {
            return Err(CombiError::InvalidScheme(
                "level vectors must share a positive dimension".into(),
            ));
        }
        Ok(Self { levels, coeffs })
    }

    pub fn dim(&self) -> usize {
        self.levels[0].len()
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn levels(&self) -> &[LevelVector] {
        &self.levels
    }

    pub fn coeffs(&self) -> &[f64] {
        &self.coeffs
    }

    /// Componentwise maximum over all grids in the scheme.
    pub fn max_level(&self) -> LevelVector {
        componentwise_max(&self.levels)
    }

    /// Sum of the coefficients of all grids dominating `subspace`. Equals one
    /// for every subspace of a valid (classical) scheme.
    pub fn coefficient_sum_over(&self, subspace: &[LevelType]) -> f64 {
        self.levels
            .iter()
            .zip(&self.coeffs)
            .filter(|(l, _)| dominates(l, subspace))
            .map(|(_, &c)| c)
            .sum()
    }
}
