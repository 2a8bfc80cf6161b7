//! Scalar element types stored in component and sparse grids.
//!
//! The engine is generic over the grid element: real runs use `f64`,
//! applications that combine in frequency space use `Complex64`. Both are
//! `bytemuck::Pod` so grid buffers can be reinterpreted as bytes for
//! communicator and relay transfers without copies.

use std::fmt::Debug;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use num_complex::Complex64;
use serde::{Deserialize, Serialize};

/// Element kind carried in wire headers and checkpoint metadata.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementKind {
    /// 8-byte IEEE754 real.
    Real,
    /// 16-byte complex (two IEEE754 reals).
    Complex,
}

impl ElementKind {
    /// Stable wire code for this kind.
    pub const fn wire_code(self) -> u16 {
        match self {
            ElementKind::Real => 1,
            ElementKind::Complex => 2,
        }
    }

    pub fn from_wire_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(ElementKind::Real),
            2 => Some(ElementKind::Complex),
            _ => None,
        }
    }
}

/// Grid element scalar.
///
/// Implementors must be plain-old-data; every buffer of elements may cross a
/// communicator or the third-level relay as raw little-endian bytes.
pub trait CombiElement:
    bytemuck::Pod
    + Send
    + Sync
    + Default
    + PartialEq
    + Debug
    + Add<Output = Self>
    + AddAssign
    + Sub<Output = Self>
    + SubAssign
    + 'static
{
    /// Which kind this element is, for wire headers.
    const KIND: ElementKind;

    /// Lift a real number into the element type.
    fn from_real(x: f64) -> Self;

    /// Multiply by a real scalar (combination coefficients are real).
    fn scale(self, c: f64) -> Self;

    /// Modulus, used by norms and test tolerances.
    fn modulus(self) -> f64;
}

impl CombiElement for f64 {
    const KIND: ElementKind = ElementKind::Real;

    #[inline]
    fn from_real(x: f64) -> Self {
        x
    }

    #[inline]
    fn scale(self, c: f64) -> Self {
        self * c
    }

    #[inline]
    fn modulus(self) -> f64 {
        self.abs()
    }
}

impl CombiElement for Complex64 {
    const KIND: ElementKind = ElementKind::Complex;

    #[inline]
    fn from_real(x: f64) -> Self {
        Complex64::new(x, 0.0)
    }

    #[inline]
    fn scale(self, c: f64) -> Self {
        Complex64::new(self.re * c, self.im * c)
    }

    #[inline]
    fn modulus(self) -> f64 {
        self.norm()
    }
}
