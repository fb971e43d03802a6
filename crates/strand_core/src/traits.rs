use anyhow::Result;
use nalgebra::{ComplexField, DMatrix, DVector};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::EndgameError;
use crate::precision::Precision;

/// A complex scalar usable as the ambient numeric context of an endgame.
///
/// Values carry their own working precision. Fixed-width types report a
/// constant and ignore raises; an arbitrary-precision context widens its
/// mantissa in place. All conversions from `f64` configuration values go
/// through this trait so a wide context controls how constants are built.
pub trait NumericScalar: ComplexField {
    /// Precision, in bits of mantissa, of this particular value.
    fn precision(&self) -> Precision;

    /// Promote this value to `prec`. Never narrows.
    fn raise_precision(&mut self, prec: Precision);

    /// Build a real-field value from an `f64` at the given precision.
    fn real_from_f64(value: f64, prec: Precision) -> Self::RealField;

    /// Lossy read-out of a real-field value, for logging and `f64` bounds.
    fn real_to_f64(value: &Self::RealField) -> f64;

    /// `radius * e^(i * angle)` at the given precision.
    fn from_polar(radius: &Self::RealField, angle: &Self::RealField, prec: Precision) -> Self;

    /// The full angle `2 * pi` at the given precision.
    fn two_pi(prec: Precision) -> Self::RealField;

    /// A sample with real and imaginary parts uniform in `[-1, 1]`.
    fn sample_unit<R: Rng + ?Sized>(rng: &mut R, prec: Precision) -> Self;
}

impl NumericScalar for num_complex::Complex<f64> {
    fn precision(&self) -> Precision {
        Precision::DOUBLE
    }

    fn raise_precision(&mut self, _prec: Precision) {}

    fn real_from_f64(value: f64, _prec: Precision) -> f64 {
        value
    }

    fn real_to_f64(value: &f64) -> f64 {
        *value
    }

    fn from_polar(radius: &f64, angle: &f64, _prec: Precision) -> Self {
        num_complex::Complex::from_polar(*radius, *angle)
    }

    fn two_pi(_prec: Precision) -> f64 {
        std::f64::consts::TAU
    }

    fn sample_unit<R: Rng + ?Sized>(rng: &mut R, _prec: Precision) -> Self {
        num_complex::Complex::new(rng.random_range(-1.0..=1.0), rng.random_range(-1.0..=1.0))
    }
}

/// A-priori bounds on the homotopy used by adaptive-precision trackers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AmpBounds {
    /// Upper bound on the degree of any function in the homotopy.
    pub degree_bound: u32,
    /// Upper bound on the magnitude of any coefficient.
    pub coefficient_bound: f64,
}

/// The homogenized, patched homotopy whose paths are being finished.
///
/// The working precision is per-system state; endgames synchronize it before
/// any cross-sample linear algebra rather than relying on a process global.
pub trait HomotopySystem<C: NumericScalar> {
    /// Number of variables, including homogenizing coordinates.
    fn num_variables(&self) -> usize;

    /// The Jacobian of the homotopy at `(x, t)`.
    fn jacobian(&self, x: &DVector<C>, t: &C) -> DMatrix<C>;

    /// The partial derivative of the homotopy with respect to the path
    /// variable at `(x, t)`.
    fn time_derivative(&self, x: &DVector<C>, t: &C) -> DVector<C>;

    /// Map a point from projective back to affine coordinates. Fails when a
    /// homogenizing coordinate is zero, i.e. the point lies at infinity.
    fn dehomogenize_point(&self, x: &DVector<C>) -> Result<DVector<C>>;

    /// The system's current working precision.
    fn precision(&self) -> Precision;

    /// Set the system's working precision.
    fn set_precision(&mut self, prec: Precision);
}

/// The predictor-corrector tracker an endgame drives between sample times.
pub trait PathTracker<C: NumericScalar> {
    type System: HomotopySystem<C>;

    fn system(&self) -> &Self::System;

    fn system_mut(&mut self) -> &mut Self::System;

    /// Track the solution from `from_time` to `to_time`, starting at `start`.
    fn track_path(
        &mut self,
        from_time: &C,
        to_time: &C,
        start: &DVector<C>,
    ) -> Result<DVector<C>, EndgameError>;

    /// Newton-refine `sample` at `time` to the given tolerance.
    fn refine(
        &mut self,
        sample: &DVector<C>,
        time: &C,
        tolerance: f64,
        max_iterations: usize,
    ) -> Result<DVector<C>, EndgameError>;

    /// AMP invariants of the homotopy, when adaptive precision is active.
    fn amp_bounds(&self) -> Option<AmpBounds> {
        None
    }
}
