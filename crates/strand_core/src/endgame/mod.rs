pub mod cauchy;
pub mod power_series;

pub use cauchy::CauchyEndgame;
pub use power_series::PowerSeriesEndgame;

use nalgebra::DVector;
use num_traits::Zero;
use tracing::trace;

use crate::error::EndgameError;
use crate::history::{vector_precision, SampleHistory};
use crate::precision::Precision;
use crate::settings::EndgameSettings;
use crate::traits::{HomotopySystem, NumericScalar, PathTracker};

/// Contract every endgame exposes to the orchestrating solve loop.
pub trait Endgame<C: NumericScalar> {
    /// Finish one path from `(start_time, start_point)` toward the target
    /// time at the origin. Fails with `DimensionMismatch` when the point's
    /// dimension disagrees with the system's variable count; tracker failure
    /// codes are surfaced unmodified.
    fn run(&mut self, start_time: &C, start_point: &DVector<C>) -> Result<(), EndgameError>;

    /// The last accepted extrapolation at the target time. `None` before a
    /// run has produced one.
    fn final_approximation(&self) -> Option<&DVector<C>>;

    /// The latest branch-multiplicity estimate. `None` before the first
    /// extrapolation attempt.
    fn cycle_number(&self) -> Option<usize>;
}

/// Collect the initial window of samples by repeatedly shrinking the time by
/// `sample_factor` and tracking to it, ending with `num_sample_points`
/// entries. The start pair is entry zero.
pub(crate) fn collect_initial_samples<C, T>(
    tracker: &mut T,
    settings: &EndgameSettings,
    history: &mut SampleHistory<C>,
    start_time: &C,
    start_point: &DVector<C>,
) -> Result<(), EndgameError>
where
    C: NumericScalar,
    T: PathTracker<C>,
{
    history.clear();
    let mut current_time = start_time.clone();
    let mut current_sample = start_point.clone();
    history.push(current_time.clone(), current_sample.clone());

    for _ in 1..settings.num_sample_points {
        let prec = current_time.precision();
        let next_time = current_time
            .clone()
            .scale(C::real_from_f64(settings.sample_factor, prec));
        let next_sample = tracker.track_path(&current_time, &next_time, &current_sample)?;
        let mut next_time = next_time;
        next_time.raise_precision(vector_precision(&next_sample));
        history.push(next_time.clone(), next_sample.clone());
        current_time = next_time;
        current_sample = next_sample;
    }
    Ok(())
}

/// Plain algebraic pairing against a projection vector. A Hermitian dot
/// product would conjugate one side and destroy the power-series branch
/// structure the cycle estimates depend on.
pub(crate) fn projection_product<C: NumericScalar>(v: &DVector<C>, r: &DVector<C>) -> C {
    let mut acc = C::zero();
    for (a, b) in v.iter().zip(r.iter()) {
        acc = acc + a.clone() * b.clone();
    }
    acc
}

/// The fixed random projection vector drawn once per run.
pub(crate) fn random_projection<C: NumericScalar>(dim: usize, prec: Precision) -> DVector<C> {
    let mut rng = rand::rng();
    DVector::from_fn(dim, |_, _| C::sample_unit(&mut rng, prec))
}

/// Tracked tangent `dx/dt = -J^{-1} * dF/dt` at one sample.
pub(crate) fn path_tangent<C, S>(
    system: &S,
    x: &DVector<C>,
    t: &C,
) -> Result<DVector<C>, EndgameError>
where
    C: NumericScalar,
    S: HomotopySystem<C>,
{
    let jacobian = system.jacobian(x, t);
    let time_derivative = system.time_derivative(x, t);
    jacobian
        .lu()
        .solve(&(-time_derivative))
        .ok_or(EndgameError::MatrixSolveFailure)
}

/// Norm of the dehomogenized point, for divergence detection. A point whose
/// homogenizing coordinate vanishes is at infinity and reported as such.
pub(crate) fn dehomogenized_norm<C, S>(system: &S, x: &DVector<C>) -> C::RealField
where
    C: NumericScalar,
    S: HomotopySystem<C>,
{
    match system.dehomogenize_point(x) {
        Ok(affine) => affine.norm(),
        Err(err) => {
            trace!(error = %err, "dehomogenization failed, treating point as infinite");
            C::real_from_f64(f64::INFINITY, Precision::DOUBLE)
        }
    }
}
