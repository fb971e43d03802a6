use nalgebra::{ComplexField, DMatrix, DVector};
use num_traits::{One, Zero};
use tracing::{debug, trace};

use super::{
    collect_initial_samples, dehomogenized_norm, projection_product, random_projection, Endgame,
};
use crate::error::EndgameError;
use crate::history::{vector_precision, SampleHistory};
use crate::precision::PrecisionPolicy;
use crate::settings::{CauchySettings, EndgameSettings, SecuritySettings};
use crate::traits::{HomotopySystem, NumericScalar, PathTracker};

/// Finishes possibly singular paths by integrating around the singularity.
///
/// Instead of extrapolating derivatives, this endgame tracks closed loops
/// around the origin at the current time's radius. The number of revolutions
/// needed for the loop to close is the cycle number, and by the Cauchy
/// integral formula the mean of the loop samples approximates the value at
/// the origin. Looping starts once a ratio estimator computed from the
/// forward samples has stabilized, so that the loops are tracked inside the
/// endgame operating zone.
pub struct CauchyEndgame<C, T, P>
where
    C: NumericScalar,
    T: PathTracker<C>,
    P: PrecisionPolicy,
{
    tracker: T,
    policy: P,
    settings: EndgameSettings,
    security: SecuritySettings,
    cauchy: CauchySettings,
    /// Forward samples approaching the target time.
    path_history: SampleHistory<C>,
    /// Samples collected around the current set of loops; the seed sample is
    /// entry zero and each revolution appends `num_sample_points` entries.
    loop_history: SampleHistory<C>,
    cycle_number: Option<usize>,
    final_approximation: Option<DVector<C>>,
    rand_vector: DVector<C>,
}

impl<C, T, P> CauchyEndgame<C, T, P>
where
    C: NumericScalar,
    T: PathTracker<C>,
    P: PrecisionPolicy,
{
    pub fn new(
        tracker: T,
        policy: P,
        settings: EndgameSettings,
        security: SecuritySettings,
        cauchy: CauchySettings,
    ) -> Self {
        Self {
            tracker,
            policy,
            settings,
            security,
            cauchy,
            path_history: SampleHistory::new(),
            loop_history: SampleHistory::new(),
            cycle_number: None,
            final_approximation: None,
            rand_vector: DVector::zeros(0),
        }
    }

    pub fn settings(&self) -> &EndgameSettings {
        &self.settings
    }

    /// Track one full revolution around the origin at radius `|start_time|`,
    /// stopping at `num_sample_points` equal angular steps.
    ///
    /// Every stop is appended to the loop history. On a tracker failure the
    /// code is surfaced immediately; the partially tracked samples remain in
    /// the loop history for inspection.
    fn circle_track(
        &mut self,
        start_time: &C,
        start_sample: &DVector<C>,
    ) -> Result<DVector<C>, EndgameError> {
        let n = self.settings.num_sample_points;
        if n < 3 {
            return Err(EndgameError::InsufficientSamples { needed: 3, have: n });
        }
        let prec = start_time.precision();
        let radius = start_time.clone().abs();
        if !(C::real_to_f64(&radius) > 0.0) {
            return Err(EndgameError::ZeroLoopRadius);
        }
        let base_angle = start_time.clone().argument();
        let two_pi = C::two_pi(prec);

        let mut current_time = start_time.clone();
        let mut current_sample = start_sample.clone();
        for step in 0..n {
            // Stop angles run from -2*pi up to the start angle in n steps.
            let frac = C::real_from_f64((step + 1) as f64 / n as f64 - 1.0, prec);
            let angle = base_angle.clone() + two_pi.clone() * frac;
            let next_time = C::from_polar(&radius, &angle, prec);
            let next_sample = self
                .tracker
                .track_path(&current_time, &next_time, &current_sample)?;
            self.loop_history.push(next_time.clone(), next_sample.clone());
            current_time = next_time;
            current_sample = next_sample;
        }
        Ok(current_sample)
    }

    /// Ratio estimator over the three most recent forward samples; the
    /// Cauchy analogue of the power-series cycle estimate.
    fn compute_c_over_k(&self) -> C::RealField {
        let samples = self.path_history.samples();
        debug_assert!(samples.len() >= 3, "need three samples for c-over-k");
        let n = samples.len();
        let s0 = &samples[n - 3];
        let s1 = &samples[n - 2];
        let s2 = &samples[n - 1];

        let one = C::RealField::one();
        if s2 == s1 || s1 == s0 {
            return one;
        }
        let prec = vector_precision(s2);
        let numerator = projection_product(&(s2 - s1), &self.rand_vector).abs();
        let denominator = projection_product(&(s1 - s0), &self.rand_vector).abs();
        let log_ratio = (numerator / denominator).ln().abs();
        let estimate =
            C::real_from_f64(self.settings.sample_factor, prec).ln().abs() / log_ratio;
        if estimate.is_finite() && estimate >= one {
            estimate
        } else {
            one
        }
    }

    /// The trailing estimates are stabilized when every consecutive pair's
    /// min/max ratio exceeds the configured minimum.
    fn c_over_k_stabilized(&self, estimates: &[C::RealField]) -> bool {
        let needed = self.cauchy.num_needed_for_stabilization;
        if estimates.len() < needed {
            return false;
        }
        let minimum = C::real_from_f64(
            self.cauchy.minimum_for_c_over_k_stabilization,
            crate::precision::Precision::DOUBLE,
        );
        estimates[estimates.len() - needed..]
            .windows(2)
            .all(|pair| {
                let a = pair[0].clone().abs();
                let b = pair[1].clone().abs();
                let ratio = if a < b { a / b } else { b / a };
                ratio > minimum
            })
    }

    /// Tolerance deciding whether a loop has closed, from an a-priori error
    /// bound of the homotopy. Without AMP invariants the bound is not
    /// computable and the maximum tolerance applies.
    fn closed_loop_tolerance(&self, time: &C, sample: &DVector<C>) -> f64 {
        let min_tol = self.cauchy.minimum_closed_loop_tolerance;
        let max_tol = self.cauchy.maximum_closed_loop_tolerance.max(min_tol);
        let Some(bounds) = self.tracker.amp_bounds() else {
            return max_tol;
        };

        let degree = bounds.degree_bound.max(2);
        let num_vars = self.tracker.system().num_variables();
        let monomial_count = if num_vars <= 1 {
            f64::from(degree)
        } else {
            binomial(degree as usize + num_vars - 1, num_vars - 1)
        };
        let growth = f64::from(degree) * f64::from(degree - 1) * monomial_count;
        let sigma_min = smallest_singular_value(&self.tracker.system().jacobian(sample, time));
        let norm = C::real_to_f64(&sample.norm());
        let leading = norm.powi(degree as i32 - 2);

        let bound = bounds.coefficient_bound * leading * growth;
        let tol = if bound == 0.0 {
            sigma_min
        } else {
            2.0 / bound * sigma_min
        };
        tol.clamp(min_tol, max_tol)
    }

    /// Track loops at the current radius until one closes, counting the
    /// revolutions. The count is the cycle number.
    fn run_loops(&mut self) -> Result<usize, EndgameError> {
        let (start_time, start_sample) = match (
            self.path_history.latest_time(),
            self.path_history.latest_sample(),
        ) {
            (Some(t), Some(s)) => (t.clone(), s.clone()),
            _ => {
                return Err(EndgameError::InsufficientSamples {
                    needed: 1,
                    have: 0,
                })
            }
        };

        self.loop_history.clear();
        self.loop_history
            .push(start_time.clone(), start_sample.clone());
        let tolerance = self.closed_loop_tolerance(&start_time, &start_sample);

        let mut current = start_sample.clone();
        for revolution in 1..=self.cauchy.fail_safe_maximum_cycle_number {
            current = self.circle_track(&start_time, &current)?;
            let closure = C::real_to_f64(&(&current - &start_sample).norm());
            trace!(revolution, closure, tolerance, "completed one revolution");
            if closure < tolerance {
                self.cycle_number = Some(revolution);
                return Ok(revolution);
            }
        }

        trace!("loop failed to close below the fail-safe maximum cycle number");
        Err(EndgameError::Failure)
    }

    /// Mean of the loop samples: the trapezoid rule for the Cauchy integral
    /// of the path around the origin, which equals the value at the origin.
    fn compute_loop_approximation(&self) -> Result<DVector<C>, EndgameError> {
        let cycle = self.cycle_number.ok_or(EndgameError::ZeroCycleNumber)?;
        let expected = cycle * self.settings.num_sample_points + 1;
        let samples = self.loop_history.samples();
        if samples.len() != expected {
            return Err(EndgameError::InsufficientSamples {
                needed: expected,
                have: samples.len(),
            });
        }

        // The final sample duplicates the seed and is left out.
        let count = expected - 1;
        let mut acc = DVector::zeros(samples[0].len());
        for sample in &samples[..count] {
            acc += sample;
        }
        let prec = vector_precision(&samples[0]);
        Ok(acc.unscale(C::real_from_f64(count as f64, prec)))
    }

    /// Shrink the forward time by `sample_factor` and track to it.
    fn advance_path(&mut self) -> Result<(), EndgameError> {
        let (current_time, current_sample) = match (
            self.path_history.latest_time(),
            self.path_history.latest_sample(),
        ) {
            (Some(t), Some(s)) => (t.clone(), s.clone()),
            _ => {
                return Err(EndgameError::InsufficientSamples {
                    needed: 1,
                    have: 0,
                })
            }
        };

        let prec = current_time.precision();
        let next_time = current_time
            .clone()
            .scale(C::real_from_f64(self.settings.sample_factor, prec));
        let next_magnitude = C::real_to_f64(&next_time.clone().abs());
        if next_magnitude < self.settings.min_track_time {
            trace!(
                magnitude = next_magnitude,
                "next time magnitude is below the minimum trackable time"
            );
            return Err(EndgameError::MinTrackTimeReached);
        }

        let next_sample = self
            .tracker
            .track_path(&current_time, &next_time, &current_sample)?;
        let mut next_time = next_time;
        next_time.raise_precision(vector_precision(&next_sample));

        let refined =
            self.policy
                .refine_sample(&mut self.tracker, &next_sample, &next_time, &self.settings)?;
        self.path_history.push(next_time, refined);

        self.policy.ensure_uniform_precision(
            &mut self.tracker,
            &mut [&mut self.path_history, &mut self.loop_history],
        );
        Ok(())
    }
}

impl<C, T, P> Endgame<C> for CauchyEndgame<C, T, P>
where
    C: NumericScalar,
    T: PathTracker<C>,
    P: PrecisionPolicy,
{
    fn run(&mut self, start_time: &C, start_point: &DVector<C>) -> Result<(), EndgameError> {
        let expected = self.tracker.system().num_variables();
        if start_point.len() != expected {
            return Err(EndgameError::DimensionMismatch {
                expected,
                actual: start_point.len(),
            });
        }
        if self.settings.num_sample_points < 3 {
            return Err(EndgameError::InsufficientSamples {
                needed: 3,
                have: self.settings.num_sample_points,
            });
        }
        debug!("starting cauchy endgame");

        self.path_history.clear();
        self.loop_history.clear();
        self.cycle_number = None;
        self.final_approximation = None;
        let prec = vector_precision(start_point).max(start_time.precision());
        self.rand_vector = random_projection(start_point.len(), prec);

        collect_initial_samples(
            &mut self.tracker,
            &self.settings,
            &mut self.path_history,
            start_time,
            start_point,
        )?;

        // Advance until the ratio estimates stabilize; only then are loops
        // around the origin worth tracking.
        let mut estimates = vec![self.compute_c_over_k()];
        while !self.c_over_k_stabilized(&estimates) {
            self.advance_path()?;
            estimates.push(self.compute_c_over_k());
        }
        trace!(
            num_estimates = estimates.len(),
            "c-over-k ratios stabilized"
        );

        self.run_loops()?;
        let mut prev = self.compute_loop_approximation()?;
        self.final_approximation = Some(prev.clone());

        let tolerance = C::real_from_f64(self.settings.final_tolerance, prec);
        let max_norm = C::real_from_f64(self.security.max_norm, prec);
        let security_enabled = self.security.level <= 0;
        let mut prev_dehom_norm = if security_enabled {
            dehomogenized_norm(self.tracker.system(), &prev)
        } else {
            C::RealField::zero()
        };

        let mut approx_error = C::real_from_f64(1.0, prec);
        while approx_error > tolerance {
            self.advance_path()?;
            self.run_loops()?;
            let latest = self.compute_loop_approximation()?;

            if security_enabled {
                let latest_dehom_norm = dehomogenized_norm(self.tracker.system(), &latest);
                if latest_dehom_norm > max_norm && prev_dehom_norm > max_norm {
                    return Err(EndgameError::SecurityMaxNormReached);
                }
                prev_dehom_norm = latest_dehom_norm;
            }

            approx_error = (&latest - &prev).norm();
            trace!(
                error = C::real_to_f64(&approx_error),
                "consecutive approximation error"
            );
            prev = latest;
        }

        self.final_approximation = Some(prev);
        debug!("cauchy endgame converged");
        Ok(())
    }

    fn final_approximation(&self) -> Option<&DVector<C>> {
        self.final_approximation.as_ref()
    }

    fn cycle_number(&self) -> Option<usize> {
        self.cycle_number
    }
}

fn binomial(n: usize, k: usize) -> f64 {
    let k = k.min(n - k);
    let mut acc = 1.0;
    for i in 0..k {
        acc = acc * (n - i) as f64 / (i + 1) as f64;
    }
    acc
}

fn smallest_singular_value<C: NumericScalar>(matrix: &DMatrix<C>) -> f64 {
    let svd = nalgebra::SVD::new(matrix.clone(), false, false);
    svd.singular_values
        .iter()
        .fold(f64::INFINITY, |acc, sigma| acc.min(C::real_to_f64(sigma)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endgame::test_support::{branch_tracker, power_path, PathModel, C64};
    use crate::precision::FixedPrecision;
    use crate::traits::AmpBounds;
    use approx::assert_relative_eq;

    fn c(re: f64) -> C64 {
        C64::new(re, 0.0)
    }

    fn endgame(
        model: PathModel,
        settings: EndgameSettings,
        cauchy: CauchySettings,
    ) -> CauchyEndgame<C64, crate::endgame::test_support::SyntheticTracker, FixedPrecision> {
        CauchyEndgame::new(
            branch_tracker(model),
            FixedPrecision,
            settings,
            SecuritySettings::default(),
            cauchy,
        )
    }

    #[test]
    fn test_circle_track_closes_on_a_smooth_path() {
        let model = power_path(DVector::from_element(2, c(2.0)), 1, &[(1, 1.0)]);
        let mut eg = endgame(model, EndgameSettings::default(), CauchySettings::default());

        let start_time = c(0.1);
        let start_sample = eg.tracker.system.model.value(start_time);
        let end_sample = eg
            .circle_track(&start_time, &start_sample)
            .expect("smooth loop should track");

        assert_eq!(eg.loop_history.len(), eg.settings.num_sample_points);
        let closure = (&end_sample - &start_sample).norm();
        assert!(
            closure < eg.settings.final_tolerance,
            "loop did not close: residual {closure}"
        );
    }

    #[test]
    fn test_circle_track_rejects_degenerate_inputs() {
        let model = power_path(DVector::from_element(1, c(1.0)), 1, &[(1, 1.0)]);
        let settings = EndgameSettings {
            num_sample_points: 2,
            ..Default::default()
        };
        let mut eg = endgame(model.clone(), settings, CauchySettings::default());
        let sample = DVector::from_element(1, c(1.1));
        assert_eq!(
            eg.circle_track(&c(0.1), &sample),
            Err(EndgameError::InsufficientSamples { needed: 3, have: 2 })
        );

        let mut eg = endgame(model, EndgameSettings::default(), CauchySettings::default());
        assert_eq!(
            eg.circle_track(&c(0.0), &sample),
            Err(EndgameError::ZeroLoopRadius)
        );
    }

    #[test]
    fn test_c_over_k_stabilization_window() {
        let model = power_path(DVector::from_element(1, c(1.0)), 1, &[(1, 1.0)]);
        let eg = endgame(model, EndgameSettings::default(), CauchySettings::default());

        assert!(eg.c_over_k_stabilized(&[2.0, 2.0, 2.0]));
        assert!(eg.c_over_k_stabilized(&[1.9, 2.0, 2.1]));
        assert!(!eg.c_over_k_stabilized(&[1.0, 3.0, 1.0]));
        assert!(!eg.c_over_k_stabilized(&[2.0, 2.0]), "window too short");
    }

    #[test]
    fn test_closed_loop_tolerance_uses_the_apriori_bound() {
        let model = power_path(DVector::from_element(2, c(1.0)), 1, &[(1, 1.0)]);
        let cauchy = CauchySettings {
            maximum_closed_loop_tolerance: 1.0,
            ..Default::default()
        };
        let mut eg = endgame(model, EndgameSettings::default(), cauchy);
        eg.tracker.system.amp = Some(AmpBounds {
            degree_bound: 3,
            coefficient_bound: 5.0,
        });

        let time = c(0.1);
        let sample = eg.tracker.system.model.value(time);
        let tol = eg.closed_loop_tolerance(&time, &sample);

        // D = 3, two variables: N = C(4, 1) = 4, M = 3 * 2 * 4 = 24,
        // sigma_min = 1 for the identity Jacobian, L = ||x||^(3-2).
        let expected = 2.0 / (5.0 * sample.norm() * 24.0);
        assert_relative_eq!(tol, expected, max_relative = 1e-12);
    }

    #[test]
    fn test_closed_loop_tolerance_falls_back_without_amp_bounds() {
        let model = power_path(DVector::from_element(1, c(1.0)), 1, &[(1, 1.0)]);
        let eg = endgame(model, EndgameSettings::default(), CauchySettings::default());
        let sample = DVector::from_element(1, c(1.1));
        assert_eq!(
            eg.closed_loop_tolerance(&c(0.1), &sample),
            CauchySettings::default().maximum_closed_loop_tolerance
        );
    }

    #[test]
    fn test_cauchy_endgame_recovers_a_double_root() {
        // x(t) = 1 + t^(1/2): the loop closes after two revolutions and the
        // loop mean recovers the limit value 1.
        let model = power_path(DVector::from_element(2, c(1.0)), 2, &[(1, 1.0)]);
        let mut eg = endgame(model, EndgameSettings::default(), CauchySettings::default());

        let start_time = c(0.1);
        let start_point = eg.tracker.system.model.value(start_time);
        eg.run(&start_time, &start_point)
            .expect("cauchy endgame should converge on the double root");

        assert_eq!(eg.cycle_number(), Some(2));
        let approx = eg
            .final_approximation()
            .expect("final approximation after a successful run");
        for entry in approx.iter() {
            assert!(
                (entry - c(1.0)).norm() < 1e-8,
                "loop mean {entry} too far from 1.0"
            );
        }
    }

    #[test]
    fn test_run_rejects_dimension_mismatch() {
        let model = power_path(DVector::from_element(2, c(1.0)), 1, &[(1, 1.0)]);
        let mut eg = endgame(model, EndgameSettings::default(), CauchySettings::default());
        let wrong = DVector::from_element(1, c(1.0));
        assert_eq!(
            eg.run(&c(0.1), &wrong),
            Err(EndgameError::DimensionMismatch {
                expected: 2,
                actual: 1
            })
        );
    }
}
