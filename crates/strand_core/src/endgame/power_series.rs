use nalgebra::{ComplexField, DVector};
use num_traits::{One, Zero};
use tracing::{debug, trace};

use super::{
    collect_initial_samples, dehomogenized_norm, path_tangent, projection_product,
    random_projection, Endgame,
};
use crate::error::EndgameError;
use crate::history::{vector_precision, SampleHistory};
use crate::interpolate::hermite_interpolate_and_solve;
use crate::precision::PrecisionPolicy;
use crate::settings::{EndgameSettings, PowerSeriesSettings, SecuritySettings};
use crate::traits::{HomotopySystem, NumericScalar, PathTracker};

/// Finishes possibly singular paths by extrapolating a fractional power
/// series toward the target time.
///
/// The path near a branch point of cycle number `c` is an analytic function
/// of `s = t^(1/c)`. The endgame collects a window of samples at
/// geometrically shrinking times, discovers `c` by exhaustive search below a
/// ratio-based upper bound, and Hermite-interpolates the window in the
/// s-plane to predict the value at the origin. Advancing and re-extrapolating
/// continues until two consecutive predictions agree to `final_tolerance`.
pub struct PowerSeriesEndgame<C, T, P>
where
    C: NumericScalar,
    T: PathTracker<C>,
    P: PrecisionPolicy,
{
    tracker: T,
    policy: P,
    settings: EndgameSettings,
    security: SecuritySettings,
    power_series: PowerSeriesSettings,
    history: SampleHistory<C>,
    cycle_number: Option<usize>,
    upper_bound_on_cycle_number: usize,
    final_approximation: Option<DVector<C>>,
    rand_vector: DVector<C>,
}

impl<C, T, P> PowerSeriesEndgame<C, T, P>
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
        power_series: PowerSeriesSettings,
    ) -> Self {
        Self {
            tracker,
            policy,
            settings,
            security,
            power_series,
            history: SampleHistory::new(),
            cycle_number: None,
            upper_bound_on_cycle_number: 0,
            final_approximation: None,
            rand_vector: DVector::zeros(0),
        }
    }

    pub fn settings(&self) -> &EndgameSettings {
        &self.settings
    }

    /// The bound computed by the most recent estimation.
    pub fn upper_bound_on_cycle_number(&self) -> usize {
        self.upper_bound_on_cycle_number
    }

    /// Upper bound on the cycle number from the growth ratio of the three
    /// most recent samples, projected onto the fixed random vector.
    fn compute_bound_on_cycle_number(&mut self) -> usize {
        let samples = self.history.samples();
        debug_assert!(samples.len() >= 3, "need three samples to bound the cycle");
        let n = samples.len();
        let s0 = &samples[n - 3];
        let s1 = &samples[n - 2];
        let s2 = &samples[n - 1];

        let bound = if s2 == s1 || s1 == s0 {
            1
        } else {
            let prec = vector_precision(s2);
            let one = C::RealField::one();
            let numerator = projection_product(&(s2 - s1), &self.rand_vector).abs();
            let denominator = projection_product(&(s1 - s0), &self.rand_vector).abs();
            let log_ratio = (numerator / denominator).ln().abs();
            let estimate = C::real_from_f64(self.settings.sample_factor, prec).ln().abs()
                / log_ratio;
            if estimate.is_finite() && estimate >= one {
                let half = C::real_from_f64(0.5, prec);
                let amplification = C::real_from_f64(
                    self.power_series.cycle_number_amplification as f64,
                    prec,
                );
                let amplified = ((estimate + half).floor() * amplification).round();
                let amplified = C::real_to_f64(&amplified).max(1.0) as usize;
                // max_cycle_number floors the search range.
                amplified.max(self.power_series.max_cycle_number)
            } else {
                // Degenerate ratio; fall back to a simple path.
                1
            }
        };
        self.upper_bound_on_cycle_number = bound;
        bound
    }

    /// Compute `dx/dt = -J^{-1} dF/dt` for every history entry, at uniform
    /// working precision.
    fn compute_derivatives(&mut self) -> Result<(), EndgameError> {
        self.policy
            .ensure_uniform_precision(&mut self.tracker, &mut [&mut self.history]);
        self.history.clear_derivatives();
        for i in 0..self.history.len() {
            let derivative = path_tangent(
                self.tracker.system(),
                &self.history.samples()[i],
                &self.history.times()[i],
            )?;
            self.history.push_derivative(derivative);
        }
        Ok(())
    }

    /// Exhaustive search for the cycle number below the computed bound.
    ///
    /// The newest sample is held out; every candidate `c` transforms the
    /// remaining window to the s-plane via `s = t^(1/c)` and predicts the
    /// held-out sample by Hermite interpolation. The candidate with the
    /// smallest prediction residual wins, first candidate on ties.
    fn compute_cycle_number(&mut self) -> Result<usize, EndgameError> {
        if self.history.len() < 3 {
            return Err(EndgameError::InsufficientSamples {
                needed: 3,
                have: self.history.len(),
            });
        }
        if !self.history.has_full_derivatives() {
            self.compute_derivatives()?;
        }
        let bound = self.compute_bound_on_cycle_number();

        let times = self.history.times();
        let samples = self.history.samples();
        let derivatives = self.history.derivatives();
        let total = samples.len();

        let held_out = &samples[total - 1];
        let target_time = &times[total - 1];
        let available = total - 1;
        let num_used = available.min(self.settings.num_sample_points);
        let offset = available - num_used;
        let prec = target_time.precision();

        let mut best_residual: Option<C::RealField> = None;
        let mut best_cycle = 1;
        for candidate in 1..=bound {
            trace!(candidate, "testing cycle candidate");
            let inv_c = C::real_from_f64(1.0 / candidate as f64, prec);
            let ds_exp = C::real_from_f64((candidate as f64 - 1.0) / candidate as f64, prec);
            let cand = C::real_from_f64(candidate as f64, prec);

            let mut s_times = Vec::with_capacity(num_used);
            let mut s_derivatives = Vec::with_capacity(num_used);
            for i in 0..num_used {
                let t = &times[offset + i];
                s_times.push(t.clone().powf(inv_c.clone()));
                let ds_scale = t.clone().powf(ds_exp.clone()).scale(cand.clone());
                s_derivatives.push(derivatives[offset + i].map(|d| d * ds_scale.clone()));
            }
            let s_target = target_time.clone().powf(inv_c);

            let interpolated = hermite_interpolate_and_solve(
                &s_target,
                &s_times,
                &samples[offset..offset + num_used],
                &s_derivatives,
            )?;
            let residual = (&interpolated - held_out).norm();

            let better = match &best_residual {
                None => true,
                Some(current) => residual < *current,
            };
            if better {
                best_residual = Some(residual);
                best_cycle = candidate;
            }
        }

        trace!(cycle = best_cycle, "cycle number computed");
        self.cycle_number = Some(best_cycle);
        Ok(best_cycle)
    }

    /// Extrapolate the window to `target_time` using the freshly estimated
    /// cycle number.
    fn compute_approximation(&mut self, target_time: &C) -> Result<DVector<C>, EndgameError> {
        if !self.history.has_full_derivatives() {
            self.compute_derivatives()?;
        }
        let num_sample_points = self.settings.num_sample_points;
        if self.history.len() < num_sample_points {
            return Err(EndgameError::InsufficientSamples {
                needed: num_sample_points,
                have: self.history.len(),
            });
        }

        let cycle = self.compute_cycle_number()?;
        if cycle == 0 {
            return Err(EndgameError::ZeroCycleNumber);
        }

        let times = self.history.times();
        let samples = self.history.samples();
        let derivatives = self.history.derivatives();
        let offset = samples.len() - num_sample_points;
        let prec = times[samples.len() - 1].precision();
        let inv_c = C::real_from_f64(1.0 / cycle as f64, prec);
        let ds_exp = C::real_from_f64((cycle as f64 - 1.0) / cycle as f64, prec);
        let cyc = C::real_from_f64(cycle as f64, prec);

        let mut s_times = Vec::with_capacity(num_sample_points);
        let mut s_derivatives = Vec::with_capacity(num_sample_points);
        for i in 0..num_sample_points {
            let t = &times[offset + i];
            s_times.push(t.clone().powf(inv_c.clone()));
            let ds_scale = t.clone().powf(ds_exp.clone()).scale(cyc.clone());
            s_derivatives.push(derivatives[offset + i].map(|d| d * ds_scale.clone()));
        }
        let s_target = if target_time.is_zero() {
            C::zero()
        } else {
            target_time.clone().powf(inv_c)
        };

        hermite_interpolate_and_solve(&s_target, &s_times, &samples[offset..], &s_derivatives)
    }

    /// Shrink the time by `sample_factor`, track to it, refine the new
    /// sample, re-synchronize precision and append the new derivative.
    ///
    /// Fails with `MinTrackTimeReached`, without touching the history, when
    /// the shrunk time falls below the minimum trackable magnitude.
    fn advance_time(&mut self) -> Result<(), EndgameError> {
        let (current_time, current_sample) =
            match (self.history.latest_time(), self.history.latest_sample()) {
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

        trace!(magnitude = next_magnitude, "tracking to the next sample time");
        let next_sample = self
            .tracker
            .track_path(&current_time, &next_time, &current_sample)?;
        let mut next_time = next_time;
        next_time.raise_precision(vector_precision(&next_sample));

        let refined =
            self.policy
                .refine_sample(&mut self.tracker, &next_sample, &next_time, &self.settings)?;
        self.history.push(next_time, refined);

        self.policy
            .ensure_uniform_precision(&mut self.tracker, &mut [&mut self.history]);
        let derivative = path_tangent(
            self.tracker.system(),
            &self.history.samples()[self.history.len() - 1],
            &self.history.times()[self.history.len() - 1],
        )?;
        self.history.push_derivative(derivative);
        Ok(())
    }
}

impl<C, T, P> Endgame<C> for PowerSeriesEndgame<C, T, P>
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
        debug!("starting power series endgame");

        self.history.clear();
        self.cycle_number = None;
        self.final_approximation = None;
        self.upper_bound_on_cycle_number = 0;
        let prec = vector_precision(start_point).max(start_time.precision());
        self.rand_vector = random_projection(start_point.len(), prec);

        collect_initial_samples(
            &mut self.tracker,
            &self.settings,
            &mut self.history,
            start_time,
            start_point,
        )?;
        self.compute_derivatives()?;

        let origin = C::zero();
        let mut prev = self.compute_approximation(&origin)?;
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
            self.advance_time()?;
            let latest = self.compute_approximation(&origin)?;

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
        debug!("power series endgame converged");
        Ok(())
    }

    fn final_approximation(&self) -> Option<&DVector<C>> {
        self.final_approximation.as_ref()
    }

    fn cycle_number(&self) -> Option<usize> {
        self.cycle_number
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endgame::test_support::{exact_tracker, power_path, PathModel, C64};
    use crate::precision::{FixedPrecision, Precision};
    use approx::assert_relative_eq;

    fn c(re: f64) -> C64 {
        C64::new(re, 0.0)
    }

    fn endgame(
        model: PathModel,
        settings: EndgameSettings,
        power_series: PowerSeriesSettings,
        security: SecuritySettings,
    ) -> PowerSeriesEndgame<C64, crate::endgame::test_support::SyntheticTracker, FixedPrecision>
    {
        PowerSeriesEndgame::new(
            exact_tracker(model),
            FixedPrecision,
            settings,
            security,
            power_series,
        )
    }

    #[test]
    fn test_cycle_number_estimator_recovers_true_cycle() {
        for cycle in 1..=4u32 {
            let model = power_path(
                DVector::from_element(2, c(0.5)),
                cycle,
                &[(1, 1.0), (3, 0.25)],
            );
            let settings = EndgameSettings {
                num_sample_points: 4,
                ..Default::default()
            };
            let power_series = PowerSeriesSettings {
                max_cycle_number: 4,
                cycle_number_amplification: 1,
            };
            let mut eg = endgame(model, settings, power_series, SecuritySettings::default());
            eg.rand_vector = random_projection(2, Precision::DOUBLE);

            let start_time = c(0.1);
            let start_point = eg.tracker.system.model.value(start_time);
            collect_initial_samples(
                &mut eg.tracker,
                &eg.settings,
                &mut eg.history,
                &start_time,
                &start_point,
            )
            .unwrap();

            let found = eg.compute_cycle_number().unwrap();
            assert_eq!(found, cycle as usize, "estimator failed for cycle {cycle}");
        }
    }

    #[test]
    fn test_s_plane_transform_round_trips() {
        let t = C64::new(0.083, 0.021);
        for cycle in 1..=4 {
            let s = t.powf(1.0 / f64::from(cycle));
            let back = s.powi(cycle);
            assert_relative_eq!(back.re, t.re, max_relative = 1e-12);
            assert_relative_eq!(back.im, t.im, max_relative = 1e-12);
        }
    }

    #[test]
    fn test_advance_shrinks_time_geometrically() {
        let model = power_path(DVector::from_element(1, c(1.0)), 1, &[(1, 1.0)]);
        let mut eg = endgame(
            model,
            EndgameSettings::default(),
            PowerSeriesSettings::default(),
            SecuritySettings::default(),
        );
        let start_time = c(0.1);
        let start_point = eg.tracker.system.model.value(start_time);
        collect_initial_samples(
            &mut eg.tracker,
            &eg.settings,
            &mut eg.history,
            &start_time,
            &start_point,
        )
        .unwrap();
        eg.compute_derivatives().unwrap();

        for _ in 0..3 {
            eg.advance_time().unwrap();
        }

        let times = eg.history.times();
        for k in 0..times.len() - 1 {
            assert_relative_eq!(
                times[k + 1].norm(),
                times[k].norm() * 0.5,
                max_relative = 1e-12
            );
        }
    }

    #[test]
    fn test_advance_below_min_track_time_leaves_history_untouched() {
        let model = power_path(DVector::from_element(1, c(1.0)), 1, &[(1, 1.0)]);
        let settings = EndgameSettings {
            min_track_time: 0.03,
            ..Default::default()
        };
        let mut eg = endgame(
            model,
            settings,
            PowerSeriesSettings::default(),
            SecuritySettings::default(),
        );
        let start_time = c(0.1);
        let start_point = eg.tracker.system.model.value(start_time);
        collect_initial_samples(
            &mut eg.tracker,
            &eg.settings,
            &mut eg.history,
            &start_time,
            &start_point,
        )
        .unwrap();
        eg.compute_derivatives().unwrap();

        let times_before = eg.history.times().to_vec();
        let result = eg.advance_time();
        assert_eq!(result, Err(EndgameError::MinTrackTimeReached));
        assert_eq!(eg.history.times(), times_before.as_slice());
        assert_eq!(eg.history.len(), 3);
    }

    #[test]
    fn test_run_rejects_dimension_mismatch() {
        let model = power_path(DVector::from_element(2, c(1.0)), 1, &[(1, 1.0)]);
        let mut eg = endgame(
            model,
            EndgameSettings::default(),
            PowerSeriesSettings::default(),
            SecuritySettings::default(),
        );
        let wrong = DVector::from_element(3, c(1.0));
        let result = eg.run(&c(0.1), &wrong);
        assert_eq!(
            result,
            Err(EndgameError::DimensionMismatch {
                expected: 2,
                actual: 3
            })
        );
    }

    #[test]
    fn test_endgame_converges_on_a_double_root() {
        // x(t) = 1 + t^(1/2): a cycle-two branch with limit 1 at the origin.
        let model = power_path(DVector::from_element(1, c(1.0)), 2, &[(1, 1.0)]);
        let settings = EndgameSettings {
            num_sample_points: 4,
            sample_factor: 0.5,
            final_tolerance: 1e-10,
            ..Default::default()
        };
        let power_series = PowerSeriesSettings {
            max_cycle_number: 3,
            cycle_number_amplification: 1,
        };
        let mut eg = endgame(model, settings, power_series, SecuritySettings::default());

        let start_time = c(0.1);
        let start_point = eg.tracker.system.model.value(start_time);
        eg.run(&start_time, &start_point)
            .expect("endgame should converge on the double root");

        assert_eq!(eg.cycle_number(), Some(2));
        let approx = eg
            .final_approximation()
            .expect("final approximation after a successful run");
        assert!(
            (approx[0] - c(1.0)).norm() < 1e-8,
            "final approximation {} too far from 1.0",
            approx[0]
        );
    }

    #[test]
    fn test_divergent_path_hits_security_max_norm() {
        // x(t) = 1/t runs to the point at infinity as t -> 0.
        let model = PathModel::Reciprocal {
            x0: DVector::from_element(1, c(1.0)),
        };
        let settings = EndgameSettings {
            final_tolerance: 1e-12,
            ..Default::default()
        };
        let security = SecuritySettings {
            level: 0,
            max_norm: 1e6,
        };
        let mut eg = endgame(model, settings, PowerSeriesSettings::default(), security);

        let start_time = c(0.1);
        let start_point = eg.tracker.system.model.value(start_time);
        let result = eg.run(&start_time, &start_point);
        assert_eq!(result, Err(EndgameError::SecurityMaxNormReached));
    }
}
