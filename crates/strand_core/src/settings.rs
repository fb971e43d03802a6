use serde::{Deserialize, Serialize};

/// Settings shared by every endgame. Immutable during a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EndgameSettings {
    /// Number of sample points in one extrapolation window. Must be at
    /// least 3; also the number of angular stops per Cauchy revolution.
    pub num_sample_points: usize,
    /// Shrink ratio applied to the time at each advance, in `(0, 1)`.
    pub sample_factor: f64,
    /// Smallest time magnitude the endgame will ask the tracker to reach.
    pub min_track_time: f64,
    /// Convergence threshold on consecutive extrapolations.
    pub final_tolerance: f64,
    /// Iteration cap for Newton refinement of freshly tracked samples.
    pub max_num_newton_iterations: usize,
}

impl Default for EndgameSettings {
    fn default() -> Self {
        Self {
            num_sample_points: 3,
            sample_factor: 0.5,
            min_track_time: 1e-100,
            final_tolerance: 1e-11,
            max_num_newton_iterations: 5,
        }
    }
}

/// Divergence detection. A level above zero disables the check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SecuritySettings {
    pub level: i32,
    /// Two consecutive extrapolations with dehomogenized norm above this
    /// bound abort the run with `SecurityMaxNormReached`.
    pub max_norm: f64,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            level: 0,
            max_norm: 1e5,
        }
    }
}

/// Settings specific to the power series endgame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PowerSeriesSettings {
    /// Floor on the cycle-number search bound: the exhaustive search always
    /// covers at least `1..=max_cycle_number`.
    pub max_cycle_number: usize,
    /// Multiplier applied to the estimated bound before the search.
    pub cycle_number_amplification: usize,
}

impl Default for PowerSeriesSettings {
    fn default() -> Self {
        Self {
            max_cycle_number: 6,
            cycle_number_amplification: 5,
        }
    }
}

/// Settings specific to the Cauchy endgame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CauchySettings {
    /// How many trailing c-over-k estimates must agree before looping starts.
    pub num_needed_for_stabilization: usize,
    /// Minimum min/max ratio between consecutive estimates to count as
    /// agreement.
    pub minimum_for_c_over_k_stabilization: f64,
    /// Hard cap on revolutions before the loop is declared unclosable.
    pub fail_safe_maximum_cycle_number: usize,
    /// Clamp range for the closed-loop tolerance.
    pub minimum_closed_loop_tolerance: f64,
    pub maximum_closed_loop_tolerance: f64,
}

impl Default for CauchySettings {
    fn default() -> Self {
        Self {
            num_needed_for_stabilization: 3,
            minimum_for_c_over_k_stabilization: 0.75,
            fail_safe_maximum_cycle_number: 250,
            minimum_closed_loop_tolerance: 1e-12,
            maximum_closed_loop_tolerance: 1e-6,
        }
    }
}
