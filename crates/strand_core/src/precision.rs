use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::EndgameError;
use crate::history::SampleHistory;
use crate::settings::EndgameSettings;
use crate::traits::{HomotopySystem, NumericScalar, PathTracker};

/// Working precision, in bits of mantissa.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Precision(u32);

impl Precision {
    /// IEEE double precision.
    pub const DOUBLE: Precision = Precision(53);

    pub const fn new(bits: u32) -> Self {
        Precision(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }
}

/// Strategy controlling how an endgame manages working precision.
///
/// Endgames call these two operations but do not implement them; the variant
/// is injected at construction. `FixedPrecision` is a no-op on the precision
/// dimension, `AdaptivePrecision` may escalate the system-wide precision.
pub trait PrecisionPolicy {
    /// Newton-refine a freshly tracked sample to `final_tolerance / 100`.
    fn refine_sample<C, T>(
        &self,
        tracker: &mut T,
        sample: &DVector<C>,
        time: &C,
        settings: &EndgameSettings,
    ) -> Result<DVector<C>, EndgameError>
    where
        C: NumericScalar,
        T: PathTracker<C>;

    /// Raise every entry of the supplied histories to a common working
    /// precision and propagate it onto the system. Returns that precision.
    ///
    /// Required before any cross-sample linear algebra. Calling it on
    /// already-uniform histories changes nothing.
    fn ensure_uniform_precision<C, T>(
        &self,
        tracker: &mut T,
        histories: &mut [&mut SampleHistory<C>],
    ) -> Precision
    where
        C: NumericScalar,
        T: PathTracker<C>;
}

/// Precision policy for trackers running at one fixed precision.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedPrecision;

impl PrecisionPolicy for FixedPrecision {
    fn refine_sample<C, T>(
        &self,
        tracker: &mut T,
        sample: &DVector<C>,
        time: &C,
        settings: &EndgameSettings,
    ) -> Result<DVector<C>, EndgameError>
    where
        C: NumericScalar,
        T: PathTracker<C>,
    {
        // At fixed precision a refinement failure is benign: the tracked
        // sample is already within the tracking tolerance.
        match tracker.refine(
            sample,
            time,
            settings.final_tolerance / 100.0,
            settings.max_num_newton_iterations,
        ) {
            Ok(refined) => Ok(refined),
            Err(code) => {
                trace!(?code, "refinement failed, keeping the tracked sample");
                Ok(sample.clone())
            }
        }
    }

    fn ensure_uniform_precision<C, T>(
        &self,
        tracker: &mut T,
        _histories: &mut [&mut SampleHistory<C>],
    ) -> Precision
    where
        C: NumericScalar,
        T: PathTracker<C>,
    {
        tracker.system().precision()
    }
}

/// Precision policy for adaptive-multiple-precision trackers.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdaptivePrecision;

impl PrecisionPolicy for AdaptivePrecision {
    fn refine_sample<C, T>(
        &self,
        tracker: &mut T,
        sample: &DVector<C>,
        time: &C,
        settings: &EndgameSettings,
    ) -> Result<DVector<C>, EndgameError>
    where
        C: NumericScalar,
        T: PathTracker<C>,
    {
        tracker.refine(
            sample,
            time,
            settings.final_tolerance / 100.0,
            settings.max_num_newton_iterations,
        )
    }

    fn ensure_uniform_precision<C, T>(
        &self,
        tracker: &mut T,
        histories: &mut [&mut SampleHistory<C>],
    ) -> Precision
    where
        C: NumericScalar,
        T: PathTracker<C>,
    {
        let mut prec = tracker.system().precision();
        for history in histories.iter() {
            prec = prec.max(history.max_precision());
        }
        for history in histories.iter_mut() {
            history.raise_precision(prec);
        }
        tracker.system_mut().set_precision(prec);
        prec
    }
}
