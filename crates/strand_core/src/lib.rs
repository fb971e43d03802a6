pub mod endgame;
pub mod error;
pub mod history;
pub mod interpolate;
pub mod precision;
pub mod settings;
/// The `strand_core` crate implements the endgame phase of polynomial
/// homotopy continuation: finishing numerically tracked solution paths near
/// a singular limit, where plain predictor-corrector tracking breaks down.
///
/// Key components:
/// - **Traits**: `NumericScalar` (numeric context abstraction),
///   `HomotopySystem` and `PathTracker` (the external collaborators).
/// - **Power series endgame**: cycle-number discovery plus Hermite
///   extrapolation in the fractional-power s-plane.
/// - **Cauchy endgame**: closed loops around the singularity, with the loop
///   mean as the Cauchy-integral approximation of the limit.
/// - **Precision policies**: fixed- and adaptive-precision strategies for
///   sample refinement and uniform-precision enforcement.
pub mod traits;

pub use endgame::{CauchyEndgame, Endgame, PowerSeriesEndgame};
pub use error::EndgameError;
pub use history::SampleHistory;
pub use precision::{AdaptivePrecision, FixedPrecision, Precision, PrecisionPolicy};
pub use settings::{CauchySettings, EndgameSettings, PowerSeriesSettings, SecuritySettings};
pub use traits::{AmpBounds, HomotopySystem, NumericScalar, PathTracker};
