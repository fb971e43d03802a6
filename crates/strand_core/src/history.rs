use nalgebra::DVector;

use crate::precision::Precision;
use crate::traits::NumericScalar;

/// Ordered history of (time, sample[, derivative]) triples for one path.
///
/// Oldest entries first, newest last. Cleared at the start of each endgame
/// run and append-only during a run; entries are never reordered. The time
/// and sample columns always have equal length; the derivative column is
/// empty until computed, then kept at equal length as well.
///
/// Precision is a runtime property of the stored values, so one history
/// serves every numeric regime.
#[derive(Debug, Clone)]
pub struct SampleHistory<C: NumericScalar> {
    times: Vec<C>,
    samples: Vec<DVector<C>>,
    derivatives: Vec<DVector<C>>,
}

impl<C: NumericScalar> SampleHistory<C> {
    pub fn new() -> Self {
        Self {
            times: Vec::new(),
            samples: Vec::new(),
            derivatives: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn clear(&mut self) {
        self.times.clear();
        self.samples.clear();
        self.derivatives.clear();
    }

    pub fn push(&mut self, time: C, sample: DVector<C>) {
        self.times.push(time);
        self.samples.push(sample);
    }

    /// Append the derivative for the oldest entry that does not have one yet.
    pub fn push_derivative(&mut self, derivative: DVector<C>) {
        debug_assert!(
            self.derivatives.len() < self.samples.len(),
            "derivative column already full"
        );
        self.derivatives.push(derivative);
    }

    pub fn clear_derivatives(&mut self) {
        self.derivatives.clear();
    }

    pub fn has_full_derivatives(&self) -> bool {
        !self.samples.is_empty() && self.derivatives.len() == self.samples.len()
    }

    pub fn times(&self) -> &[C] {
        &self.times
    }

    pub fn samples(&self) -> &[DVector<C>] {
        &self.samples
    }

    pub fn derivatives(&self) -> &[DVector<C>] {
        &self.derivatives
    }

    pub fn latest_time(&self) -> Option<&C> {
        self.times.last()
    }

    pub fn latest_sample(&self) -> Option<&DVector<C>> {
        self.samples.last()
    }

    /// The highest precision carried by any stored value.
    pub fn max_precision(&self) -> Precision {
        let mut prec = Precision::DOUBLE;
        for t in &self.times {
            prec = prec.max(t.precision());
        }
        for column in [&self.samples, &self.derivatives] {
            for v in column.iter() {
                prec = prec.max(vector_precision(v));
            }
        }
        prec
    }

    /// Promote every stored value to `prec`.
    pub fn raise_precision(&mut self, prec: Precision) {
        for t in &mut self.times {
            t.raise_precision(prec);
        }
        for column in [&mut self.samples, &mut self.derivatives] {
            for v in column.iter_mut() {
                for entry in v.iter_mut() {
                    entry.raise_precision(prec);
                }
            }
        }
    }
}

impl<C: NumericScalar> Default for SampleHistory<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Highest precision among a vector's components.
pub(crate) fn vector_precision<C: NumericScalar>(v: &DVector<C>) -> Precision {
    let mut prec = Precision::DOUBLE;
    for entry in v.iter() {
        prec = prec.max(entry.precision());
    }
    prec
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_complex::Complex;

    fn c(re: f64) -> Complex<f64> {
        Complex::new(re, 0.0)
    }

    #[test]
    fn test_columns_stay_aligned() {
        let mut history = SampleHistory::new();
        assert!(history.is_empty());

        history.push(c(0.1), DVector::from_element(2, c(1.0)));
        history.push(c(0.05), DVector::from_element(2, c(1.1)));
        assert_eq!(history.len(), 2);
        assert_eq!(history.times().len(), history.samples().len());
        assert!(!history.has_full_derivatives());

        history.push_derivative(DVector::from_element(2, c(0.3)));
        history.push_derivative(DVector::from_element(2, c(0.2)));
        assert!(history.has_full_derivatives());

        history.clear();
        assert!(history.is_empty());
        assert!(history.derivatives().is_empty());
    }

    #[test]
    fn test_latest_accessors_track_the_newest_entry() {
        let mut history = SampleHistory::new();
        history.push(c(0.1), DVector::from_element(1, c(2.0)));
        history.push(c(0.05), DVector::from_element(1, c(3.0)));
        assert_eq!(history.latest_time(), Some(&c(0.05)));
        assert_eq!(
            history.latest_sample().map(|s| s[0]),
            Some(c(3.0)),
            "latest sample should be the most recently pushed"
        );
    }
}
