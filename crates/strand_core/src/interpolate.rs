use nalgebra::DVector;
use num_traits::Zero;

use crate::error::EndgameError;
use crate::traits::NumericScalar;

/// Hermite interpolation through `(times[i], samples[i], derivatives[i])`,
/// evaluated at `target`.
///
/// Builds the divided-difference table over the doubled node sequence and
/// evaluates the Newton form. With `n` nodes the interpolant matches values
/// and first derivatives at every node (degree at most `2n - 1`).
pub fn hermite_interpolate_and_solve<C: NumericScalar>(
    target: &C,
    times: &[C],
    samples: &[DVector<C>],
    derivatives: &[DVector<C>],
) -> Result<DVector<C>, EndgameError> {
    let n = times.len();
    if n == 0 || samples.len() != n || derivatives.len() != n {
        return Err(EndgameError::InsufficientSamples {
            needed: n.max(1),
            have: samples.len().min(derivatives.len()),
        });
    }

    let m = 2 * n;
    let mut z = Vec::with_capacity(m);
    for t in times {
        z.push(t.clone());
        z.push(t.clone());
    }

    // Newton coefficients are the top edge of the divided-difference table;
    // only the previous column is kept.
    let mut coeffs: Vec<DVector<C>> = Vec::with_capacity(m);
    let mut prev: Vec<DVector<C>> = (0..m).map(|j| samples[j / 2].clone()).collect();
    coeffs.push(prev[0].clone());

    for order in 1..m {
        let mut column = Vec::with_capacity(m - order);
        for j in 0..m - order {
            let value = if order == 1 && j % 2 == 0 {
                // Repeated node: the first-order difference is the derivative.
                derivatives[j / 2].clone()
            } else {
                let denom = z[j + order].clone() - z[j].clone();
                if denom.is_zero() {
                    return Err(EndgameError::Failure);
                }
                (&prev[j + 1] - &prev[j]).map(|entry| entry / denom.clone())
            };
            column.push(value);
        }
        coeffs.push(column[0].clone());
        prev = column;
    }

    // Horner evaluation of the Newton form at the target.
    let mut acc = coeffs[m - 1].clone();
    for k in (0..m - 1).rev() {
        let w = target.clone() - z[k].clone();
        acc = acc.map(|entry| entry * w.clone()) + &coeffs[k];
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use num_complex::Complex;

    fn c(re: f64) -> Complex<f64> {
        Complex::new(re, 0.0)
    }

    fn cubic(t: f64) -> (Complex<f64>, Complex<f64>) {
        // f(t) = 1 + 2t - t^3
        (c(1.0 + 2.0 * t - t * t * t), c(2.0 - 3.0 * t * t))
    }

    #[test]
    fn test_hermite_reproduces_a_cubic_exactly() {
        let nodes = [0.1, 0.05, 0.025];
        let times: Vec<_> = nodes.iter().map(|&t| c(t)).collect();
        let mut samples = Vec::new();
        let mut derivatives = Vec::new();
        for &t in &nodes {
            let (f, df) = cubic(t);
            samples.push(DVector::from_element(1, f));
            derivatives.push(DVector::from_element(1, df));
        }

        let target = c(0.0125);
        let result =
            hermite_interpolate_and_solve(&target, &times, &samples, &derivatives).unwrap();
        let (expected, _) = cubic(0.0125);
        assert_relative_eq!(result[0].re, expected.re, max_relative = 1e-12);
        assert_relative_eq!(result[0].im, expected.im, epsilon = 1e-12);
    }

    #[test]
    fn test_hermite_matches_values_at_the_nodes() {
        let nodes = [0.2, 0.1, 0.05];
        let times: Vec<_> = nodes.iter().map(|&t| c(t)).collect();
        let mut samples = Vec::new();
        let mut derivatives = Vec::new();
        for &t in &nodes {
            let (f, df) = cubic(t);
            samples.push(DVector::from_element(1, f));
            derivatives.push(DVector::from_element(1, df));
        }

        for (i, &t) in nodes.iter().enumerate() {
            let result =
                hermite_interpolate_and_solve(&c(t), &times, &samples, &derivatives).unwrap();
            assert_relative_eq!(result[0].re, samples[i][0].re, max_relative = 1e-12);
        }
    }

    #[test]
    fn test_hermite_rejects_mismatched_inputs() {
        let times = vec![c(0.1), c(0.05)];
        let samples = vec![DVector::from_element(1, c(1.0))];
        let derivatives = vec![DVector::from_element(1, c(0.0))];
        let result = hermite_interpolate_and_solve(&c(0.0), &times, &samples, &derivatives);
        assert!(matches!(
            result,
            Err(EndgameError::InsufficientSamples { .. })
        ));
    }
}
