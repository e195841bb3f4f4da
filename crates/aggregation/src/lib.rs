//! Federated gradient aggregation.
//!
//! Gradients are opaque equal-length vectors of reals; this crate knows
//! nothing about the model that produced them. [`federated_averaging`] is
//! the deterministic primitive used by the replicated round protocol;
//! [`secure_aggregation`] adds Laplacian noise and is strictly for
//! node-local use, since its output is not reproducible across replicas.

use rand::Rng;
use thiserror::Error;

/// Default elementwise tolerance when comparing gradients for duplication.
pub const DUPLICATE_EPSILON: f64 = 1e-9;

#[derive(Debug, Error, PartialEq)]
pub enum AggregationError {
    /// No gradients were supplied.
    #[error("no gradients to aggregate")]
    Empty,

    /// Weight count does not match gradient count.
    #[error("gradients and weights length mismatch: {gradients} gradients, {weights} weights")]
    LengthMismatch { gradients: usize, weights: usize },

    /// A gradient's dimension differs from the first gradient's.
    #[error("gradient {index} dimension mismatch: expected {expected}, got {actual}")]
    DimMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },

    /// A coordinate is NaN or infinite.
    #[error("non-finite value in gradient {gradient} at coordinate {coordinate}")]
    NonFinite { gradient: usize, coordinate: usize },

    /// Supplied weights sum to zero and cannot be normalized.
    #[error("weights sum to zero")]
    ZeroWeightSum,
}

/// Weighted federated averaging.
///
/// With `weights == None` every gradient contributes `1/n`. Supplied
/// weights are normalized to sum to one. All gradients must share one
/// dimension.
pub fn federated_averaging(
    gradients: &[Vec<f64>],
    weights: Option<&[f64]>,
) -> Result<Vec<f64>, AggregationError> {
    if gradients.is_empty() {
        return Err(AggregationError::Empty);
    }

    let weights = match weights {
        Some(w) if w.len() != gradients.len() => {
            return Err(AggregationError::LengthMismatch {
                gradients: gradients.len(),
                weights: w.len(),
            });
        }
        Some(w) => {
            let total: f64 = w.iter().sum();
            if total == 0.0 {
                return Err(AggregationError::ZeroWeightSum);
            }
            w.iter().map(|weight| weight / total).collect::<Vec<_>>()
        }
        None => vec![1.0 / gradients.len() as f64; gradients.len()],
    };

    let dim = gradients[0].len();
    for (index, gradient) in gradients.iter().enumerate() {
        if gradient.len() != dim {
            return Err(AggregationError::DimMismatch {
                index,
                expected: dim,
                actual: gradient.len(),
            });
        }
    }

    let mut aggregated = vec![0.0; dim];
    for (gradient, weight) in gradients.iter().zip(weights.iter()) {
        for (coordinate, value) in gradient.iter().enumerate() {
            aggregated[coordinate] += value * weight;
        }
    }

    Ok(aggregated)
}

/// Uniform federated averaging with per-coordinate Laplacian noise.
///
/// The noise comes from the standard inverse-CDF sampler over a uniform
/// draw in (-1/2, 1/2]: `x = -scale * sgn(u) * ln(1 - 2|u|)`. Output is
/// not deterministic and must never enter replicated state.
pub fn secure_aggregation(
    gradients: &[Vec<f64>],
    noise_scale: f64,
) -> Result<Vec<f64>, AggregationError> {
    let mut aggregated = federated_averaging(gradients, None)?;
    let mut rng = rand::thread_rng();
    for value in &mut aggregated {
        *value += sample_laplace(&mut rng, noise_scale);
    }
    Ok(aggregated)
}

fn sample_laplace<R: Rng>(rng: &mut R, scale: f64) -> f64 {
    if scale == 0.0 {
        return 0.0;
    }
    // u in (-0.5, 0.5); the open lower bound keeps ln(1 - 2|u|) finite.
    let u: f64 = rng.gen_range(f64::EPSILON..1.0) - 0.5;
    -scale * u.signum() * (1.0 - 2.0 * u.abs()).ln()
}

/// Validate a batch of gradients before aggregation: non-empty, uniform
/// dimension, every coordinate finite.
pub fn validate_aggregation(gradients: &[Vec<f64>]) -> Result<(), AggregationError> {
    if gradients.is_empty() {
        return Err(AggregationError::Empty);
    }

    let dim = gradients[0].len();
    for (index, gradient) in gradients.iter().enumerate() {
        if gradient.len() != dim {
            return Err(AggregationError::DimMismatch {
                index,
                expected: dim,
                actual: gradient.len(),
            });
        }
        for (coordinate, value) in gradient.iter().enumerate() {
            if !value.is_finite() {
                return Err(AggregationError::NonFinite {
                    gradient: index,
                    coordinate,
                });
            }
        }
    }

    Ok(())
}

/// Whether `candidate` matches any existing gradient elementwise within
/// `epsilon`. Vectors of different dimension never match.
pub fn is_duplicate_gradient(candidate: &[f64], existing: &[Vec<f64>], epsilon: f64) -> bool {
    existing.iter().any(|gradient| {
        gradient.len() == candidate.len()
            && gradient
                .iter()
                .zip(candidate.iter())
                .all(|(a, b)| (a - b).abs() <= epsilon)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_average_is_arithmetic_mean() {
        let gradients = vec![
            vec![1.0, 2.0, 3.0],
            vec![2.0, 3.0, 4.0],
            vec![3.0, 4.0, 5.0],
        ];
        let aggregated = federated_averaging(&gradients, None).unwrap();
        for (value, expected) in aggregated.iter().zip([2.0, 3.0, 4.0]) {
            assert!((value - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn test_weights_are_normalized() {
        let gradients = vec![vec![0.0], vec![10.0]];
        // 3:1 split, unnormalized.
        let aggregated = federated_averaging(&gradients, Some(&[3.0, 1.0])).unwrap();
        assert!((aggregated[0] - 2.5).abs() < 1e-12);
    }

    #[test]
    fn test_empty_input_rejected() {
        assert_eq!(
            federated_averaging(&[], None),
            Err(AggregationError::Empty)
        );
        assert_eq!(validate_aggregation(&[]), Err(AggregationError::Empty));
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let gradients = vec![vec![1.0], vec![2.0]];
        assert_eq!(
            federated_averaging(&gradients, Some(&[1.0])),
            Err(AggregationError::LengthMismatch {
                gradients: 2,
                weights: 1
            })
        );
    }

    #[test]
    fn test_dim_mismatch_rejected() {
        let gradients = vec![vec![1.0, 2.0], vec![1.0]];
        assert!(matches!(
            federated_averaging(&gradients, None),
            Err(AggregationError::DimMismatch { index: 1, .. })
        ));
        assert!(matches!(
            validate_aggregation(&gradients),
            Err(AggregationError::DimMismatch { index: 1, .. })
        ));
    }

    #[test]
    fn test_zero_weight_sum_rejected() {
        let gradients = vec![vec![1.0], vec![2.0]];
        assert_eq!(
            federated_averaging(&gradients, Some(&[0.0, 0.0])),
            Err(AggregationError::ZeroWeightSum)
        );
    }

    #[test]
    fn test_validate_rejects_non_finite() {
        let nan = vec![vec![1.0, f64::NAN]];
        assert_eq!(
            validate_aggregation(&nan),
            Err(AggregationError::NonFinite {
                gradient: 0,
                coordinate: 1
            })
        );

        let inf = vec![vec![f64::INFINITY]];
        assert!(matches!(
            validate_aggregation(&inf),
            Err(AggregationError::NonFinite { .. })
        ));
    }

    #[test]
    fn test_secure_aggregation_zero_noise_matches_plain() {
        let gradients = vec![vec![1.0, 5.0], vec![3.0, 7.0]];
        let plain = federated_averaging(&gradients, None).unwrap();
        let secure = secure_aggregation(&gradients, 0.0).unwrap();
        assert_eq!(plain, secure);
    }

    #[test]
    fn test_secure_aggregation_stays_finite() {
        let gradients = vec![vec![1.0; 64]; 8];
        let noised = secure_aggregation(&gradients, 0.5).unwrap();
        assert_eq!(noised.len(), 64);
        assert!(noised.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_duplicate_detection() {
        let existing = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
        assert!(is_duplicate_gradient(
            &[1.0 + 1e-12, 2.0],
            &existing,
            DUPLICATE_EPSILON
        ));
        assert!(!is_duplicate_gradient(
            &[1.0, 2.1],
            &existing,
            DUPLICATE_EPSILON
        ));
        assert!(!is_duplicate_gradient(
            &[1.0, 2.0, 0.0],
            &existing,
            DUPLICATE_EPSILON
        ));
    }
}
