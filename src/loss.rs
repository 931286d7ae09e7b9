//! Loss Functions
//!
//! A loss is a pure function from predictions and truth to a gradient (fed
//! into the model's backward pass) and a scalar (for reporting). The model
//! never sees the loss; the training loop wires the two together.
//!
//! ## Categorical Cross-Entropy
//!
//! For class probabilities `p` and the true class `t`:
//!
//! ```text
//! loss     = -log(p[t])                 summed over positions
//! gradient = p - one_hot(t)             per position
//! ```
//!
//! That gradient is with respect to the *logits* of the softmax that produced
//! `p`; the softmax-plus-cross-entropy derivative collapses to this simple
//! difference, which is why the softmax layer's backward pass only has to
//! undo its affine projection. The log is clamped away from zero so a
//! confidently wrong prediction reports a large finite loss instead of
//! infinity.

use crate::error::{ModelError, Result};
use crate::tensor::Tensor;

/// Floor for probabilities inside the log, against -inf losses.
const MIN_PROB: f32 = 1e-10;

/// Categorical cross-entropy over a batch of class distributions.
///
/// # Arguments
///
/// * `probs` - `[positions, nr_class]` rows of class probabilities
/// * `truth` - the true class per position
///
/// # Returns
///
/// `(gradient, loss)`: the gradient has the shape of `probs`, the loss is
/// summed over positions (divide by the position count for a mean).
pub fn categorical_crossentropy(probs: &Tensor, truth: &[usize]) -> Result<(Tensor, f32)> {
    if probs.shape.len() != 2 || probs.rows() != truth.len() {
        return Err(ModelError::shape(
            "loss",
            format!("[{}, *] probabilities", truth.len()),
            probs.shape_str(),
        ));
    }
    let nr_class = probs.cols();

    let mut gradient = probs.clone();
    let mut loss = 0.0;
    for (i, &t) in truth.iter().enumerate() {
        if t >= nr_class {
            return Err(ModelError::shape(
                "loss",
                format!("class < {}", nr_class),
                format!("class {}", t),
            ));
        }
        let p = probs.data[i * nr_class + t];
        loss -= p.max(MIN_PROB).ln();
        gradient.data[i * nr_class + t] -= 1.0;
    }
    Ok((gradient, loss))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gradient_is_probs_minus_one_hot() {
        let probs = Tensor::new(vec![0.7, 0.2, 0.1, 0.1, 0.8, 0.1], vec![2, 3]);
        let (grad, _) = categorical_crossentropy(&probs, &[0, 2]).unwrap();
        let expected = [0.7 - 1.0, 0.2, 0.1, 0.1, 0.8, 0.1 - 1.0];
        for (g, e) in grad.data.iter().zip(&expected) {
            assert!((g - e).abs() < 1e-6);
        }
    }

    #[test]
    fn test_perfect_prediction_has_zero_loss() {
        let probs = Tensor::new(vec![1.0, 0.0], vec![1, 2]);
        let (grad, loss) = categorical_crossentropy(&probs, &[0]).unwrap();
        assert!(loss.abs() < 1e-6);
        assert!(grad.data.iter().all(|&g| g.abs() < 1e-6));
    }

    #[test]
    fn test_confident_mistake_is_finite() {
        let probs = Tensor::new(vec![1.0, 0.0], vec![1, 2]);
        let (_, loss) = categorical_crossentropy(&probs, &[1]).unwrap();
        assert!(loss.is_finite());
        assert!(loss > 10.0);
    }

    #[test]
    fn test_row_count_mismatch_is_an_error() {
        let probs = Tensor::new(vec![0.5, 0.5], vec![1, 2]);
        assert!(categorical_crossentropy(&probs, &[0, 1]).is_err());
    }

    #[test]
    fn test_out_of_range_class_is_an_error() {
        let probs = Tensor::new(vec![0.5, 0.5], vec![1, 2]);
        assert!(categorical_crossentropy(&probs, &[2]).is_err());
    }
}
