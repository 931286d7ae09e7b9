//! Affine Layer (Fully Connected)
//!
//! The affine layer is the fundamental building block of the library.
//! It performs the transformation `y = x @ W^T + b`.
//!
//! ## Forward Pass
//!
//! ```text
//! Input:  x [positions, nr_in]
//! Weight: W [nr_out, nr_in]
//! Bias:   b [nr_out]
//! Output: y = x @ W^T + b [positions, nr_out]
//! ```
//!
//! ## Backward Pass
//!
//! Using the chain rule:
//!
//! ```text
//! grad_W = grad_y^T @ x        (the batch sum of outer(grad_y_i, x_i))
//! grad_b = sum(grad_y, axis=0)
//! grad_x = grad_y @ W
//! ```
//!
//! ## Why These Gradients?
//!
//! - **grad_W**: Each weight W[o,i] affects output y[*,o] through input x[*,i]
//! - **grad_b**: Each bias b[o] affects all outputs y[*,o] equally
//! - **grad_x**: Needed to backprop to the previous layer
//!
//! ## Implementation Notes
//!
//! - Uses He initialization: scale = √(2/nr_in)
//! - Bias initialized to zero
//! - Caches the input x in the backward context

use crate::error::{ModelError, Result};
use crate::layers::{accumulate, check_grad_shape, param_key, Batch, Context, Layer};
use crate::ops::{CpuOps, Ops};
use crate::optimizer::Sgd;
use crate::tensor::Tensor;

/// Helper function for random weight initialization
///
/// Uses a simple LCG (Linear Congruential Generator) for reproducible
/// initialization. The scale parameter controls the magnitude of initial
/// weights.
pub fn random_init(size: usize, seed: u64, scale: f32) -> Vec<f32> {
    let mut rng = seed;
    (0..size)
        .map(|_| {
            rng = rng.wrapping_mul(1103515245).wrapping_add(12345);
            let val = ((rng / 65536) % 32768) as f32 / 32768.0;
            (val - 0.5) * 2.0 * scale
        })
        .collect()
}

/// Fully connected layer: `y = x @ W^T + b`.
///
/// The weight matrix is stored `[nr_out, nr_in]`, so each row of `W` is the
/// receptive field of one output unit.
pub struct Affine<O: Ops = CpuOps> {
    name: String,
    nr_out: usize,
    nr_in: usize,
    /// Weight matrix [nr_out, nr_in]
    pub w: Tensor,
    /// Bias vector [nr_out]
    pub b: Tensor,
    d_w: Tensor,
    d_b: Tensor,
    ops: O,
}

/// Backward cache: the input the forward pass saw.
struct AffineContext {
    input: Tensor,
}

impl Affine<CpuOps> {
    /// Create an affine layer on the CPU backend with He initialization.
    ///
    /// # Arguments
    ///
    /// * `nr_out` - Output width
    /// * `nr_in` - Input width
    /// * `seed` - Random seed for reproducible initialization
    pub fn new(nr_out: usize, nr_in: usize, seed: u64) -> Self {
        Self::with_ops(CpuOps, nr_out, nr_in, seed)
    }
}

impl<O: Ops> Affine<O> {
    /// Create an affine layer on a custom backend.
    pub fn with_ops(ops: O, nr_out: usize, nr_in: usize, seed: u64) -> Self {
        let scale = (2.0 / nr_in as f32).sqrt();
        Self {
            name: "affine".to_string(),
            nr_out,
            nr_in,
            w: Tensor::new(random_init(nr_out * nr_in, seed, scale), vec![nr_out, nr_in]),
            b: Tensor::zeros(vec![nr_out]),
            d_w: Tensor::zeros(vec![nr_out, nr_in]),
            d_b: Tensor::zeros(vec![nr_out]),
            ops,
        }
    }

    /// Rename the layer. Names key optimizer state and checkpoints, so give
    /// every layer in a chain a distinct one.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// The shared compute path: `x @ W^T + b`.
    fn project(&self, x: &Tensor) -> Tensor {
        let wt = self.ops.transpose(&self.w);
        self.ops.add(&self.ops.matmul(x, &wt), &self.b)
    }

    fn check_input(&self, x: &Tensor) -> Result<()> {
        if x.shape.len() != 2 || x.cols() != self.nr_in {
            return Err(ModelError::shape(
                &self.name,
                format!("[*, {}]", self.nr_in),
                x.shape_str(),
            ));
        }
        Ok(())
    }
}

impl<O: Ops> Layer for Affine<O> {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_dim(&self) -> Option<usize> {
        Some(self.nr_in)
    }

    fn output_dim(&self) -> Option<usize> {
        Some(self.nr_out)
    }

    fn begin_update(&mut self, x: &Batch, _dropout: f32) -> Result<(Batch, Context)> {
        let (input, lengths) = x.as_dense(&self.name)?;
        self.check_input(input)?;
        let y = self.project(input);
        let ctx = Context::new(
            "affine",
            AffineContext {
                input: input.clone(),
            },
        );
        Ok((Batch::dense_with_lengths(y, lengths.to_vec()), ctx))
    }

    fn backward(&mut self, ctx: Context, grad: &Tensor, optimizer: &mut Sgd) -> Result<Tensor> {
        let cache: AffineContext = ctx.take("affine", &self.name)?;
        check_grad_shape(&self.name, grad, cache.input.rows(), self.nr_out)?;

        // grad_W = grad^T @ x, the batch sum of per-row outer products.
        let d_w = self.ops.matmul(&self.ops.transpose(grad), &cache.input);
        accumulate(&mut self.d_w, &d_w);

        // grad_b = column sums of grad.
        for i in 0..grad.rows() {
            for (acc, &g) in self.d_b.data.iter_mut().zip(grad.row(i)) {
                *acc += g;
            }
        }

        // grad_x = grad @ W, with the weights the forward pass used, so the
        // input gradient is computed before the optimizer mutates them.
        let d_x = self.ops.matmul(grad, &self.w);

        optimizer.update(&param_key(&self.name, "W"), &mut self.w, &mut self.d_w)?;
        optimizer.update(&param_key(&self.name, "b"), &mut self.b, &mut self.d_b)?;

        Ok(d_x)
    }

    fn predict(&self, x: &Batch) -> Result<Batch> {
        let (input, lengths) = x.as_dense(&self.name)?;
        self.check_input(input)?;
        Ok(Batch::dense_with_lengths(
            self.project(input),
            lengths.to_vec(),
        ))
    }

    fn tensors(&self) -> Vec<(String, &Tensor)> {
        vec![("W".to_string(), &self.w), ("b".to_string(), &self.b)]
    }

    fn tensors_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        vec![
            ("W".to_string(), &mut self.w),
            ("b".to_string(), &mut self.b),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_layer() -> Affine {
        let mut layer = Affine::new(2, 2, 0).named("affine1");
        layer.w = Tensor::new(vec![1.0, 0.0, 0.0, 1.0], vec![2, 2]);
        layer.b = Tensor::zeros(vec![2]);
        layer
    }

    fn predict_row(layer: &Affine, row: Vec<f32>) -> Vec<f32> {
        let out = layer
            .predict(&Batch::dense(Tensor::new(row, vec![1, 2])))
            .unwrap();
        let (data, _) = out.as_dense("test").unwrap();
        data.data.clone()
    }

    #[test]
    fn test_zero_weights_reproduce_bias() {
        let mut layer = Affine::new(2, 2, 0);
        layer.w = Tensor::zeros(vec![2, 2]);
        layer.b = Tensor::new(vec![2.0, 5.0], vec![2]);
        assert_eq!(predict_row(&layer, vec![3.0, -7.0]), vec![2.0, 5.0]);
        assert_eq!(predict_row(&layer, vec![0.0, 0.0]), vec![2.0, 5.0]);
    }

    #[test]
    fn test_identity_weights_pass_input_through() {
        let layer = identity_layer();
        assert_eq!(predict_row(&layer, vec![1.0, 0.0]), vec![1.0, 0.0]);
        assert_eq!(predict_row(&layer, vec![0.0, 1.0]), vec![0.0, 1.0]);
        assert_eq!(predict_row(&layer, vec![1.0, 1.0]), vec![1.0, 1.0]);
    }

    #[test]
    fn test_gradient_descent_update_steps() {
        let mut layer = identity_layer();
        let mut sgd = Sgd::new(1.0);

        // Zero input: the weight gradient is an outer product with the zero
        // vector, so only the bias moves.
        let x = Batch::dense(Tensor::new(vec![0.0, 0.0], vec![1, 2]));
        let (scores, ctx) = layer.begin_update(&x, 0.0).unwrap();
        let (scores, _) = scores.as_dense("test").unwrap();
        assert_eq!(scores.data[0], scores.data[1]);

        let grad = Tensor::new(vec![-1.0, 0.0], vec![1, 2]);
        layer.backward(ctx, &grad, &mut sgd).unwrap();

        assert_eq!(layer.b.data, vec![1.0, 0.0]);
        assert_eq!(layer.w.data, vec![1.0, 0.0, 0.0, 1.0]);

        // Input [1, 0] with gradient [0, -1]: the weight update is
        // outer([0, -1], [1, 0]) = [[0, 0], [-1, 0]] subtracted from W.
        let x = Batch::dense(Tensor::new(vec![1.0, 0.0], vec![1, 2]));
        let (_, ctx) = layer.begin_update(&x, 0.0).unwrap();
        let grad = Tensor::new(vec![0.0, -1.0], vec![1, 2]);
        layer.backward(ctx, &grad, &mut sgd).unwrap();

        assert_eq!(layer.b.data, vec![1.0, 1.0]);
        assert_eq!(layer.w.data, vec![1.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_input_gradient_flows_through_weights() {
        let mut layer = identity_layer();
        let mut sgd = Sgd::new(0.0);
        let x = Batch::dense(Tensor::new(vec![0.5, -0.5], vec![1, 2]));
        let (_, ctx) = layer.begin_update(&x, 0.0).unwrap();
        let grad = Tensor::new(vec![2.0, 3.0], vec![1, 2]);
        let d_x = layer.backward(ctx, &grad, &mut sgd).unwrap();
        // grad @ I = grad.
        assert_eq!(d_x.data, vec![2.0, 3.0]);
    }

    #[test]
    fn test_wrong_width_fails_fast() {
        let mut layer = identity_layer();
        let x = Batch::dense(Tensor::zeros(vec![1, 3]));
        let err = layer.begin_update(&x, 0.0).unwrap_err();
        assert!(matches!(err, ModelError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_wrong_gradient_shape_is_contract_violation() {
        let mut layer = identity_layer();
        let mut sgd = Sgd::new(1.0);
        let x = Batch::dense(Tensor::zeros(vec![2, 2]));
        let (_, ctx) = layer.begin_update(&x, 0.0).unwrap();
        let bad_grad = Tensor::zeros(vec![1, 2]);
        let err = layer.backward(ctx, &bad_grad, &mut sgd).unwrap_err();
        assert!(matches!(err, ModelError::ContractViolation { .. }));
    }
}
