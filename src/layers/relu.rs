//! Rectified Linear Activation
//!
//! `y = max(0, x)`, element-wise. The backward pass zeroes the gradient
//! wherever the forward input was at or below zero, since those units
//! contributed nothing to the output.
//!
//! During training this layer also applies inverted dropout to its output:
//! activations are the natural place to regularize, and keeping dropout here
//! (rather than in the affine layers) means an affine followed by a ReLU is
//! dropped exactly once.

use crate::layers::{apply_dropout, check_grad_shape, Batch, Context, Layer};
use crate::ops::{CpuOps, Ops};
use crate::optimizer::Sgd;
use crate::tensor::Tensor;
use crate::Result;

/// ReLU activation with training-time dropout on its output.
pub struct Relu<O: Ops = CpuOps> {
    name: String,
    ops: O,
}

struct ReluContext {
    /// The forward input; entries <= 0 gate the gradient to zero.
    input: Tensor,
    mask: Option<Tensor>,
}

impl Relu<CpuOps> {
    /// Create a ReLU layer on the CPU backend.
    pub fn new() -> Self {
        Self::with_ops(CpuOps)
    }
}

impl Default for Relu<CpuOps> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O: Ops> Relu<O> {
    /// Create a ReLU layer on a custom backend.
    pub fn with_ops(ops: O) -> Self {
        Self {
            name: "relu".to_string(),
            ops,
        }
    }

    /// Rename the layer.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl<O: Ops> Layer for Relu<O> {
    fn name(&self) -> &str {
        &self.name
    }

    fn begin_update(&mut self, x: &Batch, dropout: f32) -> Result<(Batch, Context)> {
        let (input, lengths) = x.as_dense(&self.name)?;
        let y = self.ops.clip_low(input, 0.0);
        let (y, mask) = apply_dropout(&self.ops, y, dropout);
        let ctx = Context::new(
            "relu",
            ReluContext {
                input: input.clone(),
                mask,
            },
        );
        Ok((Batch::dense_with_lengths(y, lengths.to_vec()), ctx))
    }

    fn backward(&mut self, ctx: Context, grad: &Tensor, _optimizer: &mut Sgd) -> Result<Tensor> {
        let cache: ReluContext = ctx.take("relu", &self.name)?;
        check_grad_shape(&self.name, grad, cache.input.rows(), cache.input.cols())?;

        let grad = match &cache.mask {
            Some(mask) => self.ops.mul(grad, mask),
            None => grad.clone(),
        };

        let data = grad
            .data
            .iter()
            .zip(&cache.input.data)
            .map(|(&g, &x)| if x > 0.0 { g } else { 0.0 })
            .collect();
        Ok(Tensor::new(data, grad.shape.clone()))
    }

    fn predict(&self, x: &Batch) -> Result<Batch> {
        let (input, lengths) = x.as_dense(&self.name)?;
        Ok(Batch::dense_with_lengths(
            self.ops.clip_low(input, 0.0),
            lengths.to_vec(),
        ))
    }
}
