//! Batch Normalization
//!
//! Normalizes each feature to zero mean and unit variance using the current
//! mini-batch's statistics, which keeps activations in a healthy range as the
//! layers above keep shifting. Pair it with
//! [`ScaleShift`](crate::layers::ScaleShift) when the network should be able
//! to undo the normalization where that helps.
//!
//! ## Training vs. Inference
//!
//! - **Training**: normalize with the batch mean and variance, and fold those
//!   statistics into exponentially-averaged population estimates.
//! - **Inference**: normalize with the population estimates only, so a
//!   prediction for one token does not depend on what else happened to be in
//!   its batch.
//!
//! ## The Tricky Part: Backward Pass
//!
//! The batch mean and variance depend on *every* row, so each input element
//! influences each output element. The full gradient is
//!
//! ```text
//! grad_x = (grad_y - E[grad_y] - x_norm * E[grad_y * x_norm]) / std
//! ```
//!
//! with the expectations taken over the batch, per feature. The two
//! expectation terms account for the mean and variance dependencies; dropping
//! them is a common approximation, but the exact form is cheap here and is
//! verified against finite differences in the tests.
//!
//! An epsilon floor inside the square root keeps a zero-variance feature from
//! dividing by zero.

use crate::error::Result;
use crate::layers::{check_grad_shape, Batch, Context, Layer};
use crate::ops::{CpuOps, Ops};
use crate::optimizer::Sgd;
use crate::tensor::Tensor;
use crate::ModelError;

/// Per-feature batch normalization with running population statistics.
pub struct BatchNorm<O: Ops = CpuOps> {
    name: String,
    nr_dim: usize,
    eps: f32,
    /// Fraction of each batch folded into the running estimates.
    momentum: f32,
    running_mean: Tensor,
    running_var: Tensor,
    ops: O,
}

struct BatchNormContext {
    x_norm: Tensor,
    /// Per-feature sqrt(var + eps) for the batch.
    std: Vec<f32>,
}

impl BatchNorm<CpuOps> {
    /// Create a batch-norm layer for `nr_dim` features on the CPU backend.
    ///
    /// Population estimates start at mean 0, variance 1, so an untrained
    /// layer is (nearly) the identity at inference time.
    pub fn new(nr_dim: usize) -> Self {
        Self::with_ops(CpuOps, nr_dim)
    }
}

impl<O: Ops> BatchNorm<O> {
    /// Create a batch-norm layer on a custom backend.
    pub fn with_ops(ops: O, nr_dim: usize) -> Self {
        Self {
            name: "batchnorm".to_string(),
            nr_dim,
            eps: 1e-5,
            momentum: 0.1,
            running_mean: Tensor::zeros(vec![nr_dim]),
            running_var: Tensor::new(vec![1.0; nr_dim], vec![nr_dim]),
            ops,
        }
    }

    /// Rename the layer.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn check_input(&self, x: &Tensor) -> Result<()> {
        if x.shape.len() != 2 || x.cols() != self.nr_dim {
            return Err(ModelError::shape(
                &self.name,
                format!("[*, {}]", self.nr_dim),
                x.shape_str(),
            ));
        }
        Ok(())
    }

    /// Normalize with the given per-feature statistics.
    fn normalize(&self, x: &Tensor, mean: &[f32], var: &[f32]) -> Tensor {
        let cols = self.nr_dim;
        let mut out = self.ops.allocate(x.shape.clone());
        for i in 0..x.rows() {
            for j in 0..cols {
                let std = (var[j] + self.eps).sqrt();
                out.data[i * cols + j] = (x.data[i * cols + j] - mean[j]) / std;
            }
        }
        out
    }
}

impl<O: Ops> Layer for BatchNorm<O> {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_dim(&self) -> Option<usize> {
        Some(self.nr_dim)
    }

    fn output_dim(&self) -> Option<usize> {
        Some(self.nr_dim)
    }

    fn begin_update(&mut self, x: &Batch, _dropout: f32) -> Result<(Batch, Context)> {
        let (input, lengths) = x.as_dense(&self.name)?;
        self.check_input(input)?;

        let mean = self.ops.mean_axis0(input);
        let var = self.ops.var_axis0(input, &mean);
        let x_norm = self.normalize(input, &mean.data, &var.data);

        // Fold the batch statistics into the population estimates.
        for j in 0..self.nr_dim {
            self.running_mean.data[j] =
                (1.0 - self.momentum) * self.running_mean.data[j] + self.momentum * mean.data[j];
            self.running_var.data[j] =
                (1.0 - self.momentum) * self.running_var.data[j] + self.momentum * var.data[j];
        }

        let std = var.data.iter().map(|&v| (v + self.eps).sqrt()).collect();
        let ctx = Context::new(
            "batchnorm",
            BatchNormContext {
                x_norm: x_norm.clone(),
                std,
            },
        );
        Ok((Batch::dense_with_lengths(x_norm, lengths.to_vec()), ctx))
    }

    fn backward(&mut self, ctx: Context, grad: &Tensor, _optimizer: &mut Sgd) -> Result<Tensor> {
        let cache: BatchNormContext = ctx.take("batchnorm", &self.name)?;
        let rows = cache.x_norm.rows();
        check_grad_shape(&self.name, grad, rows, self.nr_dim)?;

        let cols = self.nr_dim;
        let n = rows as f32;

        // Per-feature expectations over the batch.
        let mut mean_grad = vec![0.0; cols];
        let mut mean_grad_xnorm = vec![0.0; cols];
        for i in 0..rows {
            for j in 0..cols {
                let idx = i * cols + j;
                mean_grad[j] += grad.data[idx];
                mean_grad_xnorm[j] += grad.data[idx] * cache.x_norm.data[idx];
            }
        }
        for j in 0..cols {
            mean_grad[j] /= n;
            mean_grad_xnorm[j] /= n;
        }

        let mut d_x = self.ops.allocate(vec![rows, cols]);
        for i in 0..rows {
            for j in 0..cols {
                let idx = i * cols + j;
                d_x.data[idx] = (grad.data[idx]
                    - mean_grad[j]
                    - cache.x_norm.data[idx] * mean_grad_xnorm[j])
                    / cache.std[j];
            }
        }
        Ok(d_x)
    }

    fn predict(&self, x: &Batch) -> Result<Batch> {
        let (input, lengths) = x.as_dense(&self.name)?;
        self.check_input(input)?;
        let out = self.normalize(input, &self.running_mean.data, &self.running_var.data);
        Ok(Batch::dense_with_lengths(out, lengths.to_vec()))
    }

    fn tensors(&self) -> Vec<(String, &Tensor)> {
        vec![
            ("mean".to_string(), &self.running_mean),
            ("var".to_string(), &self.running_var),
        ]
    }

    fn tensors_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        vec![
            ("mean".to_string(), &mut self.running_mean),
            ("var".to_string(), &mut self.running_var),
        ]
    }
}
