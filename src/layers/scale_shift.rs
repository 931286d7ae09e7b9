//! Scale-Shift Layer
//!
//! A learned per-feature affine reparameterization: `y = x * g + b` with `g`
//! and `b` vectors of the feature width. Placed after a normalization layer
//! it lets the network recover any scale and offset the normalization took
//! away, starting from the identity (`g = 1`, `b = 0`).
//!
//! The gradient is elementwise:
//!
//! ```text
//! grad_g = sum(grad_y * x, axis=0)
//! grad_b = sum(grad_y, axis=0)
//! grad_x = grad_y * g
//! ```

use crate::error::Result;
use crate::layers::{check_grad_shape, param_key, Batch, Context, Layer};
use crate::ops::{CpuOps, Ops};
use crate::optimizer::Sgd;
use crate::tensor::Tensor;
use crate::ModelError;

/// Per-feature learned scale and shift.
pub struct ScaleShift<O: Ops = CpuOps> {
    name: String,
    nr_dim: usize,
    /// Scale vector [nr_dim], initialized to 1
    pub g: Tensor,
    /// Shift vector [nr_dim], initialized to 0
    pub b: Tensor,
    d_g: Tensor,
    d_b: Tensor,
    ops: O,
}

struct ScaleShiftContext {
    input: Tensor,
}

impl ScaleShift<CpuOps> {
    /// Create a scale-shift layer for `nr_dim` features on the CPU backend.
    pub fn new(nr_dim: usize) -> Self {
        Self::with_ops(CpuOps, nr_dim)
    }
}

impl<O: Ops> ScaleShift<O> {
    /// Create a scale-shift layer on a custom backend.
    pub fn with_ops(ops: O, nr_dim: usize) -> Self {
        Self {
            name: "scaleshift".to_string(),
            nr_dim,
            g: Tensor::new(vec![1.0; nr_dim], vec![nr_dim]),
            b: Tensor::zeros(vec![nr_dim]),
            d_g: Tensor::zeros(vec![nr_dim]),
            d_b: Tensor::zeros(vec![nr_dim]),
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

    fn transform(&self, x: &Tensor) -> Tensor {
        self.ops.add(&self.ops.mul(x, &self.g), &self.b)
    }
}

impl<O: Ops> Layer for ScaleShift<O> {
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
        let y = self.transform(input);
        let ctx = Context::new(
            "scaleshift",
            ScaleShiftContext {
                input: input.clone(),
            },
        );
        Ok((Batch::dense_with_lengths(y, lengths.to_vec()), ctx))
    }

    fn backward(&mut self, ctx: Context, grad: &Tensor, optimizer: &mut Sgd) -> Result<Tensor> {
        let cache: ScaleShiftContext = ctx.take("scaleshift", &self.name)?;
        check_grad_shape(&self.name, grad, cache.input.rows(), self.nr_dim)?;

        for i in 0..grad.rows() {
            let g_row = grad.row(i);
            let x_row = cache.input.row(i);
            for j in 0..self.nr_dim {
                self.d_g.data[j] += g_row[j] * x_row[j];
                self.d_b.data[j] += g_row[j];
            }
        }

        // Input gradient uses the scale the forward pass saw.
        let d_x = self.ops.mul(grad, &self.g);

        optimizer.update(&param_key(&self.name, "g"), &mut self.g, &mut self.d_g)?;
        optimizer.update(&param_key(&self.name, "b"), &mut self.b, &mut self.d_b)?;

        Ok(d_x)
    }

    fn predict(&self, x: &Batch) -> Result<Batch> {
        let (input, lengths) = x.as_dense(&self.name)?;
        self.check_input(input)?;
        Ok(Batch::dense_with_lengths(
            self.transform(input),
            lengths.to_vec(),
        ))
    }

    fn tensors(&self) -> Vec<(String, &Tensor)> {
        vec![("g".to_string(), &self.g), ("b".to_string(), &self.b)]
    }

    fn tensors_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        vec![
            ("g".to_string(), &mut self.g),
            ("b".to_string(), &mut self.b),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_as_identity() {
        let layer = ScaleShift::new(3);
        let x = Batch::dense(Tensor::new(vec![1.0, -2.0, 0.5], vec![1, 3]));
        let y = layer.predict(&x).unwrap();
        let (y, _) = y.as_dense("test").unwrap();
        assert_eq!(y.data, vec![1.0, -2.0, 0.5]);
    }

    #[test]
    fn test_elementwise_gradients() {
        let mut layer = ScaleShift::new(2);
        layer.g = Tensor::new(vec![2.0, 3.0], vec![2]);
        let mut sgd = Sgd::new(1.0);

        let x = Batch::dense(Tensor::new(vec![1.0, -1.0], vec![1, 2]));
        let (_, ctx) = layer.begin_update(&x, 0.0).unwrap();
        let grad = Tensor::new(vec![0.5, 0.5], vec![1, 2]);
        let d_x = layer.backward(ctx, &grad, &mut sgd).unwrap();

        // grad_x = grad * old g.
        assert_eq!(d_x.data, vec![1.0, 1.5]);
        // g -= grad * x ; b -= grad.
        assert_eq!(layer.g.data, vec![1.5, 3.5]);
        assert_eq!(layer.b.data, vec![-0.5, -0.5]);
    }
}
