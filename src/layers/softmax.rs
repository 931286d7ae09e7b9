//! Softmax Output Layer
//!
//! An affine projection onto the class space followed by a row softmax:
//!
//! ```text
//! logits = x @ W^T + b          [positions, nr_class]
//! probs  = softmax(logits)      rows sum to 1
//! ```
//!
//! ## Pairing With the Loss
//!
//! This layer is meant to sit under categorical cross-entropy. The
//! softmax-plus-cross-entropy combination has the famously simple gradient
//!
//! ```text
//! d_logits = probs - one_hot(truth)
//! ```
//!
//! which is exactly what [`categorical_crossentropy`](crate::loss::categorical_crossentropy)
//! returns. The backward pass here therefore treats the incoming gradient as
//! the gradient with respect to the *logits* and only has to undo the affine
//! projection, the same math as the affine layer's backward pass.
//!
//! No dropout is applied: these are the model's predictions, not hidden
//! activations.

use crate::error::Result;
use crate::layers::{accumulate, check_grad_shape, param_key, Batch, Context, Layer};
use crate::layers::affine::random_init;
use crate::ops::{CpuOps, Ops};
use crate::optimizer::Sgd;
use crate::tensor::Tensor;
use crate::ModelError;

/// Affine projection plus row softmax; the standard classification head.
pub struct Softmax<O: Ops = CpuOps> {
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

struct SoftmaxContext {
    input: Tensor,
}

impl Softmax<CpuOps> {
    /// Create a softmax head on the CPU backend.
    ///
    /// # Arguments
    ///
    /// * `nr_out` - Number of classes
    /// * `nr_in` - Input width
    /// * `seed` - Random seed for reproducible initialization
    pub fn new(nr_out: usize, nr_in: usize, seed: u64) -> Self {
        Self::with_ops(CpuOps, nr_out, nr_in, seed)
    }
}

impl<O: Ops> Softmax<O> {
    /// Create a softmax head on a custom backend.
    pub fn with_ops(ops: O, nr_out: usize, nr_in: usize, seed: u64) -> Self {
        let scale = (2.0 / nr_in as f32).sqrt();
        Self {
            name: "softmax".to_string(),
            nr_out,
            nr_in,
            w: Tensor::new(random_init(nr_out * nr_in, seed, scale), vec![nr_out, nr_in]),
            b: Tensor::zeros(vec![nr_out]),
            d_w: Tensor::zeros(vec![nr_out, nr_in]),
            d_b: Tensor::zeros(vec![nr_out]),
            ops,
        }
    }

    /// Rename the layer.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn probabilities(&self, x: &Tensor) -> Tensor {
        let wt = self.ops.transpose(&self.w);
        let mut logits = self.ops.add(&self.ops.matmul(x, &wt), &self.b);
        self.ops.softmax_inplace(&mut logits);
        logits
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

impl<O: Ops> Layer for Softmax<O> {
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
        let probs = self.probabilities(input);
        let ctx = Context::new(
            "softmax",
            SoftmaxContext {
                input: input.clone(),
            },
        );
        Ok((Batch::dense_with_lengths(probs, lengths.to_vec()), ctx))
    }

    fn backward(&mut self, ctx: Context, grad: &Tensor, optimizer: &mut Sgd) -> Result<Tensor> {
        let cache: SoftmaxContext = ctx.take("softmax", &self.name)?;
        check_grad_shape(&self.name, grad, cache.input.rows(), self.nr_out)?;

        // The incoming gradient is with respect to the logits (see the module
        // docs), so this is the affine backward pass.
        let d_w = self.ops.matmul(&self.ops.transpose(grad), &cache.input);
        accumulate(&mut self.d_w, &d_w);
        for i in 0..grad.rows() {
            for (acc, &g) in self.d_b.data.iter_mut().zip(grad.row(i)) {
                *acc += g;
            }
        }

        // Input gradient uses the weights the forward pass saw.
        let d_x = self.ops.matmul(grad, &self.w);

        optimizer.update(&param_key(&self.name, "W"), &mut self.w, &mut self.d_w)?;
        optimizer.update(&param_key(&self.name, "b"), &mut self.b, &mut self.d_b)?;

        Ok(d_x)
    }

    fn predict(&self, x: &Batch) -> Result<Batch> {
        let (input, lengths) = x.as_dense(&self.name)?;
        self.check_input(input)?;
        Ok(Batch::dense_with_lengths(
            self.probabilities(input),
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
