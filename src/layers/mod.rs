//! Neural Network Layers
//!
//! This module contains the layer abstraction and every concrete layer the
//! library ships. Layers are the unit of composition: a model is an ordered
//! chain of them, built by [`Chain`](crate::model::Chain).
//!
//! ## Layers
//!
//! - **affine**: Fully connected transformation `y = x @ W^T + b`
//! - **relu**: Rectified linear activation
//! - **softmax**: Affine projection followed by row softmax (the output layer)
//! - **embed**: Discrete id to dense vector lookup with sparse updates
//! - **window**: Concatenate each position with its neighbors, per sequence
//! - **batch_norm**: Per-feature batch normalization with running statistics
//! - **scale_shift**: Learned per-feature scale and shift
//! - **flatten**: Adapter from a list of id sequences to the flat layout
//! - **probe**: Inert pass-through that periodically logs activation health
//!
//! ## Design Pattern
//!
//! Each layer follows a consistent pattern:
//!
//! ```rust,ignore
//! impl Layer for MyLayer {
//!     fn begin_update(&mut self, x: &Batch, dropout: f32)
//!         -> Result<(Batch, Context)> { ... }
//!     fn backward(&mut self, ctx: Context, grad: &Tensor, optimizer: &mut Sgd)
//!         -> Result<Tensor> { ... }
//!     fn predict(&self, x: &Batch) -> Result<Batch> { ... }
//! }
//! ```
//!
//! `begin_update` is the training-mode forward pass. It returns the output
//! together with a [`Context`]: an explicit, single-use value holding exactly
//! the tensors the backward pass needs (the cached input, a dropout mask, the
//! normalized activations). `backward` consumes the context by value, applies
//! the chain rule locally, routes every parameter update through the
//! optimizer, and returns the gradient with respect to the layer's input.
//!
//! Because `Context` is moved into `backward` and is not `Clone`, running a
//! backward pass twice from one forward pass is a compile error, not a
//! runtime surprise. Handing a context to the wrong layer is still possible
//! dynamically and is caught as a
//! [`ContractViolation`](crate::ModelError::ContractViolation).
//!
//! `predict` is the inference-mode forward pass: no dropout, no context, and
//! population statistics instead of batch statistics where that distinction
//! exists.

use std::any::Any;

use crate::error::{ModelError, Result};
use crate::ops::Ops;
use crate::optimizer::Sgd;
use crate::tensor::Tensor;

pub mod affine;
pub mod batch_norm;
pub mod embed;
pub mod flatten;
pub mod probe;
pub mod relu;
pub mod scale_shift;
pub mod softmax;
pub mod window;

// Re-export the concrete layers for convenience
pub use affine::{random_init, Affine};
pub use batch_norm::BatchNorm;
pub use embed::Embed;
pub use flatten::FlattenSeqs;
pub use probe::HealthCheck;
pub use relu::Relu;
pub use scale_shift::ScaleShift;
pub use softmax::Softmax;
pub use window::ExtractWindow;

/// A batch of data flowing through the layer chain.
///
/// Most layers map dense activations to dense activations, but the front of a
/// tagging model works on discrete ids: the flatten adapter turns a list of
/// id sequences into one flat id vector, and the embedding layer turns ids
/// into dense rows. The `lengths` carried alongside record where each
/// sequence starts and ends; every layer is row-preserving, so lengths are
/// established once and never change.
#[derive(Clone, Debug)]
pub enum Batch {
    /// Raw id sequences, one `Vec<usize>` per sequence.
    Seqs(Vec<Vec<usize>>),
    /// Flattened ids with per-sequence lengths.
    Ids { ids: Vec<usize>, lengths: Vec<usize> },
    /// Dense activations, one row per position, with per-sequence lengths.
    Dense { data: Tensor, lengths: Vec<usize> },
}

impl Batch {
    /// Wrap a plain matrix as a dense batch forming one pseudo-sequence.
    ///
    /// Use this for non-sequential data; only the window layer looks at
    /// sequence boundaries.
    pub fn dense(data: Tensor) -> Self {
        let rows = data.rows();
        Batch::Dense {
            data,
            lengths: vec![rows],
        }
    }

    /// Wrap a matrix as a dense batch with explicit sequence lengths.
    pub fn dense_with_lengths(data: Tensor, lengths: Vec<usize>) -> Self {
        Batch::Dense { data, lengths }
    }

    /// Short tag for error messages.
    fn kind(&self) -> &'static str {
        match self {
            Batch::Seqs(_) => "id sequences",
            Batch::Ids { .. } => "flat ids",
            Batch::Dense { .. } => "dense activations",
        }
    }

    /// Borrow the dense payload, or fail with a `ShapeMismatch` naming the
    /// layer that expected dense input.
    pub fn as_dense(&self, layer: &str) -> Result<(&Tensor, &[usize])> {
        match self {
            Batch::Dense { data, lengths } => Ok((data, lengths)),
            other => Err(ModelError::shape(layer, "dense activations", other.kind())),
        }
    }

    /// Borrow the flat id payload, or fail with a `ShapeMismatch`.
    pub fn as_ids(&self, layer: &str) -> Result<(&[usize], &[usize])> {
        match self {
            Batch::Ids { ids, lengths } => Ok((ids, lengths)),
            other => Err(ModelError::shape(layer, "flat ids", other.kind())),
        }
    }

    /// Borrow the raw sequences, or fail with a `ShapeMismatch`.
    pub fn as_seqs(&self, layer: &str) -> Result<&[Vec<usize>]> {
        match self {
            Batch::Seqs(seqs) => Ok(seqs),
            other => Err(ModelError::shape(layer, "id sequences", other.kind())),
        }
    }
}

/// A single-use backward context produced by a training forward pass.
///
/// The context owns the cached tensors one layer needs for its backward pass.
/// It is deliberately opaque: only the layer that produced it can unpack it,
/// and only once, because [`Layer::backward`] takes it by value.
pub struct Context {
    kind: &'static str,
    inner: Box<dyn Any>,
}

impl Context {
    /// Wrap a layer-specific cache value. The `kind` tag should be constant
    /// per layer type; it is how [`Context::take`] detects misrouted
    /// contexts.
    pub fn new<T: 'static>(kind: &'static str, inner: T) -> Self {
        Context {
            kind,
            inner: Box::new(inner),
        }
    }

    /// A context for layers that cache nothing (pass-through backward).
    pub fn unit(kind: &'static str) -> Self {
        Context::new(kind, ())
    }

    /// Unpack the cache, verifying it was produced by a layer of the same
    /// kind. A mismatch means contexts were reordered or handed to the wrong
    /// layer, which breaks the reverse-order chain rule.
    pub fn take<T: 'static>(self, expected: &'static str, layer: &str) -> Result<T> {
        if self.kind != expected {
            return Err(ModelError::contract(
                layer,
                format!("received a '{}' context, expected '{}'", self.kind, expected),
            ));
        }
        match self.inner.downcast::<T>() {
            Ok(cache) => Ok(*cache),
            Err(_) => Err(ModelError::contract(
                layer,
                "context payload does not belong to this layer",
            )),
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").field("kind", &self.kind).finish_non_exhaustive()
    }
}

/// A single differentiable transformation with (optional) parameters.
///
/// The contract every layer honors:
///
/// - `begin_update(x, dropout)` runs the training-mode forward pass and
///   returns `(output, context)`. `dropout` is the rate scheduled by the
///   trainer; layers that regularize their output consume it, others ignore
///   it.
/// - `backward(context, output_gradient, optimizer)` consumes the context,
///   computes the parameter gradients from the cached intermediates, invokes
///   the optimizer once per parameter, and returns the gradient with respect
///   to the input. Passing a gradient of the wrong shape is a
///   `ContractViolation`.
/// - `predict(x)` is the inference-mode forward pass.
///
/// Layers also expose their declared widths (where they have them) so a chain
/// can fail fast on incompatible composition, and named tensors for
/// checkpointing and parameter averaging.
pub trait Layer {
    /// Diagnostic name; also the optimizer-state and checkpoint key prefix,
    /// so it must be unique within a chain.
    fn name(&self) -> &str;

    /// Declared input width, when the layer has a fixed one.
    fn input_dim(&self) -> Option<usize> {
        None
    }

    /// Declared output width, when the layer has a fixed one.
    fn output_dim(&self) -> Option<usize> {
        None
    }

    /// Training-mode forward pass; returns the output and the backward
    /// context.
    fn begin_update(&mut self, x: &Batch, dropout: f32) -> Result<(Batch, Context)>;

    /// Consume the context, update parameters through the optimizer, return
    /// the gradient with respect to the input.
    fn backward(&mut self, ctx: Context, grad: &Tensor, optimizer: &mut Sgd) -> Result<Tensor>;

    /// Inference-mode forward pass.
    fn predict(&self, x: &Batch) -> Result<Batch>;

    /// Persistent tensors (parameters and running statistics), keyed for
    /// checkpoints. Parameter keys must match the ones used in optimizer
    /// updates.
    fn tensors(&self) -> Vec<(String, &Tensor)> {
        Vec::new()
    }

    /// Mutable variant of [`Layer::tensors`], used by checkpoint loading and
    /// parameter-average swapping.
    fn tensors_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        Vec::new()
    }

    /// Layer state beyond tensors (e.g., the embedding vocabulary table),
    /// serialized into the checkpoint manifest as JSON. Most layers have
    /// none.
    fn extra_state(&self) -> Option<serde_json::Value> {
        None
    }

    /// Restore state previously produced by [`Layer::extra_state`].
    fn load_extra_state(&mut self, _state: serde_json::Value) -> Result<()> {
        Ok(())
    }
}

/// Join a layer name and a tensor key into the canonical identity used for
/// optimizer state and checkpoints, e.g. `"relu1/W"`.
pub(crate) fn param_key(layer: &str, tensor: &str) -> String {
    format!("{}/{}", layer, tensor)
}

/// Apply inverted dropout to a freshly computed output.
///
/// Returns the (possibly masked) output and the mask, which the caller stores
/// in its context so the same mask can be applied to the incoming gradient.
/// `None` means the rate was non-positive and nothing was touched.
pub(crate) fn apply_dropout<O: Ops>(
    ops: &O,
    output: Tensor,
    rate: f32,
) -> (Tensor, Option<Tensor>) {
    match ops.get_dropout_mask(output.shape.clone(), rate) {
        Some(mask) => {
            let masked = ops.mul(&output, &mask);
            (masked, Some(mask))
        }
        None => (output, None),
    }
}

/// Add a freshly computed gradient into a layer's accumulator.
///
/// Accumulators keep the parameter's exact shape for their whole lifetime;
/// the optimizer zeroes them after each update cycle.
pub(crate) fn accumulate(acc: &mut Tensor, delta: &Tensor) {
    debug_assert_eq!(acc.shape, delta.shape);
    for (a, &d) in acc.data.iter_mut().zip(&delta.data) {
        *a += d;
    }
}

/// Check that a gradient matches the shape the forward pass produced.
/// Shared by every layer's backward entry point.
pub(crate) fn check_grad_shape(layer: &str, grad: &Tensor, rows: usize, cols: usize) -> Result<()> {
    if grad.shape != [rows, cols] {
        return Err(ModelError::contract(
            layer,
            format!(
                "gradient shape {} does not match output shape [{}, {}]",
                grad.shape_str(),
                rows,
                cols
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::CpuOps;

    #[test]
    fn test_context_rejects_wrong_kind() {
        let ctx = Context::unit("relu");
        let err = ctx.take::<()>("affine", "hidden1").unwrap_err();
        assert!(matches!(err, ModelError::ContractViolation { .. }));
    }

    #[test]
    fn test_context_roundtrip() {
        let ctx = Context::new("affine", 42usize);
        let value = ctx.take::<usize>("affine", "hidden1").unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_batch_kind_errors_name_the_layer() {
        let batch = Batch::Seqs(vec![vec![1, 2, 3]]);
        let err = batch.as_dense("hidden1").unwrap_err();
        match err {
            ModelError::ShapeMismatch { layer, .. } => assert_eq!(layer, "hidden1"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_apply_dropout_passthrough_for_zero_rate() {
        let ops = CpuOps;
        let x = Tensor::new(vec![1.0, -2.0, 3.0, 4.0], vec![2, 2]);
        let (y, mask) = apply_dropout(&ops, x.clone(), 0.0);
        assert!(mask.is_none());
        assert_eq!(y, x);
    }
}
