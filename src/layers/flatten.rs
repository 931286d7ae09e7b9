//! Flatten Adapter
//!
//! Bridges the dataset's natural shape (a list of variable-length id
//! sequences) into the flat layout the rest of the chain works on: one id
//! vector plus the per-sequence lengths that later layers (the window layer
//! in particular) use to respect sequence boundaries.
//!
//! Flattening is a pure rearrangement with no parameters, so the backward
//! pass is the identity: whatever gradient arrives is passed through
//! unchanged.

use crate::error::Result;
use crate::layers::{Batch, Context, Layer};
use crate::optimizer::Sgd;
use crate::tensor::Tensor;

/// List-of-sequences to flat-ids adapter; the usual first layer of a tagger.
pub struct FlattenSeqs {
    name: String,
}

impl FlattenSeqs {
    /// Create the adapter.
    pub fn new() -> Self {
        Self {
            name: "flatten".to_string(),
        }
    }

    /// Rename the layer.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn run(&self, x: &Batch) -> Result<Batch> {
        let seqs = x.as_seqs(&self.name)?;
        let mut ids = Vec::with_capacity(seqs.iter().map(Vec::len).sum());
        let mut lengths = Vec::with_capacity(seqs.len());
        for seq in seqs {
            lengths.push(seq.len());
            ids.extend_from_slice(seq);
        }
        Ok(Batch::Ids { ids, lengths })
    }
}

impl Default for FlattenSeqs {
    fn default() -> Self {
        Self::new()
    }
}

impl Layer for FlattenSeqs {
    fn name(&self) -> &str {
        &self.name
    }

    fn begin_update(&mut self, x: &Batch, _dropout: f32) -> Result<(Batch, Context)> {
        Ok((self.run(x)?, Context::unit("flatten")))
    }

    fn backward(&mut self, ctx: Context, grad: &Tensor, _optimizer: &mut Sgd) -> Result<Tensor> {
        ctx.take::<()>("flatten", &self.name)?;
        Ok(grad.clone())
    }

    fn predict(&self, x: &Batch) -> Result<Batch> {
        self.run(x)
    }
}
