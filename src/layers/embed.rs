//! Embedding Lookup
//!
//! Maps discrete ids to dense vector rows. The layer owns a fixed-capacity
//! vector table; ids are assigned rows on first sight during training, and
//! anything the table has never seen (or no longer has room for) falls back
//! to the default row. Unknown ids are *expected* at inference time, so they
//! are handled, never raised.
//!
//! ## Sparse Updates
//!
//! A batch only touches a handful of rows, so the backward pass scatters the
//! output gradient into just the rows that were actually looked up. The rest
//! of the gradient accumulator stays zero and the optimizer step leaves those
//! rows untouched.
//!
//! ## The Default Row
//!
//! Row 0 is the unknown-id vector. It starts at zero and is trained like any
//! other row whenever an unknown id appears in a training batch, so the model
//! learns a sensible representation for rare and unseen tokens.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::layers::{apply_dropout, check_grad_shape, param_key, Batch, Context, Layer};
use crate::ops::{CpuOps, Ops};
use crate::optimizer::Sgd;
use crate::tensor::Tensor;
use crate::ModelError;

/// Id-to-vector lookup with lazily assigned rows and a trainable default.
pub struct Embed<O: Ops = CpuOps> {
    name: String,
    width: usize,
    capacity: usize,
    /// Vector table [capacity + 1, width]; row 0 is the default row.
    pub vectors: Tensor,
    d_vectors: Tensor,
    table: HashMap<usize, usize>,
    next_row: usize,
    ops: O,
}

struct EmbedContext {
    /// Row index looked up for each position.
    rows: Vec<usize>,
    mask: Option<Tensor>,
    nr_position: usize,
}

/// Serialized form of the id-to-row table, kept sorted for determinism.
#[derive(Serialize, Deserialize)]
struct EmbedState {
    table: Vec<(usize, usize)>,
    next_row: usize,
}

impl Embed<CpuOps> {
    /// Create an embedding table on the CPU backend.
    ///
    /// # Arguments
    ///
    /// * `width` - Vector length per id
    /// * `capacity` - Maximum number of distinct ids given their own row
    /// * `seed` - Random seed for reproducible initialization
    ///
    /// Rows are initialized from a normal distribution with standard
    /// deviation `1/√width`; the default row starts at zero.
    pub fn new(width: usize, capacity: usize, seed: u64) -> Self {
        Self::with_ops(CpuOps, width, capacity, seed)
    }
}

impl<O: Ops> Embed<O> {
    /// Create an embedding table on a custom backend.
    pub fn with_ops(ops: O, width: usize, capacity: usize, seed: u64) -> Self {
        assert!(width > 0, "embedding width must be positive");
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0f32, 1.0 / (width as f32).sqrt())
            .expect("standard deviation is positive");

        let nr_row = capacity + 1;
        let mut data = vec![0.0; nr_row * width];
        // Row 0 stays zero; the rest get random vectors.
        for value in data.iter_mut().skip(width) {
            *value = normal.sample(&mut rng);
        }

        Self {
            name: "embed".to_string(),
            width,
            capacity,
            vectors: Tensor::new(data, vec![nr_row, width]),
            d_vectors: Tensor::zeros(vec![nr_row, width]),
            table: HashMap::new(),
            next_row: 1,
            ops,
        }
    }

    /// Seed the table with pretrained vectors, assigned in sorted id order
    /// for reproducibility.
    ///
    /// # Panics
    ///
    /// Panics if a vector has the wrong width or the table runs out of rows;
    /// both are configuration mistakes, not data conditions.
    pub fn with_vectors(mut self, pretrained: &HashMap<usize, Vec<f32>>) -> Self {
        let mut ids: Vec<&usize> = pretrained.keys().collect();
        ids.sort();
        for &id in ids {
            let vector = &pretrained[&id];
            assert_eq!(
                vector.len(),
                self.width,
                "pretrained vector for id {} has the wrong width",
                id
            );
            assert!(
                self.next_row <= self.capacity,
                "embedding table too small for the pretrained vocabulary"
            );
            let row = self.next_row;
            self.next_row += 1;
            self.table.insert(id, row);
            self.vectors.row_mut(row).copy_from_slice(vector);
        }
        self
    }

    /// Rename the layer.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Row for an id at inference time: assigned row or the default.
    fn row_of(&self, id: usize) -> usize {
        self.table.get(&id).copied().unwrap_or(0)
    }

    /// Row for an id during training: unseen ids claim a fresh row while the
    /// table has room, then fall back to the default row.
    fn row_of_training(&mut self, id: usize) -> usize {
        if let Some(&row) = self.table.get(&id) {
            return row;
        }
        if self.next_row <= self.capacity {
            let row = self.next_row;
            self.next_row += 1;
            self.table.insert(id, row);
            row
        } else {
            0
        }
    }

    fn gather(&self, rows: &[usize]) -> Tensor {
        let mut data = Vec::with_capacity(rows.len() * self.width);
        for &row in rows {
            data.extend_from_slice(self.vectors.row(row));
        }
        Tensor::new(data, vec![rows.len(), self.width])
    }
}

impl<O: Ops> Layer for Embed<O> {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_dim(&self) -> Option<usize> {
        Some(self.width)
    }

    fn begin_update(&mut self, x: &Batch, dropout: f32) -> Result<(Batch, Context)> {
        let (ids, lengths) = x.as_ids(&self.name)?;
        let lengths = lengths.to_vec();
        let rows: Vec<usize> = ids.iter().map(|&id| self.row_of_training(id)).collect();
        let output = self.gather(&rows);
        let (output, mask) = apply_dropout(&self.ops, output, dropout);
        let nr_position = rows.len();
        let ctx = Context::new(
            "embed",
            EmbedContext {
                rows,
                mask,
                nr_position,
            },
        );
        Ok((Batch::dense_with_lengths(output, lengths), ctx))
    }

    fn backward(&mut self, ctx: Context, grad: &Tensor, optimizer: &mut Sgd) -> Result<Tensor> {
        let cache: EmbedContext = ctx.take("embed", &self.name)?;
        check_grad_shape(&self.name, grad, cache.nr_position, self.width)?;

        let grad = match &cache.mask {
            Some(mask) => self.ops.mul(grad, mask),
            None => grad.clone(),
        };

        // Scatter into only the rows this batch looked up.
        for (i, &row) in cache.rows.iter().enumerate() {
            let acc = self.d_vectors.row_mut(row);
            for (a, &g) in acc.iter_mut().zip(grad.row(i)) {
                *a += g;
            }
        }

        optimizer.update(
            &param_key(&self.name, "vectors"),
            &mut self.vectors,
            &mut self.d_vectors,
        )?;

        // The input is discrete; there is no gradient to pass further back.
        Ok(Tensor::empty())
    }

    fn predict(&self, x: &Batch) -> Result<Batch> {
        let (ids, lengths) = x.as_ids(&self.name)?;
        let rows: Vec<usize> = ids.iter().map(|&id| self.row_of(id)).collect();
        Ok(Batch::dense_with_lengths(
            self.gather(&rows),
            lengths.to_vec(),
        ))
    }

    fn tensors(&self) -> Vec<(String, &Tensor)> {
        vec![("vectors".to_string(), &self.vectors)]
    }

    fn tensors_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        vec![("vectors".to_string(), &mut self.vectors)]
    }

    fn extra_state(&self) -> Option<serde_json::Value> {
        let mut table: Vec<(usize, usize)> = self.table.iter().map(|(&k, &v)| (k, v)).collect();
        table.sort_unstable();
        let state = EmbedState {
            table,
            next_row: self.next_row,
        };
        Some(serde_json::to_value(state).expect("embed state serializes"))
    }

    fn load_extra_state(&mut self, state: serde_json::Value) -> Result<()> {
        let state: EmbedState = serde_json::from_value(state)?;
        for &(_, row) in &state.table {
            if row >= self.capacity + 1 {
                return Err(ModelError::Corrupt(format!(
                    "embedding row {} out of range for capacity {}",
                    row, self.capacity
                )));
            }
        }
        self.table = state.table.into_iter().collect();
        self.next_row = state.next_row;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(ids: Vec<usize>) -> Batch {
        let lengths = vec![ids.len()];
        Batch::Ids { ids, lengths }
    }

    #[test]
    fn test_unseen_id_maps_to_default_row_at_inference() {
        let layer = Embed::new(4, 8, 1);
        let out = layer.predict(&ids(vec![999])).unwrap();
        let (out, _) = out.as_dense("test").unwrap();
        assert_eq!(out.data, vec![0.0; 4]);
    }

    #[test]
    fn test_training_assigns_stable_rows() {
        let mut layer = Embed::new(4, 8, 1);
        let (first, _) = layer.begin_update(&ids(vec![7, 3, 7]), 0.0).unwrap();
        let (first, _) = first.as_dense("test").unwrap();
        // Same id, same vector.
        assert_eq!(first.row(0), first.row(2));

        // The assignment survives into inference.
        let again = layer.predict(&ids(vec![7])).unwrap();
        let (again, _) = again.as_dense("test").unwrap();
        assert_eq!(again.row(0), first.row(0));
    }

    #[test]
    fn test_gradient_lands_only_in_looked_up_rows() {
        let mut layer = Embed::new(2, 4, 1);
        let mut sgd = Sgd::new(1.0);
        let (_, ctx) = layer.begin_update(&ids(vec![5]), 0.0).unwrap();

        let before = layer.vectors.clone();
        let grad = Tensor::new(vec![1.0, -1.0], vec![1, 2]);
        layer.backward(ctx, &grad, &mut sgd).unwrap();

        let row = layer.row_of(5);
        for r in 0..layer.vectors.rows() {
            if r == row {
                assert_ne!(layer.vectors.row(r), before.row(r));
            } else {
                assert_eq!(layer.vectors.row(r), before.row(r));
            }
        }
    }

    #[test]
    fn test_full_table_falls_back_to_default_row() {
        let mut layer = Embed::new(2, 1, 1);
        // First id takes the only free row, second overflows onto row 0.
        let (_, _) = layer.begin_update(&ids(vec![10, 20]), 0.0).unwrap();
        assert_eq!(layer.row_of(10), 1);
        assert_eq!(layer.row_of(20), 0);
    }

    #[test]
    fn test_pretrained_vectors_are_looked_up() {
        let mut pretrained = HashMap::new();
        pretrained.insert(42usize, vec![1.0, 2.0, 3.0]);
        let layer = Embed::new(3, 4, 1).with_vectors(&pretrained);
        let out = layer.predict(&ids(vec![42])).unwrap();
        let (out, _) = out.as_dense("test").unwrap();
        assert_eq!(out.data, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_state_roundtrip() {
        let mut layer = Embed::new(2, 4, 1);
        let (_, _) = layer.begin_update(&ids(vec![9, 1]), 0.0).unwrap();
        let state = layer.extra_state().unwrap();

        let mut restored = Embed::new(2, 4, 1);
        restored.load_extra_state(state).unwrap();
        assert_eq!(restored.row_of(9), layer.row_of(9));
        assert_eq!(restored.row_of(1), layer.row_of(1));
    }
}
