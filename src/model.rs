//! Composite Model
//!
//! A model is an ordered chain of layers. Forward computation threads each
//! layer's output into the next layer's input; the backward pass walks the
//! same chain in strict reverse, feeding each layer's input gradient to the
//! layer before it. That reverse walk is driven by a *context tape*: the
//! training forward pass collects one backward context per layer, and
//! [`Chain::finish_update`] consumes the tape back-to-front, invoking every
//! context exactly once. The tape moves into `finish_update`, so it cannot be
//! replayed.
//!
//! ## Fail-Fast Composition
//!
//! [`Chain::new`] validates the chain before any data flows:
//!
//! - Layer names must be unique (they key optimizer state and checkpoints)
//! - Where adjacent layers both declare widths, the output width of one must
//!   equal the input width of the next
//!
//! Layers without declared widths (windows, activations) are checked at their
//! first forward call instead.
//!
//! ## Checkpoints
//!
//! `save_to_file` / `load_from_file` persist every parameter and running
//! statistic exactly: a magic header, a format version, a JSON manifest of
//! tensor keys and shapes, then the raw little-endian values. Loading
//! validates the manifest against the constructed model, so restoring into
//! the wrong topology fails loudly instead of scrambling weights.
//!
//! ## Example
//!
//! ```rust,no_run
//! use viola::{Affine, Batch, Chain, Relu, Sgd, Softmax, Tensor};
//!
//! let mut model = Chain::new(vec![
//!     Box::new(Affine::new(8, 4, 0).named("hidden")),
//!     Box::new(Relu::new()),
//!     Box::new(Softmax::new(3, 8, 1)),
//! ]).unwrap();
//!
//! let mut sgd = Sgd::new(0.01);
//! let x = Batch::dense(Tensor::zeros(vec![2, 4]));
//! let (probs, ctx) = model.begin_update(&x, 0.2).unwrap();
//! // ... compute the loss gradient ...
//! # let grad = Tensor::zeros(vec![2, 3]);
//! model.finish_update(ctx, &grad, &mut sgd).unwrap();
//! ```

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ModelError, Result};
use crate::layers::{Batch, Context, Layer};
use crate::optimizer::Sgd;
use crate::tensor::Tensor;

const CHECKPOINT_MAGIC: &[u8; 10] = b"VIOLA_CKPT";
const CHECKPOINT_VERSION: u8 = 1;

/// The context tape of one training forward pass: one backward context per
/// layer, in forward order. Consumed, in reverse, by
/// [`Chain::finish_update`].
pub struct ChainContext {
    contexts: Vec<Context>,
}

/// An ordered chain of layers forming a model.
pub struct Chain {
    name: String,
    layers: Vec<Box<dyn Layer>>,
}

#[derive(Serialize, Deserialize)]
struct ManifestEntry {
    key: String,
    shape: Vec<usize>,
}

#[derive(Serialize, Deserialize)]
struct Manifest {
    tensors: Vec<ManifestEntry>,
    extra: serde_json::Map<String, Value>,
}

impl Chain {
    /// Build a chain, validating composition before any data flows.
    pub fn new(layers: Vec<Box<dyn Layer>>) -> Result<Self> {
        let mut seen = HashSet::new();
        for layer in &layers {
            if !seen.insert(layer.name().to_string()) {
                return Err(ModelError::contract(
                    "chain",
                    format!(
                        "duplicate layer name '{}'; rename one with .named()",
                        layer.name()
                    ),
                ));
            }
        }

        for pair in layers.windows(2) {
            if let (Some(out), Some(input)) = (pair[0].output_dim(), pair[1].input_dim()) {
                if out != input {
                    return Err(ModelError::shape(
                        pair[1].name(),
                        format!("input width {}", input),
                        format!("width {} from '{}'", out, pair[0].name()),
                    ));
                }
            }
        }

        Ok(Self {
            name: "chain".to_string(),
            layers,
        })
    }

    /// Rename the chain (relevant when nesting chains inside chains).
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Number of layers in the chain.
    pub fn nr_layer(&self) -> usize {
        self.layers.len()
    }

    /// Training forward pass over the whole chain.
    ///
    /// Returns the final dense output (for a tagger: class probabilities,
    /// one row per position) and the context tape for
    /// [`Chain::finish_update`].
    pub fn begin_update(&mut self, x: &Batch, dropout: f32) -> Result<(Tensor, ChainContext)> {
        let (output, tape) = self.forward_train(x, dropout)?;
        match output {
            Batch::Dense { data, .. } => Ok((data, tape)),
            other => Err(ModelError::shape(
                &self.name,
                "dense model output",
                match other {
                    Batch::Seqs(_) => "id sequences",
                    Batch::Ids { .. } => "flat ids",
                    Batch::Dense { .. } => unreachable!(),
                },
            )),
        }
    }

    /// Run the backward pass: consume the context tape in strict reverse
    /// order, once per layer, applying parameter updates through the
    /// optimizer. Returns the gradient with respect to the model input.
    pub fn finish_update(
        &mut self,
        tape: ChainContext,
        grad: &Tensor,
        optimizer: &mut Sgd,
    ) -> Result<Tensor> {
        if tape.contexts.len() != self.layers.len() {
            return Err(ModelError::contract(
                &self.name,
                format!(
                    "context tape has {} entries for {} layers",
                    tape.contexts.len(),
                    self.layers.len()
                ),
            ));
        }

        let mut current = grad.clone();
        for (layer, ctx) in self
            .layers
            .iter_mut()
            .rev()
            .zip(tape.contexts.into_iter().rev())
        {
            current = layer.backward(ctx, &current, optimizer)?;
        }
        Ok(current)
    }

    /// Inference-mode forward pass: no dropout, no contexts, population
    /// statistics. Returns the final dense output.
    pub fn predict(&self, x: &Batch) -> Result<Tensor> {
        let mut current = x.clone();
        for layer in &self.layers {
            current = layer.predict(&current)?;
        }
        match current {
            Batch::Dense { data, .. } => Ok(data),
            _ => Err(ModelError::shape(
                &self.name,
                "dense model output",
                "non-dense output",
            )),
        }
    }

    /// Run `f` with the optimizer's averaged parameters swapped in, then
    /// restore the trained parameters. Evaluating with the averages is
    /// usually more stable than evaluating with the raw final weights.
    pub fn with_averages<R>(
        &mut self,
        optimizer: &Sgd,
        f: impl FnOnce(&Chain) -> R,
    ) -> Result<R> {
        // Verify every replacement before mutating anything, so a mismatch
        // cannot leave the model half-swapped.
        for (key, tensor) in self.prefixed_tensors() {
            if let Some(average) = optimizer.average(&key) {
                if average.shape != tensor.shape {
                    return Err(ModelError::shape(
                        &key,
                        tensor.shape_str(),
                        average.shape_str(),
                    ));
                }
            }
        }

        let mut originals: HashMap<String, Tensor> = HashMap::new();
        for (key, tensor) in self.prefixed_tensors_mut() {
            if let Some(average) = optimizer.average(&key) {
                originals.insert(key, std::mem::replace(tensor, average.clone()));
            }
        }

        let result = f(self);

        for (key, tensor) in self.prefixed_tensors_mut() {
            if let Some(original) = originals.remove(&key) {
                *tensor = original;
            }
        }

        Ok(result)
    }

    /// Persist every parameter and running statistic to a binary checkpoint.
    pub fn save_to_file(&self, path: &str) -> Result<()> {
        let mut file = BufWriter::new(File::create(path)?);

        file.write_all(CHECKPOINT_MAGIC)?;
        file.write_all(&[CHECKPOINT_VERSION])?;

        let tensors = self.prefixed_tensors();
        let manifest = Manifest {
            tensors: tensors
                .iter()
                .map(|(key, tensor)| ManifestEntry {
                    key: key.clone(),
                    shape: tensor.shape.clone(),
                })
                .collect(),
            extra: self.extra_object(),
        };
        let manifest_json = serde_json::to_string(&manifest)?;
        file.write_all(&(manifest_json.len() as u32).to_le_bytes())?;
        file.write_all(manifest_json.as_bytes())?;

        for (_, tensor) in &tensors {
            for &value in &tensor.data {
                file.write_all(&value.to_le_bytes())?;
            }
        }
        file.flush()?;
        Ok(())
    }

    /// Restore a checkpoint previously written by [`Chain::save_to_file`]
    /// into this model. The model must have the same topology: identical
    /// layer names, tensor keys, and shapes.
    pub fn load_from_file(&mut self, path: &str) -> Result<()> {
        let mut file = BufReader::new(File::open(path)?);

        let mut magic = [0u8; 10];
        file.read_exact(&mut magic)?;
        if &magic != CHECKPOINT_MAGIC {
            return Err(ModelError::Corrupt(
                "bad header, expected VIOLA_CKPT".to_string(),
            ));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != CHECKPOINT_VERSION {
            return Err(ModelError::Corrupt(format!(
                "unsupported checkpoint version {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)?;
        let manifest_len = u32::from_le_bytes(len_bytes) as usize;
        let mut manifest_bytes = vec![0u8; manifest_len];
        file.read_exact(&mut manifest_bytes)?;
        let manifest: Manifest = serde_json::from_slice(&manifest_bytes)?;

        {
            let mut tensor_map: HashMap<String, &mut Tensor> =
                self.prefixed_tensors_mut().into_iter().collect();
            if tensor_map.len() != manifest.tensors.len() {
                return Err(ModelError::Corrupt(format!(
                    "checkpoint holds {} tensors, model has {}",
                    manifest.tensors.len(),
                    tensor_map.len()
                )));
            }

            for entry in &manifest.tensors {
                let tensor = tensor_map.get_mut(&entry.key).ok_or_else(|| {
                    ModelError::Corrupt(format!("checkpoint tensor '{}' not in model", entry.key))
                })?;
                if tensor.shape != entry.shape {
                    return Err(ModelError::shape(
                        &entry.key,
                        tensor.shape_str(),
                        format!("{:?}", entry.shape),
                    ));
                }
                let mut bytes = [0u8; 4];
                for value in tensor.data.iter_mut() {
                    file.read_exact(&mut bytes)?;
                    *value = f32::from_le_bytes(bytes);
                }
            }
        }

        for layer in &mut self.layers {
            if let Some(state) = manifest.extra.get(layer.name()) {
                layer.load_extra_state(state.clone())?;
            }
        }
        Ok(())
    }

    /// Training forward pass returning the raw output batch; shared by the
    /// public entry point and the nested-layer implementation.
    fn forward_train(&mut self, x: &Batch, dropout: f32) -> Result<(Batch, ChainContext)> {
        let mut contexts = Vec::with_capacity(self.layers.len());
        let mut current = x.clone();
        for layer in self.layers.iter_mut() {
            let (next, ctx) = layer.begin_update(&current, dropout)?;
            contexts.push(ctx);
            current = next;
        }
        Ok((current, ChainContext { contexts }))
    }

    /// All persistent tensors, keyed `layer/tensor`.
    fn prefixed_tensors(&self) -> Vec<(String, &Tensor)> {
        self.layers
            .iter()
            .flat_map(|layer| {
                let name = layer.name().to_string();
                layer
                    .tensors()
                    .into_iter()
                    .map(move |(key, tensor)| (format!("{}/{}", name, key), tensor))
            })
            .collect()
    }

    /// Mutable variant of [`Chain::prefixed_tensors`].
    fn prefixed_tensors_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        self.layers
            .iter_mut()
            .flat_map(|layer| {
                let name = layer.name().to_string();
                layer
                    .tensors_mut()
                    .into_iter()
                    .map(move |(key, tensor)| (format!("{}/{}", name, key), tensor))
            })
            .collect()
    }

    /// Per-layer extra state, keyed by layer name.
    fn extra_object(&self) -> serde_json::Map<String, Value> {
        let mut map = serde_json::Map::new();
        for layer in &self.layers {
            if let Some(state) = layer.extra_state() {
                map.insert(layer.name().to_string(), state);
            }
        }
        map
    }
}

/// A chain is itself a layer, so chains nest inside chains.
impl Layer for Chain {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_dim(&self) -> Option<usize> {
        self.layers.first().and_then(|l| l.input_dim())
    }

    fn output_dim(&self) -> Option<usize> {
        self.layers.last().and_then(|l| l.output_dim())
    }

    fn begin_update(&mut self, x: &Batch, dropout: f32) -> Result<(Batch, Context)> {
        let (output, tape) = self.forward_train(x, dropout)?;
        Ok((output, Context::new("chain", tape)))
    }

    fn backward(&mut self, ctx: Context, grad: &Tensor, optimizer: &mut Sgd) -> Result<Tensor> {
        let tape: ChainContext = ctx.take("chain", &self.name)?;
        self.finish_update(tape, grad, optimizer)
    }

    fn predict(&self, x: &Batch) -> Result<Batch> {
        let mut current = x.clone();
        for layer in &self.layers {
            current = layer.predict(&current)?;
        }
        Ok(current)
    }

    fn tensors(&self) -> Vec<(String, &Tensor)> {
        self.prefixed_tensors()
    }

    fn tensors_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        self.prefixed_tensors_mut()
    }

    fn extra_state(&self) -> Option<Value> {
        let map = self.extra_object();
        if map.is_empty() {
            None
        } else {
            Some(Value::Object(map))
        }
    }

    fn load_extra_state(&mut self, state: Value) -> Result<()> {
        let map = state
            .as_object()
            .ok_or_else(|| ModelError::Corrupt("nested chain state is not an object".into()))?;
        for layer in &mut self.layers {
            if let Some(value) = map.get(layer.name()) {
                layer.load_extra_state(value.clone())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{Affine, Embed, FlattenSeqs, HealthCheck, Relu, Softmax};
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Instrumented pass-through layer recording when its backward runs.
    struct Trace {
        name: String,
        log: Rc<RefCell<Vec<String>>>,
    }

    impl Trace {
        fn new(name: &str, log: &Rc<RefCell<Vec<String>>>) -> Box<Self> {
            Box::new(Self {
                name: name.to_string(),
                log: Rc::clone(log),
            })
        }
    }

    impl Layer for Trace {
        fn name(&self) -> &str {
            &self.name
        }

        fn begin_update(&mut self, x: &Batch, _dropout: f32) -> Result<(Batch, Context)> {
            Ok((x.clone(), Context::unit("trace")))
        }

        fn backward(&mut self, ctx: Context, grad: &Tensor, _opt: &mut Sgd) -> Result<Tensor> {
            ctx.take::<()>("trace", &self.name)?;
            self.log.borrow_mut().push(self.name.clone());
            Ok(grad.clone())
        }

        fn predict(&self, x: &Batch) -> Result<Batch> {
            Ok(x.clone())
        }
    }

    #[test]
    fn test_duplicate_names_rejected_at_construction() {
        let err = Chain::new(vec![
            Box::new(Affine::new(2, 2, 0)),
            Box::new(Affine::new(2, 2, 1)),
        ])
        .err()
        .unwrap();
        assert!(matches!(err, ModelError::ContractViolation { .. }));
    }

    #[test]
    fn test_incompatible_widths_rejected_at_construction() {
        let err = Chain::new(vec![
            Box::new(Affine::new(4, 2, 0).named("first")),
            Box::new(Affine::new(2, 5, 1).named("second")),
        ])
        .err()
        .unwrap();
        match err {
            ModelError::ShapeMismatch { layer, .. } => assert_eq!(layer, "second"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_backward_runs_each_layer_once_in_reverse() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut model = Chain::new(vec![
            Trace::new("a", &log),
            Trace::new("b", &log),
            Trace::new("c", &log),
        ])
        .unwrap();
        let mut sgd = Sgd::new(1.0);

        let x = Batch::dense(Tensor::zeros(vec![1, 2]));
        let (_, tape) = model.begin_update(&x, 0.0).unwrap();
        model
            .finish_update(tape, &Tensor::zeros(vec![1, 2]), &mut sgd)
            .unwrap();

        assert_eq!(*log.borrow(), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_foreign_tape_is_rejected() {
        let mut two = Chain::new(vec![
            Box::new(Affine::new(2, 2, 0).named("a")),
            Box::new(Affine::new(2, 2, 1).named("b")),
        ])
        .unwrap();
        let mut one = Chain::new(vec![Box::new(Affine::new(2, 2, 0).named("a"))]).unwrap();

        let x = Batch::dense(Tensor::zeros(vec![1, 2]));
        let (_, tape) = one.begin_update(&x, 0.0).unwrap();

        let mut sgd = Sgd::new(1.0);
        let err = two
            .finish_update(tape, &Tensor::zeros(vec![1, 2]), &mut sgd)
            .unwrap_err();
        assert!(matches!(err, ModelError::ContractViolation { .. }));
    }

    fn probe_free_model() -> Chain {
        Chain::new(vec![
            Box::new(Affine::new(3, 2, 11).named("hidden")),
            Box::new(Relu::new()),
            Box::new(Softmax::new(2, 3, 12)),
        ])
        .unwrap()
    }

    fn probed_model() -> Chain {
        Chain::new(vec![
            Box::new(Affine::new(3, 2, 11).named("hidden")),
            Box::new(HealthCheck::new(0)),
            Box::new(Relu::new()),
            Box::new(Softmax::new(2, 3, 12)),
        ])
        .unwrap()
    }

    #[test]
    fn test_probe_is_bit_identical_to_its_absence() {
        let mut plain = probe_free_model();
        let mut probed = probed_model();
        let mut sgd_a = Sgd::new(0.1);
        let mut sgd_b = Sgd::new(0.1);

        let x = Batch::dense(Tensor::new(vec![0.3, -1.2, 0.8, 0.1], vec![2, 2]));
        assert_eq!(plain.predict(&x).unwrap(), probed.predict(&x).unwrap());

        let (out_a, tape_a) = plain.begin_update(&x, 0.0).unwrap();
        let (out_b, tape_b) = probed.begin_update(&x, 0.0).unwrap();
        assert_eq!(out_a, out_b);

        let grad = Tensor::new(vec![0.5, -0.5, 0.25, -0.25], vec![2, 2]);
        let d_a = plain.finish_update(tape_a, &grad, &mut sgd_a).unwrap();
        let d_b = probed.finish_update(tape_b, &grad, &mut sgd_b).unwrap();
        assert_eq!(d_a, d_b);
        assert_eq!(plain.predict(&x).unwrap(), probed.predict(&x).unwrap());
    }

    fn tagger_model(seed: u64) -> Chain {
        Chain::new(vec![
            Box::new(FlattenSeqs::new()),
            Box::new(Embed::new(4, 8, seed).named("embed")),
            Box::new(Affine::new(5, 4, seed + 1).named("hidden")),
            Box::new(Relu::new()),
            Box::new(Softmax::new(3, 5, seed + 2)),
        ])
        .unwrap()
    }

    #[test]
    fn test_checkpoint_roundtrip_preserves_everything() {
        let mut trained = tagger_model(1);
        let mut sgd = Sgd::new(0.1);

        // Touch a few ids so the vocabulary table has content.
        let x = Batch::Seqs(vec![vec![3, 1, 4], vec![1, 5]]);
        let (probs, tape) = trained.begin_update(&x, 0.0).unwrap();
        let grad = Tensor::zeros(probs.shape.clone());
        trained.finish_update(tape, &grad, &mut sgd).unwrap();

        let dir = std::env::temp_dir().join("viola_checkpoint_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("model.bin");
        let path = path.to_str().unwrap();
        trained.save_to_file(path).unwrap();

        // Different seed: same topology, different values until loading.
        let mut restored = tagger_model(99);
        restored.load_from_file(path).unwrap();

        let before: Vec<(String, Tensor)> = trained
            .prefixed_tensors()
            .into_iter()
            .map(|(k, t)| (k, t.clone()))
            .collect();
        let after: Vec<(String, Tensor)> = restored
            .prefixed_tensors()
            .into_iter()
            .map(|(k, t)| (k, t.clone()))
            .collect();
        assert_eq!(before, after);

        assert_eq!(trained.predict(&x).unwrap(), restored.predict(&x).unwrap());
    }

    #[test]
    fn test_load_rejects_different_topology() {
        let mut trained = tagger_model(1);
        let dir = std::env::temp_dir().join("viola_checkpoint_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("mismatched.bin");
        let path = path.to_str().unwrap();
        trained.save_to_file(path).unwrap();

        let mut other = Chain::new(vec![Box::new(Affine::new(2, 2, 0))]).unwrap();
        assert!(other.load_from_file(path).is_err());
    }

    #[test]
    fn test_with_averages_swaps_and_restores() {
        let mut model = Chain::new(vec![Box::new(Affine::new(2, 2, 3).named("only"))]).unwrap();
        let mut sgd = Sgd::new(0.5);

        let x = Batch::dense(Tensor::new(vec![1.0, 2.0], vec![1, 2]));
        for _ in 0..5 {
            let (_, tape) = model.begin_update(&x, 0.0).unwrap();
            let grad = Tensor::new(vec![0.1, -0.1], vec![1, 2]);
            model.finish_update(tape, &grad, &mut sgd).unwrap();
        }

        let trained = model.predict(&x).unwrap();
        let averaged = model
            .with_averages(&sgd, |m| m.predict(&x).unwrap())
            .unwrap();
        assert_ne!(trained, averaged);

        // The trained parameters are restored afterwards.
        assert_eq!(model.predict(&x).unwrap(), trained);
    }

    #[test]
    fn test_chains_nest() {
        let inner = Chain::new(vec![
            Box::new(Affine::new(3, 2, 5).named("inner_hidden")),
            Box::new(Relu::new()),
        ])
        .unwrap()
        .named("encoder");

        let mut outer = Chain::new(vec![
            Box::new(inner) as Box<dyn Layer>,
            Box::new(Softmax::new(2, 3, 6)),
        ])
        .unwrap();

        let mut sgd = Sgd::new(0.1);
        let x = Batch::dense(Tensor::new(vec![1.0, -1.0], vec![1, 2]));
        let (probs, tape) = outer.begin_update(&x, 0.0).unwrap();
        assert_eq!(probs.shape, vec![1, 2]);
        let grad = Tensor::zeros(vec![1, 2]);
        outer.finish_update(tape, &grad, &mut sgd).unwrap();
    }
}
