//! Activation Health Probe
//!
//! An inert pass-through layer that periodically prints the mean and variance
//! of the activations flowing through it. Drop one between two layers while
//! debugging a model that won't learn: healthy activations hover near zero
//! mean and stable variance, while exploding or collapsing values show up
//! immediately.
//!
//! The probe must be indistinguishable from its absence in every computed
//! value: output and gradient pass through bit-identical. The call counter
//! that drives the logging cadence is owned by the probe instance, so two
//! probes in one model (or in one process) never interfere.

use crate::error::Result;
use crate::layers::{Batch, Context, Layer};
use crate::ops::{CpuOps, Ops};
use crate::optimizer::Sgd;
use crate::tensor::Tensor;

/// Pass-through diagnostic layer logging activation statistics.
pub struct HealthCheck<O: Ops = CpuOps> {
    name: String,
    /// Log every this many training forward passes; 0 disables logging.
    every: usize,
    calls: usize,
    ops: O,
}

impl HealthCheck<CpuOps> {
    /// Create a probe that logs every `every` training batches.
    pub fn new(every: usize) -> Self {
        Self::with_ops(CpuOps, every)
    }
}

impl<O: Ops> HealthCheck<O> {
    /// Create a probe on a custom backend.
    pub fn with_ops(ops: O, every: usize) -> Self {
        Self {
            name: "healthcheck".to_string(),
            every,
            calls: 0,
            ops,
        }
    }

    /// Rename the probe; the name prefixes its log lines.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn report(&self, data: &Tensor) {
        if data.rows() == 0 {
            return;
        }
        let mean = self.ops.mean_axis0(data);
        let var = self.ops.var_axis0(data, &mean);
        let nr_feature = mean.data.len() as f32;
        let avg_mean: f32 = mean.data.iter().sum::<f32>() / nr_feature;
        let avg_var: f32 = var.data.iter().sum::<f32>() / nr_feature;
        println!(
            "[{}] activations: mean {:.5}, variance {:.5}",
            self.name, avg_mean, avg_var
        );
    }
}

impl<O: Ops> Layer for HealthCheck<O> {
    fn name(&self) -> &str {
        &self.name
    }

    fn begin_update(&mut self, x: &Batch, _dropout: f32) -> Result<(Batch, Context)> {
        let (data, lengths) = x.as_dense(&self.name)?;
        self.calls += 1;
        if self.every != 0 && self.calls % self.every == 0 {
            self.report(data);
        }
        Ok((
            Batch::dense_with_lengths(data.clone(), lengths.to_vec()),
            Context::unit("healthcheck"),
        ))
    }

    fn backward(&mut self, ctx: Context, grad: &Tensor, _optimizer: &mut Sgd) -> Result<Tensor> {
        ctx.take::<()>("healthcheck", &self.name)?;
        Ok(grad.clone())
    }

    fn predict(&self, x: &Batch) -> Result<Batch> {
        let (data, lengths) = x.as_dense(&self.name)?;
        Ok(Batch::dense_with_lengths(data.clone(), lengths.to_vec()))
    }
}
