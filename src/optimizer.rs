//! Stochastic Gradient Descent with Parameter Averaging
//!
//! This module implements the optimizer that layers route their updates
//! through. The core step is plain gradient descent:
//!
//! ```text
//! param -= learning_rate * gradient
//! ```
//!
//! with three practical additions:
//!
//! - **Linear learning-rate decay**: the effective rate shrinks as
//!   `rate / (1 + decay * t)` where `t` counts the updates applied to that
//!   particular parameter.
//! - **Gradient clipping**: when a max norm is configured, oversized
//!   gradients are rescaled before the step so one bad batch cannot blow up
//!   training.
//! - **Parameter averaging**: a smoothed moving-average copy of every
//!   parameter is maintained across steps. Evaluating with the averages is
//!   usually more stable than evaluating with the raw final weights, which
//!   still carry the noise of the last few batches.
//!
//! ## Parameter Identity
//!
//! The optimizer never walks the model. Layers call
//! [`Sgd::update`] with a string key (`"relu1/W"`, `"embed/vectors"`) built
//! from the layer name, and the optimizer keeps per-key state: the step
//! counter and the averaged copy. Keys are stable across a run because layer
//! names are validated as unique when a chain is built.
//!
//! ## Averaging Schedule
//!
//! The average warms up quickly and then becomes very sticky:
//!
//! ```text
//! decay = min((1 + t) / (10 + t), 0.9999)
//! average = average * decay + param * (1 - decay)
//! ```
//!
//! Early steps mostly copy the parameter (decay near 0.1), late steps barely
//! move the average, giving a long-horizon smoothed estimate.

use std::collections::HashMap;

use rayon::prelude::*;

use crate::error::{ModelError, Result};
use crate::tensor::Tensor;

/// Updates stay sequential below this element count (parallel overhead isn't
/// worth it for bias vectors).
const PARALLEL_UPDATE_THRESHOLD: usize = 1_000;

/// Ceiling for the averaging decay; keeps the average from freezing entirely.
const MAX_AVERAGE_DECAY: f32 = 0.9999;

/// Learning rate after `nr_update` steps of linear decay.
///
/// With `decay = 0` the rate is constant.
pub fn linear_decay(rate: f32, decay: f32, nr_update: u64) -> f32 {
    rate / (1.0 + decay * nr_update as f32)
}

/// Per-parameter auxiliary state: the averaged copy and the step counter.
struct ParamState {
    average: Tensor,
    nr_update: u64,
}

/// Plain SGD with linear rate decay, optional gradient clipping, and
/// parameter averaging.
pub struct Sgd {
    /// Base learning rate before decay.
    pub learning_rate: f32,
    /// Linear decay coefficient; 0 disables decay.
    pub lr_decay: f32,
    /// Maximum L2 norm per gradient; gradients above it are rescaled.
    pub max_grad_norm: Option<f32>,
    /// Most recent scalar loss recorded via [`Sgd::set_loss`]. Observational
    /// only; it never influences the update math.
    pub last_loss: Option<f32>,
    states: HashMap<String, ParamState>,
}

impl Sgd {
    /// Create an optimizer with the given base learning rate, no decay, and
    /// no clipping.
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            lr_decay: 0.0,
            max_grad_norm: None,
            last_loss: None,
            states: HashMap::new(),
        }
    }

    /// Builder-style setter for the linear decay coefficient.
    pub fn with_lr_decay(mut self, decay: f32) -> Self {
        self.lr_decay = decay;
        self
    }

    /// Builder-style setter for gradient clipping.
    pub fn with_max_grad_norm(mut self, max_norm: f32) -> Self {
        self.max_grad_norm = Some(max_norm);
        self
    }

    /// Apply one gradient-descent step to `param` and zero the gradient
    /// accumulator for the next cycle.
    ///
    /// The parameter and its gradient must have identical shapes; drift
    /// between them is reported as a `ShapeMismatch` keyed by the parameter
    /// identity.
    pub fn update(&mut self, key: &str, param: &mut Tensor, grad: &mut Tensor) -> Result<()> {
        if param.shape != grad.shape {
            return Err(ModelError::shape(
                key,
                param.shape_str(),
                grad.shape_str(),
            ));
        }

        if let Some(max_norm) = self.max_grad_norm {
            clip_gradient(grad, max_norm);
        }

        let state = self.states.entry(key.to_string()).or_insert_with(|| ParamState {
            average: Tensor::zeros(param.shape.clone()),
            nr_update: 0,
        });

        let rate = linear_decay(self.learning_rate, self.lr_decay, state.nr_update);
        state.nr_update += 1;

        if param.data.len() > PARALLEL_UPDATE_THRESHOLD {
            param
                .data
                .par_iter_mut()
                .zip(grad.data.par_iter_mut())
                .for_each(|(p, g)| {
                    *p -= rate * *g;
                    *g = 0.0;
                });
        } else {
            for (p, g) in param.data.iter_mut().zip(grad.data.iter_mut()) {
                *p -= rate * *g;
                *g = 0.0;
            }
        }

        let decay = ((1.0 + state.nr_update as f32) / (10.0 + state.nr_update as f32))
            .min(MAX_AVERAGE_DECAY);
        for (avg, &p) in state.average.data.iter_mut().zip(&param.data) {
            *avg = *avg * decay + p * (1.0 - decay);
        }

        Ok(())
    }

    /// Record the most recent scalar loss for logging and inspection.
    pub fn set_loss(&mut self, loss: f32) {
        self.last_loss = Some(loss);
    }

    /// The averaged copy of a parameter, if it has ever been updated.
    pub fn average(&self, key: &str) -> Option<&Tensor> {
        self.states.get(key).map(|s| &s.average)
    }

    /// How many updates a parameter has received.
    pub fn nr_update(&self, key: &str) -> u64 {
        self.states.get(key).map_or(0, |s| s.nr_update)
    }
}

/// Rescale a gradient whose L2 norm exceeds `max_norm`, preserving its
/// direction.
fn clip_gradient(grad: &mut Tensor, max_norm: f32) {
    let sum_sq: f32 = if grad.data.len() > PARALLEL_UPDATE_THRESHOLD {
        grad.data.par_iter().map(|&g| g * g).sum()
    } else {
        grad.data.iter().map(|&g| g * g).sum()
    };
    let norm = sum_sq.sqrt();
    if norm > max_norm {
        let scale = max_norm / norm;
        for g in grad.data.iter_mut() {
            *g *= scale;
        }
    }
}
