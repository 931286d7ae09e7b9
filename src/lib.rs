//! Viola: Composable Differentiable Layers for Sequence Tagging
//!
//! A small neural-network library implemented from scratch in Rust: layers
//! that compose into a chain, explicit reverse-mode differentiation through
//! per-layer backward contexts, an SGD optimizer with parameter averaging,
//! and a training-loop driver. Named after Shakespeare's quick-witted heroine
//! from *Twelfth Night*.
//!
//! # Modules
//!
//! - [`tensor`] - Dense array storage
//! - [`ops`] - Swappable numeric backend (matmul, softmax, dropout masks)
//! - [`layers`] - The `Layer` trait and the concrete layers
//! - [`model`] - The `Chain` composite model
//! - [`optimizer`] - SGD with learning-rate decay and parameter averaging
//! - [`loss`] - Categorical cross-entropy
//! - [`train`] - Epoch/batch/dropout schedule
//! - [`training_logger`] - CSV metrics logging
//!
//! # Example
//!
//! ```rust,no_run
//! use viola::{
//!     Affine, Batch, BatchNorm, Chain, Embed, ExtractWindow, FlattenSeqs,
//!     Relu, Sgd, Softmax, Trainer,
//! };
//!
//! // A windowed tagger: embed each token, look two tokens left and right,
//! // classify through a small ReLU stack.
//! let width = 32;
//! let mut model = Chain::new(vec![
//!     Box::new(FlattenSeqs::new()),
//!     Box::new(Embed::new(width, 5000, 0).named("embed")),
//!     Box::new(BatchNorm::new(width).named("norm0")),
//!     Box::new(ExtractWindow::new(2)),
//!     Box::new(Affine::new(width, width * 5, 1).named("hidden1")),
//!     Box::new(Relu::new().named("relu1")),
//!     Box::new(Softmax::new(17, width, 2)),
//! ]).unwrap();
//!
//! let mut optimizer = Sgd::new(0.001);
//! let trainer = Trainer::default();
//! # let (train_data, dev_data) = (vec![], vec![]);
//! trainer.train(&mut model, &mut optimizer, &train_data, &dev_data, None).unwrap();
//!
//! // Evaluate with the smoothed parameter averages.
//! let score = model.with_averages(&optimizer, |m| {
//!     viola::evaluate(m, &dev_data).unwrap()
//! }).unwrap();
//! println!("dev accuracy: {score:.3}");
//! ```

pub mod error;
pub mod layers;
pub mod loss;
pub mod model;
pub mod ops;
pub mod optimizer;
pub mod tensor;
pub mod train;
pub mod training_logger;

// Re-export the main types for convenience
pub use error::{ModelError, Result};
pub use layers::{
    Affine, Batch, BatchNorm, Context, Embed, ExtractWindow, FlattenSeqs, HealthCheck, Layer,
    Relu, ScaleShift, Softmax,
};
pub use loss::categorical_crossentropy;
pub use model::{Chain, ChainContext};
pub use ops::{CpuOps, Ops};
pub use optimizer::{linear_decay, Sgd};
pub use tensor::Tensor;
pub use train::{accuracy, evaluate, TaggedSeq, Trainer};
pub use training_logger::TrainingLogger;
