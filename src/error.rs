//! Error Types
//!
//! This module defines the error taxonomy for the whole library.
//!
//! ## Philosophy
//!
//! Shape problems are caught eagerly, at the first layer boundary where they
//! occur, and never papered over with silent broadcasting or truncation. A
//! wrong shape almost always means a wiring mistake in the model definition,
//! so the error names the offending layer and both shapes.
//!
//! Two conditions deliberately do NOT produce errors:
//!
//! - Unknown embedding ids resolve to a default vector, because unseen tokens
//!   are expected at inference time.
//! - Variance underflow in batch normalization is prevented with an epsilon
//!   floor rather than surfaced.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ModelError>;

/// Everything that can go wrong while building, running, or persisting a model.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Incompatible tensor or layer dimensions.
    ///
    /// Raised at construction time for incompatible chained layers, and at
    /// runtime by the first layer that receives input of the wrong width.
    #[error("shape mismatch in '{layer}': expected {expected}, got {got}")]
    ShapeMismatch {
        layer: String,
        expected: String,
        got: String,
    },

    /// The backward contract was broken: a context handed to the wrong layer,
    /// a gradient of non-matching shape, or a context count that drifted from
    /// the layer count.
    #[error("contract violation in '{layer}': {reason}")]
    ContractViolation { layer: String, reason: String },

    /// I/O failure while reading or writing a checkpoint.
    #[error("checkpoint i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Checkpoint bytes that cannot be interpreted.
    #[error("corrupt checkpoint: {0}")]
    Corrupt(String),

    /// Manifest (de)serialization failure.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ModelError {
    /// Build a `ShapeMismatch` without format boilerplate at call sites.
    pub fn shape(
        layer: impl Into<String>,
        expected: impl Into<String>,
        got: impl Into<String>,
    ) -> Self {
        ModelError::ShapeMismatch {
            layer: layer.into(),
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// Build a `ContractViolation` without format boilerplate at call sites.
    pub fn contract(layer: impl Into<String>, reason: impl Into<String>) -> Self {
        ModelError::ContractViolation {
            layer: layer.into(),
            reason: reason.into(),
        }
    }
}
