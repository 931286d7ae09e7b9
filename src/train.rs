//! Training Loop
//!
//! The trainer owns the schedule, nothing else: it shuffles and batches the
//! examples, drives forward and backward passes through the model, wires loss
//! gradients into the optimizer, decays the dropout rate between epochs, and
//! evaluates on a held-out set with inference-mode forwards only.
//!
//! ## One Training Step
//!
//! ```text
//! (probs, tape) = model.begin_update(batch, dropout)
//! (grad, loss)  = categorical_crossentropy(probs, truth)
//! optimizer.set_loss(loss)
//! model.finish_update(tape, grad, optimizer)
//! ```
//!
//! Updates are synchronous: the optimizer applies each batch's gradients
//! before the next batch's forward pass begins, so a gradient is never stale
//! with respect to the parameters that produced it. An error anywhere in a
//! batch aborts the run; a corrupted batch almost always means a bug
//! upstream, and training through it would only bury the evidence.

use rand::seq::SliceRandom;

use crate::error::Result;
use crate::layers::Batch;
use crate::loss::categorical_crossentropy;
use crate::model::Chain;
use crate::ops::{CpuOps, Ops};
use crate::optimizer::Sgd;
use crate::tensor::Tensor;
use crate::training_logger::TrainingLogger;

/// One training example: a sequence of token ids and its per-token tag ids.
pub type TaggedSeq = (Vec<usize>, Vec<usize>);

/// Epoch, batching, and dropout schedule for a training run.
pub struct Trainer {
    /// Sequences per batch.
    pub batch_size: usize,
    /// Number of passes over the training set.
    pub nb_epoch: usize,
    /// Initial dropout rate passed to the model's training forwards.
    pub dropout: f32,
    /// Amount subtracted from the dropout rate after each epoch (floored
    /// at zero).
    pub dropout_decay: f32,
    /// Reshuffle the example order each epoch.
    pub shuffle: bool,
}

impl Default for Trainer {
    fn default() -> Self {
        Self {
            batch_size: 8,
            nb_epoch: 10,
            dropout: 0.25,
            dropout_decay: 0.0,
            shuffle: true,
        }
    }
}

/// Dropout rate for the next epoch: subtractive decay, floored at zero.
fn next_dropout(rate: f32, decay: f32) -> f32 {
    (rate - decay).max(0.0)
}

impl Trainer {
    /// Run the full schedule, mutating the model in place.
    ///
    /// `heldout` may be empty; when it is not, accuracy on it is computed
    /// between epochs with inference-mode forwards (no parameter mutation).
    /// `logger` optionally records one CSV row per epoch.
    pub fn train(
        &self,
        model: &mut Chain,
        optimizer: &mut Sgd,
        examples: &[TaggedSeq],
        heldout: &[TaggedSeq],
        mut logger: Option<&mut TrainingLogger>,
    ) -> Result<()> {
        let mut dropout = self.dropout;
        let mut order: Vec<usize> = (0..examples.len()).collect();

        for epoch in 1..=self.nb_epoch {
            if self.shuffle {
                order.shuffle(&mut rand::thread_rng());
            }

            let mut epoch_loss = 0.0;
            let mut nr_position = 0usize;

            for batch_indices in order.chunks(self.batch_size) {
                let seqs: Vec<Vec<usize>> = batch_indices
                    .iter()
                    .map(|&i| examples[i].0.clone())
                    .collect();
                let truth: Vec<usize> = batch_indices
                    .iter()
                    .flat_map(|&i| examples[i].1.iter().copied())
                    .collect();

                let (probs, tape) = model.begin_update(&Batch::Seqs(seqs), dropout)?;
                let (gradient, loss) = categorical_crossentropy(&probs, &truth)?;
                optimizer.set_loss(loss);
                model.finish_update(tape, &gradient, optimizer)?;

                epoch_loss += loss;
                nr_position += truth.len();
            }

            let train_loss = epoch_loss / nr_position.max(1) as f32;
            let dev_accuracy = if heldout.is_empty() {
                None
            } else {
                Some(evaluate(model, heldout)?)
            };

            match dev_accuracy {
                Some(acc) => println!(
                    "epoch {:>3}: loss {:.4}, dev accuracy {:.3}, dropout {:.2}",
                    epoch, train_loss, acc, dropout
                ),
                None => println!("epoch {:>3}: loss {:.4}, dropout {:.2}", epoch, train_loss, dropout),
            }
            if let Some(logger) = logger.as_mut() {
                logger.log(
                    epoch,
                    optimizer.learning_rate,
                    dropout,
                    train_loss,
                    dev_accuracy,
                )?;
            }

            dropout = next_dropout(dropout, self.dropout_decay);
        }
        Ok(())
    }
}

/// Tagging accuracy of inference-mode predictions over a dataset.
pub fn evaluate(model: &Chain, examples: &[TaggedSeq]) -> Result<f32> {
    let ops = CpuOps;
    let mut correct = 0usize;
    let mut total = 0usize;

    for chunk in examples.chunks(32) {
        let seqs: Vec<Vec<usize>> = chunk.iter().map(|(words, _)| words.clone()).collect();
        let truth: Vec<usize> = chunk
            .iter()
            .flat_map(|(_, tags)| tags.iter().copied())
            .collect();

        let probs = model.predict(&Batch::Seqs(seqs))?;
        correct += count_correct(&ops, &probs, &truth);
        total += truth.len();
    }
    Ok(correct as f32 / total.max(1) as f32)
}

/// Fraction of rows whose argmax matches the truth.
pub fn accuracy(probs: &Tensor, truth: &[usize]) -> f32 {
    count_correct(&CpuOps, probs, truth) as f32 / truth.len().max(1) as f32
}

fn count_correct<O: Ops>(ops: &O, probs: &Tensor, truth: &[usize]) -> usize {
    ops.argmax(probs)
        .iter()
        .zip(truth)
        .filter(|(guess, truth)| guess == truth)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{Affine, Embed, FlattenSeqs, Relu, Softmax};

    #[test]
    fn test_dropout_decay_floors_at_zero() {
        assert!((next_dropout(0.2, 0.15) - 0.05).abs() < 1e-6);
        assert_eq!(next_dropout(0.05, 0.15), 0.0);
        assert_eq!(next_dropout(0.0, 0.15), 0.0);
    }

    #[test]
    fn test_accuracy_counts_argmax_matches() {
        let probs = Tensor::new(vec![0.9, 0.1, 0.2, 0.8, 0.6, 0.4], vec![3, 2]);
        assert!((accuracy(&probs, &[0, 1, 1]) - 2.0 / 3.0).abs() < 1e-6);
    }

    /// A toy memorization task: each word id has a fixed tag. The model only
    /// has to learn the id-to-tag table, so the loss must fall.
    #[test]
    fn test_training_reduces_loss() {
        let nr_tag = 3;
        let examples: Vec<TaggedSeq> = (0..12)
            .map(|i| {
                let words: Vec<usize> = (0..5).map(|j| (i + j) % 6 + 1).collect();
                let tags: Vec<usize> = words.iter().map(|w| w % nr_tag).collect();
                (words, tags)
            })
            .collect();

        let mut model = Chain::new(vec![
            Box::new(FlattenSeqs::new()),
            Box::new(Embed::new(8, 16, 3).named("embed")),
            Box::new(Affine::new(8, 8, 4).named("hidden")),
            Box::new(Relu::new()),
            Box::new(Softmax::new(nr_tag, 8, 5)),
        ])
        .unwrap();
        let mut optimizer = Sgd::new(0.1);

        let mean_loss = |model: &Chain| -> f32 {
            let mut total = 0.0;
            let mut count = 0usize;
            for (words, tags) in &examples {
                let probs = model.predict(&Batch::Seqs(vec![words.clone()])).unwrap();
                let (_, loss) = categorical_crossentropy(&probs, tags).unwrap();
                total += loss;
                count += tags.len();
            }
            total / count as f32
        };

        let before = mean_loss(&model);
        let trainer = Trainer {
            batch_size: 4,
            nb_epoch: 20,
            dropout: 0.0,
            dropout_decay: 0.0,
            shuffle: true,
        };
        trainer
            .train(&mut model, &mut optimizer, &examples, &[], None)
            .unwrap();
        let after = mean_loss(&model);

        assert!(
            after < before * 0.9,
            "loss did not fall: before {}, after {}",
            before,
            after
        );
    }

    #[test]
    fn test_heldout_evaluation_does_not_mutate_parameters() {
        let examples: Vec<TaggedSeq> = vec![(vec![1, 2, 3], vec![0, 1, 0])];
        let mut model = Chain::new(vec![
            Box::new(FlattenSeqs::new()),
            Box::new(Embed::new(4, 8, 1).named("embed")),
            Box::new(Softmax::new(2, 4, 2)),
        ])
        .unwrap();

        let probs_before = model.predict(&Batch::Seqs(vec![vec![1, 2, 3]])).unwrap();
        evaluate(&model, &examples).unwrap();
        let probs_after = model.predict(&Batch::Seqs(vec![vec![1, 2, 3]])).unwrap();
        assert_eq!(probs_before, probs_after);
    }
}
