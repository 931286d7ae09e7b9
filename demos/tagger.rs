//! Windowed CNN Tagger on a Synthetic Corpus
//!
//! Trains a part-of-speech-style tagger end to end: tokens are embedded,
//! concatenated with their context windows, pushed through a small ReLU
//! stack with batch normalization, and classified with a softmax head.
//!
//! The corpus is generated from a toy grammar with four tags (determiner,
//! adjective, noun, verb) and a set of *ambiguous* words that are nouns after
//! a determiner or adjective but verbs elsewhere. A model without context
//! cannot tag those words; the window layers are what make them learnable.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --release --example tagger
//! cargo run --release --example tagger -- --epochs 20 --dropout 0.3
//! cargo run --release --example tagger -- --save tagger.bin --log run.csv
//! ```

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use viola::{
    evaluate, Affine, BatchNorm, Chain, Embed, ExtractWindow, FlattenSeqs, HealthCheck, Layer,
    Relu, ScaleShift, Sgd, Softmax, TaggedSeq, Trainer, TrainingLogger,
};

const TAG_DET: usize = 0;
const TAG_ADJ: usize = 1;
const TAG_NOUN: usize = 2;
const TAG_VERB: usize = 3;
const NR_TAG: usize = 4;

#[derive(Parser)]
#[command(
    name = "tagger",
    about = "Train a windowed CNN tagger on a synthetic corpus"
)]
struct Args {
    /// Embedding and hidden width
    #[arg(long, default_value = "32")]
    width: usize,

    /// Number of training epochs
    #[arg(long, default_value = "10")]
    epochs: usize,

    /// Sequences per batch
    #[arg(long, default_value = "8")]
    batch_size: usize,

    /// Initial dropout rate
    #[arg(long, default_value = "0.25")]
    dropout: f32,

    /// Dropout subtracted per epoch
    #[arg(long, default_value = "0.0")]
    dropout_decay: f32,

    /// Learning rate
    #[arg(long, default_value = "0.001")]
    lr: f32,

    /// Number of synthetic sentences to generate
    #[arg(long, default_value = "600")]
    sentences: usize,

    /// Random seed for data generation and initialization
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Save the trained model to this checkpoint file
    #[arg(long)]
    save: Option<String>,

    /// Write per-epoch metrics to this CSV file
    #[arg(long)]
    log: Option<String>,
}

// Word id ranges per class. Ambiguous words tag as nouns after a determiner
// or adjective and as verbs elsewhere, so correct tagging needs context.
const DETS: std::ops::RangeInclusive<usize> = 1..=3;
const ADJS: std::ops::RangeInclusive<usize> = 4..=13;
const NOUNS: std::ops::RangeInclusive<usize> = 14..=33;
const VERBS: std::ops::RangeInclusive<usize> = 34..=43;
const AMBIG: std::ops::RangeInclusive<usize> = 44..=46;

fn pick(rng: &mut StdRng, range: std::ops::RangeInclusive<usize>) -> usize {
    rng.gen_range(range)
}

/// One sentence from the toy grammar:
/// DET ADJ* (NOUN|AMBIG) (VERB|AMBIG) [DET (NOUN|AMBIG)]
fn generate_sentence(rng: &mut StdRng) -> TaggedSeq {
    let mut words = Vec::new();
    let mut tags = Vec::new();

    let noun_phrase = |words: &mut Vec<usize>, tags: &mut Vec<usize>, rng: &mut StdRng| {
        words.push(pick(rng, DETS));
        tags.push(TAG_DET);
        for _ in 0..rng.gen_range(0..=2) {
            words.push(pick(rng, ADJS));
            tags.push(TAG_ADJ);
        }
        // In noun position an ambiguous word is a noun.
        let word = if rng.gen_bool(0.3) {
            pick(rng, AMBIG)
        } else {
            pick(rng, NOUNS)
        };
        words.push(word);
        tags.push(TAG_NOUN);
    };

    noun_phrase(&mut words, &mut tags, rng);

    // In verb position the same ambiguous words are verbs.
    let verb = if rng.gen_bool(0.3) {
        pick(rng, AMBIG)
    } else {
        pick(rng, VERBS)
    };
    words.push(verb);
    tags.push(TAG_VERB);

    if rng.gen_bool(0.5) {
        noun_phrase(&mut words, &mut tags, rng);
    }

    (words, tags)
}

fn build_model(width: usize, seed: u64) -> viola::Result<Chain> {
    Chain::new(vec![
        Box::new(FlattenSeqs::new()) as Box<dyn Layer>,
        Box::new(Embed::new(width, 64, seed).named("embed")),
        Box::new(BatchNorm::new(width).named("norm0")),
        Box::new(ExtractWindow::new(2).named("window1")),
        Box::new(Affine::new(width, width * 5, seed + 1).named("hidden1")),
        Box::new(Relu::new().named("relu1")),
        Box::new(BatchNorm::new(width).named("norm1")),
        Box::new(ScaleShift::new(width).named("scale1")),
        Box::new(ExtractWindow::new(1).named("window2")),
        Box::new(Affine::new(width, width * 3, seed + 2).named("hidden2")),
        Box::new(Relu::new().named("relu2")),
        Box::new(HealthCheck::new(200).named("probe")),
        Box::new(Softmax::new(NR_TAG, width, seed + 3)),
    ])
}

fn main() -> viola::Result<()> {
    let args = Args::parse();

    let mut rng = StdRng::seed_from_u64(args.seed);
    let corpus: Vec<TaggedSeq> = (0..args.sentences)
        .map(|_| generate_sentence(&mut rng))
        .collect();
    let nr_dev = args.sentences / 5;
    let (dev_data, train_data) = corpus.split_at(nr_dev);
    println!(
        "Generated {} training and {} dev sentences ({} tags)",
        train_data.len(),
        dev_data.len(),
        NR_TAG
    );

    let mut model = build_model(args.width, args.seed)?;
    let mut optimizer = Sgd::new(args.lr).with_max_grad_norm(10.0);
    let trainer = Trainer {
        batch_size: args.batch_size,
        nb_epoch: args.epochs,
        dropout: args.dropout,
        dropout_decay: args.dropout_decay,
        shuffle: true,
    };

    let mut logger = match &args.log {
        Some(path) => Some(TrainingLogger::new(path)?),
        None => None,
    };
    trainer.train(
        &mut model,
        &mut optimizer,
        train_data,
        dev_data,
        logger.as_mut(),
    )?;

    let raw = evaluate(&model, dev_data)?;
    let averaged = model.with_averages(&optimizer, |m| evaluate(m, dev_data))??;
    println!("Final dev accuracy: {:.3} raw, {:.3} averaged", raw, averaged);

    if let Some(path) = &args.save {
        model.save_to_file(path)?;
        println!("Saved model to {}", path);
    }
    Ok(())
}
