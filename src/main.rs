//! trigram-lm CLI — train, compile, and query a Kneser-Ney trigram model.
//!
//! Thin wrapper over the `trigram-lm` library crate. Each distinct library
//! error maps to its own process exit code so batch drivers can tell an
//! unreadable file from a corrupt index.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use trigram_lm::{build, train, LanguageModel, LmError, TrainingConfig};

/// Statistical trigram language model with Kneser-Ney discounting.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a model from a `text<TAB>frequency` corpus.
    Train {
        /// Corpus file, one `text<TAB>frequency` line per entry.
        corpus: PathBuf,
        /// Output vocabulary file (one term per line).
        vocab: PathBuf,
        /// Output model file (`terms<TAB>probability<TAB>backoff`).
        model: PathBuf,
        /// JSON file with training settings; flags below override it.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Terms at or below this total frequency become OOV.
        #[arg(long)]
        oov_threshold: Option<u64>,
        /// Corpus lines at or below this frequency are discarded.
        #[arg(long)]
        corpus_threshold: Option<u64>,
        /// Trigrams at or below this frequency are pruned.
        #[arg(long)]
        trigram_threshold: Option<u64>,
    },
    /// Compile a trained model file into a binary index.
    Build {
        model: PathBuf,
        index: PathBuf,
    },
    /// Print the probability of a 1 to 3 term sequence.
    Query {
        index: PathBuf,
        /// The terms, left context first.
        #[arg(num_args = 1..=3, required = true)]
        terms: Vec<String>,
        /// Print the natural log probability instead.
        #[arg(long)]
        ln: bool,
    },
}

fn load_config(path: &Path) -> Result<TrainingConfig, LmError> {
    let text = fs::read_to_string(path).map_err(|e| LmError::open(path, e))?;
    serde_json::from_str(&text)
        .map_err(|e| LmError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))
}

fn run(args: Args) -> Result<(), LmError> {
    match args.command {
        Command::Train {
            corpus,
            vocab,
            model,
            config,
            oov_threshold,
            corpus_threshold,
            trigram_threshold,
        } => {
            let mut settings = match config {
                Some(path) => load_config(&path)?,
                None => TrainingConfig::default(),
            };
            if let Some(value) = oov_threshold {
                settings.oov_threshold = value;
            }
            if let Some(value) = corpus_threshold {
                settings.corpus_threshold = value;
            }
            if let Some(value) = trigram_threshold {
                settings.trigram_threshold = value;
            }

            let summary = train(&corpus, &vocab, &model, &settings)?;
            println!(
                "trained {} unigrams, {} bigrams, {} trigrams ({} OOV terms)",
                summary.unigrams, summary.bigrams, summary.trigrams, summary.oov_terms
            );
            println!(
                "discounts: bigram {} trigram {}",
                summary.bigram_delta, summary.trigram_delta
            );
        }
        Command::Build { model, index } => {
            build(&model, &index)?;
            println!("index written to {}", index.display());
        }
        Command::Query { index, terms, ln } => {
            let model = LanguageModel::load(&index)?;
            let ids: Vec<_> = terms.iter().map(|t| model.term_id(t)).collect();
            let value = match (ids.as_slice(), ln) {
                ([t], false) => model.unigram_prob(*t),
                ([t], true) => model.ln_unigram_prob(*t),
                ([u, v], false) => model.bigram_prob(*u, *v),
                ([u, v], true) => model.ln_bigram_prob(*u, *v),
                ([u, v, w], false) => model.trigram_prob(*u, *v, *w),
                ([u, v, w], true) => model.ln_trigram_prob(*u, *v, *w),
                _ => unreachable!("clap enforces 1 to 3 terms"),
            };
            println!("{value}");
        }
    }
    Ok(())
}

/// One exit code per failure cause.
fn exit_code(err: &LmError) -> u8 {
    match err {
        LmError::Open { .. } => 2,
        LmError::Io(_) => 3,
        LmError::DictFormat(_) => 4,
        LmError::MissingDependency { .. } => 5,
        LmError::ProbabilityRange { .. } => 6,
        LmError::Overflow { .. } => 7,
        LmError::EmptyModel => 8,
        LmError::UnsortedChildren { .. } => 9,
        LmError::SizeMismatch { .. } => 10,
        LmError::DictMismatch { .. } => 11,
        LmError::OovIdMismatch { .. } => 12,
        LmError::Allocation { .. } => 13,
    }
}

fn main() -> ExitCode {
    env_logger::init();
    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(exit_code(&err))
        }
    }
}
