//! Training pipeline for the trigram language model.
//!
//! Three stages, each feeding the next:
//!
//! 1. **Aggregation** — two passes over a `text\tfrequency` corpus. The
//!    first pass collects per-term frequencies and derives the set of
//!    out-of-vocabulary terms; the second substitutes those terms with the
//!    OOV sentinel and accumulates unigram/bigram/trigram frequencies into
//!    one map keyed by the space-joined term sequence.
//! 2. **Estimation** — Kneser-Ney discount constants from count-of-counts
//!    statistics, then probability and backoff weight per gram in three
//!    strictly ordered sweeps (unigram, bigram, trigram).
//! 3. **Writing** — a vocabulary file and a textual model file in stable
//!    key order, which is what later guarantees id-ascending children runs
//!    for the index builder.
//!
//! Malformed corpus lines are logged and skipped; missing backoff
//! dependencies and out-of-range probabilities are fatal.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use lm_core::{LmError, Result, FIELD_SEP, OOV_TERM, TERM_SEP};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

/// Tunables for one training run.
///
/// A value threaded through [`train`] rather than process-wide state, so
/// independent runs in one process cannot interfere.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Unigrams with total frequency at or below this join the OOV set.
    pub oov_threshold: u64,
    /// Corpus lines with frequency at or below this are discarded; the
    /// threshold is subtracted from surviving frequencies.
    pub corpus_threshold: u64,
    /// Trigrams with frequency at or below this are pruned from the model
    /// (0 disables pruning).
    pub trigram_threshold: u64,
    /// Fallback bigram discount when count-of-counts estimation fails.
    pub bigram_delta: f64,
    /// Fallback trigram discount when count-of-counts estimation fails.
    pub trigram_delta: f64,
    /// Interpolation weight between the MLE and continuation unigram
    /// estimates.
    pub unigram_interpolation: f64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            oov_threshold: 1,
            corpus_threshold: 0,
            trigram_threshold: 1,
            bigram_delta: 0.2,
            trigram_delta: 0.1,
            unigram_interpolation: 0.5,
        }
    }
}

/// What a training run produced, for reporting.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct TrainSummary {
    pub unigrams: usize,
    pub bigrams: usize,
    /// Trigrams surviving the pruning threshold.
    pub trigrams: usize,
    pub oov_terms: usize,
    /// Discount actually used for bigrams (estimated or fallback).
    pub bigram_delta: f64,
    /// Discount actually used for trigrams (estimated or fallback).
    pub trigram_delta: f64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum GramKind {
    Unigram,
    Bigram,
    Trigram,
}

/// One accumulated n-gram: up to three terms, raw frequency, and the
/// probability/backoff pair filled in by the sweeps.
#[derive(Debug)]
struct Gram {
    terms: [String; 3],
    kind: GramKind,
    freq: u64,
    prob: f64,
    backoff: f64,
}

impl Gram {
    fn new(terms: &[&str], freq: u64) -> Self {
        let kind = match terms.len() {
            1 => GramKind::Unigram,
            2 => GramKind::Bigram,
            _ => GramKind::Trigram,
        };
        let mut slots = [String::new(), String::new(), String::new()];
        for (slot, term) in slots.iter_mut().zip(terms) {
            *slot = (*term).to_string();
        }
        Gram {
            terms: slots,
            kind,
            freq,
            prob: 0.0,
            backoff: 0.0,
        }
    }

    fn pruned(&self, config: &TrainingConfig) -> bool {
        config.trigram_threshold > 0
            && self.kind == GramKind::Trigram
            && self.freq <= config.trigram_threshold
    }
}

/// Grams keyed by their space-joined term sequence. The BTreeMap order is
/// load-bearing: dense IDs are later assigned in this same byte order, so
/// each parent's children come out id-ascending and contiguous.
type GramMap = BTreeMap<String, Gram>;

/// Split a corpus line into its text and frequency fields.
/// Returns `None` for anything that should be logged and skipped.
fn parse_corpus_line(line: &str) -> Option<(&str, u64)> {
    let line = line.trim_end_matches('\r');
    let mut fields = line.split(FIELD_SEP);
    let text = fields.next()?;
    let freq = fields.next()?.parse().ok()?;
    if fields.next().is_some() || text.trim().is_empty() {
        return None;
    }
    Some((text, freq))
}

fn open_corpus(path: &Path) -> Result<BufReader<File>> {
    Ok(BufReader::new(
        File::open(path).map_err(|e| LmError::open(path, e))?,
    ))
}

fn observe(map: &mut GramMap, terms: &[&str], freq: u64) {
    let key = terms.join(" ");
    match map.get_mut(&key) {
        Some(gram) => gram.freq += freq,
        None => {
            map.insert(key, Gram::new(terms, freq));
        }
    }
}

/// Two-pass corpus aggregation. Returns the gram map and the OOV set size.
fn aggregate(corpus: &Path, config: &TrainingConfig) -> Result<(GramMap, usize)> {
    // Pass 1: per-term frequencies, to decide the OOV set.
    info!("building the OOV set");
    let mut term_freq: HashMap<String, u64> = HashMap::new();
    for (number, line) in open_corpus(corpus)?.lines().enumerate() {
        let line = line?;
        let Some((text, freq)) = parse_corpus_line(&line) else {
            warn!("skipping malformed corpus line {}", number + 1);
            continue;
        };
        if freq <= config.corpus_threshold {
            continue;
        }
        let freq = freq - config.corpus_threshold;
        for term in text.split_whitespace() {
            *term_freq.entry(term.to_string()).or_insert(0) += freq;
        }
    }

    let oov_set: HashSet<String> = term_freq
        .into_iter()
        .filter(|&(_, freq)| freq <= config.oov_threshold)
        .map(|(term, _)| term)
        .collect();
    info!("{} terms fall below the OOV threshold", oov_set.len());

    // Pass 2: substitute OOV terms and accumulate all gram orders.
    info!("accumulating gram frequencies");
    let mut map = GramMap::new();
    for (number, line) in open_corpus(corpus)?.lines().enumerate() {
        let line = line?;
        let Some((text, freq)) = parse_corpus_line(&line) else {
            warn!("skipping malformed corpus line {}", number + 1);
            continue;
        };
        if freq <= config.corpus_threshold {
            continue;
        }
        let freq = freq - config.corpus_threshold;

        let terms: Vec<&str> = text
            .split_whitespace()
            .map(|term| {
                if oov_set.contains(term) {
                    OOV_TERM
                } else {
                    term
                }
            })
            .collect();

        for i in 0..terms.len() {
            observe(&mut map, &terms[i..=i], freq);
            if i + 2 <= terms.len() {
                observe(&mut map, &terms[i..i + 2], freq);
            }
            if i + 3 <= terms.len() {
                observe(&mut map, &terms[i..i + 3], freq);
            }
        }
    }

    Ok((map, oov_set.len()))
}

/// Discount constants and probability/backoff computation, in place.
/// Returns the (bigram, trigram) discounts actually used.
fn compute_probabilities(map: &mut GramMap, config: &TrainingConfig) -> Result<(f64, f64)> {
    // Count-of-counts (pre trigram-pruning) and continuation sets
    // (post-pruning), gathered in one walk.
    let mut bigram_n = [0u64; 2];
    let mut trigram_n = [0u64; 2];
    // Distinct left contexts of each term: N(*w).
    let mut left_contexts: HashMap<String, HashSet<String>> = HashMap::new();
    // Distinct right contexts of each term: N(w*).
    let mut right_contexts: HashMap<String, HashSet<String>> = HashMap::new();
    // Distinct continuations of each bigram: N(uv*).
    let mut continuations: HashMap<String, HashSet<String>> = HashMap::new();
    let mut unigram_total = 0u64;

    for gram in map.values() {
        match gram.kind {
            GramKind::Bigram => {
                bigram_n[0] += u64::from(gram.freq == 1);
                bigram_n[1] += u64::from(gram.freq == 2);
            }
            GramKind::Trigram => {
                trigram_n[0] += u64::from(gram.freq == 1);
                trigram_n[1] += u64::from(gram.freq == 2);
            }
            GramKind::Unigram => {}
        }

        if gram.pruned(config) {
            continue;
        }

        match gram.kind {
            GramKind::Unigram => unigram_total += gram.freq,
            GramKind::Bigram => {
                right_contexts
                    .entry(gram.terms[0].clone())
                    .or_default()
                    .insert(gram.terms[1].clone());
                left_contexts
                    .entry(gram.terms[1].clone())
                    .or_default()
                    .insert(gram.terms[0].clone());
            }
            GramKind::Trigram => {
                let prefix = format!("{}{}{}", gram.terms[0], TERM_SEP, gram.terms[1]);
                continuations
                    .entry(prefix)
                    .or_default()
                    .insert(gram.terms[2].clone());
            }
        }
    }

    let bigram_delta = if bigram_n[0] > 0 && bigram_n[1] > 0 {
        bigram_n[0] as f64 / (bigram_n[0] + 2 * bigram_n[1]) as f64
    } else {
        config.bigram_delta
    };
    info!(
        "bigram count-of-counts <{},{}>, delta = {bigram_delta}",
        bigram_n[0], bigram_n[1]
    );

    let trigram_delta = if trigram_n[0] > 0 && trigram_n[1] > 0 {
        trigram_n[0] as f64 / (trigram_n[0] + 2 * trigram_n[1]) as f64
    } else {
        config.trigram_delta
    };
    info!(
        "trigram count-of-counts <{},{}>, delta = {trigram_delta}",
        trigram_n[0], trigram_n[1]
    );

    // N(**): total distinct bigram types, the continuation denominator.
    let bigram_types: usize = right_contexts.values().map(HashSet::len).sum();
    debug!("distinct bigram types = {bigram_types}");

    // Unigram sweep. Interpolates the MLE estimate with the Kneser-Ney
    // continuation estimate; the backoff weight feeds the bigram sweep.
    info!("computing unigram probabilities");
    let mut unigram_results: HashMap<String, (f64, f64, u64)> = HashMap::new();
    for (key, gram) in map.iter_mut() {
        if gram.kind != GramKind::Unigram {
            continue;
        }
        let mle = gram.freq as f64 / unigram_total as f64;
        let continuation = if bigram_types == 0 {
            0.0
        } else {
            let seen = left_contexts.get(key).map_or(0, HashSet::len);
            seen as f64 / bigram_types as f64
        };
        gram.prob = config.unigram_interpolation * mle
            + (1.0 - config.unigram_interpolation) * continuation;

        let right = right_contexts.get(key).map_or(1, HashSet::len);
        gram.backoff = bigram_delta * right as f64 / gram.freq as f64;

        debug!(
            "unigram <{key}> mle={mle} continuation={continuation} prob={} backoff={}",
            gram.prob, gram.backoff
        );
        unigram_results.insert(key.clone(), (gram.prob, gram.backoff, gram.freq));
    }

    // Bigram sweep. Requires both unigram results; their absence means the
    // aggregation itself is inconsistent and the run must stop.
    info!("computing bigram probabilities");
    let mut bigram_results: HashMap<String, (f64, f64, u64)> = HashMap::new();
    for (key, gram) in map.iter_mut() {
        if gram.kind != GramKind::Bigram {
            continue;
        }
        let missing = |term: &str| LmError::MissingDependency {
            kind: "unigram",
            key: term.to_string(),
            context: key.clone(),
        };
        let &(second_prob, _, _) = unigram_results
            .get(&gram.terms[1])
            .ok_or_else(|| missing(&gram.terms[1]))?;
        let &(_, first_backoff, first_freq) = unigram_results
            .get(&gram.terms[0])
            .ok_or_else(|| missing(&gram.terms[0]))?;

        let main = (gram.freq as f64 - bigram_delta).max(0.0) / first_freq as f64;
        gram.prob = main + second_prob * first_backoff;

        let seen = match continuations.get(key) {
            Some(set) => set.len(),
            None => {
                warn!("no trigram continuations recorded for bigram <{key}>, defaulting to 1");
                1
            }
        };
        gram.backoff = trigram_delta * seen as f64 / gram.freq as f64;

        bigram_results.insert(key.clone(), (gram.prob, gram.backoff, gram.freq));
    }

    // Trigram sweep. Pruned trigrams are left untouched; the writer drops
    // them later.
    info!("computing trigram probabilities");
    for (key, gram) in map.iter_mut() {
        if gram.kind != GramKind::Trigram || gram.pruned(config) {
            continue;
        }
        let missing = |pair: &str| LmError::MissingDependency {
            kind: "bigram",
            key: pair.to_string(),
            context: key.clone(),
        };
        let suffix = format!("{}{}{}", gram.terms[1], TERM_SEP, gram.terms[2]);
        let &(suffix_prob, _, _) = bigram_results
            .get(&suffix)
            .ok_or_else(|| missing(&suffix))?;
        let prefix = format!("{}{}{}", gram.terms[0], TERM_SEP, gram.terms[1]);
        let &(_, prefix_backoff, prefix_freq) = bigram_results
            .get(&prefix)
            .ok_or_else(|| missing(&prefix))?;

        gram.prob = (gram.freq as f64 - trigram_delta).max(0.0) / prefix_freq as f64
            + suffix_prob * prefix_backoff;
    }

    Ok((bigram_delta, trigram_delta))
}

/// Guarantee the OOV sentinel exists as a unigram so the built dictionary
/// can always resolve it to ID 1 with a real record behind it.
///
/// When no term fell below the OOV threshold the sentinel was never
/// observed; it is then given half the smallest surviving unigram
/// probability (keeping the (0,1) contract) and the backoff weight a
/// frequency-1 term with the default single right context would get.
/// A zero backoff here would turn every query that backs off through the
/// OOV context into an exact 0.0, and negative infinity in log space.
fn ensure_oov_unigram(map: &mut GramMap, bigram_delta: f64) {
    if map.is_empty() || map.contains_key(OOV_TERM) {
        return;
    }
    let floor = map
        .values()
        .filter(|gram| gram.kind == GramKind::Unigram)
        .map(|gram| gram.prob)
        .fold(f64::INFINITY, f64::min);
    let mut sentinel = Gram::new(&[OOV_TERM], 0);
    sentinel.prob = floor / 2.0;
    sentinel.backoff = bigram_delta;
    info!(
        "OOV sentinel was never observed; injecting it with probability {}",
        sentinel.prob
    );
    map.insert(OOV_TERM.to_string(), sentinel);
}

/// Write the vocabulary and model files in gram-key order.
///
/// Every surviving probability is checked against the (0,1) contract here,
/// immediately before persistence; a violation is a modeling-invariant
/// failure, not a user error.
fn write_model(
    map: &GramMap,
    vocab_path: &Path,
    model_path: &Path,
    config: &TrainingConfig,
) -> Result<()> {
    let mut vocab = BufWriter::new(
        File::create(vocab_path).map_err(|e| LmError::open(vocab_path, e))?,
    );
    let mut model = BufWriter::new(
        File::create(model_path).map_err(|e| LmError::open(model_path, e))?,
    );

    for (key, gram) in map {
        if gram.kind == GramKind::Unigram {
            writeln!(vocab, "{}", gram.terms[0])?;
        }
        if gram.pruned(config) {
            continue;
        }
        if !(gram.prob > 0.0 && gram.prob < 1.0) {
            return Err(LmError::ProbabilityRange {
                key: key.clone(),
                prob: gram.prob,
            });
        }
        writeln!(model, "{key}\t{}\t{}", gram.prob, gram.backoff)?;
    }

    vocab.flush()?;
    model.flush()?;
    Ok(())
}

/// Train the model: aggregate the corpus, estimate discounts, compute
/// probabilities, and persist the vocabulary and model files.
///
/// An entirely pruned-away corpus yields empty output files and a warning;
/// the subsequent index build rejects the empty model.
pub fn train(
    corpus: &Path,
    vocab_out: &Path,
    model_out: &Path,
    config: &TrainingConfig,
) -> Result<TrainSummary> {
    info!(
        "training: oov_threshold={} corpus_threshold={} trigram_threshold={}",
        config.oov_threshold, config.corpus_threshold, config.trigram_threshold
    );

    let (mut map, oov_terms) = aggregate(corpus, config)?;
    if map.is_empty() {
        warn!("corpus is empty after pruning; the model will have no entries");
    }

    let (bigram_delta, trigram_delta) = compute_probabilities(&mut map, config)?;
    ensure_oov_unigram(&mut map, bigram_delta);
    write_model(&map, vocab_out, model_out, config)?;

    let mut summary = TrainSummary {
        oov_terms,
        bigram_delta,
        trigram_delta,
        ..TrainSummary::default()
    };
    for gram in map.values() {
        match gram.kind {
            GramKind::Unigram => summary.unigrams += 1,
            GramKind::Bigram => summary.bigrams += 1,
            GramKind::Trigram => {
                if !gram.pruned(config) {
                    summary.trigrams += 1;
                }
            }
        }
    }
    info!(
        "trained {} unigrams, {} bigrams, {} trigrams",
        summary.unigrams, summary.bigrams, summary.trigrams
    );
    Ok(summary)
}
