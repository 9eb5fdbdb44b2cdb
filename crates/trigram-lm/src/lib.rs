//! Kneser-Ney trigram language model: training, binary index build, and
//! low-latency probability queries.
//!
//! This is the facade crate that wires together the lower-level components:
//! - [`lm_core`]: term IDs, sentinels, and the shared error type
//! - `term-dict`: immutable trie term dictionary
//! - [`lm_train`]: corpus aggregation, discount estimation, model writing
//! - [`lm_index`]: index builder, binary serializer/loader, query engine
//!
//! The pipeline runs in three stages. [`train`] turns a `text\tfrequency`
//! corpus into a vocabulary file and a textual model file. [`build`]
//! compiles the model file into a single immutable binary index. Loading
//! that index yields a [`LanguageModel`] whose unigram, bigram, and trigram
//! probability queries chain backoff through range-restricted binary
//! searches.
//!
//! ```no_run
//! use std::path::Path;
//! use trigram_lm::{build, train, LanguageModel, TrainingConfig};
//!
//! # fn main() -> trigram_lm::Result<()> {
//! let config = TrainingConfig::default();
//! train(
//!     Path::new("corpus.tsv"),
//!     Path::new("vocab.txt"),
//!     Path::new("model.tsv"),
//!     &config,
//! )?;
//! build(Path::new("model.tsv"), Path::new("model.idx"))?;
//!
//! let model = LanguageModel::load(Path::new("model.idx"))?;
//! let p = model.trigram_prob_str("the", "quick", "fox");
//! assert!(p > 0.0 && p < 1.0);
//! # Ok(())
//! # }
//! ```

pub use lm_core::{LmError, Result, TermId, FIELD_SEP, OOV_ID, OOV_TERM, TERM_SEP};
pub use lm_index::{build, LanguageModel};
pub use lm_train::{train, TrainSummary, TrainingConfig};
