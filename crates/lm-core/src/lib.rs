//! Core identifiers, sentinels, and the shared error type for the trigram-lm
//! workspace.
//!
//! Every crate in the workspace speaks in terms of [`TermId`] values assigned
//! by the term dictionary, and reports failures through [`LmError`]. The two
//! reserved values are structural, not application-specific: ID 0 is never
//! assigned (it doubles as "no value" inside the dictionary trie), and ID 1
//! always belongs to the out-of-vocabulary sentinel term.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Dense identifier assigned to a vocabulary term by the term dictionary.
///
/// IDs are sequential starting from 1, in model-file (byte-lexicographic)
/// order. ID 0 is invalid and never assigned, which lets the dictionary use
/// a zero value slot to mean "no entry ends here".
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct TermId(pub u32);

impl TermId {
    /// Raw u32 value.
    #[inline]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Convert to usize for indexing.
    #[inline]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// The ID every unknown term resolves to. Always 1.
pub const OOV_ID: TermId = TermId(1);

/// Reserved sentinel string standing in for out-of-vocabulary terms.
///
/// A single 0x01 byte: it can never be produced by whitespace splitting of
/// ordinary text, and it sorts before every printable term, so the sentinel
/// naturally receives ID 1 when IDs are assigned in key order.
pub const OOV_TERM: &str = "\x01";

/// Separator between terms inside an n-gram key and inside model-file phrases.
///
/// Reserved so that joined keys cannot collide ("ab c" vs "a bc").
pub const TERM_SEP: char = ' ';

/// Separator between fields of corpus and model lines.
pub const FIELD_SEP: char = '\t';

/// Workspace-wide result alias.
pub type Result<T> = std::result::Result<T, LmError>;

/// Every distinct failure cause across training, index build, and load.
///
/// Line-level problems (a malformed corpus or model line) are logged and
/// skipped by the pipeline and never surface here; these variants are the
/// fatal tier. None of them terminate the process — a corrupted index must
/// never be served, but the decision belongs to the caller.
#[derive(Debug, Error)]
pub enum LmError {
    /// A named input or output file could not be opened.
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// I/O failure after a file was successfully opened.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The serialized dictionary blob does not describe a valid trie.
    #[error("dictionary blob is malformed: {0}")]
    DictFormat(String),

    /// A lower-order result required for backoff computation was absent.
    /// This is an internal consistency failure, not a user error.
    #[error("missing {kind} entry for <{key}> while processing <{context}>")]
    MissingDependency {
        kind: &'static str,
        key: String,
        context: String,
    },

    /// A finalized probability fell outside the open interval (0,1).
    #[error("probability {prob} for <{key}> is outside (0,1)")]
    ProbabilityRange { key: String, prob: f64 },

    /// A gram count exceeded the 32-bit record range of the index format.
    #[error("{what} count {count} exceeds the 32-bit record limit")]
    Overflow { what: &'static str, count: u64 },

    /// The model file contains no unigrams; an empty dictionary would
    /// crash every downstream lookup, so the build refuses it.
    #[error("model contains no unigrams; refusing to build an empty index")]
    EmptyModel,

    /// Children of a parent gram were not listed in ascending ID order.
    /// The query engine's binary search silently returns wrong
    /// probabilities if this is let through, so the build fails loudly.
    #[error("children of <{parent}> are not id-ascending at model line {line}")]
    UnsortedChildren { parent: String, line: usize },

    /// The size recorded in the index header disagrees with the file on
    /// disk. Cheap truncation/corruption check performed before anything
    /// else is read.
    #[error("index size mismatch: header says {expected} bytes, file has {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// The dictionary header's entry count disagrees with the
    /// deserialized trie.
    #[error("dictionary entry count mismatch: header says {expected}, trie has {actual}")]
    DictMismatch { expected: u32, actual: u32 },

    /// The OOV sentinel did not resolve to [`OOV_ID`] in the loaded
    /// dictionary.
    #[error("OOV sentinel resolves to {found:?}, expected {expected:?}")]
    OovIdMismatch {
        found: Option<TermId>,
        expected: TermId,
    },

    /// An index array could not be allocated at load time.
    #[error("failed to allocate {what} buffer of {count} records")]
    Allocation { what: &'static str, count: u64 },
}

impl LmError {
    /// Wrap a file-open failure with the offending path.
    pub fn open(path: &Path, source: io::Error) -> Self {
        LmError::Open {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oov_id_is_one() {
        assert_eq!(OOV_ID, TermId(1));
        assert_eq!(OOV_ID.get(), 1);
        assert_eq!(OOV_ID.as_usize(), 1);
    }

    #[test]
    fn oov_term_sorts_before_printable_terms() {
        assert!(OOV_TERM < "a");
        assert!(OOV_TERM < " ");
        assert!(OOV_TERM < "0");
    }

    #[test]
    fn term_sep_breaks_concatenation_ambiguity() {
        // "ab"+"c" and "a"+"bc" must produce different joined keys.
        let left = format!("ab{TERM_SEP}c");
        let right = format!("a{TERM_SEP}bc");
        assert_ne!(left, right);
    }

    #[test]
    fn term_id_ordering() {
        assert!(TermId(1) < TermId(2));
        assert!(TermId(2) < TermId(u32::MAX));
    }

    #[test]
    fn error_messages_are_distinct() {
        let size = LmError::SizeMismatch {
            expected: 10,
            actual: 9,
        };
        let dict = LmError::DictMismatch {
            expected: 3,
            actual: 2,
        };
        assert_ne!(size.to_string(), dict.to_string());
        assert!(size.to_string().contains("size mismatch"));
    }
}
