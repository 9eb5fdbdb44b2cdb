//! Binary index construction, serialization, and the query engine.
//!
//! [`build`] compiles a textual model file into a single immutable index
//! file: a serialized term dictionary followed by three flat record arrays
//! (unigram, bigram, trigram). Children of each record occupy a half-open
//! `[begin, end)` range of the next array, sorted ascending by child ID, so
//! lookups are a chain of range-restricted binary searches.
//!
//! [`LanguageModel::load`] reads the index back and answers probability
//! queries with Kneser-Ney style backoff. The loaded model is immutable,
//! holds no interior mutability, and is safe to share across threads.
//!
//! Wire format, all fields little-endian:
//!
//! ```text
//! u64 total_file_size           patched after everything else is written
//! u32 dictionary_entry_count
//! u32 dictionary_blob_size      patched once the blob length is known
//! <blob>                        serialized term dictionary
//! u32 unigram_count  Unigram[]  f64 prob, f64 backoff, u32 begin, u32 end
//! u32 bigram_count   Bigram[]   u32 child, f64 prob, f64 backoff, u32 begin, u32 end
//! u32 trigram_count  Trigram[]  u32 child, f64 prob
//! ```

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use lm_core::{LmError, Result, TermId, FIELD_SEP, OOV_ID, OOV_TERM, TERM_SEP};
use log::{info, warn};
use term_dict::TermDict;

/// Byte offset of the patched `dictionary_blob_size` field.
const BLOB_SIZE_OFFSET: u64 = 12;

#[derive(Clone, Copy, Debug)]
struct Unigram {
    prob: f64,
    backoff: f64,
    /// Children occupy bigram array indices [begin, end).
    begin: u32,
    end: u32,
}

#[derive(Clone, Copy, Debug)]
struct Bigram {
    child: u32,
    prob: f64,
    backoff: f64,
    /// Children occupy trigram array indices [begin, end).
    begin: u32,
    end: u32,
}

#[derive(Clone, Copy, Debug)]
struct Trigram {
    child: u32,
    prob: f64,
}

/// Split a model line into key, probability, and backoff fields.
/// Returns `None` for lines both build passes must skip.
fn parse_model_line(line: &str) -> Option<(&str, f64, f64)> {
    let line = line.trim_end_matches('\r');
    let mut fields = line.split(FIELD_SEP);
    let key = fields.next()?;
    let prob = fields.next()?.parse().ok()?;
    let backoff = fields.next()?.parse().ok()?;
    if fields.next().is_some() || key.is_empty() {
        return None;
    }
    Some((key, prob, backoff))
}

/// Split a gram key into its 1 to 3 terms, rejecting empty terms and
/// higher orders.
fn gram_terms(key: &str) -> Option<Vec<&str>> {
    let terms: Vec<&str> = key.split(TERM_SEP).collect();
    if terms.len() > 3 || terms.iter().any(|t| t.is_empty()) {
        return None;
    }
    Some(terms)
}

fn open_model(path: &Path) -> Result<BufReader<File>> {
    Ok(BufReader::new(
        File::open(path).map_err(|e| LmError::open(path, e))?,
    ))
}

/// Compile a model file into a binary index file.
///
/// Pass 1 assigns dense IDs to unigram lines in file order and counts the
/// higher orders; pass 2 lays the records into the three arrays, closing
/// each parent's child range when the next parent starts. The model file
/// must list each parent's children in ascending child-ID order; a
/// violation fails the build rather than silently corrupting later binary
/// searches.
pub fn build(model_in: &Path, index_out: &Path) -> Result<()> {
    // Pass 1: the ID table and array sizes.
    let mut ids: HashMap<String, u32> = HashMap::new();
    let mut counts = [0u64; 3];
    for line in open_model(model_in)?.lines() {
        let line = line?;
        let Some((key, _, _)) = parse_model_line(&line).filter(|(k, _, _)| gram_terms(k).is_some())
        else {
            warn!("skipping malformed model line <{line}>");
            continue;
        };
        let order = key.split(TERM_SEP).count();
        counts[order - 1] += 1;
        if order == 1 {
            ids.insert(key.to_string(), counts[0] as u32);
        }
    }

    if counts[0] == 0 {
        return Err(LmError::EmptyModel);
    }
    for (&what, &count) in ["unigram", "bigram", "trigram"].iter().zip(&counts) {
        if count > u32::MAX as u64 {
            return Err(LmError::Overflow { what, count });
        }
    }
    info!(
        "indexing {} unigrams, {} bigrams, {} trigrams",
        counts[0], counts[1], counts[2]
    );

    // Pass 2: lay out the arrays in file order.
    let mut unigrams: Vec<Unigram> = Vec::with_capacity(counts[0] as usize);
    let mut bigrams: Vec<Bigram> = Vec::with_capacity(counts[1] as usize);
    let mut trigrams: Vec<Trigram> = Vec::with_capacity(counts[2] as usize);

    // Terms of the currently open parent records, and the last child ID
    // seen inside each open run (for the ascending-order check).
    let mut open_unigram: Option<String> = None;
    let mut open_bigram: Option<String> = None;
    let mut last_bigram_child: Option<u32> = None;
    let mut last_trigram_child: Option<u32> = None;

    for (number, line) in open_model(model_in)?.lines().enumerate() {
        let line = line?;
        let Some((key, prob, backoff)) = parse_model_line(&line) else {
            continue;
        };
        let Some(terms) = gram_terms(key) else {
            continue;
        };
        let line_no = number + 1;

        let child_id = |term: &str| -> Result<u32> {
            ids.get(term).copied().ok_or_else(|| LmError::MissingDependency {
                kind: "unigram",
                key: term.to_string(),
                context: key.to_string(),
            })
        };

        match terms.as_slice() {
            [term] => {
                if open_bigram.take().is_some() {
                    if let Some(bi) = bigrams.last_mut() {
                        bi.end = trigrams.len() as u32;
                    }
                }
                if let Some(uni) = unigrams.last_mut() {
                    uni.end = bigrams.len() as u32;
                }
                unigrams.push(Unigram {
                    prob,
                    backoff,
                    begin: bigrams.len() as u32,
                    end: 0,
                });
                open_unigram = Some((*term).to_string());
                last_bigram_child = None;
            }
            [first, second] => {
                if open_unigram.as_deref() != Some(*first) {
                    return Err(LmError::UnsortedChildren {
                        parent: (*first).to_string(),
                        line: line_no,
                    });
                }
                let child = child_id(second)?;
                if last_bigram_child.is_some_and(|prev| child <= prev) {
                    return Err(LmError::UnsortedChildren {
                        parent: (*first).to_string(),
                        line: line_no,
                    });
                }
                if open_bigram.take().is_some() {
                    if let Some(bi) = bigrams.last_mut() {
                        bi.end = trigrams.len() as u32;
                    }
                }
                bigrams.push(Bigram {
                    child,
                    prob,
                    backoff,
                    begin: trigrams.len() as u32,
                    end: 0,
                });
                open_bigram = Some((*second).to_string());
                last_bigram_child = Some(child);
                last_trigram_child = None;
            }
            [first, second, third] => {
                if open_unigram.as_deref() != Some(*first)
                    || open_bigram.as_deref() != Some(*second)
                {
                    return Err(LmError::UnsortedChildren {
                        parent: format!("{first}{TERM_SEP}{second}"),
                        line: line_no,
                    });
                }
                let child = child_id(third)?;
                if last_trigram_child.is_some_and(|prev| child <= prev) {
                    return Err(LmError::UnsortedChildren {
                        parent: format!("{first}{TERM_SEP}{second}"),
                        line: line_no,
                    });
                }
                trigrams.push(Trigram { child, prob });
                last_trigram_child = Some(child);
            }
            _ => unreachable!("gram_terms yields 1 to 3 terms"),
        }
    }

    // Trailing ranges.
    if open_bigram.is_some() {
        if let Some(bi) = bigrams.last_mut() {
            bi.end = trigrams.len() as u32;
        }
    }
    if let Some(uni) = unigrams.last_mut() {
        uni.end = bigrams.len() as u32;
    }

    let mut records: Vec<(String, TermId)> =
        ids.into_iter().map(|(key, id)| (key, TermId(id))).collect();
    records.sort_by(|a, b| a.0.cmp(&b.0));
    let dict = TermDict::from_records(&records)?;

    write_index(index_out, &dict, &unigrams, &bigrams, &trigrams)
}

fn write_index(
    path: &Path,
    dict: &TermDict,
    unigrams: &[Unigram],
    bigrams: &[Bigram],
    trigrams: &[Trigram],
) -> Result<()> {
    let file = File::create(path).map_err(|e| LmError::open(path, e))?;
    let mut writer = BufWriter::new(file);

    // Placeholders for the two fields patched at the end.
    writer.write_all(&0u64.to_le_bytes())?;
    writer.write_all(&(dict.len() as u32).to_le_bytes())?;
    writer.write_all(&0u32.to_le_bytes())?;

    let blob_size = dict.write(&mut writer)?;
    if blob_size > u32::MAX as u64 {
        return Err(LmError::Overflow {
            what: "dictionary blob byte",
            count: blob_size,
        });
    }

    writer.write_all(&(unigrams.len() as u32).to_le_bytes())?;
    for rec in unigrams {
        writer.write_all(&rec.prob.to_le_bytes())?;
        writer.write_all(&rec.backoff.to_le_bytes())?;
        writer.write_all(&rec.begin.to_le_bytes())?;
        writer.write_all(&rec.end.to_le_bytes())?;
    }
    writer.write_all(&(bigrams.len() as u32).to_le_bytes())?;
    for rec in bigrams {
        writer.write_all(&rec.child.to_le_bytes())?;
        writer.write_all(&rec.prob.to_le_bytes())?;
        writer.write_all(&rec.backoff.to_le_bytes())?;
        writer.write_all(&rec.begin.to_le_bytes())?;
        writer.write_all(&rec.end.to_le_bytes())?;
    }
    writer.write_all(&(trigrams.len() as u32).to_le_bytes())?;
    for rec in trigrams {
        writer.write_all(&rec.child.to_le_bytes())?;
        writer.write_all(&rec.prob.to_le_bytes())?;
    }
    writer.flush()?;

    let mut file = writer.into_inner().map_err(|e| LmError::Io(e.into_error()))?;
    let total = file.stream_position()?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&total.to_le_bytes())?;
    file.seek(SeekFrom::Start(BLOB_SIZE_OFFSET))?;
    file.write_all(&(blob_size as u32).to_le_bytes())?;

    info!("wrote {total} byte index to {}", path.display());
    Ok(())
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_f64<R: Read>(reader: &mut R) -> Result<f64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

fn reserve<T>(what: &'static str, count: u32) -> Result<Vec<T>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(count as usize)
        .map_err(|_| LmError::Allocation {
            what,
            count: count as u64,
        })?;
    Ok(buf)
}

/// A loaded, immutable trigram language model.
///
/// All query methods take `&self` and touch no shared mutable state, so a
/// single instance can serve unsynchronized concurrent readers.
#[derive(Debug)]
pub struct LanguageModel {
    dict: TermDict,
    unigrams: Vec<Unigram>,
    bigrams: Vec<Bigram>,
    trigrams: Vec<Trigram>,
}

impl LanguageModel {
    /// Load an index file built by [`build`].
    ///
    /// The recorded total size is checked against the file on disk before
    /// anything else is read, so truncation or concatenation fails fast
    /// with [`LmError::SizeMismatch`] instead of a misparse.
    pub fn load(path: &Path) -> Result<LanguageModel> {
        let file = File::open(path).map_err(|e| LmError::open(path, e))?;
        let actual = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let expected = read_u64(&mut reader)?;
        if expected != actual {
            return Err(LmError::SizeMismatch { expected, actual });
        }

        let entry_count = read_u32(&mut reader)?;
        let blob_size = read_u32(&mut reader)?;
        let (dict, consumed) = TermDict::read(&mut reader)?;
        if consumed != blob_size as u64 {
            return Err(LmError::DictFormat(format!(
                "blob length {consumed} disagrees with recorded size {blob_size}"
            )));
        }
        if dict.len() as u32 != entry_count {
            return Err(LmError::DictMismatch {
                expected: entry_count,
                actual: dict.len() as u32,
            });
        }

        let count = read_u32(&mut reader)?;
        let mut unigrams = reserve::<Unigram>("unigram", count)?;
        for _ in 0..count {
            unigrams.push(Unigram {
                prob: read_f64(&mut reader)?,
                backoff: read_f64(&mut reader)?,
                begin: read_u32(&mut reader)?,
                end: read_u32(&mut reader)?,
            });
        }

        let count = read_u32(&mut reader)?;
        let mut bigrams = reserve::<Bigram>("bigram", count)?;
        for _ in 0..count {
            bigrams.push(Bigram {
                child: read_u32(&mut reader)?,
                prob: read_f64(&mut reader)?,
                backoff: read_f64(&mut reader)?,
                begin: read_u32(&mut reader)?,
                end: read_u32(&mut reader)?,
            });
        }

        let count = read_u32(&mut reader)?;
        let mut trigrams = reserve::<Trigram>("trigram", count)?;
        for _ in 0..count {
            trigrams.push(Trigram {
                child: read_u32(&mut reader)?,
                prob: read_f64(&mut reader)?,
            });
        }

        let found = dict.find(OOV_TERM);
        if found != Some(OOV_ID) {
            return Err(LmError::OovIdMismatch {
                found,
                expected: OOV_ID,
            });
        }

        info!(
            "loaded index: {} terms, {} bigrams, {} trigrams",
            unigrams.len(),
            bigrams.len(),
            trigrams.len()
        );
        Ok(LanguageModel {
            dict,
            unigrams,
            bigrams,
            trigrams,
        })
    }

    /// Resolve a term to its ID. Unknown terms map to [`OOV_ID`].
    pub fn term_id(&self, term: &str) -> TermId {
        self.dict.find(term).unwrap_or(OOV_ID)
    }

    /// Number of terms in the loaded vocabulary.
    pub fn vocab_len(&self) -> usize {
        self.unigrams.len()
    }

    fn unigram(&self, t: TermId) -> &Unigram {
        // IDs are 1-based and must come from term_id; no re-validation.
        &self.unigrams[t.as_usize() - 1]
    }

    fn find_bigram(&self, u: TermId, v: TermId) -> Option<&Bigram> {
        let uni = self.unigram(u);
        let range = &self.bigrams[uni.begin as usize..uni.end as usize];
        let idx = range.binary_search_by_key(&v.get(), |b| b.child).ok()?;
        Some(&range[idx])
    }

    fn find_trigram(&self, bi: &Bigram, w: TermId) -> Option<&Trigram> {
        let range = &self.trigrams[bi.begin as usize..bi.end as usize];
        let idx = range.binary_search_by_key(&w.get(), |t| t.child).ok()?;
        Some(&range[idx])
    }

    pub fn unigram_prob(&self, t: TermId) -> f64 {
        self.unigram(t).prob
    }

    pub fn unigram_backoff(&self, t: TermId) -> f64 {
        self.unigram(t).backoff
    }

    pub fn ln_unigram_prob(&self, t: TermId) -> f64 {
        self.unigram(t).prob.ln()
    }

    /// P(v | u). An unobserved pair backs off one step to
    /// `P(v) * backoff(u)`.
    pub fn bigram_prob(&self, u: TermId, v: TermId) -> f64 {
        match self.find_bigram(u, v) {
            Some(bi) => bi.prob,
            None => self.unigram_prob(v) * self.unigram(u).backoff,
        }
    }

    pub fn ln_bigram_prob(&self, u: TermId, v: TermId) -> f64 {
        match self.find_bigram(u, v) {
            Some(bi) => bi.prob.ln(),
            None => self.ln_unigram_prob(v) + self.unigram(u).backoff.ln(),
        }
    }

    /// P(w | u, v). An unobserved trigram under an observed (u,v) backs
    /// off one step to `P(w|v) * backoff(u,v)`; when (u,v) itself is
    /// unobserved the estimate collapses to the independence product
    /// `P(u)*P(v)*P(w)`. The different backoff depth of the two paths is
    /// intentional.
    pub fn trigram_prob(&self, u: TermId, v: TermId, w: TermId) -> f64 {
        match self.find_bigram(u, v) {
            Some(bi) => match self.find_trigram(bi, w) {
                Some(tri) => tri.prob,
                None => self.bigram_prob(v, w) * bi.backoff,
            },
            None => self.unigram_prob(u) * self.unigram_prob(v) * self.unigram_prob(w),
        }
    }

    pub fn ln_trigram_prob(&self, u: TermId, v: TermId, w: TermId) -> f64 {
        match self.find_bigram(u, v) {
            Some(bi) => match self.find_trigram(bi, w) {
                Some(tri) => tri.prob.ln(),
                None => self.ln_bigram_prob(v, w) + bi.backoff.ln(),
            },
            None => {
                self.ln_unigram_prob(u) + self.ln_unigram_prob(v) + self.ln_unigram_prob(w)
            }
        }
    }

    // String-keyed forms, resolving through term_id.

    pub fn unigram_prob_str(&self, t: &str) -> f64 {
        self.unigram_prob(self.term_id(t))
    }

    pub fn bigram_prob_str(&self, u: &str, v: &str) -> f64 {
        self.bigram_prob(self.term_id(u), self.term_id(v))
    }

    pub fn trigram_prob_str(&self, u: &str, v: &str, w: &str) -> f64 {
        self.trigram_prob(self.term_id(u), self.term_id(v), self.term_id(w))
    }
}
