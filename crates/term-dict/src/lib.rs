//! Immutable trie dictionary mapping term strings to dense [`TermId`] values.
//!
//! Nodes live in a contiguous arena (`Vec<Node>`) and children of each node
//! occupy a contiguous, label-sorted slice of that arena, addressed by a
//! `[begin, end)` index pair. Lookup walks the key bytes, binary-searching
//! each child range. There are no pointers and no per-node allocations, so
//! the whole structure serializes as a flat run of fixed-size records.
//!
//! The dictionary is built exactly once from sorted `(key, id)` records and
//! is read-only afterwards. A node value of 0 means "no entry ends here" —
//! ID 0 is never assigned to a term.

use std::collections::VecDeque;
use std::io::{Read, Write};

use lm_core::{LmError, Result, TermId};

/// Serialized size of one node record: u8 label + u32 value + u32 begin + u32 end.
const NODE_SIZE: u64 = 13;

/// Serialized size of the blob header: u32 node count + u32 entry count.
const HEADER_SIZE: u64 = 8;

/// One trie node. The root carries label 0 and is always at index 0.
#[derive(Clone, Copy, Debug)]
struct Node {
    /// Byte of the key consumed by the edge into this node.
    label: u8,
    /// TermId of the entry ending here, or 0 for none.
    value: u32,
    /// Children occupy arena indices [begin, end), sorted by label.
    begin: u32,
    end: u32,
}

/// Immutable exact-match dictionary from term bytes to [`TermId`].
#[derive(Debug)]
pub struct TermDict {
    nodes: Vec<Node>,
    entry_count: u32,
}

impl TermDict {
    /// Build a dictionary from records sorted strictly ascending by key.
    ///
    /// Keys must be unique and every ID must be nonzero. Construction is
    /// breadth-first so that each node's children land contiguously in the
    /// arena, which is what makes the `[begin, end)` addressing possible.
    pub fn from_records(records: &[(String, TermId)]) -> Result<Self> {
        for pair in records.windows(2) {
            if pair[0].0 >= pair[1].0 {
                return Err(LmError::DictFormat(format!(
                    "records not strictly sorted: <{}> then <{}>",
                    pair[0].0, pair[1].0
                )));
            }
        }
        if let Some((key, _)) = records.iter().find(|(_, id)| id.get() == 0) {
            return Err(LmError::DictFormat(format!(
                "record <{key}> carries reserved id 0"
            )));
        }

        let mut nodes = vec![Node {
            label: 0,
            value: 0,
            begin: 0,
            end: 0,
        }];

        // Each queue item is (arena index, record range, key depth); all
        // keys in the range share a prefix of `depth` bytes.
        let mut queue = VecDeque::new();
        if !records.is_empty() {
            queue.push_back((0usize, 0usize, records.len(), 0usize));
        }

        while let Some((idx, lo, hi, depth)) = queue.pop_front() {
            let mut i = lo;
            // A key that ends exactly at this depth terminates on this node.
            if records[i].0.len() == depth {
                nodes[idx].value = records[i].1.get();
                i += 1;
            }

            let begin = nodes.len();
            let mut child_ranges = Vec::new();
            while i < hi {
                let label = records[i].0.as_bytes()[depth];
                let start = i;
                while i < hi && records[i].0.as_bytes()[depth] == label {
                    i += 1;
                }
                nodes.push(Node {
                    label,
                    value: 0,
                    begin: 0,
                    end: 0,
                });
                child_ranges.push((start, i));
            }
            nodes[idx].begin = begin as u32;
            nodes[idx].end = nodes.len() as u32;
            for (k, (start, end)) in child_ranges.into_iter().enumerate() {
                queue.push_back((begin + k, start, end, depth + 1));
            }
        }

        Ok(TermDict {
            nodes,
            entry_count: records.len() as u32,
        })
    }

    /// Exact-match lookup. Returns `None` for absent keys.
    pub fn find(&self, key: &str) -> Option<TermId> {
        let mut node = &self.nodes[0];
        for &byte in key.as_bytes() {
            let children = &self.nodes[node.begin as usize..node.end as usize];
            let idx = children.binary_search_by_key(&byte, |n| n.label).ok()?;
            node = &children[idx];
        }
        if node.value != 0 {
            Some(TermId(node.value))
        } else {
            None
        }
    }

    /// Number of entries (not nodes) in the dictionary.
    #[inline]
    pub fn len(&self) -> usize {
        self.entry_count as usize
    }

    /// Whether the dictionary holds no entries.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    /// Serialize the dictionary. Returns the number of bytes written.
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<u64> {
        writer.write_all(&(self.nodes.len() as u32).to_le_bytes())?;
        writer.write_all(&self.entry_count.to_le_bytes())?;
        for node in &self.nodes {
            writer.write_all(&[node.label])?;
            writer.write_all(&node.value.to_le_bytes())?;
            writer.write_all(&node.begin.to_le_bytes())?;
            writer.write_all(&node.end.to_le_bytes())?;
        }
        Ok(HEADER_SIZE + self.nodes.len() as u64 * NODE_SIZE)
    }

    /// Deserialize a dictionary, returning it with the number of bytes
    /// consumed from the stream.
    ///
    /// Child ranges are bounds-checked here so that a corrupt blob cannot
    /// send `find` out of the arena; their label ordering is established at
    /// build time and trusted.
    pub fn read<R: Read>(reader: &mut R) -> Result<(Self, u64)> {
        let mut word = [0u8; 4];
        reader.read_exact(&mut word)?;
        let node_count = u32::from_le_bytes(word);
        reader.read_exact(&mut word)?;
        let entry_count = u32::from_le_bytes(word);

        if node_count == 0 {
            return Err(LmError::DictFormat("zero node count".into()));
        }

        let mut nodes = Vec::new();
        nodes
            .try_reserve_exact(node_count as usize)
            .map_err(|_| LmError::Allocation {
                what: "dictionary node",
                count: node_count as u64,
            })?;
        let mut record = [0u8; NODE_SIZE as usize];
        let word = |rec: &[u8; NODE_SIZE as usize], at: usize| {
            u32::from_le_bytes([rec[at], rec[at + 1], rec[at + 2], rec[at + 3]])
        };
        for _ in 0..node_count {
            reader.read_exact(&mut record)?;
            nodes.push(Node {
                label: record[0],
                value: word(&record, 1),
                begin: word(&record, 5),
                end: word(&record, 9),
            });
        }

        for node in &nodes {
            if node.begin > node.end || node.end as usize > nodes.len() {
                return Err(LmError::DictFormat(format!(
                    "child range [{}, {}) exceeds arena of {} nodes",
                    node.begin,
                    node.end,
                    nodes.len()
                )));
            }
        }

        let consumed = HEADER_SIZE + node_count as u64 * NODE_SIZE;
        Ok((
            TermDict {
                nodes,
                entry_count,
            },
            consumed,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lm_core::{OOV_ID, OOV_TERM};

    fn records(pairs: &[(&str, u32)]) -> Vec<(String, TermId)> {
        pairs
            .iter()
            .map(|&(key, id)| (key.to_string(), TermId(id)))
            .collect()
    }

    fn sample_dict() -> TermDict {
        TermDict::from_records(&records(&[
            (OOV_TERM, 1),
            ("app", 2),
            ("apple", 3),
            ("banana", 4),
            ("band", 5),
        ]))
        .unwrap()
    }

    // --- construction ---

    #[test]
    fn find_existing_keys() {
        let dict = sample_dict();
        assert_eq!(dict.find("app"), Some(TermId(2)));
        assert_eq!(dict.find("apple"), Some(TermId(3)));
        assert_eq!(dict.find("banana"), Some(TermId(4)));
        assert_eq!(dict.find("band"), Some(TermId(5)));
    }

    #[test]
    fn find_missing_keys() {
        let dict = sample_dict();
        assert_eq!(dict.find("ap"), None); // proper prefix of an entry
        assert_eq!(dict.find("apples"), None); // entry is a proper prefix
        assert_eq!(dict.find("zebra"), None);
        assert_eq!(dict.find(""), None);
    }

    #[test]
    fn oov_sentinel_resolves_to_oov_id() {
        let dict = sample_dict();
        assert_eq!(dict.find(OOV_TERM), Some(OOV_ID));
    }

    #[test]
    fn len_counts_entries_not_nodes() {
        let dict = sample_dict();
        assert_eq!(dict.len(), 5);
        assert!(!dict.is_empty());
    }

    #[test]
    fn empty_dict() {
        let dict = TermDict::from_records(&[]).unwrap();
        assert!(dict.is_empty());
        assert_eq!(dict.find("anything"), None);
    }

    #[test]
    fn unsorted_records_rejected() {
        let err = TermDict::from_records(&records(&[("b", 1), ("a", 2)])).unwrap_err();
        assert!(matches!(err, LmError::DictFormat(_)));
    }

    #[test]
    fn duplicate_records_rejected() {
        let err = TermDict::from_records(&records(&[("a", 1), ("a", 2)])).unwrap_err();
        assert!(matches!(err, LmError::DictFormat(_)));
    }

    #[test]
    fn zero_id_rejected() {
        let err = TermDict::from_records(&records(&[("a", 0)])).unwrap_err();
        assert!(matches!(err, LmError::DictFormat(_)));
    }

    #[test]
    fn non_ascii_keys_work() {
        let dict = TermDict::from_records(&records(&[("\x01", 1), ("héllo", 2), ("日本", 3)]))
            .unwrap();
        assert_eq!(dict.find("héllo"), Some(TermId(2)));
        assert_eq!(dict.find("日本"), Some(TermId(3)));
        assert_eq!(dict.find("日"), None);
    }

    // --- serialization ---

    #[test]
    fn write_read_roundtrip() {
        let dict = sample_dict();
        let mut blob = Vec::new();
        let written = dict.write(&mut blob).unwrap();
        assert_eq!(written, blob.len() as u64);

        let (back, consumed) = TermDict::read(&mut blob.as_slice()).unwrap();
        assert_eq!(consumed, written);
        assert_eq!(back.len(), dict.len());
        assert_eq!(back.find("apple"), Some(TermId(3)));
        assert_eq!(back.find("zebra"), None);
        assert_eq!(back.find(OOV_TERM), Some(OOV_ID));
    }

    #[test]
    fn read_consumes_exactly_its_bytes() {
        let dict = sample_dict();
        let mut blob = Vec::new();
        dict.write(&mut blob).unwrap();
        blob.extend_from_slice(b"trailing payload");

        let mut cursor = blob.as_slice();
        let (_, consumed) = TermDict::read(&mut cursor).unwrap();
        assert_eq!(cursor, b"trailing payload");
        assert_eq!(consumed as usize, blob.len() - b"trailing payload".len());
    }

    #[test]
    fn corrupt_child_range_rejected() {
        let dict = sample_dict();
        let mut blob = Vec::new();
        dict.write(&mut blob).unwrap();
        // Overwrite the root's end offset (bytes 9..13 of the first node,
        // which starts right after the 8-byte header) with a huge value.
        let end_offset = 8 + 9;
        blob[end_offset..end_offset + 4].copy_from_slice(&u32::MAX.to_le_bytes());

        let err = TermDict::read(&mut blob.as_slice()).unwrap_err();
        assert!(matches!(err, LmError::DictFormat(_)));
    }

    #[test]
    fn truncated_blob_fails_cleanly() {
        let dict = sample_dict();
        let mut blob = Vec::new();
        dict.write(&mut blob).unwrap();
        blob.truncate(blob.len() / 2);
        assert!(TermDict::read(&mut blob.as_slice()).is_err());
    }
}
