//! Lexical sparse vectors for the `bm25` leg of hybrid queries.
//!
//! Tokens are hashed with murmur3 (x86, 32-bit, seed 0) so indices line up with
//! the ingestion side that populated the collections. Values are raw term
//! frequencies; the store applies IDF through its sparse-vector modifier.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use unicode_segmentation::UnicodeSegmentation;

/// Terms kept per vector.
const MAX_TERMS: usize = 256;
const MIN_TOKEN_LEN: usize = 2;

/// Parallel index / value arrays, indices strictly ascending.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SparseVector {
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
}

impl SparseVector {
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SparseEncoder;

impl SparseEncoder {
    pub fn new() -> Self {
        Self
    }

    /// Lowercased UAX#29 words of at least two characters. Dotted identifiers,
    /// `snake_case` names, decimals and non-ASCII letters stay whole.
    pub fn tokenize(text: &str) -> Vec<String> {
        let lowered = text.to_lowercase();
        lowered
            .unicode_words()
            .filter(|w| w.chars().count() >= MIN_TOKEN_LEN)
            .map(str::to_string)
            .collect()
    }

    pub fn encode(&self, text: &str) -> SparseVector {
        let tokens = Self::tokenize(text);
        if tokens.is_empty() {
            return SparseVector::default();
        }

        let mut counts: HashMap<u32, f32> = HashMap::new();
        for tok in &tokens {
            *counts.entry(murmur3_32(tok.as_bytes(), 0)).or_default() += 1.0;
        }

        let mut terms: Vec<(u32, f32)> = counts.into_iter().collect();
        if terms.len() > MAX_TERMS {
            // Highest frequency first, index as tiebreak, so truncation is deterministic.
            terms.sort_by(|a, b| {
                b.1.partial_cmp(&a.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.0.cmp(&b.0))
            });
            terms.truncate(MAX_TERMS);
        }
        terms.sort_by_key(|(idx, _)| *idx);

        let (indices, values) = terms.into_iter().unzip();
        SparseVector { indices, values }
    }
}

/// MurmurHash3 x86_32.
pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h = seed;
    let mut blocks = data.chunks_exact(4);
    for block in &mut blocks {
        let mut k = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
        h = h.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = blocks.remainder();
    if !tail.is_empty() {
        let mut k: u32 = 0;
        for (i, b) in tail.iter().enumerate() {
            k ^= (*b as u32) << (8 * i);
        }
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
    }

    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    // ─── murmur3 ───

    #[test]
    fn test_murmur3_reference_values() {
        assert_eq!(murmur3_32(b"", 0), 0);
        assert_eq!(murmur3_32(b"", 1), 0x514e_28b7);
        assert_eq!(murmur3_32(b"test", 0), 0xba6b_d213);
        assert_eq!(murmur3_32(b"Hello, world!", 0), 0xc036_3e43);
        assert_eq!(
            murmur3_32(b"The quick brown fox jumps over the lazy dog", 0),
            0x2e4f_f723
        );
    }

    // ─── Encoding ───

    #[test]
    fn test_tokenize_drops_short_tokens_and_lowercases() {
        let tokens = SparseEncoder::tokenize("A HashMap<K,V> in Java-21!");
        assert_eq!(tokens, vec!["hashmap", "in", "java", "21"]);
    }

    #[test]
    fn test_tokenize_keeps_identifiers_and_unicode_words_whole() {
        let tokens = SparseEncoder::tokenize("System.out.println café foo_bar 3.14 ÉCOLE");
        assert_eq!(tokens, vec!["system.out.println", "café", "foo_bar", "3.14", "école"]);
    }

    #[test]
    fn test_encode_hashes_dotted_identifier_as_one_term() {
        let v = SparseEncoder::new().encode("Use System.out.println");
        assert_eq!(v.len(), 2);
        assert!(v.indices.contains(&murmur3_32("system.out.println".as_bytes(), 0)));
        assert!(!v.indices.contains(&murmur3_32(b"println", 0)));
    }

    #[test]
    fn test_encode_counts_term_frequency() {
        let enc = SparseEncoder::new();
        let v = enc.encode("stream stream map");
        assert_eq!(v.len(), 2);
        let stream_idx = murmur3_32(b"stream", 0);
        let pos = v.indices.iter().position(|i| *i == stream_idx).unwrap();
        assert_eq!(v.values[pos], 2.0);
    }

    #[test]
    fn test_encode_is_sorted_and_deterministic() {
        let enc = SparseEncoder::new();
        let a = enc.encode("records sealed classes pattern matching switch");
        let b = enc.encode("records sealed classes pattern matching switch");
        assert_eq!(a, b);
        assert!(a.indices.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_encode_empty_text() {
        let enc = SparseEncoder::new();
        assert!(enc.encode("").is_empty());
        assert!(enc.encode("a b c !").is_empty());
    }

    #[test]
    fn test_encode_caps_term_count() {
        let enc = SparseEncoder::new();
        let text: String = (0..400).map(|i| format!("term{i} ")).collect();
        let v = enc.encode(&text);
        assert_eq!(v.len(), MAX_TERMS);
    }
}
