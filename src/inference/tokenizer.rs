//! CLIP byte-level BPE tokenizer, reading the `vocab.json` and
//! `merges.txt` files that ship with the text encoder.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;

pub const CONTEXT_LENGTH: usize = 77;
const START_TOKEN: i64 = 49406;
const END_TOKEN: i64 = 49407;
const END_OF_WORD: &str = "</w>";

pub struct ClipTokenizer {
    encoder: HashMap<String, i64>,
    ranks: HashMap<(String, String), usize>,
    byte_encoder: [char; 256],
    cache: HashMap<String, Vec<i64>>,
}

impl ClipTokenizer {
    pub fn load(vocab_path: &Path, merges_path: &Path) -> Result<Self> {
        let vocab = std::fs::read_to_string(vocab_path)
            .with_context(|| format!("Failed to read {}", vocab_path.display()))?;
        let encoder: HashMap<String, i64> = serde_json::from_str(&vocab)
            .with_context(|| format!("Invalid vocabulary {}", vocab_path.display()))?;
        let merges = std::fs::read_to_string(merges_path)
            .with_context(|| format!("Failed to read {}", merges_path.display()))?;

        Ok(Self::from_parts(encoder, &merges))
    }

    pub fn from_parts(encoder: HashMap<String, i64>, merges: &str) -> Self {
        let ranks = merges
            .lines()
            .filter(|line| !line.starts_with("#version"))
            .filter_map(|line| line.split_once(' '))
            .enumerate()
            .map(|(rank, (a, b))| ((a.to_string(), b.to_string()), rank))
            .collect();

        Self {
            encoder,
            ranks,
            byte_encoder: bytes_to_unicode(),
            cache: HashMap::new(),
        }
    }

    /// Token ids framed by start/end tokens and zero-padded to the context
    /// length, plus the matching attention mask
    pub fn encode(&mut self, text: &str) -> (Vec<i64>, Vec<i64>) {
        let mut ids = vec![START_TOKEN];
        for word in pre_tokenize(&text.to_lowercase()) {
            let encoded: String = word.bytes().map(|b| self.byte_encoder[b as usize]).collect();
            ids.extend(self.bpe(&encoded));
            if ids.len() >= CONTEXT_LENGTH - 1 {
                break;
            }
        }
        ids.truncate(CONTEXT_LENGTH - 1);
        ids.push(END_TOKEN);

        let mut mask = vec![1i64; ids.len()];
        ids.resize(CONTEXT_LENGTH, 0);
        mask.resize(CONTEXT_LENGTH, 0);
        (ids, mask)
    }

    fn bpe(&mut self, word: &str) -> Vec<i64> {
        if let Some(ids) = self.cache.get(word) {
            return ids.clone();
        }

        let mut symbols: Vec<String> = word.chars().map(|c| c.to_string()).collect();
        if let Some(last) = symbols.last_mut() {
            last.push_str(END_OF_WORD);
        }

        loop {
            let best = symbols
                .windows(2)
                .filter_map(|pair| {
                    self.ranks
                        .get(&(pair[0].clone(), pair[1].clone()))
                        .map(|rank| (*rank, pair[0].clone(), pair[1].clone()))
                })
                .min();
            let Some((_, first, second)) = best else {
                break;
            };

            let mut merged = Vec::with_capacity(symbols.len());
            let mut i = 0;
            while i < symbols.len() {
                if i + 1 < symbols.len() && symbols[i] == first && symbols[i + 1] == second {
                    merged.push(format!("{}{}", first, second));
                    i += 2;
                } else {
                    merged.push(symbols[i].clone());
                    i += 1;
                }
            }
            symbols = merged;
        }

        let ids: Vec<i64> = symbols
            .iter()
            .filter_map(|s| self.encoder.get(s).copied())
            .collect();
        self.cache.insert(word.to_string(), ids.clone());
        ids
    }
}

/// Split into letter runs, single digits, contraction suffixes and
/// punctuation runs
fn pre_tokenize(text: &str) -> Vec<String> {
    const CONTRACTIONS: [&str; 7] = ["'s", "'t", "'re", "'ve", "'m", "'ll", "'d"];

    let chars: Vec<char> = text.chars().collect();
    let mut words = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_alphabetic() {
            let start = i;
            while i < chars.len() && chars[i].is_alphabetic() {
                i += 1;
            }
            words.push(chars[start..i].iter().collect());
        } else if c.is_numeric() {
            words.push(c.to_string());
            i += 1;
        } else {
            let rest: String = chars[i..chars.len().min(i + 3)].iter().collect();
            if let Some(suffix) = CONTRACTIONS.iter().find(|s| rest.starts_with(**s)) {
                words.push(suffix.to_string());
                i += suffix.chars().count();
                continue;
            }
            let start = i;
            while i < chars.len()
                && !chars[i].is_whitespace()
                && !chars[i].is_alphanumeric()
            {
                i += 1;
            }
            words.push(chars[start..i].iter().collect());
        }
    }

    words
}

/// GPT-2 style reversible byte to printable-character table
fn bytes_to_unicode() -> [char; 256] {
    let printable = |b: u32| (33..=126).contains(&b) || (161..=172).contains(&b) || (174..=255).contains(&b);

    let mut table = ['\0'; 256];
    let mut extra = 0u32;
    for b in 0..256u32 {
        let code = if printable(b) {
            b
        } else {
            extra += 1;
            255 + extra
        };
        table[b as usize] = char::from_u32(code).unwrap_or('?');
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenizer() -> ClipTokenizer {
        let encoder: HashMap<String, i64> = [
            ("h", 1),
            ("e", 2),
            ("l</w>", 3),
            ("he", 4),
            ("hel</w>", 5),
            ("a</w>", 6),
            ("dog</w>", 7),
            ("d", 8),
            ("o", 9),
            ("g</w>", 10),
            ("do", 11),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), *v))
        .collect();
        let merges = "#version: 0.2\nh e\nhe l</w>\nd o\ndo g</w>\n";
        ClipTokenizer::from_parts(encoder, merges)
    }

    #[test]
    fn test_encode_applies_merges_in_rank_order() {
        let mut tokenizer = tokenizer();
        let (ids, mask) = tokenizer.encode("Hel a DOG");

        assert_eq!(&ids[..5], &[START_TOKEN, 5, 6, 7, END_TOKEN]);
        assert_eq!(ids.len(), CONTEXT_LENGTH);
        assert!(ids[5..].iter().all(|&id| id == 0));
        assert_eq!(mask.iter().sum::<i64>(), 5);
    }

    #[test]
    fn test_encode_truncates_to_context() {
        let mut tokenizer = tokenizer();
        let long = vec!["a"; 200].join(" ");
        let (ids, mask) = tokenizer.encode(&long);
        assert_eq!(ids.len(), CONTEXT_LENGTH);
        assert_eq!(ids[CONTEXT_LENGTH - 1], END_TOKEN);
        assert!(mask.iter().all(|&m| m == 1));
    }

    #[test]
    fn test_pre_tokenize() {
        assert_eq!(
            pre_tokenize("it's 42 dogs!!"),
            vec!["it", "'s", "4", "2", "dogs", "!!"]
        );
    }

    #[test]
    fn test_byte_table_is_identity_for_ascii_letters() {
        let table = bytes_to_unicode();
        assert_eq!(table[b'a' as usize], 'a');
        assert_eq!(table[b' ' as usize], 'Ġ');
    }
}
