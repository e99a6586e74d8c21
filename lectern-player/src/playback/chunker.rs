//! Text chunker
//!
//! Splits chapter text into bounded, sentence-aligned chunks, the unit of
//! streaming synthesis and index-based seeking.
//!
//! **Algorithm:**
//! 1. Split into sentence-like units: a run of non-terminators followed by
//!    its run of terminators (`.`, `!`, `?`, newline).
//! 2. Units longer than `hard_max` are cut at the last whitespace before the cap.
//! 3. Greedily accumulate units while the running chunk stays within
//!    `min(max(ceil(len / target_count), 50), hard_max)`.
//!
//! Lengths are counted in `char`s. The 50-character floor keeps short
//! chapters in a single chunk.

use serde::Serialize;

/// Minimum soft chunk length
const MIN_SOFT_LIMIT: usize = 50;

/// One playable text segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerConfig {
    /// Desired number of chunks for typical prose
    pub target_count: usize,
    /// No chunk is ever longer than this many characters
    pub hard_max: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            target_count: 20,
            hard_max: 600,
        }
    }
}

impl ChunkerConfig {
    fn limit_for(&self, text_len: usize) -> usize {
        let target = self.target_count.max(1);
        let hard_max = self.hard_max.max(1);
        let soft = text_len.div_ceil(target).max(MIN_SOFT_LIMIT);
        soft.min(hard_max)
    }
}

fn is_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '\n')
}

/// Split into sentence-like units, each keeping its trailing terminators.
/// Leading terminators are attached to the first unit so nothing is dropped.
fn sentence_units(text: &str) -> Vec<&str> {
    let mut units = Vec::new();
    let mut start = 0;
    let mut seen_body = false;
    let mut in_tail = false;

    for (pos, c) in text.char_indices() {
        if is_terminator(c) {
            if seen_body {
                in_tail = true;
            }
        } else if in_tail {
            units.push(&text[start..pos]);
            start = pos;
            in_tail = false;
        } else {
            seen_body = true;
        }
    }
    if start < text.len() {
        units.push(&text[start..]);
    }
    units
}

/// Cut a unit into pieces of at most `max_chars`, preferring whitespace
fn split_oversized(unit: &str, max_chars: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut rest = unit;

    while rest.chars().count() > max_chars {
        // Byte offset just past the first `max_chars` characters
        let cap = rest
            .char_indices()
            .nth(max_chars)
            .map(|(idx, _)| idx)
            .unwrap_or(rest.len());
        let window = &rest[..cap];
        let cut = match window.rfind(char::is_whitespace) {
            Some(ws) if ws > 0 => ws + window[ws..].chars().next().map_or(1, char::len_utf8),
            _ => cap,
        };
        pieces.push(&rest[..cut]);
        rest = &rest[cut..];
    }
    if !rest.is_empty() {
        pieces.push(rest);
    }
    pieces
}

/// Split chapter text into chunks
///
/// Pure and deterministic: the same text and config always give the same list.
pub fn split_into_chunks(text: &str, config: &ChunkerConfig) -> Vec<Chunk> {
    let hard_max = config.hard_max.max(1);
    let limit = config.limit_for(text.chars().count());

    let mut texts: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for unit in sentence_units(text) {
        for piece in split_oversized(unit, hard_max) {
            let piece_len = piece.chars().count();
            if current_len > 0 && current_len + piece_len > limit {
                texts.push(current.trim().to_string());
                current.clear();
                current_len = 0;
            }
            current.push_str(piece);
            current_len += piece_len;
        }
    }
    if !current.trim().is_empty() {
        texts.push(current.trim().to_string());
    }

    texts
        .into_iter()
        .filter(|t| !t.is_empty())
        .enumerate()
        .map(|(index, text)| Chunk { index, text })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn non_whitespace(s: &str) -> String {
        s.chars().filter(|c| !c.is_whitespace()).collect()
    }

    fn prose(sentences: usize) -> String {
        (0..sentences)
            .map(|i| format!("Sentence number {} talks about the old river town. ", i))
            .collect()
    }

    #[test]
    fn test_three_sentences_fit_one_chunk() {
        let text = "The rain stopped. Birds returned! Was it morning?";
        let chunks = split_into_chunks(text, &ChunkerConfig::default());

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].text, text);
    }

    #[test]
    fn test_empty_and_blank_text() {
        assert!(split_into_chunks("", &ChunkerConfig::default()).is_empty());
        assert!(split_into_chunks("   \n\n  ", &ChunkerConfig::default()).is_empty());
    }

    #[test]
    fn test_punctuation_only_text_kept() {
        let chunks = split_into_chunks("?!...", &ChunkerConfig::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "?!...");
    }

    #[test]
    fn test_units_keep_trailing_punctuation() {
        let units = sentence_units("..Hello there. How are you?!\n\nFine");
        assert_eq!(units, vec!["..Hello there.", " How are you?!\n\n", "Fine"]);
    }

    #[test]
    fn test_chunk_count_close_to_target() {
        let text = prose(200);
        let chunks = split_into_chunks(&text, &ChunkerConfig::default());

        assert!(
            (18..=24).contains(&chunks.len()),
            "expected about 20 chunks, got {}",
            chunks.len()
        );
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
        }
    }

    #[test]
    fn test_hard_max_respected_for_long_chapters() {
        let text = prose(2_000);
        let config = ChunkerConfig::default();
        let chunks = split_into_chunks(&text, &config);

        assert!(chunks.len() > 20);
        assert!(chunks.iter().all(|c| c.text.chars().count() <= config.hard_max));
    }

    #[test]
    fn test_oversized_sentence_is_split() {
        let word = "rất ";
        let text = word.repeat(400); // 1600 chars, no terminator
        let config = ChunkerConfig {
            target_count: 20,
            hard_max: 600,
        };
        let chunks = split_into_chunks(&text, &config);

        assert!(chunks.len() >= 3);
        assert!(chunks.iter().all(|c| c.text.chars().count() <= 600));
        let joined: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(non_whitespace(&joined), non_whitespace(&text));
    }

    #[test]
    fn test_no_whitespace_hard_cut() {
        let text = "x".repeat(1_250);
        let chunks = split_into_chunks(
            &text,
            &ChunkerConfig {
                target_count: 1,
                hard_max: 500,
            },
        );
        let lens: Vec<usize> = chunks.iter().map(|c| c.text.len()).collect();
        assert_eq!(lens, vec![500, 500, 250]);
    }

    #[test]
    fn test_content_preserved_for_varied_texts() {
        let samples = [
            prose(7),
            prose(333),
            "Dòng một.\nDòng hai!\n\nDòng ba? Và tiếp tục mãi mãi".repeat(40),
            "No terminators at all but quite a lot of words ".repeat(60),
            "!!!Leading punctuation. Then text".to_string(),
        ];
        for text in &samples {
            for target in [1, 5, 20, 100] {
                let config = ChunkerConfig {
                    target_count: target,
                    hard_max: 600,
                };
                let chunks = split_into_chunks(text, &config);
                let joined: String = chunks.iter().map(|c| c.text.as_str()).collect();
                assert_eq!(non_whitespace(&joined), non_whitespace(text));
                assert!(chunks.iter().all(|c| c.text.chars().count() <= 600));
                assert!(chunks.iter().all(|c| !c.text.trim().is_empty()));
            }
        }
    }

    #[test]
    fn test_deterministic() {
        let text = prose(150);
        let a = split_into_chunks(&text, &ChunkerConfig::default());
        let b = split_into_chunks(&text, &ChunkerConfig::default());
        assert_eq!(a, b);
    }

    #[test]
    fn test_degenerate_config_does_not_panic() {
        let chunks = split_into_chunks(
            "One. Two.",
            &ChunkerConfig {
                target_count: 0,
                hard_max: 0,
            },
        );
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| c.text.chars().count() <= 1));
    }
}
