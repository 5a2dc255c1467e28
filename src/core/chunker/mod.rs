//! Chunker Module
//!
//! Pure text preparation for indexing: normalization and splitting
//! into token-bounded, overlapping chunks. Paragraphs are packed into
//! chunks first; a paragraph that alone exceeds the budget is split
//! sentence-by-sentence under the same rule. Adjacent chunks share a
//! trailing slice of text so retrieval hits carry their surrounding
//! context.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

// =============================================================================
// Configuration
// =============================================================================

/// Chunking parameters
#[derive(Clone, Debug)]
pub struct ChunkConfig {
    /// Approximate token budget per chunk
    pub max_tokens: usize,
    /// Approximate tokens of trailing context carried into the next chunk
    pub overlap_tokens: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_tokens: 500,
            overlap_tokens: 50,
        }
    }
}

/// A single chunk of prepared text
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkPiece {
    /// Chunk text content
    pub content: String,
    /// Approximate token count
    pub token_count: usize,
}

// =============================================================================
// Normalization
// =============================================================================

static EXCESS_BLANK_LINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

/// Normalizes raw text for chunking: unifies line endings, strips
/// control characters (keeping newlines and tabs), trims trailing
/// whitespace per line, and collapses runs of 3+ blank lines.
pub fn normalize_text(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");

    let cleaned: String = unified
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();

    let trimmed = cleaned
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n");

    EXCESS_BLANK_LINES
        .replace_all(&trimmed, "\n\n")
        .trim()
        .to_string()
}

/// Approximates the token count of a text as characters / 4
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

// =============================================================================
// Chunking
// =============================================================================

static SENTENCE_BOUNDARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^.!?]+[.!?]*\s*").expect("valid regex"));

/// Splits normalized text into token-bounded overlapping chunks.
///
/// The input is normalized first, so callers may pass raw text.
/// Ordinals are implied by position in the returned list.
pub fn chunk_text(text: &str, config: &ChunkConfig) -> Vec<ChunkPiece> {
    let normalized = normalize_text(text);
    if normalized.is_empty() {
        return Vec::new();
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();

    for paragraph in normalized.split("\n\n") {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            continue;
        }

        if estimate_tokens(paragraph) > config.max_tokens {
            // Oversized paragraph: flush what we have, then pack its
            // sentences under the same budget.
            flush(&mut chunks, &mut current);
            for sentence in split_sentences(paragraph) {
                append_unit(&mut chunks, &mut current, &sentence, " ", config);
            }
            continue;
        }

        append_unit(&mut chunks, &mut current, paragraph, "\n\n", config);
    }

    if !current.trim().is_empty() {
        chunks.push(current);
    }

    chunks
        .into_iter()
        .map(|content| {
            let token_count = estimate_tokens(&content);
            ChunkPiece {
                content,
                token_count,
            }
        })
        .collect()
}

/// Adds one paragraph or sentence to the current chunk, flushing
/// first when it would not fit. The overlap seed carried into the new
/// chunk shrinks to whatever room the incoming unit leaves, so the
/// budget holds for every chunk except a single unsplittable unit.
fn append_unit(
    chunks: &mut Vec<String>,
    current: &mut String,
    unit: &str,
    separator: &str,
    config: &ChunkConfig,
) {
    let joined_len = if current.is_empty() {
        estimate_tokens(unit)
    } else {
        estimate_tokens(current) + estimate_tokens(separator) + estimate_tokens(unit)
    };

    if joined_len > config.max_tokens && !current.is_empty() {
        let completed = std::mem::take(current);
        let overlap_budget = config.overlap_tokens.min(
            config
                .max_tokens
                .saturating_sub(estimate_tokens(unit) + estimate_tokens(separator)),
        );
        if overlap_budget > 0 {
            *current = tail_slice(&completed, overlap_budget * 4);
        }
        chunks.push(completed);
    }

    if !current.is_empty() {
        current.push_str(separator);
    }
    current.push_str(unit);
}

/// Pushes the current chunk without seeding overlap; used at hard
/// boundaries where the next unit is not yet known.
fn flush(chunks: &mut Vec<String>, current: &mut String) {
    if current.trim().is_empty() {
        current.clear();
        return;
    }
    chunks.push(std::mem::take(current));
}

/// Returns the trailing `max_chars` characters of a text, starting at
/// a character boundary and trimmed of leading whitespace.
fn tail_slice(text: &str, max_chars: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    let start = chars.len().saturating_sub(max_chars);
    chars[start..].iter().collect::<String>().trim_start().to_string()
}

fn split_sentences(paragraph: &str) -> Vec<String> {
    SENTENCE_BOUNDARY
        .find_iter(paragraph)
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn no_overlap(max_tokens: usize) -> ChunkConfig {
        ChunkConfig {
            max_tokens,
            overlap_tokens: 0,
        }
    }

    #[test]
    fn test_normalize_line_endings() {
        let text = "line one\r\nline two\rline three";
        assert_eq!(normalize_text(text), "line one\nline two\nline three");
    }

    #[test]
    fn test_normalize_strips_control_chars() {
        let text = "hello\u{0000}world\tkeep\ttabs";
        assert_eq!(normalize_text(text), "helloworld\tkeep\ttabs");
    }

    #[test]
    fn test_normalize_trims_trailing_whitespace() {
        let text = "line one   \nline two\t\n";
        assert_eq!(normalize_text(text), "line one\nline two");
    }

    #[test]
    fn test_normalize_collapses_blank_lines() {
        let text = "para one\n\n\n\n\npara two";
        assert_eq!(normalize_text(text), "para one\n\npara two");
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_empty_text_produces_no_chunks() {
        assert!(chunk_text("", &ChunkConfig::default()).is_empty());
        assert!(chunk_text("  \n\n  ", &ChunkConfig::default()).is_empty());
    }

    #[test]
    fn test_short_text_single_chunk() {
        let chunks = chunk_text("A short paragraph.", &ChunkConfig::default());

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "A short paragraph.");
        assert_eq!(chunks[0].token_count, estimate_tokens("A short paragraph."));
    }

    #[test]
    fn test_paragraphs_packed_under_budget() {
        // Each paragraph is ~10 tokens; budget of 25 fits two per chunk.
        let paragraphs: Vec<String> = (0..6)
            .map(|i| format!("Paragraph number {} has some words in it.", i))
            .collect();
        let text = paragraphs.join("\n\n");

        let chunks = chunk_text(&text, &no_overlap(25));

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.token_count <= 25, "chunk over budget: {}", chunk.token_count);
        }
    }

    #[test]
    fn test_chunks_reconstruct_normalized_text_without_overlap() {
        let paragraphs: Vec<String> = (0..8)
            .map(|i| format!("Paragraph {} carries a modest amount of content.", i))
            .collect();
        let text = paragraphs.join("\n\n");

        let chunks = chunk_text(&text, &no_overlap(30));
        let rejoined = chunks
            .iter()
            .map(|c| c.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        assert_eq!(rejoined, normalize_text(&text));
    }

    #[test]
    fn test_oversized_paragraph_split_by_sentence() {
        // One paragraph, many sentences, far over a 10-token budget.
        let sentences: Vec<String> = (0..10)
            .map(|i| format!("Sentence {} says something useful.", i))
            .collect();
        let text = sentences.join(" ");

        let chunks = chunk_text(&text, &no_overlap(10));

        assert!(chunks.len() > 1);
        // Every sentence survives somewhere in the output.
        let combined: String = chunks.iter().map(|c| c.content.as_str()).collect();
        for i in 0..10 {
            assert!(combined.contains(&format!("Sentence {}", i)));
        }
    }

    #[test]
    fn test_unsplittable_sentence_kept_whole() {
        let long_sentence = format!("{} end.", "word ".repeat(100));
        let chunks = chunk_text(&long_sentence, &no_overlap(10));

        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].token_count > 10);
    }

    #[test]
    fn test_adjacent_chunks_share_overlap() {
        let paragraphs: Vec<String> = (0..6)
            .map(|i| format!("Paragraph {} carries a modest amount of content.", i))
            .collect();
        let text = paragraphs.join("\n\n");

        let config = ChunkConfig {
            max_tokens: 25,
            overlap_tokens: 5,
        };
        let chunks = chunk_text(&text, &config);

        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            let tail = tail_slice(&pair[0].content, config.overlap_tokens * 4);
            assert!(
                pair[1].content.starts_with(&tail),
                "chunk does not start with previous tail"
            );
        }
    }

    #[test]
    fn test_budget_holds_with_overlap() {
        // Paragraphs close to the budget leave little room for the
        // overlap seed; it must shrink rather than push chunks over.
        let paragraphs: Vec<String> = (0..6)
            .map(|i| format!("Paragraph {} talks at length. {}", i, "More words here. ".repeat(25)))
            .collect();
        let text = paragraphs.join("\n\n");

        let config = ChunkConfig {
            max_tokens: 125,
            overlap_tokens: 25,
        };
        let chunks = chunk_text(&text, &config);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(
                chunk.token_count <= config.max_tokens,
                "chunk over budget: {}",
                chunk.token_count
            );
        }
    }

    #[test]
    fn test_tail_slice_char_boundary() {
        let text = "héllo wörld";
        let tail = tail_slice(text, 5);
        assert_eq!(tail, "wörld");
    }
}
