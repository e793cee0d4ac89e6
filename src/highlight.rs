//! Chunk-to-page highlight alignment.
//!
//! Page-level word tokenization (from the caller's PDF extraction) and
//! chunk tokenization can diverge through hyphenation and whitespace, so
//! chunks are located by matching their first few tokens against a
//! sliding window of page words. Matched words are consumed so subsequent
//! chunks continue scanning from the remainder; a chunk whose prefix is
//! found nowhere is skipped. Best-effort by design.

use tracing::debug;

use crate::config::HighlightConfig;
use crate::models::{Chunk, HighlightColor, HighlightSpan, PageWord};

/// Chunk tokens compared against page words to locate a chunk's start.
const PREFIX_TOKENS: usize = 8;

pub struct HighlightAligner {
    ai_threshold: f64,
    plagiarism_threshold: f64,
}

impl HighlightAligner {
    pub fn new(config: &HighlightConfig) -> Self {
        Self {
            ai_threshold: config.ai_threshold,
            plagiarism_threshold: config.plagiarism_threshold,
        }
    }

    /// Pick a highlight color for a chunk, or `None` when it crosses
    /// neither threshold. Combined outranks plagiarism-only outranks
    /// AI-only.
    pub fn choose_color(&self, chunk: &Chunk) -> Option<HighlightColor> {
        let ai = chunk.ai_score.unwrap_or(0.0) >= self.ai_threshold;
        let plag = chunk.plag_score.unwrap_or(0.0) >= self.plagiarism_threshold;
        match (ai, plag) {
            (true, true) => Some(HighlightColor::Combined),
            (false, true) => Some(HighlightColor::Plagiarism),
            (true, false) => Some(HighlightColor::Ai),
            (false, false) => None,
        }
    }

    /// Select highlight spans for pre-scored chunks over per-page word
    /// sequences.
    ///
    /// Chunks are aligned in order; each match consumes the page words it
    /// covers so the scan always moves forward.
    pub fn align(&self, chunks: &[Chunk], pages: &[Vec<PageWord>]) -> Vec<HighlightSpan> {
        let mut spans = Vec::new();
        let mut current_page = 0usize;
        let mut cursors = vec![0usize; pages.len()];

        for chunk in chunks {
            let Some(color) = self.choose_color(chunk) else {
                continue;
            };

            let chunk_tokens: Vec<String> = chunk
                .text
                .split_whitespace()
                .map(normalize_token)
                .filter(|t| !t.is_empty())
                .collect();
            if chunk_tokens.is_empty() {
                continue;
            }
            let prefix = &chunk_tokens[..chunk_tokens.len().min(PREFIX_TOKENS)];

            let mut located = false;
            for page in current_page..pages.len() {
                let words = &pages[page];
                if let Some(pos) = find_prefix(words, cursors[page], prefix) {
                    let end = (pos + chunk_tokens.len()).min(words.len());
                    spans.push(HighlightSpan {
                        page,
                        start_word: pos,
                        end_word: end,
                        color,
                    });
                    cursors[page] = end;
                    current_page = page;
                    located = true;
                    break;
                }
            }
            if !located {
                debug!(chunk = chunk.index, "chunk prefix not found on any page, skipping");
            }
        }

        spans
    }
}

/// Find the first window at or after `from` whose normalized words match
/// the prefix tokens.
fn find_prefix(words: &[PageWord], from: usize, prefix: &[String]) -> Option<usize> {
    if prefix.is_empty() || from + prefix.len() > words.len() {
        return None;
    }
    (from..=words.len() - prefix.len()).find(|&pos| {
        prefix
            .iter()
            .zip(&words[pos..pos + prefix.len()])
            .all(|(token, word)| normalize_token(&word.text) == *token)
    })
}

/// Lowercase and strip surrounding punctuation so page extraction quirks
/// do not break matching.
fn normalize_token(token: &str) -> String {
    token
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(text: &str) -> PageWord {
        PageWord {
            text: text.to_string(),
            x0: 0.0,
            y0: 0.0,
            x1: 10.0,
            y1: 10.0,
        }
    }

    fn page(text: &str) -> Vec<PageWord> {
        text.split_whitespace().map(word).collect()
    }

    fn chunk(index: usize, text: &str, ai: Option<f64>, plag: Option<f64>) -> Chunk {
        Chunk {
            id: format!("c{}", index),
            submission_id: "sub1".to_string(),
            index,
            start_char: 0,
            end_char: text.chars().count(),
            text: text.to_string(),
            ai_score: ai,
            plag_score: plag,
        }
    }

    fn aligner() -> HighlightAligner {
        HighlightAligner::new(&HighlightConfig::default())
    }

    #[test]
    fn test_color_precedence() {
        let a = aligner();
        assert_eq!(
            a.choose_color(&chunk(0, "x", Some(0.9), Some(0.9))),
            Some(HighlightColor::Combined)
        );
        assert_eq!(
            a.choose_color(&chunk(0, "x", Some(0.1), Some(0.9))),
            Some(HighlightColor::Plagiarism)
        );
        assert_eq!(
            a.choose_color(&chunk(0, "x", Some(0.9), Some(0.1))),
            Some(HighlightColor::Ai)
        );
        assert_eq!(a.choose_color(&chunk(0, "x", Some(0.1), Some(0.1))), None);
        assert_eq!(a.choose_color(&chunk(0, "x", None, None)), None);
    }

    #[test]
    fn test_align_simple_span() {
        let pages = vec![page("the quick brown fox jumps over the lazy dog tonight")];
        let chunks = vec![chunk(0, "quick brown fox jumps", None, Some(0.8))];
        let spans = aligner().align(&chunks, &pages);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].page, 0);
        assert_eq!(spans[0].start_word, 1);
        assert_eq!(spans[0].end_word, 5);
        assert_eq!(spans[0].color, HighlightColor::Plagiarism);
    }

    #[test]
    fn test_align_ignores_case_and_punctuation() {
        let pages = vec![page("Well, the QUICK brown fox.")];
        let chunks = vec![chunk(0, "quick brown fox", None, Some(0.8))];
        let spans = aligner().align(&chunks, &pages);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].start_word, 2);
    }

    #[test]
    fn test_align_consumes_words() {
        // The same phrase appears twice; the second chunk must match the
        // second occurrence because the first was consumed.
        let pages = vec![page("alpha beta gamma alpha beta gamma")];
        let chunks = vec![
            chunk(0, "alpha beta gamma", None, Some(0.8)),
            chunk(1, "alpha beta gamma", Some(0.9), None),
        ];
        let spans = aligner().align(&chunks, &pages);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].start_word, 0);
        assert_eq!(spans[1].start_word, 3);
        assert_eq!(spans[1].color, HighlightColor::Ai);
    }

    #[test]
    fn test_align_span_bounded_by_page_end() {
        let pages = vec![page("start of a short page")];
        // Chunk longer than the remaining page words.
        let chunks = vec![chunk(0, "short page but the chunk keeps going on", None, Some(0.8))];
        let spans = aligner().align(&chunks, &pages);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].end_word, 5);
    }

    #[test]
    fn test_align_crosses_to_next_page() {
        let pages = vec![page("first page words here"), page("second page begins now")];
        let chunks = vec![
            chunk(0, "first page words", None, Some(0.8)),
            chunk(1, "second page begins", None, Some(0.8)),
        ];
        let spans = aligner().align(&chunks, &pages);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].page, 0);
        assert_eq!(spans[1].page, 1);
    }

    #[test]
    fn test_unmatched_chunk_skipped() {
        let pages = vec![page("completely different content on this page")];
        let chunks = vec![
            chunk(0, "nothing aligns with this text at all", None, Some(0.8)),
            chunk(1, "different content on", None, Some(0.8)),
        ];
        let spans = aligner().align(&chunks, &pages);
        // First chunk skipped, second still aligns.
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].start_word, 1);
    }

    #[test]
    fn test_below_threshold_chunks_produce_no_spans() {
        let pages = vec![page("some ordinary human written text")];
        let chunks = vec![chunk(0, "some ordinary human", Some(0.2), Some(0.1))];
        assert!(aligner().align(&chunks, &pages).is_empty());
    }

    #[test]
    fn test_prefix_uses_at_most_eight_tokens() {
        // Chunk diverges after its 8th token; alignment must still succeed
        // because only the prefix is compared.
        let pages = vec![page("one two three four five six seven eight DIFFERENT tail")];
        let chunks = vec![chunk(
            0,
            "one two three four five six seven eight nine ten",
            None,
            Some(0.8),
        )];
        let spans = aligner().align(&chunks, &pages);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].start_word, 0);
        assert_eq!(spans[0].end_word, 10);
    }
}
