//! Overlapping word-window text chunker.
//!
//! Splits submission text into [`Chunk`]s of `chunk_size_words` words,
//! advancing by `chunk_size_words - overlap_words` so consecutive chunks
//! share the configured overlap window. Each chunk records character
//! offsets into the source text so scored chunks can later be projected
//! back onto the document for highlighting.

use uuid::Uuid;

use crate::models::Chunk;

/// A word located in the source text.
struct LocatedWord {
    byte_start: usize,
    byte_end: usize,
    char_start: usize,
    char_end: usize,
}

/// Split text into overlapping word-window chunks.
///
/// Returns chunks with contiguous indices starting at 0, strictly
/// increasing `start_char`, and spans whose union covers every word of the
/// text. Whitespace-only text yields no chunks, as does a zero chunk size.
/// An overlap at or above the chunk size is clamped to a stride of one
/// word so the window always advances.
pub fn chunk_text(
    submission_id: &str,
    text: &str,
    chunk_size_words: usize,
    overlap_words: usize,
) -> Vec<Chunk> {
    if chunk_size_words == 0 {
        return Vec::new();
    }

    let words = locate_words(text);
    if words.is_empty() {
        return Vec::new();
    }

    let stride = chunk_size_words.saturating_sub(overlap_words).max(1);
    let mut chunks = Vec::new();
    let mut i = 0usize;
    let mut index = 0usize;

    while i < words.len() {
        let last = (i + chunk_size_words).min(words.len()) - 1;
        let first = &words[i];
        let span_text = text[first.byte_start..words[last].byte_end].to_string();

        chunks.push(Chunk {
            id: Uuid::new_v4().to_string(),
            submission_id: submission_id.to_string(),
            index,
            start_char: first.char_start,
            end_char: words[last].char_end,
            text: span_text,
            ai_score: None,
            plag_score: None,
        });

        index += 1;
        i += stride;
    }

    chunks
}

/// Scan the text once, recording byte and char offsets for every
/// whitespace-delimited word.
fn locate_words(text: &str) -> Vec<LocatedWord> {
    let mut words = Vec::new();
    let mut current: Option<LocatedWord> = None;
    let mut char_pos = 0usize;

    for (byte_pos, ch) in text.char_indices() {
        if ch.is_whitespace() {
            if let Some(w) = current.take() {
                words.push(w);
            }
        } else {
            match current.as_mut() {
                Some(w) => {
                    w.byte_end = byte_pos + ch.len_utf8();
                    w.char_end = char_pos + 1;
                }
                None => {
                    current = Some(LocatedWord {
                        byte_start: byte_pos,
                        byte_end: byte_pos + ch.len_utf8(),
                        char_start: char_pos,
                        char_end: char_pos + 1,
                    });
                }
            }
        }
        char_pos += 1;
    }
    if let Some(w) = current.take() {
        words.push(w);
    }

    words
}
