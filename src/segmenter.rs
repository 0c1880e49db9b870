//! # Text Segmenter
//!
//! Splits incrementally arriving text into speakable units at sentence and
//! clause punctuation, so synthesis can start before the whole utterance is known.
//!
//! ## Rules:
//! - Terminators are `. ! ? , 。 ！ ？ 、 ，` and newline
//! - A `.` between two ASCII digits (`3.5`) is not a terminator
//! - Consecutive terminators (`?!`, `...`) stay together with the preceding text
//! - Pieces with no content besides punctuation and whitespace are never emitted
//!   on their own; they are attached to the previous segment or carried forward
//! - Without a forced flush, text after the last terminator is withheld
//!
//! ## Key Rust Concepts Used:
//! - **Newtype pattern**: [`Segment`] guarantees non-empty, speakable content
//! - **Borrowed slices**: boundaries are found on `&str` spans before any allocation

use std::fmt;

const TERMINATORS: &[char] = &['.', '!', '?', ',', '。', '！', '？', '、', '，', '\n'];

/// One speakable unit of text, including its trailing punctuation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment(String);

impl Segment {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Length in characters (not bytes).
    pub fn char_len(&self) -> usize {
        self.0.chars().count()
    }

}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Output of [`append_and_extract`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    /// Complete segments, in input order
    pub segments: Vec<Segment>,

    /// Text still waiting for a terminator (always empty after a forced flush)
    pub remainder: String,
}

/// Append `chunk` to `buffer` and cut out every complete segment.
///
/// ## Parameters:
/// - `buffer`: text withheld by the previous call
/// - `chunk`: newly received text
/// - `force_flush`: end of utterance; emit the trailing piece even without punctuation
pub fn append_and_extract(buffer: &str, chunk: &str, force_flush: bool) -> Extraction {
    let mut text = String::with_capacity(buffer.len() + chunk.len());
    text.push_str(buffer);
    text.push_str(chunk);

    let (pieces, tail) = split_terminated(&text);

    let mut segments: Vec<Segment> = Vec::new();
    let mut carry = String::new();
    for piece in pieces {
        carry.push_str(piece);
        if has_content(&carry) {
            segments.push(Segment(carry.trim().to_string()));
            carry.clear();
        } else if let Some(last) = segments.last_mut() {
            last.0.push_str(carry.trim_end());
            carry.clear();
        }
    }

    carry.push_str(tail);

    if force_flush {
        let rest = carry.trim();
        if has_content(rest) {
            segments.push(Segment(rest.to_string()));
        }
        return Extraction {
            segments,
            remainder: String::new(),
        };
    }

    // trailing whitespace may separate words of the next chunk
    Extraction {
        segments,
        remainder: carry.trim_start().to_string(),
    }
}

/// Accumulated, not-yet-emitted text owned by one session.
#[derive(Debug, Clone, Default)]
pub struct TextBuffer {
    pending: String,
}

impl TextBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return the segments it completes.
    pub fn push(&mut self, chunk: &str) -> Vec<Segment> {
        let extraction = append_and_extract(&self.pending, chunk, false);
        self.pending = extraction.remainder;
        extraction.segments
    }

    /// Emit everything buffered, terminated or not, and clear the buffer.
    pub fn flush(&mut self) -> Vec<Segment> {
        let extraction = append_and_extract(&self.pending, "", true);
        self.pending.clear();
        extraction.segments
    }

    pub fn pending(&self) -> &str {
        &self.pending
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Split `text` after every terminator run.
///
/// Returns the terminated pieces and the unterminated tail.
fn split_terminated(text: &str) -> (Vec<&str>, &str) {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < chars.len() {
        if !is_terminator_at(&chars, i) {
            i += 1;
            continue;
        }

        let mut j = i + 1;
        while j < chars.len() && is_terminator_at(&chars, j) {
            j += 1;
        }
        let end = chars.get(j).map_or(text.len(), |&(pos, _)| pos);
        pieces.push(&text[start..end]);
        start = end;
        i = j;
    }

    (pieces, &text[start..])
}

fn is_terminator_at(chars: &[(usize, char)], i: usize) -> bool {
    let c = chars[i].1;
    if !TERMINATORS.contains(&c) {
        return false;
    }
    if c == '.' && i > 0 && chars[i - 1].1.is_ascii_digit() {
        // "3." at the end of the buffer may still become "3.5"
        return match chars.get(i + 1) {
            None => false,
            Some(&(_, next)) => !next.is_ascii_digit(),
        };
    }
    true
}

/// True when `text` contains anything besides terminators and whitespace.
fn has_content(text: &str) -> bool {
    text.chars()
        .any(|c| !c.is_whitespace() && !TERMINATORS.contains(&c))
}
