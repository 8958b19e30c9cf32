//! Position index over the traced input
//!
//! Trace offsets count UTF-16 code units, which is how the tracing parser
//! indexes its input buffer. Characters (code units), code points and lines
//! are therefore three different counts.

use crate::error::{Result, TraceError};
use serde::Serialize;

const EMPTY_MATCH: &str = "\u{2205}";
const MATCH_OPEN: char = '\u{21fe}';
const MATCH_CLOSE: char = '\u{21fd}';
const FAILURE_MARK: &str = "\u{2612}";

/// 1-based line and column of an offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

/// Size of the input text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InputTextInfo {
    pub nr_lines: usize,
    /// UTF-16 code units
    pub nr_chars: usize,
    pub nr_code_points: usize,
}

/// Input split around a highlighted node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchFragments {
    pub before_match: String,
    pub matched: String,
    pub after_match: String,
}

/// Immutable input text with line tables
#[derive(Debug, Clone)]
pub struct InputText {
    text: String,
    /// Offset (code units) at which each line starts
    line_starts: Vec<usize>,
    /// Byte index at which each line starts
    line_bytes: Vec<usize>,
    length: usize,
    code_points: usize,
}

impl InputText {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let mut line_starts = vec![0];
        let mut line_bytes = vec![0];
        let mut offset = 0;
        let mut code_points = 0;

        for (byte, c) in text.char_indices() {
            offset += c.len_utf16();
            code_points += 1;
            if c == '\n' {
                line_starts.push(offset);
                line_bytes.push(byte + 1);
            }
        }

        // A trailing newline ends the last line, it does not open a new one
        if line_starts.len() > 1 && line_starts.last() == Some(&offset) {
            line_starts.pop();
            line_bytes.pop();
        }

        Self {
            text,
            line_starts,
            line_bytes,
            length: offset,
            code_points,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Length in code units
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn line_count(&self) -> usize {
        self.line_starts.len()
    }

    pub fn info(&self) -> InputTextInfo {
        InputTextInfo {
            nr_lines: self.line_count(),
            nr_chars: self.length,
            nr_code_points: self.code_points,
        }
    }

    /// Line and column of `offset`, for `offset <= len()`
    ///
    /// Callers clamp out-of-range offsets themselves; they are rejected here.
    pub fn position(&self, offset: usize) -> Result<Position> {
        self.check(offset, offset)?;
        let line = self.line_index(offset);
        Ok(Position {
            line: line + 1,
            column: offset - self.line_starts[line] + 1,
        })
    }

    /// 1-based line holding `offset`
    pub fn line_of(&self, offset: usize) -> Result<usize> {
        self.check(offset, offset)?;
        Ok(self.line_index(offset) + 1)
    }

    /// Offsets `[start, end)` covered by 1-based `line`
    pub fn line_span(&self, line: usize) -> Option<(usize, usize)> {
        let idx = line.checked_sub(1)?;
        let start = *self.line_starts.get(idx)?;
        let end = self.line_starts.get(idx + 1).copied().unwrap_or(self.length);
        Some((start, end))
    }

    /// Text between two offsets
    pub fn extract(&self, start: usize, end: usize) -> Result<&str> {
        self.check(start, end)?;
        Ok(&self.text[self.byte_index(start)..self.byte_index(end)])
    }

    /// Fragments highlighting a successful match over `[start, end)`
    ///
    /// Offsets past the end of the input are clamped.
    pub fn success_fragments(&self, start: usize, end: usize) -> MatchFragments {
        let end = end.min(self.length);
        let start = start.min(end);
        let matched = &self.text[self.byte_index(start)..self.byte_index(end)];
        MatchFragments {
            before_match: self.text[..self.byte_index(start)].to_string(),
            matched: if matched.is_empty() {
                EMPTY_MATCH.to_string()
            } else {
                format!("{}{}{}", MATCH_OPEN, escape_control(matched), MATCH_CLOSE)
            },
            after_match: self.text[self.byte_index(end)..].to_string(),
        }
    }

    /// Fragments marking a failed match at `end`
    pub fn failure_fragments(&self, end: usize) -> MatchFragments {
        let at = self.byte_index(end.min(self.length));
        MatchFragments {
            before_match: self.text[..at].to_string(),
            matched: FAILURE_MARK.to_string(),
            after_match: self.text[at..].to_string(),
        }
    }

    fn check(&self, start: usize, end: usize) -> Result<()> {
        if start > end || end > self.length {
            return Err(TraceError::RangeError {
                start,
                end,
                length: self.length,
            });
        }
        Ok(())
    }

    fn line_index(&self, offset: usize) -> usize {
        self.line_starts.partition_point(|&s| s <= offset) - 1
    }

    /// Byte index of a code unit offset; an offset inside a surrogate pair
    /// maps to the start of that code point
    fn byte_index(&self, offset: usize) -> usize {
        let line = self.line_index(offset);
        let mut units = self.line_starts[line];
        let base = self.line_bytes[line];
        for (i, c) in self.text[base..].char_indices() {
            let next = units + c.len_utf16();
            if next > offset {
                return base + i;
            }
            units = next;
        }
        self.text.len()
    }
}

/// Make control characters visible
pub fn escape_control(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn three_lines() -> InputText {
        // 3 lines, 42 code units, trailing newline
        InputText::new("first line is here\nsecond line\nthird line\n")
    }

    #[test]
    fn test_counts() {
        let input = three_lines();
        assert_eq!(input.len(), 42);
        assert_eq!(input.line_count(), 3);
        assert_eq!(
            input.info(),
            InputTextInfo {
                nr_lines: 3,
                nr_chars: 42,
                nr_code_points: 42
            }
        );
    }

    #[test]
    fn test_position_at_end_stays_on_last_line() {
        let input = three_lines();
        assert_eq!(input.position(42).unwrap(), Position { line: 3, column: 12 });
        assert_eq!(input.position(0).unwrap(), Position { line: 1, column: 1 });
        assert_eq!(input.position(19).unwrap(), Position { line: 2, column: 1 });
        assert_eq!(input.position(18).unwrap(), Position { line: 1, column: 19 });
        assert!(matches!(
            input.position(43),
            Err(TraceError::RangeError { length: 42, .. })
        ));
    }

    #[test]
    fn test_extract_bounds() {
        let input = three_lines();
        assert_eq!(input.extract(5, 5).unwrap(), "");
        assert_eq!(input.extract(0, 5).unwrap(), "first");
        assert_eq!(input.extract(19, 30).unwrap(), "second line");
        assert!(matches!(
            input.extract(10, 5),
            Err(TraceError::RangeError { start: 10, end: 5, .. })
        ));
        assert!(input.extract(0, 43).is_err());
        assert_eq!(input.extract(0, 42).unwrap(), input.as_str());
    }

    #[test]
    fn test_multibyte_offsets_are_code_units() {
        // 'é' is one unit, the emoji is a surrogate pair
        let input = InputText::new("é😀x\ny");
        assert_eq!(input.len(), 6);
        assert_eq!(input.info().nr_code_points, 5);
        assert_eq!(input.line_count(), 2);
        assert_eq!(input.extract(1, 3).unwrap(), "😀");
        assert_eq!(input.extract(3, 4).unwrap(), "x");
        // Half a surrogate pair rounds down to the code point start
        assert_eq!(input.extract(0, 2).unwrap(), "é");
        assert_eq!(input.position(5).unwrap(), Position { line: 2, column: 1 });
    }

    #[test]
    fn test_empty_input() {
        let input = InputText::new("");
        assert!(input.is_empty());
        assert_eq!(input.line_count(), 1);
        assert_eq!(input.position(0).unwrap(), Position { line: 1, column: 1 });
        assert_eq!(input.extract(0, 0).unwrap(), "");
    }

    #[test]
    fn test_line_span() {
        let input = three_lines();
        assert_eq!(input.line_span(1), Some((0, 19)));
        assert_eq!(input.line_span(3), Some((31, 42)));
        assert_eq!(input.line_span(0), None);
        assert_eq!(input.line_span(4), None);
        assert_eq!(input.line_of(30).unwrap(), 2);
    }

    #[test]
    fn test_success_fragments() {
        let input = InputText::new("a\tb c");
        let f = input.success_fragments(1, 3);
        assert_eq!(f.before_match, "a");
        assert_eq!(f.matched, "\u{21fe}\\tb\u{21fd}");
        assert_eq!(f.after_match, " c");

        let empty = input.success_fragments(2, 2);
        assert_eq!(empty.matched, "\u{2205}");

        // Clamped to the input
        let clamped = input.success_fragments(4, 99);
        assert_eq!(clamped.matched, "\u{21fe}c\u{21fd}");
        assert_eq!(clamped.after_match, "");
    }

    #[test]
    fn test_failure_fragments() {
        let input = InputText::new("abc");
        let f = input.failure_fragments(1);
        assert_eq!(f.before_match, "a");
        assert_eq!(f.matched, "\u{2612}");
        assert_eq!(f.after_match, "bc");
        assert_eq!(input.failure_fragments(10).after_match, "");
    }

    #[test]
    fn test_escape_control() {
        assert_eq!(escape_control("a\r\n\u{1}"), "a\\r\\n\\u0001");
    }

    fn input_strategy() -> impl Strategy<Value = String> {
        prop::collection::vec(
            prop_oneof![Just('a'), Just('\n'), Just('é'), Just('😀'), Just(' ')],
            0..64,
        )
        .prop_map(|chars| chars.into_iter().collect())
    }

    proptest! {
        #[test]
        fn prop_line_matches_newlines_before_offset(text in input_strategy(), pick in 0usize..1000) {
            let input = InputText::new(text.clone());
            let offset = pick % (input.len() + 1);
            let before = input.extract(0, offset).unwrap();
            let newlines = before.matches('\n').count();
            let pos = input.position(offset).unwrap();
            prop_assert_eq!(pos.line, (newlines + 1).min(input.line_count()));
            prop_assert!(pos.line <= input.line_count());
            prop_assert_eq!(input.extract(0, input.len()).unwrap(), text.as_str());
        }

        #[test]
        fn prop_extract_concatenates(text in input_strategy(), a in 0usize..1000, b in 0usize..1000) {
            let input = InputText::new(text.clone());
            let (mut lo, mut hi) = (a % (input.len() + 1), b % (input.len() + 1));
            if lo > hi {
                std::mem::swap(&mut lo, &mut hi);
            }
            let joined = format!(
                "{}{}{}",
                input.extract(0, lo).unwrap(),
                input.extract(lo, hi).unwrap(),
                input.extract(hi, input.len()).unwrap()
            );
            prop_assert_eq!(joined, text);
        }
    }
}
