//! Line/char mapping for extracted contract text.
//!
//! The comparison model reasons in line numbers; durable records store
//! absolute character offsets. `LineNumberedDocument` is the ephemeral
//! bridge between the two and is never persisted.

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub struct LineEntry {
    pub index: usize,
    /// Offset of the first character of the line.
    pub start_char: usize,
    /// Offset one past the last content character, excluding the terminator.
    pub end_char: usize,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LineNumberedDocument {
    lines: Vec<LineEntry>,
}

/// A clause span as emitted by the comparison model, in line coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineSpanClause {
    pub start_line: i64,
    pub end_line: i64,
    pub clause_type: String,
    pub confidence: f64,
    pub section_title: Option<String>,
}

/// The same clause translated to durable character offsets.
#[derive(Debug, Clone, PartialEq)]
pub struct CharSpanClause {
    pub start_char: usize,
    pub end_char: usize,
    pub clause_type: String,
    pub confidence: f64,
    pub section_title: Option<String>,
}

impl LineNumberedDocument {
    /// Split `text` into line entries with absolute offsets. O(n); pure.
    ///
    /// Line content excludes the terminator (`\n` or `\r\n`), so
    /// `text[start_char..end_char]` is exactly the stored content.
    pub fn prepare(text: &str) -> Self {
        let mut lines = Vec::new();
        let mut start = 0usize;

        for (index, raw) in text.split('\n').enumerate() {
            let content = raw.strip_suffix('\r').unwrap_or(raw);
            lines.push(LineEntry {
                index,
                start_char: start,
                end_char: start + content.len(),
                content: content.to_string(),
            });
            start += raw.len() + 1;
        }

        Self { lines }
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    pub fn last_line(&self) -> usize {
        self.lines.len().saturating_sub(1)
    }

    pub fn lines(&self) -> &[LineEntry] {
        &self.lines
    }

    /// Rendering with each line prefixed by its 0-based index, for a model
    /// that must reference spans by line number.
    pub fn numbered_text(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            if line.index > 0 {
                out.push('\n');
            }
            out.push_str(&format!("[{}] {}", line.index, line.content));
        }
        out
    }

    /// Line containing the character at `char_index`, or `None` when the
    /// index is past the end of the text.
    pub fn line_for_char_index(&self, char_index: usize) -> Option<usize> {
        let after = self
            .lines
            .partition_point(|line| line.start_char <= char_index);
        if after == 0 {
            return None;
        }

        let candidate = after - 1;
        if candidate == self.last_line() && char_index > self.lines[candidate].end_char {
            return None;
        }
        Some(candidate)
    }

    pub fn char_range_for_line(&self, line: usize) -> Option<(usize, usize)> {
        self.lines
            .get(line)
            .map(|entry| (entry.start_char, entry.end_char))
    }

    /// Content of the inclusive line range joined with `\n`, or `None` when
    /// the range is out of bounds or inverted.
    pub fn content_for_line_range(&self, start_line: usize, end_line: usize) -> Option<String> {
        if start_line > end_line || end_line >= self.lines.len() {
            return None;
        }

        let parts: Vec<&str> = self.lines[start_line..=end_line]
            .iter()
            .map(|line| line.content.as_str())
            .collect();
        Some(parts.join("\n"))
    }
}

/// Translate model-emitted line spans into character spans.
///
/// `start_line` is clamped to 0 and `end_line` to the last line. A clause
/// that is still inverted after clamping is malformed model output: it is
/// dropped with a warning, never coerced into a wrong span.
pub fn convert_lines_to_indices(
    clauses: Vec<LineSpanClause>,
    doc: &LineNumberedDocument,
) -> Vec<CharSpanClause> {
    let mut converted = Vec::with_capacity(clauses.len());

    for clause in clauses {
        let start_line = clause.start_line.max(0) as usize;
        let end_line = (clause.end_line.max(0) as usize).min(doc.last_line());

        if start_line > end_line {
            warn!(
                clause_type = %clause.clause_type,
                start_line = clause.start_line,
                end_line = clause.end_line,
                "dropping clause with inverted line span after clamping"
            );
            continue;
        }

        let (start_char, _) = match doc.char_range_for_line(start_line) {
            Some(range) => range,
            None => {
                warn!(
                    clause_type = %clause.clause_type,
                    start_line,
                    "dropping clause outside the document"
                );
                continue;
            }
        };
        let (_, end_char) = match doc.char_range_for_line(end_line) {
            Some(range) => range,
            None => {
                warn!(
                    clause_type = %clause.clause_type,
                    end_line,
                    "dropping clause outside the document"
                );
                continue;
            }
        };

        converted.push(CharSpanClause {
            start_char,
            end_char,
            clause_type: clause.clause_type,
            confidence: clause.confidence,
            section_title: clause.section_title,
        });
    }

    converted
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEXT: &str = "Payment shall be made within 30 days.\nTermination requires notice.\nGoverning law: England.";

    fn span(start_line: i64, end_line: i64) -> LineSpanClause {
        LineSpanClause {
            start_line,
            end_line,
            clause_type: "payment".into(),
            confidence: 0.9,
            section_title: None,
        }
    }

    #[test]
    fn stored_content_matches_text_slice() {
        let doc = LineNumberedDocument::prepare(TEXT);
        assert_eq!(doc.line_count(), 3);

        for line in doc.lines() {
            assert_eq!(&TEXT[line.start_char..line.end_char], line.content);
        }
    }

    #[test]
    fn full_range_round_trips_original_text() {
        let doc = LineNumberedDocument::prepare(TEXT);
        let content = doc.content_for_line_range(0, doc.last_line()).unwrap();
        assert_eq!(content, TEXT);
    }

    #[test]
    fn crlf_terminators_are_excluded_from_content() {
        let text = "alpha\r\nbeta\r\ngamma";
        let doc = LineNumberedDocument::prepare(text);

        assert_eq!(doc.lines()[0].content, "alpha");
        assert_eq!(doc.lines()[1].content, "beta");
        assert_eq!(&text[doc.lines()[1].start_char..doc.lines()[1].end_char], "beta");
    }

    #[test]
    fn empty_text_yields_single_empty_line() {
        let doc = LineNumberedDocument::prepare("");
        assert_eq!(doc.line_count(), 1);
        assert_eq!(doc.content_for_line_range(0, 0).unwrap(), "");
    }

    #[test]
    fn numbered_text_prefixes_each_line_with_its_index() {
        let doc = LineNumberedDocument::prepare("one\ntwo");
        assert_eq!(doc.numbered_text(), "[0] one\n[1] two");
    }

    #[test]
    fn line_for_char_index_lookups() {
        let doc = LineNumberedDocument::prepare(TEXT);

        assert_eq!(doc.line_for_char_index(0), Some(0));
        let (start, _) = doc.char_range_for_line(1).unwrap();
        assert_eq!(doc.line_for_char_index(start), Some(1));
        // The terminator between lines belongs to the line it ends.
        assert_eq!(doc.line_for_char_index(start - 1), Some(0));
        assert_eq!(doc.line_for_char_index(TEXT.len() + 10), None);
    }

    #[test]
    fn char_range_for_line_is_none_out_of_range() {
        let doc = LineNumberedDocument::prepare(TEXT);
        assert!(doc.char_range_for_line(99).is_none());
        assert!(doc.content_for_line_range(2, 1).is_none());
        assert!(doc.content_for_line_range(0, 99).is_none());
    }

    #[test]
    fn convert_clamps_out_of_range_spans() {
        let doc = LineNumberedDocument::prepare(TEXT);

        let converted = convert_lines_to_indices(vec![span(-5, 99)], &doc);
        assert_eq!(converted.len(), 1);
        assert_eq!(converted[0].start_char, 0);
        assert_eq!(converted[0].end_char, TEXT.len());
    }

    #[test]
    fn convert_drops_inverted_spans_without_panicking() {
        let doc = LineNumberedDocument::prepare(TEXT);

        // end_line clamps to the last line (2); start_line 5 clamps to 5 > 2.
        let converted = convert_lines_to_indices(vec![span(5, 99), span(0, 0)], &doc);
        assert_eq!(converted.len(), 1);
        assert_eq!(converted[0].start_char, 0);
        assert_eq!(
            &TEXT[converted[0].start_char..converted[0].end_char],
            "Payment shall be made within 30 days."
        );
    }

    #[test]
    fn convert_preserves_clause_metadata() {
        let doc = LineNumberedDocument::prepare(TEXT);
        let clause = LineSpanClause {
            start_line: 1,
            end_line: 1,
            clause_type: "termination".into(),
            confidence: 0.72,
            section_title: Some("9. Termination".into()),
        };

        let converted = convert_lines_to_indices(vec![clause], &doc);
        assert_eq!(converted[0].clause_type, "termination");
        assert_eq!(converted[0].confidence, 0.72);
        assert_eq!(converted[0].section_title.as_deref(), Some("9. Termination"));
    }
}
