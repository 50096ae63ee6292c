//! Pipeline data: the input document and the regions carved out of it.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// One program document as delivered by the text-extraction collaborator.
///
/// Read once at pipeline entry and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    id: String,
    text: String,
}

impl Document {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }

    /// Source identifier (usually the file name) stamped onto every record.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Length in characters.
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }

    /// Length in bytes.
    pub fn byte_len(&self) -> usize {
        self.text.len()
    }

    /// First plausible program year in the text, if any.
    pub fn detect_year(&self) -> Option<u16> {
        detect_year(&self.text)
    }
}

static RE_YEAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(199\d|20\d{2})\b").unwrap());

/// First four-digit year between 1990 and 2099.
pub fn detect_year(text: &str) -> Option<u16> {
    RE_YEAR
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// One detected session region of the cleaned text.
///
/// Offsets are byte offsets into [`crate::pipeline::boundary::Segmentation::text`].
/// `start` is the beginning of the title line, `marker` the session label,
/// and `end` the start of the next region (or end of text).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub marker: usize,
    pub end: usize,
    pub session_id: String,
    pub title: String,
}

impl Span {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// A session marker whose title could not be resolved; excluded from spans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedMarker {
    pub offset: usize,
    pub session_id: String,
    /// The line that was rejected first, for the log.
    pub rejected_line: Option<String>,
}

/// Where a unit's text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitOrigin {
    /// One or more whole spans.
    Spans,
    /// Part `part` of `parts` of a span that exceeded the budget.
    SplitSpan { part: usize, parts: usize },
    /// No spans: sliced at a marker occurrence or a fixed offset.
    Fallback,
}

/// A bounded piece of text sent to the extraction service in one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    /// 0-based position within the document.
    pub index: usize,
    pub text: String,
    /// Sessions covered, in document order.
    pub session_ids: Vec<String>,
    /// Already-resolved overview of the session this unit continues.
    pub overview: Option<String>,
    pub origin: UnitOrigin,
}

impl Unit {
    /// Length in characters.
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }

    /// The session id when the unit covers exactly one session.
    pub fn sole_session(&self) -> Option<&str> {
        match self.session_ids.as_slice() {
            [only] => Some(only.as_str()),
            _ => None,
        }
    }

    /// `true` for the second and later parts of a split session.
    pub fn is_continuation(&self) -> bool {
        matches!(self.origin, UnitOrigin::SplitSpan { part, .. } if part > 1)
    }
}
