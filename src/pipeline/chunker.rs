//! Chunking: pack session spans into units that fit the character budget.
//!
//! Spans are appended to a buffer in document order and the buffer is
//! emitted whenever the next span would overflow it. A span that is larger
//! than the budget on its own is split at sentence ends (then at line ends)
//! into parts that all carry the same session id, and every part after the
//! first carries the session's overview so the model does not re-derive it.
//!
//! When boundary detection found nothing, the text is sliced instead: at a
//! session marker near the budget if there is one, at the budget otherwise.

use crate::config::ExtractionConfig;
use crate::document::{Unit, UnitOrigin};
use crate::error::ExtractError;
use crate::pipeline::boundary::{is_timestamp_line, Segmentation};
use regex::Regex;
use tracing::{debug, info, warn};

/// Groups spans into [`Unit`]s.
#[derive(Debug, Clone)]
pub struct Chunker {
    max_chars: usize,
    fallback_window: usize,
    session_label: String,
    location: Regex,
    fields: Regex,
}

impl Chunker {
    pub fn new(config: &ExtractionConfig) -> Result<Self, ExtractError> {
        let m = &config.markers;
        let location = Regex::new(&format!(r"^\s*{}\b", regex::escape(&m.location_label)))
            .map_err(|e| ExtractError::InvalidConfig(format!("location label: {e}")))?;
        let mut labels: Vec<String> = m.field_labels.iter().map(|l| regex::escape(l)).collect();
        labels.push(regex::escape(&m.session_label));
        let fields = Regex::new(&format!(r"^\s*(?:{})(?:[^A-Za-z]|$)", labels.join("|")))
            .map_err(|e| ExtractError::InvalidConfig(format!("field labels: {e}")))?;

        Ok(Self {
            max_chars: config.max_chars,
            fallback_window: config.fallback_window,
            session_label: m.session_label.clone(),
            location,
            fields,
        })
    }

    /// Turn a segmentation into units. Never empty for non-blank text.
    pub fn chunk(&self, seg: &Segmentation) -> Vec<Unit> {
        let mut units = if seg.spans.is_empty() {
            info!("No session spans found; falling back to fixed-size slicing");
            self.fallback_slices(&seg.text)
        } else {
            self.pack_spans(seg)
        };
        if units.is_empty() && !seg.text.trim().is_empty() {
            units = self.fallback_slices(&seg.text);
        }
        for (i, unit) in units.iter_mut().enumerate() {
            unit.index = i;
        }
        debug!(
            "Chunked {} spans into {} units (budget {} chars)",
            seg.spans.len(),
            units.len(),
            self.max_chars
        );
        units
    }

    fn pack_spans(&self, seg: &Segmentation) -> Vec<Unit> {
        let mut units = Vec::new();
        let mut buf = String::new();
        let mut buf_ids: Vec<String> = Vec::new();
        let mut buf_len = 0usize;

        let flush = |units: &mut Vec<Unit>, buf: &mut String, ids: &mut Vec<String>, len: &mut usize| {
            if !buf.trim().is_empty() {
                units.push(Unit {
                    index: 0,
                    text: std::mem::take(buf),
                    session_ids: std::mem::take(ids),
                    overview: None,
                    origin: UnitOrigin::Spans,
                });
            }
            buf.clear();
            ids.clear();
            *len = 0;
        };

        for span in &seg.spans {
            let text = seg.span_text(span);
            let len = text.chars().count();
            if len > self.max_chars {
                flush(&mut units, &mut buf, &mut buf_ids, &mut buf_len);
                units.extend(self.split_span(&span.session_id, text));
                continue;
            }
            if buf_len > 0 && buf_len + len > self.max_chars {
                flush(&mut units, &mut buf, &mut buf_ids, &mut buf_len);
            }
            buf.push_str(text);
            buf_ids.push(span.session_id.clone());
            buf_len += len;
        }
        flush(&mut units, &mut buf, &mut buf_ids, &mut buf_len);
        units
    }

    /// Split one oversized span into sequential parts of the same session.
    fn split_span(&self, session_id: &str, text: &str) -> Vec<Unit> {
        let mut pieces: Vec<&str> = Vec::new();
        for sentence in split_sentences(text) {
            if sentence.chars().count() > self.max_chars {
                pieces.extend(sentence.split_inclusive('\n'));
            } else {
                pieces.push(sentence);
            }
        }

        let mut parts: Vec<String> = Vec::new();
        let mut cur = String::new();
        let mut cur_len = 0usize;
        for piece in pieces {
            let len = piece.chars().count();
            if cur_len > 0 && cur_len + len > self.max_chars {
                parts.push(std::mem::take(&mut cur));
                cur_len = 0;
            }
            if len > self.max_chars {
                warn!(
                    "Session {}: unsplittable piece of {} chars exceeds budget {}",
                    session_id, len, self.max_chars
                );
            }
            cur.push_str(piece);
            cur_len += len;
        }
        if !cur.is_empty() {
            parts.push(cur);
        }
        parts.retain(|p| !p.trim().is_empty());

        let overview = self.resolve_overview(text);
        let total = parts.len();
        debug!("Session {}: split into {} parts", session_id, total);
        parts
            .into_iter()
            .enumerate()
            .map(|(i, part)| Unit {
                index: 0,
                text: part,
                session_ids: vec![session_id.to_string()],
                overview: if i > 0 { overview.clone() } else { None },
                origin: UnitOrigin::SplitSpan {
                    part: i + 1,
                    parts: total,
                },
            })
            .collect()
    }

    /// The overview paragraph: lines after the location line, up to the
    /// first organisational field. A time line right after the location is
    /// skipped.
    pub fn resolve_overview(&self, span_text: &str) -> Option<String> {
        let lines: Vec<&str> = span_text.lines().collect();
        let loc = lines.iter().position(|l| self.location.is_match(l))?;
        let mut parts: Vec<&str> = Vec::new();
        for line in &lines[loc + 1..] {
            let t = line.trim();
            if t.is_empty() {
                continue;
            }
            if self.fields.is_match(t) {
                break;
            }
            if parts.is_empty() && is_timestamp_line(t) {
                continue;
            }
            parts.push(t);
        }
        let overview = parts.join(" ");
        (!overview.is_empty()).then_some(overview)
    }

    /// Fixed-size slicing, cutting at a session marker inside the last
    /// `fallback_window` characters of each slice when one exists.
    pub fn fallback_slices(&self, text: &str) -> Vec<Unit> {
        if text.trim().is_empty() {
            return Vec::new();
        }
        let markers: Vec<usize> = text
            .match_indices(self.session_label.as_str())
            .map(|(i, _)| cut_before_title(text, i))
            .collect();

        let mut units = Vec::new();
        let mut pos = 0usize;
        while pos < text.len() {
            let target = advance_chars(text, pos, self.max_chars);
            let cut = if target >= text.len() {
                text.len()
            } else {
                let window_start =
                    advance_chars(text, pos, self.max_chars.saturating_sub(self.fallback_window));
                match markers
                    .iter()
                    .copied()
                    .filter(|&m| m > pos && m >= window_start && m <= target)
                    .max()
                {
                    Some(m) => m,
                    None => {
                        debug!("No marker near offset {}; slicing at the budget", target);
                        target
                    }
                }
            };
            let slice = &text[pos..cut];
            if !slice.trim().is_empty() {
                units.push(Unit {
                    index: 0,
                    text: slice.to_string(),
                    session_ids: Vec::new(),
                    overview: None,
                    origin: UnitOrigin::Fallback,
                });
            }
            pos = cut;
        }
        units
    }
}

/// Split after `.`, `!` or `?` followed by whitespace. Concatenating the
/// pieces gives back the input.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0usize;
    let mut iter = text.char_indices().peekable();
    while let Some((i, c)) = iter.next() {
        if matches!(c, '.' | '!' | '?') {
            if let Some(&(_, next)) = iter.peek() {
                if next.is_whitespace() {
                    let end = i + c.len_utf8();
                    pieces.push(&text[start..end]);
                    start = end;
                }
            }
        }
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

/// Byte offset `n` characters after `from` (clamped to the end).
fn advance_chars(text: &str, from: usize, n: usize) -> usize {
    text[from..]
        .char_indices()
        .nth(n)
        .map(|(i, _)| from + i)
        .unwrap_or(text.len())
}

/// Start of the line above the marker's line, so a title stays with its code.
fn cut_before_title(text: &str, marker: usize) -> usize {
    let line_start = text[..marker].rfind('\n').map(|i| i + 1).unwrap_or(0);
    if line_start == 0 {
        return 0;
    }
    text[..line_start - 1]
        .rfind('\n')
        .map(|i| i + 1)
        .unwrap_or(0)
}
