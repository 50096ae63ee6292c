//! Boundary detection: find session regions in raw program text.
//!
//! A program page repeats one shape per session:
//!
//! ```text
//! Controls for Hybrids and Electric Powertrains Part 1 of 3   ← title line
//! Session Code PFL750                                         ← marker
//! Room 140 A                                                  ← location
//! This session covers …                                       ← overview
//! Organizers - …
//! ```
//!
//! The detector anchors a [`Span`] on the first occurrence of each session
//! code, resolves its title from the lines above, and ends it where the next
//! region begins. Running page headers and footers are stripped first; left
//! in place they sit right above markers and get mistaken for titles.

use crate::config::{ExtractionConfig, SegmentationMarkers};
use crate::document::{Span, UnresolvedMarker};
use crate::error::ExtractError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Result of boundary detection over one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segmentation {
    /// Document text with page furniture removed. Span offsets point here.
    pub text: String,
    /// Resolved session regions, ordered and non-overlapping.
    pub spans: Vec<Span>,
    /// Markers excluded because no title passed validation.
    pub unresolved: Vec<UnresolvedMarker>,
    /// Number of header/footer lines removed.
    pub furniture_removed: usize,
}

impl Segmentation {
    /// Text of one span.
    pub fn span_text(&self, span: &Span) -> &str {
        &self.text[span.start..span.end]
    }
}

// ── Static patterns ──────────────────────────────────────────────────────

static RE_TIMESTAMP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*\d{1,2}:\d{2}(?::\d{2})?\s*(?:[ap]\.?\s?m\.?)?(?:\s|$|-)").unwrap()
});

static RE_PAGE_NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(?:page\s+)?\d{1,4}(?:\s*(?:of|/)\s*\d{1,4})?\s*$").unwrap()
});

static RE_PRINT_STAMP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*(?:printed(?:\s+on)?:?\s*)?\d{1,4}[/.\-]\d{1,2}[/.\-]\d{1,4},?\s+\d{1,2}:\d{2}",
    )
    .unwrap()
});

/// `true` for a line that starts with a clock time (`8:00 a.m.`, `14:30`).
pub fn is_timestamp_line(line: &str) -> bool {
    RE_TIMESTAMP.is_match(line)
}

/// Labels that are never titles, in addition to the configured markers.
const CONTROL_LABELS: &[&str] = &[
    "Time",
    "Room",
    "Paper No.",
    "Paper No",
    "Organizers",
    "Organizer",
    "Chairperson",
    "Chairpersons",
    "Session Code",
];

// ── Lines with offsets ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Line<'a> {
    start: usize,
    text: &'a str,
}

fn index_lines(text: &str) -> Vec<Line<'_>> {
    let mut lines = Vec::new();
    let mut start = 0;
    for piece in text.split_inclusive('\n') {
        lines.push(Line {
            start,
            text: piece.trim_end_matches(['\n', '\r']),
        });
        start += piece.len();
    }
    lines
}

fn line_at(lines: &[Line<'_>], offset: usize) -> usize {
    lines.partition_point(|l| l.start <= offset).saturating_sub(1)
}

fn label_pattern(label: &str) -> String {
    label
        .split_whitespace()
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(r"\s+")
}

// ── Detector ─────────────────────────────────────────────────────────────

/// Finds session spans according to an [`ExtractionConfig`].
#[derive(Debug, Clone)]
pub struct BoundaryDetector {
    marker: Regex,
    control: Regex,
    furniture: Vec<Regex>,
    max_title_len: usize,
    lookback: usize,
    min_repeats: usize,
}

impl BoundaryDetector {
    pub fn new(config: &ExtractionConfig) -> Result<Self, ExtractError> {
        let furniture = config
            .furniture_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    ExtractError::InvalidConfig(format!("furniture pattern {p:?}: {e}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            marker: marker_regex(&config.markers)?,
            control: control_regex(&config.markers)?,
            furniture,
            max_title_len: config.max_title_len,
            lookback: config.title_lookback,
            min_repeats: config.furniture_min_repeats,
        })
    }

    /// `true` if `line` can serve as a session title.
    pub fn is_plausible_title(&self, line: &str) -> bool {
        let t = line.trim();
        !t.is_empty()
            && t.chars().count() <= self.max_title_len
            && !self.control.is_match(t)
            && !RE_TIMESTAMP.is_match(t)
            && !self.marker.is_match(t)
    }

    /// Strip page furniture and split the text into session spans.
    pub fn detect(&self, text: &str) -> Segmentation {
        let (clean, furniture_removed) = self.strip_page_furniture(text);
        let lines = index_lines(&clean);

        // First occurrence of each session code only.
        let mut seen: HashSet<&str> = HashSet::new();
        let markers: Vec<(usize, usize, &str)> = self
            .marker
            .captures_iter(&clean)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                let id = caps.get(1)?.as_str();
                seen.insert(id).then_some((whole.start(), whole.end(), id))
            })
            .collect();

        // Each marker's region head: its title line when resolved, else the marker line.
        let mut heads: Vec<(usize, Option<String>)> = Vec::with_capacity(markers.len());
        let mut unresolved = Vec::new();
        let mut prev_end = 0usize;
        let mut prev_line: Option<usize> = None;
        for &(offset, end, id) in &markers {
            let (head, title, rejected) =
                self.resolve_title(&clean, &lines, offset, prev_end, prev_line);
            if title.is_none() {
                warn!(
                    "Session {}: no plausible title above offset {}; span excluded",
                    id, offset
                );
                unresolved.push(UnresolvedMarker {
                    offset,
                    session_id: id.to_string(),
                    rejected_line: rejected,
                });
            }
            heads.push((head, title));
            prev_end = end;
            prev_line = Some(line_at(&lines, offset));
        }

        let mut spans = Vec::with_capacity(markers.len());
        for (i, (&(offset, _, id), (head, title))) in markers.iter().zip(&heads).enumerate() {
            let Some(title) = title else { continue };
            let end = heads.get(i + 1).map(|(h, _)| *h).unwrap_or(clean.len());
            spans.push(Span {
                start: *head,
                marker: offset,
                end,
                session_id: id.to_string(),
                title: title.clone(),
            });
        }

        debug!(
            "Boundary detection: {} markers, {} spans, {} unresolved, {} furniture lines",
            markers.len(),
            spans.len(),
            unresolved.len(),
            furniture_removed
        );

        Segmentation {
            text: clean,
            spans,
            unresolved,
            furniture_removed,
        }
    }

    /// Find the title for the marker at `offset`.
    ///
    /// Returns `(region head, title, first rejected candidate)`. The scan
    /// never climbs above the previous marker's line.
    fn resolve_title(
        &self,
        text: &str,
        lines: &[Line<'_>],
        offset: usize,
        prev_end: usize,
        prev_line: Option<usize>,
    ) -> (usize, Option<String>, Option<String>) {
        let idx = line_at(lines, offset);
        let line_start = lines.get(idx).map(|l| l.start).unwrap_or(0).max(prev_end);
        let mut rejected: Option<String> = None;

        // Text in front of the marker on its own line comes first.
        let prefix = text.get(line_start..offset).unwrap_or("").trim();
        if !prefix.is_empty() {
            if self.is_plausible_title(prefix) {
                return (line_start, Some(prefix.to_string()), None);
            }
            rejected = Some(prefix.to_string());
        }

        let floor = prev_line.map(|p| p + 1).unwrap_or(0);
        let mut examined = 0usize;
        let mut i = idx;
        while i > floor && examined < self.lookback {
            i -= 1;
            let candidate = lines[i].text.trim();
            if candidate.is_empty() {
                continue;
            }
            examined += 1;
            if self.is_plausible_title(candidate) {
                return (lines[i].start.max(prev_end), Some(candidate.to_string()), rejected);
            }
            if rejected.is_none() {
                rejected = Some(candidate.to_string());
            }
        }

        (line_start, None, rejected)
    }

    /// Remove running headers/footers.
    ///
    /// Page numbers, print timestamps and configured patterns are anchors and
    /// always go. A line seen within two lines of an anchor at least
    /// `min_repeats` times is a running header and goes too, unless it holds
    /// a session marker or a field label, or is the title line of a marker
    /// (a session title repeated on each page it spans).
    pub fn strip_page_furniture(&self, text: &str) -> (String, usize) {
        let lines = index_lines(text);
        let is_anchor = |t: &str| {
            let t = t.trim();
            !t.is_empty()
                && (RE_PAGE_NUMBER.is_match(t)
                    || RE_PRINT_STAMP.is_match(t)
                    || self.furniture.iter().any(|re| re.is_match(t)))
        };
        let anchors: Vec<bool> = lines.iter().map(|l| is_anchor(l.text)).collect();

        let last = lines.len().saturating_sub(1);
        let mut near_anchor: HashMap<&str, usize> = HashMap::new();
        for (j, line) in lines.iter().enumerate() {
            let t = line.text.trim();
            if anchors[j] || t.is_empty() {
                continue;
            }
            if (j.saturating_sub(2)..=(j + 2).min(last)).any(|k| anchors[k]) {
                *near_anchor.entry(t).or_default() += 1;
            }
        }
        let running: HashSet<&str> = near_anchor
            .into_iter()
            .filter(|(t, n)| {
                *n >= self.min_repeats && !self.marker.is_match(t) && !self.control.is_match(t)
            })
            .map(|(t, _)| t)
            .collect();

        let titles = self.title_lines(&lines, &anchors);

        let mut out = String::with_capacity(text.len());
        let mut removed = 0usize;
        for (i, piece) in text.split_inclusive('\n').enumerate() {
            let t = lines[i].text.trim();
            if anchors[i] || (!t.is_empty() && running.contains(t) && !titles.contains(&i)) {
                removed += 1;
                continue;
            }
            out.push_str(piece);
        }
        if removed > 0 {
            debug!("Stripped {} page header/footer lines", removed);
        }
        (out, removed)
    }

    /// Line indices that would resolve as a title once anchors are gone.
    fn title_lines(&self, lines: &[Line<'_>], anchors: &[bool]) -> HashSet<usize> {
        let mut titles = HashSet::new();
        for (idx, line) in lines.iter().enumerate() {
            let Some(m) = self.marker.find(line.text) else {
                continue;
            };
            if self.is_plausible_title(&line.text[..m.start()]) {
                continue;
            }
            let mut examined = 0usize;
            let mut i = idx;
            while i > 0 && examined < self.lookback {
                i -= 1;
                let candidate = lines[i].text.trim();
                if anchors[i] || candidate.is_empty() {
                    continue;
                }
                if self.marker.is_match(candidate) {
                    break;
                }
                examined += 1;
                if self.is_plausible_title(candidate) {
                    titles.insert(i);
                    break;
                }
            }
        }
        titles
    }
}

fn marker_regex(markers: &SegmentationMarkers) -> Result<Regex, ExtractError> {
    let pattern = format!(
        r"{}\s*[:#\-]?\s*([A-Za-z0-9]{{2,16}})\b",
        label_pattern(&markers.session_label)
    );
    Regex::new(&pattern).map_err(|e| ExtractError::InvalidConfig(format!("session label: {e}")))
}

fn control_regex(markers: &SegmentationMarkers) -> Result<Regex, ExtractError> {
    let mut labels: Vec<String> = CONTROL_LABELS.iter().map(|l| label_pattern(l)).collect();
    labels.push(label_pattern(&markers.session_label));
    labels.push(label_pattern(&markers.location_label));
    labels.extend(markers.field_labels.iter().map(|l| label_pattern(l)));
    labels.retain(|l| !l.is_empty());
    let pattern = format!(r"(?i)^\s*(?:{})(?:[^A-Za-z]|$)", labels.join("|"));
    Regex::new(&pattern).map_err(|e| ExtractError::InvalidConfig(format!("field labels: {e}")))
}
