//! Output types returned by the extraction pipeline.

use crate::document::{Span, Unit, UnresolvedMarker};
use crate::error::{ExtractError, UnitError};
use crate::pipeline::repair::RepairStep;
use crate::record::SessionRecord;
use serde::{Deserialize, Serialize};

/// Result of extracting one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionOutput {
    /// Deduplicated records in document order.
    pub records: Vec<SessionRecord>,
    /// Per-unit results, ordered by unit index.
    pub units: Vec<UnitResult>,
    pub metadata: DocumentMetadata,
    pub stats: ExtractionStats,
}

impl ExtractionOutput {
    /// Turn any `Fatal` unit into [`ExtractError::PartialFailure`].
    ///
    /// The pipeline itself never fails on unit errors; use this when a caller
    /// needs all-or-nothing semantics.
    pub fn into_result(self) -> Result<Self, ExtractError> {
        let failed = self.stats.units_fatal;
        if failed == 0 {
            return Ok(self);
        }
        let total = self.stats.units_dispatched;
        Err(ExtractError::PartialFailure {
            success: total.saturating_sub(failed),
            failed,
            total,
        })
    }
}

/// Outcome of one request/response cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// The reply parsed strictly as an array (or object) of records.
    Success,
    /// Non-empty reply that does not parse strictly.
    Malformed,
    /// Nothing but whitespace or code fences.
    Empty,
    /// Valid JSON whose root is a string, number, bool or null.
    NotAnArray,
    /// The service returned an error.
    TransportError,
    /// No reply within the per-call timeout.
    Timeout,
}

impl AttemptOutcome {
    /// `true` when the dispatcher should try again.
    pub fn is_retryable(self) -> bool {
        !matches!(self, AttemptOutcome::Success | AttemptOutcome::Malformed)
    }
}

/// One request/response cycle against the extraction service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionAttempt {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Delay waited before this attempt.
    pub delay_ms: u64,
    /// Time spent waiting for the reply.
    pub elapsed_ms: u64,
    pub outcome: AttemptOutcome,
    /// Error text for transport failures.
    pub detail: Option<String>,
}

/// Final status of one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    /// Reply parsed without repair.
    Success,
    /// Reply needed repair steps and yielded structured data.
    Repaired,
    /// A reply arrived but no repair step recovered it; zero records.
    Unrecoverable,
    /// Retries exhausted without a usable reply; zero records.
    Fatal,
    /// Not sent because of `unit_limit`.
    Skipped,
}

/// The result of dispatching, repairing and validating one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitResult {
    /// 0-based unit index.
    pub index: usize,
    pub session_ids: Vec<String>,
    pub status: UnitStatus,
    pub attempts: Vec<ExtractionAttempt>,
    /// The last non-empty reply, verbatim.
    pub raw: Option<String>,
    /// The repair step that produced parseable data.
    pub repair_step: Option<RepairStep>,
    /// Valid records, before re-association and dedup.
    pub records: Vec<SessionRecord>,
    /// Objects rejected by validation.
    pub dropped: usize,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub duration_ms: u64,
    pub error: Option<UnitError>,
}

impl UnitResult {
    /// A unit that was never dispatched.
    pub fn skipped(unit: &Unit) -> Self {
        Self {
            index: unit.index,
            session_ids: unit.session_ids.clone(),
            status: UnitStatus::Skipped,
            attempts: Vec::new(),
            raw: None,
            repair_step: None,
            records: Vec::new(),
            dropped: 0,
            input_tokens: 0,
            output_tokens: 0,
            duration_ms: 0,
            error: None,
        }
    }

    /// Number of service calls made.
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    pub fn is_fatal(&self) -> bool {
        self.status == UnitStatus::Fatal
    }
}

/// Per-document metadata handed to persistence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Document identifier stamped on every record.
    pub source: String,
    /// First plausible program year in the text.
    pub year: Option<u16>,
    pub char_count: usize,
    pub span_count: usize,
    pub unresolved_markers: usize,
    pub furniture_removed: usize,
}

/// Completeness figures for one document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionStats {
    /// Units produced by the chunker.
    pub units_total: usize,
    /// Units actually sent (after `unit_limit`).
    pub units_dispatched: usize,
    pub units_succeeded: usize,
    pub units_repaired: usize,
    pub units_unrecoverable: usize,
    pub units_fatal: usize,
    pub records_before_dedup: usize,
    pub records_after_dedup: usize,
    pub duplicates_dropped: usize,
    /// Reply objects rejected by validation.
    pub records_invalid: usize,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_duration_ms: u64,
}

/// Segmentation and chunking of a document, without any service call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inspection {
    pub metadata: DocumentMetadata,
    pub spans: Vec<Span>,
    pub unresolved: Vec<UnresolvedMarker>,
    pub units: Vec<Unit>,
}
