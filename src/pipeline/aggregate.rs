//! Aggregation: merge every unit's records into one deduplicated list.
//!
//! The [`Aggregator`] is fed one [`UnitResult`] at a time, so whatever has
//! been absorbed stays usable when a document is abandoned half-way. It is
//! the single writer of the record list and the duplicate-key set; callers
//! that dispatch units concurrently merge results through it one by one.

use crate::output::{ExtractionStats, UnitResult, UnitStatus};
use crate::record::{Field, IdentityKey, SessionRecord};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// Accumulates records across the units of one document.
#[derive(Debug, Clone, Default)]
pub struct Aggregator {
    source: String,
    records: Vec<SessionRecord>,
    seen: HashSet<IdentityKey>,
    /// First non-blank overview seen per session code.
    overviews: HashMap<String, String>,
    stats: ExtractionStats,
}

impl Aggregator {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Default::default()
        }
    }

    /// Merge one unit's records.
    ///
    /// `overview` is the overview the unit was dispatched with, if any.
    /// Returns the number of records kept.
    pub fn absorb(&mut self, result: &UnitResult, overview: Option<&str>) -> usize {
        self.count_unit(result);
        let sole_session = match result.session_ids.as_slice() {
            [only] => Some(only.as_str()),
            _ => None,
        };

        let mut kept = 0usize;
        for record in &result.records {
            let mut record = record.clone();
            if record.is_missing(Field::SessionCode) {
                if let Some(id) = sole_session {
                    record.set(Field::SessionCode, id);
                }
            }
            if record.is_missing(Field::Overview) {
                let known = self.overviews.get(&record.session_code).map(String::as_str);
                if let Some(ov) = overview.or(known) {
                    record.set(Field::Overview, ov);
                }
            }
            if !record.is_missing(Field::Overview) && !record.is_missing(Field::SessionCode) {
                self.overviews
                    .entry(record.session_code.clone())
                    .or_insert_with(|| record.overview.clone());
            }
            record.source = self.source.clone();

            let key = record.identity();
            if !key.is_sentinel() && !self.seen.insert(key) {
                debug!(
                    "Unit {}: duplicate ({}, {}) dropped",
                    result.index, record.session_code, record.paper_no
                );
                self.stats.duplicates_dropped += 1;
                continue;
            }
            self.records.push(record);
            kept += 1;
        }
        self.stats.records_after_dedup = self.records.len();
        kept
    }

    fn count_unit(&mut self, result: &UnitResult) {
        let s = &mut self.stats;
        match result.status {
            UnitStatus::Skipped => return,
            UnitStatus::Success => s.units_succeeded += 1,
            UnitStatus::Repaired => s.units_repaired += 1,
            UnitStatus::Unrecoverable => s.units_unrecoverable += 1,
            UnitStatus::Fatal => s.units_fatal += 1,
        }
        s.units_dispatched += 1;
        s.records_before_dedup += result.records.len();
        s.records_invalid += result.dropped;
        s.total_input_tokens += result.input_tokens as u64;
        s.total_output_tokens += result.output_tokens as u64;
    }

    /// Overview already resolved for a session, if any.
    pub fn known_overview(&self, session_code: &str) -> Option<&str> {
        self.overviews.get(session_code).map(String::as_str)
    }

    /// Records kept so far, in absorption order.
    pub fn records(&self) -> &[SessionRecord] {
        &self.records
    }

    pub fn stats(&self) -> &ExtractionStats {
        &self.stats
    }

    /// Consume the aggregator and log the document summary.
    pub fn finish(self) -> (Vec<SessionRecord>, ExtractionStats) {
        let s = &self.stats;
        info!(
            "{}: {} units ({} ok, {} repaired, {} unrecoverable, {} fatal), {} → {} records ({} duplicates, {} invalid)",
            self.source,
            s.units_dispatched,
            s.units_succeeded,
            s.units_repaired,
            s.units_unrecoverable,
            s.units_fatal,
            s.records_before_dedup,
            s.records_after_dedup,
            s.duplicates_dropped,
            s.records_invalid
        );
        (self.records, self.stats)
    }
}

/// Merge a finished set of unit results in unit order.
pub fn aggregate(source: &str, results: &[UnitResult]) -> (Vec<SessionRecord>, ExtractionStats) {
    let mut ordered: Vec<&UnitResult> = results.iter().collect();
    ordered.sort_by_key(|r| r.index);
    let mut aggregator = Aggregator::new(source);
    for result in ordered {
        aggregator.absorb(result, None);
    }
    let (records, mut stats) = aggregator.finish();
    stats.units_total = results.len();
    (records, stats)
}
