//! Progress-callback trait for per-unit extraction events.
//!
//! Inject an [`Arc<dyn ExtractionProgressCallback>`] via
//! [`crate::config::ExtractionConfigBuilder::progress_callback`] to receive
//! events as the pipeline dispatches each unit.
//!
//! # Example
//!
//! ```rust
//! use edgequake_sessions::{ExtractionProgressCallback, ExtractionConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     records: Arc<AtomicUsize>,
//! }
//!
//! impl ExtractionProgressCallback for CountingCallback {
//!     fn on_unit_complete(&self, unit: usize, total_units: usize, records: usize) {
//!         self.records.fetch_add(records, Ordering::SeqCst);
//!         eprintln!("Unit {}/{} done ({} records)", unit + 1, total_units, records);
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback {
//!     records: Arc::new(AtomicUsize::new(0)),
//! });
//!
//! let config = ExtractionConfig::builder()
//!     .progress_callback(counter as Arc<dyn ExtractionProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the extraction pipeline as it processes each unit.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
///
/// # Thread safety
///
/// With `concurrency > 1`, `on_unit_start`, `on_unit_complete` and
/// `on_unit_error` may be called concurrently and in any unit order.
pub trait ExtractionProgressCallback: Send + Sync {
    /// Called once after chunking, before any service call.
    fn on_extraction_start(&self, total_units: usize) {
        let _ = total_units;
    }

    /// Called just before the first request for a unit is sent.
    ///
    /// `unit` is 0-based.
    fn on_unit_start(&self, unit: usize, total_units: usize) {
        let _ = (unit, total_units);
    }

    /// Called when a unit produced a reply (possibly repaired, possibly empty).
    ///
    /// `records` is the number of valid records the unit yielded.
    fn on_unit_complete(&self, unit: usize, total_units: usize, records: usize) {
        let _ = (unit, total_units, records);
    }

    /// Called when a unit fails after all retries are exhausted.
    fn on_unit_error(&self, unit: usize, total_units: usize, error: &str) {
        let _ = (unit, total_units, error);
    }

    /// Called once after aggregation.
    ///
    /// `records` is the deduplicated record count.
    fn on_extraction_complete(&self, total_units: usize, records: usize) {
        let _ = (total_units, records);
    }
}

/// A no-op implementation, the default when no callback is configured.
pub struct NoopProgressCallback;

impl ExtractionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ExtractionConfig`].
pub type ProgressCallback = Arc<dyn ExtractionProgressCallback>;
