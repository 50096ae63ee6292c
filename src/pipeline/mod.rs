//! Pipeline stages for session extraction.
//!
//! Each submodule implements exactly one step; data flows strictly
//! downward and no stage calls back into an earlier one.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ boundary ──▶ chunker ──▶ dispatch ──▶ repair ──▶ aggregate
//! (path/URL) (spans)     (units)     (service)    (records)  (dedup)
//! ```
//!
//! 1. [`input`]    — load the program text from a file or URL
//! 2. [`boundary`] — strip page furniture, find one span per session marker
//! 3. [`chunker`]  — pack spans into units under the character budget,
//!    splitting oversized sessions and carrying their overview
//! 4. [`dispatch`] — send each unit to the extraction service with timeout,
//!    retry and backoff; the only stage with network I/O
//! 5. [`repair`]   — recover a JSON array from the reply and validate records
//! 6. [`aggregate`] — re-associate, stamp the source and deduplicate

pub mod aggregate;
pub mod boundary;
pub mod chunker;
pub mod dispatch;
pub mod input;
pub mod repair;
