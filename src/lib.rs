//! # edgequake-sessions
//!
//! Extract structured session records from conference-program text using
//! Large Language Models.
//!
//! ## Why this crate?
//!
//! A technical program (hundreds of sessions, thousands of papers) arrives
//! as flat text: page headers, session blocks and paper tables run into one
//! another. Regex alone cannot reliably pull titles, organizers and paper
//! rows out of it, and a whole program does not fit in one model call. This
//! crate finds the session boundaries deterministically, packs sessions into
//! units that fit the model's budget, and lets the model read each unit into
//! JSON. Replies are repaired when malformed, validated and deduplicated.
//!
//! ## Pipeline Overview
//!
//! ```text
//! program text
//!  │
//!  ├─ 1. Input     read a local file or download from URL
//!  ├─ 2. Boundary  strip page furniture, one span per "Session Code"
//!  ├─ 3. Chunk     pack spans under max_chars, split oversized sessions
//!  ├─ 4. Dispatch  LLM call per unit with timeout, retry and backoff
//!  ├─ 5. Repair    recover a JSON array, validate records
//!  └─ 6. Aggregate re-associate, stamp source, deduplicate
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_sessions::{extract_file, ExtractionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let config = ExtractionConfig::default();
//!     let output = extract_file("wcx2025.txt", &config).await?;
//!     for record in &output.records {
//!         println!("{} | {} | {}", record.session_code, record.paper_no, record.title);
//!     }
//!     eprintln!("tokens: {} in / {} out",
//!         output.stats.total_input_tokens,
//!         output.stats.total_output_tokens);
//!     Ok(())
//! }
//! ```
//!
//! ## Bring your own service
//!
//! Anything implementing [`ExtractionService`] can stand in for the LLM,
//! which is how the test suite drives the pipeline deterministically. See
//! [`extract_with`].
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `sessions` binary (clap + indicatif + anyhow + tracing-subscriber) |
//!
//! Disable `cli` when using only the library to avoid pulling in CLI-only deps:
//! ```toml
//! edgequake-sessions = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod document;
pub mod error;
pub mod extract;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod record;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{Backoff, ExtractionConfig, ExtractionConfigBuilder, SegmentationMarkers};
pub use document::{Document, Span, Unit, UnitOrigin, UnresolvedMarker};
pub use error::{ExtractError, RepairError, ServiceError, UnitError};
pub use extract::{
    extract, extract_batch_with, extract_file, extract_sync, extract_to_file, extract_with,
    inspect, write_json,
};
pub use output::{
    AttemptOutcome, DocumentMetadata, ExtractionAttempt, ExtractionOutput, ExtractionStats,
    Inspection, UnitResult, UnitStatus,
};
pub use pipeline::dispatch::{ExtractionRequest, ExtractionService, LlmService, ServiceReply};
pub use progress::{ExtractionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use record::{Field, SessionRecord, NO_DATA};
pub use stream::{extract_stream, extract_stream_with, UnitStream};
