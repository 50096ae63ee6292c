//! Error types for the edgequake-sessions library.
//!
//! Three distinct error types reflect three distinct failure modes:
//!
//! * [`ExtractError`] — **Fatal**: the document cannot be processed at all
//!   (input missing, input is binary, provider not configured). Returned as
//!   `Err(ExtractError)` from the top-level `extract*` functions.
//!
//! * [`UnitError`] — **Non-fatal**: a single unit failed (timeouts, transport
//!   errors, empty replies) but every other unit is fine. Stored inside
//!   [`crate::output::UnitResult`] so the document degrades to fewer records
//!   instead of no records.
//!
//! * [`RepairError`] — the `Err` side of each repair step in
//!   [`crate::pipeline::repair`]. It never leaves the repairer as an error;
//!   an unrecoverable reply becomes an empty record list.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-sessions library.
///
/// Unit-level failures use [`UnitError`] and are stored in
/// [`crate::output::UnitResult`] rather than propagated here.
#[derive(Debug, Error)]
pub enum ExtractError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Input file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    /// The input is binary (e.g. a PDF) rather than extracted program text.
    #[error("Input '{source_id}' is not UTF-8 text (first bytes: {magic:?})\nExtract the text first, e.g. with pdftotext.")]
    NotText { source_id: String, magic: [u8; 4] },

    // ── LLM errors ────────────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// Some units succeeded but at least one failed.
    ///
    /// Returned by [`crate::output::ExtractionOutput::into_result`] when
    /// the caller wants to treat any unit failure as an error.
    #[error("{failed}/{total} units failed during extraction")]
    PartialFailure {
        success: usize,
        failed: usize,
        total: usize,
    },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the output JSON file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single unit.
///
/// Stored alongside [`crate::output::UnitResult`] when a unit ends `Fatal`.
/// The document continues with whatever units succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum UnitError {
    /// Every attempt exceeded the per-call timeout.
    #[error("Unit {unit}: service call timed out after {secs}s ({attempts} attempts)")]
    Timeout { unit: usize, secs: u64, attempts: u32 },

    /// Service call failed after retries.
    #[error("Unit {unit}: service call failed after {attempts} attempts: {detail}")]
    ServiceFailed {
        unit: usize,
        attempts: u32,
        detail: String,
    },

    /// The service kept answering with nothing.
    #[error("Unit {unit}: empty reply after {attempts} attempts")]
    EmptyReply { unit: usize, attempts: u32 },
}

/// Why a repair step could not produce a JSON array of objects.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepairError {
    /// Nothing left after stripping decoration.
    #[error("reply is empty")]
    Empty,

    /// Valid JSON, but the root is neither an array nor an object.
    #[error("reply root is {kind}, expected an array of objects")]
    NotAnArray { kind: &'static str },

    /// The text does not parse.
    #[error("parse failed at byte {offset}: {reason} (near {context:?})")]
    Unparseable {
        offset: usize,
        reason: String,
        context: String,
    },
}

/// Error reported by an [`crate::pipeline::dispatch::ExtractionService`].
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ServiceError(pub String);
