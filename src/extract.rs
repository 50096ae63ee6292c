//! Eager (full-document) extraction entry points.
//!
//! These functions wait for every unit and return the aggregated records.
//! Use [`crate::stream::extract_stream`] instead when units should be
//! consumed as they complete (early stop, incremental persistence).

use crate::config::ExtractionConfig;
use crate::document::Document;
use crate::error::ExtractError;
use crate::output::{DocumentMetadata, ExtractionOutput, ExtractionStats, Inspection, UnitResult};
use crate::pipeline::aggregate::Aggregator;
use crate::pipeline::boundary::{BoundaryDetector, Segmentation};
use crate::pipeline::chunker::Chunker;
use crate::pipeline::dispatch::{Dispatcher, ExtractionService, LlmService};
use crate::pipeline::input;
use crate::document::Unit;
use edgequake_llm::{LLMProvider, ProviderFactory};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

const DEFAULT_MODEL: &str = "gpt-4.1-nano";

/// Extract session records from a document using the configured LLM provider.
///
/// # Returns
/// `Ok(ExtractionOutput)` even when some units failed (check
/// `output.stats.units_fatal`, or call [`ExtractionOutput::into_result`]).
///
/// # Errors
/// Only for conditions that prevent processing at all: no provider could be
/// resolved, or the configuration is invalid.
pub async fn extract(
    document: &Document,
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, ExtractError> {
    let provider = resolve_provider(config)?;
    let service = LlmService::new(provider, config);
    extract_with(&service, document, config).await
}

/// Extract session records using any [`ExtractionService`].
pub async fn extract_with<S: ExtractionService>(
    service: &S,
    document: &Document,
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, ExtractError> {
    let total_start = Instant::now();
    info!(
        "Starting extraction: {} ({} chars)",
        document.id(),
        document.char_len()
    );

    // ── Step 1: Segment and chunk ────────────────────────────────────────
    let (segmentation, units) = segment(document, config)?;
    let metadata = metadata_for(document, &segmentation);
    let (to_send, held_back) = split_at_limit(&units, config.unit_limit);
    info!(
        "{} spans → {} units ({} to dispatch)",
        segmentation.spans.len(),
        units.len(),
        to_send.len()
    );

    if let Some(ref cb) = config.progress_callback {
        cb.on_extraction_start(to_send.len());
    }

    // ── Step 2: Dispatch, repair, aggregate ──────────────────────────────
    let mut aggregator = Aggregator::new(document.id());
    let mut results = if config.concurrency <= 1 {
        process_sequential(service, to_send, &mut aggregator, config).await
    } else {
        process_concurrent(service, to_send, &mut aggregator, config).await
    };
    for unit in held_back {
        let skipped = UnitResult::skipped(unit);
        aggregator.absorb(&skipped, None);
        results.push(skipped);
    }

    // ── Step 3: Stats ────────────────────────────────────────────────────
    let (records, mut stats) = aggregator.finish();
    stats.units_total = units.len();
    stats.total_duration_ms = total_start.elapsed().as_millis() as u64;

    if stats.units_dispatched > 0 && stats.units_fatal == stats.units_dispatched {
        warn!(
            "{}: every dispatched unit failed; returning zero records",
            document.id()
        );
    }

    if let Some(ref cb) = config.progress_callback {
        cb.on_extraction_complete(to_send.len(), records.len());
    }

    Ok(ExtractionOutput {
        records,
        units: results,
        metadata,
        stats,
    })
}

/// Extract several documents one after another.
///
/// A failure in one document never prevents the others from running.
pub async fn extract_batch_with<S: ExtractionService>(
    service: &S,
    documents: &[Document],
    config: &ExtractionConfig,
) -> Vec<Result<ExtractionOutput, ExtractError>> {
    let mut outputs = Vec::with_capacity(documents.len());
    for (i, document) in documents.iter().enumerate() {
        info!("Document {}/{}: {}", i + 1, documents.len(), document.id());
        let result = extract_with(service, document, config).await;
        if let Err(ref e) = result {
            warn!("{}: {}", document.id(), e);
        }
        outputs.push(result);
    }
    outputs
}

/// Load a text file or URL and extract it.
pub async fn extract_file(
    input_str: impl AsRef<str>,
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, ExtractError> {
    let document = input::load_document(input_str.as_ref(), config.download_timeout_secs).await?;
    extract(&document, config).await
}

/// Extract a file or URL and write its records as pretty JSON.
///
/// Uses atomic write (temp file + rename) to prevent partial files.
pub async fn extract_to_file(
    input_str: impl AsRef<str>,
    output_path: impl AsRef<Path>,
    config: &ExtractionConfig,
) -> Result<ExtractionStats, ExtractError> {
    let output = extract_file(input_str, config).await?;
    write_json(output_path.as_ref(), &output.records).await?;
    Ok(output.stats)
}

/// Serialise `value` as pretty JSON to `path` via temp file + rename.
pub async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), ExtractError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| ExtractError::Internal(format!("JSON serialisation failed: {e}")))?;

    let write_failed = |e: std::io::Error| ExtractError::OutputWriteFailed {
        path: path.to_path_buf(),
        source: e,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_failed)?;
    }

    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(write_failed)?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(write_failed)?;
    debug!("Wrote {}", path.display());
    Ok(())
}

/// Synchronous wrapper around [`extract`].
///
/// Creates a temporary tokio runtime internally.
pub fn extract_sync(
    document: &Document,
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, ExtractError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| ExtractError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(extract(document, config))
}

/// Segment and chunk a document without calling any service.
///
/// Does not require an LLM provider or API key.
pub fn inspect(document: &Document, config: &ExtractionConfig) -> Result<Inspection, ExtractError> {
    let (segmentation, units) = segment(document, config)?;
    let metadata = metadata_for(document, &segmentation);
    Ok(Inspection {
        metadata,
        spans: segmentation.spans,
        unresolved: segmentation.unresolved,
        units,
    })
}

// ── Internal helpers ─────────────────────────────────────────────────────

pub(crate) fn segment(
    document: &Document,
    config: &ExtractionConfig,
) -> Result<(Segmentation, Vec<Unit>), ExtractError> {
    let segmentation = BoundaryDetector::new(config)?.detect(document.text());
    let units = Chunker::new(config)?.chunk(&segmentation);
    Ok((segmentation, units))
}

pub(crate) fn split_at_limit(units: &[Unit], limit: Option<usize>) -> (&[Unit], &[Unit]) {
    let n = limit.unwrap_or(units.len()).min(units.len());
    if n < units.len() {
        info!("Unit limit {}: holding back {} units", n, units.len() - n);
    }
    units.split_at(n)
}

fn metadata_for(document: &Document, segmentation: &Segmentation) -> DocumentMetadata {
    DocumentMetadata {
        source: document.id().to_string(),
        year: document.detect_year(),
        char_count: document.char_len(),
        span_count: segmentation.spans.len(),
        unresolved_markers: segmentation.unresolved.len(),
        furniture_removed: segmentation.furniture_removed,
    }
}

/// Instantiate a named provider with the given model.
fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, ExtractError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        ExtractError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the LLM provider, from most-specific to least-specific.
///
/// 1. **Pre-built provider** (`config.provider`), used as-is.
/// 2. **Named provider + model** (`config.provider_name`).
/// 3. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`),
///    honoured when both are set.
/// 4. **`OPENAI_API_KEY`** present: OpenAI with the configured model.
/// 5. **Full auto-detection** (`ProviderFactory::from_env`).
pub(crate) fn resolve_provider(
    config: &ExtractionConfig,
) -> Result<Arc<dyn LLMProvider>, ExtractError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return create_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_provider(&prov, &model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
            return create_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| ExtractError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

/// Dispatch units one at a time, absorbing each result before the next.
///
/// A split session whose overview the chunker could not resolve reuses
/// the first overview a reply produced for it.
async fn process_sequential<S: ExtractionService>(
    service: &S,
    units: &[Unit],
    aggregator: &mut Aggregator,
    config: &ExtractionConfig,
) -> Vec<UnitResult> {
    let dispatcher = Dispatcher::new(service, config);
    let total = units.len();
    let mut results = Vec::with_capacity(total);

    for unit in units {
        let overview: Option<String> = unit.overview.clone().or_else(|| {
            if !unit.is_continuation() {
                return None;
            }
            unit.sole_session()
                .and_then(|id| aggregator.known_overview(id))
                .map(str::to_string)
        });

        if let Some(ref cb) = config.progress_callback {
            cb.on_unit_start(unit.index, total);
        }
        let result = dispatcher
            .dispatch_with_overview(unit, overview.as_deref())
            .await;
        notify(config, &result, total);

        aggregator.absorb(&result, overview.as_deref());
        results.push(result);
    }
    results
}

/// Dispatch up to `concurrency` units at once, then merge in unit order.
async fn process_concurrent<S: ExtractionService>(
    service: &S,
    units: &[Unit],
    aggregator: &mut Aggregator,
    config: &ExtractionConfig,
) -> Vec<UnitResult> {
    let dispatcher = Dispatcher::new(service, config);
    let dispatcher = &dispatcher;
    let total = units.len();

    let mut results: Vec<UnitResult> = stream::iter(units.iter().map(|unit| async move {
        if let Some(ref cb) = config.progress_callback {
            cb.on_unit_start(unit.index, total);
        }
        let result = dispatcher.dispatch(unit).await;
        notify(config, &result, total);
        result
    }))
    .buffer_unordered(config.concurrency)
    .collect()
    .await;

    // Single-writer merge: the aggregator sees units in document order.
    results.sort_by_key(|r| r.index);
    for (unit, result) in units.iter().zip(&results) {
        aggregator.absorb(result, unit.overview.as_deref());
    }
    results
}

fn notify(config: &ExtractionConfig, result: &UnitResult, total: usize) {
    if let Some(ref cb) = config.progress_callback {
        match &result.error {
            None => cb.on_unit_complete(result.index, total, result.records.len()),
            Some(e) => cb.on_unit_error(result.index, total, &e.to_string()),
        }
    }
}
