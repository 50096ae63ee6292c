//! Streaming extraction API: emit unit results as they complete.
//!
//! A long program takes many service calls. Streaming lets callers persist
//! records incrementally, drive a progress display, or stop early (drop the
//! stream) while keeping what has already been absorbed.
//!
//! Unlike the eager [`crate::extract::extract`], which returns only after
//! all units finish, [`extract_stream`] yields each [`UnitResult`] as soon
//! as its unit is done. With `concurrency > 1` units may arrive out of
//! order; feed them to an [`Aggregator`](crate::pipeline::aggregate::Aggregator)
//! after sorting by `index` to get the same records as the eager path.

use crate::config::ExtractionConfig;
use crate::document::Document;
use crate::error::ExtractError;
use crate::extract::{resolve_provider, segment, split_at_limit};
use crate::output::UnitResult;
use crate::pipeline::dispatch::{Dispatcher, ExtractionService, LlmService};
use futures::stream::{self, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::Stream;
use tracing::info;

/// A boxed stream of unit results.
pub type UnitStream = Pin<Box<dyn Stream<Item = UnitResult> + Send>>;

/// Extract a document with the configured LLM provider, streaming units.
///
/// # Returns
/// - `Ok(UnitStream)`: one [`UnitResult`] per dispatched unit
/// - `Err(ExtractError)`: no provider, or an invalid configuration
///
/// # Example
/// ```rust,no_run
/// use edgequake_sessions::{extract_stream, Document, ExtractionConfig};
/// use futures::StreamExt;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let text = std::fs::read_to_string("program.txt")?;
/// let document = Document::new("program.txt", text);
/// let mut units = extract_stream(&document, &ExtractionConfig::default())?;
/// while let Some(unit) = units.next().await {
///     println!("unit {}: {} records", unit.index, unit.records.len());
/// }
/// # Ok(())
/// # }
/// ```
pub fn extract_stream(
    document: &Document,
    config: &ExtractionConfig,
) -> Result<UnitStream, ExtractError> {
    let provider = resolve_provider(config)?;
    let service = Arc::new(LlmService::new(provider, config));
    extract_stream_with(service, document, config)
}

/// Streaming counterpart of [`crate::extract::extract_with`].
///
/// Segmentation and chunking happen before this returns; service calls
/// happen only while the stream is polled.
pub fn extract_stream_with<S: ExtractionService + 'static>(
    service: Arc<S>,
    document: &Document,
    config: &ExtractionConfig,
) -> Result<UnitStream, ExtractError> {
    let (segmentation, units) = segment(document, config)?;
    let (to_send, _held_back) = split_at_limit(&units, config.unit_limit);
    let units = to_send.to_vec();
    info!(
        "Streaming extraction: {} ({} spans, {} units)",
        document.id(),
        segmentation.spans.len(),
        units.len()
    );

    let concurrency = config.concurrency;
    let config = config.clone();

    if concurrency <= 1 {
        let s = stream::iter(units).then(move |unit| {
            let service = Arc::clone(&service);
            let cfg = config.clone();
            async move { Dispatcher::new(service.as_ref(), &cfg).dispatch(&unit).await }
        });
        Ok(Box::pin(s))
    } else {
        let s = stream::iter(units.into_iter().map(move |unit| {
            let service = Arc::clone(&service);
            let cfg = config.clone();
            async move { Dispatcher::new(service.as_ref(), &cfg).dispatch(&unit).await }
        }))
        .buffer_unordered(concurrency);
        Ok(Box::pin(s))
    }
}
