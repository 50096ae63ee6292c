//! Dispatch: send one unit to the extraction service and collect a reply.
//!
//! The service is reached through the [`ExtractionService`] trait so tests
//! (and callers with their own transport) can plug in anything that turns a
//! request into text. [`LlmService`] is the production implementation over
//! an `edgequake_llm` provider.
//!
//! ## Retry State Machine
//!
//! ```text
//! Pending ──▶ InFlight ──▶ Success
//!               │  ▲
//!               ▼  │ (delay)
//!            Retryable ──▶ Fatal   (attempts exhausted)
//! ```
//!
//! Empty replies, scalar JSON roots, transport errors and timeouts are
//! retryable. Every call is bounded by `api_timeout_secs`, so a hung service
//! costs at most `(max_retries + 1) × timeout` plus the backoff delays.
//! A malformed but non-empty reply is not retried: it goes to
//! [`crate::pipeline::repair`].

use crate::config::ExtractionConfig;
use crate::document::Unit;
use crate::error::{ServiceError, UnitError};
use crate::output::{AttemptOutcome, ExtractionAttempt, UnitResult, UnitStatus};
use crate::pipeline::repair::{self, RepairStep};
use crate::prompts::{overview_context, unit_prompt, DEFAULT_SYSTEM_PROMPT};
use crate::record::Field;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider};
use std::future::Future;
use std::sync::Arc;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

/// One request to the extraction service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionRequest {
    pub system: String,
    /// Extra instructions sent as a second system message (overview reuse).
    pub context: Option<String>,
    /// Output schema plus the unit text.
    pub user: String,
}

/// Text returned by the service with its token usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceReply {
    pub content: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

impl ServiceReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }
}

/// Anything that answers an [`ExtractionRequest`] with free text.
pub trait ExtractionService: Send + Sync {
    fn complete(
        &self,
        request: &ExtractionRequest,
    ) -> impl Future<Output = Result<ServiceReply, ServiceError>> + Send;
}

impl<S: ExtractionService> ExtractionService for Arc<S> {
    fn complete(
        &self,
        request: &ExtractionRequest,
    ) -> impl Future<Output = Result<ServiceReply, ServiceError>> + Send {
        S::complete(self, request)
    }
}

// ── LLM-backed service ───────────────────────────────────────────────────

/// [`ExtractionService`] over an `edgequake_llm` chat provider.
pub struct LlmService {
    provider: Arc<dyn LLMProvider>,
    temperature: f32,
    max_tokens: usize,
}

impl LlmService {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &ExtractionConfig) -> Self {
        Self {
            provider,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }

    fn options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        }
    }
}

impl ExtractionService for LlmService {
    fn complete(
        &self,
        request: &ExtractionRequest,
    ) -> impl Future<Output = Result<ServiceReply, ServiceError>> + Send {
        let mut messages = vec![ChatMessage::system(request.system.as_str())];
        if let Some(context) = request.context.as_deref() {
            messages.push(ChatMessage::system(context));
        }
        messages.push(ChatMessage::user(request.user.as_str()));
        let options = self.options();

        async move {
            let response = self
                .provider
                .chat(&messages, Some(&options))
                .await
                .map_err(|e| ServiceError(e.to_string()))?;
            Ok(ServiceReply {
                content: response.content,
                input_tokens: response.prompt_tokens as usize,
                output_tokens: response.completion_tokens as usize,
            })
        }
    }
}

// ── Dispatcher ───────────────────────────────────────────────────────────

/// Where a unit is in its request lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Pending,
    /// Attempt `attempt` (1-based) is being sent after waiting `delay_ms`.
    InFlight { attempt: u32, delay_ms: u64 },
    /// Attempt `attempt` failed in a way worth repeating.
    Retryable { attempt: u32 },
    /// A non-empty reply arrived.
    Success,
    /// Attempts exhausted.
    Fatal,
}

/// Sends units to an [`ExtractionService`] under one configuration.
pub struct Dispatcher<'a, S> {
    service: &'a S,
    config: &'a ExtractionConfig,
}

impl<'a, S: ExtractionService> Dispatcher<'a, S> {
    pub fn new(service: &'a S, config: &'a ExtractionConfig) -> Self {
        Self { service, config }
    }

    /// Dispatch a unit using the overview the chunker attached to it.
    pub async fn dispatch(&self, unit: &Unit) -> UnitResult {
        self.dispatch_with_overview(unit, unit.overview.as_deref())
            .await
    }

    /// Dispatch a unit, asking the service to reuse `overview` if given.
    pub async fn dispatch_with_overview(&self, unit: &Unit, overview: Option<&str>) -> UnitResult {
        let started = Instant::now();
        let request = self.build_request(unit, overview);
        let max_attempts = self.config.max_retries.saturating_add(1);

        let mut attempts: Vec<ExtractionAttempt> = Vec::new();
        let mut reply: Option<String> = None;
        let mut outcome = AttemptOutcome::Empty;
        let mut input_tokens = 0usize;
        let mut output_tokens = 0usize;
        let mut state = DispatchState::Pending;

        loop {
            state = match state {
                DispatchState::Pending => DispatchState::InFlight {
                    attempt: 1,
                    delay_ms: 0,
                },
                DispatchState::InFlight { attempt, delay_ms } => {
                    let (result, elapsed) = self.send(&request).await;
                    let mut detail = None;
                    outcome = match result {
                        Ok(r) => {
                            input_tokens += r.input_tokens;
                            output_tokens += r.output_tokens;
                            let o = repair::classify(&r.content);
                            if o != AttemptOutcome::Empty {
                                reply = Some(r.content);
                            }
                            o
                        }
                        Err(SendError::Timeout) => AttemptOutcome::Timeout,
                        Err(SendError::Service(e)) => {
                            detail = Some(e.0);
                            AttemptOutcome::TransportError
                        }
                    };
                    attempts.push(ExtractionAttempt {
                        attempt,
                        delay_ms,
                        elapsed_ms: elapsed,
                        outcome,
                        detail,
                    });

                    if !outcome.is_retryable() {
                        DispatchState::Success
                    } else if attempt < max_attempts {
                        DispatchState::Retryable { attempt }
                    } else {
                        DispatchState::Fatal
                    }
                }
                DispatchState::Retryable { attempt } => {
                    let delay = self.config.retry_delay(attempt);
                    warn!(
                        "Unit {}: {:?} on attempt {}/{}, retrying in {}ms",
                        unit.index,
                        outcome,
                        attempt,
                        max_attempts,
                        delay.as_millis()
                    );
                    sleep(delay).await;
                    DispatchState::InFlight {
                        attempt: attempt + 1,
                        delay_ms: delay.as_millis() as u64,
                    }
                }
                DispatchState::Success | DispatchState::Fatal => break,
            };
        }

        let mut result = UnitResult {
            index: unit.index,
            session_ids: unit.session_ids.clone(),
            status: UnitStatus::Fatal,
            attempts,
            raw: reply,
            repair_step: None,
            records: Vec::new(),
            dropped: 0,
            input_tokens,
            output_tokens,
            duration_ms: 0,
            error: None,
        };

        // A Fatal unit may still hold a non-empty reply from a scalar root;
        // the repairer gets a look at it either way.
        if let Some(raw) = result.raw.as_deref() {
            let validated = repair::repair(raw, &self.required_fields(unit));
            result.records = validated.records;
            result.dropped = validated.dropped;
            result.repair_step = validated.step;
        }

        result.status = match (state, result.repair_step) {
            (DispatchState::Success, Some(RepairStep::Strict)) => UnitStatus::Success,
            (DispatchState::Success, Some(_)) => UnitStatus::Repaired,
            (DispatchState::Success, None) => UnitStatus::Unrecoverable,
            _ if !result.records.is_empty() => UnitStatus::Repaired,
            _ => UnitStatus::Fatal,
        };

        if result.status == UnitStatus::Fatal {
            let attempts = result.attempt_count();
            let error = match outcome {
                AttemptOutcome::Timeout => UnitError::Timeout {
                    unit: unit.index,
                    secs: self.config.api_timeout_secs,
                    attempts,
                },
                AttemptOutcome::TransportError => UnitError::ServiceFailed {
                    unit: unit.index,
                    attempts,
                    detail: result
                        .attempts
                        .last()
                        .and_then(|a| a.detail.clone())
                        .unwrap_or_else(|| "Unknown error".to_string()),
                },
                AttemptOutcome::NotAnArray => UnitError::ServiceFailed {
                    unit: unit.index,
                    attempts,
                    detail: "reply is not a JSON array".to_string(),
                },
                _ => UnitError::EmptyReply {
                    unit: unit.index,
                    attempts,
                },
            };
            warn!("{}", error);
            result.error = Some(error);
        }

        result.duration_ms = started.elapsed().as_millis() as u64;
        debug!(
            "Unit {}: {:?}, {} records, {} dropped, {} attempts, {}ms",
            unit.index,
            result.status,
            result.records.len(),
            result.dropped,
            result.attempt_count(),
            result.duration_ms
        );
        result
    }

    /// Build the request for a unit.
    pub fn build_request(&self, unit: &Unit, overview: Option<&str>) -> ExtractionRequest {
        let system = self
            .config
            .system_prompt
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_PROMPT)
            .to_string();
        let context = match (unit.sole_session(), overview) {
            (Some(id), Some(ov)) if !ov.trim().is_empty() => Some(overview_context(id, ov)),
            _ => None,
        };
        ExtractionRequest {
            system,
            context,
            user: unit_prompt(&unit.text),
        }
    }

    /// Fields a reply object must carry for this unit.
    ///
    /// A unit covering one session lets the aggregator fill in a missing
    /// session code, so the code is not required there.
    fn required_fields(&self, unit: &Unit) -> Vec<Field> {
        let inherits_code = unit.sole_session().is_some();
        self.config
            .required_fields
            .iter()
            .copied()
            .filter(|f| !(inherits_code && *f == Field::SessionCode))
            .collect()
    }

    async fn send(&self, request: &ExtractionRequest) -> (Result<ServiceReply, SendError>, u64) {
        let start = Instant::now();
        let result = match timeout(self.config.api_timeout(), self.service.complete(request)).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => Err(SendError::Service(e)),
            Err(_) => Err(SendError::Timeout),
        };
        (result, start.elapsed().as_millis() as u64)
    }
}

enum SendError {
    Timeout,
    Service(ServiceError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Backoff;
    use crate::document::UnitOrigin;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    const GOOD: &str = r#"[{"session_code": "PFL750", "title": "Battery Aging", "paper_no": "2025-01-0001"}]"#;

    /// Replays a fixed script; `Err` entries become transport errors.
    struct Scripted {
        replies: Mutex<VecDeque<Result<&'static str, &'static str>>>,
        calls: AtomicU32,
        seen: Mutex<Vec<ExtractionRequest>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<&'static str, &'static str>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicU32::new(0),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl ExtractionService for Scripted {
        async fn complete(&self, request: &ExtractionRequest) -> Result<ServiceReply, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(request.clone());
            let next = self.replies.lock().unwrap().pop_front().unwrap_or(Ok(""));
            next.map(ServiceReply::text).map_err(|e| ServiceError(e.to_string()))
        }
    }

    /// Never answers.
    struct Hanging {
        calls: AtomicU32,
    }

    impl ExtractionService for Hanging {
        async fn complete(&self, _request: &ExtractionRequest) -> Result<ServiceReply, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            sleep(Duration::from_secs(3600)).await;
            Ok(ServiceReply::text(GOOD))
        }
    }

    fn unit(overview: Option<&str>) -> Unit {
        Unit {
            index: 0,
            text: "Battery Aging\nSession Code PFL750\nRoom 140 A".into(),
            session_ids: vec!["PFL750".into()],
            overview: overview.map(str::to_string),
            origin: UnitOrigin::Spans,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_attempt_success() {
        let service = Scripted::new(vec![Ok(GOOD)]);
        let config = ExtractionConfig::default();
        let result = Dispatcher::new(&service, &config).dispatch(&unit(None)).await;
        assert_eq!(result.status, UnitStatus::Success);
        assert_eq!(result.attempt_count(), 1);
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0].session_code, "PFL750");
        assert!(result.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_reply_is_retried_after_fixed_delay() {
        let service = Scripted::new(vec![Ok("   "), Ok(GOOD)]);
        let config = ExtractionConfig::default();
        let result = Dispatcher::new(&service, &config).dispatch(&unit(None)).await;
        assert_eq!(result.status, UnitStatus::Success);
        assert_eq!(result.attempt_count(), 2);
        assert_eq!(result.attempts[0].outcome, AttemptOutcome::Empty);
        assert_eq!(result.attempts[1].delay_ms, 2000);
    }

    #[tokio::test(start_paused = true)]
    async fn scalar_root_is_retried() {
        let service = Scripted::new(vec![Ok("\"sorry\""), Ok(GOOD)]);
        let config = ExtractionConfig::default();
        let result = Dispatcher::new(&service, &config).dispatch(&unit(None)).await;
        assert_eq!(result.attempts[0].outcome, AttemptOutcome::NotAnArray);
        assert_eq!(result.records.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_errors_exhaust_to_fatal() {
        let service = Scripted::new(vec![Err("503"), Err("503"), Err("503"), Err("429")]);
        let config = ExtractionConfig::default();
        let result = Dispatcher::new(&service, &config).dispatch(&unit(None)).await;
        assert_eq!(result.status, UnitStatus::Fatal);
        assert_eq!(service.calls.load(Ordering::SeqCst), 4);
        assert!(result.records.is_empty());
        match result.error {
            Some(UnitError::ServiceFailed { attempts, detail, .. }) => {
                assert_eq!(attempts, 4);
                assert_eq!(detail, "429");
            }
            other => panic!("expected ServiceFailed, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_exhaust_to_fatal_without_panicking() {
        let service = Hanging {
            calls: AtomicU32::new(0),
        };
        let config = ExtractionConfig::builder()
            .max_retries(4)
            .api_timeout_secs(5)
            .build()
            .unwrap();
        let result = Dispatcher::new(&service, &config).dispatch(&unit(None)).await;
        assert_eq!(service.calls.load(Ordering::SeqCst), 5);
        assert_eq!(result.status, UnitStatus::Fatal);
        assert!(result.records.is_empty());
        assert!(result
            .attempts
            .iter()
            .all(|a| a.outcome == AttemptOutcome::Timeout));
        assert!(matches!(
            result.error,
            Some(UnitError::Timeout { attempts: 5, secs: 5, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn exponential_backoff_doubles_delays() {
        let service = Scripted::new(vec![Err("x"), Err("x"), Err("x"), Ok(GOOD)]);
        let config = ExtractionConfig::builder()
            .backoff(Backoff::Exponential)
            .retry_backoff_ms(100)
            .build()
            .unwrap();
        let result = Dispatcher::new(&service, &config).dispatch(&unit(None)).await;
        let delays: Vec<u64> = result.attempts.iter().map(|a| a.delay_ms).collect();
        assert_eq!(delays, vec![0, 100, 200, 400]);
        assert_eq!(result.status, UnitStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_reply_is_repaired_not_retried() {
        let service = Scripted::new(vec![Ok(
            "```json\n[{\"session_code\": \"PFL750\", \"title\": \"Battery Aging\",}]\n```",
        )]);
        let config = ExtractionConfig::default();
        let result = Dispatcher::new(&service, &config).dispatch(&unit(None)).await;
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.status, UnitStatus::Repaired);
        assert_eq!(result.records.len(), 1);
        assert!(result.raw.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn unrecoverable_reply_yields_no_records() {
        let service = Scripted::new(vec![Ok("{{{{ ::: nothing useful")]);
        let config = ExtractionConfig::default();
        let result = Dispatcher::new(&service, &config).dispatch(&unit(None)).await;
        assert_eq!(result.status, UnitStatus::Unrecoverable);
        assert!(result.records.is_empty());
        assert!(result.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn carried_overview_goes_into_context() {
        let service = Scripted::new(vec![Ok(GOOD)]);
        let config = ExtractionConfig::default();
        Dispatcher::new(&service, &config)
            .dispatch(&unit(Some("This session covers battery aging.")))
            .await;
        let seen = service.seen.lock().unwrap();
        let context = seen[0].context.as_deref().unwrap();
        assert!(context.contains("PFL750"));
        assert!(context.contains("This session covers battery aging."));
        assert!(seen[0].user.contains("Session Code PFL750"));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_code_is_accepted_for_single_session_unit() {
        let reply = r#"[{"title": "Battery Aging", "paper_no": "2025-01-0001"}]"#;
        let service = Scripted::new(vec![Ok(reply)]);
        let config = ExtractionConfig::default();
        let result = Dispatcher::new(&service, &config).dispatch(&unit(None)).await;
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.dropped, 0);

        let mut shared = unit(None);
        shared.session_ids.push("PFL760".into());
        let service = Scripted::new(vec![Ok(reply)]);
        let result = Dispatcher::new(&service, &config).dispatch(&shared).await;
        assert!(result.records.is_empty());
        assert_eq!(result.dropped, 1);
    }

    #[test]
    fn custom_system_prompt_is_used() {
        let service = Scripted::new(vec![]);
        let config = ExtractionConfig::builder()
            .system_prompt("Extract sessions.")
            .build()
            .unwrap();
        let request = Dispatcher::new(&service, &config).build_request(&unit(None), None);
        assert_eq!(request.system, "Extract sessions.");
        assert!(request.context.is_none());
    }
}
