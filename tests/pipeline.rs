//! Whole-pipeline tests driven by in-process fake services.
//!
//! No network access and no API keys: every test implements
//! [`ExtractionService`] directly. Retry and timeout scenarios run on a
//! paused tokio clock so they finish instantly.

use edgequake_sessions::pipeline::input::load_document;
use edgequake_sessions::pipeline::repair::{repair_json, RepairStep};
use edgequake_sessions::{
    extract_batch_with, extract_stream_with, extract_with, inspect, write_json, Document,
    ExtractError, ExtractionConfig, ExtractionProgressCallback, ExtractionRequest,
    ExtractionService, Field, ServiceError, ServiceReply, SessionRecord, UnitError, UnitOrigin,
    UnitStatus, NO_DATA,
};
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

/// Route library logs to the test harness (`RUST_LOG=debug cargo test`).
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ── Fake services ────────────────────────────────────────────────────────────

/// Replies with whatever the closure returns and records every request.
struct FnService<F> {
    reply: F,
    requests: Mutex<Vec<ExtractionRequest>>,
}

impl<F> FnService<F>
where
    F: Fn(&ExtractionRequest) -> String + Send + Sync,
{
    fn new(reply: F) -> Self {
        Self {
            reply,
            requests: Mutex::new(Vec::new()),
        }
    }

    fn requests(&self) -> Vec<ExtractionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl<F> ExtractionService for FnService<F>
where
    F: Fn(&ExtractionRequest) -> String + Send + Sync,
{
    async fn complete(&self, request: &ExtractionRequest) -> Result<ServiceReply, ServiceError> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(ServiceReply {
            content: (self.reply)(request),
            input_tokens: 50,
            output_tokens: 10,
        })
    }
}

/// Never answers.
struct Hanging {
    calls: AtomicUsize,
}

impl ExtractionService for Hanging {
    async fn complete(&self, _request: &ExtractionRequest) -> Result<ServiceReply, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

// ── Fixtures ─────────────────────────────────────────────────────────────────

const PANEL_OVERVIEW: &str = "Experts debate the future of vehicle autonomy.";

fn panel_program() -> Document {
    Document::new(
        "panel.txt",
        format!(
            "Panel Discussion: X\nSession Code ABC123\nRoom 1\n{PANEL_OVERVIEW}\nOrganizers - Jane Doe, Acme\n"
        ),
    )
}

/// One session long enough to be split at a 500-character budget.
fn long_session() -> Document {
    let mut text = String::from(
        "Battery Safety Technologies\n\
         Session Code BAT200\n\
         Room 5\n\
         This session covers thermal runaway detection and mitigation.\n\
         Organizers - Ann Lee, Volt Labs\n\
         Time Paper No. Title\n",
    );
    for i in 0..20 {
        text.push_str(&format!(
            "9:{i:02} a.m. 2025-01-{i:04} Paper number {i} on cell chemistry and pack design.\n"
        ));
    }
    Document::new("battery.txt", text)
}

fn small_config() -> ExtractionConfig {
    ExtractionConfig::builder().max_chars(500).build().unwrap()
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn single_session_yields_one_record() {
    let service = FnService::new(|_req: &ExtractionRequest| {
        format!(
            r#"[{{"session_code": "ABC123", "title": "Panel Discussion: X", "overview": "{PANEL_OVERVIEW}", "organizers": "Jane Doe, Acme"}}]"#
        )
    });
    let out = extract_with(&service, &panel_program(), &ExtractionConfig::default())
        .await
        .unwrap();

    assert_eq!(out.records.len(), 1);
    let r = &out.records[0];
    assert_eq!(r.session_code, "ABC123");
    assert_eq!(r.overview, PANEL_OVERVIEW);
    assert_eq!(r.organizers, "Jane Doe, Acme");
    assert_eq!(r.paper_no, NO_DATA);
    assert_eq!(r.source, "panel.txt");

    let requests = service.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].user.contains(PANEL_OVERVIEW));
    assert!(requests[0].user.contains("Organizers - Jane Doe, Acme"));
    assert_eq!(out.units[0].status, UnitStatus::Success);
}

#[test]
fn trailing_comma_reply_is_repaired() {
    let repaired = repair_json(r#"[{"a":1,}]"#).unwrap();
    assert_eq!(repaired.values.len(), 1);
    assert_eq!(repaired.values[0]["a"], 1);
    assert_ne!(repaired.step, RepairStep::Strict);
}

#[test]
fn bare_object_reply_is_wrapped() {
    let repaired = repair_json(r#"{"session_code":"X"}"#).unwrap();
    assert_eq!(repaired.values.len(), 1);
    assert_eq!(repaired.values[0]["session_code"], "X");
    assert_eq!(repaired.step, RepairStep::WrapRoot);
}

#[tokio::test]
async fn bare_object_reply_becomes_record_through_pipeline() {
    let service = FnService::new(|_req: &ExtractionRequest| r#"{"session_code":"X"}"#.to_string());
    let config = ExtractionConfig::builder()
        .required_fields(vec![Field::SessionCode])
        .build()
        .unwrap();
    let out = extract_with(&service, &panel_program(), &config).await.unwrap();
    assert_eq!(out.records.len(), 1);
    assert_eq!(out.records[0].session_code, "X");
    assert_eq!(out.units[0].status, UnitStatus::Repaired);
    assert_eq!(out.units[0].attempt_count(), 1);
}

#[tokio::test]
async fn reply_without_session_code_inherits_the_units_session() {
    let service = FnService::new(|_req: &ExtractionRequest| {
        r#"[{"title": "Panel Discussion: X", "organizers": "Jane Doe, Acme"}]"#.to_string()
    });
    let out = extract_with(&service, &panel_program(), &ExtractionConfig::default())
        .await
        .unwrap();
    assert_eq!(out.records.len(), 1);
    assert_eq!(out.records[0].session_code, "ABC123");
    assert_eq!(out.stats.records_invalid, 0);
}

#[tokio::test(start_paused = true)]
async fn unit_timing_out_five_times_is_fatal_without_raising() {
    init_tracing();
    let service = Hanging {
        calls: AtomicUsize::new(0),
    };
    let config = ExtractionConfig::builder()
        .max_retries(4)
        .api_timeout_secs(5)
        .retry_backoff_ms(100)
        .build()
        .unwrap();

    let out = extract_with(&service, &panel_program(), &config).await.unwrap();

    assert_eq!(service.calls.load(Ordering::SeqCst), 5);
    assert!(out.records.is_empty());
    let unit = &out.units[0];
    assert_eq!(unit.status, UnitStatus::Fatal);
    assert_eq!(unit.attempt_count(), 5);
    assert!(matches!(
        unit.error,
        Some(UnitError::Timeout { attempts: 5, .. })
    ));
    assert_eq!(out.stats.units_fatal, 1);

    match out.into_result() {
        Err(ExtractError::PartialFailure {
            success,
            failed,
            total,
        }) => {
            assert_eq!((success, failed, total), (0, 1, 1));
        }
        other => panic!("expected PartialFailure, got {other:?}"),
    }
}

// ── Aggregation across units ─────────────────────────────────────────────────

#[tokio::test]
async fn duplicate_records_across_units_are_kept_once() {
    let mut text = String::new();
    for i in 0..12 {
        text.push_str(&format!(
            "Session Title {i}\nSession Code S{i:03}\nRoom 1\nThis session covers topic {i} in detail.\n\n"
        ));
    }
    let document = Document::new("prog.txt", text);
    let service = FnService::new(|_req: &ExtractionRequest| {
        r#"[{"session_code": "S000", "paper_no": "2025-01-0001", "title": "Shared paper"}]"#
            .to_string()
    });

    let out = extract_with(&service, &document, &small_config()).await.unwrap();
    let units = out.stats.units_dispatched;
    assert!(units > 1);
    assert_eq!(out.records.len(), 1);
    assert_eq!(out.stats.records_before_dedup, units);
    assert_eq!(out.stats.duplicates_dropped, units - 1);
}

#[tokio::test]
async fn split_session_records_share_code_and_overview() {
    init_tracing();
    let document = long_session();
    let inspection = inspect(&document, &small_config()).unwrap();
    assert!(inspection.units.len() > 1);
    assert!(inspection
        .units
        .iter()
        .all(|u| matches!(u.origin, UnitOrigin::SplitSpan { .. }) && u.session_ids == ["BAT200"]));

    let counter = AtomicUsize::new(0);
    let service = FnService::new(move |_req: &ExtractionRequest| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        format!(r#"[{{"session_code": "", "paper_no": "2025-01-{n:04}", "title": "Paper {n}", "overview": ""}}]"#)
    });
    let out = extract_with(&service, &document, &small_config()).await.unwrap();

    assert_eq!(out.records.len(), inspection.units.len());
    let overview = "This session covers thermal runaway detection and mitigation.";
    for (i, record) in out.records.iter().enumerate() {
        assert_eq!(record.session_code, "BAT200");
        if i > 0 {
            assert_eq!(record.overview, overview);
        }
    }

    let requests = service.requests();
    assert!(requests[0].context.is_none());
    assert!(requests[1..]
        .iter()
        .all(|r| r.context.as_deref().is_some_and(|c| c.contains(overview))));
}

// ── Progress, streaming, batch ───────────────────────────────────────────────

#[derive(Default)]
struct Events {
    started: AtomicUsize,
    completed: AtomicUsize,
    finished_records: AtomicUsize,
}

impl ExtractionProgressCallback for Events {
    fn on_unit_start(&self, _unit: usize, _total: usize) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }
    fn on_unit_complete(&self, _unit: usize, _total: usize, _records: usize) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
    fn on_extraction_complete(&self, _total: usize, records: usize) {
        self.finished_records.store(records, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn progress_callback_sees_every_unit() {
    let events = Arc::new(Events::default());
    let config = ExtractionConfig::builder()
        .max_chars(500)
        .concurrency(3)
        .progress_callback(events.clone())
        .build()
        .unwrap();
    let service = FnService::new(|_req: &ExtractionRequest| {
        r#"[{"session_code": "BAT200", "title": "T"}]"#.to_string()
    });

    let out = extract_with(&service, &long_session(), &config).await.unwrap();
    let n = out.stats.units_dispatched;
    assert_eq!(events.started.load(Ordering::SeqCst), n);
    assert_eq!(events.completed.load(Ordering::SeqCst), n);
    assert_eq!(events.finished_records.load(Ordering::SeqCst), out.records.len());
}

#[tokio::test]
async fn stream_can_be_abandoned_after_first_unit() {
    let service = Arc::new(FnService::new(|_req: &ExtractionRequest| {
        r#"[{"session_code": "BAT200", "paper_no": "1", "title": "T"}]"#.to_string()
    }));
    let mut stream =
        extract_stream_with(Arc::clone(&service), &long_session(), &small_config()).unwrap();
    let first = stream.next().await.unwrap();
    drop(stream);

    assert_eq!(first.records.len(), 1);
    assert_eq!(service.requests().len(), 1);
}

#[tokio::test]
async fn batch_processes_every_document_in_order() {
    let service = FnService::new(|_req: &ExtractionRequest| {
        r#"[{"session_code": "ABC123", "title": "Panel Discussion: X"}]"#.to_string()
    });
    let documents = vec![
        panel_program(),
        Document::new("empty.txt", ""),
        long_session(),
    ];
    let outputs = extract_batch_with(&service, &documents, &small_config()).await;

    assert_eq!(outputs.len(), 3);
    let sources: Vec<String> = outputs
        .iter()
        .map(|o| o.as_ref().unwrap().metadata.source.clone())
        .collect();
    assert_eq!(sources, ["panel.txt", "empty.txt", "battery.txt"]);
    assert!(outputs[1].as_ref().unwrap().records.is_empty());
}

// ── File I/O ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn records_round_trip_through_json_file() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("wcx2025.txt");
    std::fs::write(&input, panel_program().text()).unwrap();

    let document = load_document(input.to_str().unwrap(), 5).await.unwrap();
    assert_eq!(document.detect_year(), None);

    let service = FnService::new(|_req: &ExtractionRequest| {
        r#"[{"Session Code": "ABC123", "Title": "Panel Discussion: X", "Abstract": "Autonomy."}]"#
            .to_string()
    });
    let out = extract_with(&service, &document, &ExtractionConfig::default())
        .await
        .unwrap();

    let path = dir.path().join("out").join("wcx2025.json");
    write_json(&path, &out.records).await.unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    let records: Vec<SessionRecord> = serde_json::from_str(&text).unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].overview, "Autonomy.");
    assert_eq!(records[0].source, "wcx2025.txt");
}

#[tokio::test]
async fn pdf_input_is_rejected_before_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("program.pdf");
    std::fs::write(&input, b"%PDF-1.7\n%\xe2\xe3\xcf\xd3\n").unwrap();
    let err = load_document(input.to_str().unwrap(), 5).await.unwrap_err();
    assert!(matches!(err, ExtractError::NotText { .. }));
}

#[test]
fn blocking_callers_can_drive_the_pipeline() {
    let service = FnService::new(|_req: &ExtractionRequest| {
        r#"[{"session_code": "ABC123", "title": "Panel Discussion: X"}]"#.to_string()
    });
    let out = tokio_test::block_on(extract_with(
        &service,
        &panel_program(),
        &ExtractionConfig::default(),
    ))
    .unwrap();
    assert_eq!(out.records.len(), 1);
}
