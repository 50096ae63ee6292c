//! CLI binary for edgequake-sessions.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `ExtractionConfig` and writes the extracted records as JSON.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_sessions::pipeline::input::{load_document, output_path_for};
use edgequake_sessions::{
    extract, inspect, write_json, Backoff, Document, ExtractionConfig, ExtractionOutput,
    ExtractionProgressCallback, ProgressCallback,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: a live bar plus one log line per unit.
///
/// Units may complete out of order when `--concurrency` is above 1.
struct CliProgressCallback {
    bar: ProgressBar,
    label: String,
    start_times: Mutex<HashMap<usize, Instant>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    /// The bar length is set by `on_extraction_start`, once units are known.
    fn new(label: &str) -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message(format!("Segmenting {label}…"));
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            label: label.to_string(),
            start_times: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} units  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Extracting");
        self.bar.reset_eta();
    }

    fn elapsed_secs(&self, unit: usize) -> f64 {
        self.start_times
            .lock()
            .ok()
            .and_then(|mut m| m.remove(&unit))
            .map(|t| t.elapsed().as_millis() as f64 / 1000.0)
            .unwrap_or(0.0)
    }
}

impl ExtractionProgressCallback for CliProgressCallback {
    fn on_extraction_start(&self, total_units: usize) {
        self.activate_bar(total_units);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("{}: dispatching {total_units} units…", self.label))
        ));
    }

    fn on_unit_start(&self, unit: usize, _total_units: usize) {
        if let Ok(mut m) = self.start_times.lock() {
            m.insert(unit, Instant::now());
        }
        self.bar.set_message(format!("unit {}", unit + 1));
    }

    fn on_unit_complete(&self, unit: usize, total_units: usize, records: usize) {
        let secs = self.elapsed_secs(unit);
        self.bar.println(format!(
            "  {} Unit {:>3}/{:<3}  {:<12}  {}",
            green("✓"),
            unit + 1,
            total_units,
            dim(&format!("{records:>4} records")),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_unit_error(&self, unit: usize, total_units: usize, error: &str) {
        let secs = self.elapsed_secs(unit);
        self.errors.fetch_add(1, Ordering::SeqCst);

        let msg: String = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };

        self.bar.println(format!(
            "  {} Unit {:>3}/{:<3}  {}  {}",
            red("✗"),
            unit + 1,
            total_units,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_extraction_complete(&self, total_units: usize, records: usize) {
        let failed = self.errors.load(Ordering::SeqCst);
        self.bar.finish_and_clear();

        if failed == 0 {
            eprintln!(
                "{} {} units, {} records",
                green("✔"),
                bold(&total_units.to_string()),
                bold(&records.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} units failed, {} records",
                if failed == total_units {
                    red("✘")
                } else {
                    cyan("⚠")
                },
                red(&failed.to_string()),
                total_units,
                bold(&records.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Records to stdout as JSON
  sessions wcx2025.txt

  # Write records to a file
  sessions wcx2025.txt -o wcx2025.json

  # Several programs into a directory (one <stem>.json each)
  sessions wcx2024.txt wcx2025.txt -o out/

  # Full report: records, per-unit attempts, stats
  sessions --report wcx2025.txt -o report.json

  # Show spans and units without calling any model (no API key needed)
  sessions --inspect-only wcx2025.txt

  # Debug run: only the first 3 units, smaller chunks
  sessions --unit-limit 3 --max-chars 2000 wcx2025.txt

  # Parallel dispatch with exponential backoff
  sessions --concurrency 4 --exponential-backoff wcx2025.txt -o out/

INPUT:
  Plain UTF-8 text produced from the program PDF (e.g. `pdftotext -layout`).
  PDF files are rejected; convert them to text first.

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  RUST_LOG                Override log filter (e.g. edgequake_sessions=debug)
"#;

/// Extract session records from conference-program text using LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "sessions",
    version,
    about = "Extract session records from conference-program text using LLMs",
    long_about = "Split conference-program text into sessions, send each chunk to an LLM and \
collect the replies into deduplicated JSON records (session code, title, overview, paper \
number, authors and affiliations). Supports OpenAI, Anthropic, Google Gemini, Azure OpenAI, \
and any OpenAI-compatible endpoint (Ollama, vLLM, LiteLLM, etc.).",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local text files or HTTP/HTTPS URLs.
    #[arg(required = true, num_args = 1..)]
    inputs: Vec<String>,

    /// Output file (single input) or directory (one `<stem>.json` per input).
    #[arg(short, long, env = "SESSIONS_OUTPUT")]
    output: Option<PathBuf>,

    /// Write the full extraction report instead of the record list.
    #[arg(long, env = "SESSIONS_REPORT")]
    report: bool,

    /// Segment and chunk only; print spans and units, no model calls.
    #[arg(long)]
    inspect_only: bool,

    /// Character budget per unit (500–20000).
    #[arg(long, env = "SESSIONS_MAX_CHARS", default_value_t = 4000,
          value_parser = clap::value_parser!(u64).range(500..=20000))]
    max_chars: u64,

    /// Retries per unit after the first attempt.
    #[arg(long, env = "SESSIONS_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Delay before each retry in milliseconds.
    #[arg(long, env = "SESSIONS_RETRY_DELAY_MS", default_value_t = 2000)]
    retry_delay_ms: u64,

    /// Double the retry delay after each failed attempt.
    #[arg(long, env = "SESSIONS_EXPONENTIAL_BACKOFF")]
    exponential_backoff: bool,

    /// Per-call LLM timeout in seconds.
    #[arg(long, env = "SESSIONS_API_TIMEOUT", default_value_t = 60,
          value_parser = clap::value_parser!(u64).range(1..))]
    api_timeout: u64,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "SESSIONS_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Number of units dispatched at once (1 = sequential).
    #[arg(short, long, env = "SESSIONS_CONCURRENCY", default_value_t = 1)]
    concurrency: usize,

    /// Only dispatch the first N units of each document.
    #[arg(long, env = "SESSIONS_UNIT_LIMIT")]
    unit_limit: Option<usize>,

    /// LLM model ID (e.g. gpt-4.1-nano, gpt-4.1-mini, claude-sonnet-4-20250514).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(
        long,
        env = "EDGEQUAKE_PROVIDER",
        long_help = "LLM provider. Auto-detected from API key env vars if not set.\n\
          Supported: openai, anthropic, gemini, azure, ollama, or any OpenAI-compatible URL."
    )]
    provider: Option<String>,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "SESSIONS_TEMPERATURE", default_value_t = 0.0)]
    temperature: f32,

    /// Max LLM output tokens per unit.
    #[arg(long, env = "SESSIONS_MAX_TOKENS", default_value_t = 4000)]
    max_tokens: usize,

    /// Path to a text file containing a custom system prompt.
    #[arg(long, env = "SESSIONS_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Disable progress bar.
    #[arg(long, env = "SESSIONS_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "SESSIONS_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "SESSIONS_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs; --verbose always wins.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.inspect_only;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let system_prompt = match cli.system_prompt {
        Some(ref path) => Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read system prompt from {:?}", path))?,
        ),
        None => None,
    };

    let to_dir = cli.inputs.len() > 1
        || cli
            .output
            .as_deref()
            .is_some_and(|p| p.is_dir() || p.extension().is_none());

    let mut failures = 0usize;
    for input in &cli.inputs {
        if let Err(e) = run_one(&cli, input, system_prompt.as_deref(), to_dir, show_progress).await {
            failures += 1;
            eprintln!("{} {}: {:#}", red("✘"), input, e);
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures}/{} inputs failed", cli.inputs.len());
    }
    Ok(())
}

/// Load, extract and write one input.
async fn run_one(
    cli: &Cli,
    input: &str,
    system_prompt: Option<&str>,
    to_dir: bool,
    show_progress: bool,
) -> Result<()> {
    let document = load_document(input, cli.download_timeout)
        .await
        .with_context(|| format!("Failed to load {input}"))?;

    let progress: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new(document.id()) as Arc<dyn ExtractionProgressCallback>)
    } else {
        None
    };
    let config = build_config(cli, system_prompt, progress)?;

    // ── Inspect-only mode ────────────────────────────────────────────────
    if cli.inspect_only {
        let inspection = inspect(&document, &config).context("Failed to inspect document")?;
        if let Some(path) = destination(cli, &document, to_dir) {
            write_json(&path, &inspection).await?;
        } else {
            print_inspection(input, &inspection);
        }
        return Ok(());
    }

    // ── Run extraction ───────────────────────────────────────────────────
    let output = extract(&document, &config)
        .await
        .context("Extraction failed")?;

    match destination(cli, &document, to_dir) {
        Some(path) => {
            write_output(cli, &path, &output).await?;
            if !cli.quiet {
                print_summary(&output, Some(&path));
            }
        }
        None => {
            let json = if cli.report {
                serde_json::to_string_pretty(&output)
            } else {
                serde_json::to_string_pretty(&output.records)
            }
            .context("Failed to serialise output")?;
            println!("{json}");
            if !cli.quiet {
                print_summary(&output, None);
            }
        }
    }
    Ok(())
}

/// Where to write the result for `document`, or `None` for stdout.
fn destination(cli: &Cli, document: &Document, to_dir: bool) -> Option<PathBuf> {
    let out = cli.output.as_deref()?;
    if to_dir {
        Some(output_path_for(out, document.id()))
    } else {
        Some(out.to_path_buf())
    }
}

async fn write_output(cli: &Cli, path: &Path, output: &ExtractionOutput) -> Result<()> {
    if cli.report {
        write_json(path, output).await?;
    } else {
        write_json(path, &output.records).await?;
    }
    Ok(())
}

fn print_summary(output: &ExtractionOutput, path: Option<&Path>) {
    let s = &output.stats;
    let target = path
        .map(|p| format!("  →  {}", bold(&p.display().to_string())))
        .unwrap_or_default();
    eprintln!(
        "{}  {}  {}/{} units  {} records  {}ms{}",
        if s.units_fatal == 0 {
            green("✔")
        } else {
            cyan("⚠")
        },
        output.metadata.source,
        s.units_dispatched - s.units_fatal,
        s.units_dispatched,
        s.records_after_dedup,
        s.total_duration_ms,
        target,
    );
    eprintln!(
        "   {} tokens in  /  {} tokens out  —  {} duplicates, {} invalid",
        dim(&s.total_input_tokens.to_string()),
        dim(&s.total_output_tokens.to_string()),
        s.duplicates_dropped,
        s.records_invalid,
    );
}

fn print_inspection(input: &str, inspection: &edgequake_sessions::Inspection) {
    let m = &inspection.metadata;
    println!("File:         {}", input);
    if let Some(year) = m.year {
        println!("Year:         {}", year);
    }
    println!("Characters:   {}", m.char_count);
    println!("Sessions:     {}", m.span_count);
    println!("Unresolved:   {}", m.unresolved_markers);
    println!("Furniture:    {} lines removed", m.furniture_removed);
    println!("Units:        {}", inspection.units.len());
    for unit in &inspection.units {
        println!(
            "  #{:<4} {:>6} chars  {:?}  {}",
            unit.index,
            unit.char_len(),
            unit.origin,
            unit.session_ids.join(", ")
        );
    }
    for u in &inspection.unresolved {
        println!(
            "  {} {} at offset {}{}",
            red("unresolved"),
            u.session_id,
            u.offset,
            u.rejected_line
                .as_deref()
                .map(|l| format!(" (rejected: {l:?})"))
                .unwrap_or_default()
        );
    }
}

/// Map CLI args to `ExtractionConfig`.
fn build_config(
    cli: &Cli,
    system_prompt: Option<&str>,
    progress: Option<ProgressCallback>,
) -> Result<ExtractionConfig> {
    let mut builder = ExtractionConfig::builder()
        .max_chars(cli.max_chars as usize)
        .max_retries(cli.max_retries)
        .retry_backoff_ms(cli.retry_delay_ms)
        .backoff(if cli.exponential_backoff {
            Backoff::Exponential
        } else {
            Backoff::Fixed
        })
        .api_timeout_secs(cli.api_timeout)
        .download_timeout_secs(cli.download_timeout)
        .concurrency(cli.concurrency)
        .temperature(cli.temperature)
        .max_tokens(cli.max_tokens);

    if let Some(n) = cli.unit_limit {
        builder = builder.unit_limit(n);
    }
    if let Some(ref model) = cli.model {
        builder = builder.model(model.clone());
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider.clone());
    }
    if let Some(prompt) = system_prompt {
        builder = builder.system_prompt(prompt);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}
