//! CLI binary for docpipe.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `PipelineConfig`, writes the requested export and, with `--serve`, runs
//! the HTTP conversion service.

use anyhow::{Context, Result};
use clap::Parser;
use docpipe::export::package::{build_archive, persist, AggregateResponse};
use docpipe::server::{serve, AppState};
use docpipe::{
    document_markdown, inspect, Accelerator, ConversionProgressCallback, Converter, FaultPolicy,
    OcrPolicy, PageSelection, PageSeparator, PipelineConfig, PipelineConfigBuilder,
    ProgressCallback, StageKind,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

// ── Terminal styling ─────────────────────────────────────────────────────────

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

/// Terminal progress callback: a live progress bar plus one log line per
/// assembled page. Pages arrive in completion order, so the elapsed column
/// is time since the conversion started.
struct CliProgressCallback {
    bar: ProgressBar,
    started: Instant,
}

impl CliProgressCallback {
    /// Spinner until `on_conversion_start` tells us the page count.
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);

        bar.set_style(spinner_style);
        bar.set_prefix("Rasterizing");
        bar.set_message("waiting for the first page");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            started: Instant::now(),
        })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold} [{bar:40.cyan/238}] {pos}/{len} assembled  {elapsed}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Pipeline");
        self.bar.set_message("");
        self.bar.reset_eta();
    }

    fn elapsed(&self) -> String {
        dim(&format!("{:.1}s", self.started.elapsed().as_secs_f64()))
    }
}

impl ConversionProgressCallback for CliProgressCallback {
    fn on_conversion_start(&self, total_pages: usize) {
        self.activate_bar(total_pages);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Starting conversion of {total_pages} pages…"))
        ));
    }

    fn on_batch_complete(&self, stage: StageKind, batch_len: usize, elapsed_ms: u64) {
        self.bar
            .set_message(format!("{stage}: {batch_len} pages in {elapsed_ms}ms"));
    }

    fn on_page_complete(&self, page_num: usize, total: usize, markdown_len: usize) {
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {:<8}  {}",
            green("✓"),
            page_num,
            total,
            dim(&format!("{markdown_len:>5} chars")),
            self.elapsed(),
        ));
        self.bar.inc(1);
    }

    fn on_page_error(&self, page_num: usize, total: usize, error: &str) {
        let msg = match error.char_indices().nth(79) {
            Some((cut, _)) => format!("{}\u{2026}", &error[..cut]),
            None => error.to_string(),
        };

        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}  {}",
            red("✗"),
            page_num,
            total,
            red(&msg),
            self.elapsed(),
        ));
        self.bar.inc(1);
    }

    fn on_conversion_complete(&self, total_pages: usize, success_count: usize) {
        let failed = total_pages.saturating_sub(success_count);
        self.bar.finish_and_clear();

        if failed == 0 {
            eprintln!(
                "{} {} pages converted successfully",
                green("✔"),
                bold(&success_count.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} pages converted  ({} faulted)",
                if failed == total_pages {
                    red("✘")
                } else {
                    cyan("⚠")
                },
                bold(&success_count.to_string()),
                total_pages,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Whole-document Markdown (stdout)
  docpipe document.pdf

  # Markdown to a file, pages 1-5, page comments between pages
  docpipe --pages 1-5 --separator comment paper.pdf -o paper.md

  # Per-page JSON with base64 page images
  docpipe --profile archive --json document.pdf > pages.json

  # ZIP of <n>.md + <n>.jpeg per page
  docpipe --archive result.zip document.pdf

  # page_<n>.md + page_<n>.png under a fresh directory
  docpipe --persist ./results document.pdf

  # Scanned document through the vision-LLM OCR stage
  docpipe --ocr-policy force --model gpt-4.1-mini scan.pdf -o scan.md

  # Inspect PDF metadata
  docpipe --inspect-only document.pdf

  # HTTP service (POST /convert?mode=archive|json|persist|markdown)
  docpipe --serve 0.0.0.0:8000 --results-root ./results

PROFILES:
  Profile    Images  Layout batch  OCR batch  Table batch
  ─────────  ──────  ────────────  ─────────  ───────────
  archive    on      64            4          4
  markdown   off     8             1          1

  OCR is off in both profiles unless --ocr-policy is given.

ENVIRONMENT:
  Every flag has a DOCPIPE_* variable (DOCPIPE_PAGES, DOCPIPE_DEVICE, ...).
  The OCR stage resolves its provider from --provider/--model, then
  EDGEQUAKE_LLM_PROVIDER + EDGEQUAKE_MODEL, then the provider API keys.
  pdfium is loaded from the binary's directory or the system library path.
"#;

/// Convert PDF documents through a batched layout, OCR and table pipeline.
#[derive(Parser, Debug)]
#[command(
    name = "docpipe",
    version,
    about = "Convert PDF files and URLs to per-page Markdown, images and tables",
    long_about = "Convert PDF documents (local files or URLs) through a batched multi-stage \
pipeline: rasterization, layout analysis, optional vision-LLM OCR and table structure \
recognition. Exports whole-document Markdown, per-page JSON, a ZIP archive or a result \
directory, or serves the same conversions over HTTP.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF file path or HTTP/HTTPS URL.
    #[arg(required_unless_present = "serve")]
    input: Option<String>,

    /// Write Markdown to this file instead of stdout.
    #[arg(short, long, env = "DOCPIPE_OUTPUT")]
    output: Option<PathBuf>,

    /// Stage settings preset: archive or markdown.
    #[arg(long, env = "DOCPIPE_PROFILE", value_enum, default_value = "markdown")]
    profile: ProfileArg,

    /// Page selection: all, 5, 3-15, or 1,3,5,7.
    #[arg(long, env = "DOCPIPE_PAGES", default_value = "all")]
    pages: String,

    /// Page separator: none, hr, comment, or custom string.
    #[arg(long, env = "DOCPIPE_SEPARATOR", default_value = "none")]
    separator: String,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "DOCPIPE_PASSWORD")]
    password: Option<String>,

    /// Raster scale relative to 72 DPI (0.25–8.0).
    #[arg(long, env = "DOCPIPE_IMAGES_SCALE")]
    images_scale: Option<f32>,

    /// Run the OCR stage: auto (pages without text) or force (every page).
    #[arg(long, env = "DOCPIPE_OCR_POLICY", value_enum)]
    ocr_policy: Option<OcrPolicyArg>,

    /// What happens after a stage faults on a page.
    #[arg(long, env = "DOCPIPE_FAULT_POLICY", value_enum, default_value = "propagate")]
    fault_policy: FaultPolicyArg,

    /// Accelerator: "cpu" or a device name such as "cuda".
    #[arg(long, env = "DOCPIPE_DEVICE")]
    device: Option<String>,

    /// OCR model ID (e.g. gpt-4.1-nano, gpt-4.1, claude-sonnet-4-20250514).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// OCR provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_LLM_PROVIDER")]
    provider: Option<String>,

    /// Dispatch timeout per stage batch, in seconds.
    #[arg(long, env = "DOCPIPE_STAGE_TIMEOUT", default_value_t = 120)]
    stage_timeout: u64,

    /// Output per-page JSON instead of Markdown.
    #[arg(long, env = "DOCPIPE_JSON")]
    json: bool,

    /// Write a ZIP archive of per-page Markdown and JPEG images to this path.
    #[arg(long, conflicts_with_all = ["json", "persist"])]
    archive: Option<PathBuf>,

    /// Write page_<n>.md and page_<n>.png under a new directory in this root.
    #[arg(long, conflicts_with = "json")]
    persist: Option<PathBuf>,

    /// Print PDF metadata only, no conversion.
    #[arg(long)]
    inspect_only: bool,

    /// Serve the HTTP conversion API on this address instead of converting.
    #[arg(long, env = "DOCPIPE_SERVE", value_name = "ADDR")]
    serve: Option<String>,

    /// Root directory for `persist` requests when serving.
    #[arg(long, env = "DOCPIPE_RESULTS_ROOT", default_value = "results")]
    results_root: PathBuf,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "DOCPIPE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "DOCPIPE_QUIET")]
    quiet: bool,

    /// Disable progress bar.
    #[arg(long, env = "DOCPIPE_NO_PROGRESS")]
    no_progress: bool,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "DOCPIPE_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ProfileArg {
    Archive,
    Markdown,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum OcrPolicyArg {
    Auto,
    Force,
}

impl From<OcrPolicyArg> for OcrPolicy {
    fn from(v: OcrPolicyArg) -> Self {
        match v {
            OcrPolicyArg::Auto => OcrPolicy::Auto,
            OcrPolicyArg::Force => OcrPolicy::Force,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum FaultPolicyArg {
    Propagate,
    BestEffort,
}

impl From<FaultPolicyArg> for FaultPolicy {
    fn from(v: FaultPolicyArg) -> Self {
        match v {
            FaultPolicyArg::Propagate => FaultPolicy::PropagateFault,
            FaultPolicyArg::BestEffort => FaultPolicy::BestEffort,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO-level library logs on a terminal run.
    let show_progress = cli.serve.is_none()
        && !cli.inspect_only
        && !cli.quiet
        && !cli.no_progress
        && !cli.json;
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

    // ── Service mode ─────────────────────────────────────────────────────
    if let Some(ref addr) = cli.serve {
        let archive = Converter::new(
            apply_flags(PipelineConfig::archive(), &cli, None)?
                .build()
                .context("Invalid archive configuration")?,
        )
        .context("Failed to build archive converter")?;
        let markdown = Converter::new(
            apply_flags(PipelineConfig::markdown(), &cli, None)?
                .build()
                .context("Invalid markdown configuration")?,
        )
        .context("Failed to build markdown converter")?;

        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        eprintln!("{} Serving on {}", cyan("◆"), bold(addr));
        serve(listener, AppState::new(archive, markdown, &cli.results_root))
            .await
            .context("Server stopped")?;
        return Ok(());
    }

    let input = cli
        .input
        .clone()
        .context("An input file or URL is required")?;

    // ── Inspect-only mode ────────────────────────────────────────────────
    if cli.inspect_only {
        let meta = inspect(&input, cli.password.clone())
            .await
            .context("Failed to inspect PDF")?;

        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&meta).context("Failed to serialize metadata")?
            );
        } else {
            println!("File:         {}", input);
            if let Some(ref t) = meta.title {
                println!("Title:        {}", t);
            }
            if let Some(ref a) = meta.author {
                println!("Author:       {}", a);
            }
            if let Some(ref s) = meta.subject {
                println!("Subject:      {}", s);
            }
            println!("Pages:        {}", meta.page_count);
            println!("PDF Version:  {}", meta.pdf_version);
            if let Some(ref p) = meta.producer {
                println!("Producer:     {}", p);
            }
            if let Some(ref c) = meta.creator {
                println!("Creator:      {}", c);
            }
            if let Some(ref d) = meta.creation_date {
                println!("Created:      {}", d);
            }
        }
        return Ok(());
    }

    // ── Build config ─────────────────────────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new_dynamic() as Arc<dyn ConversionProgressCallback>)
    } else {
        None
    };

    let profile = match cli.profile {
        ProfileArg::Archive => PipelineConfig::archive(),
        ProfileArg::Markdown => PipelineConfig::markdown(),
    };
    // Image exports need the page bitmaps whatever the profile says.
    let needs_images = cli.archive.is_some() || cli.persist.is_some();
    let config = apply_flags(profile, &cli, progress_cb)?
        .generate_page_images(needs_images || matches!(cli.profile, ProfileArg::Archive))
        .build()
        .context("Invalid configuration")?;
    let separator = config.page_separator.clone();
    let include_images = config.generate_page_images;

    let converter = Converter::new(config).context("Failed to build converter")?;

    // ── Run conversion ───────────────────────────────────────────────────
    let started = Instant::now();
    let doc = converter.convert(&input).await.context("Conversion failed")?;
    let faulted = doc.faulted_pages().count();

    let destination = if let Some(ref path) = cli.archive {
        let bytes = build_archive(&doc).context("Failed to build archive")?;
        tokio::fs::write(path, bytes)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Some(path.display().to_string())
    } else if let Some(ref root) = cli.persist {
        let file_size = tokio::fs::metadata(&input).await.map(|m| m.len() as usize).unwrap_or(0);
        let (dir, _) = persist(&doc, file_size, root)
            .await
            .context("Failed to persist results")?;
        Some(dir.display().to_string())
    } else if cli.json {
        let file_size = tokio::fs::metadata(&input).await.map(|m| m.len() as usize).unwrap_or(0);
        let response = AggregateResponse::build(&doc, file_size, include_images)
            .context("Failed to build JSON output")?;
        let json = serde_json::to_string_pretty(&response).context("Failed to serialise output")?;
        println!("{json}");
        None
    } else {
        let markdown = document_markdown(&doc, &separator);
        if let Some(ref path) = cli.output {
            tokio::fs::write(path, markdown.as_bytes())
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            Some(path.display().to_string())
        } else {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            handle
                .write_all(markdown.as_bytes())
                .context("Failed to write to stdout")?;
            None
        }
    };

    // Summary (the callback already printed the per-page log).
    if !cli.quiet && !cli.json {
        let mark = if faulted == 0 { green("✔") } else { cyan("⚠") };
        let converted = doc.pages.len() - faulted;
        match destination {
            Some(dest) => eprintln!(
                "{}  {}/{} pages  {}ms  →  {}",
                mark,
                converted,
                doc.pages.len(),
                started.elapsed().as_millis(),
                bold(&dest),
            ),
            None if !show_progress => eprintln!(
                "Converted {}/{} pages in {}ms",
                converted,
                doc.pages.len(),
                started.elapsed().as_millis()
            ),
            None => {}
        }
    }

    Ok(())
}

/// Map the shared CLI flags onto a profile builder.
fn apply_flags(
    mut builder: PipelineConfigBuilder,
    cli: &Cli,
    progress: Option<ProgressCallback>,
) -> Result<PipelineConfigBuilder> {
    builder = builder
        .pages(parse_pages(&cli.pages)?)
        .page_separator(parse_separator(&cli.separator))
        .fault_policy(cli.fault_policy.into())
        .stage_timeout_secs(cli.stage_timeout)
        .download_timeout_secs(cli.download_timeout);

    if let Some(scale) = cli.images_scale {
        builder = builder.images_scale(scale);
    }
    if let Some(policy) = cli.ocr_policy {
        builder = builder
            .ocr_policy(policy.into())
            .enable(StageKind::Ocr, true);
    }
    if let Some(ref device) = cli.device {
        builder = builder.accelerator(parse_device(device));
    }
    if let Some(ref password) = cli.password {
        builder = builder.password(password);
    }
    if let Some(ref model) = cli.model {
        builder = builder.model(model);
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }
    Ok(builder)
}

fn parse_device(s: &str) -> Accelerator {
    match s.trim().to_lowercase().as_str() {
        "cpu" => Accelerator::Cpu,
        device => Accelerator::Device(device.to_string()),
    }
}

/// Parse `--pages` string into `PageSelection`.
fn parse_pages(s: &str) -> Result<PageSelection> {
    let s = s.trim().to_lowercase();

    if s == "all" {
        return Ok(PageSelection::All);
    }

    // Range: "3-15"
    if let Some((start, end)) = s.split_once('-') {
        let start: usize = start
            .trim()
            .parse()
            .context("Invalid start page in range")?;
        let end: usize = end.trim().parse().context("Invalid end page in range")?;

        if start < 1 {
            anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {})", start);
        }
        if start > end {
            anyhow::bail!(
                "Invalid page range '{}-{}': start must be <= end",
                start,
                end
            );
        }

        return Ok(PageSelection::Range(start, end));
    }

    // Set: "1,3,5,7"
    if s.contains(',') {
        let pages: Vec<usize> = s
            .split(',')
            .map(|p| {
                p.trim()
                    .parse::<usize>()
                    .with_context(|| format!("Invalid page number: '{}'", p.trim()))
            })
            .collect::<Result<Vec<_>>>()?;

        if let Some(&p) = pages.iter().find(|&&p| p < 1) {
            anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {})", p);
        }

        return Ok(PageSelection::Set(pages));
    }

    // Single page: "5"
    let page: usize = s.parse().context("Invalid page number")?;
    if page < 1 {
        anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {})", page);
    }

    Ok(PageSelection::Single(page))
}

/// Parse `--separator` string into `PageSeparator`.
fn parse_separator(s: &str) -> PageSeparator {
    match s.to_lowercase().as_str() {
        "none" => PageSeparator::None,
        "hr" | "---" => PageSeparator::HorizontalRule,
        "comment" => PageSeparator::Comment,
        _ => PageSeparator::Custom(s.to_string()),
    }
}
