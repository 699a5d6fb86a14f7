//! CLI binary for edgequake-examscan.
//!
//! A thin shim over the library crate: every subcommand opens the project
//! in a filesystem store, performs one operation, and exits.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use edgequake_examscan::{
    AnalysisRequest, BatchProgressCallback, BatchStatus, FileRasterizer, FsStore, InferenceService,
    PageError, PageStatus, Pipeline, PipelineConfig, ProgressCallback, Project, RubricCriterion,
    RunOutcome, VisionInference,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
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

/// Live progress bar plus one log line per page.
struct CliProgressCallback {
    bar: ProgressBar,
    page_started: Mutex<Option<Instant>>,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);
        bar.set_style(style);
        bar.set_prefix("Analysing");

        Arc::new(Self {
            bar,
            page_started: Mutex::new(None),
        })
    }

    fn elapsed_secs(&self) -> f64 {
        self.page_started
            .lock()
            .ok()
            .and_then(|mut g| g.take())
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl BatchProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.reset_eta();
        self.bar.enable_steady_tick(Duration::from_millis(80));
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Analysing {total} pending page(s)…"))
        ));
    }

    fn on_total_changed(&self, status: &BatchStatus) {
        self.bar.set_length(status.total as u64);
    }

    fn on_page_start(&self, page_id: &str, _status: &BatchStatus) {
        if let Ok(mut g) = self.page_started.lock() {
            *g = Some(Instant::now());
        }
        self.bar.set_message(page_id.to_string());
    }

    fn on_page_complete(&self, page_id: &str, derived: usize, status: &BatchStatus) {
        self.bar.println(format!(
            "  {} {:<34}  {}  {}",
            green("✓"),
            page_id,
            dim(&format!("{derived} page(s)")),
            dim(&format!("{:.1}s", self.elapsed_secs())),
        ));
        self.bar.set_position(status.completed as u64);
    }

    fn on_page_error(&self, page_id: &str, error: &PageError, status: &BatchStatus) {
        self.bar.println(format!(
            "  {} {:<34}  {}  {}",
            red("✗"),
            page_id,
            red(error.label()),
            dim(&format!("{:.1}s", self.elapsed_secs())),
        ));
        self.bar.set_position(status.completed as u64);
    }

    fn on_batch_complete(&self, status: &BatchStatus, stopped: bool) {
        self.bar.finish_and_clear();
        let ok = status.completed.saturating_sub(status.failed);
        let mark = if status.failed == 0 {
            green("✔")
        } else if ok == 0 {
            red("✘")
        } else {
            cyan("⚠")
        };
        eprintln!(
            "{} {}/{} page(s) analysed  ({} failed){}",
            mark,
            bold(&ok.to_string()),
            status.total,
            status.failed,
            if stopped { "  stopped" } else { "" }
        );
    }
}

/// Stand-in service for subcommands that never dispatch a page.
struct Offline;

#[async_trait]
impl InferenceService for Offline {
    async fn analyze(&self, _request: &AnalysisRequest) -> Result<String, PageError> {
        Err(PageError::AuthFailed {
            detail: "no provider configured for this command".into(),
        })
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Queue scans (PDF, PNG, JPEG, TXT, MD)
  examscan -p spring ingest scans/*.pdf

  # Set the rubric (JSON array of {taskNumber, subTask, description})
  examscan -p spring rubric rubric.json

  # Analyse every pending page (Ctrl-C stops after the current page)
  examscan -p spring run

  # Inspect and tidy up
  examscan -p spring status
  examscan -p spring merge unknown-scan2.pdf-4f1c 1042
  examscan -p spring reassign 4f1c0a_L 1042
  examscan -p spring retry --all
  examscan -p spring rescan 4f1c0a_R

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to libpdfium (directory or file)
"#;

/// Reconcile scanned exam pages into per-candidate records using Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "examscan",
    version,
    about = "Reconcile scanned exam pages into per-candidate records using Vision LLMs",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Project id.
    #[arg(short, long, env = "EXAMSCAN_PROJECT", default_value = "default")]
    project: String,

    /// Directory holding projects, media and the result cache.
    #[arg(long, env = "EXAMSCAN_DATA_DIR", default_value = ".examscan")]
    data_dir: PathBuf,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "EXAMSCAN_VERBOSE", global = true)]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "EXAMSCAN_QUIET", global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Rasterise files and add their pages to the pending pool.
    Ingest {
        files: Vec<PathBuf>,

        /// Longest edge of rendered PDF pages, in pixels.
        #[arg(long, env = "EXAMSCAN_MAX_PIXELS", default_value_t = 2000)]
        max_pixels: u32,

        /// PDF user password for encrypted documents.
        #[arg(long, env = "EXAMSCAN_PASSWORD")]
        password: Option<String>,
    },

    /// Set the rubric from a JSON file.
    Rubric { file: PathBuf },

    /// Analyse all pending pages.
    Run(RunArgs),

    /// Show candidates and the unprocessed pool.
    Status {
        /// Print the full project document as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Move failed pages back to pending.
    Retry {
        page_id: Option<String>,
        #[arg(long, conflicts_with = "page_id")]
        all: bool,
    },

    /// Re-analyse a page, bypassing the result cache.
    Rescan { page_id: String },

    /// Fold every page of one candidate into another.
    Merge { from: String, into: String },

    /// Move one page to another candidate.
    Reassign { page_id: String, candidate: String },

    /// Result cache administration.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
    /// Number of cached results.
    Count,
    /// Remove every cached result.
    Clear,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// LLM model ID (e.g. gpt-4.1-mini, claude-sonnet-4-20250514).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Path to a text file containing a custom system prompt.
    #[arg(long, env = "EXAMSCAN_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Max LLM output tokens per page.
    #[arg(long, env = "EXAMSCAN_MAX_TOKENS", default_value_t = 4096)]
    max_tokens: usize,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "EXAMSCAN_TEMPERATURE", default_value_t = 0.1)]
    temperature: f32,

    /// Retries per page on transient failures.
    #[arg(long, env = "EXAMSCAN_MAX_RETRIES", default_value_t = 2)]
    max_retries: u32,

    /// Stop the batch as soon as a page hits quota exhaustion.
    #[arg(long, env = "EXAMSCAN_STOP_ON_QUOTA")]
    stop_on_quota: bool,

    /// Warn when one analysis runs longer than this many seconds (0 = off).
    #[arg(long, env = "EXAMSCAN_SLOW_CALL_SECS", default_value_t = 60)]
    slow_call_secs: u64,

    /// Disable progress bar.
    #[arg(long, env = "EXAMSCAN_NO_PROGRESS")]
    no_progress: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs during `run`.
    let show_progress = matches!(cli.command, Command::Run(ref a) if !a.no_progress) && !cli.quiet;
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

    let store = Arc::new(
        FsStore::open(&cli.data_dir)
            .await
            .with_context(|| format!("Failed to open data directory {:?}", cli.data_dir))?,
    );

    if let Command::Run(ref args) = cli.command {
        let progress: Option<ProgressCallback> = if show_progress {
            Some(CliProgressCallback::new() as ProgressCallback)
        } else {
            None
        };
        let config = build_config(args, progress).await?;
        let inference = Arc::new(
            VisionInference::from_config(&config).context("Failed to set up LLM provider")?,
        );
        let pipeline = Pipeline::open(&cli.project, store, inference, config)
            .await
            .context("Failed to open project")?;

        let stopper = pipeline.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() && stopper.request_stop() {
                eprintln!("{}", dim("Stopping after the current page…"));
            }
        });

        match pipeline.run_batch().await {
            RunOutcome::AwaitingRubric => {
                bail!("No rubric set; run `examscan rubric <file>` first")
            }
            RunOutcome::AlreadyRunning => bail!("A batch is already running"),
            RunOutcome::Finished(status) | RunOutcome::Stopped(status) => {
                if !cli.quiet && !show_progress {
                    eprintln!(
                        "Analysed {}/{} page(s), {} failed",
                        status.completed, status.total, status.failed
                    );
                }
            }
        }
        return Ok(());
    }

    let pipeline = Pipeline::open(
        &cli.project,
        store,
        Arc::new(Offline),
        PipelineConfig::default(),
    )
    .await
    .context("Failed to open project")?;

    match cli.command {
        Command::Ingest {
            files,
            max_pixels,
            password,
        } => {
            if files.is_empty() {
                bail!("No input files given");
            }
            let mut builder = PipelineConfig::builder().max_rendered_pixels(max_pixels);
            if let Some(pwd) = password {
                builder = builder.pdf_password(pwd);
            }
            let config = builder.build().context("Invalid ingest options")?;
            let raster = FileRasterizer::from_config(&config);
            let mut total = 0;
            for file in &files {
                let ids = pipeline
                    .ingest_file(file, &raster)
                    .await
                    .with_context(|| format!("Failed to ingest {}", file.display()))?;
                if !cli.quiet {
                    eprintln!("{} {}  {}", green("✓"), file.display(), dim(&format!("{} page(s)", ids.len())));
                }
                total += ids.len();
            }
            if !cli.quiet {
                eprintln!("{} {} page(s) queued", cyan("◆"), bold(&total.to_string()));
            }
        }
        Command::Rubric { file } => {
            let raw = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read rubric from {:?}", file))?;
            let criteria: Vec<RubricCriterion> =
                serde_json::from_str(&raw).context("Rubric must be a JSON array of criteria")?;
            let n = criteria.len();
            pipeline.set_rubric(criteria).await?;
            if !cli.quiet {
                eprintln!("{} rubric set: {} criteria", green("✔"), n);
            }
        }
        Command::Status { json } => {
            let project = pipeline.snapshot().await;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&project).context("Failed to serialise project")?
                );
            } else {
                print_status(&project);
            }
        }
        Command::Retry { page_id, all } => {
            let n = match (page_id, all) {
                (Some(id), false) => usize::from(pipeline.retry_page(&id).await?),
                (None, true) => pipeline.retry_failed().await?,
                _ => bail!("Give a page id or --all"),
            };
            eprintln!("{} page(s) queued for retry", n);
        }
        Command::Rescan { page_id } => {
            pipeline.rescan_page(&page_id).await?;
            eprintln!("{} queued for rescan", page_id);
        }
        Command::Merge { from, into } => {
            let n = pipeline.merge_candidates(&from, &into).await?;
            eprintln!("Moved {} page(s) from {} into {}", n, from, into);
        }
        Command::Reassign { page_id, candidate } => {
            pipeline.reassign_page(&page_id, &candidate).await?;
            eprintln!("{} → {}", page_id, candidate);
        }
        Command::Cache { action } => match action {
            CacheAction::Count => println!("{}", pipeline.cache_size().await?),
            CacheAction::Clear => {
                let n = pipeline.clear_cache().await?;
                eprintln!("Removed {} cached result(s)", n);
            }
        },
        Command::Run(_) => {}
    }

    Ok(())
}

/// Map `run` flags to `PipelineConfig`.
async fn build_config(args: &RunArgs, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .max_tokens(args.max_tokens)
        .temperature(args.temperature)
        .max_retries(args.max_retries)
        .slow_call_warn_secs(args.slow_call_secs)
        .stop_on_quota_exhausted(args.stop_on_quota);

    if let Some(ref model) = args.model {
        builder = builder.model(model);
    }
    if let Some(ref provider) = args.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(ref path) = args.system_prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read system prompt from {:?}", path))?;
        builder = builder.system_prompt(prompt);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

fn print_status(project: &Project) {
    println!("{}", bold(&format!("Project {}", project.id)));
    match project.rubric {
        Some(ref r) => println!("Rubric:      {} criteria", r.criteria.len()),
        None => println!("Rubric:      {}", red("not set")),
    }
    println!("Candidates:  {}", project.candidates.len());
    for c in project.candidates.values() {
        println!(
            "  {:<28} {:<20} {:>3} page(s)  {:?}",
            c.id,
            c.name,
            c.pages.len(),
            c.status
        );
        for p in &c.pages {
            println!(
                "    {} {:<34} {} p.{}",
                dim("·"),
                p.id,
                serde_json::to_string(&p.part).unwrap_or_default().trim_matches('"'),
                p.page_number.map_or_else(|| "?".to_string(), |n| n.to_string())
            );
        }
    }

    println!("Pool:        {} page(s)", project.unprocessed.len());
    for p in &project.unprocessed {
        let state = match p.status {
            PageStatus::Error => red(&format!("error: {}", p.error.as_deref().unwrap_or("unknown"))),
            other => format!("{other:?}").to_lowercase(),
        };
        println!(
            "    {} {:<34} {:<24} {}",
            dim("·"),
            p.id,
            p.source_file,
            state
        );
    }
}
