//! CLI binary for reprompt.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `ClientConfig` + `Settings`, drives one run, and prints the results.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use reprompt::{
    resolve_input, save_images, AnalyzeResult, ClientConfig, GenerationResult, Hooks, NoopHooks,
    Pipeline, PipelineHooks, RepromptError, Settings, TaskStatus,
};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
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

// ── CLI hooks using indicatif ────────────────────────────────────────────────

/// Terminal hooks: one bar that moves through upload → analyze → generate.
struct CliHooks {
    bar: ProgressBar,
    /// Set once the server starts reporting a percentage.
    percent_mode: AtomicBool,
}

impl CliHooks {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(100);
        bar.set_style(percent_style());
        bar.set_prefix("Uploading");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            percent_mode: AtomicBool::new(false),
        })
    }

    fn spin(&self, prefix: &'static str, message: &'static str) {
        let style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  ⏱ {elapsed}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);
        self.bar.set_style(style);
        self.bar.set_prefix(prefix);
        self.bar.set_message(message);
    }
}

fn percent_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}%  {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("█▉▊▋▌▍▎▏  ")
    .tick_strings(TICKS)
}

impl PipelineHooks for CliHooks {
    fn on_upload_progress(&self, percent: u8) {
        self.bar.set_position(u64::from(percent));
    }

    fn on_analyze_start(&self) {
        self.bar.println(format!("  {} Uploaded", green("✓")));
        self.spin("Analyzing", "deriving a prompt from the image…");
    }

    fn on_analyze_complete(&self, result: &AnalyzeResult) {
        let prompt = result.prompt.as_deref().unwrap_or_default();
        // Long prompts are cut to keep the log readable; --json has the full text.
        let shown = if prompt.chars().count() > 100 {
            format!("{}\u{2026}", prompt.chars().take(99).collect::<String>())
        } else {
            prompt.to_string()
        };
        self.bar
            .println(format!("  {} Prompt  {}", green("✓"), dim(&shown)));
    }

    fn on_generate_start(&self) {
        self.percent_mode.store(false, Ordering::SeqCst);
        self.spin("Generating", "queued…");
    }

    fn on_generate_progress(&self, status: &TaskStatus) {
        if let Some(p) = status.progress {
            if !self.percent_mode.swap(true, Ordering::SeqCst) {
                self.bar.set_length(100);
                self.bar.set_position(0);
                self.bar.set_style(percent_style());
            }
            self.bar.set_position(p.clamp(0.0, 100.0) as u64);
        }
        let msg = status
            .message
            .clone()
            .unwrap_or_else(|| status.status.to_string());
        self.bar.set_message(msg);
    }

    fn on_generate_complete(&self, result: &GenerationResult) {
        self.bar.finish_and_clear();
        eprintln!(
            "{} {} images generated",
            green("✔"),
            bold(&result.images.len().to_string())
        );
    }

    fn on_error(&self, error: &RepromptError) {
        self.bar.abandon();
        eprintln!("{} {}", red("✘"), red(&error.to_string()));
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Reverse-prompt a local image and generate new ones
  reprompt photo.jpg

  # Use an image from the web, save the results
  reprompt https://example.com/cat.png -o out/

  # Only print the derived prompt
  reprompt --describe-only photo.jpg

  # JSON output (prompt + image URLs)
  reprompt --json photo.jpg > result.json

  # Is the server up?
  reprompt --check

SETTINGS FILE (JSON, all fields optional):
  {
    "api_key": "sk-...",
    "cookie": "m_session_id=...",
    "width": 1104,
    "height": 1472,
    "lora_args": [{"modelVersionId": 334516, "scale": 0.5}]
  }
  Flags and environment variables override values from the file.

ENVIRONMENT VARIABLES:
  REPROMPT_SERVER     Base URL of the service (default http://localhost:5000)
  REPROMPT_API_KEY    API key for the captioning model
  REPROMPT_COOKIE     ModelScope session cookie
  REPROMPT_SETTINGS   Path to a settings JSON file
  REPROMPT_WIDTH      Output width in pixels
  REPROMPT_HEIGHT     Output height in pixels
  RUST_LOG            Override log filter (e.g. reprompt=debug)
"#;

/// Reverse-prompt an image and generate new images from the prompt.
#[derive(Parser, Debug)]
#[command(
    name = "reprompt",
    version,
    about = "Reverse-prompt an image and generate new images from the prompt",
    long_about = "Upload an image to a reprompt server, derive a text prompt from it with a \
captioning model, then generate new images from that prompt and wait for them.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local image path or HTTP/HTTPS URL (png, jpg, jpeg, gif, bmp).
    #[arg(required_unless_present = "check")]
    input: Option<String>,

    /// Base URL of the service.
    #[arg(long, env = "REPROMPT_SERVER", default_value = "http://localhost:5000")]
    server: String,

    /// API key for the captioning model.
    #[arg(long, env = "REPROMPT_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// ModelScope session cookie for the generation endpoint.
    #[arg(long, env = "REPROMPT_COOKIE", hide_env_values = true)]
    cookie: Option<String>,

    /// Settings JSON file; flags override its values.
    #[arg(long, env = "REPROMPT_SETTINGS")]
    settings: Option<PathBuf>,

    /// Output width in pixels.
    #[arg(long, env = "REPROMPT_WIDTH")]
    width: Option<u32>,

    /// Output height in pixels.
    #[arg(long, env = "REPROMPT_HEIGHT")]
    height: Option<u32>,

    /// Download the generated images into this directory.
    #[arg(short, long, env = "REPROMPT_OUTPUT")]
    output: Option<PathBuf>,

    /// Output structured JSON instead of one URL per line.
    #[arg(long, env = "REPROMPT_JSON")]
    json: bool,

    /// Stop after analysis and print the derived prompt.
    #[arg(long)]
    describe_only: bool,

    /// Check that the server is reachable and exit.
    #[arg(long)]
    check: bool,

    /// Per-request timeout in milliseconds.
    #[arg(long, env = "REPROMPT_TIMEOUT_MS", default_value_t = 30_000)]
    timeout_ms: u64,

    /// Delay between status queries in milliseconds (min 100).
    #[arg(long, env = "REPROMPT_POLL_INTERVAL_MS", default_value_t = 2_000)]
    poll_interval_ms: u64,

    /// Timeout for downloading input and output images, in seconds.
    #[arg(long, env = "REPROMPT_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Disable progress bar.
    #[arg(long, env = "REPROMPT_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "REPROMPT_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "REPROMPT_QUIET")]
    quiet: bool,
}

#[derive(serde::Serialize)]
struct JsonOutput<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt: Option<&'a str>,
    images: &'a [String],
    #[serde(skip_serializing_if = "Vec::is_empty")]
    saved: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs; --verbose always wins.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json && !cli.check;
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

    let config = ClientConfig::builder()
        .base_url(cli.server.clone())
        .request_timeout_ms(cli.timeout_ms)
        .poll_interval_ms(cli.poll_interval_ms)
        .download_timeout_secs(cli.download_timeout)
        .build()
        .context("Invalid configuration")?;
    let pipeline = Pipeline::new(config.clone()).context("Failed to set up HTTP client")?;

    // ── Health check ─────────────────────────────────────────────────────
    if cli.check {
        let ok = pipeline.check_connection().await;
        if !cli.quiet {
            if ok {
                eprintln!("{} {} is reachable", green("✔"), bold(&config.base_url));
            } else {
                eprintln!("{} {} is not reachable", red("✘"), bold(&config.base_url));
            }
        }
        std::process::exit(if ok { 0 } else { 1 });
    }

    let Some(ref input) = cli.input else {
        anyhow::bail!("an image path or URL is required");
    };
    let settings = build_settings(&cli)?;
    settings.validate().context("Incomplete settings")?;

    let image = resolve_input(input, &config)
        .await
        .with_context(|| format!("Failed to load image '{input}'"))?;
    if !cli.quiet && !cli.json {
        eprintln!(
            "{} {}  {}",
            cyan("◆"),
            bold(image.name()),
            dim(&format!("{} bytes", image.len()))
        );
    }

    let hooks: Hooks = if show_progress {
        CliHooks::new() as Hooks
    } else {
        Arc::new(NoopHooks) as Hooks
    };

    // ── Describe-only mode ───────────────────────────────────────────────
    if cli.describe_only {
        let analyzed = tokio::select! {
            r = pipeline.describe(&image, &settings, hooks) => r,
            _ = tokio::signal::ctrl_c() => {
                pipeline.cancel();
                Err(RepromptError::Cancelled)
            }
        };
        let analyzed = finish(analyzed, "Analysis failed")?;
        let prompt = analyzed.prompt.as_deref().unwrap_or_default();
        if cli.json {
            let out = JsonOutput {
                prompt: Some(prompt),
                images: &[],
                saved: Vec::new(),
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&out).context("Failed to serialise output")?
            );
        } else {
            println!("{prompt}");
        }
        return Ok(());
    }

    // ── Full run ─────────────────────────────────────────────────────────
    let outcome = tokio::select! {
        r = pipeline.run(&image, &settings, hooks) => r,
        _ = tokio::signal::ctrl_c() => {
            pipeline.cancel();
            Err(RepromptError::Cancelled)
        }
    };
    let result = finish(outcome, "Generation failed")?;

    let mut saved = Vec::new();
    if let Some(ref dir) = cli.output {
        let paths = save_images(&result, dir, Duration::from_secs(config.download_timeout_secs))
            .await
            .with_context(|| format!("Failed to save images to {}", dir.display()))?;
        saved = paths.iter().map(|p| p.display().to_string()).collect();
    }

    if cli.json {
        let out = JsonOutput {
            prompt: None,
            images: &result.images,
            saved,
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&out).context("Failed to serialise output")?
        );
    } else {
        for url in &result.images {
            println!("{url}");
        }
        if !cli.quiet {
            for path in &saved {
                eprintln!("  {} {}", green("↓"), bold(path));
            }
        }
    }

    Ok(())
}

/// Exit 130 on Ctrl-C, otherwise attach `what` to the error.
fn finish<T>(outcome: std::result::Result<T, RepromptError>, what: &'static str) -> Result<T> {
    match outcome {
        Err(RepromptError::Cancelled) => {
            eprintln!("\n{} cancelled", cyan("⚠"));
            std::process::exit(130);
        }
        other => other.context(what),
    }
}

/// Settings file first, then flags and env vars on top.
fn build_settings(cli: &Cli) -> Result<Settings> {
    let mut settings = match cli.settings {
        Some(ref path) => Settings::load(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?,
        None => Settings::default(),
    };
    if let Some(ref key) = cli.api_key {
        settings.api_key = key.clone();
    }
    if let Some(ref cookie) = cli.cookie {
        settings.cookie = cookie.clone();
    }
    if let Some(w) = cli.width {
        settings.width = w;
    }
    if let Some(h) = cli.height {
        settings.height = h;
    }
    Ok(settings)
}
