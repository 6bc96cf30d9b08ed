//! The end-to-end run: upload → analyze → generate → poll.
//!
//! [`Pipeline`] owns the transport, the uploader, the poller and the
//! [`TaskTracker`] they share. Each stage waits for the previous one; the
//! first failure short-circuits the rest, fires
//! [`PipelineHooks::on_error`](crate::progress::PipelineHooks::on_error)
//! once, and is returned to the caller.
//!
//! Starting a run deactivates whatever run was live on the same pipeline,
//! and [`Pipeline::cancel`] does the same without starting a new one. A
//! superseded run notices at its next suspension point, stops firing hooks,
//! and resolves to [`RepromptError::Cancelled`]. Hooks are dispatched under
//! the tracker's dispatch lock, so none fires once `cancel()` has returned.

use crate::config::{ClientConfig, Settings};
use crate::error::{RepromptError, Stage};
use crate::output::{AnalyzeResult, GenerateResult, GenerationResult, TaskStatus};
use crate::pipeline::input::{ImageFile, ALLOWED_EXTENSIONS};
use crate::pipeline::poller::{PollOutcome, Scheduler, TaskPoller, TaskTracker, TokioScheduler};
use crate::pipeline::transport::{HttpTransport, RequestSpec, Transport};
use crate::pipeline::upload::{HttpUploader, UploadProgress, Uploader};
use crate::progress::Hooks;
use image::ImageFormat;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Orchestrates one image through the remote service.
///
/// # Example
/// ```rust,no_run
/// use reprompt::{ClientConfig, NoopHooks, Pipeline, Settings};
/// use reprompt::pipeline::input::resolve_input;
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ClientConfig::default();
/// let pipeline = Pipeline::new(config.clone())?;
/// let image = resolve_input("cat.png", &config).await?;
/// let settings = Settings::new("sk-...", "session=...");
/// let result = pipeline.run(&image, &settings, Arc::new(NoopHooks)).await?;
/// for url in &result.images {
///     println!("{url}");
/// }
/// # Ok(())
/// # }
/// ```
pub struct Pipeline {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    uploader: Arc<dyn Uploader>,
    poller: Arc<TaskPoller>,
    tracker: Arc<TaskTracker>,
}

impl Pipeline {
    /// Build a pipeline talking HTTP to `config.base_url`.
    pub fn new(config: ClientConfig) -> Result<Self, RepromptError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| RepromptError::Internal(format!("HTTP client: {e}")))?;
        let transport = Arc::new(HttpTransport::new(client.clone()));
        let uploader = Arc::new(HttpUploader::new(
            client,
            config.endpoint("upload"),
            config.request_timeout(),
            config.upload_chunk_bytes,
        ));
        Ok(Self::with_parts(config, transport, uploader, Arc::new(TokioScheduler)))
    }

    /// Build a pipeline from explicit collaborators.
    pub fn with_parts(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        uploader: Arc<dyn Uploader>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let tracker = TaskTracker::new();
        let poller = Arc::new(TaskPoller::new(
            Arc::clone(&transport),
            scheduler,
            Arc::clone(&tracker),
            config.clone(),
        ));
        Self {
            config,
            transport,
            uploader,
            poller,
            tracker,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn poller(&self) -> &Arc<TaskPoller> {
        &self.poller
    }

    /// The task id currently being polled, if any.
    pub fn current_task(&self) -> Option<String> {
        self.tracker.current_task()
    }

    /// Cancel the live run, if any. Idempotent; never fails.
    pub fn cancel(&self) {
        info!("Cancelling current run");
        self.poller.cancel();
    }

    /// Upload, analyze, generate and wait for the generated images.
    pub async fn run(
        &self,
        file: &ImageFile,
        settings: &Settings,
        hooks: Hooks,
    ) -> Result<GenerationResult, RepromptError> {
        let started = Instant::now();
        let generation = self.tracker.begin();
        info!("Starting run {} for '{}'", generation, file.name());

        let outcome = self.run_stages(generation, file, settings, &hooks).await;
        if let Ok(ref result) = outcome {
            info!(
                "Run {} complete: {} images in {}ms",
                generation,
                result.images.len(),
                started.elapsed().as_millis()
            );
        }
        self.report(generation, outcome, &hooks)
    }

    /// Upload and analyze only; returns the derived prompt.
    pub async fn describe(
        &self,
        file: &ImageFile,
        settings: &Settings,
        hooks: Hooks,
    ) -> Result<AnalyzeResult, RepromptError> {
        let generation = self.tracker.begin();
        info!("Starting describe-only run {} for '{}'", generation, file.name());

        let outcome = self.describe_stages(generation, file, settings, &hooks).await;
        self.report(generation, outcome, &hooks)
    }

    /// True iff `GET /health` answers 2xx within five seconds.
    pub async fn check_connection(&self) -> bool {
        let spec = RequestSpec::get(self.config.endpoint("health"), HEALTH_TIMEOUT);
        match self.transport.request(spec).await {
            // A 2xx with a non-JSON body still means the server is up.
            Ok(_) | Err(RepromptError::Parse { .. }) => true,
            Err(e) => {
                debug!("Health check failed: {}", e);
                false
            }
        }
    }

    async fn run_stages(
        &self,
        generation: u64,
        file: &ImageFile,
        settings: &Settings,
        hooks: &Hooks,
    ) -> Result<GenerationResult, RepromptError> {
        // ── Step 1: Validate settings (no network) ───────────────────────
        settings.validate()?;

        // ── Step 2: Upload ───────────────────────────────────────────────
        let filename = self.upload_stage(generation, file, hooks).await?;

        // ── Step 3: Analyze ──────────────────────────────────────────────
        let analyzed = self
            .analyze_stage(generation, &filename, settings, hooks)
            .await?;
        let prompt = analyzed.prompt.unwrap_or_default();

        // ── Step 4: Generate ─────────────────────────────────────────────
        self.fire(generation, || hooks.on_generate_start())?;
        let body = json!({
            "prompt": prompt,
            "model_scope_cookie": settings.cookie,
            "width": settings.width,
            "height": settings.height,
            "lora_args": settings.lora_args,
        });
        let generated: Result<GenerateResult, _> = self.post_json("generate", body).await;
        self.ensure_live(generation)?;
        let generated = generated?;
        if !generated.success {
            return Err(remote_failure(Stage::Generate, generated.error, "image generation failed"));
        }
        let task_id = generated
            .task_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| RepromptError::RemoteFailure {
                stage: Stage::Generate,
                message: "generation was accepted but no task id was returned".into(),
            })?;
        info!("Generation task {} queued", task_id);

        // ── Step 5: Poll ─────────────────────────────────────────────────
        let handle = self
            .tracker
            .track(generation, &task_id)
            .ok_or(RepromptError::Cancelled)?;
        let on_progress = |status: &TaskStatus| hooks.on_generate_progress(status);
        match self.poller.watch(&handle, &on_progress).await {
            PollOutcome::Completed(result) => {
                self.fire(generation, || hooks.on_generate_complete(&result))?;
                Ok(result)
            }
            PollOutcome::Failed(e) => Err(e),
            PollOutcome::Cancelled => Err(RepromptError::Cancelled),
        }
    }

    async fn describe_stages(
        &self,
        generation: u64,
        file: &ImageFile,
        settings: &Settings,
        hooks: &Hooks,
    ) -> Result<AnalyzeResult, RepromptError> {
        settings.validate()?;
        let filename = self.upload_stage(generation, file, hooks).await?;
        self.analyze_stage(generation, &filename, settings, hooks).await
    }

    async fn upload_stage(
        &self,
        generation: u64,
        file: &ImageFile,
        hooks: &Hooks,
    ) -> Result<String, RepromptError> {
        let tracker = Arc::clone(&self.tracker);
        let progress_hooks = Arc::clone(hooks);
        let on_progress: UploadProgress = Arc::new(move |percent| {
            tracker.dispatch_if_live(generation, || progress_hooks.on_upload_progress(percent));
        });

        let uploaded = self.uploader.upload(file, on_progress).await;
        self.ensure_live(generation)?;
        let uploaded = uploaded?;
        if !uploaded.success {
            return Err(remote_failure(Stage::Upload, uploaded.error, "file upload failed"));
        }
        let filename = uploaded
            .filename
            .filter(|f| !f.trim().is_empty())
            .ok_or_else(|| RepromptError::RemoteFailure {
                stage: Stage::Upload,
                message: "upload succeeded but no file name was returned".into(),
            })?;
        debug!("Uploaded as '{}'", filename);
        Ok(filename)
    }

    async fn analyze_stage(
        &self,
        generation: u64,
        filename: &str,
        settings: &Settings,
        hooks: &Hooks,
    ) -> Result<AnalyzeResult, RepromptError> {
        self.fire(generation, || hooks.on_analyze_start())?;
        let body = json!({
            "filename": filename,
            "api_key": settings.api_key,
        });
        let analyzed: Result<AnalyzeResult, _> = self.post_json("analyze", body).await;
        self.ensure_live(generation)?;
        let analyzed = analyzed?;
        if !analyzed.success {
            return Err(remote_failure(Stage::Analyze, analyzed.error, "image analysis failed"));
        }
        if analyzed.prompt.as_deref().map_or(true, |p| p.trim().is_empty()) {
            return Err(RepromptError::RemoteFailure {
                stage: Stage::Analyze,
                message: "analysis succeeded but no prompt was returned".into(),
            });
        }
        debug!(
            "Derived prompt ({} chars)",
            analyzed.prompt.as_deref().map_or(0, str::len)
        );
        self.fire(generation, || hooks.on_analyze_complete(&analyzed))?;
        Ok(analyzed)
    }

    /// Run a hook for `generation`, or stop with `Cancelled` if it was
    /// superseded.
    fn fire(&self, generation: u64, hook: impl FnOnce()) -> Result<(), RepromptError> {
        self.tracker
            .dispatch_if_live(generation, hook)
            .ok_or(RepromptError::Cancelled)
    }

    /// Fire `on_error` for a failed outcome (never for a cancellation). A
    /// failure that lands after the run was superseded becomes `Cancelled`.
    fn report<T>(
        &self,
        generation: u64,
        outcome: Result<T, RepromptError>,
        hooks: &Hooks,
    ) -> Result<T, RepromptError> {
        match outcome {
            Err(e) if !e.is_cancelled() => {
                warn!("Run failed: {}", e);
                match self.tracker.dispatch_if_live(generation, || hooks.on_error(&e)) {
                    Some(()) => Err(e),
                    None => Err(RepromptError::Cancelled),
                }
            }
            other => other,
        }
    }

    fn ensure_live(&self, generation: u64) -> Result<(), RepromptError> {
        if self.tracker.is_live(generation) {
            Ok(())
        } else {
            debug!("Run {} was superseded; stopping", generation);
            Err(RepromptError::Cancelled)
        }
    }

    async fn post_json<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T, RepromptError> {
        let url = self.config.endpoint(path);
        let spec = RequestSpec::post_json(url.clone(), body, self.config.request_timeout());
        let value = self.transport.request(spec).await?;
        serde_json::from_value(value).map_err(|e| RepromptError::Parse {
            url,
            reason: e.to_string(),
        })
    }
}

fn remote_failure(stage: Stage, message: Option<String>, fallback: &str) -> RepromptError {
    let message = message
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| fallback.to_string());
    warn!("{} stage reported failure: {}", stage, message);
    RepromptError::RemoteFailure { stage, message }
}

// ── Saving results ───────────────────────────────────────────────────────

/// Download every generated image into `dir` as `image_<n>.<ext>`.
///
/// Each file is written to a temporary name and renamed into place, so a
/// failed download never leaves a partial image behind.
pub async fn save_images(
    result: &GenerationResult,
    dir: impl AsRef<Path>,
    timeout: Duration,
) -> Result<Vec<PathBuf>, RepromptError> {
    let dir = dir.as_ref();
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| RepromptError::OutputWriteFailed {
            path: dir.to_path_buf(),
            source: e,
        })?;

    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| RepromptError::Internal(format!("HTTP client: {e}")))?;

    let mut saved = Vec::with_capacity(result.images.len());
    for (i, url) in result.images.iter().enumerate() {
        let bytes = fetch_image(&client, url, timeout).await?;
        let ext = image_extension(url, &bytes);
        let path = dir.join(format!("image_{}.{}", i + 1, ext));
        let tmp_path = path.with_extension(format!("{ext}.tmp"));

        tokio::fs::write(&tmp_path, &bytes)
            .await
            .map_err(|e| RepromptError::OutputWriteFailed {
                path: path.clone(),
                source: e,
            })?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(RepromptError::OutputWriteFailed {
                path: path.clone(),
                source: e,
            });
        }

        info!("Saved {} ({} bytes)", path.display(), bytes.len());
        saved.push(path);
    }
    Ok(saved)
}

async fn fetch_image(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<bytes::Bytes, RepromptError> {
    let failed = |reason: String| RepromptError::DownloadFailed {
        url: url.to_string(),
        reason,
    };
    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            RepromptError::Timeout {
                url: url.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }
        } else {
            failed(e.to_string())
        }
    })?;
    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }
    response.bytes().await.map_err(|e| failed(e.to_string()))
}

/// Extension from the URL when it is a known image type, else sniffed.
fn image_extension(url: &str, bytes: &[u8]) -> &'static str {
    let from_url = reqwest::Url::parse(url).ok().and_then(|u| {
        let ext = Path::new(u.path())
            .extension()?
            .to_string_lossy()
            .to_ascii_lowercase();
        ALLOWED_EXTENSIONS.iter().copied().find(|e| *e == ext)
    });
    if let Some(ext) = from_url {
        return ext;
    }
    match image::guess_format(bytes) {
        Ok(ImageFormat::Jpeg) => "jpg",
        Ok(ImageFormat::Gif) => "gif",
        Ok(ImageFormat::Bmp) => "bmp",
        Ok(ImageFormat::WebP) => "webp",
        _ => "png",
    }
}
