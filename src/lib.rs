//! # reprompt
//!
//! Reverse-prompt an image, then generate new images from that prompt.
//!
//! ## Why this crate?
//!
//! The heavy lifting (captioning, diffusion) happens on a remote service.
//! What is left for the client is the choreography: get the bytes up with
//! visible progress, chain three requests whose outputs feed each other,
//! wait on an asynchronous job without hammering the server, and stop
//! cleanly when the user changes their mind. This crate does exactly that
//! and nothing else.
//!
//! ## Pipeline Overview
//!
//! ```text
//! image (path or URL)
//!  │
//!  ├─ 1. Input     resolve, size-check and sniff the image
//!  ├─ 2. Upload    multipart POST /upload            → filename
//!  ├─ 3. Analyze   POST /analyze {filename, api_key} → prompt
//!  ├─ 4. Generate  POST /generate {prompt, …}        → task_id
//!  └─ 5. Poll      GET /queue_status/{id} every 2 s, then GET /result/{id}
//! ```
//!
//! Progress is reported through [`PipelineHooks`]; every hook is optional.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use reprompt::{resolve_input, ClientConfig, NoopHooks, Pipeline, Settings};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::builder()
//!         .base_url("http://localhost:5000")
//!         .build()?;
//!     let pipeline = Pipeline::new(config.clone())?;
//!
//!     let image = resolve_input("photo.jpg", &config).await?;
//!     let settings = Settings::new("sk-...", "m_session_id=...");
//!     let result = pipeline.run(&image, &settings, Arc::new(NoopHooks)).await?;
//!     for url in result.images {
//!         println!("{url}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `reprompt` binary (clap + indicatif + anyhow + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! reprompt = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod process;
pub mod progress;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ClientConfig, ClientConfigBuilder, LoraArg, Settings};
pub use error::{RepromptError, Stage};
pub use output::{AnalyzeResult, GenerateResult, GenerationResult, TaskState, TaskStatus, UploadResult};
pub use pipeline::input::{resolve_input, ImageFile};
pub use pipeline::poller::{
    PollObserver, PollOutcome, PollerState, Scheduler, TaskHandle, TaskPoller, TaskTracker,
    TokioScheduler,
};
pub use pipeline::transport::{HttpTransport, RequestSpec, Transport};
pub use pipeline::upload::{HttpUploader, UploadProgress, Uploader};
pub use process::{save_images, Pipeline};
pub use progress::{Hooks, NoopHooks, PipelineHooks};
