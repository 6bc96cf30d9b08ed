//! Error types for the reprompt library.
//!
//! A single enum, [`RepromptError`], covers every way a run can fail. The
//! variants fall into four groups:
//!
//! * **Input**: the image could not be read or is not an acceptable image
//!   (caught before any network call).
//! * **Transport** (`Network`, `Timeout`, `Http`, `Parse`): the request
//!   itself failed or its body could not be understood.
//! * **Remote**: the server answered well-formed JSON but reported failure
//!   (`RemoteFailure`), or the generation task ended badly (`TaskFailed`,
//!   `TaskCancelled`, `UnknownStatus`).
//! * **Client**: `Validation`, `InvalidConfig`, and `Cancelled` (the caller
//!   cancelled the run; this one is never reported through
//!   [`crate::progress::PipelineHooks::on_error`]).
//!
//! Nothing here is fatal to the process. Every failure is scoped to one run
//! and the pipeline is immediately ready for another.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// The pipeline stage that produced a [`RepromptError::RemoteFailure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Stage {
    Upload,
    Analyze,
    Generate,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Upload => "upload",
            Stage::Analyze => "analyze",
            Stage::Generate => "generate",
        })
    }
}

/// All errors returned by the reprompt library.
#[derive(Debug, Error)]
pub enum RepromptError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Settings are missing a credential or carry unusable dimensions.
    #[error("{0}")]
    Validation(String),

    /// Image file was not found at the given path.
    #[error("Image file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The file is not one of the accepted image types.
    #[error("Unsupported file '{name}': {reason}")]
    UnsupportedFile { name: String, reason: String },

    /// The file exceeds the upload limit.
    #[error("File '{name}' is {size} bytes; the upload limit is {limit} bytes")]
    FileTooLarge { name: String, size: u64, limit: u64 },

    /// An image URL was valid but its download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    // ── Transport errors ──────────────────────────────────────────────────
    /// Connection could not be established or dropped mid-request.
    #[error("Network error calling '{url}': {reason}")]
    Network { url: String, reason: String },

    /// The request did not complete before its deadline.
    #[error("Request to '{url}' timed out after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u64 },

    /// The server answered with a non-2xx status.
    #[error("HTTP {status}: {status_text} ({url})")]
    Http {
        url: String,
        status: u16,
        status_text: String,
    },

    /// The response body was not the JSON we expected.
    #[error("Invalid response from '{url}': {reason}")]
    Parse { url: String, reason: String },

    // ── Remote errors ─────────────────────────────────────────────────────
    /// A well-formed response with `success: false`.
    ///
    /// Displays as the bare server message so callers can show it verbatim.
    #[error("{message}")]
    RemoteFailure { stage: Stage, message: String },

    /// The generation task reported `failed`.
    #[error("{message}")]
    TaskFailed { task_id: String, message: String },

    /// The generation task was cancelled on the server side.
    #[error("task cancelled")]
    TaskCancelled { task_id: String },

    /// The status endpoint returned a status we do not understand.
    #[error("unknown status: {status}")]
    UnknownStatus { task_id: String, status: String },

    // ── Client errors ─────────────────────────────────────────────────────
    /// The run was cancelled by the caller.
    #[error("Run cancelled")]
    Cancelled,

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Could not write a downloaded image to disk.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RepromptError {
    /// Whether wrapping the whole run in a retry has a reasonable chance of
    /// succeeding. The library itself never retries.
    pub fn is_retryable(&self) -> bool {
        match self {
            RepromptError::Network { .. } | RepromptError::Timeout { .. } => true,
            RepromptError::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// True for a client-side cancellation, which is not reported as an error.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RepromptError::Cancelled)
    }
}
