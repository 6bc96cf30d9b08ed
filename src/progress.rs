//! Hook trait through which a pipeline run reports its progress.
//!
//! Pass an [`Arc<dyn PipelineHooks>`] to [`crate::Pipeline::run`] to receive
//! stage transitions as they happen. The UI layer (a terminal progress bar,
//! a web socket, a test recorder) implements only the methods it cares about;
//! all of them default to no-ops.
//!
//! # Ordering
//!
//! For one run the hooks fire in strict stage order:
//!
//! ```text
//! on_upload_progress*  on_analyze_start  on_analyze_complete
//! on_generate_start    on_generate_progress*
//! (on_generate_complete | on_error)
//! ```
//!
//! A failure at any stage fires `on_error` exactly once and nothing after
//! it. A run cancelled through [`crate::Pipeline::cancel`] fires nothing
//! further at all.
//!
//! # Example
//!
//! ```rust
//! use reprompt::{PipelineHooks, TaskStatus};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct TickCounter(AtomicUsize);
//!
//! impl PipelineHooks for TickCounter {
//!     fn on_generate_progress(&self, _status: &TaskStatus) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//!
//! let hooks: Arc<dyn PipelineHooks> = Arc::new(TickCounter(AtomicUsize::new(0)));
//! hooks.on_analyze_start();
//! ```

use crate::error::RepromptError;
use crate::output::{AnalyzeResult, GenerationResult, TaskStatus};
use std::sync::Arc;

/// Called by the pipeline at each stage transition.
///
/// Hooks are invoked synchronously from the task driving the run, except
/// `on_upload_progress`, which is called from whichever task the HTTP client
/// uses to stream the request body. Implementations must therefore be
/// `Send + Sync` and should return quickly.
pub trait PipelineHooks: Send + Sync {
    /// Upload progress in whole percent, 0–100. Never decreases within a run.
    fn on_upload_progress(&self, percent: u8) {
        let _ = percent;
    }

    fn on_analyze_start(&self) {}

    /// The service produced a prompt for the uploaded image.
    fn on_analyze_complete(&self, result: &AnalyzeResult) {
        let _ = result;
    }

    fn on_generate_start(&self) {}

    /// Every status snapshot observed while polling, including the terminal one.
    fn on_generate_progress(&self, status: &TaskStatus) {
        let _ = status;
    }

    /// Final images of a successful run.
    fn on_generate_complete(&self, result: &GenerationResult) {
        let _ = result;
    }

    /// The run failed; called once, right before the error is returned.
    fn on_error(&self, error: &RepromptError) {
        let _ = error;
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopHooks;

impl PipelineHooks for NoopHooks {}

/// Convenience alias for the shared hook object.
pub type Hooks = Arc<dyn PipelineHooks>;
