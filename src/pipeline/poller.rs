//! Status polling for a remote generation task.
//!
//! ## State machine
//!
//! ```text
//!          start/watch
//!   Idle ───────────────▶ Polling ──┬──▶ Completed   (status=completed, result fetched)
//!                          │   ▲    ├──▶ Failed      (status=failed/unknown, or a request failed)
//!                          └───┘    └──▶ Cancelled   (status=cancelled, or cancel())
//!                   pending/processing: wait one interval, query again
//! ```
//!
//! ## Cancellation
//!
//! Cancellation is cooperative and identity-based. A [`TaskTracker`] holds
//! the run generation and task id that are currently live; a
//! [`TaskHandle`] is active only while both still match. An in-flight
//! status request is not aborted; its answer is simply discarded.
//!
//! Callbacks are delivered through [`TaskTracker::dispatch_if_live`] (or its
//! per-handle twin), which checks liveness and runs the callback under one
//! dispatch lock. [`TaskTracker::cancel`] takes the same lock, so once it
//! has returned no callback for the cancelled run can start, on any thread.
//! The lock is reentrant: a callback may call `cancel()` itself.
//!
//! The delay between ticks goes through a [`Scheduler`] so tests can drive
//! the loop without real time passing.

use crate::config::ClientConfig;
use crate::error::RepromptError;
use crate::output::{GenerationResult, TaskState, TaskStatus};
use crate::pipeline::transport::{RequestSpec, Transport};
use async_trait::async_trait;
use parking_lot::ReentrantMutex;
use serde::de::DeserializeOwned;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ── Tracking ─────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct TrackerInner {
    generation: u64,
    task_id: Option<String>,
}

/// The single piece of shared mutable state: which run and which task id
/// are currently allowed to produce callbacks.
///
/// Lock order is `dispatch` then `inner`; `inner` is never held while a
/// callback runs.
#[derive(Debug, Default)]
pub struct TaskTracker {
    inner: Mutex<TrackerInner>,
    dispatch: ReentrantMutex<()>,
}

impl TaskTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, TrackerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a new run, deactivating whatever was tracked before.
    pub fn begin(&self) -> u64 {
        let _dispatch = self.dispatch.lock();
        let mut inner = self.lock();
        inner.generation += 1;
        inner.task_id = None;
        inner.generation
    }

    /// Whether the run started with `generation` has not been superseded.
    pub fn is_live(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    /// Track `task_id` for the run `generation`. Returns `None` when that
    /// run was cancelled or superseded in the meantime.
    pub fn track(self: &Arc<Self>, generation: u64, task_id: &str) -> Option<TaskHandle> {
        let mut inner = self.lock();
        if inner.generation != generation {
            return None;
        }
        inner.task_id = Some(task_id.to_string());
        Some(TaskHandle {
            task_id: task_id.to_string(),
            generation,
            tracker: Arc::clone(self),
        })
    }

    /// Invalidate the current run and task. Calling it again, or with
    /// nothing tracked, changes nothing observable.
    ///
    /// Waits for a callback that is being dispatched on another thread to
    /// return; no callback of the cancelled run starts afterwards.
    pub fn cancel(&self) {
        let _dispatch = self.dispatch.lock();
        let mut inner = self.lock();
        if let Some(id) = inner.task_id.take() {
            debug!("Cancelled tracking of task {}", id);
        }
        inner.generation += 1;
    }

    /// The task id currently being polled, if any.
    pub fn current_task(&self) -> Option<String> {
        self.lock().task_id.clone()
    }

    /// Run `f` if the run `generation` is still live, holding the dispatch
    /// lock so that [`cancel`](Self::cancel) cannot return in between.
    /// Returns `None` without calling `f` otherwise.
    pub fn dispatch_if_live<R>(&self, generation: u64, f: impl FnOnce() -> R) -> Option<R> {
        let _dispatch = self.dispatch.lock();
        if !self.is_live(generation) {
            return None;
        }
        Some(f())
    }

    /// Like [`dispatch_if_live`](Self::dispatch_if_live), gated on `handle`.
    pub fn dispatch_if_active<R>(&self, handle: &TaskHandle, f: impl FnOnce() -> R) -> Option<R> {
        let _dispatch = self.dispatch.lock();
        if !self.is_active(handle.generation, &handle.task_id) {
            return None;
        }
        Some(f())
    }

    fn is_active(&self, generation: u64, task_id: &str) -> bool {
        let inner = self.lock();
        inner.generation == generation && inner.task_id.as_deref() == Some(task_id)
    }

    fn release(&self, handle: &TaskHandle) {
        let mut inner = self.lock();
        if inner.generation == handle.generation
            && inner.task_id.as_deref() == Some(handle.task_id.as_str())
        {
            inner.task_id = None;
        }
    }
}

/// A task id bound to the run that started it.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    task_id: String,
    generation: u64,
    tracker: Arc<TaskTracker>,
}

impl TaskHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// False once the task was cancelled, superseded, or reached a terminal
    /// status.
    pub fn is_active(&self) -> bool {
        self.tracker.is_active(self.generation, &self.task_id)
    }
}

// ── Scheduling ───────────────────────────────────────────────────────────

/// Provides the delay between two polling ticks.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Resolve after `interval` has passed.
    async fn after(&self, interval: Duration);
}

/// [`Scheduler`] backed by `tokio::time::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

#[async_trait]
impl Scheduler for TokioScheduler {
    async fn after(&self, interval: Duration) {
        tokio::time::sleep(interval).await;
    }
}

// ── Poller ───────────────────────────────────────────────────────────────

/// Where the most recent watch stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollerState {
    #[default]
    Idle,
    Polling,
    Completed,
    Failed,
    Cancelled,
}

/// How a watch ended.
#[derive(Debug)]
pub enum PollOutcome {
    /// The task completed and its result was fetched.
    Completed(GenerationResult),
    /// The task failed, was cancelled server-side, reported an unknown
    /// status, or a request failed.
    Failed(RepromptError),
    /// The handle was deactivated on our side; no callback may follow.
    Cancelled,
}

/// Receives the callbacks of a loop started with [`TaskPoller::start`].
pub trait PollObserver: Send + Sync {
    fn on_progress(&self, status: &TaskStatus) {
        let _ = status;
    }
    fn on_complete(&self, result: GenerationResult);
    fn on_error(&self, error: RepromptError);
}

/// Queries `/queue_status/{id}` until the task reaches a terminal state.
pub struct TaskPoller {
    transport: Arc<dyn Transport>,
    scheduler: Arc<dyn Scheduler>,
    tracker: Arc<TaskTracker>,
    config: ClientConfig,
    state: Mutex<PollerState>,
}

impl TaskPoller {
    pub fn new(
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
        tracker: Arc<TaskTracker>,
        config: ClientConfig,
    ) -> Self {
        Self {
            transport,
            scheduler,
            tracker,
            config,
            state: Mutex::new(PollerState::Idle),
        }
    }

    pub fn tracker(&self) -> &Arc<TaskTracker> {
        &self.tracker
    }

    pub fn state(&self) -> PollerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, handle: &TaskHandle, state: PollerState) {
        if handle.is_active() {
            *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
        }
    }

    /// Stop the current loop. Idempotent.
    pub fn cancel(&self) {
        self.tracker.cancel();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == PollerState::Polling {
            *state = PollerState::Cancelled;
        }
    }

    /// Begin polling `task_id` on a spawned tokio task, replacing any loop
    /// that is already running. Must be called within a tokio runtime.
    pub fn start(
        self: &Arc<Self>,
        task_id: impl Into<String>,
        observer: Arc<dyn PollObserver>,
    ) -> JoinHandle<()> {
        let task_id = task_id.into();
        let generation = self.tracker.begin();
        let handle = self.tracker.track(generation, &task_id);
        let poller = Arc::clone(self);

        tokio::spawn(async move {
            let Some(handle) = handle else {
                return;
            };
            let progress_observer = Arc::clone(&observer);
            let on_progress = move |status: &TaskStatus| progress_observer.on_progress(status);
            let tracker = Arc::clone(poller.tracker());
            // The handle is released at a terminal status; the run's
            // generation stays live until the next begin() or cancel().
            match poller.watch(&handle, &on_progress).await {
                PollOutcome::Completed(result) => {
                    tracker.dispatch_if_live(generation, || observer.on_complete(result));
                }
                PollOutcome::Failed(error) => {
                    tracker.dispatch_if_live(generation, || observer.on_error(error));
                }
                PollOutcome::Cancelled => {}
            }
        })
    }

    /// Poll until `handle`'s task is terminal or the handle is deactivated.
    ///
    /// `on_progress` sees every status snapshot, terminal ones included. It
    /// is never called once the handle is inactive.
    pub async fn watch(
        &self,
        handle: &TaskHandle,
        on_progress: &(dyn Fn(&TaskStatus) + Send + Sync),
    ) -> PollOutcome {
        let task_id = handle.task_id();
        info!("Polling task {}", task_id);
        self.set_state(handle, PollerState::Polling);

        let mut ticks: u32 = 0;
        loop {
            if !handle.is_active() {
                return PollOutcome::Cancelled;
            }
            ticks += 1;

            let fetched = self.fetch_status(task_id).await;
            let status = match fetched {
                Ok(status) => status,
                Err(e) => return self.finish(handle, PollOutcome::Failed(e)),
            };

            debug!(
                "Task {}: tick {} status={} progress={:?}",
                task_id, ticks, status.status, status.progress
            );
            if self
                .tracker
                .dispatch_if_active(handle, || on_progress(&status))
                .is_none()
            {
                debug!("Task {}: discarding tick {} after cancellation", task_id, ticks);
                return PollOutcome::Cancelled;
            }

            match status.status {
                TaskState::Pending | TaskState::Processing => {
                    self.scheduler.after(self.config.poll_interval()).await;
                }
                TaskState::Completed => {
                    let fetched = self.fetch_result(task_id).await;
                    if !handle.is_active() {
                        return PollOutcome::Cancelled;
                    }
                    let outcome = match fetched {
                        Ok(result) => PollOutcome::Completed(result),
                        Err(e) => PollOutcome::Failed(e),
                    };
                    return self.finish(handle, outcome);
                }
                TaskState::Failed => {
                    let message = status
                        .error
                        .filter(|m| !m.trim().is_empty())
                        .unwrap_or_else(|| "task failed".to_string());
                    let error = RepromptError::TaskFailed {
                        task_id: task_id.to_string(),
                        message,
                    };
                    return self.finish(handle, PollOutcome::Failed(error));
                }
                TaskState::Cancelled => {
                    let error = RepromptError::TaskCancelled {
                        task_id: task_id.to_string(),
                    };
                    return self.finish(handle, PollOutcome::Failed(error));
                }
                TaskState::Unknown(value) => {
                    let error = RepromptError::UnknownStatus {
                        task_id: task_id.to_string(),
                        status: value,
                    };
                    return self.finish(handle, PollOutcome::Failed(error));
                }
            }
        }
    }

    /// Record the terminal state and release the handle, unless the handle
    /// went inactive in the meantime.
    fn finish(&self, handle: &TaskHandle, outcome: PollOutcome) -> PollOutcome {
        if !handle.is_active() {
            return PollOutcome::Cancelled;
        }
        let state = match &outcome {
            PollOutcome::Completed(_) => PollerState::Completed,
            PollOutcome::Failed(RepromptError::TaskCancelled { .. }) => PollerState::Cancelled,
            PollOutcome::Failed(e) => {
                warn!("Task {} ended: {}", handle.task_id(), e);
                PollerState::Failed
            }
            PollOutcome::Cancelled => PollerState::Cancelled,
        };
        self.set_state(handle, state);
        handle.tracker.release(handle);
        outcome
    }

    async fn fetch_status(&self, task_id: &str) -> Result<TaskStatus, RepromptError> {
        self.get_json(&format!("queue_status/{task_id}")).await
    }

    async fn fetch_result(&self, task_id: &str) -> Result<GenerationResult, RepromptError> {
        self.get_json(&format!("result/{task_id}")).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RepromptError> {
        let url = self.config.endpoint(path);
        let spec = RequestSpec::get(url.clone(), self.config.request_timeout());
        let value = self.transport.request(spec).await?;
        serde_json::from_value(value).map_err(|e| RepromptError::Parse {
            url,
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::{RecordingScheduler, ScriptedTransport};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;

    fn poller(transport: Arc<ScriptedTransport>, scheduler: Arc<RecordingScheduler>) -> TaskPoller {
        TaskPoller::new(transport, scheduler, TaskTracker::new(), ClientConfig::default())
    }

    fn handle_for(poller: &TaskPoller, id: &str) -> TaskHandle {
        let generation = poller.tracker().begin();
        poller.tracker().track(generation, id).unwrap()
    }

    fn collecting() -> (Arc<Mutex<Vec<TaskStatus>>>, impl Fn(&TaskStatus) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |s: &TaskStatus| sink.lock().unwrap().push(s.clone()))
    }

    #[tokio::test]
    async fn processing_then_completed_fetches_result() {
        let transport = ScriptedTransport::new();
        transport.push_ok("/queue_status/T1", json!({"status": "processing", "progress": 40}));
        transport.push_ok("/queue_status/T1", json!({"status": "completed"}));
        transport.push_ok("/result/T1", json!({"images": ["u1", "u2"]}));
        let scheduler = RecordingScheduler::new();
        let p = poller(Arc::clone(&transport), Arc::clone(&scheduler));
        let handle = handle_for(&p, "T1");
        let (seen, on_progress) = collecting();

        let outcome = p.watch(&handle, &on_progress).await;

        match outcome {
            PollOutcome::Completed(r) => assert_eq!(r.images, vec!["u1", "u2"]),
            other => panic!("expected completion, got {other:?}"),
        }
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].progress, Some(40.0));
        assert_eq!(seen[1].status, TaskState::Completed);
        assert_eq!(scheduler.intervals(), vec![Duration::from_millis(2000)]);
        assert_eq!(p.state(), PollerState::Completed);
        assert!(!handle.is_active(), "terminal status releases the handle");
        assert_eq!(p.tracker().current_task(), None);
    }

    #[tokio::test]
    async fn failed_status_uses_server_message_or_generic() {
        let transport = ScriptedTransport::new();
        transport.push_ok("/queue_status/T1", json!({"status": "failed", "error": "GPU on fire"}));
        let p = poller(Arc::clone(&transport), RecordingScheduler::new());
        let handle = handle_for(&p, "T1");
        let (_seen, on_progress) = collecting();

        match p.watch(&handle, &on_progress).await {
            PollOutcome::Failed(e) => assert_eq!(e.to_string(), "GPU on fire"),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(p.state(), PollerState::Failed);

        transport.push_ok("/queue_status/T2", json!({"status": "failed"}));
        let handle = handle_for(&p, "T2");
        match p.watch(&handle, &on_progress).await {
            PollOutcome::Failed(e) => assert_eq!(e.to_string(), "task failed"),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_side_cancel_is_an_error() {
        let transport = ScriptedTransport::new();
        transport.push_ok("/queue_status/T1", json!({"status": "cancelled"}));
        let p = poller(transport, RecordingScheduler::new());
        let handle = handle_for(&p, "T1");
        let (seen, on_progress) = collecting();

        match p.watch(&handle, &on_progress).await {
            PollOutcome::Failed(e) => {
                assert!(matches!(e, RepromptError::TaskCancelled { .. }));
                assert_eq!(e.to_string(), "task cancelled");
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(p.state(), PollerState::Cancelled);
    }

    #[tokio::test]
    async fn unknown_status_stops_without_scheduling() {
        let transport = ScriptedTransport::new();
        transport.push_ok("/queue_status/T1", json!({"status": "weird"}));
        let scheduler = RecordingScheduler::new();
        let p = poller(Arc::clone(&transport), Arc::clone(&scheduler));
        let handle = handle_for(&p, "T1");
        let (_seen, on_progress) = collecting();

        match p.watch(&handle, &on_progress).await {
            PollOutcome::Failed(e) => assert!(e.to_string().contains("unknown status")),
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(scheduler.intervals().is_empty());
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn status_request_failure_is_reported_without_progress() {
        let transport = ScriptedTransport::new();
        transport.push_err(
            "/queue_status/T1",
            RepromptError::Http {
                url: "x".into(),
                status: 500,
                status_text: "Internal Server Error".into(),
            },
        );
        let p = poller(transport, RecordingScheduler::new());
        let handle = handle_for(&p, "T1");
        let (seen, on_progress) = collecting();

        assert!(matches!(
            p.watch(&handle, &on_progress).await,
            PollOutcome::Failed(RepromptError::Http { status: 500, .. })
        ));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn result_fetch_failure_is_an_error() {
        let transport = ScriptedTransport::new();
        transport.push_ok("/queue_status/T1", json!({"status": "completed"}));
        transport.push_ok("/result/T1", json!({"images": "not-a-list"}));
        let p = poller(transport, RecordingScheduler::new());
        let handle = handle_for(&p, "T1");
        let (_seen, on_progress) = collecting();

        assert!(matches!(
            p.watch(&handle, &on_progress).await,
            PollOutcome::Failed(RepromptError::Parse { .. })
        ));
    }

    #[tokio::test]
    async fn cancel_between_ticks_stops_silently() {
        let transport = ScriptedTransport::new();
        transport.push_ok("/queue_status/T1", json!({"status": "pending"}));
        transport.push_ok("/queue_status/T1", json!({"status": "completed"}));
        let tracker = TaskTracker::new();
        let cancel_tracker = Arc::clone(&tracker);
        let scheduler = RecordingScheduler::with_hook(move |_| cancel_tracker.cancel());
        let p = TaskPoller::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            scheduler,
            tracker,
            ClientConfig::default(),
        );
        let handle = handle_for(&p, "T1");
        let (seen, on_progress) = collecting();

        assert!(matches!(
            p.watch(&handle, &on_progress).await,
            PollOutcome::Cancelled
        ));
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(transport.requests().len(), 1, "no tick after cancel");
    }

    #[tokio::test]
    async fn cancel_during_in_flight_request_suppresses_callback() {
        let transport = ScriptedTransport::new();
        transport.push_ok("/queue_status/T1", json!({"status": "completed"}));
        let p = poller(Arc::clone(&transport), RecordingScheduler::new());
        let tracker = Arc::clone(p.tracker());
        transport.on_request(move |_| tracker.cancel());
        let handle = handle_for(&p, "T1");
        let calls = AtomicUsize::new(0);
        let on_progress = |_: &TaskStatus| {
            calls.fetch_add(1, Ordering::SeqCst);
        };

        assert!(matches!(
            p.watch(&handle, &on_progress).await,
            PollOutcome::Cancelled
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(transport.requests().len(), 1, "result is never fetched");
    }

    #[test]
    fn new_run_deactivates_previous_handle() {
        let tracker = TaskTracker::new();
        let first = tracker.begin();
        let a = tracker.track(first, "A").unwrap();
        assert!(a.is_active());

        let second = tracker.begin();
        assert!(!a.is_active());
        assert!(tracker.track(first, "A2").is_none(), "stale run cannot track");
        let b = tracker.track(second, "B").unwrap();
        assert!(b.is_active());
        assert_eq!(tracker.current_task().as_deref(), Some("B"));
    }

    #[test]
    fn cancel_is_idempotent() {
        let tracker = TaskTracker::new();
        tracker.cancel();
        let generation = tracker.begin();
        let h = tracker.track(generation, "T").unwrap();
        tracker.cancel();
        tracker.cancel();
        assert!(!h.is_active());
        assert!(!tracker.is_live(generation));
        assert_eq!(tracker.current_task(), None);
    }

    #[test]
    fn cancel_waits_for_callback_in_flight() {
        let tracker = TaskTracker::new();
        let generation = tracker.begin();
        let (entered_tx, entered_rx) = mpsc::channel();
        let finished = Arc::new(AtomicBool::new(false));

        let worker = {
            let tracker = Arc::clone(&tracker);
            let finished = Arc::clone(&finished);
            std::thread::spawn(move || {
                tracker.dispatch_if_live(generation, || {
                    entered_tx.send(()).unwrap();
                    std::thread::sleep(Duration::from_millis(200));
                    finished.store(true, Ordering::SeqCst);
                })
            })
        };

        entered_rx.recv().unwrap();
        tracker.cancel();
        assert!(finished.load(Ordering::SeqCst), "cancel returned mid-callback");
        assert_eq!(worker.join().unwrap(), Some(()));
        assert_eq!(tracker.dispatch_if_live(generation, || ()), None);
    }

    #[test]
    fn callback_may_cancel_its_own_run() {
        let tracker = TaskTracker::new();
        let generation = tracker.begin();
        let handle = tracker.track(generation, "T").unwrap();

        let fired = tracker.dispatch_if_active(&handle, || tracker.cancel());

        assert_eq!(fired, Some(()));
        assert!(!handle.is_active());
        assert_eq!(tracker.dispatch_if_active(&handle, || ()), None);
    }

    #[test]
    fn superseded_handle_does_not_dispatch() {
        let tracker = TaskTracker::new();
        let first = tracker.begin();
        let old = tracker.track(first, "OLD").unwrap();
        let second = tracker.begin();

        assert_eq!(tracker.dispatch_if_active(&old, || ()), None);
        assert_eq!(tracker.dispatch_if_live(first, || ()), None);
        assert_eq!(tracker.dispatch_if_live(second, || 7), Some(7));
    }

    struct RecordingObserver {
        progress: AtomicUsize,
        completed: Mutex<Option<GenerationResult>>,
        errors: AtomicUsize,
    }

    impl PollObserver for RecordingObserver {
        fn on_progress(&self, _status: &TaskStatus) {
            self.progress.fetch_add(1, Ordering::SeqCst);
        }
        fn on_complete(&self, result: GenerationResult) {
            *self.completed.lock().unwrap() = Some(result);
        }
        fn on_error(&self, _error: RepromptError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn observer() -> Arc<RecordingObserver> {
        Arc::new(RecordingObserver {
            progress: AtomicUsize::new(0),
            completed: Mutex::new(None),
            errors: AtomicUsize::new(0),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn start_runs_to_completion_on_tokio_clock() {
        let transport = ScriptedTransport::new();
        transport.push_ok("/queue_status/T1", json!({"status": "pending"}));
        transport.push_ok("/queue_status/T1", json!({"status": "completed"}));
        transport.push_ok("/result/T1", json!({"images": ["u1"]}));
        let p = Arc::new(TaskPoller::new(
            transport,
            Arc::new(TokioScheduler),
            TaskTracker::new(),
            ClientConfig::default(),
        ));
        let obs = observer();

        let started = tokio::time::Instant::now();
        p.start("T1", Arc::clone(&obs) as Arc<dyn PollObserver>)
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(2000));
        assert_eq!(obs.progress.load(Ordering::SeqCst), 2);
        assert_eq!(
            obs.completed.lock().unwrap().as_ref().map(|r| r.images.clone()),
            Some(vec!["u1".to_string()])
        );
        assert_eq!(obs.errors.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn no_callbacks_after_cancel_returns() {
        let transport = ScriptedTransport::repeating(json!({"status": "processing"}));
        let p = Arc::new(TaskPoller::new(
            transport,
            Arc::new(TokioScheduler),
            TaskTracker::new(),
            ClientConfig::default(),
        ));
        let obs = observer();
        let join = p.start("T1", Arc::clone(&obs) as Arc<dyn PollObserver>);

        // Let the first tick run, then cancel while the loop sleeps.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(obs.progress.load(Ordering::SeqCst), 1);
        assert_eq!(p.state(), PollerState::Polling);
        p.cancel();
        let after_cancel = obs.progress.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(30)).await;
        join.await.unwrap();

        assert_eq!(obs.progress.load(Ordering::SeqCst), after_cancel);
        assert_eq!(obs.errors.load(Ordering::SeqCst), 0);
        assert!(obs.completed.lock().unwrap().is_none());
        assert_eq!(p.state(), PollerState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn restarting_with_new_id_silences_old_loop() {
        let transport = ScriptedTransport::repeating(json!({"status": "processing"}));
        let p = Arc::new(TaskPoller::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::new(TokioScheduler),
            TaskTracker::new(),
            ClientConfig::default(),
        ));
        let old = observer();
        let new = observer();

        let old_join = p.start("OLD", Arc::clone(&old) as Arc<dyn PollObserver>);
        tokio::time::sleep(Duration::from_millis(500)).await;
        let _new_join = p.start("NEW", Arc::clone(&new) as Arc<dyn PollObserver>);
        let old_seen = old.progress.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(10)).await;
        old_join.await.unwrap();

        assert_eq!(old.progress.load(Ordering::SeqCst), old_seen);
        assert!(new.progress.load(Ordering::SeqCst) >= 5);
        assert_eq!(p.tracker().current_task().as_deref(), Some("NEW"));
        p.cancel();
    }

    /// Blocks inside its first progress callback so that `cancel()` can be
    /// issued from another thread while the callback is running.
    struct SlowObserver {
        entered: Mutex<Option<mpsc::Sender<()>>>,
        cancelled: AtomicBool,
        late: AtomicUsize,
    }

    impl SlowObserver {
        fn note(&self) {
            if self.cancelled.load(Ordering::SeqCst) {
                self.late.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    impl PollObserver for SlowObserver {
        fn on_progress(&self, _status: &TaskStatus) {
            let entered = self.entered.lock().unwrap().take();
            if let Some(tx) = entered {
                tx.send(()).unwrap();
                std::thread::sleep(Duration::from_millis(200));
            }
            self.note();
        }
        fn on_complete(&self, _result: GenerationResult) {
            self.note();
        }
        fn on_error(&self, _error: RepromptError) {
            self.note();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_from_another_thread_silences_running_loop() {
        let transport = ScriptedTransport::repeating(json!({"status": "processing"}));
        let p = Arc::new(TaskPoller::new(
            transport,
            RecordingScheduler::new(),
            TaskTracker::new(),
            ClientConfig::default(),
        ));
        let (tx, rx) = mpsc::channel();
        let obs = Arc::new(SlowObserver {
            entered: Mutex::new(Some(tx)),
            cancelled: AtomicBool::new(false),
            late: AtomicUsize::new(0),
        });

        let join = p.start("T1", Arc::clone(&obs) as Arc<dyn PollObserver>);
        tokio::task::spawn_blocking(move || rx.recv())
            .await
            .unwrap()
            .unwrap();
        p.cancel();
        obs.cancelled.store(true, Ordering::SeqCst);
        join.await.unwrap();

        assert_eq!(obs.late.load(Ordering::SeqCst), 0);
        assert_eq!(p.state(), PollerState::Cancelled);
    }
}
