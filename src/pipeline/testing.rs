//! In-process doubles for the network and clock seams, used by unit tests.

use crate::error::RepromptError;
use crate::output::UploadResult;
use crate::pipeline::input::ImageFile;
use crate::pipeline::poller::Scheduler;
use crate::pipeline::transport::{RequestSpec, Transport};
use crate::pipeline::upload::{UploadProgress, Uploader};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type RequestHook = Box<dyn Fn(&RequestSpec) + Send + Sync>;

/// Answers requests from a queue of `(url suffix, result)` pairs in order.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<(String, Result<Value, RepromptError>)>>,
    fallback: Option<Value>,
    requests: Mutex<Vec<RequestSpec>>,
    hook: Mutex<Option<RequestHook>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer every request with `value` once the script is exhausted.
    pub fn repeating(value: Value) -> Arc<Self> {
        Arc::new(Self {
            fallback: Some(value),
            ..Self::default()
        })
    }

    pub fn push_ok(&self, url_suffix: &str, value: Value) {
        self.script
            .lock()
            .unwrap()
            .push_back((url_suffix.to_string(), Ok(value)));
    }

    pub fn push_err(&self, url_suffix: &str, error: RepromptError) {
        self.script
            .lock()
            .unwrap()
            .push_back((url_suffix.to_string(), Err(error)));
    }

    /// Run `hook` while each request is "in flight", before it answers.
    pub fn on_request(&self, hook: impl Fn(&RequestSpec) + Send + Sync + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn requests(&self) -> Vec<RequestSpec> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn request(&self, spec: RequestSpec) -> Result<Value, RepromptError> {
        self.requests.lock().unwrap().push(spec.clone());
        if let Some(hook) = self.hook.lock().unwrap().as_ref() {
            hook(&spec);
        }
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some((suffix, result)) => {
                assert!(
                    spec.url.ends_with(&suffix),
                    "expected request to ...{suffix}, got {}",
                    spec.url
                );
                result
            }
            None => match &self.fallback {
                Some(value) => Ok(value.clone()),
                None => panic!("unscripted request to {}", spec.url),
            },
        }
    }
}

/// Reports the given percentages, then returns a fixed result.
pub struct ScriptedUploader {
    percents: Vec<u8>,
    result: Mutex<Option<Result<UploadResult, RepromptError>>>,
    calls: Mutex<usize>,
}

impl ScriptedUploader {
    pub fn new(percents: Vec<u8>, result: Result<UploadResult, RepromptError>) -> Arc<Self> {
        Arc::new(Self {
            percents,
            result: Mutex::new(Some(result)),
            calls: Mutex::new(0),
        })
    }

    pub fn ok(filename: &str) -> Arc<Self> {
        Self::new(
            vec![0, 50, 100],
            Ok(UploadResult {
                success: true,
                filename: Some(filename.to_string()),
                error: None,
            }),
        )
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl Uploader for ScriptedUploader {
    async fn upload(
        &self,
        _file: &ImageFile,
        on_progress: UploadProgress,
    ) -> Result<UploadResult, RepromptError> {
        *self.calls.lock().unwrap() += 1;
        for p in &self.percents {
            on_progress(*p);
        }
        self.result
            .lock()
            .unwrap()
            .take()
            .expect("ScriptedUploader used more than once")
    }
}

type SchedulerHook = Box<dyn Fn(Duration) + Send + Sync>;

/// Returns immediately, remembering every requested interval.
#[derive(Default)]
pub struct RecordingScheduler {
    intervals: Mutex<Vec<Duration>>,
    hook: Option<SchedulerHook>,
}

impl RecordingScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Run `hook` at each inter-tick delay.
    pub fn with_hook(hook: impl Fn(Duration) + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            intervals: Mutex::new(Vec::new()),
            hook: Some(Box::new(hook)),
        })
    }

    pub fn intervals(&self) -> Vec<Duration> {
        self.intervals.lock().unwrap().clone()
    }
}

#[async_trait]
impl Scheduler for RecordingScheduler {
    async fn after(&self, interval: Duration) {
        self.intervals.lock().unwrap().push(interval);
        if let Some(hook) = &self.hook {
            hook(interval);
        }
    }
}

/// A tiny valid PNG header, enough to pass input validation.
pub fn png_file(name: &str) -> ImageFile {
    ImageFile::from_bytes(name, b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR".to_vec(), 1024)
        .expect("valid test image")
}
