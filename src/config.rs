//! Configuration types for the reprompt client.
//!
//! Two structs split the knobs by who owns them:
//!
//! * [`ClientConfig`]: how to talk to the service (server address, timeouts,
//!   poll interval, upload limits). Built once per [`crate::Pipeline`] via
//!   [`ClientConfigBuilder`].
//! * [`Settings`]: per-user values supplied by the settings store (API key,
//!   ModelScope cookie, output dimensions). Read-only to the core and
//!   validated at the start of every run.

use crate::error::RepromptError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Transport-level configuration.
///
/// # Example
/// ```rust
/// use reprompt::ClientConfig;
///
/// let config = ClientConfig::builder()
///     .base_url("http://127.0.0.1:5000")
///     .poll_interval_ms(1500)
///     .build()
///     .unwrap();
/// assert_eq!(config.poll_interval().as_millis(), 1500);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Service root, without a trailing slash. Default: `http://localhost:5000`.
    pub base_url: String,

    /// Hard deadline for every JSON request and for the upload. Default: 30000.
    pub request_timeout_ms: u64,

    /// Delay between two status queries of a generation task. Default: 2000.
    pub poll_interval_ms: u64,

    /// Largest accepted image in bytes. Default: 16 MiB.
    pub max_upload_bytes: u64,

    /// Timeout for fetching an image given by URL, in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Size of each body chunk while uploading; one progress report per
    /// chunk. Default: 64 KiB.
    pub upload_chunk_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
            request_timeout_ms: 30_000,
            poll_interval_ms: 2_000,
            max_upload_bytes: 16 * 1024 * 1024,
            download_timeout_secs: 120,
            upload_chunk_bytes: 64 * 1024,
        }
    }
}

impl ClientConfig {
    /// Create a new builder for `ClientConfig`.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Join an endpoint path onto the base URL.
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn request_timeout_ms(mut self, ms: u64) -> Self {
        self.config.request_timeout_ms = ms;
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms.max(100);
        self
    }

    pub fn max_upload_bytes(mut self, bytes: u64) -> Self {
        self.config.max_upload_bytes = bytes;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn upload_chunk_bytes(mut self, bytes: usize) -> Self {
        self.config.upload_chunk_bytes = bytes.max(1024);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ClientConfig, RepromptError> {
        let c = &self.config;
        let url = reqwest::Url::parse(&c.base_url).map_err(|e| {
            RepromptError::InvalidConfig(format!("base URL '{}' is not valid: {}", c.base_url, e))
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(RepromptError::InvalidConfig(format!(
                "base URL must be http or https, got '{}'",
                url.scheme()
            )));
        }
        if c.request_timeout_ms == 0 {
            return Err(RepromptError::InvalidConfig(
                "request timeout must be > 0".into(),
            ));
        }
        if c.download_timeout_secs == 0 {
            return Err(RepromptError::InvalidConfig(
                "download timeout must be > 0".into(),
            ));
        }
        if c.max_upload_bytes == 0 {
            return Err(RepromptError::InvalidConfig(
                "upload limit must be > 0".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── User settings ────────────────────────────────────────────────────────

/// One LoRA adapter applied by the generation service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoraArg {
    pub model_version_id: u64,
    pub scale: f32,
}

/// Per-user settings: credentials and generation dimensions.
///
/// Deserialises from the settings store's JSON; missing fields take the
/// defaults below.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Key for the captioning (reverse-prompt) model.
    pub api_key: String,
    /// ModelScope session cookie used by the generation endpoint.
    pub cookie: String,
    /// Output width in pixels. Default: 1104.
    pub width: u32,
    /// Output height in pixels. Default: 1472.
    pub height: u32,
    /// Extra generation arguments forwarded verbatim.
    pub lora_args: Vec<LoraArg>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            cookie: String::new(),
            width: 1104,
            height: 1472,
            lora_args: vec![
                LoraArg {
                    model_version_id: 334_516,
                    scale: 0.5,
                },
                LoraArg {
                    model_version_id: 356_161,
                    scale: 0.7,
                },
            ],
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("api_key", &redact(&self.api_key))
            .field("cookie", &redact(&self.cookie))
            .field("width", &self.width)
            .field("height", &self.height)
            .field("lora_args", &self.lora_args)
            .finish()
    }
}

fn redact(secret: &str) -> &'static str {
    if secret.is_empty() {
        "<unset>"
    } else {
        "<redacted>"
    }
}

impl Settings {
    pub fn new(api_key: impl Into<String>, cookie: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            cookie: cookie.into(),
            ..Self::default()
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Read settings from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RepromptError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => RepromptError::FileNotFound {
                path: path.to_path_buf(),
            },
            std::io::ErrorKind::PermissionDenied => RepromptError::PermissionDenied {
                path: path.to_path_buf(),
            },
            _ => RepromptError::InvalidConfig(format!("{}: {}", path.display(), e)),
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| RepromptError::InvalidConfig(format!("{}: {}", path.display(), e)))
    }

    /// Check the credentials a run needs. No network call is made.
    pub fn validate(&self) -> Result<(), RepromptError> {
        if self.api_key.trim().is_empty() {
            return Err(RepromptError::Validation(
                "missing API key: configure the captioning API key first".into(),
            ));
        }
        if self.cookie.trim().is_empty() {
            return Err(RepromptError::Validation(
                "missing ModelScope cookie: configure the cookie first".into(),
            ));
        }
        if self.width == 0 || self.height == 0 {
            return Err(RepromptError::Validation(format!(
                "image size must be positive, got {}x{}",
                self.width, self.height
            )));
        }
        Ok(())
    }
}
