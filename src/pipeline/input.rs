//! Input resolution: turn a user-supplied path or URL into an [`ImageFile`].
//!
//! The service accepts PNG, JPEG, GIF and BMP up to a configured size. We
//! check the extension, the size, and the leading magic bytes here so a bad
//! file is rejected locally with a precise error instead of as an opaque
//! `success: false` after a full upload.

use crate::config::ClientConfig;
use crate::error::RepromptError;
use bytes::Bytes;
use image::ImageFormat;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Extensions the upload endpoint accepts (lower-case, no dot).
pub const ALLOWED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp"];

/// An image held in memory, ready to upload.
#[derive(Debug, Clone)]
pub struct ImageFile {
    name: String,
    bytes: Bytes,
    mime: &'static str,
}

impl ImageFile {
    /// Build an image from bytes already in memory, applying the same
    /// checks as [`resolve_input`].
    pub fn from_bytes(
        name: impl Into<String>,
        bytes: impl Into<Bytes>,
        max_bytes: u64,
    ) -> Result<Self, RepromptError> {
        let name = name.into();
        let bytes = bytes.into();
        let mime = validate_image(&name, &bytes, max_bytes)?;
        Ok(Self { name, bytes, mime })
    }

    /// File name sent in the multipart part.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn mime(&self) -> &'static str {
        self.mime
    }

    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve the input string to an in-memory image.
///
/// If the input is a URL, download it. Otherwise read it as a local file.
pub async fn resolve_input(input: &str, config: &ClientConfig) -> Result<ImageFile, RepromptError> {
    if is_url(input) {
        download_url(input, config).await
    } else {
        resolve_local(Path::new(input), config.max_upload_bytes).await
    }
}

async fn resolve_local(path: &Path, max_bytes: u64) -> Result<ImageFile, RepromptError> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| RepromptError::UnsupportedFile {
            name: path.display().to_string(),
            reason: "path has no file name".into(),
        })?;

    // Reject oversized files before reading them into memory.
    let meta = tokio::fs::metadata(path).await.map_err(|e| io_error(path, e))?;
    if meta.len() > max_bytes {
        return Err(RepromptError::FileTooLarge {
            name,
            size: meta.len(),
            limit: max_bytes,
        });
    }

    let bytes = tokio::fs::read(path).await.map_err(|e| io_error(path, e))?;
    debug!("Read local image: {} ({} bytes)", path.display(), bytes.len());
    ImageFile::from_bytes(name, bytes, max_bytes)
}

fn io_error(path: &Path, e: std::io::Error) -> RepromptError {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => RepromptError::PermissionDenied {
            path: path.to_path_buf(),
        },
        _ => RepromptError::FileNotFound {
            path: PathBuf::from(path),
        },
    }
}

async fn download_url(url: &str, config: &ClientConfig) -> Result<ImageFile, RepromptError> {
    info!("Downloading image from: {}", url);
    let timeout_secs = config.download_timeout_secs;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| RepromptError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            RepromptError::Timeout {
                url: url.to_string(),
                timeout_ms: timeout_secs * 1000,
            }
        } else {
            RepromptError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    })?;

    if !response.status().is_success() {
        return Err(RepromptError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| RepromptError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let name = filename_for_download(url, &bytes);
    info!("Downloaded {} bytes as '{}'", bytes.len(), name);
    ImageFile::from_bytes(name, bytes, config.max_upload_bytes)
}

/// Pick a file name for a downloaded image: the last URL path segment when
/// it carries an accepted extension, otherwise a name derived from the
/// sniffed format.
fn filename_for_download(url: &str, bytes: &[u8]) -> String {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(mut segments) = parsed.path_segments() {
            if let Some(last) = segments.next_back() {
                if extension_of(last).is_some_and(|ext| ALLOWED_EXTENSIONS.contains(&ext.as_str())) {
                    return last.to_string();
                }
            }
        }
    }

    let ext = match image::guess_format(bytes) {
        Ok(ImageFormat::Png) => "png",
        Ok(ImageFormat::Gif) => "gif",
        Ok(ImageFormat::Bmp) => "bmp",
        _ => "jpg",
    };
    format!("downloaded.{ext}")
}

fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
}

/// Validate name, size and content; return the MIME type to upload with.
fn validate_image(name: &str, bytes: &[u8], max_bytes: u64) -> Result<&'static str, RepromptError> {
    let unsupported = |reason: String| RepromptError::UnsupportedFile {
        name: name.to_string(),
        reason,
    };

    let ext = extension_of(name).ok_or_else(|| unsupported("file has no extension".into()))?;
    if !ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
        return Err(unsupported(format!(
            "extension '.{ext}' is not one of {}",
            ALLOWED_EXTENSIONS.join(", ")
        )));
    }

    if bytes.is_empty() {
        return Err(unsupported("file is empty".into()));
    }
    if bytes.len() as u64 > max_bytes {
        return Err(RepromptError::FileTooLarge {
            name: name.to_string(),
            size: bytes.len() as u64,
            limit: max_bytes,
        });
    }

    match image::guess_format(bytes) {
        Ok(ImageFormat::Png) => Ok("image/png"),
        Ok(ImageFormat::Jpeg) => Ok("image/jpeg"),
        Ok(ImageFormat::Gif) => Ok("image/gif"),
        Ok(ImageFormat::Bmp) => Ok("image/bmp"),
        Ok(other) => Err(unsupported(format!("{other:?} images are not accepted"))),
        Err(_) => Err(unsupported("content is not a recognised image".into())),
    }
}
