//! Remote archive for decrypted files.
//!
//! Two backends: Dropbox (HTTP upload with a streamed request body) and a
//! local directory tree, used for offline runs and tests.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::io::ReaderStream;

use crate::config::{ArchiveBackend, ArchiveConfig, Secret};

/// Archive operation errors.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Upload rejected with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Invalid archive path: {0}")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for archive operations.
pub type ArchiveResult<T> = std::result::Result<T, ArchiveError>;

/// What the archive reports back for a stored file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    /// Where the file ended up (may differ from the request on rename).
    pub stored_path: String,
    pub size: u64,
}

/// A place decrypted files are filed into.
#[async_trait]
pub trait Archive: Send + Sync {
    /// Upload the file at `local` to `remote_path` (`/prefix/2023/x.pdf`).
    async fn upload(&self, remote_path: &str, local: &Path) -> ArchiveResult<UploadReceipt>;

    fn backend_name(&self) -> &'static str;
}

/// Build the archive selected in configuration.
pub fn create_archive(config: &ArchiveConfig) -> ArchiveResult<Box<dyn Archive>> {
    match config.backend {
        ArchiveBackend::Dropbox => {
            let token = config.dropbox_token.clone().ok_or_else(|| {
                ArchiveError::Config("archive.dropbox_token is not set".to_string())
            })?;
            Ok(Box::new(DropboxArchive::new(
                config.dropbox_endpoint.clone(),
                token,
            )?))
        }
        ArchiveBackend::Local => {
            let dir = config.local_dir.clone().ok_or_else(|| {
                ArchiveError::Config("archive.local_dir is not set".to_string())
            })?;
            Ok(Box::new(LocalArchive::new(dir)))
        }
    }
}

// ── Dropbox ─────────────────────────────────────────────────────

/// `Dropbox-API-Arg` header payload for `files/upload`.
#[derive(Debug, Serialize)]
struct UploadArg<'a> {
    path: &'a str,
    mode: &'a str,
    autorename: bool,
    mute: bool,
}

/// Subset of the file metadata returned by `files/upload`.
#[derive(Debug, Deserialize)]
struct FileMetadata {
    #[serde(default)]
    path_display: Option<String>,
    #[serde(default)]
    size: u64,
}

/// Dropbox `files/upload` client.
pub struct DropboxArchive {
    client: reqwest::Client,
    endpoint: String,
    token: Secret,
}

impl DropboxArchive {
    pub fn new(endpoint: impl Into<String>, token: Secret) -> ArchiveResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("mailstash/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ArchiveError::Config(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            token,
        })
    }
}

#[async_trait]
impl Archive for DropboxArchive {
    async fn upload(&self, remote_path: &str, local: &Path) -> ArchiveResult<UploadReceipt> {
        let file = tokio::fs::File::open(local).await?;
        let length = file.metadata().await?.len();
        let arg = serde_json::to_string(&UploadArg {
            path: remote_path,
            mode: "add",
            autorename: true,
            mute: false,
        })
        .map_err(|e| ArchiveError::UploadFailed(e.to_string()))?;

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.token.expose())
            .header("Dropbox-API-Arg", arg)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header(reqwest::header::CONTENT_LENGTH, length)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await
            .map_err(|e| ArchiveError::UploadFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ArchiveError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let meta: FileMetadata = response
            .json()
            .await
            .map_err(|e| ArchiveError::UploadFailed(format!("unreadable response: {e}")))?;
        Ok(UploadReceipt {
            stored_path: meta.path_display.unwrap_or_else(|| remote_path.to_string()),
            size: meta.size,
        })
    }

    fn backend_name(&self) -> &'static str {
        "dropbox"
    }
}

// ── Local directory ─────────────────────────────────────────────

/// Files uploads into a directory tree rooted at `base_path`.
#[derive(Debug, Clone)]
pub struct LocalArchive {
    base_path: PathBuf,
}

impl LocalArchive {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Map a remote path onto the base directory, rejecting traversal.
    fn key_to_path(&self, remote_path: &str) -> ArchiveResult<PathBuf> {
        let key = remote_path.trim_start_matches('/');
        if key.is_empty() || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
            return Err(ArchiveError::InvalidPath(remote_path.to_string()));
        }
        Ok(self.base_path.join(key))
    }
}

#[async_trait]
impl Archive for LocalArchive {
    async fn upload(&self, remote_path: &str, local: &Path) -> ArchiveResult<UploadReceipt> {
        let target = unique_path(&self.key_to_path(remote_path)?);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let size = tokio::fs::copy(local, &target).await?;
        let stored_path = target
            .strip_prefix(&self.base_path)
            .map(|p| format!("/{}", p.to_string_lossy()))
            .unwrap_or_else(|_| target.to_string_lossy().into_owned());
        Ok(UploadReceipt { stored_path, size })
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }
}

/// If `path` already exists, append a counter to make it unique.
fn unique_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }

    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("file");
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let parent = path.parent().unwrap_or(Path::new("."));

    for i in 1..1000 {
        let candidate = if ext.is_empty() {
            parent.join(format!("{stem} ({i})"))
        } else {
            parent.join(format!("{stem} ({i}).{ext}"))
        };
        if !candidate.exists() {
            return candidate;
        }
    }

    parent.join(format!("{stem} (dup).{ext}"))
}
