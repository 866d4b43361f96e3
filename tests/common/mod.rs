//! Fakes and helpers shared by the integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use mailstash::config::Secret;
use mailstash::error::{Result, StashError};
use mailstash::pipeline::archive::{Archive, ArchiveError, ArchiveResult, UploadReceipt};
use mailstash::pipeline::decrypt::Decryptor;
use mailstash::pipeline::Pipeline;

pub fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

/// Ordered record of what the fakes were asked to do.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events().iter().filter(|e| e.starts_with(prefix)).count()
    }

    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.events().iter().position(|e| e.starts_with(prefix))
    }

    pub fn last_position(&self, prefix: &str) -> Option<usize> {
        self.events().iter().rposition(|e| e.starts_with(prefix))
    }
}

/// "Decrypts" by copying the input, after a short delay.
pub struct CopyDecryptor {
    pub log: EventLog,
    pub delay: Duration,
}

#[async_trait]
impl Decryptor for CopyDecryptor {
    async fn decrypt(&self, input: &Path, _passphrase: &Secret, output: &Path) -> Result<()> {
        self.log.push(format!("decrypt {}", file_name(input)));
        tokio::time::sleep(self.delay).await;
        tokio::fs::copy(input, output)
            .await
            .map_err(|e| StashError::io(output, e))?;
        Ok(())
    }
}

/// Always fails the way a wrong password does.
pub struct FailingDecryptor {
    pub log: EventLog,
}

#[async_trait]
impl Decryptor for FailingDecryptor {
    async fn decrypt(&self, input: &Path, _passphrase: &Secret, _output: &Path) -> Result<()> {
        self.log.push(format!("decrypt {}", file_name(input)));
        Err(StashError::DecryptFailed {
            path: input.to_path_buf(),
            code: Some(2),
            stderr: "invalid password".to_string(),
        })
    }
}

/// Records uploads and keeps the uploaded bytes; optionally rejects them.
#[derive(Default)]
pub struct RecordingArchive {
    pub log: EventLog,
    pub reject: bool,
    pub stored: Mutex<Vec<(String, Vec<u8>)>>,
}

impl RecordingArchive {
    pub fn stored(&self) -> Vec<(String, Vec<u8>)> {
        self.stored.lock().unwrap().clone()
    }
}

#[async_trait]
impl Archive for RecordingArchive {
    async fn upload(&self, remote_path: &str, local: &Path) -> ArchiveResult<UploadReceipt> {
        self.log.push(format!("upload {remote_path}"));
        if self.reject {
            return Err(ArchiveError::Rejected {
                status: 409,
                body: "path/conflict".to_string(),
            });
        }
        let bytes = tokio::fs::read(local).await?;
        let size = bytes.len() as u64;
        self.stored
            .lock()
            .unwrap()
            .push((remote_path.to_string(), bytes));
        Ok(UploadReceipt {
            stored_path: remote_path.to_string(),
            size,
        })
    }

    fn backend_name(&self) -> &'static str {
        "recording"
    }
}

pub fn pipeline(decryptor: Arc<dyn Decryptor>, archive: Arc<dyn Archive>) -> Arc<Pipeline> {
    Arc::new(Pipeline::new(
        decryptor,
        archive,
        Secret::new("pdf-password"),
        "/statement_ppc",
    ))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
