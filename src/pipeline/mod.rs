//! Post-processing of written attachments.
//!
//! Each staged file goes through a strictly sequential state machine:
//!
//! ```text
//! Written → Decrypting → Decrypted → Uploading → Uploaded → Cleaning → Done
//!               └──────→ DecryptFailed
//! ```
//!
//! A failed decryption is terminal: nothing is uploaded and the staged file
//! is kept. Upload failures are logged and do not stop cleanup. Any number
//! of pipelines may run at once; those sharing a derived path take turns.

pub mod archive;
pub mod cleanup;
pub mod decrypt;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;

use crate::config::Secret;
use crate::export::naming::remote_path;
use crate::model::attachment::PendingFile;

use self::archive::{Archive, UploadReceipt};
use self::decrypt::Decryptor;

/// Position of one file in the post-processing state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Written,
    Decrypting,
    Decrypted,
    Uploading,
    Uploaded,
    Cleaning,
    Done,
    DecryptFailed,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::DecryptFailed)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Written => "written",
            Self::Decrypting => "decrypting",
            Self::Decrypted => "decrypted",
            Self::Uploading => "uploading",
            Self::Uploaded => "uploaded",
            Self::Cleaning => "cleaning",
            Self::Done => "done",
            Self::DecryptFailed => "decrypt-failed",
        };
        f.write_str(name)
    }
}

/// Result of the upload step. Never fatal to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Stored(UploadReceipt),
    Failed(String),
}

/// Final state of one pipeline run.
#[derive(Debug)]
pub struct PipelineReport {
    pub file: PendingFile,
    pub stage: Stage,
    /// Why the run stopped early, if it did.
    pub error: Option<String>,
    pub upload: Option<UploadOutcome>,
    /// Staged files that could not be deleted.
    pub cleanup_failures: Vec<PathBuf>,
}

impl PipelineReport {
    pub fn is_done(&self) -> bool {
        self.stage == Stage::Done
    }

    fn advance(&mut self, next: Stage) {
        tracing::debug!(
            file = %self.file.original_path.display(),
            from = %self.stage,
            to = %next,
            "Pipeline stage"
        );
        self.stage = next;
    }
}

/// Decrypt → upload → cleanup, shared by all in-flight files.
pub struct Pipeline {
    decryptor: Arc<dyn Decryptor>,
    archive: Arc<dyn Archive>,
    passphrase: Secret,
    remote_prefix: String,
    locks: PathLocks,
}

impl Pipeline {
    pub fn new(
        decryptor: Arc<dyn Decryptor>,
        archive: Arc<dyn Archive>,
        passphrase: Secret,
        remote_prefix: impl Into<String>,
    ) -> Self {
        Self {
            decryptor,
            archive,
            passphrase,
            remote_prefix: remote_prefix.into(),
            locks: PathLocks::default(),
        }
    }

    /// Run one staged file to a terminal stage.
    pub async fn process(&self, file: PendingFile) -> PipelineReport {
        let _turn = self.locks.acquire(&file.derived_path).await;
        let mut report = PipelineReport {
            file,
            stage: Stage::Written,
            error: None,
            upload: None,
            cleanup_failures: Vec::new(),
        };

        report.advance(Stage::Decrypting);
        if let Err(e) = self
            .decryptor
            .decrypt(
                &report.file.original_path,
                &self.passphrase,
                &report.file.derived_path,
            )
            .await
        {
            tracing::error!(
                file = %report.file.original_path.display(),
                error = %e,
                "Decryption failed, keeping staged file"
            );
            report.error = Some(e.to_string());
            report.advance(Stage::DecryptFailed);
            return report;
        }
        report.advance(Stage::Decrypted);

        report.advance(Stage::Uploading);
        report.upload = Some(self.upload(&report.file).await);
        report.advance(Stage::Uploaded);

        report.advance(Stage::Cleaning);
        let failures = cleanup::remove_files(&[
            &report.file.original_path,
            &report.file.derived_path,
        ])
        .await;
        report.cleanup_failures = failures.into_iter().map(|(path, _)| path).collect();
        report.advance(Stage::Done);

        tracing::info!(
            file = %report.file.original_path.display(),
            derived = %report.file.derived_name(),
            "Pipeline complete"
        );
        report
    }

    async fn upload(&self, file: &PendingFile) -> UploadOutcome {
        let derived_name = file.derived_name();
        let Some(remote) = remote_path(&self.remote_prefix, &derived_name) else {
            tracing::error!(name = %derived_name, "Derived filename has no year segment, not uploading");
            return UploadOutcome::Failed(format!("no year segment in '{derived_name}'"));
        };

        match self.archive.upload(&remote, &file.derived_path).await {
            Ok(receipt) => {
                tracing::info!(
                    backend = self.archive.backend_name(),
                    remote = %receipt.stored_path,
                    size = receipt.size,
                    "Uploaded"
                );
                UploadOutcome::Stored(receipt)
            }
            Err(e) => {
                tracing::error!(
                    backend = self.archive.backend_name(),
                    remote = %remote,
                    error = %e,
                    "Upload failed, continuing with cleanup"
                );
                UploadOutcome::Failed(e.to_string())
            }
        }
    }
}

/// One async lock per derived path.
#[derive(Default, Clone)]
struct PathLocks {
    inner: Arc<Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>>,
}

impl PathLocks {
    async fn acquire(&self, path: &Path) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            map.entry(path.to_path_buf()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_path_is_serialized() {
        let locks = PathLocks::default();
        let path = PathBuf::from("/tmp/05-03-2023.pdf");

        let first = locks.acquire(&path).await;
        let waiting = {
            let locks = locks.clone();
            let path = path.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(&path).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        drop(first);
        tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_different_paths_do_not_wait() {
        let locks = PathLocks::default();
        let _a = locks.acquire(Path::new("/tmp/a.pdf")).await;
        tokio::time::timeout(Duration::from_secs(1), locks.acquire(Path::new("/tmp/b.pdf")))
            .await
            .unwrap();
    }

    #[test]
    fn test_terminal_stages() {
        assert!(Stage::Done.is_terminal());
        assert!(Stage::DecryptFailed.is_terminal());
        assert!(!Stage::Uploaded.is_terminal());
    }
}
