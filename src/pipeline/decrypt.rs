//! Decryption through an external tool (qpdf by default).

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::{DecryptConfig, Secret};
use crate::error::{Result, StashError};

/// Turns an encrypted staged file into a decrypted copy.
#[async_trait]
pub trait Decryptor: Send + Sync {
    /// Decrypt `input` with `passphrase` into `output`.
    async fn decrypt(&self, input: &Path, passphrase: &Secret, output: &Path) -> Result<()>;
}

/// Which exit statuses count as a successful decryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitPolicy {
    /// Any exit, even a crash, is success.
    AnyExit,
    /// Only the listed exit codes are success.
    Codes(Vec<i32>),
}

impl ExitPolicy {
    pub fn accepts(&self, code: Option<i32>) -> bool {
        match self {
            Self::AnyExit => true,
            Self::Codes(codes) => code.is_some_and(|c| codes.contains(&c)),
        }
    }
}

/// Runs `<program> <input> --decrypt --password=<secret> <output>`.
#[derive(Debug, Clone)]
pub struct QpdfDecryptor {
    program: PathBuf,
    policy: ExitPolicy,
}

impl QpdfDecryptor {
    pub fn new(program: impl Into<PathBuf>, policy: ExitPolicy) -> Self {
        Self {
            program: program.into(),
            policy,
        }
    }

    pub fn from_config(config: &DecryptConfig) -> Self {
        let policy = if config.accept_any_exit {
            ExitPolicy::AnyExit
        } else {
            ExitPolicy::Codes(config.success_codes.clone())
        };
        Self::new(&config.program, policy)
    }
}

#[async_trait]
impl Decryptor for QpdfDecryptor {
    async fn decrypt(&self, input: &Path, passphrase: &Secret, output: &Path) -> Result<()> {
        let result = Command::new(&self.program)
            .arg(input)
            .arg("--decrypt")
            .arg(format!("--password={}", passphrase.expose()))
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| StashError::DecryptSpawn {
                program: self.program.clone(),
                source,
            })?;

        let code = result.status.code();
        let stderr = String::from_utf8_lossy(&result.stderr).trim().to_string();
        if !self.policy.accepts(code) {
            return Err(StashError::DecryptFailed {
                path: input.to_path_buf(),
                code,
                stderr,
            });
        }
        if !stderr.is_empty() {
            tracing::warn!(path = %input.display(), code = ?code, stderr = %stderr, "Decryption tool reported warnings");
        }
        tracing::info!(
            input = %input.display(),
            output = %output.display(),
            "Decrypted"
        );
        Ok(())
    }
}
