//! Removal of staged files once they have been archived.

use std::path::{Path, PathBuf};

use futures::future::join_all;

/// Delete every path concurrently and wait for all attempts to finish.
///
/// One failure never stops the others. Returns the paths that could not be
/// removed, each already logged.
pub async fn remove_files<P>(paths: &[P]) -> Vec<(PathBuf, std::io::Error)>
where
    P: AsRef<Path> + Sync,
{
    let attempts = paths.iter().map(|path| async move {
        let path = path.as_ref();
        let result = tokio::fs::remove_file(path).await;
        (path.to_path_buf(), result)
    });

    let mut failures = Vec::new();
    for (path, result) in join_all(attempts).await {
        match result {
            Ok(()) => tracing::debug!(path = %path.display(), "Removed staged file"),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove staged file");
                failures.push((path, e));
            }
        }
    }
    failures
}
