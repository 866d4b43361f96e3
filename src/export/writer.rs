//! Streaming attachment writer.
//!
//! Pipes a fetched part through the transfer decoder into its staging file
//! and only reports success once the file has been flushed and closed, so
//! post-processing never sees a half-written attachment.

use std::io;
use std::path::{Path, PathBuf};

use futures::TryStreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{Result, StashError};
use crate::export::naming::derived_filename;
use crate::model::attachment::{LocatedAttachment, PendingFile};
use crate::parser::decode::{self, ByteStream};

/// Writes located attachments into a staging directory.
#[derive(Debug, Clone)]
pub struct AttachmentWriter {
    staging_dir: PathBuf,
    derived_extension: String,
}

impl AttachmentWriter {
    pub fn new(staging_dir: impl Into<PathBuf>, derived_extension: impl Into<String>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            derived_extension: derived_extension.into(),
        }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Create the staging directory if it does not exist yet.
    pub async fn prepare(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.staging_dir)
            .await
            .map_err(|e| StashError::io(&self.staging_dir, e))
    }

    /// Decode `raw` according to the attachment's transfer encoding and
    /// write it to `<staging>/<target filename>`.
    ///
    /// An existing file of the same name is overwritten. If the stream
    /// fails midway the partial file is left behind.
    pub async fn write(
        &self,
        attachment: &LocatedAttachment,
        raw: ByteStream,
    ) -> Result<PendingFile> {
        let original_path = self.staging_dir.join(&attachment.target_filename);
        let derived_path = self.staging_dir.join(derived_filename(
            &attachment.message_date,
            &self.derived_extension,
        ));

        tracing::info!(
            part = %attachment.part_id(),
            encoding = %attachment.transfer_encoding(),
            path = %original_path.display(),
            "Streaming attachment to file"
        );

        let decoded = decode::wrap(raw, attachment.transfer_encoding());
        let mut file = tokio::fs::File::create(&original_path)
            .await
            .map_err(|e| StashError::io(&original_path, e))?;
        let size = write_stream(decoded, &mut file)
            .await
            .map_err(|e| stream_error(&original_path, e))?;

        tracing::info!(
            path = %original_path.display(),
            size = %humansize::format_size(size, humansize::BINARY),
            "Done writing to file"
        );

        Ok(PendingFile {
            original_path,
            derived_path,
            source_date: attachment.message_date,
            size,
        })
    }
}

/// Copy every chunk of `stream` into `out`, then flush and shut it down.
///
/// Returns the number of bytes written. Completion is reported only after
/// `out` has acknowledged the flush, even when the stream ended earlier.
pub async fn write_stream<W>(mut stream: ByteStream, out: &mut W) -> io::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0u64;
    while let Some(chunk) = stream.try_next().await? {
        out.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    out.flush().await?;
    out.shutdown().await?;
    Ok(written)
}

fn stream_error(path: &Path, err: io::Error) -> StashError {
    if !err
        .get_ref()
        .is_some_and(|inner| inner.is::<decode::DecodeError>())
    {
        return StashError::io(path, err);
    }
    match err.into_inner().map(|inner| inner.downcast::<decode::DecodeError>()) {
        Some(Ok(decode)) => StashError::Decode(*decode),
        _ => StashError::io(path, io::Error::from(io::ErrorKind::InvalidData)),
    }
}
