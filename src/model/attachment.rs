//! Attachments located in a message and the files written for them.

use std::path::PathBuf;

use chrono::{DateTime, FixedOffset};

use super::structure::{MessageStructureNode, PartId, TransferEncoding};

/// Identifier of a message in the mailbox (the IMAP UID).
pub type MessageId = u32;

/// A leaf part selected for extraction, plus the context of its message.
///
/// Created by the locator, consumed once by the writer.
#[derive(Debug, Clone)]
pub struct LocatedAttachment {
    /// The leaf node itself.
    pub node: MessageStructureNode,
    /// Date of the owning message (not of the part).
    pub message_date: DateTime<FixedOffset>,
    /// Sanitized output filename derived from the declared name.
    pub target_filename: String,
}

impl LocatedAttachment {
    /// Part address for the follow-up fetch. A single-part message is
    /// addressed as part `1`.
    pub fn part_id(&self) -> PartId {
        self.node
            .part_id
            .clone()
            .unwrap_or_else(|| PartId::new("1"))
    }

    pub fn transfer_encoding(&self) -> &TransferEncoding {
        &self.node.transfer_encoding
    }
}

/// One attachment that has been fully flushed to disk and awaits
/// post-processing.
///
/// Owned by the pipeline until both paths have been deleted.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingFile {
    /// The file as written by the writer (still encrypted).
    pub original_path: PathBuf,
    /// Where the decrypted copy goes, named `dd-mm-yyyy.<ext>`.
    pub derived_path: PathBuf,
    /// Date of the message the attachment came from.
    pub source_date: DateTime<FixedOffset>,
    /// Bytes written to `original_path`.
    pub size: u64,
}

impl PendingFile {
    /// File name component of `derived_path`.
    pub fn derived_name(&self) -> String {
        self.derived_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}
