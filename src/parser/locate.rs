//! Attachment discovery over a message body tree.

use chrono::{DateTime, FixedOffset};

use crate::export::naming::target_filename;
use crate::model::attachment::LocatedAttachment;
use crate::model::structure::{Disposition, MessageStructureNode};

/// Collect the leaves of `root` whose disposition is `inline` or
/// `attachment`, depth-first and left-to-right.
///
/// Containers are never candidates. Leaves without a (recognised)
/// disposition are skipped silently.
pub fn attachment_leaves(root: &MessageStructureNode) -> Vec<&MessageStructureNode> {
    let mut found = Vec::new();
    // Explicit stack; children are pushed in reverse so the leftmost pops first.
    let mut stack = vec![root];

    while let Some(node) = stack.pop() {
        if !node.is_leaf() {
            stack.extend(node.children.iter().rev());
            continue;
        }
        if matches!(
            node.disposition_kind(),
            Disposition::Inline | Disposition::Attachment
        ) {
            found.push(node);
        }
    }

    found
}

/// Locate the attachments of one message.
pub fn locate(
    root: &MessageStructureNode,
    message_date: DateTime<FixedOffset>,
) -> Vec<LocatedAttachment> {
    attachment_leaves(root)
        .into_iter()
        .map(|node| LocatedAttachment {
            node: node.clone(),
            message_date,
            target_filename: target_filename(node),
        })
        .collect()
}
