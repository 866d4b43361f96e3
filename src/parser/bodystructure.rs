//! Conversion of IMAP `BODYSTRUCTURE` responses into body structure trees.

use imap_proto::types::{
    BodyContentCommon, BodyParams, BodyStructure, ContentEncoding, SectionPath,
};

use crate::model::structure::{MessageStructureNode, PartId, TransferEncoding};

/// Build an owned tree from a parsed `BODYSTRUCTURE`, assigning part ids.
///
/// A non-multipart message becomes a single leaf with part id `1`. An
/// encapsulated `message/rfc822` part is a leaf: it is extracted as a
/// whole, never descended into.
pub fn structure_tree(body: &BodyStructure<'_>) -> MessageStructureNode {
    match body {
        BodyStructure::Multipart { .. } => convert(body, None),
        _ => convert(body, Some(PartId::new("1"))),
    }
}

fn convert(body: &BodyStructure<'_>, part_id: Option<PartId>) -> MessageStructureNode {
    match body {
        BodyStructure::Multipart { common, bodies, .. } => {
            let children = bodies
                .iter()
                .enumerate()
                .map(|(i, child)| convert(child, Some(PartId::child(part_id.as_ref(), i))))
                .collect();
            let mut node =
                MessageStructureNode::container(part_id, &common.ty.subtype, children);
            add_params(&mut node, &common.ty.params);
            node
        }
        BodyStructure::Basic { common, other, .. }
        | BodyStructure::Text { common, other, .. }
        | BodyStructure::Message { common, other, .. } => leaf(
            common,
            transfer_encoding(&other.transfer_encoding),
            part_id.unwrap_or_else(|| PartId::new("1")),
        ),
    }
}

fn leaf(
    common: &BodyContentCommon<'_>,
    encoding: TransferEncoding,
    part_id: PartId,
) -> MessageStructureNode {
    let mut node = MessageStructureNode::leaf(part_id, &common.ty.ty, &common.ty.subtype, encoding);
    add_params(&mut node, &common.ty.params);
    if let Some(disposition) = &common.disposition {
        node.disposition = Some(disposition.ty.to_string());
        add_params(&mut node, &disposition.params);
    }
    node
}

/// Later keys do not overwrite earlier ones, so a Content-Type `name`
/// wins over a Content-Disposition parameter of the same key.
fn add_params(node: &mut MessageStructureNode, params: &BodyParams<'_>) {
    for (key, value) in params.iter().flatten() {
        node.parameters
            .entry(key.to_ascii_lowercase())
            .or_insert_with(|| value.to_string());
    }
}

fn transfer_encoding(encoding: &ContentEncoding<'_>) -> TransferEncoding {
    match encoding {
        ContentEncoding::SevenBit => TransferEncoding::SevenBit,
        ContentEncoding::EightBit => TransferEncoding::EightBit,
        ContentEncoding::Binary => TransferEncoding::Binary,
        ContentEncoding::Base64 => TransferEncoding::Base64,
        ContentEncoding::QuotedPrintable => TransferEncoding::QuotedPrintable,
        ContentEncoding::Other(other) => TransferEncoding::parse(other),
    }
}

/// The `BODY[<part>]` section path for a part id.
pub fn section_path(part_id: &PartId) -> Option<SectionPath> {
    part_id.segments().map(|segments| SectionPath::Part(segments, None))
}
