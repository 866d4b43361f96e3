//! Local `.eml` files as a message source.
//!
//! Parses a bare RFC 5322 message with `mail-parser` into the same body
//! structure tree an IMAP `BODYSTRUCTURE` produces, and keeps the byte
//! range of every leaf so its still-encoded body can be streamed through
//! the decoder exactly like a fetched part.

use std::collections::BTreeMap;
use std::ops::Range;
use std::path::Path;

use bytes::Bytes;
use chrono::{DateTime, FixedOffset, Utc};
use mail_parser::{MessageParser, MimeHeaders, PartType};

use crate::error::{Result, StashError};
use crate::model::structure::{MessageStructureNode, PartId, TransferEncoding};
use crate::parser::decode::{self, ByteStream};

/// Chunk size used when streaming a part body.
const STREAM_CHUNK: usize = 16 * 1024;

/// Maximum multipart nesting followed.
const MAX_DEPTH: usize = 32;

/// A parsed local message.
#[derive(Debug, Clone)]
pub struct ParsedEml {
    raw: Bytes,
    /// Body structure tree with IMAP-style part ids.
    pub root: MessageStructureNode,
    /// `Date:` header, or the parse time when missing.
    pub date: DateTime<FixedOffset>,
    /// Sender address.
    pub from: Option<String>,
    pub subject: Option<String>,
    sections: BTreeMap<PartId, Range<usize>>,
}

impl ParsedEml {
    /// Still-encoded body bytes of a leaf part.
    pub fn raw_part(&self, part: &PartId) -> Option<Bytes> {
        let range = self.sections.get(part)?;
        if range.start > range.end || range.end > self.raw.len() {
            return None;
        }
        Some(self.raw.slice(range.clone()))
    }

    /// Raw body of a leaf part as a chunked stream.
    pub fn part_stream(&self, part: &PartId) -> Option<ByteStream> {
        self.raw_part(part)
            .map(|body| decode::chunked(body, STREAM_CHUNK))
    }
}

/// Read and parse an `.eml` file.
pub fn read_eml(path: impl AsRef<Path>) -> Result<ParsedEml> {
    let path = path.as_ref();
    let data = std::fs::read(path).map_err(|e| StashError::io(path, e))?;
    parse_eml(Bytes::from(data))
        .ok_or_else(|| StashError::InvalidPath(format!("{}: not a MIME message", path.display())))
}

/// Parse raw message bytes. `None` if `mail-parser` rejects them.
pub fn parse_eml(raw: Bytes) -> Option<ParsedEml> {
    let message = MessageParser::default().parse(raw.as_ref())?;

    let mut sections = BTreeMap::new();
    let root = if message.parts.is_empty() {
        MessageStructureNode::leaf(PartId::new("1"), "text", "plain", TransferEncoding::default())
    } else {
        convert(&message, 0, None, &mut sections, 0)
    };

    let date = message_date(&message).unwrap_or_else(|| {
        tracing::warn!("Message has no usable Date header, using current time");
        Utc::now().fixed_offset()
    });

    let from = message
        .from()
        .and_then(|addr| addr.first())
        .and_then(|addr| addr.address())
        .map(str::to_string);
    let subject = message.subject().map(str::to_string);

    Some(ParsedEml {
        raw,
        root,
        date,
        from,
        subject,
        sections,
    })
}

fn convert(
    message: &mail_parser::Message<'_>,
    index: usize,
    part_id: Option<PartId>,
    sections: &mut BTreeMap<PartId, Range<usize>>,
    depth: usize,
) -> MessageStructureNode {
    let Some(part) = message.parts.get(index) else {
        return MessageStructureNode::leaf(
            part_id.unwrap_or_else(|| PartId::new("1")),
            "application",
            "octet-stream",
            TransferEncoding::default(),
        );
    };

    let (media_type, media_subtype) = part
        .content_type()
        .map(|ct| {
            (
                ct.ctype().to_string(),
                ct.subtype().unwrap_or_default().to_string(),
            )
        })
        .unwrap_or_else(|| ("text".to_string(), "plain".to_string()));

    if let PartType::Multipart(children) = &part.body {
        let children = if depth >= MAX_DEPTH {
            tracing::warn!(depth, "Multipart nesting too deep, ignoring subtree");
            Vec::new()
        } else {
            children
                .iter()
                .enumerate()
                .map(|(i, &child)| {
                    let id = PartId::child(part_id.as_ref(), i);
                    convert(message, child, Some(id), sections, depth + 1)
                })
                .collect()
        };
        return MessageStructureNode::container(part_id, &media_subtype, children);
    }

    let id = part_id.unwrap_or_else(|| PartId::new("1"));
    let encoding = part
        .content_transfer_encoding()
        .map(TransferEncoding::parse)
        .unwrap_or_default();
    let mut node = MessageStructureNode::leaf(id.clone(), &media_type, &media_subtype, encoding);

    if let Some(ct) = part.content_type() {
        for key in ["name", "charset"] {
            if let Some(value) = ct.attribute(key) {
                node.parameters.insert(key.to_string(), value.to_string());
            }
        }
    }
    if let Some(disposition) = part.content_disposition() {
        node.disposition = Some(disposition.ctype().to_string());
        if let Some(filename) = disposition.attribute("filename") {
            node.parameters
                .entry("filename".to_string())
                .or_insert_with(|| filename.to_string());
        }
    }

    sections.insert(id, part.offset_body..part.offset_end);
    node
}

fn message_date(message: &mail_parser::Message<'_>) -> Option<DateTime<FixedOffset>> {
    let date = message.date()?;
    let sign = if date.tz_before_gmt { -1 } else { 1 };
    let offset_secs = sign * (i32::from(date.tz_hour) * 3600 + i32::from(date.tz_minute) * 60);
    let offset = FixedOffset::east_opt(offset_secs)?;
    DateTime::from_timestamp(date.to_timestamp(), 0).map(|utc| utc.with_timezone(&offset))
}
