//! Message body structure tree.
//!
//! A tree is built fresh for every fetched message (from an IMAP
//! `BODYSTRUCTURE` response or from a local `.eml` file) and dropped once
//! the attachments of that message have been dispatched.

use std::collections::BTreeMap;
use std::fmt;

/// Address of one body part inside its message, e.g. `"2"` or `"1.3"`.
///
/// Used verbatim in a later `BODY.PEEK[<part>]` fetch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartId(String);

impl PartId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Id of the `index`-th (zero-based) child of this part.
    ///
    /// Children of the root are numbered from `"1"`, deeper parts get a
    /// dotted suffix.
    pub fn child(parent: Option<&PartId>, index: usize) -> Self {
        match parent {
            Some(p) => Self(format!("{}.{}", p.0, index + 1)),
            None => Self((index + 1).to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric path segments, `None` if any segment is not a number.
    pub fn segments(&self) -> Option<Vec<u32>> {
        self.0.split('.').map(|s| s.parse().ok()).collect()
    }
}

impl fmt::Display for PartId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Classified `Content-Disposition` of a part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    None,
    Inline,
    Attachment,
}

impl Disposition {
    /// Classify a raw wire value. Matching is case-insensitive; anything
    /// unrecognised (or absent) is `None`.
    pub fn classify(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_uppercase()).as_deref() {
            Some("INLINE") => Self::Inline,
            Some("ATTACHMENT") => Self::Attachment,
            _ => Self::None,
        }
    }
}

/// `Content-Transfer-Encoding` of a part.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TransferEncoding {
    #[default]
    SevenBit,
    EightBit,
    Binary,
    Base64,
    QuotedPrintable,
    Other(String),
}

impl TransferEncoding {
    /// Parse a declared encoding; matching is case-insensitive.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "7BIT" | "" => Self::SevenBit,
            "8BIT" => Self::EightBit,
            "BINARY" => Self::Binary,
            "BASE64" => Self::Base64,
            "QUOTED-PRINTABLE" => Self::QuotedPrintable,
            _ => Self::Other(raw.trim().to_string()),
        }
    }
}

impl fmt::Display for TransferEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SevenBit => f.write_str("7BIT"),
            Self::EightBit => f.write_str("8BIT"),
            Self::Binary => f.write_str("BINARY"),
            Self::Base64 => f.write_str("BASE64"),
            Self::QuotedPrintable => f.write_str("QUOTED-PRINTABLE"),
            Self::Other(s) => f.write_str(s),
        }
    }
}

/// One node of a message body tree.
///
/// A node is either a container (`children` non-empty, no disposition) or
/// a leaf (no children, may carry a disposition).
#[derive(Debug, Clone, PartialEq)]
pub struct MessageStructureNode {
    /// `None` only for a multipart root, which cannot be fetched on its own.
    pub part_id: Option<PartId>,
    /// Lower-cased media type, e.g. `"application"`.
    pub media_type: String,
    /// Lower-cased media subtype, e.g. `"pdf"`.
    pub media_subtype: String,
    /// Raw `Content-Disposition` type as seen on the wire.
    pub disposition: Option<String>,
    /// Content-Type and Content-Disposition parameters, keys lower-cased.
    pub parameters: BTreeMap<String, String>,
    pub transfer_encoding: TransferEncoding,
    pub children: Vec<MessageStructureNode>,
}

impl MessageStructureNode {
    /// A leaf part.
    pub fn leaf(
        part_id: PartId,
        media_type: &str,
        media_subtype: &str,
        transfer_encoding: TransferEncoding,
    ) -> Self {
        Self {
            part_id: Some(part_id),
            media_type: media_type.to_ascii_lowercase(),
            media_subtype: media_subtype.to_ascii_lowercase(),
            disposition: None,
            parameters: BTreeMap::new(),
            transfer_encoding,
            children: Vec::new(),
        }
    }

    /// A multipart container.
    pub fn container(
        part_id: Option<PartId>,
        media_subtype: &str,
        children: Vec<MessageStructureNode>,
    ) -> Self {
        Self {
            part_id,
            media_type: "multipart".to_string(),
            media_subtype: media_subtype.to_ascii_lowercase(),
            disposition: None,
            parameters: BTreeMap::new(),
            transfer_encoding: TransferEncoding::default(),
            children,
        }
    }

    /// Builder-style: set the raw disposition type.
    pub fn with_disposition(mut self, disposition: &str) -> Self {
        self.disposition = Some(disposition.to_string());
        self
    }

    /// Builder-style: add a parameter (key is lower-cased).
    pub fn with_param(mut self, key: &str, value: &str) -> Self {
        self.parameters
            .insert(key.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn disposition_kind(&self) -> Disposition {
        Disposition::classify(self.disposition.as_deref())
    }

    /// Declared filename: the Content-Type `name` parameter, falling back
    /// to the Content-Disposition `filename` parameter.
    pub fn declared_name(&self) -> Option<&str> {
        self.parameters
            .get("name")
            .or_else(|| self.parameters.get("filename"))
            .map(String::as_str)
            .filter(|s| !s.trim().is_empty())
    }

    /// `"type/subtype"`.
    pub fn mime_type(&self) -> String {
        format!("{}/{}", self.media_type, self.media_subtype)
    }
}
