//! File naming for staged attachments and their archive copies.

use chrono::{DateTime, TimeZone};

use crate::model::structure::MessageStructureNode;

/// Maximum length kept from a declared attachment name.
const MAX_FILENAME_LEN: usize = 150;

/// Sanitize a string for use in filenames.
///
/// Replaces invalid characters with `_` and truncates to `max_len`. Names
/// consisting only of dots are replaced, so the result never walks out of
/// its directory.
pub fn sanitize_filename_part(s: &str, max_len: usize) -> String {
    let sanitized: String = s
        .trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '.' || c == '_' || c == '@' {
                c
            } else {
                '_'
            }
        })
        .take(max_len)
        .collect();

    if sanitized.is_empty() || sanitized.chars().all(|c| c == '.') {
        "unknown".to_string()
    } else {
        sanitized
    }
}

/// Output filename for an attachment leaf.
///
/// Uses the declared name when there is one; otherwise falls back to
/// `attachment-<part>.<subtype>`.
pub fn target_filename(node: &MessageStructureNode) -> String {
    match node.declared_name() {
        Some(name) => sanitize_filename_part(name, MAX_FILENAME_LEN),
        None => {
            let part = node
                .part_id
                .as_ref()
                .map(|p| p.as_str().replace('.', "-"))
                .unwrap_or_else(|| "1".to_string());
            let ext = if node.media_subtype.is_empty() {
                "bin"
            } else {
                node.media_subtype.as_str()
            };
            sanitize_filename_part(&format!("attachment-{part}.{ext}"), MAX_FILENAME_LEN)
        }
    }
}

/// Name of the decrypted artifact: `dd-mm-yyyy.<extension>`, taken from the
/// message date in its own offset.
pub fn derived_filename<Tz>(date: &DateTime<Tz>, extension: &str) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    let ext = extension.trim_start_matches('.');
    format!("{}.{ext}", date.format("%d-%m-%Y"))
}

/// Year segment of a derived filename (characters 6..10 of `dd-mm-yyyy`).
pub fn year_segment(derived_name: &str) -> Option<&str> {
    derived_name
        .get(6..10)
        .filter(|y| y.chars().all(|c| c.is_ascii_digit()))
}

/// Remote archive path: `<prefix>/<year>/<derived name>`.
pub fn remote_path(prefix: &str, derived_name: &str) -> Option<String> {
    let year = year_segment(derived_name)?;
    let prefix = prefix.trim_end_matches('/');
    Some(format!("{prefix}/{year}/{derived_name}"))
}
