//! Core data model: body structure trees, located attachments and staged files.

pub mod attachment;
pub mod structure;
