//! Writing located attachments to the staging directory.

pub mod naming;
pub mod writer;
