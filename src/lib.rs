//! `mailstash`: pulls statement attachments out of a mailbox and files them away.
//!
//! A poll cycle searches the mailbox for matching messages, walks each
//! message's body structure for attachment parts, streams every part through
//! its transfer decoder into a staging directory, and then runs each staged
//! file through decryption, archive upload and cleanup.

pub mod config;
pub mod error;
pub mod export;
pub mod model;
pub mod parser;
pub mod pipeline;
pub mod session;
