//! Body structure parsing: IMAP `BODYSTRUCTURE` and local `.eml` adapters,
//! the attachment locator, and streaming transfer decoding.

pub mod bodystructure;
pub mod decode;
pub mod eml;
pub mod locate;
