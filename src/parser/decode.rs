//! Streaming Content-Transfer-Encoding decoder.
//!
//! Attachments arrive as a stream of byte chunks. Base64 content is decoded
//! chunk by chunk as it arrives, carrying at most three significant input
//! bytes between chunks, so an attachment is never buffered whole. Every
//! other encoding passes through untouched.

use std::io;

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use thiserror::Error;

use crate::model::structure::TransferEncoding;

/// A stream of raw or decoded attachment bytes.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Mail bodies are not always padded correctly; accept both forms.
const ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Errors raised while decoding transfer-encoded content.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid base64 content: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("base64 data continues after padding")]
    DataAfterPadding,

    #[error("truncated base64 content: {0} dangling byte(s) at end of stream")]
    Truncated(usize),
}

impl From<DecodeError> for io::Error {
    fn from(err: DecodeError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

/// Incremental base64 decoder.
///
/// Whitespace (line breaks included) is ignored. Input is decoded in whole
/// four-character quanta; the remainder is carried into the next chunk.
#[derive(Debug, Default)]
pub struct Base64Decoder {
    carry: Vec<u8>,
    padded: bool,
}

impl Base64Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode as much of `chunk` as forms complete quanta.
    pub fn decode_chunk(&mut self, chunk: &[u8]) -> Result<Vec<u8>, DecodeError> {
        let before = self.carry.len();
        self.carry
            .extend(chunk.iter().copied().filter(|b| !b.is_ascii_whitespace()));
        if self.carry.len() == before {
            return Ok(Vec::new());
        }
        if self.padded {
            return Err(DecodeError::DataAfterPadding);
        }

        let usable = self.carry.len() - self.carry.len() % 4;
        if usable == 0 {
            return Ok(Vec::new());
        }
        let out = ENGINE.decode(&self.carry[..usable])?;
        self.padded = self.carry[usable - 1] == b'=';
        self.carry.drain(..usable);
        Ok(out)
    }

    /// Decode whatever is left once the input has ended.
    ///
    /// Two or three dangling characters are an unpadded final quantum; a
    /// single one cannot encode anything and is an error.
    pub fn finish(self) -> Result<Vec<u8>, DecodeError> {
        match self.carry.len() {
            0 => Ok(Vec::new()),
            1 => Err(DecodeError::Truncated(1)),
            _ if self.padded => Err(DecodeError::DataAfterPadding),
            _ => Ok(ENGINE.decode(&self.carry)?),
        }
    }
}

/// Wrap a raw attachment stream in the decoder for `encoding`.
///
/// Only base64 is decoded. Any other value, unknown ones included, yields
/// the input stream unchanged; for a binary encoding we do not recognise
/// the written file may not be usable.
pub fn wrap(raw: ByteStream, encoding: &TransferEncoding) -> ByteStream {
    match encoding {
        TransferEncoding::Base64 => decode_base64(raw),
        other => {
            tracing::debug!(encoding = %other, "No decoder for transfer encoding, passing through");
            raw
        }
    }
}

fn decode_base64(raw: ByteStream) -> ByteStream {
    // State is `None` once the stream has ended or failed.
    stream::unfold(Some((raw, Base64Decoder::new())), |state| async move {
        let (mut raw, mut decoder) = state?;
        match raw.next().await {
            Some(Ok(chunk)) => match decoder.decode_chunk(&chunk) {
                Ok(out) => Some((Ok(Bytes::from(out)), Some((raw, decoder)))),
                Err(e) => Some((Err(e.into()), None)),
            },
            Some(Err(e)) => Some((Err(e), None)),
            None => match decoder.finish() {
                Ok(out) if out.is_empty() => None,
                Ok(out) => Some((Ok(Bytes::from(out)), None)),
                Err(e) => Some((Err(e.into()), None)),
            },
        }
    })
    .filter(|item| {
        let keep = !matches!(item, Ok(b) if b.is_empty());
        futures::future::ready(keep)
    })
    .boxed()
}

/// Present an in-memory body as a stream of `chunk_size` pieces.
pub fn chunked(body: Bytes, chunk_size: usize) -> ByteStream {
    let chunk_size = chunk_size.max(1);
    let chunks: Vec<io::Result<Bytes>> = (0..body.len())
        .step_by(chunk_size)
        .map(|start| Ok(body.slice(start..(start + chunk_size).min(body.len()))))
        .collect();
    stream::iter(chunks).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    const PLAIN: &[u8] = b"%PDF-1.4\n%\xe2\xe3\xcf\xd3\n1 0 obj binary \x00\x01\x02\xff";

    fn encoded_with_line_breaks() -> Vec<u8> {
        let flat = base64::engine::general_purpose::STANDARD.encode(PLAIN);
        let mut out = Vec::new();
        for line in flat.as_bytes().chunks(12) {
            out.extend_from_slice(line);
            out.extend_from_slice(b"\r\n");
        }
        out
    }

    async fn collect(stream: ByteStream) -> io::Result<Vec<u8>> {
        let chunks: Vec<Bytes> = stream.try_collect().await?;
        Ok(chunks.concat())
    }

    #[tokio::test]
    async fn test_base64_stream_reconstructs_plaintext() {
        let raw = chunked(Bytes::from(encoded_with_line_breaks()), 64);
        let out = collect(wrap(raw, &TransferEncoding::Base64)).await.unwrap();
        assert_eq!(out, PLAIN);
    }

    #[tokio::test]
    async fn test_split_points_do_not_change_output() {
        let encoded = Bytes::from(encoded_with_line_breaks());
        let whole = collect(wrap(chunked(encoded.clone(), encoded.len()), &TransferEncoding::Base64))
            .await
            .unwrap();
        for split in 1..encoded.len() {
            let two = collect(wrap(
                chunked(encoded.clone(), split),
                &TransferEncoding::Base64,
            ))
            .await
            .unwrap();
            assert_eq!(two, whole, "chunk size {split}");
        }
    }

    #[tokio::test]
    async fn test_unknown_encoding_is_identity() {
        let raw = Bytes::from_static(b"=?not*base64?= \x00\xff");
        for encoding in [
            TransferEncoding::Binary,
            TransferEncoding::SevenBit,
            TransferEncoding::QuotedPrintable,
            TransferEncoding::Other("x-custom".to_string()),
        ] {
            let out = collect(wrap(chunked(raw.clone(), 3), &encoding)).await.unwrap();
            assert_eq!(out, raw.as_ref(), "{encoding}");
        }
    }

    #[tokio::test]
    async fn test_malformed_input_is_a_stream_error() {
        let raw = chunked(Bytes::from_static(b"QUJD*EVG"), 4);
        let err = collect(wrap(raw, &TransferEncoding::Base64)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_upstream_error_propagates() {
        let raw: ByteStream = stream::iter(vec![
            Ok(Bytes::from_static(b"QUJD")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "gone")),
        ])
        .boxed();
        let err = collect(wrap(raw, &TransferEncoding::Base64)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[test]
    fn test_unpadded_tail_is_accepted() {
        let mut decoder = Base64Decoder::new();
        assert_eq!(decoder.decode_chunk(b"QUJDRA").unwrap(), b"ABC");
        assert_eq!(decoder.finish().unwrap(), b"D");
    }

    #[test]
    fn test_single_dangling_byte_is_truncation() {
        let mut decoder = Base64Decoder::new();
        decoder.decode_chunk(b"QUJDR").unwrap();
        assert!(matches!(decoder.finish(), Err(DecodeError::Truncated(1))));
    }

    #[test]
    fn test_data_after_padding_is_rejected() {
        let mut decoder = Base64Decoder::new();
        assert_eq!(decoder.decode_chunk(b"QQ==").unwrap(), b"A");
        assert!(matches!(
            decoder.decode_chunk(b"QUJD"),
            Err(DecodeError::DataAfterPadding)
        ));
    }

    #[test]
    fn test_whitespace_only_chunk_after_padding_is_fine() {
        let mut decoder = Base64Decoder::new();
        decoder.decode_chunk(b"QQ==").unwrap();
        assert!(decoder.decode_chunk(b"\r\n").unwrap().is_empty());
        assert!(decoder.finish().unwrap().is_empty());
    }
}
