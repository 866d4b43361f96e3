//! Integration tests for the post-processing pipeline.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{FixedOffset, TimeZone};

use mailstash::export::writer::AttachmentWriter;
use mailstash::model::attachment::{LocatedAttachment, PendingFile};
use mailstash::model::structure::{MessageStructureNode, PartId, TransferEncoding};
use mailstash::parser::decode;
use mailstash::pipeline::{Stage, UploadOutcome};

use common::{CopyDecryptor, EventLog, FailingDecryptor, RecordingArchive};

fn march_fifth() -> chrono::DateTime<FixedOffset> {
    FixedOffset::east_opt(8 * 3600)
        .unwrap()
        .with_ymd_and_hms(2023, 3, 5, 9, 30, 0)
        .unwrap()
}

async fn staged(dir: &Path, name: &str, body: &'static [u8]) -> PendingFile {
    let node = MessageStructureNode::leaf(PartId::new("2"), "application", "pdf", TransferEncoding::Binary)
        .with_disposition("attachment")
        .with_param("name", name);
    let attachment = LocatedAttachment {
        node,
        message_date: march_fifth(),
        target_filename: name.to_string(),
    };
    AttachmentWriter::new(dir, "pdf")
        .write(&attachment, decode::chunked(Bytes::from_static(body), 4))
        .await
        .unwrap()
}

// ─── Test 1: Successful run removes both local files ───────────────

#[tokio::test]
async fn test_success_cleans_up_both_files() {
    let dir = tempfile::tempdir().unwrap();
    let log = EventLog::default();
    let archive = Arc::new(RecordingArchive {
        log: log.clone(),
        ..Default::default()
    });
    let pipeline = common::pipeline(
        Arc::new(CopyDecryptor {
            log: log.clone(),
            delay: Duration::ZERO,
        }),
        archive.clone(),
    );

    let pending = staged(dir.path(), "statement.pdf", b"%PDF-1.7\r\n").await;
    let original = pending.original_path.clone();
    let derived = pending.derived_path.clone();
    let report = pipeline.process(pending).await;

    assert!(report.is_done());
    assert!(!original.exists());
    assert!(!derived.exists());
    assert_eq!(
        log.events(),
        vec![
            "decrypt statement.pdf",
            "upload /statement_ppc/2023/05-03-2023.pdf"
        ]
    );
    assert_eq!(archive.stored()[0].1, b"%PDF-1.7\r\n");
}

// ─── Test 2: Failed decryption never uploads ───────────────────────

#[tokio::test]
async fn test_decrypt_failure_skips_upload_and_keeps_file() {
    let dir = tempfile::tempdir().unwrap();
    let log = EventLog::default();
    let pipeline = common::pipeline(
        Arc::new(FailingDecryptor { log: log.clone() }),
        Arc::new(RecordingArchive {
            log: log.clone(),
            ..Default::default()
        }),
    );

    let pending = staged(dir.path(), "statement.pdf", b"%PDF-1.7\r\n").await;
    let original = pending.original_path.clone();
    let report = pipeline.process(pending).await;

    assert_eq!(report.stage, Stage::DecryptFailed);
    assert!(report.stage.is_terminal());
    assert!(report.upload.is_none());
    assert!(report.error.unwrap().contains("invalid password"));
    assert_eq!(log.count("upload"), 0);
    assert!(original.exists(), "staged file is kept for a later retry");
}

// ─── Test 3: Upload failure is logged, cleanup still happens ───────

#[tokio::test]
async fn test_upload_failure_is_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let log = EventLog::default();
    let pipeline = common::pipeline(
        Arc::new(CopyDecryptor {
            log: log.clone(),
            delay: Duration::ZERO,
        }),
        Arc::new(RecordingArchive {
            log: log.clone(),
            reject: true,
            ..Default::default()
        }),
    );

    let pending = staged(dir.path(), "statement.pdf", b"x").await;
    let (original, derived) = (pending.original_path.clone(), pending.derived_path.clone());
    let report = pipeline.process(pending).await;

    assert_eq!(report.stage, Stage::Done);
    assert!(matches!(report.upload, Some(UploadOutcome::Failed(ref e)) if e.contains("409")));
    assert!(!original.exists());
    assert!(!derived.exists());
}

// ─── Test 4: Missing decrypted file shows up as a cleanup failure ──

#[tokio::test]
async fn test_cleanup_failure_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let pending = staged(dir.path(), "statement.pdf", b"x").await;
    let derived = pending.derived_path.clone();

    // A decryptor that "succeeds" without producing output.
    struct NoOutput;
    #[async_trait::async_trait]
    impl mailstash::pipeline::decrypt::Decryptor for NoOutput {
        async fn decrypt(
            &self,
            _input: &Path,
            _passphrase: &mailstash::config::Secret,
            _output: &Path,
        ) -> mailstash::error::Result<()> {
            Ok(())
        }
    }

    let pipeline = common::pipeline(Arc::new(NoOutput), Arc::new(RecordingArchive::default()));
    let report = pipeline.process(pending).await;

    assert_eq!(report.stage, Stage::Done);
    assert_eq!(report.cleanup_failures, vec![derived]);
    assert!(matches!(report.upload, Some(UploadOutcome::Failed(_))));
}

// ─── Test 5: Two attachments of one message run concurrently ───────

#[tokio::test]
async fn test_two_concurrent_attachments_both_done() {
    let dir = tempfile::tempdir().unwrap();
    let log = EventLog::default();
    let archive = Arc::new(RecordingArchive {
        log: log.clone(),
        ..Default::default()
    });
    let pipeline = common::pipeline(
        Arc::new(CopyDecryptor {
            log: log.clone(),
            delay: Duration::from_millis(20),
        }),
        archive.clone(),
    );

    let first = staged(dir.path(), "savings.pdf", b"%PDF-1.7\r\n").await;
    let second = staged(dir.path(), "card.pdf", b"second payload!!").await;
    // Same message date, so both decrypt into the same derived path.
    assert_eq!(first.derived_path, second.derived_path);
    let originals = [first.original_path.clone(), second.original_path.clone()];

    let a = tokio::spawn({
        let pipeline = pipeline.clone();
        async move { pipeline.process(first).await }
    });
    let b = tokio::spawn({
        let pipeline = pipeline.clone();
        async move { pipeline.process(second).await }
    });
    let (a, b) = (a.await.unwrap(), b.await.unwrap());

    assert!(a.is_done());
    assert!(b.is_done());
    for path in &originals {
        assert!(!path.exists());
    }

    let mut payloads: Vec<Vec<u8>> = archive.stored().into_iter().map(|(_, bytes)| bytes).collect();
    payloads.sort();
    assert_eq!(payloads, vec![b"%PDF-1.7\r\n".to_vec(), b"second payload!!".to_vec()]);
}
