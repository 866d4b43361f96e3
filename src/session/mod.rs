//! Mailbox session lifecycle and the poll cycle.
//!
//! One cycle connects, searches, fetches structures, dispatches every
//! located attachment into a writer + pipeline task, waits for all of those
//! tasks, and only then logs out. The connection is never shared with the
//! tasks: every IMAP command is issued from the orchestrator itself, and
//! part bodies reach the writer through a bounded channel.

pub mod imap;

use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, FixedOffset};
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::config::FilterConfig;
use crate::error::{Result, StashError};
use crate::export::writer::AttachmentWriter;
use crate::model::attachment::MessageId;
use crate::model::structure::{MessageStructureNode, PartId};
use crate::parser::decode::ByteStream;
use crate::parser::locate::locate;
use crate::pipeline::{Pipeline, PipelineReport};

/// Flag set on matched messages.
pub const SEEN_FLAG: &str = "\\Seen";

/// Chunks buffered between the session and the writer of one part.
const PART_CHANNEL_DEPTH: usize = 4;

/// Sending half of the channel a part body is streamed into.
pub type PartSink = mpsc::Sender<io::Result<Bytes>>;

/// Forward `stream` into `sink` and return the number of bytes handed over.
///
/// Stops early, without error, once the receiving writer has gone away.
pub async fn forward_part(mut stream: ByteStream, sink: &mut PartSink) -> Result<u64> {
    let mut sent = 0u64;
    while let Some(item) = stream.next().await {
        let len = item.as_ref().map_or(0, |chunk| chunk.len() as u64);
        if sink.send(item).await.is_err() {
            break;
        }
        sent += len;
    }
    Ok(sent)
}

/// Which messages a cycle picks up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchCriteria {
    pub sender: String,
    pub unseen_only: bool,
}

impl SearchCriteria {
    pub fn from_config(config: &FilterConfig) -> Self {
        Self {
            sender: config.sender.clone(),
            unseen_only: config.unseen_only,
        }
    }

    /// Render as an IMAP `SEARCH` key list, e.g. `UNSEEN FROM "a@b.c"`.
    pub fn to_imap_query(&self) -> String {
        let sender = self.sender.replace('\\', "\\\\").replace('"', "\\\"");
        let from = format!("FROM \"{sender}\"");
        if self.unseen_only {
            format!("UNSEEN {from}")
        } else {
            from
        }
    }
}

/// A matched message with the attributes the locator needs.
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub id: MessageId,
    /// Server-side arrival date of the message.
    pub date: DateTime<FixedOffset>,
    pub structure: MessageStructureNode,
}

/// Opens authenticated mailbox sessions.
#[async_trait]
pub trait MailboxConnector: Send + Sync {
    type Session: MailboxSession;

    async fn connect(&self) -> Result<Self::Session>;
}

/// The commands a poll cycle issues against an open connection.
#[async_trait]
pub trait MailboxSession: Send {
    async fn open_mailbox(&mut self, name: &str, read_only: bool) -> Result<()>;

    async fn search(&mut self, criteria: &SearchCriteria) -> Result<Vec<MessageId>>;

    async fn set_flags(&mut self, ids: &[MessageId], flags: &[&str]) -> Result<()>;

    async fn fetch_structures(&mut self, ids: &[MessageId]) -> Result<Vec<FetchedMessage>>;

    /// Stream the raw (still transfer-encoded) body of one part into
    /// `sink`, returning the number of bytes sent.
    ///
    /// A closed sink means the writer gave up; that ends the transfer
    /// without an error.
    async fn stream_part(
        &mut self,
        id: MessageId,
        part: &PartId,
        sink: &mut PartSink,
    ) -> Result<u64>;

    async fn logout(&mut self) -> Result<()>;
}

/// Connection state, owned by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
    Closing,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Outcome of one poll cycle.
#[derive(Debug, Default)]
pub struct CycleReport {
    /// Messages returned by the search.
    pub matched: usize,
    /// Attachments dispatched into the writer.
    pub dispatched: usize,
    /// Attachments whose write failed before post-processing started.
    pub write_failures: usize,
    pub pipelines: Vec<PipelineReport>,
}

impl CycleReport {
    pub fn completed(&self) -> usize {
        self.pipelines.iter().filter(|r| r.is_done()).count()
    }
}

/// Everything the orchestrator needs besides the connector.
pub struct OrchestratorSettings {
    pub mailbox: String,
    pub criteria: SearchCriteria,
    pub mark_seen: bool,
    pub connect_timeout: Duration,
}

/// Drives poll cycles over a [`MailboxConnector`].
pub struct Orchestrator<C> {
    connector: C,
    settings: OrchestratorSettings,
    writer: AttachmentWriter,
    pipeline: Arc<Pipeline>,
    state: SessionState,
}

type AttachmentTask = Result<PipelineReport>;

impl<C: MailboxConnector> Orchestrator<C> {
    pub fn new(
        connector: C,
        settings: OrchestratorSettings,
        writer: AttachmentWriter,
        pipeline: Arc<Pipeline>,
    ) -> Self {
        Self {
            connector,
            settings,
            writer,
            pipeline,
            state: SessionState::Disconnected,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        tracing::debug!(from = %self.state, to = %next, "Session state");
        self.state = next;
    }

    /// Run exactly one cycle.
    ///
    /// Search and fetch errors stop dispatching, but attachments already
    /// dispatched still finish and the connection is still closed before
    /// the error is returned.
    pub async fn poll_once(&mut self) -> Result<CycleReport> {
        self.transition(SessionState::Connecting);
        let connect = self.connector.connect();
        let mut session = match tokio::time::timeout(self.settings.connect_timeout, connect).await
        {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                self.transition(SessionState::Disconnected);
                return Err(e);
            }
            Err(_) => {
                self.transition(SessionState::Disconnected);
                return Err(StashError::Timeout("connecting to the mailbox".to_string()));
            }
        };
        self.transition(SessionState::Ready);
        tracing::info!(mailbox = %self.settings.mailbox, "Mailbox session ready");

        let mut report = CycleReport::default();
        let mut tasks = JoinSet::new();
        let dispatched = self.dispatch(&mut session, &mut tasks, &mut report).await;
        if let Err(ref e) = dispatched {
            tracing::error!(
                error = %e,
                in_flight = tasks.len(),
                "Poll cycle aborted, waiting for dispatched attachments"
            );
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(pipeline)) => report.pipelines.push(pipeline),
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "Attachment write failed");
                    report.write_failures += 1;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Attachment task panicked or was cancelled");
                    report.write_failures += 1;
                }
            }
        }

        self.transition(SessionState::Closing);
        if let Err(e) = session.logout().await {
            tracing::warn!(error = %e, "Logout failed");
        }
        self.transition(SessionState::Disconnected);

        tracing::info!(
            matched = report.matched,
            dispatched = report.dispatched,
            completed = report.completed(),
            write_failures = report.write_failures,
            "Poll cycle finished"
        );
        dispatched.map(|()| report)
    }

    async fn dispatch(
        &self,
        session: &mut C::Session,
        tasks: &mut JoinSet<AttachmentTask>,
        report: &mut CycleReport,
    ) -> Result<()> {
        self.writer.prepare().await?;
        session.open_mailbox(&self.settings.mailbox, false).await?;

        let ids = session.search(&self.settings.criteria).await?;
        report.matched = ids.len();
        if ids.is_empty() {
            tracing::info!(query = %self.settings.criteria.to_imap_query(), "No matching messages");
            return Ok(());
        }
        tracing::info!(count = ids.len(), "Found matching messages");

        if self.settings.mark_seen {
            match session.set_flags(&ids, &[SEEN_FLAG]).await {
                Ok(()) => tracing::info!(count = ids.len(), "Marked messages as seen"),
                Err(e) => tracing::warn!(error = %e, "Failed to mark messages as seen"),
            }
        }

        for message in session.fetch_structures(&ids).await? {
            let located = locate(&message.structure, message.date);
            tracing::info!(
                id = message.id,
                date = %message.date,
                attachments = located.len(),
                "Matched message"
            );

            for attachment in located {
                let part = attachment.part_id();
                let (mut sink, raw) = mpsc::channel(PART_CHANNEL_DEPTH);
                report.dispatched += 1;

                let writer = self.writer.clone();
                let pipeline = Arc::clone(&self.pipeline);
                tasks.spawn(async move {
                    let pending = writer.write(&attachment, raw.boxed()).await?;
                    Ok(pipeline.process(pending).await)
                });

                match session.stream_part(message.id, &part, &mut sink).await {
                    Ok(size) => tracing::debug!(id = message.id, part = %part, size, "Part fetched"),
                    Err(e) => {
                        // Fail the writer instead of letting it finish a truncated file.
                        let _ = sink.send(Err(io::Error::other(e.to_string()))).await;
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }

    /// Poll now and then every `interval` until `shutdown` resolves.
    ///
    /// A cycle that has started always runs to completion; the shutdown
    /// future is only observed between cycles.
    pub async fn run<F>(&mut self, interval: Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested, stopping poll loop");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        tracing::error!(error = %e, "Poll cycle failed, retrying on next tick");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_query() {
        let mut criteria = SearchCriteria {
            sender: "m2u@bills.maybank2u.com.my".to_string(),
            unseen_only: true,
        };
        assert_eq!(
            criteria.to_imap_query(),
            "UNSEEN FROM \"m2u@bills.maybank2u.com.my\""
        );
        criteria.unseen_only = false;
        assert_eq!(criteria.to_imap_query(), "FROM \"m2u@bills.maybank2u.com.my\"");
    }

    #[tokio::test]
    async fn test_forward_part_hands_over_every_chunk() {
        let (mut sink, raw) = mpsc::channel(PART_CHANNEL_DEPTH);
        let body = Bytes::from_static(b"JVBERi0xLjcNCg==");
        let sender = tokio::spawn(async move {
            forward_part(crate::parser::decode::chunked(body, 3), &mut sink).await
        });

        let received: Vec<Bytes> = raw.map(|chunk| chunk.unwrap()).collect().await;
        assert_eq!(sender.await.unwrap().unwrap(), 16);
        assert_eq!(received.len(), 6);
        assert_eq!(received.concat(), b"JVBERi0xLjcNCg==");
    }

    #[tokio::test]
    async fn test_forward_part_stops_when_writer_is_gone() {
        let (mut sink, raw) = mpsc::channel::<io::Result<Bytes>>(PART_CHANNEL_DEPTH);
        drop(raw);
        let body = Bytes::from_static(b"abcdef");
        let sent = forward_part(crate::parser::decode::chunked(body, 2), &mut sink)
            .await
            .unwrap();
        assert_eq!(sent, 0);
    }

    #[test]
    fn test_search_query_escapes_quotes() {
        let criteria = SearchCriteria {
            sender: "a\"b".to_string(),
            unseen_only: false,
        };
        assert_eq!(criteria.to_imap_query(), "FROM \"a\\\"b\"");
    }
}
