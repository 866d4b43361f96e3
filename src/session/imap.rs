//! IMAP transport over `async-imap`, with implicit TLS or plain TCP.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_imap::types::Fetch;
use async_imap::{Client, Session};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_native_tls::TlsStream;

use super::{FetchedMessage, MailboxConnector, MailboxSession, PartSink, SearchCriteria};
use crate::config::{ImapConfig, Secret};
use crate::error::{Result, StashError};
use crate::model::attachment::MessageId;
use crate::model::structure::PartId;
use crate::parser::bodystructure::{section_path, structure_tree};

/// Bytes requested per partial `FETCH` of a part body.
const PART_WINDOW: u64 = 256 * 1024;

/// TLS or plain connection, so one `Session` type serves both.
pub enum ImapStream {
    Tls(Box<TlsStream<TcpStream>>),
    Plain(TcpStream),
}

impl AsyncRead for ImapStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ImapStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

impl std::fmt::Debug for ImapStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tls(_) => f.write_str("ImapStream::Tls"),
            Self::Plain(_) => f.write_str("ImapStream::Plain"),
        }
    }
}

/// Connects and logs in with username and password.
#[derive(Debug, Clone)]
pub struct ImapConnector {
    host: String,
    port: u16,
    tls: bool,
    username: String,
    password: Secret,
}

impl ImapConnector {
    pub fn from_config(config: &ImapConfig) -> Result<Self> {
        let password = config
            .password
            .clone()
            .ok_or_else(|| StashError::Config("imap.password is not set".to_string()))?;
        Ok(Self {
            host: config.host.clone(),
            port: config.port,
            tls: config.tls,
            username: config.username.clone(),
            password,
        })
    }

    async fn open_stream(&self) -> Result<ImapStream> {
        let tcp = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| {
                StashError::Imap(format!("TCP connect to {}:{} failed: {e}", self.host, self.port))
            })?;
        if !self.tls {
            return Ok(ImapStream::Plain(tcp));
        }

        let connector = native_tls::TlsConnector::new()
            .map_err(|e| StashError::Imap(format!("TLS setup failed: {e}")))?;
        let tls = tokio_native_tls::TlsConnector::from(connector)
            .connect(&self.host, tcp)
            .await
            .map_err(|e| StashError::Imap(format!("TLS handshake with {} failed: {e}", self.host)))?;
        Ok(ImapStream::Tls(Box::new(tls)))
    }
}

#[async_trait]
impl MailboxConnector for ImapConnector {
    type Session = ImapMailbox;

    async fn connect(&self) -> Result<ImapMailbox> {
        tracing::info!(host = %self.host, port = self.port, tls = self.tls, "Connecting to mailbox");
        let stream = self.open_stream().await?;
        let session = Client::new(stream)
            .login(&self.username, self.password.expose())
            .await
            .map_err(|(e, _)| StashError::Imap(format!("login failed: {e}")))?;
        Ok(ImapMailbox { session })
    }
}

/// An authenticated IMAP session. Messages are addressed by UID.
pub struct ImapMailbox {
    session: Session<ImapStream>,
}

impl ImapMailbox {
    async fn uid_fetch(&mut self, uids: &str, query: &str) -> Result<Vec<Fetch>> {
        let responses = self.session.uid_fetch(uids, query).await?;
        let mut fetches = Vec::new();
        for response in responses.collect::<Vec<_>>().await {
            fetches.push(response?);
        }
        Ok(fetches)
    }
}

fn uid_set(ids: &[MessageId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// `FETCH` items for `len` bytes of a part body starting at `offset`.
fn window_query(part: &PartId, offset: u64, len: u64) -> String {
    format!("(UID BODY.PEEK[{part}]<{offset}.{len}>)")
}

/// A window shorter than requested is the last one of the part.
fn is_last_window(received: usize, requested: u64) -> bool {
    (received as u64) < requested
}

#[async_trait]
impl MailboxSession for ImapMailbox {
    async fn open_mailbox(&mut self, name: &str, read_only: bool) -> Result<()> {
        let mailbox = if read_only {
            self.session.examine(name).await?
        } else {
            self.session.select(name).await?
        };
        tracing::debug!(mailbox = name, exists = mailbox.exists, "Mailbox opened");
        Ok(())
    }

    async fn search(&mut self, criteria: &SearchCriteria) -> Result<Vec<MessageId>> {
        let query = criteria.to_imap_query();
        let mut uids: Vec<MessageId> = self.session.uid_search(&query).await?.into_iter().collect();
        uids.sort_unstable();
        tracing::debug!(query = %query, count = uids.len(), "Search complete");
        Ok(uids)
    }

    async fn set_flags(&mut self, ids: &[MessageId], flags: &[&str]) -> Result<()> {
        let query = format!("+FLAGS.SILENT ({})", flags.join(" "));
        let responses = self.session.uid_store(uid_set(ids), &query).await?;
        for response in responses.collect::<Vec<_>>().await {
            response?;
        }
        Ok(())
    }

    async fn fetch_structures(&mut self, ids: &[MessageId]) -> Result<Vec<FetchedMessage>> {
        let fetches = self
            .uid_fetch(&uid_set(ids), "(UID INTERNALDATE BODYSTRUCTURE)")
            .await?;

        let mut messages = Vec::with_capacity(fetches.len());
        for fetch in &fetches {
            let Some(id) = fetch.uid else {
                tracing::warn!(seq = fetch.message, "FETCH response without UID, skipping");
                continue;
            };
            let Some(structure) = fetch.bodystructure() else {
                tracing::warn!(id, "FETCH response without BODYSTRUCTURE, skipping");
                continue;
            };
            let Some(date) = fetch.internal_date() else {
                tracing::warn!(id, "FETCH response without INTERNALDATE, skipping");
                continue;
            };
            messages.push(FetchedMessage {
                id,
                date,
                structure: structure_tree(structure),
            });
        }
        messages.sort_by_key(|m| m.id);
        Ok(messages)
    }

    /// Fetches the part in `PART_WINDOW`-sized partial fetches, so at most
    /// one window plus the channel backlog is held in memory.
    async fn stream_part(
        &mut self,
        id: MessageId,
        part: &PartId,
        sink: &mut PartSink,
    ) -> Result<u64> {
        let section = section_path(part)
            .ok_or_else(|| StashError::Imap(format!("invalid part id '{part}'")))?;
        let uid = id.to_string();
        let mut offset = 0u64;

        loop {
            let fetches = self
                .uid_fetch(&uid, &window_query(part, offset, PART_WINDOW))
                .await?;
            let window = match fetches.iter().find_map(|fetch| fetch.section(&section)) {
                Some(body) => Bytes::copy_from_slice(body),
                None if offset == 0 => {
                    return Err(StashError::Imap(format!(
                        "message {id} has no body for part {part}"
                    )));
                }
                // The server may answer NIL past the end of the part.
                None => Bytes::new(),
            };
            drop(fetches);

            let received = window.len();
            tracing::trace!(id, part = %part, offset, received, "Fetched part window");
            if received > 0 {
                if sink.send(Ok(window)).await.is_err() {
                    tracing::debug!(id, part = %part, offset, "Writer closed, stopping fetch");
                    break;
                }
                offset += received as u64;
            }
            if is_last_window(received, PART_WINDOW) {
                break;
            }
        }
        Ok(offset)
    }

    async fn logout(&mut self) -> Result<()> {
        self.session.logout().await?;
        tracing::info!("Logged out");
        Ok(())
    }
}
