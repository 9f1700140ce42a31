use std::io;
use std::path::Path;

use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use punchdrop_core::config::MAX_CHUNK_SIZE;
use punchdrop_core::digest;
use punchdrop_core::message::{ChunkInfo, MetaInfo};
use punchdrop_core::protocol::Packet;
use punchdrop_core::{Error, Result};

use super::{Events, SenderState, TransferEvent};
use crate::channel::{MessageChannel, unexpected};

#[derive(Debug, Clone)]
pub struct SendOptions {
    /// Bytes per chunk; clamped to `1..=MAX_CHUNK_SIZE`.
    pub chunk_size: usize,
    /// Hex digest of the shared password (see [`digest::hash_password`]).
    pub password_hash: Vec<u8>,
}

/// Summary of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub file_name: String,
    pub bytes_sent: u64,
    pub chunks: u64,
    pub file_hash: Vec<u8>,
}

/// Sending side of the pipeline.  Owns the channel for the whole transfer.
pub struct FileSender {
    channel: MessageChannel,
    options: SendOptions,
    state: SenderState,
    events: Events,
    cancel: CancellationToken,
}

impl FileSender {
    #[must_use]
    pub fn new(channel: MessageChannel, options: SendOptions) -> Self {
        Self {
            channel,
            options,
            state: SenderState::Init,
            events: Events::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Reports state changes and progress on `tx`.
    #[must_use]
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<TransferEvent>) -> Self {
        self.events = Events::new(tx);
        self
    }

    /// Abandons the transfer when `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Sends the file at `path` and waits for the receiver's verdict.
    ///
    /// On failure the peer is told about local faults and protocol
    /// violations before the channel is closed.
    ///
    /// # Errors
    ///
    /// - [`Error::RejectedByPeer`] if the receiver declines the file; no
    ///   chunk has been sent.
    /// - [`Error::ChecksumMismatch`] if the receiver's digest differs.
    /// - [`Error::RemoteProtocol`] / [`Error::RemoteInternal`] if the
    ///   receiver aborts.
    /// - [`Error::Internal`] if the file cannot be read or its name cannot be
    ///   announced.
    /// - [`Error::Cancelled`] if the cancellation token fires; the channel is
    ///   dropped without waiting for the peer.
    pub async fn send(mut self, path: &Path) -> Result<SendReport> {
        self.transition(SenderState::Init);
        let cancel = self.cancel.clone();
        let result = tokio::select! {
            () = cancel.cancelled() => Err(Error::Cancelled),
            result = self.run(path) => result,
        };

        match &result {
            Ok(report) => {
                self.transition(SenderState::Succeeded);
                info!(
                    peer = %self.channel.peer(),
                    file = %report.file_name,
                    bytes = report.bytes_sent,
                    chunks = report.chunks,
                    "Upload verified by peer"
                );
            }
            Err(e) => {
                self.transition(SenderState::Failed);
                warn!(peer = %self.channel.peer(), error = %e, "Upload failed");
                self.channel.notify_failure(e).await;
            }
        }

        if matches!(result, Err(Error::Cancelled)) {
            drop(self.channel);
        } else {
            self.channel.close().await;
        }
        result
    }

    async fn run(&mut self, path: &Path) -> Result<SendReport> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} has no usable file name", path.display()),
                )
            })?
            .to_string();

        let (file_size, file_hash) = digest::digest_file(path).await?;
        debug!(file = %file_name, size = file_size, "File digested");

        let meta = MetaInfo {
            password_hash: self.options.password_hash.clone(),
            file_name,
            file_size,
            file_hash,
        };
        // A name we cannot announce (e.g. one containing a newline) is our
        // problem, not a protocol violation.
        let body = meta
            .encode()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        self.channel.send(Packet::MetaInfo, &body).await?;

        self.transition(SenderState::AwaitingReady);
        let reply = self.channel.recv().await?;
        match reply.packet {
            Packet::ReadyAck => {}
            Packet::Reject => return Err(Error::RejectedByPeer(reply.body_text())),
            _ => return Err(unexpected(&reply)),
        }

        self.transition(SenderState::Streaming);
        let chunks = self.stream(path, file_size).await?;

        self.transition(SenderState::AwaitingVerification);
        let verdict = self.channel.recv().await?;
        match verdict.packet {
            Packet::ChecksumMatch => Ok(SendReport {
                file_name: meta.file_name,
                bytes_sent: file_size,
                chunks,
                file_hash: meta.file_hash,
            }),
            Packet::ChecksumMismatch => Err(Error::ChecksumMismatch),
            _ => Err(unexpected(&verdict)),
        }
    }

    /// Sends the file in offset order.  The last chunk is final, and an
    /// empty file is a single empty final chunk.
    async fn stream(&mut self, path: &Path, file_size: u64) -> Result<u64> {
        let chunk_size = self.options.chunk_size.clamp(1, MAX_CHUNK_SIZE);
        let mut file = tokio::fs::File::open(path).await?;
        let mut buf = vec![0u8; chunk_size];
        let mut sent: u64 = 0;
        let mut chunks: u64 = 0;

        loop {
            // The receiver only speaks up mid-stream to abort.
            if let Some(early) = self.channel.try_recv() {
                return Err(match early {
                    Ok(message) => unexpected(&message),
                    Err(e) => e,
                });
            }

            let remaining = file_size - sent;
            let len = usize::try_from(remaining).map_or(chunk_size, |r| r.min(chunk_size));
            file.read_exact(&mut buf[..len]).await?;
            sent += len as u64;

            let chunk = ChunkInfo::new(sent == file_size, buf[..len].to_vec());
            self.channel.send(Packet::ChunkData, &chunk.encode()).await?;
            chunks += 1;
            self.events.emit(TransferEvent::Progress {
                transferred: sent,
                total: file_size,
            });

            if chunk.is_final {
                debug!(chunks, bytes = sent, "All chunks sent");
                return Ok(chunks);
            }
        }
    }

    fn transition(&mut self, next: SenderState) {
        debug!(from = ?self.state, to = ?next, "Sender state");
        self.state = next;
        self.events.emit(TransferEvent::Sender(next));
    }
}
