//! Typed message channel over any [`Connection`].
//!
//! A dedicated reader task decodes inbound frames into a bounded queue; the
//! owner of the channel writes frames directly on the write half.  Sending
//! therefore never waits on reading and vice versa.

use std::io;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use punchdrop_core::protocol::{self, Message, Packet};
use punchdrop_core::transport::Connection;
use punchdrop_core::{Error, Result};

const READ_BUF_LEN: usize = 16 * 1024;
const INBOUND_QUEUE: usize = 64;
/// How long [`MessageChannel::close`] waits for the peer to finish its side.
const LINGER: Duration = Duration::from_secs(5);

/// One bidirectional stream of [`Message`]s.
pub struct MessageChannel {
    peer: String,
    writer: Box<dyn AsyncWrite + Unpin + Send>,
    inbound: mpsc::Receiver<Result<Message>>,
    reader: JoinHandle<()>,
    write_buf: BytesMut,
}

impl MessageChannel {
    /// Splits `conn` and starts the reader task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new<C: Connection>(conn: C) -> Self {
        let peer = conn.peer();
        let (reader, writer) = conn.into_split();
        let (tx, inbound) = mpsc::channel(INBOUND_QUEUE);
        let reader = tokio::spawn(read_loop(peer.clone(), reader, tx));

        Self {
            peer,
            writer: Box::new(writer),
            inbound,
            reader,
            write_buf: BytesMut::with_capacity(READ_BUF_LEN),
        }
    }

    /// Identifier of the remote end, as reported by the transport.
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Sends one message.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectionClosed`] if the remote end is gone, another
    /// transport error otherwise.
    pub async fn send(&mut self, packet: Packet, body: &[u8]) -> Result<()> {
        self.write_buf.clear();
        protocol::encode_frame(packet, body, &mut self.write_buf)?;
        self.writer
            .write_all(&self.write_buf)
            .await
            .map_err(map_io_error)?;
        debug!(peer = %self.peer, ?packet, len = body.len(), "Sent message");
        Ok(())
    }

    /// Sends a message with no body.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn send_bare(&mut self, packet: Packet) -> Result<()> {
        self.send(packet, &[]).await
    }

    /// Waits for the next inbound message.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectionClosed`] once the remote end has closed, or the
    /// decode/transport error that stopped the reader.
    pub async fn recv(&mut self) -> Result<Message> {
        match self.inbound.recv().await {
            Some(result) => result,
            None => Err(Error::ConnectionClosed),
        }
    }

    /// Returns an already-received message without waiting.
    pub fn try_recv(&mut self) -> Option<Result<Message>> {
        self.inbound.try_recv().ok()
    }

    /// Tells the peer why we are giving up, if it needs telling.
    ///
    /// Local faults go out as [`Packet::InternalError`], protocol violations
    /// we detected as [`Packet::ProtocolError`].  Failures that came from the
    /// peer, or from the connection itself, are not echoed back.
    pub async fn notify_failure(&mut self, err: &Error) {
        let packet = match err {
            Error::Internal(_) => Packet::InternalError,
            Error::MalformedMessage(_) | Error::UnexpectedPacket(_) => Packet::ProtocolError,
            _ => return,
        };
        if let Err(send_err) = self.send(packet, err.to_string().as_bytes()).await {
            debug!(peer = %self.peer, error = %send_err, "Could not report failure to peer");
        }
    }

    /// Finishes our side of the stream and waits (bounded) for the peer to
    /// finish theirs, so that the last message sent is actually delivered.
    pub async fn close(mut self) {
        if let Err(e) = self.writer.shutdown().await {
            debug!(peer = %self.peer, error = %e, "Shutdown of write half failed");
        }

        let drained = tokio::time::timeout(LINGER, async {
            while let Some(Ok(message)) = self.inbound.recv().await {
                debug!(peer = %self.peer, packet = ?message.packet, "Discarding message after close");
            }
        })
        .await;

        if drained.is_err() {
            debug!(peer = %self.peer, "Peer did not close within linger period");
        }
    }
}

impl Drop for MessageChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl std::fmt::Debug for MessageChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageChannel")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    peer: String,
    mut reader: R,
    tx: mpsc::Sender<Result<Message>>,
) {
    let mut buf = vec![0u8; READ_BUF_LEN];
    let mut accum = BytesMut::with_capacity(READ_BUF_LEN);

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                if !accum.is_empty() {
                    warn!(peer = %peer, pending = accum.len(), "Connection closed mid-frame");
                }
                debug!(peer = %peer, "Connection closed by peer");
                return;
            }
            Ok(n) => {
                accum.extend_from_slice(&buf[..n]);

                // Drain all complete frames from the accumulation buffer.
                loop {
                    match protocol::try_decode_frame(&mut accum) {
                        Ok(Some(message)) => {
                            debug!(peer = %peer, packet = ?message.packet, len = message.body.len(), "Received message");
                            if tx.send(Ok(message)).await.is_err() {
                                // Channel owner is gone.
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(peer = %peer, error = %e, "Protocol error, stopping reader");
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                let err = map_io_error(e);
                debug!(peer = %peer, error = %err, "Read failed, stopping reader");
                if !matches!(err, Error::ConnectionClosed) {
                    let _ = tx.send(Err(err)).await;
                }
                return;
            }
        }
    }
}

/// The error for a message that is not valid where it arrived.
///
/// Error reports from the peer surface as [`Error::RemoteProtocol`] /
/// [`Error::RemoteInternal`]; everything else is an unexpected packet.
#[must_use]
pub fn unexpected(message: &Message) -> Error {
    match message.packet {
        Packet::ProtocolError => Error::RemoteProtocol(message.body_text()),
        Packet::InternalError => Error::RemoteInternal(message.body_text()),
        other => Error::UnexpectedPacket(other),
    }
}

fn map_io_error(err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
        _ => Error::Transport(Box::new(err)),
    }
}
