//! The transfer pipeline: file info exchange, chunked streaming and
//! checksum verification over a channel that has passed the handshake.
//!
//! ```text
//! sender                                  receiver
//!   MetaInfo ───────────────────────────▶ validate
//!            ◀─────────────── ReadyAck | Reject
//!   ChunkData* (last one final) ────────▶ write + digest
//!            ◀──── ChecksumMatch | ChecksumMismatch
//! ```

mod receiver;
mod sender;

pub use receiver::{FileReceiver, ReceiveOptions, ReceiveOutcome, ReceiveReport};
pub use sender::{FileSender, SendOptions, SendReport};

use tokio::sync::mpsc;

/// States of the sending side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    /// Digesting the file.
    Init,
    AwaitingReady,
    Streaming,
    AwaitingVerification,
    Succeeded,
    Failed,
}

/// States of the receiving side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    AwaitingMeta,
    AwaitingChunks,
    Done,
    Rejected,
    Failed,
}

/// Progress notifications for a UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Sender(SenderState),
    Receiver(ReceiverState),
    /// Bytes moved so far out of `total`.
    Progress { transferred: u64, total: u64 },
}

/// Optional sink for [`TransferEvent`]s.  A UI that went away is not an
/// error for the transfer.
#[derive(Debug, Clone, Default)]
pub(crate) struct Events(Option<mpsc::UnboundedSender<TransferEvent>>);

impl Events {
    pub(crate) fn new(tx: mpsc::UnboundedSender<TransferEvent>) -> Self {
        Self(Some(tx))
    }

    pub(crate) fn emit(&self, event: TransferEvent) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(event);
        }
    }
}
