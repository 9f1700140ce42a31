use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use punchdrop_engine::pipeline::{ReceiverState, SenderState, TransferEvent};

use crate::ui::{finish_progress, print_progress};

/// Spawns a task that prints transfer events until the sender side of
/// `events` is dropped.
pub fn spawn_progress_printer(mut events: mpsc::UnboundedReceiver<TransferEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut drawing = false;
        while let Some(event) = events.recv().await {
            match event {
                TransferEvent::Progress { transferred, total } => {
                    print_progress(transferred, total);
                    drawing = true;
                }
                other => {
                    if drawing {
                        finish_progress();
                        drawing = false;
                    }
                    if let Some(line) = describe(&other) {
                        println!("{line}");
                    }
                }
            }
        }
        if drawing {
            finish_progress();
        }
    })
}

/// One status line per state worth telling the user about.
fn describe(event: &TransferEvent) -> Option<&'static str> {
    match event {
        TransferEvent::Sender(SenderState::Init) => Some("Computing checksum..."),
        TransferEvent::Sender(SenderState::AwaitingReady) => Some("Waiting for the receiver to accept..."),
        TransferEvent::Sender(SenderState::AwaitingVerification) => {
            Some("Waiting for the receiver to verify...")
        }
        TransferEvent::Receiver(ReceiverState::AwaitingChunks) => Some("Receiving..."),
        _ => None,
    }
}
