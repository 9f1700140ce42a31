//! End-to-end upload and download sessions: rendezvous, peer connection and
//! transfer, wired together for one file.

use std::path::Path;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use punchdrop_core::config::Config;
use punchdrop_core::digest;
use punchdrop_core::transport::{Connector, Listener};
use punchdrop_core::{Error, Result};

use crate::connector::{self, PeerConnector};
use crate::pipeline::{
    FileReceiver, FileSender, ReceiveOptions, ReceiveOutcome, SendOptions, SendReport,
    TransferEvent,
};
use crate::rendezvous::RendezvousClient;

/// How long a downloader waits for the uploader's dial once introduced.
pub const ACCEPT_DEADLINE: Duration = Duration::from_secs(60);

/// Everything an upload needs besides the transport.
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    pub password: Option<String>,
    pub events: Option<mpsc::UnboundedSender<TransferEvent>>,
    pub cancel: CancellationToken,
}

/// Everything a download needs besides the transport.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub receive: ReceiveOptions,
    pub events: Option<mpsc::UnboundedSender<TransferEvent>>,
    pub cancel: CancellationToken,
}

/// Uploads `path` to the downloader registered as `uid`.
///
/// The same `connector` is used for the rendezvous service and the peer so
/// that the peer is dialed from the address the service observed.
///
/// # Errors
///
/// [`Error::PeerNotFound`] if `uid` is unknown (no dial is attempted),
/// [`Error::Cancelled`] if `options.cancel` fires at any point, or any
/// connector or transfer error.
pub async fn upload<K>(
    connector: K,
    config: &Config,
    uid: &str,
    path: &Path,
    options: UploadOptions,
) -> Result<SendReport>
where
    K: Connector + Clone,
{
    let rendezvous = RendezvousClient::new(connector.clone(), &config.rendezvous);
    let peer_addr = cancellable(&options.cancel, rendezvous.lookup(uid)).await?;

    let peer =
        PeerConnector::new(connector, &config.connect).with_cancellation(options.cancel.clone());
    let channel = peer.connect(&peer_addr).await?;
    info!(uid = %uid, peer = %peer_addr, file = %path.display(), "Sending file");

    let send_options = SendOptions {
        chunk_size: config.transfer.chunk_size,
        password_hash: digest::hash_password(options.password.as_deref().unwrap_or_default()),
    };
    let mut sender = FileSender::new(channel, send_options).with_cancellation(options.cancel);
    if let Some(events) = options.events {
        sender = sender.with_events(events);
    }
    sender.send(path).await
}

/// Registers with the rendezvous service, waits for an uploader and
/// receives one file.
///
/// `connector` must dial from the socket `listener` is bound to.  `on_uid`
/// is called once with the identifier to hand to the uploader.
///
/// # Errors
///
/// [`Error::Cancelled`] if `options.cancel` fires at any point, or any
/// rendezvous, connection or transfer error.
pub async fn download<K, L>(
    connector: K,
    mut listener: L,
    config: &Config,
    options: DownloadOptions,
    on_uid: impl FnOnce(&str),
) -> Result<ReceiveOutcome>
where
    K: Connector,
    L: Listener,
{
    let rendezvous = RendezvousClient::new(connector, &config.rendezvous);
    let registration = cancellable(&options.cancel, rendezvous.register()).await?;
    on_uid(registration.uid());

    let uploader = cancellable(&options.cancel, registration.wait_for_peer()).await?;

    listener.punch(&uploader).await;
    let channel = cancellable(
        &options.cancel,
        connector::accept_peer(&mut listener, ACCEPT_DEADLINE),
    )
    .await?;
    info!(peer = %channel.peer(), "Receiving file");

    let mut receiver =
        FileReceiver::new(channel, options.receive).with_cancellation(options.cancel);
    if let Some(events) = options.events {
        receiver = receiver.with_events(events);
    }
    receiver.receive().await
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        () = cancel.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}
