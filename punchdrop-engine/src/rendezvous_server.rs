//! The rendezvous service ("puncher").
//!
//! Downloaders register and get a short uid to share out of band.  When an
//! uploader looks that uid up, each side is told the address the service
//! observed for the other one, and the registration is forgotten.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use punchdrop_core::protocol::Packet;
use punchdrop_core::transport::{Connection, Listener};
use punchdrop_core::{Error, Result};

use crate::channel::MessageChannel;

const UID_LEN: usize = 8;

/// A downloader waiting for its uploader.
struct Waiting {
    addr: String,
    notify: oneshot::Sender<String>,
}

#[derive(Default)]
struct Registry {
    waiting: Mutex<HashMap<String, Waiting>>,
}

impl Registry {
    fn register(&self, addr: String, notify: oneshot::Sender<String>) -> String {
        let mut waiting = self.waiting.lock().unwrap_or_else(PoisonError::into_inner);
        let uid = loop {
            let candidate = Uuid::new_v4().simple().to_string()[..UID_LEN].to_string();
            if !waiting.contains_key(&candidate) {
                break candidate;
            }
        };
        waiting.insert(uid.clone(), Waiting { addr, notify });
        uid
    }

    fn take(&self, uid: &str) -> Option<Waiting> {
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(uid)
    }

    /// Drops `uid` if its downloader is gone.  A live registration that
    /// reuses the uid is left alone.
    fn forget(&self, uid: &str) {
        let mut waiting = self.waiting.lock().unwrap_or_else(PoisonError::into_inner);
        if waiting.get(uid).is_some_and(|w| w.notify.is_closed()) {
            waiting.remove(uid);
        }
    }

    fn len(&self) -> usize {
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// In-memory rendezvous service.  Cloning shares the registry.
#[derive(Clone, Default)]
pub struct RendezvousServer {
    registry: Arc<Registry>,
}

impl RendezvousServer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of downloaders currently waiting.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.registry.len()
    }

    /// Accepts connections until `shutdown` is cancelled.  Each connection
    /// is served on its own task.
    pub async fn serve<L: Listener>(&self, mut listener: L, shutdown: CancellationToken) {
        info!(addr = %listener.local_addr(), "Rendezvous service listening");

        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => break,

                result = listener.accept() => match result {
                    Ok(conn) => {
                        let registry = Arc::clone(&self.registry);
                        tokio::spawn(handle_connection(registry, conn));
                    }
                    Err(e) => warn!(error = %e, "Failed to accept connection"),
                },
            }
        }

        info!("Rendezvous service stopped");
    }
}

async fn handle_connection<C: Connection>(registry: Arc<Registry>, conn: C) {
    let mut channel = MessageChannel::new(conn);
    let peer = channel.peer().to_string();

    let result = match channel.recv().await {
        Ok(role) => match role.packet {
            Packet::ClientRoleDownloader => serve_downloader(&registry, &mut channel).await,
            Packet::ClientRoleUploader => serve_uploader(&registry, &mut channel).await,
            other => Err(Error::UnexpectedPacket(other)),
        },
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => channel.close().await,
        Err(Error::ConnectionClosed) => debug!(peer = %peer, "Client left"),
        Err(e) => {
            warn!(peer = %peer, error = %e, "Rendezvous session failed");
            channel.notify_failure(&e).await;
            channel.close().await;
        }
    }
}

async fn serve_downloader(registry: &Registry, channel: &mut MessageChannel) -> Result<()> {
    let (notify, uploader) = oneshot::channel();
    let uid = registry.register(channel.peer().to_string(), notify);
    info!(uid = %uid, peer = %channel.peer(), "Downloader registered");

    let _registration = RegistrationGuard {
        registry,
        uid: &uid,
    };
    wait_for_uploader(&uid, uploader, channel).await
}

async fn wait_for_uploader(
    uid: &str,
    uploader: oneshot::Receiver<String>,
    channel: &mut MessageChannel,
) -> Result<()> {
    channel.send(Packet::UidAssignment, uid.as_bytes()).await?;

    tokio::select! {
        addr = uploader => match addr {
            Ok(addr) => {
                debug!(uid = %uid, uploader = %addr, "Introducing uploader to downloader");
                channel.send(Packet::PeerReady, addr.as_bytes()).await
            }
            // Only reachable if the registry dropped us without a lookup.
            Err(_) => Err(Error::ConnectionClosed),
        },
        message = channel.recv() => match message {
            Ok(message) => Err(Error::UnexpectedPacket(message.packet)),
            Err(e) => Err(e),
        },
    }
}

/// Clears a registration once its downloader task is done with it, even if
/// that task is cancelled mid-wait.
struct RegistrationGuard<'a> {
    registry: &'a Registry,
    uid: &'a str,
}

impl Drop for RegistrationGuard<'_> {
    fn drop(&mut self) {
        self.registry.forget(self.uid);
    }
}

async fn serve_uploader(registry: &Registry, channel: &mut MessageChannel) -> Result<()> {
    let request = channel.recv().await?;
    if request.packet != Packet::UidLookupRequest {
        return Err(Error::UnexpectedPacket(request.packet));
    }
    let uid = request.body_text();
    let uploader_addr = channel.peer().to_string();

    let Some(waiting) = registry.take(&uid) else {
        info!(uid = %uid, peer = %uploader_addr, "Lookup for unknown uid");
        return channel.send_bare(Packet::PeerNotFound).await;
    };

    if waiting.notify.send(uploader_addr.clone()).is_err() {
        info!(uid = %uid, "Downloader left before its uploader arrived");
        return channel.send_bare(Packet::PeerNotFound).await;
    }

    info!(uid = %uid, uploader = %uploader_addr, downloader = %waiting.addr, "Peers introduced");
    channel.send(Packet::PeerReady, waiting.addr.as_bytes()).await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use punchdrop_core::config::RendezvousConfig;

    use super::*;
    use crate::memory::MemoryNetwork;
    use crate::rendezvous::RendezvousClient;

    const SERVICE: &str = "puncher:50977";

    fn config() -> RendezvousConfig {
        RendezvousConfig {
            host: "puncher".into(),
            port: 50977,
            fingerprint: None,
        }
    }

    fn start(network: &MemoryNetwork) -> (RendezvousServer, CancellationToken) {
        let server = RendezvousServer::new();
        let shutdown = CancellationToken::new();
        let listener = network.bind(SERVICE).unwrap();
        let (s, token) = (server.clone(), shutdown.clone());
        tokio::spawn(async move { s.serve(listener, token).await });
        (server, shutdown)
    }

    async fn wait_until_pending(server: &RendezvousServer, expected: usize) {
        for _ in 0..100 {
            if server.pending() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {expected} pending registrations, got {}", server.pending());
    }

    #[tokio::test]
    async fn given_registered_downloader_when_uploader_looks_up_then_both_learn_addresses() {
        let network = MemoryNetwork::new();
        let (server, _shutdown) = start(&network);

        let downloader = RendezvousClient::new(network.connector("10.0.0.2:6000"), &config());
        let registration = downloader.register().await.unwrap();
        let uid = registration.uid().to_string();
        assert_eq!(uid.len(), UID_LEN);
        let waiter = tokio::spawn(registration.wait_for_peer());

        let uploader = RendezvousClient::new(network.connector("10.0.0.1:7000"), &config());
        let downloader_addr = uploader.lookup(&uid).await.unwrap();

        assert_eq!(downloader_addr, "10.0.0.2:6000");
        assert_eq!(waiter.await.unwrap().unwrap(), "10.0.0.1:7000");
        wait_until_pending(&server, 0).await;
    }

    #[tokio::test]
    async fn given_unknown_uid_when_uploader_looks_up_then_peer_not_found() {
        let network = MemoryNetwork::new();
        let _server = start(&network);

        let uploader = RendezvousClient::new(network.connector("10.0.0.1:7000"), &config());
        let err = uploader.lookup("ghost").await.unwrap_err();
        assert!(matches!(err, Error::PeerNotFound(_)));
    }

    #[tokio::test]
    async fn given_uid_already_used_when_looked_up_again_then_peer_not_found() {
        let network = MemoryNetwork::new();
        let _server = start(&network);

        let downloader = RendezvousClient::new(network.connector("10.0.0.2:6000"), &config());
        let registration = downloader.register().await.unwrap();
        let uid = registration.uid().to_string();
        let _waiter = tokio::spawn(registration.wait_for_peer());

        let uploader = RendezvousClient::new(network.connector("10.0.0.1:7000"), &config());
        uploader.lookup(&uid).await.unwrap();
        let err = uploader.lookup(&uid).await.unwrap_err();
        assert!(matches!(err, Error::PeerNotFound(_)));
    }

    #[tokio::test]
    async fn given_downloader_disconnects_when_waiting_then_registration_dropped() {
        let network = MemoryNetwork::new();
        let (server, _shutdown) = start(&network);

        let downloader = RendezvousClient::new(network.connector("10.0.0.2:6000"), &config());
        let registration = downloader.register().await.unwrap();
        let uid = registration.uid().to_string();
        wait_until_pending(&server, 1).await;

        drop(registration);
        wait_until_pending(&server, 0).await;

        let uploader = RendezvousClient::new(network.connector("10.0.0.1:7000"), &config());
        let err = uploader.lookup(&uid).await.unwrap_err();
        assert!(matches!(err, Error::PeerNotFound(_)));
    }

    #[tokio::test]
    async fn given_client_sends_no_role_when_served_then_protocol_error_reported() {
        let network = MemoryNetwork::new();
        let _server = start(&network);

        let conn = {
            use punchdrop_core::transport::Connector;
            network.connector("rogue").connect(SERVICE).await.unwrap()
        };
        let mut channel = MessageChannel::new(conn);
        channel.send_bare(Packet::ChunkData).await.unwrap();

        let reply = channel.recv().await.unwrap();
        assert_eq!(reply.packet, Packet::ProtocolError);
    }

    #[tokio::test]
    async fn given_shutdown_when_cancelled_then_serve_returns() {
        let network = MemoryNetwork::new();
        let server = RendezvousServer::new();
        let shutdown = CancellationToken::new();
        let listener = network.bind(SERVICE).unwrap();

        let token = shutdown.clone();
        let task = tokio::spawn(async move { server.serve(listener, token).await });
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
