//! Client side of the rendezvous ("puncher") handshake.
//!
//! The rendezvous service never carries file data.  It only tells each peer
//! the address the other one was observed at, so both can punch through
//! their NATs towards each other.

use tracing::{debug, info};

use punchdrop_core::config::RendezvousConfig;
use punchdrop_core::protocol::{Message, Packet};
use punchdrop_core::transport::Connector;
use punchdrop_core::{Error, Result};

use crate::channel::{MessageChannel, unexpected};

/// Talks to one rendezvous service through any [`Connector`].
pub struct RendezvousClient<K> {
    connector: K,
    addr: String,
}

impl<K: Connector> RendezvousClient<K> {
    pub fn new(connector: K, config: &RendezvousConfig) -> Self {
        Self {
            connector,
            addr: config.addr(),
        }
    }

    /// Address of the rendezvous service this client talks to.
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// The connector, handed back so the same socket can dial the peer.
    #[must_use]
    pub fn into_connector(self) -> K {
        self.connector
    }

    /// Asks the service for the address of the peer registered as `uid`.
    ///
    /// Single attempt: failures are reported, never retried here.
    ///
    /// # Errors
    ///
    /// - [`Error::PeerNotFound`] if nobody is registered under `uid`.
    /// - [`Error::UnexpectedPacket`] for any other reply.
    /// - [`Error::Transport`] / [`Error::ConnectionClosed`] if the service
    ///   cannot be reached or hangs up.
    pub async fn lookup(&self, uid: &str) -> Result<String> {
        let mut channel = self.open().await?;

        channel.send_bare(Packet::ClientRoleUploader).await?;
        channel.send(Packet::UidLookupRequest, uid.as_bytes()).await?;

        let reply = channel.recv().await?;
        let result = peer_address(reply, uid);
        channel.close().await;

        let addr = result?;
        info!(uid = %uid, peer = %addr, "Rendezvous resolved peer");
        Ok(addr)
    }

    /// Registers as a downloader and returns the uid the service assigned.
    ///
    /// The connection stays open in the returned [`Registration`]: the
    /// service keeps the registration only as long as it does.
    ///
    /// # Errors
    ///
    /// [`Error::UnexpectedPacket`] if the service replies with anything but
    /// an assignment, or a transport error.
    pub async fn register(&self) -> Result<Registration> {
        let mut channel = self.open().await?;

        channel.send_bare(Packet::ClientRoleDownloader).await?;

        let reply = channel.recv().await?;
        match reply.packet {
            Packet::UidAssignment if !reply.body.is_empty() => {
                let uid = reply.body_text();
                info!(uid = %uid, "Registered with rendezvous service");
                Ok(Registration { uid, channel })
            }
            Packet::UidAssignment => Err(Error::MalformedMessage("empty uid assignment".into())),
            _ => Err(unexpected(&reply)),
        }
    }

    async fn open(&self) -> Result<MessageChannel> {
        debug!(addr = %self.addr, "Connecting to rendezvous service");
        let conn = self
            .connector
            .connect(&self.addr)
            .await
            .map_err(Error::transport)?;
        Ok(MessageChannel::new(conn))
    }
}

/// A downloader's open registration with the rendezvous service.
#[derive(Debug)]
pub struct Registration {
    uid: String,
    channel: MessageChannel,
}

impl Registration {
    /// The identifier uploaders must look up to reach us.
    #[must_use]
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Waits until an uploader looks us up and returns its address.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectionClosed`] if the service goes away first,
    /// [`Error::UnexpectedPacket`] for any other reply.
    pub async fn wait_for_peer(mut self) -> Result<String> {
        let reply = self.channel.recv().await?;
        let result = peer_address(reply, &self.uid);
        self.channel.close().await;

        let addr = result?;
        info!(uid = %self.uid, peer = %addr, "Uploader is on its way");
        Ok(addr)
    }
}

fn peer_address(reply: Message, uid: &str) -> Result<String> {
    match reply.packet {
        Packet::PeerReady if reply.body.is_empty() => {
            Err(Error::MalformedMessage("peer ready without an address".into()))
        }
        Packet::PeerReady => Ok(reply.body_text()),
        Packet::PeerNotFound => Err(Error::PeerNotFound(uid.to_string())),
        other => {
            if !reply.body.is_empty() {
                debug!(packet = ?other, body = %reply.body_text(), "Unexpected reply from rendezvous service");
            }
            Err(Error::UnexpectedPacket(other))
        }
    }
}
