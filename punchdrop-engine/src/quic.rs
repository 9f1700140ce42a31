use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::Context;
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use tokio::io::{AsyncRead, ReadBuf};
use tracing::{debug, info};

use punchdrop_core::tls::{self, CertKeyPair};
use punchdrop_core::transport::{Connection, Connector, Listener};

const ALPN_PROTOCOL: &[u8] = b"punchdrop/1";
/// Name sent in the TLS handshake.  Never verified; see [`punchdrop_core::tls`].
const SERVER_NAME: &str = "punchdrop";
/// Keeps NAT mappings and idle peers alive while waiting on the rendezvous
/// service.
const KEEP_ALIVE: Duration = Duration::from_secs(5);
const IDLE_TIMEOUT_MS: u32 = 60_000;
/// How long an accepted connection may take to open its stream.
const STREAM_OPEN_TIMEOUT: Duration = Duration::from_secs(10);
/// How long outbound punch packets keep being retransmitted.
const PUNCH_WINDOW: Duration = Duration::from_secs(3);

/// Read half of a [`QuicConnection`].
///
/// Holds a handle on the connection so it stays open for as long as
/// either half is alive.
pub struct QuicReader {
    recv: quinn::RecvStream,
    _connection: quinn::Connection,
}

impl AsyncRead for QuicReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.recv).poll_read(cx, buf)
    }
}

/// A QUIC connection carrying one bidirectional stream.
///
/// The dialing side opens the stream; the accepting side waits for it, which
/// happens as soon as the dialer writes its first frame.
pub struct QuicConnection {
    connection: quinn::Connection,
    send: quinn::SendStream,
    recv: quinn::RecvStream,
    peer_addr: String,
}

impl Connection for QuicConnection {
    type Reader = QuicReader;
    type Writer = quinn::SendStream;

    fn peer(&self) -> String {
        self.peer_addr.clone()
    }

    fn into_split(self) -> (Self::Reader, Self::Writer) {
        let reader = QuicReader {
            recv: self.recv,
            _connection: self.connection,
        };
        (reader, self.send)
    }
}

/// One UDP socket used both to dial and to accept.
///
/// Talking to the rendezvous service and to the peer from the same socket is
/// what makes hole punching work: the address the service observed is the
/// address the NAT will route back to us.
#[derive(Clone)]
pub struct QuicEndpoint {
    endpoint: quinn::Endpoint,
    local_addr: String,
    /// Address whose certificate is pinned, and the config enforcing it.
    pinned: Option<(String, quinn::ClientConfig)>,
}

impl QuicEndpoint {
    /// An endpoint that can only dial out (uploader side).
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound or the TLS
    /// configuration fails.
    pub fn client(identity: &CertKeyPair, bind_addr: SocketAddr) -> anyhow::Result<Self> {
        let mut endpoint = quinn::Endpoint::client(bind_addr)
            .with_context(|| format!("failed to bind QUIC endpoint on {bind_addr}"))?;
        endpoint.set_default_client_config(build_client_config(identity)?);
        Self::from_endpoint(endpoint)
    }

    /// An endpoint that accepts connections and can also dial out
    /// (downloader side and rendezvous service).
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound or the TLS
    /// configuration fails.
    pub fn server(identity: &CertKeyPair, bind_addr: SocketAddr) -> anyhow::Result<Self> {
        let mut endpoint = quinn::Endpoint::server(build_server_config(identity)?, bind_addr)
            .with_context(|| format!("failed to bind QUIC endpoint on {bind_addr}"))?;
        endpoint.set_default_client_config(build_client_config(identity)?);
        Self::from_endpoint(endpoint)
    }

    fn from_endpoint(endpoint: quinn::Endpoint) -> anyhow::Result<Self> {
        let local_addr = endpoint
            .local_addr()
            .context("failed to retrieve local address")?
            .to_string();
        info!(addr = %local_addr, "QUIC endpoint bound");
        Ok(Self {
            endpoint,
            local_addr,
            pinned: None,
        })
    }

    /// Requires the server dialed at exactly `addr` to present the
    /// certificate with SHA-256 `fingerprint`.  Other dials are unaffected.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS configuration fails.
    pub fn with_pinned_server(
        mut self,
        identity: &CertKeyPair,
        addr: impl Into<String>,
        fingerprint: &str,
    ) -> anyhow::Result<Self> {
        let tls_config = tls::pinned_client_config(identity, ALPN_PROTOCOL, fingerprint)?;
        let addr = addr.into();
        debug!(addr = %addr, fingerprint = %fingerprint, "Pinned server certificate");
        self.pinned = Some((addr, quic_client_config(tls_config)?));
        Ok(self)
    }

    /// Waits until every connection on this endpoint has been closed and
    /// its close acknowledged, so final messages are not lost on exit.
    pub async fn wait_idle(&self) {
        self.endpoint.wait_idle().await;
    }
}

impl Connector for QuicEndpoint {
    type Conn = QuicConnection;

    fn connect<'a>(
        &'a self,
        addr: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + 'a {
        async move {
            let remote = tokio::net::lookup_host(addr)
                .await
                .with_context(|| format!("failed to resolve {addr}"))?
                .next()
                .with_context(|| format!("no address found for {addr}"))?;

            let connecting = match &self.pinned {
                Some((pinned_addr, config)) if pinned_addr == addr => {
                    self.endpoint.connect_with(config.clone(), remote, SERVER_NAME)
                }
                _ => self.endpoint.connect(remote, SERVER_NAME),
            };
            let connection = connecting
                .with_context(|| format!("failed to start QUIC connection to {remote}"))?
                .await
                .with_context(|| format!("failed to complete QUIC handshake with {remote}"))?;

            let (send, recv) = connection
                .open_bi()
                .await
                .context("failed to open bi-directional QUIC stream")?;

            let peer_addr = connection.remote_address().to_string();
            debug!(peer = %peer_addr, "Opened QUIC connection");

            Ok(QuicConnection {
                connection,
                send,
                recv,
                peer_addr,
            })
        }
    }
}

impl Listener for QuicEndpoint {
    type Conn = QuicConnection;

    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }

    fn accept(&mut self) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + '_ {
        async move {
            let incoming = self
                .endpoint
                .accept()
                .await
                .context("QUIC endpoint closed")?;

            let connection = incoming
                .await
                .context("failed to complete QUIC handshake")?;

            let (send, recv) = tokio::time::timeout(STREAM_OPEN_TIMEOUT, connection.accept_bi())
                .await
                .context("peer did not open a stream in time")?
                .context("failed to accept bi-directional QUIC stream")?;

            let peer_addr = connection.remote_address().to_string();
            debug!(peer = %peer_addr, "Accepted QUIC connection");

            Ok(QuicConnection {
                connection,
                send,
                recv,
                peer_addr,
            })
        }
    }

    fn punch<'a>(&'a self, addr: &'a str) -> impl Future<Output = ()> + Send + 'a {
        async move {
            let remote: SocketAddr = match addr.parse() {
                Ok(remote) => remote,
                Err(e) => {
                    debug!(addr = %addr, error = %e, "Not punching towards unparsable address");
                    return;
                }
            };

            // The handshake is expected to go unanswered: the point is the
            // outbound Initial packets, which open our side of the NAT.
            match self.endpoint.connect(remote, SERVER_NAME) {
                Ok(connecting) => match tokio::time::timeout(PUNCH_WINDOW, connecting).await {
                    Ok(Ok(connection)) => connection.close(0u32.into(), b"punch"),
                    _ => debug!(addr = %addr, "Punch packets sent"),
                },
                Err(e) => debug!(addr = %addr, error = %e, "Could not send punch packets"),
            }
        }
    }
}

fn transport_config() -> Arc<quinn::TransportConfig> {
    let mut transport = quinn::TransportConfig::default();
    transport.keep_alive_interval(Some(KEEP_ALIVE));
    transport.max_idle_timeout(Some(quinn::VarInt::from_u32(IDLE_TIMEOUT_MS).into()));
    Arc::new(transport)
}

fn build_server_config(identity: &CertKeyPair) -> anyhow::Result<quinn::ServerConfig> {
    let tls_config = tls::server_config(identity, ALPN_PROTOCOL)?;

    let quic_config: QuicServerConfig = tls_config
        .try_into()
        .context("failed to build QUIC server config")?;

    let mut config = quinn::ServerConfig::with_crypto(Arc::new(quic_config));
    config.transport_config(transport_config());
    Ok(config)
}

fn build_client_config(identity: &CertKeyPair) -> anyhow::Result<quinn::ClientConfig> {
    quic_client_config(tls::client_config(identity, ALPN_PROTOCOL)?)
}

fn quic_client_config(tls_config: rustls::ClientConfig) -> anyhow::Result<quinn::ClientConfig> {
    let quic_config: QuicClientConfig = tls_config
        .try_into()
        .context("failed to build QUIC client config")?;

    let mut config = quinn::ClientConfig::new(Arc::new(quic_config));
    config.transport_config(transport_config());
    Ok(config)
}
