use std::future::Future;

use tokio::io::{AsyncRead, AsyncWrite};

/// A transport-agnostic, already-encrypted byte stream to one remote end.
///
/// A connection is consumed by splitting it into independent read and write
/// halves, so that a dedicated reader task can drain inbound bytes while the
/// protocol logic writes on its own schedule.
pub trait Connection: Send + 'static {
    type Reader: AsyncRead + Unpin + Send + 'static;
    type Writer: AsyncWrite + Unpin + Send + 'static;

    /// Returns a human-readable identifier for the remote end
    /// (e.g. `"127.0.0.1:54321"`).
    fn peer(&self) -> String;

    /// Splits the connection into its read and write halves.
    ///
    /// Shutting down the writer signals end-of-stream to the remote end;
    /// the reader returns `Ok(0)` once the remote end has done the same.
    fn into_split(self) -> (Self::Reader, Self::Writer);
}

/// An async listener that accepts incoming [`Connection`]s.
pub trait Listener: Send + 'static {
    /// The concrete connection type produced by [`accept`](Listener::accept).
    type Conn: Connection;

    /// Returns the local address the listener is bound to
    /// (e.g. `"0.0.0.0:9000"`).
    fn local_addr(&self) -> String;

    /// Waits for and accepts the next inbound connection.
    fn accept(&mut self) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + '_;

    /// Sends traffic from the listening socket towards `addr`, so that a NAT
    /// or firewall in front of this listener lets that address's dial in.
    ///
    /// Best effort; transports without such a notion do nothing.
    fn punch<'a>(&'a self, addr: &'a str) -> impl Future<Output = ()> + Send + 'a {
        let _ = addr;
        async {}
    }
}

/// Factory for creating outbound [`Connection`]s (client side).
///
/// The rendezvous client and the peer connector are generic over this trait
/// so they work with QUIC in production and in-memory pipes in tests.
pub trait Connector: Send + Sync + 'static {
    /// The concrete connection type produced by [`connect`](Connector::connect).
    type Conn: Connection;

    /// Opens a new outbound connection to the given address.
    fn connect<'a>(
        &'a self,
        addr: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + 'a;
}
