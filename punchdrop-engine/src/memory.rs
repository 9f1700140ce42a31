//! In-memory transport built on [`tokio::io::duplex`].
//!
//! Used by tests and by anything that wants to run both ends of the protocol
//! inside one process.  A [`MemoryNetwork`] plays the role of the internet:
//! listeners bind names on it and connectors dial those names.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, anyhow, bail};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

use punchdrop_core::transport::{Connection, Connector, Listener};

const PIPE_CAPACITY: usize = 256 * 1024;

/// One end of an in-memory pipe.
pub struct MemoryConnection {
    stream: DuplexStream,
    peer: String,
}

impl Connection for MemoryConnection {
    type Reader = ReadHalf<DuplexStream>;
    type Writer = WriteHalf<DuplexStream>;

    fn peer(&self) -> String {
        self.peer.clone()
    }

    fn into_split(self) -> (Self::Reader, Self::Writer) {
        tokio::io::split(self.stream)
    }
}

/// Creates two connected ends.  `a` is the name the second end reports as its
/// peer, and vice versa.
#[must_use]
pub fn pair(a: &str, b: &str) -> (MemoryConnection, MemoryConnection) {
    let (sa, sb) = tokio::io::duplex(PIPE_CAPACITY);
    (
        MemoryConnection {
            stream: sa,
            peer: b.to_string(),
        },
        MemoryConnection {
            stream: sb,
            peer: a.to_string(),
        },
    )
}

/// A namespace of in-memory listeners.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<MemoryConnection>>>>,
}

impl MemoryNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a listener under `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if a live listener already holds `addr`.
    pub fn bind(&self, addr: &str) -> anyhow::Result<MemoryListener> {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        if listeners.get(addr).is_some_and(|tx| !tx.is_closed()) {
            bail!("address already in use: {addr}");
        }
        let (tx, rx) = mpsc::unbounded_channel();
        listeners.insert(addr.to_string(), tx);
        Ok(MemoryListener {
            addr: addr.to_string(),
            incoming: rx,
        })
    }

    /// A connector dialing from `local_addr` into this network.
    #[must_use]
    pub fn connector(&self, local_addr: &str) -> MemoryConnector {
        MemoryConnector {
            network: self.clone(),
            local_addr: local_addr.to_string(),
        }
    }
}

/// Listener bound on a [`MemoryNetwork`].
pub struct MemoryListener {
    addr: String,
    incoming: mpsc::UnboundedReceiver<MemoryConnection>,
}

impl Listener for MemoryListener {
    type Conn = MemoryConnection;

    fn local_addr(&self) -> String {
        self.addr.clone()
    }

    fn accept(&mut self) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + '_ {
        async move {
            self.incoming
                .recv()
                .await
                .ok_or_else(|| anyhow!("memory listener {} closed", self.addr))
        }
    }
}

/// Connector dialing listeners of a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryConnector {
    network: MemoryNetwork,
    local_addr: String,
}

impl Connector for MemoryConnector {
    type Conn = MemoryConnection;

    fn connect<'a>(
        &'a self,
        addr: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + 'a {
        async move {
            let tx = self
                .network
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(addr)
                .cloned()
                .with_context(|| format!("connection refused: {addr}"))?;

            let (local, remote) = pair(&self.local_addr, addr);
            tx.send(remote)
                .map_err(|_| anyhow!("connection refused: {addr}"))?;
            Ok(local)
        }
    }
}
