//! Direct connection to a peer whose address the rendezvous service handed
//! out: a bounded dial loop followed by the version handshake.
//!
//! A channel returned from here has passed the handshake; nothing else may
//! be sent on a connection before that.

use std::io;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use punchdrop_core::config::ConnectConfig;
use punchdrop_core::protocol::{PROTOCOL_VERSION, Packet};
use punchdrop_core::transport::{Connector, Listener};
use punchdrop_core::{Error, Result};

use crate::channel::{MessageChannel, unexpected};

/// How long the peer has to announce its version.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_JITTER: f64 = 0.2;

/// Backoff schedule of the dial loop.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of each delay randomly added or removed, in `0.0..=1.0`.
    pub jitter: f64,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &ConnectConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: config.initial_delay(),
            max_delay: config.max_delay().max(config.initial_delay()),
            jitter: DEFAULT_JITTER,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based):
    /// doubles each time up to `max_delay`, then jitter is applied.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_delay
            .saturating_mul(1 << exponent)
            .min(self.max_delay);

        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter <= 0.0 {
            return base;
        }
        let factor = 1.0 + jitter * (fastrand::f64() * 2.0 - 1.0);
        base.mul_f64(factor)
    }
}

/// Dials peers with bounded retries and verifies protocol compatibility.
pub struct PeerConnector<K> {
    connector: K,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl<K: Connector> PeerConnector<K> {
    pub fn new(connector: K, config: &ConnectConfig) -> Self {
        Self::with_policy(connector, RetryPolicy::from_config(config))
    }

    pub fn with_policy(connector: K, policy: RetryPolicy) -> Self {
        Self {
            connector,
            policy,
            cancel: CancellationToken::new(),
        }
    }

    /// Uses `cancel` to abort a pending dial loop.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Dials `addr` until it answers or the attempts run out, then performs
    /// the version handshake.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectExhausted`] after `max_attempts` failed dials.
    /// - [`Error::Cancelled`] if the token fires first.
    /// - [`Error::IncompatiblePeer`] if the peer speaks another version; the
    ///   connection is closed.
    /// - Any handshake error.
    pub async fn connect(&self, addr: &str) -> Result<MessageChannel> {
        let max = self.policy.max_attempts;
        let mut last_error = String::new();

        for attempt in 1..=max {
            if attempt > 1 {
                let delay = self.policy.delay_for(attempt - 1);
                debug!(peer = %addr, attempt, delay = ?delay, "Backing off before next dial");
                tokio::select! {
                    () = self.cancel.cancelled() => return Err(Error::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
            }

            let dialed = tokio::select! {
                () = self.cancel.cancelled() => return Err(Error::Cancelled),
                dialed = self.connector.connect(addr) => dialed,
            };

            match dialed {
                Ok(conn) => {
                    info!(peer = %addr, attempt, "Connected to peer");
                    let mut channel = MessageChannel::new(conn);
                    handshake(&mut channel).await?;
                    return Ok(channel);
                }
                Err(e) => {
                    warn!(peer = %addr, attempt, max, error = %e, "Dial failed");
                    last_error = format!("{e:#}");
                }
            }
        }

        Err(Error::ConnectExhausted {
            addr: addr.to_string(),
            attempts: max,
            last_error,
        })
    }
}

/// Waits up to `deadline` for a peer to dial in, then performs the version
/// handshake.
///
/// # Errors
///
/// A transport error if nobody connects in time or the accept fails, or any
/// handshake error.
pub async fn accept_peer<L: Listener>(listener: &mut L, deadline: Duration) -> Result<MessageChannel> {
    let conn = tokio::time::timeout(deadline, listener.accept())
        .await
        .map_err(|_| {
            Error::Transport(Box::new(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no peer connected within {}s", deadline.as_secs()),
            )))
        })?
        .map_err(Error::transport)?;

    let mut channel = MessageChannel::new(conn);
    info!(peer = %channel.peer(), "Peer connected");
    handshake(&mut channel).await?;
    Ok(channel)
}

/// Exchanges protocol versions.  Both sides announce first and read second,
/// so neither waits on the other.
///
/// # Errors
///
/// [`Error::IncompatiblePeer`] on a version mismatch, a malformed or
/// unexpected reply, or a transport error.
pub async fn handshake(channel: &mut MessageChannel) -> Result<()> {
    channel
        .send(Packet::VersionAnnounce, &[PROTOCOL_VERSION])
        .await?;

    let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, channel.recv())
        .await
        .map_err(|_| {
            Error::Transport(Box::new(io::Error::new(
                io::ErrorKind::TimedOut,
                "peer did not announce its protocol version",
            )))
        })??;

    if reply.packet != Packet::VersionAnnounce {
        return Err(unexpected(&reply));
    }
    let &[remote] = &reply.body[..] else {
        return Err(Error::MalformedMessage(format!(
            "version announcement of {} bytes",
            reply.body.len()
        )));
    };

    if remote != PROTOCOL_VERSION {
        warn!(peer = %channel.peer(), local = PROTOCOL_VERSION, remote, "Incompatible peer");
        return Err(Error::IncompatiblePeer {
            local: PROTOCOL_VERSION,
            remote,
        });
    }

    debug!(peer = %channel.peer(), version = remote, "Handshake complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::memory::{MemoryConnector, MemoryNetwork};

    const PEER: &str = "peer:9000";

    /// Refuses the first `failures` dials, then delegates.
    struct FlakyConnector {
        inner: MemoryConnector,
        failures: u32,
        attempts: Arc<AtomicU32>,
    }

    impl Connector for FlakyConnector {
        type Conn = <MemoryConnector as Connector>::Conn;

        fn connect<'a>(
            &'a self,
            addr: &'a str,
        ) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + 'a {
            async move {
                let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt <= self.failures {
                    anyhow::bail!("connection refused (attempt {attempt})");
                }
                self.inner.connect(addr).await
            }
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            jitter: 0.0,
        }
    }

    fn flaky(network: &MemoryNetwork, failures: u32) -> (FlakyConnector, Arc<AtomicU32>) {
        let attempts = Arc::new(AtomicU32::new(0));
        let connector = FlakyConnector {
            inner: network.connector("me:1000"),
            failures,
            attempts: Arc::clone(&attempts),
        };
        (connector, attempts)
    }

    #[test]
    fn given_no_jitter_when_computing_delays_then_doubles_up_to_cap() {
        let policy = policy(10);
        let delays: Vec<u64> = (1..=6).map(|a| policy.delay_for(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 8, 8]);
    }

    #[test]
    fn given_jitter_when_computing_delays_then_stays_within_band() {
        let policy = RetryPolicy {
            jitter: 0.25,
            ..policy(10)
        };
        for _ in 0..200 {
            let delay = policy.delay_for(2);
            assert!(delay >= Duration::from_millis(1500), "{delay:?}");
            assert!(delay <= Duration::from_millis(2500), "{delay:?}");
        }
    }

    #[test]
    fn given_default_config_when_building_policy_then_starts_at_one_second() {
        let policy = RetryPolicy::from_config(&ConnectConfig::default());
        assert_eq!(policy.initial_delay, Duration::from_secs(1));
        assert_eq!(policy.max_attempts, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn given_peer_comes_up_late_when_connecting_then_retries_until_success() {
        let network = MemoryNetwork::new();
        let mut listener = network.bind(PEER).unwrap();
        let (connector, attempts) = flaky(&network, 2);

        let acceptor =
            tokio::spawn(async move { accept_peer(&mut listener, Duration::from_secs(60)).await });

        let connector = PeerConnector::with_policy(connector, policy(5));
        let channel = connector.connect(PEER).await.unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(channel.peer(), PEER);
        assert_eq!(acceptor.await.unwrap().unwrap().peer(), "me:1000");
    }

    #[tokio::test(start_paused = true)]
    async fn given_peer_never_answers_when_connecting_then_exhausted_after_max_attempts() {
        let network = MemoryNetwork::new();
        let (connector, attempts) = flaky(&network, u32::MAX);

        let connector = PeerConnector::with_policy(connector, policy(3));
        let err = connector.connect(PEER).await.unwrap_err();

        assert!(matches!(
            err,
            Error::ConnectExhausted { attempts: 3, ref last_error, .. } if last_error.contains("attempt 3")
        ));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn given_cancellation_when_backing_off_then_cancelled_without_more_dials() {
        let network = MemoryNetwork::new();
        let (connector, attempts) = flaky(&network, u32::MAX);
        let cancel = CancellationToken::new();

        let connector = PeerConnector::with_policy(connector, policy(10)).with_cancellation(cancel.clone());
        let pending = tokio::spawn(async move { connector.connect(PEER).await });

        tokio::time::sleep(Duration::from_millis(1500)).await;
        cancel.cancel();

        assert!(matches!(pending.await.unwrap(), Err(Error::Cancelled)));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn given_peer_on_other_version_when_connecting_then_incompatible_peer() {
        let network = MemoryNetwork::new();
        let mut listener = network.bind(PEER).unwrap();

        let remote = tokio::spawn(async move {
            let mut channel = MessageChannel::new(listener.accept().await.unwrap());
            channel.send(Packet::VersionAnnounce, &[PROTOCOL_VERSION + 1]).await.unwrap();
            channel.recv().await.unwrap();
            // Dialer drops the connection after a failed handshake.
            channel.recv().await
        });

        let connector = PeerConnector::with_policy(network.connector("me:1000"), policy(1));
        let err = connector.connect(PEER).await.unwrap_err();

        assert!(matches!(
            err,
            Error::IncompatiblePeer { local: PROTOCOL_VERSION, remote } if remote == PROTOCOL_VERSION + 1
        ));
        assert!(matches!(remote.await.unwrap(), Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn given_peer_sends_data_first_when_handshaking_then_unexpected_packet() {
        let network = MemoryNetwork::new();
        let mut listener = network.bind(PEER).unwrap();

        let _remote = tokio::spawn(async move {
            let mut channel = MessageChannel::new(listener.accept().await.unwrap());
            channel.send_bare(Packet::ReadyAck).await.unwrap();
            let _ = channel.recv().await;
        });

        let connector = PeerConnector::with_policy(network.connector("me:1000"), policy(1));
        let err = connector.connect(PEER).await.unwrap_err();
        assert!(matches!(err, Error::UnexpectedPacket(Packet::ReadyAck)));
    }

    #[tokio::test(start_paused = true)]
    async fn given_nobody_dials_when_accepting_then_times_out() {
        let network = MemoryNetwork::new();
        let mut listener = network.bind(PEER).unwrap();

        let err = accept_peer(&mut listener, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(listener.local_addr(), PEER);
    }
}
