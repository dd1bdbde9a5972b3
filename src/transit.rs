//! Connect two sides via TCP, no matter where they are
//!
//! Both clients exchange messages containing hints on how to find each other (over the already
//! encrypted [`Wormhole`](crate::Wormhole)). These may be local IP addresses in case they are in the
//! same network, or the address of a relay server. All of them are tried at once; the relay server
//! transparently glues two connections together that present the same token.
//!
//! **Notice:** while the resulting TCP connection is naturally bi-directional, the handshake is not symmetric. There *must* be one
//! "leader" side and one "follower" side (formerly called "sender" and "receiver"). The leader picks
//! the connection that is used, the follower goes with it.

use crate::{Key, KeyPurpose, config::WormholeConfig, util};
use serde_derive::{Deserialize, Serialize};

use async_std::net::TcpListener;
use futures::{
    FutureExt, StreamExt,
    future::BoxFuture,
    io::AsyncWriteExt,
    stream::{BoxStream, FuturesUnordered},
};
use std::{net::SocketAddr, sync::Arc, time::Duration};

mod crypto;
mod transport;

use crypto::{RecordOpener, RecordSealer, TransitHandshakeError, TransitSecrets, Verdict};
use transport::{TransitConnection, TransitTransport, TransitTransportRx};

pub use crypto::MAX_RECORD_SIZE;

/// Relay attempts wait this long when there are direct candidates, to give those a head start
const RELAY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub struct TransitKey;
impl KeyPurpose for TransitKey {}
#[derive(Debug)]
pub struct TransitRxKey;
impl KeyPurpose for TransitRxKey {}
#[derive(Debug)]
pub struct TransitTxKey;
impl KeyPurpose for TransitTxKey {}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TransitError {
    #[error("All (relay) handshakes failed or timed out, could not establish a connection with the peer")]
    NoConnection,
    #[error("Invalid relay server URL '{}'", _0)]
    RelayUrl(Box<str>),
    #[error("IO error")]
    IO(
        #[from]
        #[source]
        std::io::Error,
    ),
}

/// Failure of a single record on an established connection
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RecordError {
    #[error("Record failed to decrypt. It was corrupted or tampered with.")]
    Crypto,
    #[error("Record out of sequence, got #{got} but expected #{expected}. This may be caused by an attack.")]
    Sequence { expected: u64, got: u64 },
    #[error("Record of {} bytes is too large", _0)]
    TooLarge(usize),
    #[error("Connection to the peer broke")]
    Io(
        #[from]
        #[source]
        std::io::Error,
    ),
    #[error("The peer did not send or receive data in time")]
    Timeout,
}

/**
 * Defines a way to find the other side.
 *
 * Each ability comes with a set of [`TransitCandidate`]s to encode how to meet up.
 */
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Abilities {
    /** Direct connection to the peer */
    pub direct_tcp_v1: bool,
    /** Connection over a TCP relay */
    pub relay_v1: bool,
}

impl Abilities {
    pub const ALL_ABILITIES: Self = Self {
        direct_tcp_v1: true,
        relay_v1: true,
    };

    /**
     * If you absolutely don't want to use any relay servers.
     *
     * If the other side forces relay usage or doesn't support any of your connection modes
     * the attempt will fail.
     */
    pub const FORCE_DIRECT: Self = Self {
        direct_tcp_v1: true,
        relay_v1: false,
    };

    /**
     * If you don't want to disclose your IP address to your peer
     *
     * If the other side forces a the usage of a direct connection the attempt will fail.
     * Note that the other side might control the relay server being used, if you really
     * don't want your IP to potentially be disclosed use TOR instead (not supported by
     * the Rust implementation yet).
     */
    pub const FORCE_RELAY: Self = Self {
        direct_tcp_v1: false,
        relay_v1: true,
    };

    pub fn can_direct(&self) -> bool {
        self.direct_tcp_v1
    }

    pub fn can_relay(&self) -> bool {
        self.relay_v1
    }

    /** Keep only abilities that both sides support */
    pub fn intersect(self, other: &Self) -> Self {
        Self {
            direct_tcp_v1: self.direct_tcp_v1 && other.direct_tcp_v1,
            relay_v1: self.relay_v1 && other.relay_v1,
        }
    }
}

impl Default for Abilities {
    fn default() -> Self {
        Self::ALL_ABILITIES
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, derive_more::Display)]
pub enum CandidateKind {
    #[display("direct")]
    Direct,
    #[display("relay")]
    Relay,
}

/// One way to reach a side: a listening address of the peer, or a relay server
#[derive(Clone, Debug, PartialEq, Eq, Hash, derive_more::Display)]
#[display("{kind} candidate {host}:{port}")]
pub struct TransitCandidate {
    pub host: String,
    pub port: u16,
    pub kind: CandidateKind,
    /// Higher is better
    pub priority: i32,
}

impl TransitCandidate {
    pub fn direct(host: impl Into<String>, port: u16) -> Self {
        TransitCandidate {
            host: host.into(),
            port,
            kind: CandidateKind::Direct,
            priority: 0,
        }
    }

    pub fn relay(host: impl Into<String>, port: u16) -> Self {
        TransitCandidate {
            host: host.into(),
            port,
            kind: CandidateKind::Relay,
            priority: 0,
        }
    }
}

/// Who decides which connection is used
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransitRole {
    /// The sending side. Commits to one connection with `go`.
    Leader,
    /// The receiving side. Uses whatever the leader committed to.
    Follower,
}

/// Metadata for the established transit connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitInfo {
    pub conn_type: CandidateKind,
    /// Address of the peer or the relay
    pub peer_addr: SocketAddr,
}

/// Parse `tcp://host:port`, or the legacy `tcp:host:port`
fn parse_relay_url(relay_url: &str) -> Result<TransitCandidate, TransitError> {
    if let Ok(url) = url::Url::parse(relay_url) {
        if let (Some(host), Some(port)) = (url.host(), url.port()) {
            ensure!(
                url.scheme() == "tcp",
                TransitError::RelayUrl(relay_url.into())
            );
            let host = match host {
                url::Host::Domain(domain) => domain.to_string(),
                url::Host::Ipv4(ip) => ip.to_string(),
                url::Host::Ipv6(ip) => ip.to_string(),
            };
            return Ok(TransitCandidate::relay(host, port));
        }
    }
    match relay_url.split(':').collect::<Vec<_>>()[..] {
        ["tcp", host, port] if !host.is_empty() => port
            .parse()
            .map(|port| TransitCandidate::relay(host, port))
            .map_err(|_| TransitError::RelayUrl(relay_url.into())),
        _ => bail!(TransitError::RelayUrl(relay_url.into())),
    }
}

/**
 * A partially set up [`Transit`] connection.
 *
 * Bind a port (if direct connections are enabled) and generate our candidates. This does not do any
 * communication yet. Send the candidates to the other side, receive theirs, then call
 * [`TransitConnector::negotiate`].
 */
#[derive(Debug)]
pub struct TransitConnector {
    listener: Option<TcpListener>,
    abilities: Abilities,
    local: Vec<TransitCandidate>,
    relay: Option<TransitCandidate>,
    connect_timeout: Duration,
    record_timeout: Duration,
}

impl TransitConnector {
    pub async fn init(
        config: &WormholeConfig,
        abilities: Abilities,
    ) -> Result<Self, TransitError> {
        let relay = if abilities.can_relay() {
            Some(parse_relay_url(&config.relay_url)?)
        } else {
            None
        };

        let mut listener = None;
        let mut local = Vec::new();
        if abilities.can_direct() {
            let socket = match TcpListener::bind("[::]:0").await {
                Ok(socket) => socket,
                Err(error) => {
                    tracing::debug!("No IPv6 listener ({}), falling back to IPv4", error);
                    TcpListener::bind("0.0.0.0:0").await?
                },
            };
            let port = socket.local_addr()?.port();
            local.extend(
                if_addrs::get_if_addrs()?
                    .iter()
                    .filter(|iface| !iface.is_loopback())
                    .map(|iface| TransitCandidate::direct(iface.ip().to_string(), port)),
            );
            tracing::debug!("Listening on port {} with {} local candidates", port, local.len());
            listener = Some(socket);
        }

        Ok(TransitConnector {
            listener,
            abilities,
            local,
            relay,
            connect_timeout: config.connect_timeout,
            record_timeout: config.record_timeout,
        })
    }

    pub fn abilities(&self) -> &Abilities {
        &self.abilities
    }

    /** Our candidates. Send these to the other side. */
    pub fn gather_local_candidates(&self) -> Vec<TransitCandidate> {
        self.local.iter().chain(self.relay.iter()).cloned().collect()
    }

    /// Port of our listener, if we accept direct connections
    pub fn listening_port(&self) -> Option<u16> {
        self.listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
            .map(|addr| addr.port())
    }

    /**
     * Connect to the other side
     *
     * All candidates are tried concurrently, as well as inbound connections on our listener.
     * The leader takes the first connection that completes the handshake (a direct one, if
     * several complete together) and tells the follower with `go`. Everything else gets dropped.
     */
    pub async fn negotiate(
        self,
        peer: Vec<TransitCandidate>,
        role: TransitRole,
        transit_key: Key<TransitKey>,
    ) -> Result<(Transit, TransitInfo), TransitError> {
        let secrets = Arc::new(TransitSecrets::new(transit_key));

        let attempts: FuturesUnordered<Attempt> = FuturesUnordered::new();
        let mut direct = peer
            .iter()
            .filter(|candidate| candidate.kind == CandidateKind::Direct && self.abilities.can_direct())
            .cloned()
            .collect::<Vec<_>>();
        direct.sort_by_key(|candidate| -candidate.priority);
        let relay_delay = if direct.is_empty() {
            Duration::ZERO
        } else {
            RELAY_DELAY
        };
        for candidate in direct {
            attempts.push(connect_attempt(
                candidate,
                role,
                secrets.clone(),
                Duration::ZERO,
                self.connect_timeout,
            ));
        }

        /* Our relay and theirs, each only once */
        let mut relays: Vec<TransitCandidate> = Vec::new();
        if self.abilities.can_relay() {
            for candidate in self.relay.iter().chain(
                peer.iter()
                    .filter(|candidate| candidate.kind == CandidateKind::Relay),
            ) {
                if !relays
                    .iter()
                    .any(|known| known.host == candidate.host && known.port == candidate.port)
                {
                    relays.push(candidate.clone());
                }
            }
        }
        for candidate in relays {
            attempts.push(connect_attempt(
                candidate,
                role,
                secrets.clone(),
                relay_delay,
                self.connect_timeout,
            ));
        }

        let inbound: BoxStream<'_, HandshakeResult> = match &self.listener {
            Some(listener) => {
                let secrets = secrets.clone();
                let connect_timeout = self.connect_timeout;
                listener
                    .incoming()
                    .filter_map(|socket| async move {
                        socket
                            .map_err(|error| tracing::debug!("Failed to accept: {}", error))
                            .ok()
                    })
                    .map(move |socket| accept_attempt(socket, role, secrets.clone(), connect_timeout))
                    .buffer_unordered(16)
                    .boxed()
            },
            None => futures::stream::empty().boxed(),
        };

        if attempts.is_empty() && self.listener.is_none() {
            tracing::warn!("No transit candidates to try, the peer's abilities don't match ours");
            bail!(TransitError::NoConnection);
        }

        let mut results = futures::stream::select(attempts, inbound);
        let deadline = relay_delay + self.connect_timeout * 2;
        let first = util::timeout(deadline, first_success(&mut results))
            .await
            .map_err(|_| TransitError::NoConnection)?
            .ok_or(TransitError::NoConnection)?;

        let (mut socket, info, verdict) = match role {
            TransitRole::Follower => first,
            TransitRole::Leader => {
                /* Whatever else finished in the same instant also competes */
                let mut finished = vec![first];
                while let Some(Some(result)) = results.next().now_or_never() {
                    if let Ok(done) = result {
                        finished.push(done);
                    }
                }
                let winner = finished
                    .iter()
                    .position(|(_, info, _)| info.conn_type == CandidateKind::Direct)
                    .unwrap_or(0);
                let chosen = finished.swap_remove(winner);
                let losers: Vec<_> = finished.into_iter().map(|(socket, info, _)| (socket, info)).collect();
                dismiss(losers).await;
                chosen
            },
        };
        /* Cancel all remaining handshakes */
        drop(results);

        tracing::debug!("Using {} connection to {}", info.conn_type, info.peer_addr);
        let (tx, rx) = verdict
            .commit(&mut socket)
            .await
            .map_err(|error| {
                tracing::debug!("Final handshake step failed: {}", error);
                TransitError::NoConnection
            })?;

        Ok((
            Transit {
                socket,
                tx,
                rx,
                info: info.clone(),
                record_timeout: self.record_timeout,
            },
            info,
        ))
    }
}

/// Tell the peer on each losing connection that we went with another one, then hang up
async fn dismiss(losers: impl IntoIterator<Item = (Box<dyn TransitTransport>, TransitInfo)>) {
    for (mut socket, info) in losers {
        tracing::debug!("Sending 'nevermind' to {:?}", info);
        if let Err(error) = socket.write_all(b"nevermind\n").await {
            tracing::debug!("Could not send 'nevermind': {}", error);
        }
        if let Err(error) = socket.close().await {
            tracing::debug!("Could not close the losing connection: {}", error);
        }
    }
}

type HandshakeDone = (Box<dyn TransitTransport>, TransitInfo, Verdict);
type HandshakeResult = Result<HandshakeDone, TransitHandshakeError>;
type Attempt = BoxFuture<'static, HandshakeResult>;

async fn first_success(
    results: &mut (impl futures::Stream<Item = HandshakeResult> + Unpin),
) -> Option<HandshakeDone> {
    while let Some(result) = results.next().await {
        match result {
            Ok(done) => return Some(done),
            Err(error) => tracing::debug!("Some handshake failed: {}", error),
        }
    }
    None
}

fn connect_attempt(
    candidate: TransitCandidate,
    role: TransitRole,
    secrets: Arc<TransitSecrets>,
    delay: Duration,
    connect_timeout: Duration,
) -> Attempt {
    Box::pin(async move {
        if !delay.is_zero() {
            async_io::Timer::after(delay).await;
        }
        util::timeout(connect_timeout, establish(candidate, role, secrets))
            .await
            .unwrap_or(Err(TransitHandshakeError::Timeout))
    })
}

async fn accept_attempt(
    socket: async_std::net::TcpStream,
    role: TransitRole,
    secrets: Arc<TransitSecrets>,
    connect_timeout: Duration,
) -> HandshakeResult {
    let handshake = async move {
        let (mut socket, info) = transport::wrap_tcp_connection(socket, CandidateKind::Direct)?;
        tracing::debug!("Accepted connection from {}", info.peer_addr);
        let verdict = secrets.handshake(&mut socket, role).await?;
        Ok::<_, TransitHandshakeError>((socket, info, verdict))
    };
    util::timeout(connect_timeout, handshake)
        .await
        .unwrap_or(Err(TransitHandshakeError::Timeout))
}

async fn establish(
    candidate: TransitCandidate,
    role: TransitRole,
    secrets: Arc<TransitSecrets>,
) -> HandshakeResult {
    let (mut socket, info): TransitConnection = transport::connect_tcp(&candidate).await?;
    if candidate.kind == CandidateKind::Relay {
        tracing::trace!("Initiating relay handshake");
        let tside = util::random_hex(8);
        socket.write_all(secrets.relay_line(&tside).as_bytes()).await?;
        ensure!(
            socket.read_line(64).await? == "ok\n",
            TransitHandshakeError::RelayHandshakeFailed
        );
    }
    let verdict = secrets.handshake(&mut socket, role).await?;
    Ok((socket, info, verdict))
}

/**
 * An established Transit connection.
 *
 * While you can manually send and receive bytes over the TCP stream, this is not recommended as the transit protocol
 * also specifies an encrypted record pipe that does all the hard work for you. See the provided methods.
 */
pub struct Transit {
    /** Raw transit connection */
    socket: Box<dyn TransitTransport>,
    tx: RecordSealer,
    rx: RecordOpener,
    info: TransitInfo,
    record_timeout: Duration,
}

impl std::fmt::Debug for Transit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transit")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl Transit {
    pub fn info(&self) -> &TransitInfo {
        &self.info
    }

    /** Receive and decrypt one record from the other side. */
    pub async fn receive_record(&mut self) -> Result<Box<[u8]>, RecordError> {
        util::timeout(self.record_timeout, self.rx.open(&mut self.socket))
            .await
            .map_err(|_| RecordError::Timeout)?
    }

    /** Send an encrypted record to the other side */
    pub async fn send_record(&mut self, plaintext: &[u8]) -> Result<(), RecordError> {
        util::timeout(self.record_timeout, self.tx.seal(&mut self.socket, plaintext))
            .await
            .map_err(|_| RecordError::Timeout)?
    }

    pub async fn flush(&mut self) -> Result<(), RecordError> {
        util::timeout(self.record_timeout, self.socket.flush())
            .await
            .map_err(|_| RecordError::Timeout)?
            .map_err(Into::into)
    }

    /** Flush and close the connection */
    pub async fn close(mut self) -> Result<(), RecordError> {
        self.flush().await?;
        self.socket.close().await.map_err(Into::into)
    }
}
