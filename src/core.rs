//! The control plane: mailbox server, key exchange and codes
//!
//! A [`MailboxClient`] talks to the mailbox server. Both peers meet in a mailbox found by the
//! nameplate of the [`Code`], run the SPAKE2 key exchange there and confirm the resulting key.
//! What comes out is a [`Wormhole`]: an encrypted, ordered message channel to the peer.

pub mod code;
pub mod key;
pub mod mailbox;
pub mod rendezvous;
pub mod server_messages;
pub mod wordlist;

use serde_derive::{Deserialize, Serialize};
use std::{borrow::Cow, collections::BTreeMap, time::Duration};

pub use self::{
    code::{Code, CodeFormatError},
    key::{GenericKey, Key, KeyExchangeError, KeyPurpose, WormholeKey},
    mailbox::{MailboxClient, MailboxMessage},
    rendezvous::RendezvousError,
};

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum WormholeError {
    #[error(transparent)]
    Rendezvous(#[from] RendezvousError),
    #[error(transparent)]
    KeyExchange(#[from] KeyExchangeError),
    #[error("The other side did not show up in time")]
    PeerTimeout,
    /// Some deserialization went wrong, we probably got some garbage
    #[error("Corrupt JSON message received")]
    ProtocolJson(
        #[from]
        #[source]
        serde_json::Error,
    ),
    /// A generic string message for "something went wrong", i.e.
    /// the peer sent some bullshit message order
    #[error("Protocol error: {}", _0)]
    Protocol(Box<str>),
}

impl WormholeError {
    /// The mood to close the mailbox with after this error
    pub fn mood(&self) -> Mood {
        match self {
            WormholeError::KeyExchange(KeyExchangeError::IncompatiblePeer) => Mood::Errory,
            WormholeError::KeyExchange(_) => Mood::Scared,
            WormholeError::Rendezvous(RendezvousError::Crypto { .. }) => Mood::Scared,
            WormholeError::PeerTimeout => Mood::Lonely,
            _ => Mood::Errory,
        }
    }
}

/// A key exchange between sending our `pake` message and confirming the key
///
/// Split in two so that the caller learns when the peer has shown up.
#[derive(Debug)]
pub struct Handshake {
    exchange: key::KeyExchange,
    peer_pake: Vec<u8>,
}

/// The outcome of a successful [`Handshake`]
pub struct EstablishedKey {
    key: Key<WormholeKey>,
    peer_version: serde_json::Value,
    /// Application messages that arrived together with the peer's `version`
    early: Vec<MailboxMessage>,
}

impl Handshake {
    /// Send our `pake` message and wait for the peer's
    pub async fn start(
        client: &mut MailboxClient,
        code: &Code,
        peer_timeout: Duration,
    ) -> Result<Self, WormholeError> {
        let (pake, exchange) = key::initiate(client.appid(), code);
        client.add_message(Phase::PAKE, &pake).await?;

        let peer_pake = crate::util::timeout(peer_timeout, Self::await_pake(client))
            .await
            .map_err(|_| WormholeError::PeerTimeout)??;

        tracing::debug!("Peer has joined the mailbox");
        Ok(Handshake {
            exchange,
            peer_pake,
        })
    }

    async fn await_pake(client: &mut MailboxClient) -> Result<Vec<u8>, WormholeError> {
        loop {
            let message = client.next_message().await?;
            if message.phase.is_pake() {
                return Ok(message.body);
            }
            tracing::warn!(
                "Received message of phase {} before the key exchange, ignoring",
                message.phase
            );
        }
    }

    /// Derive the key, then prove to each other that we both know it
    ///
    /// Our confirmation goes into the encrypted `version` message. A `version` message that does not
    /// decrypt or carries the wrong confirmation means the codes differ (or an attacker guessed).
    pub async fn finish(
        self,
        client: &mut MailboxClient,
        peer_timeout: Duration,
    ) -> Result<EstablishedKey, WormholeError> {
        let (key, transcript) = self.exchange.complete(&self.peer_pake)?;
        client.set_key(key.clone())?;

        let version =
            key::build_version_msg(client.side(), &key, &transcript, serde_json::json!({}));
        client.add_message(Phase::VERSION, &version).await?;

        crate::util::timeout(peer_timeout, Self::await_version(client, key, transcript))
            .await
            .map_err(|_| WormholeError::PeerTimeout)?
    }

    async fn await_version(
        client: &mut MailboxClient,
        key: Key<WormholeKey>,
        transcript: key::Transcript,
    ) -> Result<EstablishedKey, WormholeError> {
        let mut early = Vec::new();
        loop {
            let message = match client.next_message().await {
                Ok(message) => message,
                Err(RendezvousError::Crypto { phase }) if phase.is_version() => {
                    bail!(KeyExchangeError::WrongCode)
                },
                Err(error) => bail!(error),
            };
            if !message.phase.is_version() {
                early.push(message);
                continue;
            }

            let version = key::VersionMessage::parse(&message.body)?;
            transcript.verify(&key, &message.side, &version.confirm)?;
            tracing::debug!("Key confirmed by the peer");
            return Ok(EstablishedKey {
                key,
                peer_version: version.app_versions,
                early,
            });
        }
    }
}

/**
 * Establishing Wormhole connection
 *
 * You can send and receive arbitrary messages in form of byte slices over it, using [`Wormhole::send`] and [`Wormhole::receive`].
 * Everything else (including encryption) will be handled for you.
 *
 * To create a wormhole, use the mailbox connection created via [`MailboxClient::allocate`] or [`MailboxClient::claim`]
 * with the [`Wormhole::connect_to_peer`] method.
 * Typically, the sender side allocates a code and the receiver claims it.
 */
#[derive(Debug)]
pub struct Wormhole {
    client: MailboxClient,
    key: Key<WormholeKey>,
    peer_version: serde_json::Value,
    /// Next phase number we send
    phase: u64,
    /// Next phase number we hand out, and messages that arrived early
    next_inbound: u64,
    inbound: BTreeMap<u64, Vec<u8>>,
}

impl Wormhole {
    /// Run the whole key exchange over an opened mailbox
    pub async fn connect_to_peer(
        mut client: MailboxClient,
        code: &Code,
        peer_timeout: Duration,
    ) -> Result<Self, WormholeError> {
        let handshake = Handshake::start(&mut client, code, peer_timeout).await?;
        let established = handshake.finish(&mut client, peer_timeout).await?;
        Ok(Self::new(client, established))
    }

    pub fn new(client: MailboxClient, established: EstablishedKey) -> Self {
        let mut wormhole = Wormhole {
            client,
            key: established.key,
            peer_version: established.peer_version,
            phase: 0,
            next_inbound: 0,
            inbound: BTreeMap::new(),
        };
        for message in established.early {
            wormhole.buffer_inbound(message);
        }
        wormhole
    }

    fn buffer_inbound(&mut self, message: MailboxMessage) {
        match message.phase.to_num() {
            Some(num) if num >= self.next_inbound => {
                self.inbound.insert(num, message.body);
            },
            Some(num) => tracing::debug!("Dropping stale message of phase {}", num),
            None => tracing::warn!(
                "Received message of unknown phase '{}', ignoring",
                message.phase
            ),
        }
    }

    /** Send an encrypted message to peer */
    pub async fn send(&mut self, plaintext: &[u8]) -> Result<(), WormholeError> {
        let phase = Phase::numeric(self.phase);
        self.phase += 1;
        self.client.add_message(phase, plaintext).await?;
        Ok(())
    }

    /**
     * Serialize and send an encrypted message to peer
     *
     * This will serialize the message as `json` string, which is most commonly
     * used by upper layer protocols. The serialization may not fail
     */
    pub async fn send_json<T: serde::Serialize>(&mut self, message: &T) -> Result<(), WormholeError> {
        self.send(&serde_json::to_vec(message)?).await
    }

    /** Receive the next message from the peer, in the order it was sent */
    pub async fn receive(&mut self) -> Result<Vec<u8>, WormholeError> {
        loop {
            if let Some(body) = self.inbound.remove(&self.next_inbound) {
                self.next_inbound += 1;
                return Ok(body);
            }
            let message = self.client.next_message().await?;
            self.buffer_inbound(message);
        }
    }

    /** Receive an encrypted message from peer and deserialize it as JSON */
    pub async fn receive_json<T>(&mut self) -> Result<T, WormholeError>
    where
        T: for<'a> serde::Deserialize<'a>,
    {
        let body = self.receive().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    pub async fn close(&mut self, mood: Mood) -> Result<(), WormholeError> {
        tracing::debug!("Closing Wormhole…");
        self.client.close(mood).await.map_err(Into::into)
    }

    /**
     * The `AppID` this wormhole is bound to.
     * This determines the upper-layer protocol. Only wormholes with the same value can talk to each other.
     */
    pub fn appid(&self) -> &AppID {
        self.client.appid()
    }

    /**
     * The symmetric encryption key used by this connection.
     * Can be used to derive sub-keys for different purposes.
     */
    pub fn key(&self) -> &Key<WormholeKey> {
        &self.key
    }

    /// Compare this out of band with the peer's to rule out a man in the middle
    pub fn verifier(&self) -> Key<GenericKey> {
        key::derive_verifier(&self.key)
    }

    /// Application versions of the other side
    pub fn peer_version(&self) -> &serde_json::Value {
        &self.peer_version
    }

    pub fn our_side(&self) -> &MySide {
        self.client.side_id()
    }

    pub fn mailbox(&self) -> Option<&Mailbox> {
        self.client.mailbox()
    }
}

// the serialized forms of these variants are part of the wire protocol, so
// they must be spelled exactly as shown
#[derive(Debug, PartialEq, Eq, Copy, Clone, Deserialize, Serialize, derive_more::Display)]
pub enum Mood {
    #[serde(rename = "happy")]
    Happy,
    #[serde(rename = "lonely")]
    Lonely,
    #[serde(rename = "errory")]
    Errory,
    #[serde(rename = "scary")]
    Scared,
}

/**
 * Wormhole configuration corresponding to an uppler layer protocol
 *
 * There are multiple different protocols built on top of the core
 * Wormhole protocol. They are identified by a unique URI-like ID string
 * (`AppID`).
 */
#[derive(
    PartialEq, Eq, Clone, Debug, Deserialize, Serialize, derive_more::Display, derive_more::Deref,
)]
#[serde(transparent)]
#[deref(forward)]
pub struct AppID(String);

impl AppID {
    pub fn new(id: impl Into<String>) -> Self {
        AppID(id.into())
    }
}

impl From<&str> for AppID {
    fn from(id: &str) -> Self {
        AppID::new(id)
    }
}

impl From<String> for AppID {
    fn from(id: String) -> Self {
        AppID(id)
    }
}

/// Our random side id within a mailbox
#[derive(
    PartialEq, Eq, Clone, Debug, Deserialize, Serialize, derive_more::Display, derive_more::Deref,
)]
#[serde(transparent)]
#[deref(forward)]
pub struct MySide(EitherSide);

impl MySide {
    pub fn generate() -> MySide {
        MySide(EitherSide(crate::util::random_hex(5)))
    }

    // It's a minor type system feature abuse, it's okay
    #[cfg(test)]
    pub fn unchecked_from_string(s: impl Into<String>) -> MySide {
        MySide(EitherSide(s.into()))
    }
}

/// The side id of either us or the peer
#[derive(
    PartialEq,
    Eq,
    Clone,
    Debug,
    Deserialize,
    Serialize,
    Hash,
    derive_more::Display,
    derive_more::Deref,
)]
#[serde(transparent)]
#[deref(forward)]
pub struct EitherSide(pub String);

impl<S: Into<String>> From<S> for EitherSide {
    fn from(s: S) -> EitherSide {
        EitherSide(s.into())
    }
}

/// The label of a mailbox message: `pake`, `version`, then `0`, `1`, … for the application
#[derive(
    PartialEq,
    Eq,
    Clone,
    Debug,
    Deserialize,
    Serialize,
    Hash,
    derive_more::Display,
    derive_more::Deref,
)]
#[serde(transparent)]
#[deref(forward)]
pub struct Phase(pub Cow<'static, str>);

impl Phase {
    pub const VERSION: Self = Phase(Cow::Borrowed("version"));
    pub const PAKE: Self = Phase(Cow::Borrowed("pake"));

    pub fn numeric(phase: u64) -> Self {
        Phase(phase.to_string().into())
    }

    pub fn is_version(&self) -> bool {
        self == &Self::VERSION
    }

    pub fn is_pake(&self) -> bool {
        self == &Self::PAKE
    }

    pub fn to_num(&self) -> Option<u64> {
        self.0.parse().ok()
    }
}

impl From<&str> for Phase {
    fn from(phase: &str) -> Self {
        Phase(Cow::Owned(phase.to_string()))
    }
}

/// The id of a mailbox on the server
#[derive(
    PartialEq, Eq, Clone, Debug, Deserialize, Serialize, derive_more::Display, derive_more::Deref,
)]
#[serde(transparent)]
#[deref(forward)]
pub struct Mailbox(pub String);

impl From<&str> for Mailbox {
    fn from(mailbox: &str) -> Self {
        Mailbox(mailbox.to_string())
    }
}

/// The numeric part of a code, allocated by the mailbox server
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash, derive_more::Display)]
pub struct Nameplate(u32);

impl Nameplate {
    /// # Panics
    ///
    /// On a zero nameplate
    pub fn new(nameplate: u32) -> Self {
        assert!(nameplate > 0, "Nameplates are positive");
        Nameplate(nameplate)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}
