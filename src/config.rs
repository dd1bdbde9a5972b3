//! Options the embedding application may set
//!
//! A [`WormholeConfig`] is passed into every session explicitly. It only enumerates servers,
//! timeouts and sizes; none of the options change the protocol itself.

use serde_derive::{Deserialize, Serialize};
use std::time::Duration;

use crate::{core::AppID, transit::Abilities};

/// The App ID of this protocol. Only clients using the same App ID can find each other.
///
/// Key confirmation and the digest record make this incompatible with plain `text-or-file-xfer`
/// clients, so it lives in a namespace of its own.
pub const APPID: &str = "lothar.com/wormhole/wormhole-engine/file-xfer-v1";

/// URL of the public mailbox server. Please don't abuse or DOS.
pub const DEFAULT_MAILBOX_SERVER: &str = "ws://relay.magic-wormhole.io:4000/v1";

/// URL of the public transit relay server. Please don't abuse or DOS.
pub const DEFAULT_RELAY_SERVER: &str = "tcp://transit.magic-wormhole.io:4001";

/// Smallest accepted transit chunk size
pub const MIN_CHUNK_SIZE: usize = 1024;
/// Largest accepted transit chunk size
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WormholeConfig {
    pub app_id: AppID,
    /// `tcp://host:port` for JSON lines, `ws://` or `wss://` for websockets
    pub rendezvous_url: String,
    /// `tcp://host:port` of the transit relay
    pub relay_url: String,
    /// Number of words in a generated code
    pub code_words: usize,
    /// Bound on every single transit connection attempt
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    /// Bound on replies from the mailbox server (welcome, allocated, claimed, …)
    #[serde(with = "duration_secs")]
    pub server_timeout: Duration,
    /// Bound on waiting for the peer to show up or to answer
    #[serde(with = "duration_secs")]
    pub peer_timeout: Duration,
    /// Time to wait for the `ack` of an `add` before retransmitting it
    #[serde(with = "duration_secs")]
    pub ack_timeout: Duration,
    pub max_retransmits: u32,
    /// Bound on reading or writing a single transit record
    #[serde(with = "duration_secs")]
    pub record_timeout: Duration,
    /// Plaintext bytes per transit record
    pub chunk_size: usize,
    pub abilities: Abilities,
}

impl Default for WormholeConfig {
    fn default() -> Self {
        Self {
            app_id: AppID::new(APPID),
            rendezvous_url: DEFAULT_MAILBOX_SERVER.into(),
            relay_url: DEFAULT_RELAY_SERVER.into(),
            code_words: 2,
            connect_timeout: Duration::from_secs(10),
            server_timeout: Duration::from_secs(10),
            peer_timeout: Duration::from_secs(600),
            ack_timeout: Duration::from_secs(5),
            max_retransmits: 3,
            record_timeout: Duration::from_secs(120),
            chunk_size: 64 * 1024,
            abilities: Abilities::ALL_ABILITIES,
        }
    }
}

impl WormholeConfig {
    pub fn app_id(mut self, app_id: impl Into<AppID>) -> Self {
        self.app_id = app_id.into();
        self
    }

    pub fn rendezvous_url(mut self, url: impl Into<String>) -> Self {
        self.rendezvous_url = url.into();
        self
    }

    pub fn relay_url(mut self, url: impl Into<String>) -> Self {
        self.relay_url = url.into();
        self
    }

    pub fn code_words(mut self, words: usize) -> Self {
        self.code_words = words;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn server_timeout(mut self, timeout: Duration) -> Self {
        self.server_timeout = timeout;
        self
    }

    pub fn peer_timeout(mut self, timeout: Duration) -> Self {
        self.peer_timeout = timeout;
        self
    }

    pub fn ack_timeout(mut self, timeout: Duration, max_retransmits: u32) -> Self {
        self.ack_timeout = timeout;
        self.max_retransmits = max_retransmits;
        self
    }

    pub fn record_timeout(mut self, timeout: Duration) -> Self {
        self.record_timeout = timeout;
        self
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn abilities(mut self, abilities: Abilities) -> Self {
        self.abilities = abilities;
        self
    }

    /// The chunk size actually used, clamped into [`MIN_CHUNK_SIZE`]`..=`[`MAX_CHUNK_SIZE`]
    pub fn effective_chunk_size(&self) -> usize {
        self.chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
    }

    /// Codes have at least two words
    pub fn effective_code_words(&self) -> usize {
        self.code_words.max(2)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
