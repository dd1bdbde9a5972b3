//! Messages between the client and the mailbox server
//!
//! Each message is a JSON object with a `type` field. The client adds an `id` to everything it
//! sends; the server echoes it in the corresponding `ack`.

use super::{AppID, Mailbox, Mood, MySide, Nameplate, Phase};
use serde_derive::{Deserialize, Serialize};

// Client sends only these
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(tag = "type")]
pub enum OutboundMessage {
    Bind {
        appid: AppID,
        side: MySide,
    },
    Allocate,
    Claim {
        nameplate: String,
    },
    Release {
        nameplate: String,
    },
    Open {
        mailbox: Mailbox,
    },
    Add {
        phase: Phase,
        #[serde(with = "hex::serde")]
        body: Vec<u8>,
    },
    Close {
        mailbox: Mailbox,
        mood: Mood,
    },
    Ping {
        ping: u64,
    },
}

impl OutboundMessage {
    pub fn bind(appid: AppID, side: MySide) -> Self {
        OutboundMessage::Bind { appid, side }
    }

    pub fn claim(nameplate: Nameplate) -> Self {
        OutboundMessage::Claim {
            nameplate: nameplate.to_string(),
        }
    }

    pub fn release(nameplate: Nameplate) -> Self {
        OutboundMessage::Release {
            nameplate: nameplate.to_string(),
        }
    }

    pub fn open(mailbox: Mailbox) -> Self {
        OutboundMessage::Open { mailbox }
    }

    pub fn add(phase: Phase, body: Vec<u8>) -> Self {
        OutboundMessage::Add { phase, body }
    }

    pub fn close(mailbox: Mailbox, mood: Mood) -> Self {
        OutboundMessage::Close { mailbox, mood }
    }

    /// Short name for logging, without the (possibly large) payload
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Bind { .. } => "bind",
            OutboundMessage::Allocate => "allocate",
            OutboundMessage::Claim { .. } => "claim",
            OutboundMessage::Release { .. } => "release",
            OutboundMessage::Open { .. } => "open",
            OutboundMessage::Add { .. } => "add",
            OutboundMessage::Close { .. } => "close",
            OutboundMessage::Ping { .. } => "ping",
        }
    }
}

/// An [`OutboundMessage`] as it goes over the wire
#[derive(Serialize, Debug)]
pub struct Envelope<'a> {
    #[serde(flatten)]
    pub message: &'a OutboundMessage,
    pub id: &'a str,
}

/// The `welcome` object. Anything but `motd` and `error` is ignored.
#[derive(Deserialize, Serialize, Debug, PartialEq, Clone, Default)]
pub struct WelcomeMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// Server sends only these
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(tag = "type")]
pub enum InboundMessage {
    Welcome {
        #[serde(default)]
        welcome: WelcomeMessage,
    },
    Allocated {
        nameplate: String,
    },
    Claimed {
        mailbox: Mailbox,
    },
    Released,
    Message(EncryptedMessage),
    Closed,
    Ack {
        #[serde(default)]
        id: Option<String>,
    },
    Pong {
        pong: u64,
    },
    Error {
        error: String,
        #[serde(default)]
        orig: Option<serde_json::Value>,
    },
    #[serde(other)]
    Unknown,
}

impl InboundMessage {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::Welcome { .. } => "welcome",
            InboundMessage::Allocated { .. } => "allocated",
            InboundMessage::Claimed { .. } => "claimed",
            InboundMessage::Released => "released",
            InboundMessage::Message(_) => "message",
            InboundMessage::Closed => "closed",
            InboundMessage::Ack { .. } => "ack",
            InboundMessage::Pong { .. } => "pong",
            InboundMessage::Error { .. } => "error",
            InboundMessage::Unknown => "unknown",
        }
    }
}

/// A message in the mailbox, as relayed by the server. The body is still encrypted
/// (except for the `pake` phase).
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct EncryptedMessage {
    pub side: String,
    pub phase: Phase,
    #[serde(with = "hex::serde")]
    pub body: Vec<u8>,
}
