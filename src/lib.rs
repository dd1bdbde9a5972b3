//! The Magic Wormhole protocol engine behind a "send a file with a short code" app
//!
//! Two clients who share nothing but a short human-speakable code (like `7-crossover-clockwork`)
//! meet on a mailbox server, agree on a strong key with SPAKE2, exchange a file offer and then
//! stream the file over a direct or relayed TCP connection.
//!
//! The layers, from the bottom up:
//!
//! - [`core`]: the mailbox client (rendezvous), key exchange and code handling. Results in a
//!   [`Wormhole`] that can send and receive encrypted messages to and from the peer.
//! - [`transit`]: finds a data connection between the peers and turns it into an encrypted record pipe.
//! - [`transfer`]: the send/receive state machines. Use [`begin_send`] and [`begin_receive`], then
//!   consume the returned event stream.
//!
//! Everything is configured through an explicit [`WormholeConfig`].

#![forbid(unsafe_code)]

#[macro_use]
mod util;

pub mod config;
pub mod core;
pub mod error;
pub mod transfer;
pub mod transit;

pub use crate::{
    config::WormholeConfig,
    core::{
        AppID, Code, GenericKey, Key, KeyPurpose, MailboxClient, Mood, Nameplate, Wormhole,
        WormholeError, WormholeKey,
    },
    error::{Error, FailureKind},
    transfer::{
        EventStream, FileOffer, ReceiveHandle, SendFile, SendHandle, SessionState, TransferEvent,
        begin_receive, begin_send,
    },
};
pub use util::Cancelled;
