//! The error type surfaced in terminal events
//!
//! Every layer has its own error enum. [`Error`] wraps them so that the application gets one type,
//! and [`Error::kind`] sorts it into the handful of categories a UI actually distinguishes.

use crate::{
    core::{CodeFormatError, KeyExchangeError, RendezvousError, WormholeError},
    transfer::TransferError,
    transit::{RecordError, TransitError},
};

/// What went wrong, coarsely. One UI message per variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
pub enum FailureKind {
    /// The code is wrong, has expired, or someone tampered with the key exchange
    #[display("wrong code / code expired")]
    WrongCode,
    /// No connection to the mailbox server, the peer or the relay
    #[display("connection failed")]
    ConnectionFailed,
    /// The receiver declined the offer
    #[display("offer rejected")]
    Rejected,
    /// The connection broke down while the transfer was running
    #[display("transfer interrupted")]
    TransferInterrupted,
    /// Integrity check failed. The received data must not be used.
    #[display("file corrupted in transit")]
    FileCorrupted,
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Code(#[from] CodeFormatError),
    #[error(transparent)]
    Rendezvous(#[from] RendezvousError),
    #[error(transparent)]
    KeyExchange(#[from] KeyExchangeError),
    #[error(transparent)]
    Transit(#[from] TransitError),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

impl From<WormholeError> for Error {
    fn from(error: WormholeError) -> Self {
        Self::Transfer(TransferError::Wormhole(error))
    }
}

impl Error {
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::Code(_) => FailureKind::WrongCode,
            Error::Rendezvous(error) => rendezvous_kind(error),
            Error::KeyExchange(error) => key_exchange_kind(error),
            Error::Transit(_) => FailureKind::ConnectionFailed,
            Error::Record(error) => record_kind(error),
            Error::Transfer(error) => transfer_kind(error),
        }
    }

    /// Human readable message including all nested causes
    pub fn describe(&self) -> String {
        let mut message = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(error) = source {
            let text = error.to_string();
            if !message.contains(&text) {
                message.push_str(": ");
                message.push_str(&text);
            }
            source = error.source();
        }
        message
    }
}

fn rendezvous_kind(error: &RendezvousError) -> FailureKind {
    match error {
        RendezvousError::Crypto { .. } => FailureKind::WrongCode,
        _ => FailureKind::ConnectionFailed,
    }
}

fn key_exchange_kind(error: &KeyExchangeError) -> FailureKind {
    match error {
        KeyExchangeError::IncompatiblePeer => FailureKind::ConnectionFailed,
        _ => FailureKind::WrongCode,
    }
}

fn record_kind(error: &RecordError) -> FailureKind {
    match error {
        RecordError::Crypto | RecordError::Sequence { .. } | RecordError::TooLarge(_) => {
            FailureKind::FileCorrupted
        },
        RecordError::Io(_) | RecordError::Timeout => FailureKind::TransferInterrupted,
    }
}

fn wormhole_kind(error: &WormholeError) -> FailureKind {
    match error {
        WormholeError::Rendezvous(error) => rendezvous_kind(error),
        WormholeError::KeyExchange(error) => key_exchange_kind(error),
        WormholeError::PeerTimeout => FailureKind::WrongCode,
        _ => FailureKind::ConnectionFailed,
    }
}

fn transfer_kind(error: &TransferError) -> FailureKind {
    match error {
        TransferError::Rejected => FailureKind::Rejected,
        TransferError::Checksum | TransferError::FileSize => FailureKind::FileCorrupted,
        TransferError::Wormhole(error) => wormhole_kind(error),
        TransferError::Transit(_) => FailureKind::ConnectionFailed,
        TransferError::Record(error) => record_kind(error),
        _ => FailureKind::TransferInterrupted,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_kinds() {
        let error: Error = KeyExchangeError::WrongCode.into();
        assert_eq!(error.kind(), FailureKind::WrongCode);

        let error: Error = TransferError::Wormhole(KeyExchangeError::WrongCode.into()).into();
        assert_eq!(error.kind(), FailureKind::WrongCode);

        let error: Error = TransferError::Wormhole(KeyExchangeError::IncompatiblePeer.into()).into();
        assert_eq!(error.kind(), FailureKind::ConnectionFailed);

        let error: Error = TransitError::NoConnection.into();
        assert_eq!(error.kind(), FailureKind::ConnectionFailed);

        let error: Error = TransferError::Record(RecordError::Crypto).into();
        assert_eq!(error.kind(), FailureKind::FileCorrupted);

        let error: Error = RecordError::Sequence {
            expected: 1,
            got: 3,
        }
        .into();
        assert_eq!(error.kind(), FailureKind::FileCorrupted);

        let error: Error = TransferError::Rejected.into();
        assert_eq!(error.kind(), FailureKind::Rejected);

        let error: Error = TransferError::PeerError("disk full".into()).into();
        assert_eq!(error.kind(), FailureKind::TransferInterrupted);

        let error: Error = CodeFormatError::MissingWords.into();
        assert_eq!(error.kind(), FailureKind::WrongCode);
    }

    #[test]
    fn test_describe() {
        let error: Error = TransferError::PeerError("disk full".into()).into();
        assert_eq!(
            error.describe(),
            "Something went wrong on the other side: disk full"
        );
        assert_eq!(FailureKind::FileCorrupted.to_string(), "file corrupted in transit");
    }
}
