//! Transit handshake lines and the encrypted record pipe
//!
//! Everything here is derived from the transit key. The handshake (leader perspective):
//! ```text
//! -> transit sender <hex(derive(key, "transit_sender"))> ready\n\n
//! <- transit receiver <hex(derive(key, "transit_receiver"))> ready\n\n
//! -> go\n            (or nevermind\n on connections the leader does not want)
//! ```
//! After that each direction is a sequence of `[u32 BE length][24 byte nonce][secretbox]` records.

use super::{RecordError, TransitKey, TransitRole, TransitRxKey, TransitTxKey, transport::TransitTransport};
use crate::{GenericKey, Key};
use crypto_secretbox::{self as secretbox, aead::Aead};
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the record nonce, which is a big-endian counter
pub const NONCE_SIZE: usize = 24;
/// Poly1305 tag appended by secretbox
const TAG_SIZE: usize = 16;
/// Records claiming to be longer than this are rejected before reading them
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

/// Why a single connection attempt did not work out. Never leaves the module tree:
/// only one attempt needs to succeed.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub(super) enum TransitHandshakeError {
    #[error("Peer sent an unexpected handshake")]
    HandshakeFailed,
    #[error("Relay did not pair us with the peer")]
    RelayHandshakeFailed,
    #[error("The leader chose another connection")]
    Nevermind,
    #[error("Handshake timed out")]
    Timeout,
    #[error("IO error during the handshake")]
    IO(
        #[from]
        #[source]
        std::io::Error,
    ),
}

/// The transit key of one session. Shared by all connection attempts.
pub(super) struct TransitSecrets {
    key: Key<TransitKey>,
}

impl TransitSecrets {
    pub fn new(key: Key<TransitKey>) -> Self {
        TransitSecrets { key }
    }

    fn hex_subkey(&self, purpose: &str) -> String {
        self.key.derive_subkey_from_purpose::<GenericKey>(purpose).to_hex()
    }

    /// The `ready` line sent by `role`
    fn ready_line(&self, role: TransitRole) -> String {
        match role {
            TransitRole::Leader => format!("transit sender {} ready\n\n", self.hex_subkey("transit_sender")),
            TransitRole::Follower => {
                format!("transit receiver {} ready\n\n", self.hex_subkey("transit_receiver"))
            },
        }
    }

    /// Asks a relay server to pair us with the peer holding the same token
    pub fn relay_line(&self, tside: &str) -> String {
        format!(
            "please relay {} for side {}\n",
            self.hex_subkey("transit_relay_token"),
            tside
        )
    }

    /// Record keys for our direction and theirs. The leader sends with the "sender" key.
    fn record_keys(&self, role: TransitRole) -> (Key<TransitTxKey>, Key<TransitRxKey>) {
        let (ours, theirs) = match role {
            TransitRole::Leader => ("transit_record_sender_key", "transit_record_receiver_key"),
            TransitRole::Follower => ("transit_record_receiver_key", "transit_record_sender_key"),
        };
        (
            self.key.derive_subkey_from_purpose(ours),
            self.key.derive_subkey_from_purpose(theirs),
        )
    }

    /// Trade `ready` lines with the peer
    ///
    /// A follower also waits for the leader's `go`. A leader still has to [`Verdict::commit`]
    /// the connection it picks.
    pub async fn handshake(
        &self,
        socket: &mut Box<dyn TransitTransport>,
        role: TransitRole,
    ) -> Result<Verdict, TransitHandshakeError> {
        let peer_role = match role {
            TransitRole::Leader => TransitRole::Follower,
            TransitRole::Follower => TransitRole::Leader,
        };
        socket.write_all(self.ready_line(role).as_bytes()).await?;
        socket.read_expect(self.ready_line(peer_role).as_bytes()).await?;

        if role == TransitRole::Follower {
            match socket.read_line(16).await?.as_str() {
                "go\n" => {},
                "nevermind\n" => bail!(TransitHandshakeError::Nevermind),
                _ => bail!(TransitHandshakeError::HandshakeFailed),
            }
        }

        let (tx_key, rx_key) = self.record_keys(role);
        Ok(Verdict {
            role,
            sealer: RecordSealer::new(tx_key),
            opener: RecordOpener::new(rx_key),
        })
    }
}

/// A connection that passed the handshake and waits to be chosen
pub(super) struct Verdict {
    role: TransitRole,
    sealer: RecordSealer,
    opener: RecordOpener,
}

impl Verdict {
    /// Use this connection. The leader announces it with `go`.
    pub async fn commit(
        self,
        socket: &mut Box<dyn TransitTransport>,
    ) -> Result<(RecordSealer, RecordOpener), TransitHandshakeError> {
        if self.role == TransitRole::Leader {
            socket.write_all(b"go\n").await?;
            socket.flush().await?;
        }
        Ok((self.sealer, self.opener))
    }
}

/// The sequence number in a nonce. Nobody sends 2^64 records.
fn sequence_number(nonce: &[u8]) -> u64 {
    let mut counter = [0u8; 8];
    counter.copy_from_slice(&nonce[NONCE_SIZE - 8..NONCE_SIZE]);
    u64::from_be_bytes(counter)
}

/// Our direction of the record pipe
pub(super) struct RecordSealer {
    key: Key<TransitTxKey>,
    next_nonce: [u8; NONCE_SIZE],
}

impl RecordSealer {
    fn new(key: Key<TransitTxKey>) -> Self {
        RecordSealer {
            key,
            next_nonce: [0; NONCE_SIZE],
        }
    }

    pub async fn seal(
        &mut self,
        socket: &mut (impl AsyncWrite + Unpin + ?Sized),
        plaintext: &[u8],
    ) -> Result<(), RecordError> {
        let ciphertext = self
            .key
            .cipher()
            .encrypt(secretbox::Nonce::from_slice(&self.next_nonce), plaintext)
            .map_err(|_| RecordError::Crypto)?;

        let length = NONCE_SIZE + ciphertext.len();
        ensure!(length <= MAX_RECORD_SIZE, RecordError::TooLarge(length));

        let mut record = Vec::with_capacity(4 + length);
        record.extend_from_slice(&(length as u32).to_be_bytes());
        record.extend_from_slice(&self.next_nonce);
        record.extend_from_slice(&ciphertext);
        socket.write_all(&record).await?;

        crate::util::sodium_increment_be(&mut self.next_nonce);
        Ok(())
    }
}

/// The peer's direction of the record pipe. Only accepts records in exact sequence.
pub(super) struct RecordOpener {
    key: Key<TransitRxKey>,
    expected_nonce: [u8; NONCE_SIZE],
}

impl RecordOpener {
    fn new(key: Key<TransitRxKey>) -> Self {
        RecordOpener {
            key,
            expected_nonce: [0; NONCE_SIZE],
        }
    }

    pub async fn open(
        &mut self,
        socket: &mut (impl AsyncRead + Unpin + ?Sized),
    ) -> Result<Box<[u8]>, RecordError> {
        let mut length = [0u8; 4];
        socket.read_exact(&mut length).await?;
        let length = u32::from_be_bytes(length) as usize;
        ensure!(length <= MAX_RECORD_SIZE, RecordError::TooLarge(length));
        ensure!(length >= NONCE_SIZE + TAG_SIZE, RecordError::Crypto);

        let mut record = vec![0u8; length];
        socket.read_exact(&mut record).await?;

        let (nonce, ciphertext) = record.split_at(NONCE_SIZE);
        ensure!(
            nonce == self.expected_nonce,
            RecordError::Sequence {
                expected: sequence_number(&self.expected_nonce),
                got: sequence_number(nonce),
            }
        );
        crate::util::sodium_increment_be(&mut self.expected_nonce);

        self.key
            .cipher()
            .decrypt(secretbox::Nonce::from_slice(nonce), ciphertext)
            .map(Vec::into_boxed_slice)
            .map_err(|_| RecordError::Crypto)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn pipe() -> (RecordSealer, RecordOpener) {
        let secrets = TransitSecrets::new(Key::new([3; 32]));
        let (leader_tx, _) = secrets.record_keys(TransitRole::Leader);
        let (_, follower_rx) = secrets.record_keys(TransitRole::Follower);
        (RecordSealer::new(leader_tx), RecordOpener::new(follower_rx))
    }

    async fn records(sealer: &mut RecordSealer, messages: &[&str]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        for message in messages {
            let mut record = Vec::new();
            sealer.seal(&mut record, message.as_bytes()).await.unwrap();
            out.push(record);
        }
        out
    }

    #[test]
    fn test_lines() {
        let secrets = TransitSecrets::new(Key::new([3; 32]));
        let leader = secrets.ready_line(TransitRole::Leader);
        let follower = secrets.ready_line(TransitRole::Follower);
        assert!(leader.starts_with("transit sender ") && leader.ends_with(" ready\n\n"));
        assert!(follower.starts_with("transit receiver ") && follower.ends_with(" ready\n\n"));
        /* 32 bytes of hex in the middle */
        assert_eq!(leader.len(), "transit sender ".len() + 64 + " ready\n\n".len());
        assert_ne!(leader[15..79], follower[17..81]);

        let relay = secrets.relay_line("0123456789abcdef");
        assert!(relay.starts_with("please relay "));
        assert!(relay.ends_with(" for side 0123456789abcdef\n"));
    }

    #[async_std::test]
    async fn test_record_framing() {
        let (mut sealer, mut opener) = pipe();
        let records = records(&mut sealer, &["hello", "world"]).await;

        let first = &records[0];
        assert_eq!(
            u32::from_be_bytes(first[..4].try_into().unwrap()) as usize,
            first.len() - 4
        );
        assert_eq!(first.len(), 4 + NONCE_SIZE + TAG_SIZE + 5);
        assert_eq!(&first[4..4 + NONCE_SIZE], &[0u8; NONCE_SIZE]);
        assert_eq!(sequence_number(&records[1][4..4 + NONCE_SIZE]), 1);

        let mut reader = futures::io::Cursor::new(records.concat());
        assert_eq!(&*opener.open(&mut reader).await.unwrap(), b"hello");
        assert_eq!(&*opener.open(&mut reader).await.unwrap(), b"world");
        assert!(matches!(opener.open(&mut reader).await, Err(RecordError::Io(_))));
    }

    #[async_std::test]
    async fn test_record_out_of_order() {
        let (mut sealer, mut opener) = pipe();
        let records = records(&mut sealer, &["zero", "one", "two"]).await;

        /* A gap */
        let mut reader = futures::io::Cursor::new(records[1].clone());
        assert!(matches!(
            opener.open(&mut reader).await,
            Err(RecordError::Sequence {
                expected: 0,
                got: 1
            })
        ));

        /* A replay */
        let (_, mut opener) = pipe();
        let mut reader = futures::io::Cursor::new([records[0].clone(), records[0].clone()].concat());
        opener.open(&mut reader).await.unwrap();
        assert!(matches!(
            opener.open(&mut reader).await,
            Err(RecordError::Sequence {
                expected: 1,
                got: 0
            })
        ));
    }

    #[async_std::test]
    async fn test_record_tampered() {
        let (mut sealer, mut opener) = pipe();
        let mut record = records(&mut sealer, &["some file content"]).await.remove(0);
        let last = record.len() - 1;
        record[last] ^= 0x01;
        let mut reader = futures::io::Cursor::new(record);
        assert!(matches!(opener.open(&mut reader).await, Err(RecordError::Crypto)));
    }

    #[async_std::test]
    async fn test_wrong_direction() {
        /* Our own records do not open with the key for the peer's direction */
        let secrets = TransitSecrets::new(Key::new([3; 32]));
        let (leader_tx, leader_rx) = secrets.record_keys(TransitRole::Leader);
        let mut sealer = RecordSealer::new(leader_tx);
        let mut opener = RecordOpener::new(leader_rx);
        let record = records(&mut sealer, &["loopback"]).await.remove(0);
        let mut reader = futures::io::Cursor::new(record);
        assert!(matches!(opener.open(&mut reader).await, Err(RecordError::Crypto)));
    }

    #[async_std::test]
    async fn test_record_too_large() {
        let (_, mut opener) = pipe();
        let mut reader = futures::io::Cursor::new((MAX_RECORD_SIZE as u32 + 1).to_be_bytes().to_vec());
        assert!(matches!(
            opener.open(&mut reader).await,
            Err(RecordError::TooLarge(_))
        ));

        let mut reader = futures::io::Cursor::new(vec![0, 0, 0, 10, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert!(matches!(opener.open(&mut reader).await, Err(RecordError::Crypto)));
    }
}
