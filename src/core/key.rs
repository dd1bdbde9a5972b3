use crypto_secretbox::{self as secretbox, KeyInit, XSalsa20Poly1305, aead::Aead};
use hkdf::Hkdf;
use serde_derive::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use spake2::{Ed25519Group, Identity, Password, Spake2};
use std::marker::PhantomData;
use zeroize::{Zeroize, ZeroizeOnDrop};

const NONCE_SIZE: usize = 24;

use super::{AppID, Code, EitherSide, Phase};

/// Marker trait to give encryption keys a "purpose", to not confuse them
///
/// See [`GenericKey`], [`WormholeKey`] and the transit keys.
pub trait KeyPurpose: std::fmt::Debug {}

/// The type of main key of the Wormhole
#[derive(Debug)]
pub struct WormholeKey;
impl KeyPurpose for WormholeKey {}

/// A generic key purpose for ad-hoc subkeys or if you don't care.
#[derive(Debug)]
pub struct GenericKey;
impl KeyPurpose for GenericKey {}

/// A 32 byte secretbox key, tagged with what it may be used for
///
/// Zeroed when dropped. `Debug` does not print the key material.
pub struct Key<P: KeyPurpose> {
    bytes: [u8; 32],
    purpose: PhantomData<P>,
}

impl<P: KeyPurpose> Drop for Key<P> {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl<P: KeyPurpose> ZeroizeOnDrop for Key<P> {}

impl<P: KeyPurpose> Clone for Key<P> {
    fn clone(&self) -> Self {
        Key::new(self.bytes)
    }
}

impl<P: KeyPurpose> PartialEq for Key<P> {
    fn eq(&self, other: &Self) -> bool {
        constant_time_eq(&self.bytes, &other.bytes)
    }
}

impl<P: KeyPurpose> std::fmt::Debug for Key<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let purpose = std::any::type_name::<P>().rsplit("::").next().unwrap_or_default();
        write!(f, "Key<{}>(redacted)", purpose)
    }
}

impl<P: KeyPurpose> Key<P> {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self {
            bytes,
            purpose: PhantomData,
        }
    }

    /// Returns `None` unless `bytes` is exactly 32 bytes long
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 32]>::try_from(bytes).ok().map(Self::new)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /**
     * Derive a new sub-key from this one
     */
    pub fn derive_subkey_from_purpose<NewP: KeyPurpose>(&self, purpose: &str) -> Key<NewP> {
        let mut bytes = [0u8; 32];
        hkdf_expand(&self.bytes, purpose.as_bytes(), &mut bytes);
        Key::new(bytes)
    }

    pub(crate) fn cipher(&self) -> XSalsa20Poly1305 {
        XSalsa20Poly1305::new(secretbox::Key::from_slice(&self.bytes))
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum KeyExchangeError {
    #[error("Malformed key exchange message")]
    MalformedMessage,
    #[error("Key exchange message has the wrong length")]
    WrongLength,
    #[error("Key exchange message does not contain a valid curve point")]
    InvalidPoint,
    #[error("Key exchange resulted in a weak key")]
    WeakKey,
    #[error("Key confirmation failed. Either the code is wrong, or someone is tampering with the connection")]
    WrongCode,
    /// The peer's `version` decrypted fine but lacks the key confirmation
    #[error("The peer speaks an incompatible version of the protocol")]
    IncompatiblePeer,
    #[error("Corrupt key exchange message")]
    ProtocolJson(
        #[from]
        #[source]
        serde_json::Error,
    ),
    #[error("Corrupt key exchange message")]
    Hex(
        #[from]
        #[source]
        hex::FromHexError,
    ),
}

#[derive(Serialize, Deserialize, Debug)]
struct PakeMessage {
    pake_v1: String,
}

/// The contents of the encrypted `version` message
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct VersionMessage {
    #[serde(default)]
    pub app_versions: serde_json::Value,
    /// Hex encoded key confirmation, see [`Transcript::confirmation`]
    pub confirm: String,
}

impl VersionMessage {
    /// Parse the peer's decrypted `version`
    ///
    /// Decryption already proved that both sides derived the same key, so a missing `confirm`
    /// means the peer runs a different protocol, not that the code is wrong.
    pub fn parse(body: &[u8]) -> Result<Self, KeyExchangeError> {
        let value: serde_json::Value =
            serde_json::from_slice(body).map_err(|_| KeyExchangeError::MalformedMessage)?;
        ensure!(value.is_object(), KeyExchangeError::MalformedMessage);
        ensure!(
            value.get("confirm").is_some(),
            KeyExchangeError::IncompatiblePeer
        );
        serde_json::from_value(value).map_err(|_| KeyExchangeError::MalformedMessage)
    }
}

/// One side of a running SPAKE2 exchange
pub struct KeyExchange {
    spake: Spake2<Ed25519Group>,
    outbound: Vec<u8>,
}

impl std::fmt::Debug for KeyExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyExchange").finish_non_exhaustive()
    }
}

/// Start the key exchange: the code is the password, the app id the identity
///
/// Returns the serialized `pake` message for the peer.
pub fn initiate(appid: &AppID, code: &Code) -> (Vec<u8>, KeyExchange) {
    let (spake, outbound) = Spake2::<Ed25519Group>::start_symmetric(
        &Password::new(code.to_string().as_bytes()),
        &Identity::new(appid.as_bytes()),
    );
    let message = serde_json::json!({ "pake_v1": hex::encode(&outbound) });
    (
        message.to_string().into_bytes(),
        KeyExchange { spake, outbound },
    )
}

impl KeyExchange {
    /// Finish the exchange with the peer's `pake` message
    ///
    /// The key is not trusted yet: both sides must prove knowledge of it with the
    /// [`Transcript::confirmation`] before anything else is sent.
    pub fn complete(
        self,
        inbound: &[u8],
    ) -> Result<(Key<WormholeKey>, Transcript), KeyExchangeError> {
        let inbound = extract_pake_msg(inbound)?;
        let bytes = self.spake.finish(&inbound).map_err(|error| match error {
            spake2::Error::WrongLength => KeyExchangeError::WrongLength,
            spake2::Error::CorruptMessage => KeyExchangeError::InvalidPoint,
            _ => KeyExchangeError::MalformedMessage,
        })?;
        let key = Key::<WormholeKey>::from_slice(&bytes).ok_or(KeyExchangeError::WrongLength)?;
        ensure!(key.bytes.iter().any(|&b| b != 0), KeyExchangeError::WeakKey);

        Ok((key, Transcript::new(&self.outbound, &inbound)))
    }
}

fn extract_pake_msg(body: &[u8]) -> Result<Vec<u8>, KeyExchangeError> {
    let message: PakeMessage = serde_json::from_slice(body)?;
    Ok(hex::decode(message.pake_v1)?)
}

/// Both pake messages, in an order both sides agree on
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transcript(Vec<u8>);

impl Transcript {
    fn new(a: &[u8], b: &[u8]) -> Self {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        let mut transcript = Vec::with_capacity(first.len() + second.len());
        transcript.extend_from_slice(first);
        transcript.extend_from_slice(second);
        Transcript(transcript)
    }

    /// The value with which `side` proves that it knows `key`
    pub fn confirmation(&self, key: &Key<WormholeKey>, side: &str) -> [u8; 32] {
        let mut purpose = b"wormhole:confirm:".to_vec();
        purpose.extend(sha256_digest(side.as_bytes()));
        purpose.extend(&self.0);
        let mut confirmation = [0u8; 32];
        hkdf_expand(key.as_bytes(), &purpose, &mut confirmation);
        confirmation
    }

    /// Check a confirmation received from `side`
    pub fn verify(
        &self,
        key: &Key<WormholeKey>,
        side: &EitherSide,
        confirm: &str,
    ) -> Result<(), KeyExchangeError> {
        let received = hex::decode(confirm).map_err(|_| KeyExchangeError::WrongCode)?;
        let expected = self.confirmation(key, side);
        ensure!(
            constant_time_eq(&expected, &received),
            KeyExchangeError::WrongCode
        );
        Ok(())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Build the encrypted `version` message for our side
pub fn build_version_msg(
    side: &str,
    key: &Key<WormholeKey>,
    transcript: &Transcript,
    app_versions: serde_json::Value,
) -> Vec<u8> {
    let message = VersionMessage {
        app_versions,
        confirm: hex::encode(transcript.confirmation(key, side)),
    };
    serde_json::to_vec(&message).expect("VersionMessage always serializes")
}

pub fn encrypt_data_with_nonce(
    key: &[u8; 32],
    plaintext: &[u8],
    nonce: &[u8; NONCE_SIZE],
) -> Vec<u8> {
    let cipher = XSalsa20Poly1305::new(secretbox::Key::from_slice(key));
    let ciphertext = cipher
        .encrypt(secretbox::Nonce::from_slice(nonce), plaintext)
        .expect("Secretbox encryption cannot fail for in-memory buffers");
    let mut nonce_and_ciphertext = Vec::with_capacity(nonce.len() + ciphertext.len());
    nonce_and_ciphertext.extend_from_slice(nonce);
    nonce_and_ciphertext.extend(ciphertext);
    nonce_and_ciphertext
}

/// Encrypt with a random nonce, which is prepended to the ciphertext
pub fn encrypt_data(key: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
    let nonce: [u8; NONCE_SIZE] = rand::random();
    encrypt_data_with_nonce(key, plaintext, &nonce)
}

/// Inverse of [`encrypt_data`]. `None` if the data is too short, tampered with or for another key.
pub fn decrypt_data(key: &[u8; 32], encrypted: &[u8]) -> Option<Vec<u8>> {
    if encrypted.len() < NONCE_SIZE {
        return None;
    }
    let (nonce, ciphertext) = encrypted.split_at(NONCE_SIZE);
    XSalsa20Poly1305::new(secretbox::Key::from_slice(key))
        .decrypt(secretbox::Nonce::from_slice(nonce), ciphertext)
        .ok()
}

fn sha256_digest(input: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::default();
    hasher.update(input);
    hasher.finalize().to_vec()
}

fn hkdf_expand(key: &[u8], purpose: &[u8], output: &mut [u8]) {
    Hkdf::<Sha256>::new(None, key)
        .expand(purpose, output)
        .expect("HKDF output is never longer than 32 bytes here");
}

pub fn derive_key(key: &[u8], purpose: &[u8], length: usize) -> Vec<u8> {
    let mut v = vec![0; length];
    hkdf_expand(key, purpose, &mut v);
    v
}

/// The key for the message of `side` in `phase`
pub fn derive_phase_key(side: &str, key: &Key<WormholeKey>, phase: &Phase) -> Key<GenericKey> {
    let mut purpose_vec: Vec<u8> = b"wormhole:phase:".to_vec();
    purpose_vec.extend(sha256_digest(side.as_bytes()));
    purpose_vec.extend(sha256_digest(phase.as_bytes()));

    let mut bytes = [0u8; 32];
    hkdf_expand(key.as_bytes(), &purpose_vec, &mut bytes);
    Key::new(bytes)
}

/// The verifier: both users may compare it out of band to rule out a man in the middle
pub fn derive_verifier(key: &Key<WormholeKey>) -> Key<GenericKey> {
    key.derive_subkey_from_purpose("wormhole:verifier")
}
