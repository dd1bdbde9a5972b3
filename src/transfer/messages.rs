//! JSON messages the two peers exchange over the Wormhole, plus the two
//! JSON records at the end of a transit stream

use super::FileOffer;
use crate::transit::{Abilities, CandidateKind, TransitCandidate};
use serde_derive::{Deserialize, Serialize};

/// What the receiver sends when the user declines the offer
pub const REJECTED: &str = "transfer rejected";
/// What either side sends when the user cancels
pub const CANCELLED: &str = "transfer cancelled";

/**
 * One message to the peer. Exactly one top-level key says which.
 */
#[derive(Deserialize, Serialize, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum PeerMessage {
    Offer(OfferType),
    Answer(AnswerType),
    /** Tell the other side you got an error */
    Error(String),
    /** Used to set up a transit channel */
    Transit(TransitType),
    #[serde(other)]
    Unknown,
}

impl PeerMessage {
    pub fn offer_file(offer: &FileOffer) -> Self {
        PeerMessage::Offer(OfferType::File {
            filename: offer.filename.clone(),
            filesize: offer.size,
            kind: offer.kind.clone(),
        })
    }

    pub fn file_ack() -> Self {
        PeerMessage::Answer(AnswerType::FileAck("ok".into()))
    }

    pub fn error(message: impl Into<String>) -> Self {
        PeerMessage::Error(message.into())
    }

    pub fn transit(abilities: &Abilities, candidates: &[TransitCandidate]) -> Self {
        PeerMessage::Transit(TransitType::new(abilities, candidates))
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum OfferType {
    File {
        filename: String,
        filesize: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AnswerType {
    FileAck(String),
}

/// The last record of the sender: the digest of everything it sent
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct TransitDigest {
    pub sha256: String,
}

/// The receiver's answer to [`TransitDigest`]
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct TransitAck {
    pub ack: String,
    pub sha256: String,
}

impl TransitAck {
    pub fn ok(sha256: impl Into<String>) -> Self {
        TransitAck {
            ack: "ok".into(),
            sha256: sha256.into(),
        }
    }
}

/**
 * Our abilities and where we can be reached, sent before the offer or answer
 */
#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct TransitType {
    pub abilities_v1: Vec<Ability>,
    pub hints_v1: Vec<Hint>,
}

impl TransitType {
    pub fn new(abilities: &Abilities, candidates: &[TransitCandidate]) -> Self {
        let mut abilities_v1 = Vec::new();
        if abilities.can_direct() {
            abilities_v1.push(Ability::DirectTcpV1);
        }
        if abilities.can_relay() {
            abilities_v1.push(Ability::RelayV1);
        }

        let mut hints_v1: Vec<Hint> = candidates
            .iter()
            .filter(|candidate| candidate.kind == CandidateKind::Direct)
            .map(|candidate| Hint::DirectTcpV1(DirectHint::from(candidate)))
            .collect();
        /* All relays go into a single relay-v1 entry */
        let relays: Vec<DirectHint> = candidates
            .iter()
            .filter(|candidate| candidate.kind == CandidateKind::Relay)
            .map(DirectHint::from)
            .collect();
        if !relays.is_empty() {
            hints_v1.push(Hint::RelayV1(RelayHint { hints: relays }));
        }

        TransitType {
            abilities_v1,
            hints_v1,
        }
    }

    pub fn abilities(&self) -> Abilities {
        Abilities {
            direct_tcp_v1: self.abilities_v1.contains(&Ability::DirectTcpV1),
            relay_v1: self.abilities_v1.contains(&Ability::RelayV1),
        }
    }

    /// The peer's candidates. Unknown hint types are skipped.
    pub fn candidates(&self) -> Vec<TransitCandidate> {
        let mut candidates = Vec::new();
        for hint in &self.hints_v1 {
            match hint {
                Hint::DirectTcpV1(hint) => candidates.push(hint.to_candidate(CandidateKind::Direct)),
                Hint::RelayV1(RelayHint { hints }) => candidates.extend(
                    hints
                        .iter()
                        .map(|hint| hint.to_candidate(CandidateKind::Relay)),
                ),
                Hint::Other => tracing::debug!("Ignoring unknown transit hint"),
            }
        }
        candidates
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum Ability {
    DirectTcpV1,
    RelayV1,
    #[serde(other)]
    Other,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum Hint {
    DirectTcpV1(DirectHint),
    /// Wraps a list of host/port entries, one per relay server
    RelayV1(RelayHint),
    #[serde(other)]
    Other,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct DirectHint {
    pub hostname: String,
    pub port: u16,
    #[serde(default)]
    pub priority: f64,
}

impl DirectHint {
    fn to_candidate(&self, kind: CandidateKind) -> TransitCandidate {
        TransitCandidate {
            host: self.hostname.clone(),
            port: self.port,
            kind,
            priority: self.priority.round() as i32,
        }
    }
}

impl From<&TransitCandidate> for DirectHint {
    fn from(candidate: &TransitCandidate) -> Self {
        DirectHint {
            hostname: candidate.host.clone(),
            port: candidate.port,
            priority: candidate.priority as f64,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct RelayHint {
    pub hints: Vec<DirectHint>,
}
