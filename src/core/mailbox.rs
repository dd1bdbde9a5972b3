use super::{
    AppID, EitherSide, Key, Mailbox, Mood, MySide, Nameplate, Phase, WormholeKey,
    key::{decrypt_data, derive_phase_key, encrypt_data},
    rendezvous::{RendezvousError, RendezvousServer},
    server_messages::EncryptedMessage,
};
use crate::config::WormholeConfig;
use futures::Stream;
use std::collections::{HashSet, VecDeque};

/// A decrypted message from the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxMessage {
    pub side: EitherSide,
    pub phase: Phase,
    pub body: Vec<u8>,
}

/// Lifecycle of one mailbox: nameplate, mailbox, message encryption
///
/// Messages are encrypted with a key per (side, phase) once [`MailboxClient::set_key`] was called.
/// The server echoes our own messages and replays the whole mailbox on reconnect, so both
/// echoes and repeated (side, phase) pairs are filtered out here.
#[derive(Debug)]
pub struct MailboxClient {
    server: RendezvousServer,
    appid: AppID,
    nameplate: Option<Nameplate>,
    mailbox: Option<Mailbox>,
    key: Option<Key<WormholeKey>>,
    processed: HashSet<(EitherSide, Phase)>,
    /// Encrypted messages that arrived before the key was known
    early: VecDeque<EncryptedMessage>,
}

impl MailboxClient {
    pub async fn connect(config: &WormholeConfig) -> Result<Self, RendezvousError> {
        let server = RendezvousServer::connect(config, MySide::generate()).await?;
        tracing::debug!("Connected to the mailbox server as side {}", server.side());
        Ok(MailboxClient {
            server,
            appid: config.app_id.clone(),
            nameplate: None,
            mailbox: None,
            key: None,
            processed: HashSet::new(),
            early: VecDeque::new(),
        })
    }

    pub fn appid(&self) -> &AppID {
        &self.appid
    }

    pub fn side(&self) -> &str {
        self.server.side()
    }

    pub fn side_id(&self) -> &MySide {
        self.server.side()
    }

    /// The server's message of the day, if any
    pub fn motd(&self) -> Option<&str> {
        self.server.welcome().motd.as_deref()
    }

    pub fn nameplate(&self) -> Option<Nameplate> {
        self.nameplate
    }

    pub fn mailbox(&self) -> Option<&Mailbox> {
        self.mailbox.as_ref()
    }

    pub async fn allocate(&mut self) -> Result<Nameplate, RendezvousError> {
        let nameplate = self.server.allocate().await?;
        tracing::debug!("Allocated nameplate {}", nameplate);
        Ok(nameplate)
    }

    pub async fn claim(&mut self, nameplate: Nameplate) -> Result<Mailbox, RendezvousError> {
        ensure!(
            self.nameplate.is_none(),
            RendezvousError::Protocol("A nameplate was already claimed".into())
        );
        let mailbox = self.server.claim(nameplate).await?;
        tracing::debug!("Claimed nameplate {}, mailbox {}", nameplate, mailbox);
        self.nameplate = Some(nameplate);
        self.mailbox = Some(mailbox.clone());
        Ok(mailbox)
    }

    /// Open the given mailbox, or the one of the claimed nameplate
    pub async fn open(&mut self, mailbox: Option<Mailbox>) -> Result<(), RendezvousError> {
        let Some(mailbox) = mailbox.or_else(|| self.mailbox.clone()) else {
            bail!(RendezvousError::Protocol("No mailbox to open".into()));
        };
        self.mailbox = Some(mailbox.clone());
        self.server.open(mailbox).await
    }

    /// Give the nameplate back so it can be reused. The mailbox stays open.
    pub async fn release(&mut self) -> Result<(), RendezvousError> {
        if let Some(nameplate) = self.nameplate.take() {
            self.server.release(nameplate).await?;
            tracing::debug!("Released nameplate {}", nameplate);
        }
        Ok(())
    }

    pub fn set_key(&mut self, key: Key<WormholeKey>) -> Result<(), RendezvousError> {
        ensure!(
            self.key.is_none(),
            RendezvousError::Protocol("The key was already set".into())
        );
        self.key = Some(key);
        Ok(())
    }

    /// Add a message to the mailbox. Everything but `pake` is encrypted.
    pub async fn add_message(&mut self, phase: Phase, plaintext: &[u8]) -> Result<(), RendezvousError> {
        let body = if phase.is_pake() {
            plaintext.to_vec()
        } else {
            let Some(key) = &self.key else {
                bail!(RendezvousError::Protocol(
                    format!("Cannot send phase '{}' before the key exchange", phase).into()
                ));
            };
            let data_key = derive_phase_key(self.server.side(), key, &phase);
            encrypt_data(data_key.as_bytes(), plaintext)
        };
        tracing::debug!("Sending phase {}", phase);
        self.server.add(phase, body).await
    }

    /// The next new message from the peer
    ///
    /// A message that fails to decrypt is [`RendezvousError::Crypto`].
    pub async fn next_message(&mut self) -> Result<MailboxMessage, RendezvousError> {
        loop {
            let message = match self.early.pop_front() {
                Some(message) if self.key.is_some() => message,
                Some(message) => {
                    self.early.push_front(message);
                    self.server.next_message().await?
                },
                None => self.server.next_message().await?,
            };

            let side = EitherSide(message.side);
            if *side == *self.side() {
                tracing::trace!("Dropping echo of our own phase {}", message.phase);
                continue;
            }

            let body = if message.phase.is_pake() {
                message.body
            } else {
                let Some(key) = &self.key else {
                    tracing::trace!("Holding back phase {} until the key is known", message.phase);
                    self.early.push_back(EncryptedMessage {
                        side: side.0,
                        phase: message.phase,
                        body: message.body,
                    });
                    continue;
                };
                if self.processed.contains(&(side.clone(), message.phase.clone())) {
                    tracing::debug!("Dropping duplicate phase {}", message.phase);
                    continue;
                }
                let data_key = derive_phase_key(&side, key, &message.phase);
                decrypt_data(data_key.as_bytes(), &message.body).ok_or(
                    RendezvousError::Crypto {
                        phase: message.phase.clone(),
                    },
                )?
            };

            if !self.processed.insert((side.clone(), message.phase.clone())) {
                tracing::debug!("Dropping duplicate phase {}", message.phase);
                continue;
            }
            tracing::debug!("Received phase {} from {}", message.phase, side);
            return Ok(MailboxMessage {
                side,
                phase: message.phase,
                body,
            });
        }
    }

    /// All further messages from the peer, ending after the first error
    pub fn receive(
        &mut self,
    ) -> impl Stream<Item = Result<MailboxMessage, RendezvousError>> + '_ {
        futures::stream::unfold(Some(self), |client| async move {
            let client = client?;
            match client.next_message().await {
                Ok(message) => Some((Ok(message), Some(client))),
                Err(error) => Some((Err(error), None)),
            }
        })
    }

    pub async fn ping(&mut self, ping: u64) -> Result<(), RendezvousError> {
        self.server.ping(ping).await
    }

    /// Release the nameplate (if still held), close the mailbox with our mood and hang up
    pub async fn close(&mut self, mood: Mood) -> Result<(), RendezvousError> {
        self.release().await?;
        if let Some(mailbox) = self.mailbox.take() {
            tracing::debug!("Closing mailbox {} ({})", mailbox, mood);
            self.server.close(mailbox, mood).await?;
        }
        self.server.shutdown().await;
        Ok(())
    }
}
