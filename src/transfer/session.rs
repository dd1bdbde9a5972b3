//! Where a transfer stands, and who gets told about it

use super::{TransferError, TransferEvent};
use crate::{
    Code, Key, WormholeKey,
    core::{EstablishedKey, Mailbox, MailboxClient, Wormhole, WormholeError},
    error::Error,
};
use std::path::PathBuf;

/// The lifecycle of a session
///
/// States only move forward, one step at a time. [`SessionState::Failed`] and [`SessionState::Cancelled`]
/// can be reached from everywhere except another terminal state.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, derive_more::Display)]
pub enum SessionState {
    Idle,
    /// Sender: nameplate allocated and claimed. Receiver: nameplate claimed.
    CodeAllocated,
    /// The peer's `pake` message arrived
    PeerConnected,
    /// Both sides confirmed the key
    KeyExchanged,
    OfferSent,
    OfferReceived,
    /// The receiver accepted the offer
    OfferConfirmed,
    Transferring,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        )
    }

    /// Position on the happy path. Sending and receiving the offer share a step.
    fn step(self) -> Option<u8> {
        Some(match self {
            SessionState::Idle => 0,
            SessionState::CodeAllocated => 1,
            SessionState::PeerConnected => 2,
            SessionState::KeyExchanged => 3,
            SessionState::OfferSent | SessionState::OfferReceived => 4,
            SessionState::OfferConfirmed => 5,
            SessionState::Transferring => 6,
            SessionState::Completed => 7,
            SessionState::Failed | SessionState::Cancelled => return None,
        })
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.step(), next.step()) {
            (_, None) => true,
            (Some(current), Some(next)) => next == current + 1,
            (None, Some(_)) => false,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, derive_more::Display)]
pub enum Role {
    #[display("sender")]
    Sender,
    #[display("receiver")]
    Receiver,
}

/// One transfer, owned by the task that runs it
#[derive(Debug)]
pub(super) struct Session {
    role: Role,
    code: Option<Code>,
    mailbox: Option<Mailbox>,
    shared_key: Option<Key<WormholeKey>>,
    state: SessionState,
    events: async_channel::Sender<TransferEvent>,
    /// Incomplete download to delete unless the transfer succeeds
    pub partial: Option<PathBuf>,
}

impl Session {
    pub fn new(role: Role, events: async_channel::Sender<TransferEvent>) -> Self {
        Session {
            role,
            code: None,
            mailbox: None,
            shared_key: None,
            state: SessionState::Idle,
            events,
            partial: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn code(&self) -> Option<&Code> {
        self.code.as_ref()
    }

    pub fn set_code(&mut self, code: Code, mailbox: Option<Mailbox>) {
        self.code = Some(code);
        self.mailbox = mailbox;
    }

    /// The key is agreed on once per session
    pub fn set_key(&mut self, key: Key<WormholeKey>) -> Result<(), TransferError> {
        ensure!(
            self.shared_key.is_none(),
            TransferError::Protocol("The session key was already set".into())
        );
        self.shared_key = Some(key);
        Ok(())
    }

    pub fn shared_key(&self) -> Option<&Key<WormholeKey>> {
        self.shared_key.as_ref()
    }

    /// A clone of the event channel, e.g. for progress reporting
    pub fn events(&self) -> async_channel::Sender<TransferEvent> {
        self.events.clone()
    }

    /// Events are best effort: nobody listening is not an error
    pub fn emit(&self, event: TransferEvent) {
        if self.events.try_send(event).is_err() {
            tracing::trace!("Nobody is listening for events any more");
        }
    }

    pub fn advance(&mut self, next: SessionState) -> Result<(), TransferError> {
        ensure!(
            self.state.can_transition_to(next),
            TransferError::Protocol(
                format!("Invalid state transition from {} to {}", self.state, next).into()
            )
        );
        tracing::debug!(
            "{} session {}: {} -> {}",
            self.role,
            self.mailbox.as_deref().unwrap_or("-"),
            self.state,
            next
        );
        self.state = next;
        self.emit(TransferEvent::StateChanged(next));
        Ok(())
    }

    /// Enter a terminal state and emit the matching event, which is the last one
    fn finish(&mut self, next: SessionState, event: TransferEvent) {
        if let Err(error) = self.advance(next) {
            tracing::warn!("{}", error);
            return;
        }
        self.emit(event);
        self.events.close();
    }

    pub fn complete(&mut self, path: Option<PathBuf>) {
        self.finish(SessionState::Completed, TransferEvent::Completed { path });
    }

    pub fn fail(&mut self, error: impl Into<Error>) {
        let error = error.into();
        tracing::info!("{} session failed: {}", self.role, error.describe());
        self.finish(SessionState::Failed, TransferEvent::Failed(error));
    }

    pub fn cancel(&mut self) {
        tracing::info!("{} session cancelled", self.role);
        self.finish(SessionState::Cancelled, TransferEvent::Cancelled);
    }
}

/// The control connection of a session, however far it got
#[derive(Debug, Default)]
pub(super) enum Control {
    #[default]
    Offline,
    Mailbox(MailboxClient),
    Wormhole(Wormhole),
}

impl Control {
    pub fn mailbox(&mut self) -> Result<&mut MailboxClient, TransferError> {
        match self {
            Control::Mailbox(client) => Ok(client),
            _ => bail!(TransferError::Protocol(
                "Not connected to a mailbox".into()
            )),
        }
    }

    pub fn wormhole(&mut self) -> Result<&mut Wormhole, TransferError> {
        match self {
            Control::Wormhole(wormhole) => Ok(wormhole),
            _ => bail!(TransferError::Protocol(
                "No key exchange with the peer yet".into()
            )),
        }
    }

    /// Turn the mailbox connection into a [`Wormhole`] once the key is confirmed
    pub fn upgrade(&mut self, established: EstablishedKey) -> Result<&mut Wormhole, TransferError> {
        match std::mem::take(self) {
            Control::Mailbox(client) => {
                *self = Control::Wormhole(Wormhole::new(client, established));
                self.wormhole()
            },
            other => {
                *self = other;
                bail!(TransferError::Wormhole(WormholeError::Protocol(
                    "Key exchange without a mailbox".into()
                )))
            },
        }
    }
}
