//! Sending and receiving one file between two peers
//!
//! Start a session with [`begin_send`] or [`begin_receive`]. Each runs as its own task and reports
//! through an [`EventStream`] that ends after the first terminal event ([`TransferEvent::Completed`],
//! [`TransferEvent::Failed`] or [`TransferEvent::Cancelled`]). The returned handle confirms the
//! offer (receiver) and cancels the session (both).
//!
//! The peers trade [`PeerMessage`s](messages::PeerMessage) over the Wormhole: transit hints, then the
//! offer and its answer. The file itself goes over [transit](crate::transit) as encrypted records,
//! closed by a SHA-256 digest and its acknowledgement.

use futures::AsyncRead;
use std::path::{Path, PathBuf};

use crate::{
    config::WormholeConfig,
    core::{Code, CodeFormatError, Handshake, MailboxClient, RendezvousError, WormholeError, wordlist::default_wordlist},
    transit::{RecordError, TransitConnector, TransitError, TransitInfo, TransitKey, TransitRole},
    util,
};

mod cancel;
pub mod messages;
mod records;
mod session;

use messages::{AnswerType, OfferType, PeerMessage, TransitAck, TransitDigest, TransitType};
use session::{Control, Role, Session};

pub use session::SessionState;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TransferError {
    #[error("The other side rejected the offer")]
    Rejected,
    #[error("The other side cancelled the transfer")]
    PeerCancelled,
    #[error("Something went wrong on the other side: {}", _0)]
    PeerError(String),
    #[error("Transfer was not acknowledged by peer")]
    AckError,
    #[error("Receive checksum error")]
    Checksum,
    #[error("The file contained a different amount of bytes than advertized!")]
    FileSize,
    #[error("Unsupported offer type")]
    UnsupportedOffer,

    /// Some deserialization went wrong, we probably got some garbage
    #[error("Corrupt message received")]
    ProtocolJson(
        #[from]
        #[source]
        serde_json::Error,
    ),
    /// A generic string message for "something went wrong", i.e.
    /// the peer sent some bullshit message order
    #[error("Protocol error: {}", _0)]
    Protocol(Box<str>),
    #[error(
        "Unexpected message (protocol error): Expected '{}', but got: {:?}",
        _0,
        _1
    )]
    ProtocolUnexpectedMessage(Box<str>, Box<dyn std::fmt::Debug + Send + Sync>),
    #[error("Wormhole connection error")]
    Wormhole(
        #[from]
        #[source]
        WormholeError,
    ),
    #[error("Error while establishing transit connection")]
    Transit(
        #[from]
        #[source]
        TransitError,
    ),
    #[error("Transit error")]
    Record(
        #[from]
        #[source]
        RecordError,
    ),
    #[error("IO error")]
    IO(
        #[from]
        #[source]
        std::io::Error,
    ),
}

impl TransferError {
    pub(self) fn unexpected_message(
        expected: impl Into<Box<str>>,
        got: impl std::fmt::Debug + Send + Sync + 'static,
    ) -> Self {
        Self::ProtocolUnexpectedMessage(expected.into(), Box::new(got))
    }

    /// What an `error` peer message means for us
    pub(self) fn from_peer(error: String) -> Self {
        match error.as_str() {
            messages::REJECTED => Self::Rejected,
            messages::CANCELLED => Self::PeerCancelled,
            _ => Self::PeerError(error),
        }
    }
}

impl From<RendezvousError> for TransferError {
    fn from(error: RendezvousError) -> Self {
        Self::Wormhole(error.into())
    }
}

/// Name, size and type of the file on offer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileOffer {
    /// Only the file name, never a path
    pub filename: String,
    pub size: u64,
    /// Optional hint like a MIME type
    pub kind: Option<String>,
}

impl FileOffer {
    /// Keep only the last path component of what the peer sent
    fn from_peer(filename: &str, size: u64, kind: Option<String>) -> Result<Self, TransferError> {
        let name = filename.rsplit(['/', '\\']).next().unwrap_or_default();
        ensure!(
            !name.is_empty() && name != "." && name != "..",
            TransferError::Protocol(format!("Invalid file name '{}'", filename).into())
        );
        Ok(FileOffer {
            filename: name.to_string(),
            size,
            kind,
        })
    }
}

/// The file to send, with the metadata for the offer
pub struct SendFile {
    reader: Box<dyn AsyncRead + Unpin + Send>,
    name: String,
    size: u64,
    kind: Option<String>,
}

impl std::fmt::Debug for SendFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendFile")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl SendFile {
    /// Open a file from disk. Its name is the last component of `path`.
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("'{}' has no file name", path.display()),
                )
            })?;
        let file = async_std::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        Ok(Self::from_reader(file, name, size))
    }

    /// Send `size` bytes from any reader, e.g. a content URI of the platform
    pub fn from_reader(
        reader: impl AsyncRead + Unpin + Send + 'static,
        name: impl Into<String>,
        size: u64,
    ) -> Self {
        SendFile {
            reader: Box::new(reader),
            name: name.into(),
            size,
            kind: None,
        }
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn offer(&self) -> FileOffer {
        FileOffer {
            filename: self.name.clone(),
            size: self.size,
            kind: self.kind.clone(),
        }
    }
}

/// Everything a session reports, in order
#[derive(Debug)]
#[non_exhaustive]
pub enum TransferEvent {
    /// The code to show to the user (sender only)
    Code(Code),
    StateChanged(SessionState),
    /// The key is confirmed. Both sides see the same verifier.
    PeerConnected { verifier: String },
    OfferSent(FileOffer),
    /// Answer with [`ReceiveHandle::confirm_offer`]
    OfferReceived(FileOffer),
    TransitConnected(TransitInfo),
    Progress { done: u64, total: u64 },
    /// Terminal. `path` is where the receiver stored the file.
    Completed { path: Option<PathBuf> },
    /// Terminal
    Failed(crate::Error),
    /// Terminal. Cancelled by either side, or the receiver rejected the offer.
    Cancelled,
}

impl TransferEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferEvent::Completed { .. } | TransferEvent::Failed(_) | TransferEvent::Cancelled
        )
    }
}

/// The events of one session. Ends after the terminal event.
pub type EventStream = async_channel::Receiver<TransferEvent>;

/// How a session ended if nothing went wrong
#[derive(Debug)]
enum Finished {
    Completed(Option<PathBuf>),
    /// We rejected the offer
    Declined,
}

/// Cancel a running send
#[derive(Clone, Debug)]
pub struct SendHandle {
    cancel: async_channel::Sender<()>,
}

impl SendHandle {
    /// Stop at the next suspension point. The session ends with [`TransferEvent::Cancelled`].
    pub fn cancel(&self) {
        if self.cancel.try_send(()).is_err() {
            tracing::debug!("Session is already cancelled or finished");
        }
    }
}

/// Accept or reject the offer of a running receive, or cancel it
#[derive(Clone, Debug)]
pub struct ReceiveHandle {
    decision: async_channel::Sender<bool>,
    cancel: async_channel::Sender<()>,
}

impl ReceiveHandle {
    /// Accept or reject the offer. Only the first decision counts.
    pub fn confirm_offer(&self, accept: bool) {
        if self.decision.try_send(accept).is_err() {
            tracing::debug!("The offer was already decided on");
        }
    }

    /// Stop at the next suspension point. The session ends with [`TransferEvent::Cancelled`].
    pub fn cancel(&self) {
        if self.cancel.try_send(()).is_err() {
            tracing::debug!("Session is already cancelled or finished");
        }
    }
}

/// Resolves once cancellation was requested. Never resolves when all handles are gone.
async fn cancel_signal(cancel: async_channel::Receiver<()>) {
    if cancel.recv().await.is_err() {
        futures::future::pending::<()>().await;
    }
}

/// Send a file: allocate a code, wait for the receiver, stream the file
///
/// The code arrives as [`TransferEvent::Code`].
pub fn begin_send(config: WormholeConfig, file: SendFile) -> (SendHandle, EventStream) {
    let (events_tx, events) = async_channel::unbounded();
    let (cancel_tx, cancel_rx) = async_channel::bounded(1);

    async_std::task::spawn(async move {
        let mut session = Session::new(Role::Sender, events_tx);
        let mut control = Control::default();
        let run = Box::pin(run_send(&mut session, &mut control, &config, file));
        let result = util::cancellable(run, Box::pin(cancel_signal(cancel_rx))).await;
        cancel::handle_run_result(&mut session, &mut control, result).await;
    });

    (SendHandle { cancel: cancel_tx }, events)
}

/// Receive a file into `download_dir`, using the code the sender's user read out
///
/// A malformed code is reported right away, before anything touches the network.
pub fn begin_receive(
    config: WormholeConfig,
    code: &str,
    download_dir: impl Into<PathBuf>,
) -> Result<(ReceiveHandle, EventStream), CodeFormatError> {
    let code = Code::parse(code, &default_wordlist(config.effective_code_words()))?;
    let download_dir = download_dir.into();
    let (events_tx, events) = async_channel::unbounded();
    let (cancel_tx, cancel_rx) = async_channel::bounded(1);
    let (decision_tx, decision_rx) = async_channel::bounded(1);

    async_std::task::spawn(async move {
        let mut session = Session::new(Role::Receiver, events_tx);
        let mut control = Control::default();
        let run = Box::pin(run_receive(
            &mut session,
            &mut control,
            &config,
            code,
            &download_dir,
            decision_rx,
        ));
        let result = util::cancellable(run, Box::pin(cancel_signal(cancel_rx))).await;
        cancel::handle_run_result(&mut session, &mut control, result).await;
    });

    Ok((
        ReceiveHandle {
            decision: decision_tx,
            cancel: cancel_tx,
        },
        events,
    ))
}

/// Open the mailbox of `code`, then run and confirm the key exchange
async fn connect_to_peer(
    session: &mut Session,
    control: &mut Control,
    config: &WormholeConfig,
) -> Result<(), TransferError> {
    let code = session
        .code()
        .cloned()
        .ok_or_else(|| TransferError::Protocol("No code to connect with".into()))?;
    let client = control.mailbox()?;
    let handshake = Handshake::start(client, &code, config.peer_timeout).await?;
    session.advance(SessionState::PeerConnected)?;
    let established = handshake.finish(client, config.peer_timeout).await?;

    let wormhole = control.upgrade(established)?;
    session.set_key(wormhole.key().clone())?;
    session.advance(SessionState::KeyExchanged)?;
    session.emit(TransferEvent::PeerConnected {
        verifier: wormhole.verifier().to_hex(),
    });
    Ok(())
}

async fn connect_mailbox(config: &WormholeConfig) -> Result<MailboxClient, TransferError> {
    let client = MailboxClient::connect(config).await?;
    if let Some(motd) = client.motd() {
        tracing::info!("Server says: {}", motd);
    }
    Ok(client)
}

/// The transit key, derived from the session key
fn transit_key(session: &Session, config: &WormholeConfig) -> Result<crate::Key<TransitKey>, TransferError> {
    let key = session
        .shared_key()
        .ok_or_else(|| TransferError::Protocol("No session key".into()))?;
    Ok(key.derive_subkey_from_purpose(&format!("{}/transit-key", config.app_id)))
}

async fn run_send(
    session: &mut Session,
    control: &mut Control,
    config: &WormholeConfig,
    mut file: SendFile,
) -> Result<Finished, TransferError> {
    *control = Control::Mailbox(connect_mailbox(config).await?);
    let client = control.mailbox()?;
    let nameplate = client.allocate().await?;
    let code = Code::generate(nameplate, &default_wordlist(config.effective_code_words()));
    let mailbox = client.claim(nameplate).await?;
    client.open(None).await?;
    session.set_code(code.clone(), Some(mailbox));
    session.emit(TransferEvent::Code(code));
    session.advance(SessionState::CodeAllocated)?;

    connect_to_peer(session, control, config).await?;

    let connector = TransitConnector::init(config, config.abilities).await?;
    let wormhole = control.wormhole()?;
    let our_candidates = connector.gather_local_candidates();
    tracing::debug!("Sending transit message {:?}", our_candidates);
    wormhole
        .send_json(&PeerMessage::transit(connector.abilities(), &our_candidates))
        .await?;

    let offer = file.offer();
    tracing::debug!("Sending file offer {:?}", offer);
    wormhole.send_json(&PeerMessage::offer_file(&offer)).await?;
    session.advance(SessionState::OfferSent)?;
    session.emit(TransferEvent::OfferSent(offer));

    /* Their transit hints, then their answer */
    let mut their_transit: Option<TransitType> = None;
    loop {
        match wormhole.receive_json::<PeerMessage>().await? {
            PeerMessage::Transit(transit) => {
                tracing::debug!("Received transit message: {:?}", transit);
                their_transit = Some(transit);
            },
            PeerMessage::Answer(AnswerType::FileAck(ack)) => {
                ensure!(ack == "ok", TransferError::AckError);
                break;
            },
            PeerMessage::Error(error) => bail!(TransferError::from_peer(error)),
            other => bail!(TransferError::unexpected_message(
                "transit or answer/file_ack",
                other
            )),
        }
    }
    let their_transit = their_transit.ok_or_else(|| {
        TransferError::Protocol("The peer accepted without sending transit hints".into())
    })?;
    session.advance(SessionState::OfferConfirmed)?;
    tracing::debug!(
        "Abilities in common with the peer: {:?}",
        connector.abilities().intersect(&their_transit.abilities())
    );

    let (mut transit, info) = connector
        .negotiate(
            their_transit.candidates(),
            TransitRole::Leader,
            transit_key(session, config)?,
        )
        .await?;
    session.emit(TransferEvent::TransitConnected(info));
    session.advance(SessionState::Transferring)?;

    tracing::debug!("Beginning file transfer");
    let events = session.events();
    let checksum = records::send_records(
        &mut transit,
        &mut file.reader,
        file.size,
        config.effective_chunk_size(),
        |done, total| {
            let _ = events.try_send(TransferEvent::Progress { done, total });
        },
    )
    .await?;
    let checksum = hex::encode(checksum);

    transit
        .send_record(&serde_json::to_vec(&TransitDigest {
            sha256: checksum.clone(),
        })?)
        .await?;
    transit.flush().await?;

    tracing::debug!("Sent file. Waiting for ack");
    let ack: TransitAck = serde_json::from_slice(&transit.receive_record().await?)?;
    ensure!(ack.ack == "ok", TransferError::AckError);
    ensure!(ack.sha256 == checksum, TransferError::Checksum);
    if let Err(error) = transit.close().await {
        tracing::debug!("Failed to close transit: {}", error);
    }

    tracing::info!("Transfer of '{}' complete", file.name);
    Ok(Finished::Completed(None))
}

async fn run_receive(
    session: &mut Session,
    control: &mut Control,
    config: &WormholeConfig,
    code: Code,
    download_dir: &Path,
    decision: async_channel::Receiver<bool>,
) -> Result<Finished, TransferError> {
    *control = Control::Mailbox(connect_mailbox(config).await?);
    let client = control.mailbox()?;
    let mailbox = client.claim(code.nameplate()).await?;
    client.open(None).await?;
    session.set_code(code, Some(mailbox));
    session.advance(SessionState::CodeAllocated)?;

    connect_to_peer(session, control, config).await?;

    let connector = TransitConnector::init(config, config.abilities).await?;
    let wormhole = control.wormhole()?;
    let our_candidates = connector.gather_local_candidates();
    tracing::debug!("Sending transit message {:?}", our_candidates);
    wormhole
        .send_json(&PeerMessage::transit(connector.abilities(), &our_candidates))
        .await?;

    /* Their transit hints and the offer */
    let mut their_transit: Option<TransitType> = None;
    let offer = loop {
        match wormhole.receive_json::<PeerMessage>().await? {
            PeerMessage::Transit(transit) => {
                tracing::debug!("Received transit message: {:?}", transit);
                their_transit = Some(transit);
            },
            PeerMessage::Offer(OfferType::File {
                filename,
                filesize,
                kind,
            }) => break FileOffer::from_peer(&filename, filesize, kind)?,
            PeerMessage::Offer(offer) => {
                tracing::warn!("Got an offer we can't handle: {:?}", offer);
                bail!(TransferError::UnsupportedOffer)
            },
            PeerMessage::Error(error) => bail!(TransferError::from_peer(error)),
            other => bail!(TransferError::unexpected_message(
                "transit or offer",
                other
            )),
        }
    };
    let their_transit = their_transit.ok_or_else(|| {
        TransferError::Protocol("The peer made an offer without sending transit hints".into())
    })?;
    session.advance(SessionState::OfferReceived)?;
    session.emit(TransferEvent::OfferReceived(offer.clone()));

    if !await_decision(wormhole, &decision).await? {
        tracing::debug!("Rejecting the offer");
        wormhole
            .send_json(&PeerMessage::error(messages::REJECTED))
            .await?;
        return Ok(Finished::Declined);
    }
    wormhole.send_json(&PeerMessage::file_ack()).await?;
    session.advance(SessionState::OfferConfirmed)?;

    let (mut transit, info) = connector
        .negotiate(
            their_transit.candidates(),
            TransitRole::Follower,
            transit_key(session, config)?,
        )
        .await?;
    session.emit(TransferEvent::TransitConnected(info));
    session.advance(SessionState::Transferring)?;

    let (partial, mut file) = create_partial(download_dir, &offer.filename).await?;
    session.partial = Some(partial.clone());

    let events = session.events();
    let checksum = records::receive_records(
        offer.size,
        &mut transit,
        |done, total| {
            let _ = events.try_send(TransferEvent::Progress { done, total });
        },
        &mut file,
    )
    .await?;
    file.sync_all().await?;
    drop(file);
    let checksum = hex::encode(checksum);

    let digest: TransitDigest = serde_json::from_slice(&transit.receive_record().await?)?;
    ensure!(digest.sha256 == checksum, TransferError::Checksum);
    transit
        .send_record(&serde_json::to_vec(&TransitAck::ok(checksum))?)
        .await?;
    if let Err(error) = transit.close().await {
        tracing::debug!("Failed to close transit: {}", error);
    }

    let destination = unique_destination(download_dir, &offer.filename).await;
    async_std::fs::rename(&partial, &destination).await?;
    session.partial = None;

    tracing::info!("Received '{}' into {}", offer.filename, destination.display());
    Ok(Finished::Completed(Some(destination)))
}

/// Wait for the user, but notice when the peer gives up in the meantime. There is no timeout.
async fn await_decision(
    wormhole: &mut crate::Wormhole,
    decision: &async_channel::Receiver<bool>,
) -> Result<bool, TransferError> {
    use futures::future::Either;

    /* Without any handle left nobody can accept */
    let decided = Box::pin(async { decision.recv().await.unwrap_or(false) });
    let interrupted = Box::pin(interrupted_by_peer(wormhole));
    match futures::future::select(decided, interrupted).await {
        Either::Left((accept, _)) => Ok(accept),
        Either::Right((error, _)) => Err(error),
    }
}

async fn interrupted_by_peer(wormhole: &mut crate::Wormhole) -> TransferError {
    loop {
        match wormhole.receive_json::<PeerMessage>().await {
            Ok(PeerMessage::Error(error)) => return TransferError::from_peer(error),
            Ok(PeerMessage::Unknown) => tracing::debug!("Ignoring unknown message"),
            Ok(other) => return TransferError::unexpected_message("nothing", other),
            Err(error) => return error.into(),
        }
    }
}

/// Create `name.part`, or the first free `name (n).part`. Never opens an existing file.
async fn create_partial(dir: &Path, filename: &str) -> std::io::Result<(PathBuf, async_std::fs::File)> {
    let mut n = 0;
    loop {
        let partial = match n {
            0 => dir.join(format!("{}.part", filename)),
            n => dir.join(format!("{} ({}).part", filename, n)),
        };
        match async_std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&partial)
            .await
        {
            Ok(file) => return Ok((partial, file)),
            Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => n += 1,
            Err(error) => return Err(error),
        }
    }
}

/// `name.ext`, or the first free `name (n).ext`
async fn unique_destination(dir: &Path, filename: &str) -> PathBuf {
    let destination = dir.join(filename);
    if async_std::fs::metadata(&destination).await.is_err() {
        return destination;
    }

    let name = Path::new(filename);
    let stem = name
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| filename.to_string());
    let extension = name
        .extension()
        .map(|extension| format!(".{}", extension.to_string_lossy()))
        .unwrap_or_default();
    let mut n = 1;
    loop {
        let candidate = dir.join(format!("{} ({}){}", stem, n, extension));
        if async_std::fs::metadata(&candidate).await.is_err() {
            return candidate;
        }
        n += 1;
    }
}
