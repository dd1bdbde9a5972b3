//! The connection to the mailbox server
//!
//! Speaks JSON over either a plain TCP stream (one message per line) or a WebSocket (one message per
//! text frame). Requests are answered asynchronously by the server, interleaved with mailbox
//! messages from the peer; those are queued until [`RendezvousServer::next_message`] asks for them.

use super::{
    Mailbox, Mood, MySide, Nameplate, Phase,
    server_messages::{EncryptedMessage, Envelope, InboundMessage, OutboundMessage, WelcomeMessage},
};
use crate::{config::WormholeConfig, util};
use async_std::{io::BufReader, net::TcpStream};
use async_tungstenite::{
    WebSocketStream,
    async_std::{ConnectStream, connect_async},
    tungstenite as ws2,
};
use futures::{AsyncBufReadExt, AsyncWriteExt, SinkExt, StreamExt};
use std::{collections::VecDeque, time::Duration};

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RendezvousError {
    #[error("Invalid mailbox server URL '{}'", _0)]
    Url(Box<str>),
    #[error("Could not connect to the mailbox server at {url}")]
    Connect {
        url: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Mailbox server error: {}", _0)]
    Server(Box<str>),
    #[error("The mailbox server closed the connection")]
    Closed,
    #[error("The mailbox was closed unexpectedly")]
    MailboxClosed,
    #[error("The mailbox server did not acknowledge a message")]
    AckTimeout,
    #[error("The mailbox server did not answer in time")]
    Timeout,
    #[error("Message of phase '{phase}' could not be decrypted")]
    Crypto { phase: Phase },
    #[error("Protocol error: {}", _0)]
    Protocol(Box<str>),
    #[error("Corrupt JSON message received")]
    Json(
        #[from]
        #[source]
        serde_json::Error,
    ),
    #[error("IO error")]
    IO(
        #[from]
        #[source]
        std::io::Error,
    ),
    #[error("WebSocket error")]
    WebSocket(
        #[from]
        #[source]
        ws2::Error,
    ),
}

impl RendezvousError {
    fn protocol(message: impl Into<Box<str>>) -> Self {
        RendezvousError::Protocol(message.into())
    }
}

enum Connection {
    Tcp {
        reader: BufReader<TcpStream>,
        writer: TcpStream,
        /// A partially received line. Kept across calls so that reading can be cancelled.
        line: Vec<u8>,
    },
    WebSocket(Box<WebSocketStream<ConnectStream>>),
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Connection::Tcp { writer, .. } => write!(f, "Tcp({:?})", writer.peer_addr().ok()),
            Connection::WebSocket(_) => write!(f, "WebSocket"),
        }
    }
}

impl Connection {
    async fn open(url: &url::Url) -> Result<Self, RendezvousError> {
        let connect_error = |source: Box<dyn std::error::Error + Send + Sync>| {
            RendezvousError::Connect {
                url: url.to_string(),
                source,
            }
        };
        match url.scheme() {
            "tcp" => {
                let (Some(host), Some(port)) = (url.host_str(), url.port()) else {
                    bail!(RendezvousError::Url(url.as_str().into()));
                };
                let stream = TcpStream::connect((host, port))
                    .await
                    .map_err(|e| connect_error(e.into()))?;
                Ok(Connection::Tcp {
                    reader: BufReader::new(stream.clone()),
                    writer: stream,
                    line: Vec::new(),
                })
            },
            "ws" | "wss" => {
                let (stream, _response) = connect_async(url.as_str())
                    .await
                    .map_err(|e| connect_error(e.into()))?;
                Ok(Connection::WebSocket(Box::new(stream)))
            },
            _ => bail!(RendezvousError::Url(url.as_str().into())),
        }
    }

    async fn send_text(&mut self, text: String) -> Result<(), RendezvousError> {
        match self {
            Connection::Tcp { writer, .. } => {
                let mut line = text.into_bytes();
                line.push(b'\n');
                writer.write_all(&line).await?;
                writer.flush().await?;
            },
            Connection::WebSocket(stream) => {
                stream.send(ws2::Message::text(text)).await?;
            },
        }
        Ok(())
    }

    /// The next message, or `None` if the server hung up
    async fn receive_text(&mut self) -> Result<Option<String>, RendezvousError> {
        match self {
            Connection::Tcp { reader, line, .. } => loop {
                if reader.read_until(b'\n', line).await? == 0 {
                    return Ok(None);
                }
                if line.last() != Some(&b'\n') {
                    continue;
                }
                let text = String::from_utf8(std::mem::take(line))
                    .map_err(|_| RendezvousError::protocol("Server sent invalid UTF-8"))?;
                if text.trim().is_empty() {
                    continue;
                }
                return Ok(Some(text));
            },
            Connection::WebSocket(stream) => loop {
                match stream.next().await {
                    None => return Ok(None),
                    Some(Err(ws2::Error::ConnectionClosed)) => return Ok(None),
                    Some(Err(error)) => bail!(error),
                    Some(Ok(ws2::Message::Text(text))) => return Ok(Some(text.as_str().to_owned())),
                    Some(Ok(ws2::Message::Close(_))) => return Ok(None),
                    Some(Ok(ws2::Message::Binary(_))) => {
                        tracing::warn!(
                            "Someone is sending binary data, this is not part of the protocol!"
                        );
                    },
                    /* Pings are answered by tungstenite */
                    Some(Ok(_)) => {},
                }
            },
        }
    }

    async fn close(&mut self) {
        let result = match self {
            Connection::Tcp { writer, .. } => writer
                .shutdown(std::net::Shutdown::Both)
                .map_err(RendezvousError::from),
            Connection::WebSocket(stream) => WebSocketStream::close(stream, None)
                .await
                .map_err(Into::into),
        };
        if let Err(error) = result {
            tracing::debug!("Error while closing the server connection: {}", error);
        }
    }
}

/// A connection to the mailbox server, bound to our app id and side
#[derive(Debug)]
pub struct RendezvousServer {
    connection: Connection,
    side: MySide,
    welcome: WelcomeMessage,
    /// Peer messages that arrived while we were waiting for something else
    pending: VecDeque<EncryptedMessage>,
    server_timeout: Duration,
    ack_timeout: Duration,
    max_retransmits: u32,
}

impl RendezvousServer {
    /// Connect, wait for the `welcome` and `bind` to our app id
    pub async fn connect(config: &WormholeConfig, side: MySide) -> Result<Self, RendezvousError> {
        let url = url::Url::parse(&config.rendezvous_url)
            .map_err(|_| RendezvousError::Url(config.rendezvous_url.as_str().into()))?;
        tracing::debug!("Connecting to the mailbox server at {}", url);
        let connection = util::timeout(config.connect_timeout, Connection::open(&url))
            .await
            .map_err(|_| RendezvousError::Timeout)??;

        let mut server = RendezvousServer {
            connection,
            side,
            welcome: WelcomeMessage::default(),
            pending: VecDeque::new(),
            server_timeout: config.server_timeout,
            ack_timeout: config.ack_timeout,
            max_retransmits: config.max_retransmits,
        };

        let InboundMessage::Welcome { welcome } = server.expect_reply("welcome").await? else {
            bail!(RendezvousError::protocol("Expected a welcome message"));
        };
        if let Some(error) = &welcome.error {
            bail!(RendezvousError::Server(error.as_str().into()));
        }
        if let Some(motd) = &welcome.motd {
            tracing::info!("Message of the day: {}", motd);
        }
        server.welcome = welcome;

        let bind = OutboundMessage::bind(config.app_id.clone(), server.side.clone());
        server.send(&bind).await?;
        Ok(server)
    }

    pub fn side(&self) -> &MySide {
        &self.side
    }

    pub fn welcome(&self) -> &WelcomeMessage {
        &self.welcome
    }

    /// Ask the server for a fresh nameplate
    pub async fn allocate(&mut self) -> Result<Nameplate, RendezvousError> {
        self.send(&OutboundMessage::Allocate).await?;
        let InboundMessage::Allocated { nameplate } = self.expect_reply("allocated").await? else {
            bail!(RendezvousError::protocol("Expected an allocated message"));
        };
        match nameplate.parse::<u32>() {
            Ok(number) if number > 0 => Ok(Nameplate::new(number)),
            _ => bail!(RendezvousError::protocol(format!(
                "Server allocated an invalid nameplate '{}'",
                nameplate
            ))),
        }
    }

    /// Claim a nameplate, yielding the id of its mailbox
    pub async fn claim(&mut self, nameplate: Nameplate) -> Result<Mailbox, RendezvousError> {
        self.send(&OutboundMessage::claim(nameplate)).await?;
        let InboundMessage::Claimed { mailbox } = self.expect_reply("claimed").await? else {
            bail!(RendezvousError::protocol("Expected a claimed message"));
        };
        Ok(mailbox)
    }

    pub async fn release(&mut self, nameplate: Nameplate) -> Result<(), RendezvousError> {
        self.send(&OutboundMessage::release(nameplate)).await?;
        self.expect_reply("released").await?;
        Ok(())
    }

    /// Subscribe to a mailbox. The server answers by replaying all its messages.
    pub async fn open(&mut self, mailbox: Mailbox) -> Result<(), RendezvousError> {
        self.send(&OutboundMessage::open(mailbox)).await?;
        Ok(())
    }

    /// Put a message into the opened mailbox and wait until the server acknowledged it
    ///
    /// The identical message (same `id`) is sent again whenever the ack takes longer than the
    /// configured timeout, up to the configured number of retransmissions.
    pub async fn add(&mut self, phase: Phase, body: Vec<u8>) -> Result<(), RendezvousError> {
        let message = OutboundMessage::add(phase, body);
        let id = util::random_hex(4);
        for attempt in 0..=self.max_retransmits {
            if attempt > 0 {
                tracing::warn!(
                    "No ack for message {} from the server, retransmitting ({}/{})",
                    id,
                    attempt,
                    self.max_retransmits
                );
            }
            self.write(&message, &id).await?;
            if let Ok(result) = util::timeout(self.ack_timeout, self.await_ack(&id)).await {
                return result;
            }
        }
        bail!(RendezvousError::AckTimeout)
    }

    pub async fn close(&mut self, mailbox: Mailbox, mood: Mood) -> Result<(), RendezvousError> {
        self.send(&OutboundMessage::close(mailbox, mood)).await?;
        self.expect_reply("closed").await?;
        Ok(())
    }

    /// Round trip to the server, for keep-alive and liveness checks
    pub async fn ping(&mut self, ping: u64) -> Result<(), RendezvousError> {
        self.send(&OutboundMessage::Ping { ping }).await?;
        match self.expect_reply("pong").await? {
            InboundMessage::Pong { pong } if pong == ping => Ok(()),
            other => bail!(RendezvousError::protocol(format!(
                "Unexpected answer to ping {}: {:?}",
                ping, other
            ))),
        }
    }

    /// The next message in the mailbox, with no timeout
    pub async fn next_message(&mut self) -> Result<EncryptedMessage, RendezvousError> {
        if let Some(message) = self.pending.pop_front() {
            return Ok(message);
        }
        loop {
            match self.receive().await? {
                InboundMessage::Message(message) => return Ok(message),
                other => self.handle_unsolicited(other)?,
            }
        }
    }

    /// Close the connection without closing the mailbox
    pub async fn shutdown(&mut self) {
        self.connection.close().await;
    }

    async fn send(&mut self, message: &OutboundMessage) -> Result<(), RendezvousError> {
        let id = util::random_hex(4);
        self.write(message, &id).await
    }

    async fn write(&mut self, message: &OutboundMessage, id: &str) -> Result<(), RendezvousError> {
        tracing::trace!("Sending {} (id {})", message.kind(), id);
        let text = serde_json::to_string(&Envelope { message, id })?;
        self.connection.send_text(text).await
    }

    async fn receive(&mut self) -> Result<InboundMessage, RendezvousError> {
        let text = self
            .connection
            .receive_text()
            .await?
            .ok_or(RendezvousError::Closed)?;
        let message: InboundMessage = serde_json::from_str(&text)?;
        tracing::trace!("Received {}", message.kind());
        Ok(message)
    }

    /// Deal with a message nobody is waiting for right now
    fn handle_unsolicited(&mut self, message: InboundMessage) -> Result<(), RendezvousError> {
        match message {
            InboundMessage::Message(message) => self.pending.push_back(message),
            InboundMessage::Error { error, orig } => {
                tracing::error!("Server error {} (in reply to {:?})", error, orig);
                bail!(RendezvousError::Server(error.into()));
            },
            InboundMessage::Closed => bail!(RendezvousError::MailboxClosed),
            InboundMessage::Unknown => tracing::debug!("Ignoring message of unknown type"),
            other => tracing::trace!("Ignoring unsolicited {}", other.kind()),
        }
        Ok(())
    }

    async fn await_ack(&mut self, id: &str) -> Result<(), RendezvousError> {
        loop {
            match self.receive().await? {
                InboundMessage::Ack { id: Some(ack) } if ack == id => return Ok(()),
                other => self.handle_unsolicited(other)?,
            }
        }
    }

    async fn expect_reply(&mut self, kind: &'static str) -> Result<InboundMessage, RendezvousError> {
        util::timeout(self.server_timeout, self.reply_of_kind(kind))
            .await
            .map_err(|_| RendezvousError::Timeout)?
    }

    async fn reply_of_kind(&mut self, kind: &'static str) -> Result<InboundMessage, RendezvousError> {
        loop {
            let message = self.receive().await?;
            if message.kind() == kind {
                return Ok(message);
            }
            self.handle_unsolicited(message)?;
        }
    }
}
