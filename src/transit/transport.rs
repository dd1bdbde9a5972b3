//! Helper functions abstracting away the TCP plumbing of Transit

use super::{CandidateKind, TransitCandidate, TransitInfo, crypto::TransitHandshakeError};

use async_std::net::TcpStream;
use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite};

/// A raw connection to the peer (directly or via the relay) plus what we know about it
pub(super) type TransitConnection = (Box<dyn TransitTransport>, TransitInfo);

#[async_trait]
pub(super) trait TransitTransportRx: AsyncRead + std::any::Any + Unpin + Send {
    /// Helper method for handshake: read a fixed number of bytes and make sure they are as expected
    async fn read_expect(&mut self, expected: &[u8]) -> Result<(), TransitHandshakeError> {
        let mut buffer = vec![0u8; expected.len()];
        self.read_exact(&mut buffer).await?;
        ensure!(buffer == expected, TransitHandshakeError::HandshakeFailed);
        Ok(())
    }

    /// Helper method for handshake: read up to and including the next newline
    ///
    /// Reads byte by byte so that nothing after the line gets consumed.
    async fn read_line(&mut self, max_length: usize) -> Result<String, TransitHandshakeError> {
        let mut line = Vec::new();
        let mut byte = [0u8];
        while line.len() < max_length {
            self.read_exact(&mut byte).await?;
            line.push(byte[0]);
            if byte[0] == b'\n' {
                return String::from_utf8(line).map_err(|_| TransitHandshakeError::HandshakeFailed);
            }
        }
        bail!(TransitHandshakeError::HandshakeFailed)
    }
}

/// Trait abstracting our socket used for communicating over the wire.
pub(super) trait TransitTransport: TransitTransportRx + AsyncWrite {}

impl<T> TransitTransportRx for T where T: AsyncRead + std::any::Any + Unpin + Send {}
impl<T> TransitTransport for T where T: AsyncRead + AsyncWrite + std::any::Any + Unpin + Send {}

/// Open a TCP connection to a candidate. The caller does the handshakes.
pub(super) async fn connect_tcp(
    candidate: &TransitCandidate,
) -> Result<TransitConnection, TransitHandshakeError> {
    tracing::debug!("Connecting to {}", candidate);
    let socket = TcpStream::connect((candidate.host.as_str(), candidate.port)).await?;
    tracing::debug!("Connected to {}!", candidate);

    wrap_tcp_connection(socket, candidate.kind)
}

/// Take a tcp connection and transform it into a `TransitConnection`
pub(super) fn wrap_tcp_connection(
    socket: TcpStream,
    conn_type: CandidateKind,
) -> Result<TransitConnection, TransitHandshakeError> {
    socket.set_nodelay(true)?;
    let info = TransitInfo {
        conn_type,
        peer_addr: socket.peer_addr()?,
    };

    Ok((Box::new(socket), info))
}

#[cfg(test)]
mod test {
    use super::*;

    #[async_std::test]
    async fn test_read_line() {
        let mut reader = futures::io::Cursor::new(b"ok\nrest".to_vec());
        assert_eq!(reader.read_line(16).await.unwrap(), "ok\n");
        let mut rest = String::new();
        reader.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "rest");

        let mut reader = futures::io::Cursor::new(b"no newline in here".to_vec());
        assert!(matches!(
            reader.read_line(8).await,
            Err(TransitHandshakeError::HandshakeFailed)
        ));
    }

    #[async_std::test]
    async fn test_read_expect() {
        let mut reader = futures::io::Cursor::new(b"transit receiver".to_vec());
        reader.read_expect(b"transit ").await.unwrap();
        assert!(matches!(
            reader.read_expect(b"sender").await,
            Err(TransitHandshakeError::HandshakeFailed)
        ));
    }
}
