//! The owned transport of a streaming session.
//!
//! A [`Connection`] owns the TCP stream and, when the connection arrived
//! encrypted, the established TLS session, exclusively. It starts out on the
//! accept surface in non-blocking mode and is switched to blocking mode with
//! a receive timeout once the handshake succeeds. Moving the transport out of
//! a connection leaves the source empty, so a socket is never owned twice.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

/// An established TLS session accompanying a socket.
///
/// Roost never runs the handshake itself: a terminating acceptor hands the
/// session record over together with the accepted connection, and from then
/// on it travels with the socket. It is opaque to the streaming code, which
/// only surfaces it in logs.
#[derive(Debug)]
pub struct TlsSession {
    protocol: String,
    cipher: String,
}

impl TlsSession {
    pub fn new(protocol: impl Into<String>, cipher: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            cipher: cipher.into(),
        }
    }

    /// The negotiated protocol version, e.g. `TLSv1.3`.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// The negotiated cipher suite.
    pub fn cipher(&self) -> &str {
        &self.cipher
    }
}

/// An exclusively owned streaming socket with its optional TLS session.
#[derive(Debug, Default)]
pub struct Connection {
    stream: Option<TcpStream>,
    tls: Option<TlsSession>,
}

impl Connection {
    /// A connection without a transport.
    pub fn empty() -> Self {
        Self {
            stream: None,
            tls: None,
        }
    }

    /// Takes ownership of a stream accepted by the async surface, together
    /// with the TLS session it arrived on, if any.
    ///
    /// The stream stays in non-blocking mode until [`make_blocking`] is
    /// called; sends cope with that by switching the socket themselves.
    ///
    /// [`make_blocking`]: Self::make_blocking
    pub fn from_accepted(
        stream: tokio::net::TcpStream,
        tls: Option<TlsSession>,
    ) -> io::Result<Self> {
        Ok(Self {
            stream: Some(stream.into_std()?),
            tls,
        })
    }

    /// Returns `true` while this connection owns a transport.
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// The TLS session of this connection, if it arrived encrypted.
    pub fn tls_session(&self) -> Option<&TlsSession> {
        self.tls.as_ref()
    }

    /// Moves the transport out, leaving this connection empty.
    ///
    /// The TLS session moves with the socket; the source keeps neither.
    pub fn take(&mut self) -> Connection {
        Connection {
            stream: self.stream.take(),
            tls: self.tls.take(),
        }
    }

    /// Switches the socket to blocking mode and applies a receive timeout.
    pub fn make_blocking(&mut self, receive_timeout: Duration) -> io::Result<()> {
        let stream = self.stream()?;
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(receive_timeout))
    }

    /// Adjusts the receive timeout of a blocking socket.
    pub fn set_receive_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.stream()?.set_read_timeout(Some(timeout))
    }

    /// Writes the full buffer under a send timeout.
    ///
    /// Returns the number of bytes that went out. A short count means the
    /// timeout expired or the peer went away mid-write; callers treat any
    /// short write as a failed reply.
    pub fn send_timeout(&mut self, data: &[u8], timeout: Duration) -> io::Result<usize> {
        let stream = self.stream()?;
        stream.set_nonblocking(false)?;
        stream.set_write_timeout(Some(timeout))?;

        let mut sent = 0;
        while sent < data.len() {
            match stream.write(&data[sent..]) {
                Ok(0) => break,
                Ok(n) => sent += n,
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    break
                }
                Err(e) => return Err(e),
            }
        }

        if sent == data.len() {
            stream.flush().ok();
        }
        Ok(sent)
    }

    /// Reads into the buffer, honoring the configured receive timeout.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream()?.read(buf)
    }

    /// Drops the transport, closing the socket.
    pub fn close(&mut self) {
        self.stream = None;
        self.tls = None;
    }

    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn take_clears_the_source() {
        let (client, _server) = pair();
        let mut source = Connection {
            stream: Some(client),
            tls: None,
        };

        let moved = source.take();
        assert!(moved.is_open());
        assert!(!source.is_open());
        assert!(!source.take().is_open());
    }

    #[test]
    fn take_moves_the_tls_session_with_the_socket() {
        let (client, _server) = pair();
        let mut source = Connection {
            stream: Some(client),
            tls: Some(TlsSession::new("TLSv1.3", "TLS_AES_128_GCM_SHA256")),
        };

        let moved = source.take();
        assert_eq!(
            moved.tls_session().map(TlsSession::protocol),
            Some("TLSv1.3")
        );
        assert!(source.tls_session().is_none());
        assert!(!source.is_open());
    }

    #[test]
    fn send_reports_full_length() {
        let (client, mut server) = pair();
        let mut conn = Connection {
            stream: Some(client),
            tls: None,
        };

        let sent = conn
            .send_timeout(b"hello", Duration::from_secs(5))
            .unwrap();
        assert_eq!(sent, 5);

        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn operations_on_empty_connection_fail() {
        let mut conn = Connection::empty();
        assert!(conn.make_blocking(Duration::from_secs(1)).is_err());
        assert!(conn.send_timeout(b"x", Duration::from_secs(1)).is_err());
    }
}
