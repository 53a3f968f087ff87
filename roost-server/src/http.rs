//! The minimal HTTP surface of the streaming endpoint.
//!
//! Roost serves exactly one route, and that route gives up its socket on
//! success, so the request head is parsed directly off the accepted stream.
//! Everything after the head belongs to the streaming protocol.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use http::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::connection::TlsSession;

/// Upper bound for the request head.
const MAX_HEAD_SIZE: usize = 8192;

/// Maximum number of request headers we look at.
const MAX_HEADERS: usize = 32;

/// Failures while reading or parsing a request head.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("client did not send a complete request head in time")]
    HeadTimeout,

    #[error("request head exceeds {MAX_HEAD_SIZE} bytes")]
    HeadTooLarge,

    #[error("malformed request head")]
    BadRequest(#[from] httparse::Error),

    #[error("connection closed while reading the request head")]
    Closed,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The parts of a request the streaming endpoint cares about.
#[derive(Debug, Default)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub query: String,
    pub user_agent: String,
}

/// Reads and parses a request head within the given time budget.
pub async fn read_request_head<S>(
    stream: &mut S,
    timeout: Duration,
) -> Result<RequestHead, RequestError>
where
    S: AsyncRead + Unpin,
{
    let deadline = tokio::time::Instant::now() + timeout;
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let read = tokio::time::timeout_at(deadline, stream.read(&mut chunk))
            .await
            .map_err(|_| RequestError::HeadTimeout)??;

        if read == 0 {
            return Err(RequestError::Closed);
        }

        buf.extend_from_slice(&chunk[..read]);
        if buf.len() > MAX_HEAD_SIZE {
            return Err(RequestError::HeadTooLarge);
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);

        match request.parse(&buf)? {
            httparse::Status::Complete(_) => {
                let target = request.path.unwrap_or("/");
                let (path, query) = match target.split_once('?') {
                    Some((path, query)) => (path, query),
                    None => (target, ""),
                };

                let user_agent = request
                    .headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case("user-agent"))
                    .map(|h| String::from_utf8_lossy(h.value).into_owned())
                    .unwrap_or_default();

                return Ok(RequestHead {
                    method: request.method.unwrap_or("").to_owned(),
                    path: path.to_owned(),
                    query: query.to_owned(),
                    user_agent,
                });
            }
            httparse::Status::Partial => continue,
        }
    }
}

/// The request-side view of one accepted connection.
///
/// The web client owns the socket, and the TLS session it arrived on, until
/// the acceptance flow takes them over. After
/// [`take_transport`](Self::take_transport), the client is dead: it holds
/// neither socket nor session, cannot write a response, and its pending
/// response buffer is flushed away.
#[derive(Debug)]
pub struct WebClient {
    stream: Option<TcpStream>,
    tls: Option<TlsSession>,
    client_ip: String,
    client_port: String,
    user_agent: String,
    response: Vec<u8>,
}

impl WebClient {
    pub fn new(
        stream: TcpStream,
        tls: Option<TlsSession>,
        peer: SocketAddr,
        head: &RequestHead,
    ) -> Self {
        Self {
            stream: Some(stream),
            tls,
            client_ip: peer.ip().to_string(),
            client_port: peer.port().to_string(),
            user_agent: head.user_agent.clone(),
            response: Vec::new(),
        }
    }

    pub fn client_ip(&self) -> &str {
        &self.client_ip
    }

    pub fn client_port(&self) -> &str {
        &self.client_port
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Replaces the pending response body.
    pub fn set_response(&mut self, body: &str) {
        self.response.clear();
        self.response.extend_from_slice(body.as_bytes());
    }

    /// A dead client has surrendered its socket and cannot respond anymore.
    pub fn is_dead(&self) -> bool {
        self.stream.is_none()
    }

    /// Moves the socket and its TLS session out of the web client.
    ///
    /// The client is dead afterwards and its pending response is dropped;
    /// whoever takes the transport speaks on it directly.
    pub fn take_transport(&mut self) -> Option<(TcpStream, Option<TlsSession>)> {
        self.response.clear();
        let stream = self.stream.take()?;
        Some((stream, self.tls.take()))
    }

    /// Writes the pending response with the given status and closes.
    ///
    /// On a dead client this does nothing; the status is informational only.
    pub async fn send_response(&mut self, status: StatusCode) -> io::Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };

        let head = format!(
            "HTTP/1.1 {} {}\r\nServer: roost\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            status.as_str(),
            status.canonical_reason().unwrap_or(""),
            self.response.len(),
        );

        stream.write_all(head.as_bytes()).await?;
        stream.write_all(&self.response).await?;
        stream.flush().await?;
        stream.shutdown().await.ok();
        Ok(())
    }
}
