//! The HTTP server of the streaming surface.
//!
//! This accepts TCP connections, reads the request head, and routes the
//! streaming endpoint into the acceptance flow. The flow may take the socket
//! over mid-request; in that case no HTTP response is written at all.

use std::net::SocketAddr;
use std::sync::Arc;

use http::StatusCode;
use roost_config::Config;
use roost_system::{Controller, Receiver, Service};
use tokio::net::{TcpSocket, TcpStream};

use crate::constants::STREAM_PATH;
use crate::http::{read_request_head, WebClient};
use crate::receiver::accept_stream_connection;
use crate::service::ServiceState;
use crate::statsd::RoostCounters;

/// Indicates the type of failure of the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Binding failed.
    #[error("bind to interface failed")]
    BindFailed(#[from] std::io::Error),
}

fn listen(config: &Config) -> Result<std::net::TcpListener, ServerError> {
    let addr = config.listen_addr();
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }?;

    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(config.tcp_listen_backlog())?.into_std()?)
}

/// Applies per-connection socket options, best effort.
fn configure_stream(config: &Config, stream: &TcpStream) {
    let keepalive_timeout = config.keepalive_timeout();
    if !keepalive_timeout.is_zero() {
        let mut keepalive = socket2::TcpKeepalive::new().with_time(keepalive_timeout);

        #[cfg(not(any(target_os = "openbsd", target_os = "redox", target_os = "solaris")))]
        {
            keepalive = keepalive.with_interval(keepalive_timeout);
        }

        let sock_ref = socket2::SockRef::from(stream);
        if let Err(err) = sock_ref.set_tcp_keepalive(&keepalive) {
            roost_log::trace!("error trying to set TCP keepalive: {err}");
        }
    }

    if let Err(err) = stream.set_nodelay(true) {
        roost_log::trace!("failed to set TCP_NODELAY: {err}");
    }
}

async fn handle_connection(state: ServiceState, mut stream: TcpStream, peer: SocketAddr) {
    let head = match read_request_head(&mut stream, state.config().header_read_timeout()).await {
        Ok(head) => head,
        Err(err) => {
            roost_log::debug!("dropping connection from {peer}: {err}");
            return;
        }
    };

    // The plain TCP listener never carries a TLS session; a terminating
    // acceptor would pass one here.
    let mut web = WebClient::new(stream, None, peer, &head);

    let status = match (head.method.as_str(), head.path.as_str()) {
        ("GET", STREAM_PATH) => accept_stream_connection(&state, &mut web, &head.query).await,
        _ => {
            web.set_response("not found");
            StatusCode::NOT_FOUND
        }
    };

    roost_statsd::metric!(
        counter(RoostCounters::HttpRequests) += 1,
        status = status.as_str().to_owned()
    );

    // A dead web client gave its socket away; the status is informational.
    if !web.is_dead() {
        if let Err(err) = web.send_response(status).await {
            roost_log::debug!("failed to respond to {peer}: {err}");
        }
    }
}

/// HTTP server service.
///
/// This is the HTTP surface of Roost. It accepts streaming requests and
/// dispatches them into the acceptance flow. The server stops when a
/// shutdown is triggered; in-flight streaming sessions are not affected.
pub struct HttpServer {
    config: Arc<Config>,
    state: ServiceState,
    listener: std::net::TcpListener,
}

impl HttpServer {
    pub fn new(config: Arc<Config>, state: ServiceState) -> Result<Self, ServerError> {
        let listener = listen(&config)?;

        Ok(Self {
            config,
            state,
            listener,
        })
    }

    /// The bound address, useful with an ephemeral listen port.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl Service for HttpServer {
    type Interface = ();

    fn spawn(self, _rx: Receiver<Self::Interface>) {
        let Self {
            config,
            state,
            listener,
        } = self;

        tokio::spawn(async move {
            roost_log::info!("spawning http server");
            roost_log::info!("  listening on http://{}/", config.listen_addr());

            if let Err(err) = listener.set_nonblocking(true) {
                roost_log::error!("cannot configure the listener: {err}");
                return;
            }

            let listener = match tokio::net::TcpListener::from_std(listener) {
                Ok(listener) => listener,
                Err(err) => {
                    roost_log::error!("cannot register the listener: {err}");
                    return;
                }
            };

            let mut shutdown = Controller::shutdown_handle();

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.notified() => {
                        roost_log::info!("shutting down HTTP server");
                        state.shutdown_streaming();
                        break;
                    }

                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                configure_stream(&config, &stream);
                                tokio::spawn(handle_connection(state.clone(), stream, peer));
                            }
                            Err(err) => {
                                roost_log::warn!("failed to accept a connection: {err}");
                            }
                        }
                    }
                }
            }
        });
    }

    fn name() -> &'static str {
        "http-server"
    }
}
