//! The streaming worker service.
//!
//! Bound receivers are enqueued here after the handshake. Each session runs
//! on a blocking thread: it polls the socket in short ticks so stop requests
//! are honored promptly, while the configured receive timeout bounds how long
//! a silent child is kept around.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use roost_config::Config;
use roost_system::{Interface, Receiver, Service};

use crate::clock::now_monotonic_secs;
use crate::receiver::{LogPriority, ReceiverState, StreamHandshake, StreamStatus};
use crate::registry::HostRegistry;
use crate::statsd::RoostCounters;

/// How often a worker wakes up to check for stop requests.
const WORKER_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Consumes the byte stream of one child after the handshake.
///
/// The sample decoder implements this; the worker only moves bytes.
pub trait StreamDecoder: Send {
    fn consume(&mut self, chunk: &[u8]);
}

/// Counts and discards payload until a decoder is attached.
#[derive(Debug, Default)]
struct SinkDecoder {
    bytes: u64,
}

impl StreamDecoder for SinkDecoder {
    fn consume(&mut self, chunk: &[u8]) {
        self.bytes += chunk.len() as u64;
    }
}

/// Hands a bound receiver to the streaming workers. Ownership of the state
/// transfers with the message.
#[derive(Debug)]
pub struct AddReceiver(pub Box<ReceiverState>);

impl Interface for AddReceiver {}

/// Service running the accepted streaming sessions.
#[derive(Debug)]
pub struct StreamingService {
    config: Arc<Config>,
    registry: Arc<HostRegistry>,
}

impl StreamingService {
    pub fn new(config: Arc<Config>, registry: Arc<HostRegistry>) -> Self {
        Self { config, registry }
    }
}

impl Service for StreamingService {
    type Interface = AddReceiver;

    fn spawn(self, mut rx: Receiver<Self::Interface>) {
        tokio::spawn(async move {
            let Self { config, registry } = self;

            while let Some(AddReceiver(rpt)) = rx.recv().await {
                let config = config.clone();
                let registry = registry.clone();
                tokio::task::spawn_blocking(move || run_receiver(config, registry, rpt));
            }
        });
    }

    fn name() -> &'static str {
        "streaming"
    }
}

/// Runs one streaming session to completion.
fn run_receiver(config: Arc<Config>, registry: Arc<HostRegistry>, mut rpt: Box<ReceiverState>) {
    let handle = rpt.handle.clone();
    handle.touch();

    if let Err(err) = rpt.connection.set_receive_timeout(WORKER_POLL_INTERVAL) {
        roost_log::error!(
            "STREAM RECEIVE '{}' [from [{}]:{}]: cannot set the poll interval: {err}",
            rpt.hostname_or_empty(),
            rpt.client_ip,
            rpt.client_port,
        );
    }

    let receive_timeout = config.receive_timeout().as_secs() as i64;
    let mut decoder = SinkDecoder::default();
    let mut reason = StreamHandshake::DisconnectSocketEof;

    loop {
        if let Some(stop) = handle.stop_requested() {
            reason = stop;
            break;
        }

        let state = &mut *rpt;
        match state.connection.read(&mut state.compressed) {
            Ok(0) => {
                reason = StreamHandshake::DisconnectSocketEof;
                break;
            }
            Ok(read) => {
                handle.touch();
                roost_statsd::metric!(
                    counter(RoostCounters::StreamBytesReceived) += read as u64
                );
                decoder.consume(&state.compressed[..read]);
            }
            Err(err)
                if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                // Poll tick. The receive timeout is enforced against the last
                // message, not against single reads.
                if now_monotonic_secs() - handle.last_msg_secs() >= receive_timeout {
                    reason = StreamHandshake::DisconnectTimeout;
                    break;
                }
            }
            Err(_) => {
                reason = StreamHandshake::DisconnectSocketError;
                break;
            }
        }
    }

    rpt.exit_reason = reason;
    rpt.connection.close();

    if let Some(host) = rpt.host.take() {
        registry.clear_receiver(&host, &handle);
    }

    rpt.log_status(
        "streaming connection closed",
        StreamStatus::Disconnected,
        LogPriority::Info,
    );

    // Order matters: whoever waits on this handle may immediately attach a
    // new receiver, so the slot must already be free.
    handle.mark_exited();
}
