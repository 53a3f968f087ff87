use std::collections::BTreeMap;
use std::mem::size_of;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use roost_config::{Config, ReceiverConfig};

use crate::capabilities::{CompressionAlgorithm, StreamCapabilities};
use crate::clock::now_realtime_secs;
use crate::connection::Connection;
use crate::constants::{COMPRESSION_MAX_CHUNK, DEFAULT_HOPS, STREAMING_FROM_CHILD_MSGID};
use crate::registry::{Host, ReceiverHandle};
use crate::statsd::RoostGauges;

/// Number of live receiver states in this process.
pub static RECEIVERS: AtomicUsize = AtomicUsize::new(0);

/// Bytes allocated for receiver states, including their read buffers.
pub static RECEIVER_BYTES: AtomicUsize = AtomicUsize::new(0);

/// How a streaming session ended, or what phase its link is in.
///
/// Attached to log lines and to the host's forwarding link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum StreamHandshake {
    Never = 0,
    Preparing = 1,
    DisconnectStaleReceiver = 2,
    DisconnectShutdown = 3,
    DisconnectSocketEof = 4,
    DisconnectSocketError = 5,
    DisconnectTimeout = 6,
    ErrorCantReply = 7,
}

impl StreamHandshake {
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::Preparing,
            2 => Self::DisconnectStaleReceiver,
            3 => Self::DisconnectShutdown,
            4 => Self::DisconnectSocketEof,
            5 => Self::DisconnectSocketError,
            6 => Self::DisconnectTimeout,
            7 => Self::ErrorCantReply,
            _ => Self::Never,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Never => "NEVER",
            Self::Preparing => "PREPARING",
            Self::DisconnectStaleReceiver => "DISCONNECT_STALE_RECEIVER",
            Self::DisconnectShutdown => "DISCONNECT_SHUTDOWN",
            Self::DisconnectSocketEof => "DISCONNECT_SOCKET_EOF",
            Self::DisconnectSocketError => "DISCONNECT_SOCKET_ERROR",
            Self::DisconnectTimeout => "DISCONNECT_TIMEOUT",
            Self::ErrorCantReply => "ERROR_CANT_REPLY",
        }
    }
}

/// Status strings for the access log, one per acceptance decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Connected,
    Disconnected,
    AlreadyConnected,
    RateLimit,
    NotReady,
    Initialization,
    InternalError,
    DuplicateReceiver,
    CantReply,
    NoApiKey,
    NoHostname,
    NoMachineGuid,
    InvalidApiKey,
    InvalidMachineGuid,
    ApiKeyDisabled,
    MachineGuidDisabled,
    NotAllowedIp,
    Localhost,
}

impl StreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "CONNECTED",
            Self::Disconnected => "DISCONNECTED",
            Self::AlreadyConnected => "ALREADY CONNECTED",
            Self::RateLimit => "RATE LIMIT TRY LATER",
            Self::NotReady => "SERVICE NOT READY",
            Self::Initialization => "INITIALIZATION IN PROGRESS RETRY LATER",
            Self::InternalError => "INTERNAL SERVER ERROR",
            Self::DuplicateReceiver => "DUPLICATE RECEIVER DROPPING CONNECTION",
            Self::CantReply => "CANT REPLY",
            Self::NoApiKey => "NO API KEY",
            Self::NoHostname => "NO HOSTNAME",
            Self::NoMachineGuid => "NO MACHINE GUID",
            Self::InvalidApiKey => "INVALID API KEY",
            Self::InvalidMachineGuid => "INVALID MACHINE GUID",
            Self::ApiKeyDisabled => "API KEY DISABLED",
            Self::MachineGuidDisabled => "MACHINE GUID DISABLED",
            Self::NotAllowedIp => "NOT ALLOWED IP",
            Self::Localhost => "LOCALHOST",
        }
    }
}

/// Log priority of an acceptance decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogPriority {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
}

/// Rejected system-info key, reported back to the parser for logging.
#[derive(Debug, thiserror::Error)]
#[error("key is not a known system info variable")]
pub struct UnknownSystemInfoKey;

/// Free-form host metadata reported by the child on connect.
///
/// Ownership of this bag moves into the host entry when the connection is
/// bound; the receiver state must not touch it afterwards.
#[derive(Debug, Clone, Default)]
pub struct SystemInfo {
    pub hops: i16,
    pub ml_capable: Option<u32>,
    pub ml_enabled: Option<u32>,
    pub mc_version: Option<u32>,
    fields: BTreeMap<String, String>,
}

impl SystemInfo {
    /// Stores a reported variable.
    ///
    /// Only the `NETDATA_` namespace is accepted; anything else is unknown
    /// and reported back so the caller can log it as unused.
    pub fn set(&mut self, name: &str, value: &str) -> Result<(), UnknownSystemInfoKey> {
        if !name.starts_with("NETDATA_") {
            return Err(UnknownSystemInfoKey);
        }

        self.fields.insert(name.to_owned(), value.to_owned());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// One inbound streaming connection.
///
/// Exclusively owned by the acceptance flow until handoff, then owned by the
/// streaming worker that runs the session.
#[derive(Debug)]
pub struct ReceiverState {
    pub connection: Connection,

    pub client_ip: String,
    pub client_port: String,

    pub key: Option<String>,
    pub hostname: Option<String>,
    pub registry_hostname: Option<String>,
    pub machine_guid: Option<String>,
    pub os: Option<String>,
    pub timezone: Option<String>,
    pub abbrev_timezone: Option<String>,
    pub utc_offset: i32,
    pub hops: i16,
    pub program_name: Option<String>,
    pub program_version: Option<String>,

    /// Validated identities, set by the admission gate.
    pub key_id: Option<Uuid>,
    pub machine_id: Option<Uuid>,

    pub capabilities: StreamCapabilities,
    pub config: ReceiverConfig,
    pub system_info: Option<SystemInfo>,

    /// Wall-clock second this connection arrived.
    pub connected_since: i64,

    /// Shared liveness handle, also attached to the host's receiver slot.
    pub handle: Arc<ReceiverHandle>,

    /// Set once the connection is bound to a host.
    pub host: Option<Arc<Host>>,

    pub exit_reason: StreamHandshake,

    pub compression: Option<CompressionAlgorithm>,
    /// Fixed-size scratch buffer for compressed reads.
    pub compressed: Vec<u8>,
}

impl ReceiverState {
    /// Allocates the state for a new connection.
    ///
    /// Starts with invalid capabilities, hop count 1, and the receiver
    /// defaults from the process configuration. The system-info bag mirrors
    /// the hop count from the start.
    pub fn new(client_ip: String, client_port: String, config: &Config) -> Box<Self> {
        RECEIVERS.fetch_add(1, Ordering::Relaxed);
        RECEIVER_BYTES.fetch_add(Self::allocation_size(), Ordering::Relaxed);
        roost_statsd::metric!(gauge(RoostGauges::Receivers) = RECEIVERS.load(Ordering::Relaxed) as u64);
        roost_statsd::metric!(
            gauge(RoostGauges::ReceiverMemoryBytes) = RECEIVER_BYTES.load(Ordering::Relaxed) as u64
        );

        let system_info = SystemInfo {
            hops: DEFAULT_HOPS,
            ..Default::default()
        };

        let receiver_config = ReceiverConfig {
            update_every: config.default_update_every(),
            history: config.default_history(),
            memory_mode: config.default_memory_mode(),
            health: config.default_health(),
            ..Default::default()
        };

        Box::new(Self {
            connection: Connection::empty(),
            client_ip,
            client_port,
            key: None,
            hostname: None,
            registry_hostname: None,
            machine_guid: None,
            os: None,
            timezone: None,
            abbrev_timezone: None,
            utc_offset: 0,
            hops: DEFAULT_HOPS,
            program_name: None,
            program_version: None,
            key_id: None,
            machine_id: None,
            capabilities: StreamCapabilities::INVALID,
            config: receiver_config,
            system_info: Some(system_info),
            connected_since: now_realtime_secs(),
            handle: ReceiverHandle::new(),
            host: None,
            exit_reason: StreamHandshake::Never,
            compression: None,
            compressed: vec![0; COMPRESSION_MAX_CHUNK],
        })
    }

    fn allocation_size() -> usize {
        size_of::<Self>() + COMPRESSION_MAX_CHUNK
    }

    pub fn hostname_or_empty(&self) -> &str {
        self.hostname.as_deref().unwrap_or("")
    }

    /// Logs an acceptance decision on both the access and the daemon channel.
    ///
    /// The access line is one machine-parsable record per decision; the
    /// daemon line is the human-readable variant carrying the exit reason
    /// once one is known.
    pub fn log_status(&self, msg: &str, status: StreamStatus, priority: LogPriority) {
        let api_key = self.key.as_deref().unwrap_or("");
        let machine_guid = self.machine_guid.as_deref().unwrap_or("");
        let hostname = self.hostname_or_empty();

        let reason = match self.exit_reason {
            StreamHandshake::Never => String::new(),
            reason => format!(" ({})", reason.as_str()),
        };

        macro_rules! emit {
            ($level:ident) => {{
                roost_log::$level!(
                    target: "roost::access",
                    client_ip = %self.client_ip,
                    client_port = %self.client_port,
                    hostname = %hostname,
                    status = status.as_str(),
                    msg_id = %STREAMING_FROM_CHILD_MSGID,
                    "api_key:'{api_key}' machine_guid:'{machine_guid}' msg:'{msg}'",
                );
                roost_log::$level!(
                    msg_id = %STREAMING_FROM_CHILD_MSGID,
                    "STREAM RECEIVE '{hostname}' [from [{}]:{}]: {msg}{reason}",
                    self.client_ip,
                    self.client_port,
                );
            }};
        }

        match priority {
            LogPriority::Debug => emit!(debug),
            LogPriority::Info | LogPriority::Notice => emit!(info),
            LogPriority::Warning => emit!(warn),
            LogPriority::Error => emit!(error),
        }
    }
}

impl Drop for ReceiverState {
    fn drop(&mut self) {
        RECEIVERS.fetch_sub(1, Ordering::Relaxed);
        RECEIVER_BYTES.fetch_sub(Self::allocation_size(), Ordering::Relaxed);
        roost_statsd::metric!(gauge(RoostGauges::Receivers) = RECEIVERS.load(Ordering::Relaxed) as u64);
        roost_statsd::metric!(
            gauge(RoostGauges::ReceiverMemoryBytes) = RECEIVER_BYTES.load(Ordering::Relaxed) as u64
        );
    }
}
