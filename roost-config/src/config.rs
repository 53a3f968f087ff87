use std::fmt;
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::stream::{HealthSetting, MemoryMode};

/// Indicates config related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to open the file.
    #[error("could not open config file {path:?}")]
    CouldNotOpenFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Parsing YAML failed.
    #[error("could not parse yaml config file {path:?}")]
    BadYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// TLS support was not compiled in.
    #[error("TLS is not terminated by roost, use a proxy in front")]
    TlsNotSupported,
}

fn default_listen_addr() -> SocketAddr {
    "0.0.0.0:19999".parse().unwrap()
}

fn default_backlog() -> u32 {
    1024
}

fn default_keepalive_secs() -> u64 {
    5
}

fn default_header_read_secs() -> u64 {
    5
}

/// Settings for the HTTP surface that receives streaming requests.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpSettings {
    /// The address and port to listen on.
    pub listen_addr: SocketAddr,

    /// The TCP listen backlog.
    pub tcp_listen_backlog: u32,

    /// TCP keep-alive time and interval in seconds. Zero disables keep-alive.
    pub keepalive_timeout_secs: u64,

    /// Time budget for a client to transmit its entire request head.
    pub header_read_timeout_secs: u64,

    /// TLS listen address. Roost does not terminate TLS; any value here is
    /// rejected at startup.
    pub tls_listen_addr: Option<SocketAddr>,

    /// Path to a TLS identity, rejected like `tls_listen_addr`.
    pub tls_identity_path: Option<PathBuf>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            tcp_listen_backlog: default_backlog(),
            keepalive_timeout_secs: default_keepalive_secs(),
            header_read_timeout_secs: default_header_read_secs(),
            tls_listen_addr: None,
            tls_identity_path: None,
        }
    }
}

fn default_receive_timeout_secs() -> u64 {
    600
}

fn default_send_timeout_secs() -> u64 {
    60
}

fn default_error_send_timeout_secs() -> u64 {
    5
}

fn default_update_every() -> i64 {
    1
}

fn default_history() -> usize {
    3600
}

/// Settings for accepting and running streaming sessions.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Receive timeout on an established streaming socket, in seconds.
    pub receive_timeout_secs: u64,

    /// Send timeout for the initial handshake response, in seconds.
    pub send_timeout_secs: u64,

    /// Send timeout for in-band error tokens on an owned socket, in seconds.
    pub error_send_timeout_secs: u64,

    /// Minimum seconds between two accepted streaming connections.
    ///
    /// Zero disables the rate gate.
    pub rate_limit_secs: i64,

    /// Upper bound on the number of hosts the registry creates. Zero means
    /// unlimited.
    pub max_hosts: usize,

    /// Default data collection interval for new receivers, in seconds.
    pub default_update_every: i64,

    /// Default history depth for new hosts, in entries.
    pub default_history: usize,

    /// Default memory mode for new hosts.
    pub default_memory_mode: MemoryMode,

    /// Default health setting for new hosts.
    pub default_health: HealthSetting,

    /// Path to the streaming credentials file, relative to the config
    /// directory.
    pub credentials_file: PathBuf,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            receive_timeout_secs: default_receive_timeout_secs(),
            send_timeout_secs: default_send_timeout_secs(),
            error_send_timeout_secs: default_error_send_timeout_secs(),
            rate_limit_secs: 0,
            max_hosts: 0,
            default_update_every: default_update_every(),
            default_history: default_history(),
            default_memory_mode: MemoryMode::default(),
            default_health: HealthSetting::default(),
            credentials_file: PathBuf::from("stream.yml"),
        }
    }
}

/// The identity of this node itself.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeSettings {
    /// The hostname this node reports for itself. Defaults to the OS hostname.
    pub hostname: Option<String>,

    /// The machine identity of this node. Generated when absent.
    pub machine_guid: Option<Uuid>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
struct ConfigValues {
    http: HttpSettings,
    stream: StreamSettings,
    node: NodeSettings,
    logging: roost_log::LogConfig,
    metrics: roost_statsd::MetricsConfig,
}

/// Config struct.
///
/// Load the config from `roost.yml` in a config directory with
/// [`Config::load`], or start from [`Config::default`] and mutate through the
/// public setting structs in tests.
#[derive(Default)]
pub struct Config {
    values: ConfigValues,
    path: Option<PathBuf>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("path", &self.path)
            .field("values", &self.values)
            .finish()
    }
}

impl Config {
    /// Loads the configuration from `roost.yml` inside the given directory.
    ///
    /// A missing file yields the default configuration, so that a bare
    /// installation starts up without any writes.
    pub fn load(config_dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = config_dir.as_ref().join("roost.yml");

        let values = match fs::File::open(&path) {
            Ok(file) => serde_yaml::from_reader(io::BufReader::new(file)).map_err(|source| {
                ConfigError::BadYaml {
                    path: path.clone(),
                    source,
                }
            })?,
            Err(source) if source.kind() == io::ErrorKind::NotFound => ConfigValues::default(),
            Err(source) => return Err(ConfigError::CouldNotOpenFile { path, source }),
        };

        let config = Self {
            values,
            path: Some(path),
        };

        // Roost never owns a TLS context. A terminating proxy owns the
        // certificates and forwards plain TCP.
        if config.values.http.tls_listen_addr.is_some()
            || config.values.http.tls_identity_path.is_some()
        {
            return Err(ConfigError::TlsNotSupported);
        }

        Ok(config)
    }

    /// Creates a config programmatically, used by tests.
    pub fn from_values(http: HttpSettings, stream: StreamSettings, node: NodeSettings) -> Self {
        Self {
            values: ConfigValues {
                http,
                stream,
                node,
                logging: Default::default(),
                metrics: Default::default(),
            },
            path: None,
        }
    }

    /// The directory the configuration was loaded from, if any.
    pub fn config_dir(&self) -> Option<&Path> {
        self.path.as_deref().and_then(Path::parent)
    }

    /// Returns the listen address of the HTTP surface.
    pub fn listen_addr(&self) -> SocketAddr {
        self.values.http.listen_addr
    }

    /// Returns the TCP listen backlog.
    pub fn tcp_listen_backlog(&self) -> u32 {
        self.values.http.tcp_listen_backlog
    }

    /// Returns the TCP keep-alive time. Zero disables keep-alive probing.
    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.values.http.keepalive_timeout_secs)
    }

    /// Time budget for a client to transmit its request head.
    pub fn header_read_timeout(&self) -> Duration {
        Duration::from_secs(self.values.http.header_read_timeout_secs)
    }

    /// Receive timeout applied to a streaming socket after the handshake.
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_secs(self.values.stream.receive_timeout_secs)
    }

    /// Send timeout for the initial handshake response.
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.values.stream.send_timeout_secs)
    }

    /// Send timeout for in-band error tokens on an owned socket.
    pub fn error_send_timeout(&self) -> Duration {
        Duration::from_secs(self.values.stream.error_send_timeout_secs)
    }

    /// Minimum seconds between accepted streams, zero when disabled.
    pub fn streaming_rate_limit_secs(&self) -> i64 {
        self.values.stream.rate_limit_secs
    }

    /// Upper bound on registry hosts, zero when unlimited.
    pub fn max_hosts(&self) -> usize {
        self.values.stream.max_hosts
    }

    /// Default data collection interval for receivers, in seconds.
    pub fn default_update_every(&self) -> i64 {
        self.values.stream.default_update_every
    }

    /// Default history depth for new hosts.
    pub fn default_history(&self) -> usize {
        self.values.stream.default_history
    }

    /// Default memory mode for new hosts.
    pub fn default_memory_mode(&self) -> MemoryMode {
        self.values.stream.default_memory_mode
    }

    /// Default health setting for new hosts.
    pub fn default_health(&self) -> HealthSetting {
        self.values.stream.default_health
    }

    /// Path of the streaming credentials file.
    pub fn credentials_path(&self) -> PathBuf {
        match self.config_dir() {
            Some(dir) => dir.join(&self.values.stream.credentials_file),
            None => self.values.stream.credentials_file.clone(),
        }
    }

    /// The hostname this node reports for itself.
    pub fn hostname(&self) -> String {
        match &self.values.node.hostname {
            Some(hostname) => hostname.clone(),
            None => std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_owned()),
        }
    }

    /// The configured machine identity of this node, if any.
    ///
    /// Callers generate and hold a random identity when this is `None`; the
    /// value must stay stable for the lifetime of the process.
    pub fn machine_guid(&self) -> Option<Uuid> {
        self.values.node.machine_guid
    }

    /// Returns logging settings.
    pub fn logging(&self) -> &roost_log::LogConfig {
        &self.values.logging
    }

    /// Returns metrics settings.
    pub fn metrics(&self) -> &roost_statsd::MetricsConfig {
        &self.values.metrics
    }
}
