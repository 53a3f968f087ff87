use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::acl::IpAcl;
use crate::config::{Config, ConfigError};

/// How samples of a hosted child are kept in memory.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MemoryMode {
    /// The tiered storage engine.
    #[default]
    Dbengine,
    /// Round-robin in memory, lost on restart.
    Ram,
    /// Metadata only, samples are discarded.
    None,
}

impl MemoryMode {
    /// Returns the mode name as written in configuration files.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Dbengine => "dbengine",
            Self::Ram => "ram",
            Self::None => "none",
        }
    }
}

/// Three-valued health toggle for hosted children.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthSetting {
    /// Health is disabled.
    Off,
    /// Health is enabled.
    On,
    /// Health follows the child: enabled once the child has connected long
    /// enough to have fresh data.
    #[default]
    Auto,
}

impl HealthSetting {
    /// Returns `true` unless health is explicitly off.
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Off)
    }
}

/// Forwarding of accepted children to the next parent.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ForwardConfig {
    /// Enables forwarding of this child upstream.
    pub enabled: bool,
    /// Space-separated list of upstream parents to try in order.
    pub parents: String,
    /// The API key to present upstream.
    pub api_key: String,
    /// Pattern of chart names to forward.
    pub charts_matching: String,
}

impl ForwardConfig {
    /// Forwarding is effective only with a destination and a key.
    pub fn is_effective(&self) -> bool {
        self.enabled && !self.parents.is_empty() && !self.api_key.is_empty()
    }
}

/// Replication of historical data for accepted children.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Enables replication.
    pub enabled: bool,
    /// How far back to replicate, in seconds.
    pub period: i64,
    /// Replication step, in seconds.
    pub step: i64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            period: 86400,
            step: 600,
        }
    }
}

/// The resolved per-session configuration of one receiver.
///
/// This is the snapshot taken when a connection is accepted; later edits of
/// the credential file do not affect running sessions.
#[derive(Clone, Debug, PartialEq)]
pub struct ReceiverConfig {
    pub update_every: i64,
    pub history: usize,
    pub memory_mode: MemoryMode,
    pub health: HealthSetting,
    pub forward: ForwardConfig,
    pub replication: ReplicationConfig,
    pub ephemeral: bool,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            update_every: 1,
            history: 3600,
            memory_mode: MemoryMode::default(),
            health: HealthSetting::default(),
            forward: ForwardConfig::default(),
            replication: ReplicationConfig::default(),
            ephemeral: false,
        }
    }
}

/// The kind of a credential section.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CredentialKind {
    /// A streaming credential shared by any number of children.
    Api,
    /// The identity of one specific child node.
    Machine,
}

/// Per-receiver values a credential section may override.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ReceiverOverrides {
    pub update_every: Option<i64>,
    pub history: Option<usize>,
    pub memory_mode: Option<MemoryMode>,
    pub health: Option<HealthSetting>,
    pub forward: Option<ForwardConfig>,
    pub replication: Option<ReplicationConfig>,
    pub ephemeral: Option<bool>,
}

impl ReceiverOverrides {
    fn apply(&self, config: &mut ReceiverConfig) {
        if let Some(update_every) = self.update_every {
            config.update_every = update_every;
        }
        if let Some(history) = self.history {
            config.history = history;
        }
        if let Some(memory_mode) = self.memory_mode {
            config.memory_mode = memory_mode;
        }
        if let Some(health) = self.health {
            config.health = health;
        }
        if let Some(forward) = &self.forward {
            config.forward = forward.clone();
        }
        if let Some(replication) = self.replication {
            config.replication = replication;
        }
        if let Some(ephemeral) = self.ephemeral {
            config.ephemeral = ephemeral;
        }
    }
}

/// One section of the credentials file.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CredentialSection {
    /// Whether this section describes an API key or a machine identity.
    #[serde(rename = "type")]
    pub kind: CredentialKind,

    /// Whether this credential may stream.
    ///
    /// When absent, API keys are disabled and machine identities are enabled.
    #[serde(default)]
    pub enabled: Option<bool>,

    /// Peer addresses this credential may stream from.
    #[serde(default)]
    pub allow_from: Option<IpAcl>,

    /// Receiver values applied to sessions using this credential.
    #[serde(flatten)]
    pub overrides: ReceiverOverrides,
}

/// The streaming credentials, keyed by API key or machine identity.
///
/// This is the `stream.yml` document. Lookups never fail: an identity without
/// a section gets the built-in defaults for its kind.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(transparent)]
pub struct StreamCredentials {
    sections: HashMap<Uuid, CredentialSection>,
}

impl StreamCredentials {
    /// Loads the credentials file referenced by the given config.
    ///
    /// A missing file yields an empty credential set, which rejects every API
    /// key.
    pub fn load(config: &Config) -> Result<Self, ConfigError> {
        let path = config.credentials_path();
        Self::load_path(&path)
    }

    fn load_path(path: &Path) -> Result<Self, ConfigError> {
        match fs::File::open(path) {
            Ok(file) => serde_yaml::from_reader(io::BufReader::new(file)).map_err(|source| {
                ConfigError::BadYaml {
                    path: path.to_owned(),
                    source,
                }
            }),
            Err(source) if source.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::CouldNotOpenFile {
                path: path.to_owned(),
                source,
            }),
        }
    }

    /// Inserts a section, used by tests and the admin surface.
    pub fn insert(&mut self, id: Uuid, section: CredentialSection) {
        self.sections.insert(id, section);
    }

    /// Returns `true` if the identity is configured with the given kind.
    ///
    /// Machine identities do not need to be listed: an absent section counts
    /// as kind `machine`, so that unknown children can connect with a valid
    /// API key. API keys must be listed explicitly.
    pub fn is_kind(&self, id: &Uuid, kind: CredentialKind) -> bool {
        match self.sections.get(id) {
            Some(section) => section.kind == kind,
            None => kind == CredentialKind::Machine,
        }
    }

    /// Returns whether the identity may stream.
    ///
    /// `default` applies when the section does not carry an explicit flag:
    /// `false` for API keys, `true` for machine identities.
    pub fn is_enabled(&self, id: &Uuid, default: bool) -> bool {
        self.sections
            .get(id)
            .and_then(|section| section.enabled)
            .unwrap_or(default)
    }

    /// Returns whether the identity accepts streams from the given peer.
    pub fn allows_client(&self, id: &Uuid, client_ip: &str) -> bool {
        match self.sections.get(id).and_then(|s| s.allow_from.as_ref()) {
            Some(acl) => acl.is_allowed(client_ip),
            None => true,
        }
    }

    /// Resolves the receiver configuration for a session.
    ///
    /// Values layer in order: the built-in `base`, then the API key section,
    /// then the machine identity section. The machine section wins, so a
    /// specific child can deviate from its key's fleet-wide settings.
    pub fn receiver_config(
        &self,
        base: ReceiverConfig,
        api_key: &Uuid,
        machine_guid: &Uuid,
    ) -> ReceiverConfig {
        let mut config = base;

        if let Some(section) = self.sections.get(api_key) {
            section.overrides.apply(&mut config);
        }

        if let Some(section) = self.sections.get(machine_guid) {
            section.overrides.apply(&mut config);
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_key() -> Uuid {
        "11111111-2222-3333-4444-555555555555".parse().unwrap()
    }

    fn machine() -> Uuid {
        "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee".parse().unwrap()
    }

    fn credentials(yaml: &str) -> StreamCredentials {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn unknown_machine_is_kind_machine() {
        let creds = StreamCredentials::default();
        assert!(creds.is_kind(&machine(), CredentialKind::Machine));
        assert!(!creds.is_kind(&machine(), CredentialKind::Api));
    }

    #[test]
    fn unknown_api_key_is_rejected() {
        let creds = StreamCredentials::default();
        assert!(!creds.is_kind(&api_key(), CredentialKind::Api));
    }

    #[test]
    fn api_keys_are_disabled_by_default() {
        let creds = credentials(
            r#"
"11111111-2222-3333-4444-555555555555":
  type: api
"#,
        );

        assert!(creds.is_kind(&api_key(), CredentialKind::Api));
        assert!(!creds.is_enabled(&api_key(), false));
    }

    #[test]
    fn machines_are_enabled_by_default() {
        let creds = StreamCredentials::default();
        assert!(creds.is_enabled(&machine(), true));
    }

    #[test]
    fn acl_applies_per_section() {
        let creds = credentials(
            r#"
"11111111-2222-3333-4444-555555555555":
  type: api
  enabled: true
  allow_from: "10.* !*"
"#,
        );

        assert!(creds.allows_client(&api_key(), "10.1.2.3"));
        assert!(!creds.allows_client(&api_key(), "192.168.0.1"));
        // No section, no restriction.
        assert!(creds.allows_client(&machine(), "192.168.0.1"));
    }

    #[test]
    fn machine_overrides_win_over_api_key() {
        let creds = credentials(
            r#"
"11111111-2222-3333-4444-555555555555":
  type: api
  enabled: true
  update_every: 5
  ephemeral: true
"aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee":
  type: machine
  update_every: 2
"#,
        );

        let config = creds.receiver_config(ReceiverConfig::default(), &api_key(), &machine());
        assert_eq!(config.update_every, 2);
        assert!(config.ephemeral);
        assert_eq!(config.history, 3600);
    }

    #[test]
    fn mixed_up_identities_are_detectable() {
        let creds = credentials(
            r#"
"11111111-2222-3333-4444-555555555555":
  type: api
  enabled: true
"#,
        );

        // The API key used as a machine identity must not pass the machine
        // check.
        assert!(!creds.is_kind(&api_key(), CredentialKind::Machine));
    }
}
