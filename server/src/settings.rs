use std::{fs, path::Path, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use dbus_unix_common::{config::TransportConfig, sasl::AuthMechanism};
use serde::{Deserialize, Serialize};

/// Address used when nothing else is configured
pub const DEFAULT_ADDRESS: &str = "unix:path=/tmp/dbus-unix-echo";

/// Server configuration, loadable from a JSON file
///
/// ```json
/// {
///   "address": "unix:path=/tmp/bus",
///   "mechanisms": ["EXTERNAL", "DBUS_COOKIE_SHA1"],
///   "unix_fd": true
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// D-Bus address to listen on
    pub address:              String,
    /// Mechanisms offered to clients, in the order they are listed
    pub mechanisms:           Vec<AuthMechanism>,
    /// Agree to unix fd passing when asked
    pub unix_fd:              bool,
    /// Fixed server GUID; a random one is generated when absent
    pub guid:                 Option<String>,
    /// Rejected `AUTH` attempts tolerated per client
    pub max_auth_attempts:    u32,
    /// Per-line handshake timeout
    pub handshake_timeout_ms: u64,
    /// Largest frame accepted or sent
    pub max_message_size:     u32,
    /// Keyring directory for DBUS_COOKIE_SHA1
    pub keyring_dir:          Option<PathBuf>,
    /// Keyring context for DBUS_COOKIE_SHA1
    pub cookie_context:       Option<String>,
    /// Only accept peers running as our own user (or the sudo user)
    pub restrict_to_owner:    bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        let transport = TransportConfig::default();
        Self {
            address:              DEFAULT_ADDRESS.to_string(),
            mechanisms:           transport.mechanisms,
            unix_fd:              false,
            guid:                 None,
            max_auth_attempts:    transport.max_auth_attempts,
            handshake_timeout_ms: transport.handshake_timeout.as_millis() as u64,
            max_message_size:     transport.max_message_size,
            keyring_dir:          None,
            cookie_context:       None,
            restrict_to_owner:    true,
        }
    }
}

impl ServerSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load settings from a JSON file; missing keys keep their defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read server settings from {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse server settings in {}", path.display()))
    }

    /// Set the listening address
    pub fn with_address<S: Into<String>>(mut self, address: S) -> Self {
        self.address = address.into();
        self
    }

    /// Set the offered mechanisms
    pub fn with_mechanisms<I: IntoIterator<Item = AuthMechanism>>(mut self, mechanisms: I) -> Self {
        self.mechanisms = mechanisms.into_iter().collect();
        self
    }

    /// Enable or disable unix fd passing
    pub fn with_unix_fd(mut self, unix_fd: bool) -> Self {
        self.unix_fd = unix_fd;
        self
    }

    /// Use a fixed GUID
    pub fn with_guid<S: Into<String>>(mut self, guid: S) -> Self {
        self.guid = Some(guid.into());
        self
    }

    /// Set the cookie keyring directory
    pub fn with_keyring_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.keyring_dir = Some(dir.into());
        self
    }

    /// Set how many rejected attempts a client gets
    pub fn with_max_auth_attempts(mut self, attempts: u32) -> Self {
        self.max_auth_attempts = attempts;
        self
    }

    /// Transport settings for the SASL server role and frame codec
    pub fn transport_config(&self) -> TransportConfig {
        let mut config = TransportConfig::new()
            .with_mechanisms(self.mechanisms.iter().copied())
            .with_unix_fd_negotiation(self.unix_fd)
            .with_max_auth_attempts(self.max_auth_attempts)
            .with_handshake_timeout(Duration::from_millis(self.handshake_timeout_ms))
            .with_max_message_size(self.max_message_size);
        if let Some(dir) = &self.keyring_dir {
            config = config.with_keyring_dir(dir);
        }
        config
    }
}
