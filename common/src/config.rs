use std::{env, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::sasl::AuthMechanism;

/// Well-known location of the system bus socket
pub const SYSTEM_BUS_SOCKET: &str = "/run/dbus/system_bus_socket";

/// Protocol limit for a whole message (128 MiB)
pub const MAX_MESSAGE_SIZE: u32 = 134_217_728;

/// Protocol limit for a single array, including the header field array (64 MiB)
pub const MAX_ARRAY_SIZE: u32 = 67_108_864;

const HANDSHAKE_TIMEOUT_ENV: &str = "DBUS_UNIX_HANDSHAKE_TIMEOUT_MS";
const MAX_AUTH_ATTEMPTS_ENV: &str = "DBUS_UNIX_MAX_AUTH_ATTEMPTS";
const MAX_MESSAGE_SIZE_ENV: &str = "DBUS_UNIX_MAX_MESSAGE_SIZE";
const KEYRING_DIR_ENV: &str = "DBUS_UNIX_KEYRING_DIR";

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_AUTH_ATTEMPTS: u32 = 3;
const KEYRING_SUBDIR: &str = ".dbus-keyrings";

/// Default keyring directory used by the DBUS_COOKIE_SHA1 mechanism
pub fn default_keyring_dir() -> PathBuf {
    if let Ok(dir) = env::var(KEYRING_DIR_ENV) {
        return PathBuf::from(dir);
    }
    env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(KEYRING_SUBDIR)
}

/// Settings shared by the client and server ends of a transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Upper bound for every handshake round trip; zero disables it
    pub handshake_timeout: Duration,
    /// How many `AUTH` attempts may be made before giving up
    pub max_auth_attempts: u32,
    /// Largest frame accepted or produced, in bytes
    pub max_message_size:  u32,
    /// Mechanisms to try, in order of preference
    pub mechanisms:        Vec<AuthMechanism>,
    /// Ask the server for unix file descriptor passing after `OK`
    pub negotiate_unix_fd: bool,
    /// UID to claim for EXTERNAL and DBUS_COOKIE_SHA1, defaults to our own
    pub sasl_uid:          Option<u32>,
    /// Where DBUS_COOKIE_SHA1 cookies are kept
    pub keyring_dir:       PathBuf,
    /// Optional timeout for writing a frame once ready
    pub write_timeout:     Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_auth_attempts: DEFAULT_MAX_AUTH_ATTEMPTS,
            max_message_size:  MAX_MESSAGE_SIZE,
            mechanisms:        vec![AuthMechanism::External],
            negotiate_unix_fd: false,
            sasl_uid:          None,
            keyring_dir:       default_keyring_dir(),
            write_timeout:     None,
        }
    }
}

impl TransportConfig {
    /// Creates a transport configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables
    ///
    /// Reads DBUS_UNIX_HANDSHAKE_TIMEOUT_MS, DBUS_UNIX_MAX_AUTH_ATTEMPTS,
    /// DBUS_UNIX_MAX_MESSAGE_SIZE and DBUS_UNIX_KEYRING_DIR. Unparsable
    /// values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::new();

        match env_number::<u64>(HANDSHAKE_TIMEOUT_ENV) {
            Some(0) => tracing::warn!(
                "Ignoring {}=0: the handshake timeout must be positive",
                HANDSHAKE_TIMEOUT_ENV
            ),
            Some(ms) => config.handshake_timeout = Duration::from_millis(ms),
            None => {}
        }
        if let Some(attempts) = env_number::<u32>(MAX_AUTH_ATTEMPTS_ENV) {
            config.max_auth_attempts = attempts;
        }
        if let Some(size) = env_number::<u32>(MAX_MESSAGE_SIZE_ENV) {
            config.max_message_size = size.min(MAX_MESSAGE_SIZE);
        }

        config
    }

    /// Set the handshake timeout; `Duration::ZERO` means no timeout
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Socket timeout to apply during the handshake, `None` when disabled
    pub fn handshake_deadline(&self) -> Option<Duration> {
        Some(self.handshake_timeout).filter(|t| !t.is_zero())
    }

    /// Set the number of authentication attempts
    pub fn with_max_auth_attempts(mut self, attempts: u32) -> Self {
        self.max_auth_attempts = attempts;
        self
    }

    /// Set the largest frame size, capped at the protocol limit
    pub fn with_max_message_size(mut self, size: u32) -> Self {
        self.max_message_size = size.min(MAX_MESSAGE_SIZE);
        self
    }

    /// Use a single mechanism
    pub fn with_mechanism(mut self, mechanism: AuthMechanism) -> Self {
        self.mechanisms = vec![mechanism];
        self
    }

    /// Set the ordered list of mechanisms to try
    pub fn with_mechanisms<I: IntoIterator<Item = AuthMechanism>>(mut self, mechanisms: I) -> Self {
        self.mechanisms = mechanisms.into_iter().collect();
        self
    }

    /// Enable or disable unix fd negotiation
    pub fn with_unix_fd_negotiation(mut self, negotiate: bool) -> Self {
        self.negotiate_unix_fd = negotiate;
        self
    }

    /// Claim a specific UID during authentication
    pub fn with_sasl_uid(mut self, uid: u32) -> Self {
        self.sasl_uid = Some(uid);
        self
    }

    /// Set the cookie keyring directory
    pub fn with_keyring_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.keyring_dir = dir.into();
        self
    }

    /// Set a write timeout for ready connections
    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// UID to claim during authentication
    pub fn effective_uid(&self) -> u32 {
        // SAFETY: getuid() is always safe to call - it simply returns the real
        // user ID of the calling process
        self.sasl_uid.unwrap_or_else(|| unsafe { libc::getuid() })
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring {}={:?}: not a valid number", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_conservative() {
        let config = TransportConfig::default();
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.max_auth_attempts, 3);
        assert_eq!(config.max_message_size, MAX_MESSAGE_SIZE);
        assert_eq!(config.mechanisms, vec![AuthMechanism::External]);
        assert!(!config.negotiate_unix_fd);
    }

    #[test]
    fn builder_caps_message_size() {
        let config = TransportConfig::new()
            .with_max_message_size(u32::MAX)
            .with_mechanisms([AuthMechanism::Anonymous, AuthMechanism::External])
            .with_sasl_uid(1000);
        assert_eq!(config.max_message_size, MAX_MESSAGE_SIZE);
        assert_eq!(config.mechanisms[0], AuthMechanism::Anonymous);
        assert_eq!(config.effective_uid(), 1000);
    }

    #[test]
    fn zero_handshake_timeout_disables_it() {
        let config = TransportConfig::new().with_handshake_timeout(Duration::ZERO);
        assert_eq!(config.handshake_deadline(), None);
        let config = TransportConfig::new().with_handshake_timeout(Duration::from_millis(250));
        assert_eq!(config.handshake_deadline(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn zero_handshake_timeout_from_env_is_ignored() {
        env::set_var(HANDSHAKE_TIMEOUT_ENV, "0");
        let config = TransportConfig::from_env();
        env::remove_var(HANDSHAKE_TIMEOUT_ENV);
        assert_eq!(config.handshake_timeout, DEFAULT_HANDSHAKE_TIMEOUT);
    }

    #[test]
    fn deserializes_partial_json() {
        let config: TransportConfig =
            serde_json::from_str(r#"{"max_auth_attempts": 5, "mechanisms": ["ANONYMOUS"]}"#)
                .unwrap();
        assert_eq!(config.max_auth_attempts, 5);
        assert_eq!(config.mechanisms, vec![AuthMechanism::Anonymous]);
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
    }
}
