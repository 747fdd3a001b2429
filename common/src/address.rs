//! Socket endpoints and D-Bus address strings.
//!
//! A [`SocketAddress`] is what the connector actually dials. A
//! [`BusAddress`] is the textual form found in bus configuration, e.g.
//! `unix:path=/run/dbus/system_bus_socket` or
//! `unix:abstract=/tmp/dbus-XXXX,guid=...`.

use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Endpoint of a Unix domain socket
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketAddress {
    /// Socket bound to a filesystem path
    Path(PathBuf),
    /// Socket in the Linux abstract namespace (no leading NUL)
    Abstract(String),
}

impl SocketAddress {
    /// Create a filesystem socket address
    pub fn path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if path.as_os_str().is_empty() {
            return Err(Error::InvalidAddress("socket path is empty".into()));
        }
        Ok(SocketAddress::Path(path))
    }

    /// Create an abstract-namespace socket address
    pub fn abstract_name(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::InvalidAddress("abstract socket name is empty".into()));
        }
        if name.contains('\0') {
            return Err(Error::InvalidAddress(
                "abstract socket name contains a NUL byte".into(),
            ));
        }
        Ok(SocketAddress::Abstract(name))
    }

    /// Filesystem path, if this is a path address
    pub fn as_path(&self) -> Option<&Path> {
        match self {
            SocketAddress::Path(path) => Some(path),
            SocketAddress::Abstract(_) => None,
        }
    }

    /// Whether this address lives in the abstract namespace
    pub fn is_abstract(&self) -> bool {
        matches!(self, SocketAddress::Abstract(_))
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketAddress::Path(path) => write!(f, "unix:path={}", escape(&path.to_string_lossy())),
            SocketAddress::Abstract(name) => write!(f, "unix:abstract={}", escape(name)),
        }
    }
}

impl TryFrom<&BusAddress> for SocketAddress {
    type Error = Error;

    fn try_from(address: &BusAddress) -> Result<Self> {
        if let Some(path) = address.get("path") {
            SocketAddress::path(path)
        } else if let Some(name) = address.get("abstract") {
            SocketAddress::abstract_name(name)
        } else {
            Err(Error::InvalidAddress(format!(
                "unix address '{address}' has to specify 'path' or 'abstract'"
            )))
        }
    }
}

/// Parsed D-Bus address (`transport:key=value,...`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusAddress {
    transport:  String,
    parameters: BTreeMap<String, String>,
}

impl BusAddress {
    /// Parse a single address. Only the `unix` transport is accepted.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(Error::InvalidAddress("bus address is blank".into()));
        }

        let (transport, rest) = input
            .split_once(':')
            .ok_or_else(|| Error::InvalidAddress(format!("bus address is invalid: {input}")))?;
        let transport = transport.to_ascii_lowercase();
        if transport != "unix" {
            return Err(Error::InvalidAddress(format!(
                "unsupported transport type: {transport}"
            )));
        }

        let mut parameters = BTreeMap::new();
        for pair in rest.split(',').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                Error::InvalidAddress(format!("parameter '{pair}' is missing a value"))
            })?;
            if key.is_empty() {
                return Err(Error::InvalidAddress(format!("parameter '{pair}' has no key")));
            }
            parameters.insert(key.to_string(), unescape(value)?);
        }

        tracing::trace!("Parsed bus address {}: {:?}", input, parameters);

        Ok(Self {
            transport,
            parameters,
        })
    }

    /// Transport name, lower case
    pub fn transport(&self) -> &str {
        &self.transport
    }

    /// Look up a parameter value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    /// Server GUID if the address carries one
    pub fn guid(&self) -> Option<&str> {
        self.get("guid")
    }

    /// Whether this address describes a listening socket
    pub fn is_listening(&self) -> bool {
        self.parameters.contains_key("listen")
    }

    /// Return a copy flagged as a listening address
    pub fn listener_address(&self) -> Self {
        let mut copy = self.clone();
        copy.parameters
            .entry("listen".to_string())
            .or_insert_with(|| "true".to_string());
        copy
    }

    /// Resolve to the endpoint the connector dials
    pub fn socket_address(&self) -> Result<SocketAddress> {
        SocketAddress::try_from(self)
    }
}

impl FromStr for BusAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.transport)?;
        let mut first = true;
        for (key, value) in &self.parameters {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            write!(f, "{key}={}", escape(value))?;
        }
        Ok(())
    }
}

fn is_optionally_escaped(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'/' | b'.' | b'\\' | b'*')
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for &b in value.as_bytes() {
        if is_optionally_escaped(b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02x}"));
        }
    }
    out
}

fn unescape(value: &str) -> Result<String> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .ok_or_else(|| Error::InvalidAddress(format!("truncated escape in '{value}'")))?;
            let hex = std::str::from_utf8(hex)
                .ok()
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| Error::InvalidAddress(format!("bad escape in '{value}'")))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out)
        .map_err(|_| Error::InvalidAddress(format!("'{value}' is not valid UTF-8 once unescaped")))
}
