//! SASL authentication handshake.
//!
//! The handshake is a line protocol run before any binary frame is
//! exchanged. The client opens with a single NUL byte, then both sides
//! trade CRLF terminated ASCII commands:
//!
//! ```text
//! client                         server
//!   \0 AUTH EXTERNAL 31303030  ->
//!                              <- OK 0123456789abcdef0123456789abcdef
//!   NEGOTIATE_UNIX_FD          ->      (optional)
//!                              <- AGREE_UNIX_FD | ERROR
//!   BEGIN                      ->
//! ```
//!
//! Both roles are explicit state machines over a [`BufRead`] / [`Write`]
//! pair so they can run against a socket or against an in-memory script.
//! The byte after `BEGIN` is the first byte of the first frame, so callers
//! must keep using the same buffered reader for frames afterwards.

use std::{
    fmt,
    io::{BufRead, Read, Write},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::{
    config::TransportConfig,
    cookie::{self, Keyring},
    error::{Error, Result},
};

/// Longest handshake line accepted, excluding CRLF
pub const MAX_LINE_LENGTH: usize = 16 * 1024;

/// Trace string sent with ANONYMOUS
const ANONYMOUS_TRACE: &str = "dbus-unix";

/// Authentication mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthMechanism {
    /// Credentials of the connecting process, checked by the kernel
    #[serde(rename = "EXTERNAL")]
    External,
    /// No authentication at all
    #[serde(rename = "ANONYMOUS")]
    Anonymous,
    /// Shared secret from the user's cookie keyring
    #[serde(rename = "DBUS_COOKIE_SHA1")]
    Cookie,
}

impl AuthMechanism {
    pub const ALL: [AuthMechanism; 3] = [
        AuthMechanism::External,
        AuthMechanism::Anonymous,
        AuthMechanism::Cookie,
    ];

    /// Name used on the wire
    pub fn name(self) -> &'static str {
        match self {
            AuthMechanism::External => "EXTERNAL",
            AuthMechanism::Anonymous => "ANONYMOUS",
            AuthMechanism::Cookie => "DBUS_COOKIE_SHA1",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.name() == name)
    }

    /// Hex-encoded initial response sent with `AUTH`
    pub fn initial_response(self, uid: u32) -> String {
        match self {
            AuthMechanism::External | AuthMechanism::Cookie => hex::encode(uid.to_string()),
            AuthMechanism::Anonymous => hex::encode(ANONYMOUS_TRACE),
        }
    }

    /// Produce the answer to a server `DATA` challenge
    pub fn respond(self, challenge: Option<&str>, keyring: &Keyring) -> Response {
        match self {
            AuthMechanism::External | AuthMechanism::Anonymous => match challenge {
                None => Response::Data(None),
                Some(_) => Response::Cancel,
            },
            AuthMechanism::Cookie => match challenge.map(|c| cookie_response(c, keyring)) {
                Some(Ok(answer)) => Response::Data(Some(answer)),
                Some(Err(e)) => {
                    tracing::debug!("Cannot answer cookie challenge: {}", e);
                    Response::Cancel
                }
                None => Response::Cancel,
            },
        }
    }
}

impl fmt::Display for AuthMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AuthMechanism {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s)
            .ok_or_else(|| Error::auth_failed(format!("unknown mechanism '{s}'")))
    }
}

/// What a mechanism does with a challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Send `DATA`, with the hex payload if any
    Data(Option<String>),
    /// Give up on this mechanism
    Cancel,
}

/// Client side of DBUS_COOKIE_SHA1: `context id server_challenge` in,
/// `client_challenge hash` out (both hex encoded on the wire)
fn cookie_response(challenge: &str, keyring: &Keyring) -> Result<String> {
    let decoded = decode_hex_text(challenge)?;
    let parts: Vec<&str> = decoded.split(' ').collect();
    let [context, id, server_challenge] = parts.as_slice() else {
        return Err(Error::protocol("cookie challenge must have three parts"));
    };
    cookie::validate_context(context)?;
    let id: u64 = id
        .parse()
        .map_err(|_| Error::protocol(format!("cookie id '{id}' is not a number")))?;

    let secret = keyring
        .find_cookie(context, id)?
        .ok_or_else(|| Error::auth_failed(format!("no cookie {id} in context {context}")))?;

    let client_challenge = cookie::random_hex(16);
    let hash = cookie::response_hash(server_challenge, &client_challenge, &secret);
    Ok(hex::encode(format!("{client_challenge} {hash}")))
}

fn decode_hex_text(data: &str) -> Result<String> {
    let bytes = hex::decode(data).map_err(|e| Error::protocol(format!("bad hex data: {e}")))?;
    String::from_utf8(bytes).map_err(|_| Error::protocol("hex data is not UTF-8"))
}

/// One handshake line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Auth {
        mechanism:        Option<String>,
        initial_response: Option<String>,
    },
    Cancel,
    Begin,
    Data(Option<String>),
    Error(Option<String>),
    NegotiateUnixFd,
    AgreeUnixFd,
    Ok(String),
    Rejected(Vec<String>),
    Unknown(String),
}

impl Command {
    /// Parse a line without its CRLF. Empty arguments count as absent, so
    /// `DATA ` carries no data and `AUTH ` names no mechanism.
    pub fn parse(line: &str) -> Self {
        let (word, rest) = match line.split_once(' ') {
            Some((word, rest)) => (word, Some(rest.trim())),
            None => (line, None),
        };
        let rest = rest.filter(|r| !r.is_empty());

        match word {
            "AUTH" => {
                let mut parts = rest.unwrap_or("").split_whitespace();
                Command::Auth {
                    mechanism:        parts.next().map(str::to_string),
                    initial_response: parts.next().map(str::to_string),
                }
            }
            "CANCEL" => Command::Cancel,
            "BEGIN" => Command::Begin,
            "DATA" => Command::Data(rest.map(str::to_string)),
            "ERROR" => Command::Error(rest.map(str::to_string)),
            "NEGOTIATE_UNIX_FD" => Command::NegotiateUnixFd,
            "AGREE_UNIX_FD" => Command::AgreeUnixFd,
            "OK" => Command::Ok(rest.unwrap_or("").to_string()),
            "REJECTED" => Command::Rejected(
                rest.unwrap_or("")
                    .split_whitespace()
                    .map(str::to_string)
                    .collect(),
            ),
            _ => Command::Unknown(line.to_string()),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn with_arg(f: &mut fmt::Formatter<'_>, word: &str, arg: Option<&str>) -> fmt::Result {
            match arg {
                Some(arg) => write!(f, "{word} {arg}"),
                None => f.write_str(word),
            }
        }

        match self {
            Command::Auth {
                mechanism,
                initial_response,
            } => {
                f.write_str("AUTH")?;
                if let Some(m) = mechanism {
                    write!(f, " {m}")?;
                    if let Some(r) = initial_response {
                        write!(f, " {r}")?;
                    }
                }
                Ok(())
            }
            Command::Cancel => f.write_str("CANCEL"),
            Command::Begin => f.write_str("BEGIN"),
            Command::Data(data) => with_arg(f, "DATA", data.as_deref()),
            Command::Error(msg) => with_arg(f, "ERROR", msg.as_deref()),
            Command::NegotiateUnixFd => f.write_str("NEGOTIATE_UNIX_FD"),
            Command::AgreeUnixFd => f.write_str("AGREE_UNIX_FD"),
            Command::Ok(guid) => write!(f, "OK {guid}"),
            Command::Rejected(mechs) => {
                f.write_str("REJECTED")?;
                for m in mechs {
                    write!(f, " {m}")?;
                }
                Ok(())
            }
            Command::Unknown(line) => f.write_str(line),
        }
    }
}

/// Read one CRLF terminated command
pub fn read_command<R: BufRead>(reader: &mut R) -> Result<Command> {
    let mut line = Vec::new();
    let limit = (MAX_LINE_LENGTH + 2) as u64;
    reader
        .by_ref()
        .take(limit)
        .read_until(b'\n', &mut line)
        .map_err(Error::from_handshake_io)?;

    if line.last() != Some(&b'\n') {
        if line.len() as u64 >= limit {
            return Err(Error::protocol(format!(
                "handshake line exceeds {MAX_LINE_LENGTH} bytes"
            )));
        }
        return Err(Error::Transport(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "peer closed the connection during authentication",
        )));
    }
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    if !line.is_ascii() {
        return Err(Error::protocol("handshake line is not ASCII"));
    }

    let text = String::from_utf8_lossy(&line);
    tracing::trace!("SASL <- {}", text);
    Ok(Command::parse(&text))
}

/// Write one command followed by CRLF
pub fn write_command<W: Write>(writer: &mut W, command: &Command) -> Result<()> {
    tracing::trace!("SASL -> {}", command);
    let line = format!("{command}\r\n");
    writer
        .write_all(line.as_bytes())
        .and_then(|_| writer.flush())
        .map_err(Error::from_handshake_io)
}

/// Outcome of a successful handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// GUID the server announced with `OK`
    pub guid:      String,
    /// Mechanism that succeeded
    pub mechanism: AuthMechanism,
    /// Whether unix fd passing was agreed on
    pub unix_fd:   bool,
}

fn is_valid_guid(guid: &str) -> bool {
    guid.len() == 32 && guid.bytes().all(|b| b.is_ascii_hexdigit())
}

#[derive(Debug)]
enum ClientState {
    WaitingForData(AuthMechanism),
    WaitingForReject,
    WaitingForAgreeUnixFd { guid: String, mechanism: AuthMechanism },
}

/// Client role of the handshake
#[derive(Debug, Clone)]
pub struct ClientAuth {
    mechanisms:        Vec<AuthMechanism>,
    max_auth_attempts: u32,
    negotiate_unix_fd: bool,
    uid:               u32,
    keyring:           Keyring,
}

impl ClientAuth {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            mechanisms:        config.mechanisms.clone(),
            max_auth_attempts: config.max_auth_attempts,
            negotiate_unix_fd: config.negotiate_unix_fd,
            uid:               config.effective_uid(),
            keyring:           Keyring::new(&config.keyring_dir),
        }
    }

    /// Run the client side until `BEGIN` has been sent
    pub fn authenticate<R: BufRead, W: Write>(&self, reader: &mut R, writer: &mut W) -> Result<Session> {
        if self.mechanisms.is_empty() {
            return Err(Error::auth_failed("no authentication mechanisms configured"));
        }

        writer.write_all(&[0]).map_err(Error::from_handshake_io)?;

        let mut tried: Vec<AuthMechanism> = Vec::new();
        let mut unexpected = 0u32;
        let mut state = self.start(self.mechanisms[0], &mut tried, writer)?;

        loop {
            let command = read_command(reader)?;
            state = match (state, command) {
                (ClientState::WaitingForData(mech), Command::Data(challenge)) => {
                    match mech.respond(challenge.as_deref(), &self.keyring) {
                        Response::Data(answer) => {
                            write_command(writer, &Command::Data(answer))?;
                            ClientState::WaitingForData(mech)
                        }
                        Response::Cancel => {
                            write_command(writer, &Command::Cancel)?;
                            ClientState::WaitingForReject
                        }
                    }
                }
                (ClientState::WaitingForData(mechanism), Command::Ok(guid)) => {
                    if !is_valid_guid(&guid) {
                        return Err(Error::protocol(format!("server sent invalid GUID '{guid}'")));
                    }
                    tracing::debug!("Server accepted {} (guid {})", mechanism, guid);
                    if self.negotiate_unix_fd {
                        write_command(writer, &Command::NegotiateUnixFd)?;
                        ClientState::WaitingForAgreeUnixFd { guid, mechanism }
                    } else {
                        return self.begin(writer, guid, mechanism, false);
                    }
                }
                (ClientState::WaitingForData(_), Command::Error(msg)) => {
                    tracing::debug!("Server reported error during auth: {:?}", msg);
                    write_command(writer, &Command::Cancel)?;
                    ClientState::WaitingForReject
                }
                (ClientState::WaitingForData(_) | ClientState::WaitingForReject, Command::Rejected(offered)) => {
                    tracing::debug!("Server rejected {:?}, offers {:?}", tried.last(), offered);
                    let next = self.next_mechanism(&tried, &offered).ok_or_else(|| {
                        Error::auth_failed(format!(
                            "server rejected every usable mechanism (offered: {})",
                            offered.join(" ")
                        ))
                    })?;
                    self.start(next, &mut tried, writer)?
                }
                (ClientState::WaitingForData(mech), other) => {
                    unexpected += 1;
                    if unexpected > self.max_auth_attempts {
                        return Err(Error::protocol(format!("unexpected handshake command '{other}'")));
                    }
                    write_command(writer, &Command::Error(Some("unexpected command".into())))?;
                    ClientState::WaitingForData(mech)
                }
                (ClientState::WaitingForReject, other) => {
                    return Err(Error::auth_failed(format!("expected REJECTED, got '{other}'")));
                }
                (ClientState::WaitingForAgreeUnixFd { guid, mechanism }, Command::AgreeUnixFd) => {
                    return self.begin(writer, guid, mechanism, true);
                }
                (ClientState::WaitingForAgreeUnixFd { guid, mechanism }, Command::Error(_)) => {
                    tracing::debug!("Server declined unix fd passing");
                    return self.begin(writer, guid, mechanism, false);
                }
                (ClientState::WaitingForAgreeUnixFd { .. }, other) => {
                    return Err(Error::protocol(format!(
                        "expected AGREE_UNIX_FD or ERROR, got '{other}'"
                    )));
                }
            };
        }
    }

    fn start<W: Write>(
        &self,
        mechanism: AuthMechanism,
        tried: &mut Vec<AuthMechanism>,
        writer: &mut W,
    ) -> Result<ClientState> {
        if tried.len() as u32 >= self.max_auth_attempts {
            return Err(Error::auth_failed(format!(
                "gave up after {} authentication attempts",
                tried.len()
            )));
        }
        tried.push(mechanism);
        tracing::debug!("Trying {} (attempt {})", mechanism, tried.len());
        write_command(
            writer,
            &Command::Auth {
                mechanism:        Some(mechanism.name().to_string()),
                initial_response: Some(mechanism.initial_response(self.uid)),
            },
        )?;
        Ok(ClientState::WaitingForData(mechanism))
    }

    fn next_mechanism(&self, tried: &[AuthMechanism], offered: &[String]) -> Option<AuthMechanism> {
        self.mechanisms.iter().copied().find(|m| {
            !tried.contains(m) && (offered.is_empty() || offered.iter().any(|o| o == m.name()))
        })
    }

    fn begin<W: Write>(
        &self,
        writer: &mut W,
        guid: String,
        mechanism: AuthMechanism,
        unix_fd: bool,
    ) -> Result<Session> {
        write_command(writer, &Command::Begin)?;
        Ok(Session {
            guid,
            mechanism,
            unix_fd,
        })
    }
}

#[derive(Debug)]
enum ServerState {
    WaitingForAuth,
    WaitingForExternalData,
    WaitingForCookieData { server_challenge: String, cookie: String },
    WaitingForBegin(AuthMechanism),
}

/// Server role of the handshake
#[derive(Debug, Clone)]
pub struct ServerAuth {
    guid:              String,
    mechanisms:        Vec<AuthMechanism>,
    max_auth_attempts: u32,
    unix_fd:           bool,
    keyring:           Keyring,
    context:           String,
}

impl ServerAuth {
    /// `guid` must be 32 hex characters
    pub fn new(guid: impl Into<String>, config: &TransportConfig) -> Result<Self> {
        let guid = guid.into();
        if !is_valid_guid(&guid) {
            return Err(Error::protocol(format!("'{guid}' is not a valid server GUID")));
        }
        Ok(Self {
            guid,
            mechanisms: config.mechanisms.clone(),
            max_auth_attempts: config.max_auth_attempts,
            unix_fd: config.negotiate_unix_fd,
            keyring: Keyring::new(&config.keyring_dir),
            context: cookie::DEFAULT_CONTEXT.to_string(),
        })
    }

    /// Change the keyring context used for cookie challenges
    pub fn with_cookie_context(mut self, context: impl Into<String>) -> Result<Self> {
        let context = context.into();
        cookie::validate_context(&context)?;
        self.context = context;
        Ok(self)
    }

    pub fn guid(&self) -> &str {
        &self.guid
    }

    fn rejected(&self) -> Command {
        Command::Rejected(self.mechanisms.iter().map(|m| m.name().to_string()).collect())
    }

    /// Run the server side until the client sends `BEGIN`. `peer_uid` is
    /// the kernel-reported UID of the client, if known.
    pub fn authenticate<R: BufRead, W: Write>(
        &self,
        reader: &mut R,
        writer: &mut W,
        peer_uid: Option<u32>,
    ) -> Result<Session> {
        let mut nul = [0u8; 1];
        reader.read_exact(&mut nul).map_err(Error::from_handshake_io)?;
        if nul[0] != 0 {
            return Err(Error::protocol("handshake must start with a NUL byte"));
        }

        // SAFETY: getuid() is always safe to call
        let expected_uid = peer_uid.unwrap_or_else(|| unsafe { libc::getuid() });
        let mut rejections = 0u32;
        let mut errors = 0u32;
        let mut state = ServerState::WaitingForAuth;

        loop {
            let command = read_command(reader)?;
            let (reply, next) = match (state, command) {
                (ServerState::WaitingForAuth, Command::Auth { mechanism, initial_response }) => {
                    self.on_auth(mechanism.as_deref(), initial_response.as_deref(), expected_uid)
                }
                (ServerState::WaitingForExternalData, Command::Data(data)) => {
                    match data {
                        None => self.accept(AuthMechanism::External),
                        Some(claim) => self.check_external(&claim, expected_uid),
                    }
                }
                (ServerState::WaitingForCookieData { server_challenge, cookie }, Command::Data(data)) => {
                    self.check_cookie(data.as_deref(), &server_challenge, &cookie)
                }
                (ServerState::WaitingForBegin(mechanism), Command::Begin) => {
                    return Ok(Session {
                        guid: self.guid.clone(),
                        mechanism,
                        unix_fd: false,
                    });
                }
                (ServerState::WaitingForBegin(mechanism), Command::NegotiateUnixFd) => {
                    return self.finish_with_unix_fd(reader, writer, mechanism);
                }
                (_, Command::Cancel | Command::Error(_)) => (self.rejected(), ServerState::WaitingForAuth),
                (state, other) => {
                    errors += 1;
                    if errors > self.max_auth_attempts {
                        return Err(Error::protocol(format!("unexpected handshake command '{other}'")));
                    }
                    (Command::Error(Some(format!("unexpected command in state {state:?}"))), state)
                }
            };

            if matches!(reply, Command::Rejected(_)) {
                rejections += 1;
                if rejections > self.max_auth_attempts {
                    write_command(writer, &reply)?;
                    return Err(Error::auth_failed(format!(
                        "client failed {} authentication attempts",
                        rejections
                    )));
                }
            }
            write_command(writer, &reply)?;
            state = next;
        }
    }

    fn accept(&self, mechanism: AuthMechanism) -> (Command, ServerState) {
        tracing::debug!("Accepted client via {}", mechanism);
        (Command::Ok(self.guid.clone()), ServerState::WaitingForBegin(mechanism))
    }

    fn on_auth(
        &self,
        mechanism: Option<&str>,
        initial_response: Option<&str>,
        expected_uid: u32,
    ) -> (Command, ServerState) {
        let Some(mechanism) = mechanism
            .and_then(AuthMechanism::from_name)
            .filter(|m| self.mechanisms.contains(m))
        else {
            return (self.rejected(), ServerState::WaitingForAuth);
        };

        match mechanism {
            AuthMechanism::Anonymous => self.accept(mechanism),
            AuthMechanism::External => match initial_response {
                Some(claim) => self.check_external(claim, expected_uid),
                None => (Command::Data(None), ServerState::WaitingForExternalData),
            },
            AuthMechanism::Cookie => self.issue_cookie_challenge(initial_response, expected_uid),
        }
    }

    fn claimed_uid(hex_claim: &str) -> Option<u32> {
        decode_hex_text(hex_claim).ok()?.parse().ok()
    }

    fn check_external(&self, claim: &str, expected_uid: u32) -> (Command, ServerState) {
        match Self::claimed_uid(claim) {
            Some(uid) if uid == expected_uid => self.accept(AuthMechanism::External),
            claimed => {
                tracing::warn!(
                    "EXTERNAL claim {:?} does not match peer uid {}",
                    claimed,
                    expected_uid
                );
                (self.rejected(), ServerState::WaitingForAuth)
            }
        }
    }

    fn issue_cookie_challenge(&self, claim: Option<&str>, expected_uid: u32) -> (Command, ServerState) {
        if claim.and_then(Self::claimed_uid) != Some(expected_uid) {
            tracing::warn!("DBUS_COOKIE_SHA1 claim does not match peer uid {}", expected_uid);
            return (self.rejected(), ServerState::WaitingForAuth);
        }

        let entry = match self.keyring.current_cookie(&self.context) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::error!(
                    "Cannot load cookie from {}: {}",
                    self.keyring.dir().display(),
                    e
                );
                return (self.rejected(), ServerState::WaitingForAuth);
            }
        };

        let server_challenge = cookie::random_hex(16);
        let challenge = format!("{} {} {}", self.context, entry.id, server_challenge);
        tracing::debug!("Sending cookie challenge for context {} id {}", self.context, entry.id);
        (
            Command::Data(Some(hex::encode(challenge))),
            ServerState::WaitingForCookieData {
                server_challenge,
                cookie: entry.cookie,
            },
        )
    }

    fn check_cookie(&self, data: Option<&str>, server_challenge: &str, cookie: &str) -> (Command, ServerState) {
        let answer = data.and_then(|d| decode_hex_text(d).ok());
        let verified = answer
            .as_deref()
            .and_then(|a| a.split_once(' '))
            .is_some_and(|(client_challenge, hash)| {
                cookie::response_hash(server_challenge, client_challenge, cookie) == hash
            });

        if verified {
            self.accept(AuthMechanism::Cookie)
        } else {
            tracing::warn!("DBUS_COOKIE_SHA1 response did not verify");
            (self.rejected(), ServerState::WaitingForAuth)
        }
    }

    fn finish_with_unix_fd<R: BufRead, W: Write>(
        &self,
        reader: &mut R,
        writer: &mut W,
        mechanism: AuthMechanism,
    ) -> Result<Session> {
        let agreed = self.unix_fd;
        if agreed {
            write_command(writer, &Command::AgreeUnixFd)?;
        } else {
            write_command(writer, &Command::Error(Some("unix fd passing not supported".into())))?;
        }

        match read_command(reader)? {
            Command::Begin => Ok(Session {
                guid: self.guid.clone(),
                mechanism,
                unix_fd: agreed,
            }),
            other => Err(Error::protocol(format!("expected BEGIN, got '{other}'"))),
        }
    }
}
