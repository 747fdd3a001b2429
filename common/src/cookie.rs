//! Cookie keyring backing the DBUS_COOKIE_SHA1 mechanism.
//!
//! A keyring is a directory (normally `~/.dbus-keyrings`) with one file per
//! context. Each line of a context file is `<id> <unix-timestamp> <cookie>`.
//! The server side adds cookies, both sides look them up by id.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufRead, BufReader, Write},
    os::unix::fs::{DirBuilderExt, OpenOptionsExt},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use rand::RngCore;
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

/// Context used when the server does not pick another one
pub const DEFAULT_CONTEXT: &str = "org_freedesktop_general";

/// Cookies older than this are ignored and expired from the file
const EXPIRE_AFTER_SECS: i64 = 7 * 60;
/// Cookies dated further than this in the future are ignored
const MAX_TIME_TRAVEL_SECS: i64 = 5 * 60;
/// A cookie younger than this is reused instead of creating a new one
const REUSE_WITHIN_SECS: i64 = 5 * 60;

const LOCK_TIMEOUT: Duration = Duration::from_secs(1);
const LOCK_RETRY: Duration = Duration::from_millis(10);

/// One line of a keyring context file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieEntry {
    pub id:        u64,
    pub timestamp: i64,
    pub cookie:    String,
}

impl CookieEntry {
    fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let id = parts.next()?.parse().ok()?;
        let timestamp = parts.next()?.parse().ok()?;
        let cookie = parts.next()?.to_string();
        Some(Self {
            id,
            timestamp,
            cookie,
        })
    }

    fn is_usable(&self, now: i64) -> bool {
        self.timestamp >= 0
            && self.timestamp <= now + MAX_TIME_TRAVEL_SECS
            && self.timestamp >= now - EXPIRE_AFTER_SECS
    }
}

/// Reject context names that could escape the keyring directory
pub fn validate_context(context: &str) -> Result<()> {
    if context.is_empty() {
        return Err(Error::protocol("cookie context is empty"));
    }
    if context
        .chars()
        .any(|c| c == '/' || c == '\\' || c == '.' || c.is_whitespace() || c.is_control())
    {
        return Err(Error::protocol(format!(
            "cookie context '{context}' contains invalid characters"
        )));
    }
    Ok(())
}

/// `count` random bytes, hex encoded
pub fn random_hex(count: usize) -> String {
    let mut bytes = vec![0u8; count];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Hex SHA-1 of `server_challenge:client_challenge:cookie`
pub fn response_hash(server_challenge: &str, client_challenge: &str, cookie: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(server_challenge.as_bytes());
    hasher.update(b":");
    hasher.update(client_challenge.as_bytes());
    hasher.update(b":");
    hasher.update(cookie.as_bytes());
    hex::encode(hasher.finalize())
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Directory of cookie context files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyring {
    dir: PathBuf,
}

impl Keyring {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn context_path(&self, context: &str) -> PathBuf {
        self.dir.join(context)
    }

    fn read_entries(&self, context: &str) -> Result<Vec<CookieEntry>> {
        let file = match File::open(self.context_path(context)) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            match CookieEntry::parse(&line) {
                Some(entry) => entries.push(entry),
                None => tracing::trace!("Skipping malformed keyring line in {}", context),
            }
        }
        Ok(entries)
    }

    /// Look up a usable cookie by id
    pub fn find_cookie(&self, context: &str, id: u64) -> Result<Option<String>> {
        validate_context(context)?;
        let now = unix_now();
        Ok(self
            .read_entries(context)?
            .into_iter()
            .find(|e| e.id == id && e.is_usable(now))
            .map(|e| e.cookie))
    }

    /// Return a recent cookie for `context`, adding a new one if none is
    /// young enough. Expired lines are dropped when the file is rewritten.
    pub fn current_cookie(&self, context: &str) -> Result<CookieEntry> {
        validate_context(context)?;
        self.ensure_dir()?;
        let _lock = KeyringLock::acquire(&self.dir, context)?;

        let now = unix_now();
        let mut entries: Vec<CookieEntry> = self
            .read_entries(context)?
            .into_iter()
            .filter(|e| e.is_usable(now))
            .collect();

        if let Some(recent) = entries
            .iter()
            .filter(|e| e.timestamp <= now && now - e.timestamp < REUSE_WITHIN_SECS)
            .max_by_key(|e| e.timestamp)
        {
            return Ok(recent.clone());
        }

        let next_id = entries.iter().map(|e| e.id).max().unwrap_or(0).checked_add(1);
        let id = match next_id {
            Some(id) => id,
            None => {
                tracing::warn!(
                    "Cookie ids in keyring context {} are exhausted, starting a fresh keyring",
                    context
                );
                entries.clear();
                1
            }
        };
        let entry = CookieEntry {
            id,
            timestamp: now,
            cookie:    random_hex(24),
        };
        entries.push(entry.clone());
        self.write_entries(context, &entries)?;

        tracing::debug!(
            "Added cookie {} to keyring context {} in {}",
            entry.id,
            context,
            self.dir.display()
        );
        Ok(entry)
    }

    fn ensure_dir(&self) -> Result<()> {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&self.dir)?;
        Ok(())
    }

    fn write_entries(&self, context: &str, entries: &[CookieEntry]) -> Result<()> {
        let temp = self.dir.join(format!("{context}.temp"));
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&temp)?;
            for e in entries {
                writeln!(file, "{} {} {}", e.id, e.timestamp, e.cookie)?;
            }
            file.sync_all()?;
        }
        fs::rename(&temp, self.context_path(context))?;
        Ok(())
    }
}

/// `<context>.lock` file held while the context file is rewritten
struct KeyringLock {
    path: PathBuf,
}

impl KeyringLock {
    fn acquire(dir: &Path, context: &str) -> Result<Self> {
        let path = dir.join(format!("{context}.lock"));
        let start = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).mode(0o600).open(&path) {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if start.elapsed() >= LOCK_TIMEOUT {
                        // holder died without cleaning up
                        tracing::warn!("Breaking stale keyring lock {}", path.display());
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    thread::sleep(LOCK_RETRY);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for KeyringLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!("Failed to remove keyring lock {}: {}", self.path.display(), e);
        }
    }
}
