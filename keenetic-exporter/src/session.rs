//! Cookie session persistence.
//!
//! The router keeps its login state in cookies. A [`Session`] holds those
//! cookies between requests, and a [`SessionStore`] persists them so that a
//! restarted exporter can reuse an existing login.

use std::fmt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{trace, warn};

use crate::error::SessionError;

/// Cookie name to value mapping, iterated in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    cookies: Vec<(String, String)>,
}

impl Session {
    /// Create an empty session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a cookie value.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Set a cookie. An existing cookie keeps its position and gets the new value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.cookies.iter_mut().find(|(k, _)| *k == name) {
            Some(entry) => entry.1 = value,
            None => self.cookies.push((name, value)),
        }
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Iterate over `(name, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.cookies.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Render the session as a `Cookie` header value (`a=1; b=2`).
    ///
    /// Returns an empty string for an empty session.
    pub fn header_value(&self) -> String {
        self.cookies
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Merge cookies from `Set-Cookie` header values. New values win.
    pub fn apply_set_cookies<'a, I>(&mut self, headers: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        for header in headers {
            if let Some((name, value)) = parse_set_cookie(header) {
                self.insert(name, value);
            }
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Session {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut session = Session::new();
        for (k, v) in iter {
            session.insert(k, v);
        }
        session
    }
}

impl Serialize for Session {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.cookies.len()))?;
        for (k, v) in &self.cookies {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Session {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SessionVisitor;

        impl<'de> Visitor<'de> for SessionVisitor {
            type Value = Session;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of cookie names to string values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Session, A::Error> {
                let mut session = Session::new();
                while let Some((k, v)) = access.next_entry::<String, String>()? {
                    session.insert(k, v);
                }
                Ok(session)
            }
        }

        deserializer.deserialize_map(SessionVisitor)
    }
}

/// Parse the leading `name=value` pair of a `Set-Cookie` header.
///
/// Attributes after the first `;` are ignored. Returns `None` when either the
/// name or the value is empty.
pub fn parse_set_cookie(header: &str) -> Option<(String, String)> {
    let pair = header.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    let value = value.trim();
    if name.is_empty() || value.is_empty() {
        return None;
    }
    Some((name.to_string(), value.to_string()))
}

/// Persistent storage for the cookie session.
pub trait SessionStore: Send + Sync {
    /// Load the stored session. Never fails: a store with nothing saved, or
    /// with contents that cannot be read, yields an empty session.
    fn load(&self) -> Session;

    /// Replace the stored session.
    fn save(&self, session: &Session) -> Result<(), SessionError>;
}

/// Session store backed by a pretty-printed JSON file.
///
/// Saves go through a sibling `.tmp` file that is renamed over the target,
/// so an interrupted write never leaves a truncated session behind.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Session {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Session::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Unreadable session file, starting empty");
                return Session::new();
            }
        };

        match serde_json::from_str(&content) {
            Ok(session) => session,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Corrupt session file, starting empty");
                Session::new()
            }
        }
    }

    fn save(&self, session: &Session) -> Result<(), SessionError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(session)?;
        let temp = self.temp_path();
        std::fs::write(&temp, data)?;
        std::fs::rename(&temp, &self.path)?;
        trace!(path = %self.path.display(), cookies = session.len(), "Saved session");
        Ok(())
    }
}

/// In-process session store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    session: Mutex<Session>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Session {
        self.session.lock().clone()
    }

    fn save(&self, session: &Session) -> Result<(), SessionError> {
        *self.session.lock() = session.clone();
        Ok(())
    }
}
