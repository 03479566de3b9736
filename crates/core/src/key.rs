// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Path-addressed record keys.
//!
//! Keys name one value in the synchronized tree using `/`-separated segments,
//! e.g. `users/alice/battles/-Nx3...`. Leading and trailing slashes are
//! stripped. Segments must be non-empty and may not contain `.`, `#`, `$`,
//! `[`, `]` or control characters.
//!
//! Prefix matching is segment-aware: `users/a` matches `users/a` and
//! `users/a/x`, never `users/ab`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Maximum encoded length of a key, in bytes.
pub const MAX_KEY_BYTES: usize = 768;

const FORBIDDEN: [char; 5] = ['.', '#', '$', '[', ']'];

/// Unique path identifying one value in the synchronized tree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordKey(String);

impl RecordKey {
    /// Parses and validates a key path.
    pub fn new(path: impl AsRef<str>) -> Result<Self> {
        let path = normalize(path.as_ref());
        if path.is_empty() {
            return Err(invalid(path, "key must not be empty"));
        }
        validate_path(path)?;
        Ok(RecordKey(path.to_string()))
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterates the `/`-separated segments of the key.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Returns a key one level deeper.
    pub fn child(&self, segment: &str) -> Result<RecordKey> {
        RecordKey::new(format!("{}/{}", self.0, segment))
    }

    /// Returns the parent key, or `None` for a top-level key.
    pub fn parent(&self) -> Option<RecordKey> {
        self.0.rsplit_once('/').map(|(parent, _)| RecordKey(parent.to_string()))
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RecordKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        RecordKey::new(s)
    }
}

impl TryFrom<String> for RecordKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        RecordKey::new(value)
    }
}

impl From<RecordKey> for String {
    fn from(key: RecordKey) -> Self {
        key.0
    }
}

/// A subtree selector: matches a key and every key beneath it.
///
/// The empty prefix ([`KeyPrefix::root`]) matches every key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyPrefix(String);

impl KeyPrefix {
    /// Parses and validates a prefix path. An empty path selects the root.
    pub fn new(path: impl AsRef<str>) -> Result<Self> {
        let path = normalize(path.as_ref());
        if !path.is_empty() {
            validate_path(path)?;
        }
        Ok(KeyPrefix(path.to_string()))
    }

    /// The prefix matching every key.
    pub fn root() -> Self {
        KeyPrefix(String::new())
    }

    /// Returns true if this is the root prefix.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the prefix as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if `key` is this path or lies beneath it.
    pub fn matches(&self, key: &RecordKey) -> bool {
        if self.is_root() {
            return true;
        }
        match key.as_str().strip_prefix(self.0.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Returns true if every key matched by `other` is also matched by `self`.
    pub fn covers(&self, other: &KeyPrefix) -> bool {
        if self.is_root() {
            return true;
        }
        match other.0.strip_prefix(self.0.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

impl fmt::Display for KeyPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            f.write_str("/")
        } else {
            f.write_str(&self.0)
        }
    }
}

impl FromStr for KeyPrefix {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        KeyPrefix::new(s)
    }
}

impl TryFrom<String> for KeyPrefix {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        KeyPrefix::new(value)
    }
}

impl From<KeyPrefix> for String {
    fn from(prefix: KeyPrefix) -> Self {
        prefix.0
    }
}

impl From<RecordKey> for KeyPrefix {
    fn from(key: RecordKey) -> Self {
        KeyPrefix(key.0)
    }
}

impl From<&RecordKey> for KeyPrefix {
    fn from(key: &RecordKey) -> Self {
        KeyPrefix(key.0.clone())
    }
}

fn normalize(path: &str) -> &str {
    path.trim_matches('/')
}

fn validate_path(path: &str) -> Result<()> {
    if path.len() > MAX_KEY_BYTES {
        return Err(invalid(path, &format!("longer than {MAX_KEY_BYTES} bytes")));
    }
    for segment in path.split('/') {
        if segment.is_empty() {
            return Err(invalid(path, "empty path segment"));
        }
        if let Some(c) = segment.chars().find(|c| FORBIDDEN.contains(c) || c.is_control()) {
            return Err(invalid(path, &format!("forbidden character {c:?}")));
        }
    }
    Ok(())
}

fn invalid(path: &str, reason: &str) -> Error {
    Error::InvalidKey { key: path.to_string(), reason: reason.to_string() }
}

#[cfg(test)]
#[path = "key_tests.rs"]
mod tests;
