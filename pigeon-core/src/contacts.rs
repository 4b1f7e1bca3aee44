//! Contact cache: locally remembered resolutions of username -> address.
//! Entries go stale after five minutes but are never auto-deleted; staleness
//! only means "re-query the directory before trusting this".

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::registry::IdentityRecord;

/// Age after which a cached contact must be re-resolved before use.
pub const STALE_AFTER: Duration = Duration::from_secs(300);

/// One cached contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactEntry {
    pub username: String,
    pub ip: String,
    pub port: u16,
    pub last_seen: DateTime<Utc>,
}

impl ContactEntry {
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match now.signed_duration_since(self.last_seen).to_std() {
            Ok(age) => age >= STALE_AFTER,
            // A last_seen in the future counts as fresh.
            Err(_) => false,
        }
    }
}

/// Per-node contact cache, persisted as a JSON map keyed by username.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ContactCache {
    contacts: BTreeMap<String, ContactEntry>,
}

impl ContactCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self, std::io::Error> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(std::io::Error::other)
    }

    pub fn save(&self, path: &Path) -> Result<(), std::io::Error> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let raw = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, raw)
    }

    /// Record an observation of a peer's address. Keeps the entry if the
    /// observation is older than what we already have.
    pub fn observe(&mut self, username: &str, ip: &str, port: u16, seen: DateTime<Utc>) {
        match self.contacts.get_mut(username) {
            Some(entry) if entry.last_seen > seen => {}
            Some(entry) => {
                entry.ip = ip.to_string();
                entry.port = port;
                entry.last_seen = seen;
            }
            None => {
                self.contacts.insert(
                    username.to_string(),
                    ContactEntry {
                        username: username.to_string(),
                        ip: ip.to_string(),
                        port,
                        last_seen: seen,
                    },
                );
            }
        }
    }

    /// Record a directory record (e.g. a query result).
    pub fn observe_record(&mut self, record: &IdentityRecord) {
        self.observe(&record.username, &record.ip, record.port, record.last_seen);
    }

    pub fn get(&self, username: &str) -> Option<&ContactEntry> {
        self.contacts.get(username)
    }

    /// Entry usable without a directory round-trip: present and not stale.
    pub fn get_fresh(&self, username: &str, now: DateTime<Utc>) -> Option<&ContactEntry> {
        self.contacts
            .get(username)
            .filter(|entry| !entry.is_stale(now))
    }

    pub fn remove(&mut self, username: &str) -> bool {
        self.contacts.remove(username).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContactEntry> {
        self.contacts.values()
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }
}
