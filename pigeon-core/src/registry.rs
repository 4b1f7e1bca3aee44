//! Registry store: username -> address bindings plus a reverse address index,
//! snapshotted to a JSON file. Mutation goes through `&mut self`, so the forward
//! map and reverse index can never be observed half-updated.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One registered identity: a unique username bound to a reachable address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub username: String,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub profile: BTreeMap<String, String>,
    pub last_seen: DateTime<Utc>,
}

impl IdentityRecord {
    /// `ip:port` key used by the reverse index.
    pub fn addr_key(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Supported query kinds. Parsed from the raw wire string so an unknown kind
/// becomes a protocol error rather than a deserialization failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    All,
    ByName,
    ByIp,
    Search,
}

impl QueryKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "all" => Some(QueryKind::All),
            "name" => Some(QueryKind::ByName),
            "ip" => Some(QueryKind::ByIp),
            "search" => Some(QueryKind::Search),
            _ => None,
        }
    }

    /// Name used on the wire (`query_type` field).
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::All => "all",
            QueryKind::ByName => "name",
            QueryKind::ByIp => "ip",
            QueryKind::Search => "search",
        }
    }
}

/// Registration failure. Username hijacking is the only rejected case; the rest
/// of the error surface is I/O on the snapshot, which the caller logs.
#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("username {0} is already taken by a different address")]
    UsernameTaken(String),
}

/// Error loading or saving the snapshot file.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// In-memory registry with its reverse index. The directory server wraps this
/// in a single mutex together with the snapshot write.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RegistryStore {
    users: BTreeMap<String, IdentityRecord>,
    ip_to_username: BTreeMap<String, String>,
}

impl RegistryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a snapshot. A missing file yields an empty store; a corrupt or
    /// unreadable file is an error the caller may downgrade to a warning.
    pub fn load(path: &Path) -> Result<Self, SnapshotError> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Write the snapshot: `{ "users": {...}, "ip_to_username": {...} }`.
    pub fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Register or update an identity. Re-registration from the same `ip:port`
    /// updates in place and refreshes `last_seen`; from a different address it
    /// fails, so a live binding cannot be hijacked.
    pub fn register(
        &mut self,
        username: &str,
        ip: &str,
        port: u16,
        profile: BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Result<(), RegisterError> {
        let addr_key = format!("{ip}:{port}");
        if let Some(existing) = self.users.get(username) {
            if existing.addr_key() != addr_key {
                return Err(RegisterError::UsernameTaken(username.to_string()));
            }
            // Same address: drop the old reverse entry before re-inserting.
            self.ip_to_username.remove(&existing.addr_key());
        }
        self.users.insert(
            username.to_string(),
            IdentityRecord {
                username: username.to_string(),
                ip: ip.to_string(),
                port,
                profile,
                last_seen: now,
            },
        );
        self.ip_to_username.insert(addr_key, username.to_string());
        Ok(())
    }

    /// Case-insensitive substring query over the registry.
    pub fn query(&self, kind: QueryKind, term: &str) -> Vec<IdentityRecord> {
        let term = term.to_lowercase();
        self.users
            .values()
            .filter(|u| match kind {
                QueryKind::All => true,
                QueryKind::ByName => u.username.to_lowercase().contains(&term),
                QueryKind::ByIp => u.ip.contains(&term),
                QueryKind::Search => {
                    u.username.to_lowercase().contains(&term) || u.ip.contains(&term)
                }
            })
            .cloned()
            .collect()
    }

    /// Reverse lookup: which username is bound to `ip:port`?
    pub fn username_for_addr(&self, addr_key: &str) -> Option<&str> {
        self.ip_to_username.get(addr_key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register(store: &mut RegistryStore, name: &str, ip: &str, port: u16) {
        store
            .register(name, ip, port, BTreeMap::new(), Utc::now())
            .unwrap();
    }

    #[test]
    fn fresh_registration_then_query_by_name() {
        let mut store = RegistryStore::new();
        register(&mut store, "alice", "127.0.0.1", 9001);
        let found = store.query(QueryKind::ByName, "alice");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].ip, "127.0.0.1");
        assert_eq!(found[0].port, 9001);
        assert_eq!(store.username_for_addr("127.0.0.1:9001"), Some("alice"));
    }

    #[test]
    fn reregister_different_address_fails() {
        let mut store = RegistryStore::new();
        register(&mut store, "alice", "127.0.0.1", 9001);
        let err = store
            .register("alice", "10.0.0.2", 9001, BTreeMap::new(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, RegisterError::UsernameTaken(_)));
        // The original binding is untouched.
        assert_eq!(store.username_for_addr("127.0.0.1:9001"), Some("alice"));
    }

    #[test]
    fn reregister_same_address_refreshes_last_seen() {
        let mut store = RegistryStore::new();
        let t0 = Utc::now();
        store
            .register("alice", "127.0.0.1", 9001, BTreeMap::new(), t0)
            .unwrap();
        let t1 = t0 + chrono::Duration::seconds(30);
        store
            .register("alice", "127.0.0.1", 9001, BTreeMap::new(), t1)
            .unwrap();
        let found = store.query(QueryKind::ByName, "alice");
        assert_eq!(found[0].last_seen, t1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn query_kinds_match_substrings_case_insensitively() {
        let mut store = RegistryStore::new();
        register(&mut store, "Alice", "127.0.0.1", 9001);
        register(&mut store, "bob", "10.0.0.2", 9002);

        assert_eq!(store.query(QueryKind::All, "").len(), 2);
        assert_eq!(store.query(QueryKind::ByName, "ALI").len(), 1);
        assert_eq!(store.query(QueryKind::ByIp, "10.0").len(), 1);
        // `search` matches either field.
        assert_eq!(store.query(QueryKind::Search, "alice").len(), 1);
        assert_eq!(store.query(QueryKind::Search, "127").len(), 1);
        assert!(store.query(QueryKind::ByName, "carol").is_empty());
    }

    #[test]
    fn query_kind_parsing() {
        assert_eq!(QueryKind::parse("all"), Some(QueryKind::All));
        assert_eq!(QueryKind::parse("name"), Some(QueryKind::ByName));
        assert_eq!(QueryKind::parse("ip"), Some(QueryKind::ByIp));
        assert_eq!(QueryKind::parse("search"), Some(QueryKind::Search));
        assert_eq!(QueryKind::parse("bogus"), None);
    }

    #[test]
    fn snapshot_roundtrip_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");

        // Missing file -> empty store.
        let empty = RegistryStore::load(&path).unwrap();
        assert!(empty.is_empty());

        let mut store = RegistryStore::new();
        register(&mut store, "alice", "127.0.0.1", 9001);
        store.save(&path).unwrap();

        let reloaded = RegistryStore::load(&path).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.query(QueryKind::ByName, "alice").len(), 1);
        assert_eq!(reloaded.username_for_addr("127.0.0.1:9001"), Some("alice"));
    }
}
