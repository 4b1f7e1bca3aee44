//! Shared per-node state: block/mute policy, conversation history, contact
//! cache, and the files they persist to. The node and its acceptor share one
//! `NodeState` behind an `Arc`; all file writes go through these helpers so
//! each store has a single writer.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use pigeon_core::{ContactCache, Direction, MessageHistory, PolicyState};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::Config;

/// On-disk profile: who this node is, where it last listened, and the policy
/// lists so they survive restarts.
#[derive(Debug, Serialize, Deserialize)]
pub struct Profile {
    pub username: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub policy: PolicyState,
}

pub struct NodeState {
    pub username: String,
    pub policy: Mutex<PolicyState>,
    pub history: Mutex<MessageHistory>,
    pub contacts: Mutex<ContactCache>,
    /// Last endpoint registered with the directory (host, port).
    pub endpoint: Mutex<(String, u16)>,
    profile_path: PathBuf,
    history_path: PathBuf,
    contacts_path: PathBuf,
}

impl NodeState {
    /// Load all per-user files for `username`. Missing files start empty.
    pub fn load(username: &str, cfg: &Config) -> std::io::Result<Self> {
        let profile_path = cfg.profile_path(username);
        let policy = match std::fs::read_to_string(&profile_path) {
            Ok(raw) => serde_json::from_str::<Profile>(&raw)
                .map(|p| p.policy)
                .map_err(std::io::Error::other)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PolicyState::new(),
            Err(e) => return Err(e),
        };
        let history = MessageHistory::load(&cfg.history_path(username))?;
        let contacts = ContactCache::load(&cfg.contacts_path(username))?;
        Ok(Self {
            username: username.to_string(),
            policy: Mutex::new(policy),
            history: Mutex::new(history),
            contacts: Mutex::new(contacts),
            endpoint: Mutex::new((String::new(), 0)),
            profile_path,
            history_path: cfg.history_path(username),
            contacts_path: cfg.contacts_path(username),
        })
    }

    /// Write the profile file. Best-effort: a failed write is logged, the
    /// in-memory state stays authoritative.
    pub async fn save_profile(&self) {
        let (host, port) = self.endpoint.lock().await.clone();
        let profile = Profile {
            username: self.username.clone(),
            host,
            port,
            policy: self.policy.lock().await.clone(),
        };
        let result = serde_json::to_string_pretty(&profile)
            .map_err(std::io::Error::other)
            .and_then(|raw| {
                if let Some(dir) = self.profile_path.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                std::fs::write(&self.profile_path, raw)
            });
        if let Err(e) = result {
            tracing::warn!(path = %self.profile_path.display(), error = %e, "profile save failed");
        }
    }

    /// Append one message to the conversation with `peer` and persist.
    /// This is the only place the history file is written.
    pub async fn record_message(
        &self,
        peer: &str,
        direction: Direction,
        content: &str,
        timestamp: DateTime<Utc>,
    ) {
        let mut history = self.history.lock().await;
        history.append(peer, direction, content, timestamp);
        if let Err(e) = history.save(&self.history_path) {
            tracing::warn!(path = %self.history_path.display(), error = %e, "history save failed");
        }
    }

    /// Record an address observation for `peer` and persist the cache.
    pub async fn observe_contact(&self, peer: &str, ip: &str, port: u16, seen: DateTime<Utc>) {
        let mut contacts = self.contacts.lock().await;
        contacts.observe(peer, ip, port, seen);
        if let Err(e) = contacts.save(&self.contacts_path) {
            tracing::warn!(path = %self.contacts_path.display(), error = %e, "contact save failed");
        }
    }

    /// Persist the contact cache after an in-place mutation.
    pub async fn save_contacts(&self) {
        let contacts = self.contacts.lock().await;
        if let Err(e) = contacts.save(&self.contacts_path) {
            tracing::warn!(path = %self.contacts_path.display(), error = %e, "contact save failed");
        }
    }
}
