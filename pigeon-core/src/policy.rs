//! Block/mute policy. Blocks last until explicitly removed; mutes expire on
//! their own and are lazily cleared by the next check. The same decision gates
//! outbound dials and inbound handshakes.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of a policy check for one username.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Allowed,
    Blocked,
    Muted(DateTime<Utc>),
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct PolicyState {
    blocked: BTreeSet<String>,
    muted: BTreeMap<String, DateTime<Utc>>,
}

impl PolicyState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether interaction with `username` is allowed right now.
    /// An expired mute is removed here and reported as `Allowed`.
    pub fn check(&mut self, username: &str, now: DateTime<Utc>) -> PolicyDecision {
        if self.blocked.contains(username) {
            return PolicyDecision::Blocked;
        }
        if let Some(&expiry) = self.muted.get(username) {
            if now < expiry {
                return PolicyDecision::Muted(expiry);
            }
            self.muted.remove(username);
        }
        PolicyDecision::Allowed
    }

    pub fn block(&mut self, username: &str) -> bool {
        self.blocked.insert(username.to_string())
    }

    pub fn unblock(&mut self, username: &str) -> bool {
        self.blocked.remove(username)
    }

    pub fn is_blocked(&self, username: &str) -> bool {
        self.blocked.contains(username)
    }

    /// Mute `username` for `duration` from `now`. Re-muting replaces the
    /// expiry. An unrepresentable duration saturates to the far future.
    pub fn mute(&mut self, username: &str, duration: Duration, now: DateTime<Utc>) {
        let delta = chrono::Duration::from_std(duration).unwrap_or(chrono::TimeDelta::MAX);
        let expiry = now
            .checked_add_signed(delta)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.muted.insert(username.to_string(), expiry);
    }

    pub fn unmute(&mut self, username: &str) -> bool {
        self.muted.remove(username).is_some()
    }

    pub fn blocked(&self) -> impl Iterator<Item = &str> {
        self.blocked.iter().map(String::as_str)
    }

    pub fn muted(&self) -> impl Iterator<Item = (&str, DateTime<Utc>)> {
        self.muted.iter().map(|(name, &expiry)| (name.as_str(), expiry))
    }
}
