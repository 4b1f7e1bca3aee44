//! Conversation history: append-only per-peer message log, persisted as JSON.
//! Order is the local node's observation order, not a global clock.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub direction: Direction,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// All conversations for one node, keyed by peer username.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MessageHistory {
    conversations: BTreeMap<String, Vec<HistoryEntry>>,
}

impl MessageHistory {
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

    /// Append one entry to the conversation with `peer`. Append-only: entries
    /// are never rewritten or reordered.
    pub fn append(
        &mut self,
        peer: &str,
        direction: Direction,
        content: &str,
        timestamp: DateTime<Utc>,
    ) {
        self.conversations
            .entry(peer.to_string())
            .or_default()
            .push(HistoryEntry {
                direction,
                content: content.to_string(),
                timestamp,
            });
    }

    pub fn conversation(&self, peer: &str) -> &[HistoryEntry] {
        self.conversations
            .get(peer)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn peers(&self) -> impl Iterator<Item = &str> {
        self.conversations.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interleaved_appends_preserve_observation_order() {
        let mut history = MessageHistory::new();
        let t = Utc::now();
        let n = 5;
        for i in 0..n {
            history.append("bob", Direction::Outgoing, &format!("out {i}"), t);
            history.append("bob", Direction::Incoming, &format!("in {i}"), t);
        }
        let convo = history.conversation("bob");
        assert_eq!(convo.len(), 2 * n);
        for (i, pair) in convo.chunks(2).enumerate() {
            assert_eq!(pair[0].direction, Direction::Outgoing);
            assert_eq!(pair[0].content, format!("out {i}"));
            assert_eq!(pair[1].direction, Direction::Incoming);
        }
    }

    #[test]
    fn unknown_peer_has_empty_conversation() {
        let history = MessageHistory::new();
        assert!(history.conversation("nobody").is_empty());
    }

    #[test]
    fn direction_serializes_lowercase() {
        let entry = HistoryEntry {
            direction: Direction::Incoming,
            content: "hi".into(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["direction"], "incoming");
    }

    #[test]
    fn persists_per_peer_conversations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");

        let mut history = MessageHistory::new();
        history.append("bob", Direction::Outgoing, "hi", Utc::now());
        history.append("carol", Direction::Incoming, "yo", Utc::now());
        history.save(&path).unwrap();

        let reloaded = MessageHistory::load(&path).unwrap();
        assert_eq!(reloaded.conversation("bob").len(), 1);
        assert_eq!(reloaded.conversation("carol").len(), 1);
        assert_eq!(reloaded.peers().count(), 2);
    }
}
