//! Bounded in-memory chat transcripts, per session key.
//!
//! This is a convenience ring for `chat.history`, not durable storage;
//! the authoritative transcript lives with the agent runner under the
//! session's `session_id`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;

const TURNS_PER_SESSION: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTurn {
    pub role: Role,
    pub text: String,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Default)]
pub struct ChatHistory {
    inner: Arc<Mutex<HashMap<String, VecDeque<ChatTurn>>>>,
}

impl ChatHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, session_key: &str, role: Role, text: &str) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        let turns = inner.entry(session_key.to_string()).or_default();
        turns.push_back(ChatTurn {
            role,
            text: text.to_string(),
            at: Utc::now(),
        });
        while turns.len() > TURNS_PER_SESSION {
            turns.pop_front();
        }
    }

    /// Most recent `limit` turns (oldest first). `limit` 0 means all kept.
    pub fn history(&self, session_key: &str, limit: usize) -> Vec<ChatTurn> {
        let Ok(inner) = self.inner.lock() else {
            return Vec::new();
        };
        let Some(turns) = inner.get(session_key) else {
            return Vec::new();
        };
        let skip = if limit > 0 && turns.len() > limit {
            turns.len() - limit
        } else {
            0
        };
        turns.iter().skip(skip).cloned().collect()
    }

    pub fn forget(&self, session_key: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.remove(session_key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_limits() {
        let history = ChatHistory::new();
        history.record("main", Role::User, "hi");
        history.record("main", Role::Assistant, "hello");
        history.record("main", Role::User, "bye");

        let all = history.history("main", 0);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].text, "hi");

        let last_two = history.history("main", 2);
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[0].text, "hello");
    }

    #[test]
    fn ring_is_bounded() {
        let history = ChatHistory::new();
        for i in 0..(TURNS_PER_SESSION + 50) {
            history.record("main", Role::User, &format!("m{i}"));
        }
        let all = history.history("main", 0);
        assert_eq!(all.len(), TURNS_PER_SESSION);
        assert_eq!(all[0].text, "m50");
    }

    #[test]
    fn sessions_are_isolated_and_forgettable() {
        let history = ChatHistory::new();
        history.record("a", Role::User, "x");
        history.record("b", Role::User, "y");
        assert_eq!(history.history("a", 0).len(), 1);
        history.forget("a");
        assert!(history.history("a", 0).is_empty());
        assert_eq!(history.history("b", 0).len(), 1);
    }
}
