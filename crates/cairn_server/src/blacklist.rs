//! Process-wide registry of poison commands.
//!
//! A `(methodLine, userID)` key lands here when a handler for it killed this
//! process's peer (crash broadcast) or killed the primary while we were
//! escalating to it. Entries live for the life of the process and are never
//! replicated; each node learns independently.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::clock::now_us;
use crate::command::Command;

/// Diagnostic record for one blacklisted key. Its presence is what matters.
#[derive(Debug, Clone, Copy)]
pub struct Sighting {
    pub count: u64,
    pub first_seen_us: u64,
}

#[derive(Default)]
pub struct CommandBlacklist {
    inner: Mutex<HashMap<(String, String), Sighting>>,
}

impl CommandBlacklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seeded blacklist, for tests that need a poisoned starting state.
    pub fn with_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let list = Self::new();
        for (method_line, user_id) in entries {
            list.record(&method_line, &user_id);
        }
        list
    }

    /// Exact-match lookup on `(methodLine, userID)`; an empty userID is a
    /// distinct key, and different users of the same method are independent.
    pub fn is_blacklisted(&self, cmd: &Command) -> bool {
        self.contains(cmd.method(), &cmd.user_id)
    }

    pub fn contains(&self, method_line: &str, user_id: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .contains_key(&(method_line.to_string(), user_id.to_string()))
    }

    /// Record a sighting of a poison key, creating the entry on first sight.
    pub fn record(&self, method_line: &str, user_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        let sighting = inner
            .entry((method_line.to_string(), user_id.to_string()))
            .or_insert(Sighting {
                count: 0,
                first_seen_us: now_us(),
            });
        sighting.count += 1;
        if sighting.count == 1 {
            tracing::warn!(method_line, user_id, "blacklisted poison command");
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}
