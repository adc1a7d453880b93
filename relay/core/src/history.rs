//! Per-connection conversation history
//!
//! The broker keeps one history per registered connection so that jobs
//! submitted with [`HistoryRef::Conversation`](crate::HistoryRef) see the
//! recent exchange. Reasoning is never stored, and only the most recent
//! `max_turns` turns survive each append. A history disappears with its
//! connection.

use dashmap::DashMap;

use crate::job::ConnectionId;
use crate::trace::TraceEntry;

/// Default number of turns kept per connection
pub const DEFAULT_MAX_TURNS: usize = 20;

/// Keep the last `max_turns` turns. A turn starts at each user entry;
/// entries before the first user entry belong to no turn and are dropped
/// once trimming kicks in.
#[must_use]
pub fn trim_turns(entries: Vec<TraceEntry>, max_turns: usize) -> Vec<TraceEntry> {
    let starts: Vec<usize> = entries
        .iter()
        .enumerate()
        .filter(|(_, entry)| entry.is_user())
        .map(|(idx, _)| idx)
        .collect();

    if starts.len() <= max_turns {
        return entries;
    }
    if max_turns == 0 {
        return Vec::new();
    }

    let cut = starts[starts.len() - max_turns];
    entries.into_iter().skip(cut).collect()
}

/// Remove reasoning entries, returning what is left and how many were cleared
#[must_use]
pub fn strip_reasoning(entries: Vec<TraceEntry>) -> (Vec<TraceEntry>, usize) {
    let before = entries.len();
    let kept: Vec<TraceEntry> = entries.into_iter().filter(|e| !e.is_reasoning()).collect();
    let cleared = before - kept.len();
    (kept, cleared)
}

/// In-memory history store keyed by connection
#[derive(Debug)]
pub struct HistoryStore {
    histories: DashMap<ConnectionId, Vec<TraceEntry>>,
    max_turns: usize,
}

impl HistoryStore {
    /// Create a store that keeps `max_turns` turns per connection
    #[must_use]
    pub fn new(max_turns: usize) -> Self {
        Self {
            histories: DashMap::new(),
            max_turns,
        }
    }

    /// Copy of a connection's history (empty if none)
    #[must_use]
    pub fn snapshot(&self, id: ConnectionId) -> Vec<TraceEntry> {
        self.histories
            .get(&id)
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    /// Append entries to a connection's history, then strip and trim
    pub fn append(&self, id: ConnectionId, entries: Vec<TraceEntry>) {
        let (entries, cleared) = strip_reasoning(entries);
        if cleared > 0 {
            tracing::debug!(
                connection_id = %id,
                cleared = cleared,
                "Stripped reasoning from history"
            );
        }

        let mut history = self.histories.entry(id).or_default();
        history.extend(entries);
        let before = history.len();
        let trimmed = trim_turns(std::mem::take(&mut *history), self.max_turns);
        if trimmed.len() < before {
            tracing::debug!(
                connection_id = %id,
                removed = before - trimmed.len(),
                "Trimmed conversation history"
            );
        }
        *history = trimmed;
    }

    /// Replace a connection's history wholesale
    pub fn set(&self, id: ConnectionId, entries: Vec<TraceEntry>) {
        self.histories.remove(&id);
        self.append(id, entries);
    }

    /// Drop a connection's history
    pub fn clear(&self, id: ConnectionId) {
        self.histories.remove(&id);
    }

    /// Number of entries stored for a connection
    #[must_use]
    pub fn len(&self, id: ConnectionId) -> usize {
        self.histories.get(&id).map_or(0, |entries| entries.len())
    }

    /// Number of connections with a stored history
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.histories.len()
    }

    /// Configured turn limit
    #[must_use]
    pub fn max_turns(&self) -> usize {
        self.max_turns
    }
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TURNS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn turn(index: usize) -> Vec<TraceEntry> {
        vec![
            TraceEntry::user(format!("user-{index}")),
            TraceEntry::assistant(format!("assistant-{index}")),
        ]
    }

    #[test]
    fn test_trim_keeps_recent_turns() {
        let entries: Vec<TraceEntry> = (1..=3).flat_map(turn).collect();
        let trimmed = trim_turns(entries, 2);

        assert_eq!(trimmed.len(), 4);
        assert_eq!(trimmed[0], TraceEntry::user("user-2"));
        assert_eq!(trimmed[2], TraceEntry::user("user-3"));
    }

    #[test]
    fn test_trim_below_limit_is_untouched() {
        let entries = turn(1);
        assert_eq!(trim_turns(entries.clone(), 5), entries);
        assert!(trim_turns(entries, 0).is_empty());
    }

    #[test]
    fn test_trim_keeps_tool_entries_with_their_turn() {
        let mut entries = turn(1);
        entries.extend(vec![
            TraceEntry::user("user-2"),
            TraceEntry::tool_call("c1", "run_command", "{}"),
            TraceEntry::tool_return("c1", "ok"),
            TraceEntry::assistant("done"),
        ]);

        let trimmed = trim_turns(entries, 1);
        assert_eq!(trimmed.len(), 4);
        assert_eq!(trimmed[0], TraceEntry::user("user-2"));
    }

    #[test]
    fn test_strip_reasoning() {
        let (kept, cleared) = strip_reasoning(vec![
            TraceEntry::user("q"),
            TraceEntry::reasoning("hidden-thought"),
            TraceEntry::assistant("a"),
            TraceEntry::reasoning("more"),
        ]);
        assert_eq!(cleared, 2);
        assert_eq!(kept, vec![TraceEntry::user("q"), TraceEntry::assistant("a")]);
    }

    #[test]
    fn test_store_lifecycle() {
        let store = HistoryStore::new(2);
        let id = ConnectionId::from_raw(1);

        store.append(id, turn(1));
        store.append(id, turn(2));
        store.append(id, turn(3));

        let snapshot = store.snapshot(id);
        assert_eq!(snapshot.len(), 4);
        assert_eq!(snapshot[0], TraceEntry::user("user-2"));

        store.clear(id);
        assert!(store.snapshot(id).is_empty());
        assert_eq!(store.connection_count(), 0);
    }

    #[test]
    fn test_store_never_keeps_reasoning() {
        let store = HistoryStore::default();
        let id = ConnectionId::from_raw(2);
        store.set(
            id,
            vec![
                TraceEntry::user("q"),
                TraceEntry::reasoning("thinking"),
                TraceEntry::assistant("a"),
            ],
        );
        assert_eq!(store.len(id), 2);
    }
}
