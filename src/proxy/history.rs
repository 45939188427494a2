//! Bounded per-session query history, kept for the status surface.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};

pub const MAX_HISTORY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub query: String,
    pub at: DateTime<Utc>,
    /// Filled in once execution completes.
    pub duration: Option<Duration>,
}

#[derive(Debug, Default)]
pub struct QueryHistory {
    entries: VecDeque<HistoryEntry>,
    last: Option<String>,
}

/// Standard driver chatter that would drown real application queries:
/// DEALLOCATE after each prepared-statement use, and empty statements.
fn is_noise(query: &str) -> bool {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return true;
    }
    let upper = trimmed.to_ascii_uppercase();
    upper == "DEALLOCATE" || upper.starts_with("DEALLOCATE ") || upper.starts_with("DEALLOCATE\t")
}

impl QueryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a non-noise query. Oldest entries fall off past the cap.
    pub fn record(&mut self, query: &str) {
        if is_noise(query) {
            return;
        }
        self.last = Some(query.to_string());
        self.entries.push_back(HistoryEntry {
            query: query.to_string(),
            at: Utc::now(),
            duration: None,
        });
        while self.entries.len() > MAX_HISTORY {
            self.entries.pop_front();
        }
    }

    /// Sets the duration of the most recent entry once its execution
    /// finished.
    pub fn finish_last(&mut self, duration: Duration) {
        if let Some(entry) = self.entries.back_mut() {
            if entry.duration.is_none() {
                entry.duration = Some(duration);
            }
        }
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn last_query(&self) -> Option<&str> {
        self.last.as_deref()
    }

    /// Clears the last-query marker (used on full-session rollback).
    pub fn clear_last(&mut self) {
        self.last = None;
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_oldest_first_and_caps_at_limit() {
        let mut history = QueryHistory::new();
        for i in 0..(MAX_HISTORY + 10) {
            history.record(&format!("SELECT {i}"));
        }
        let entries = history.entries();
        assert_eq!(entries.len(), MAX_HISTORY);
        assert_eq!(entries[0].query, "SELECT 10");
        assert_eq!(entries.last().map(|e| e.query.as_str()), Some("SELECT 109"));
    }

    #[test]
    fn filters_driver_noise() {
        let mut history = QueryHistory::new();
        history.record("");
        history.record("   ");
        history.record("DEALLOCATE pdo_stmt_00000001");
        history.record("deallocate all");
        assert!(history.entries().is_empty());
        // DEALLOCATE as an identifier prefix is not noise.
        history.record("SELECT deallocate_count FROM stats");
        assert_eq!(history.entries().len(), 1);
    }

    #[test]
    fn patches_duration_on_the_last_entry_only_once() {
        let mut history = QueryHistory::new();
        history.record("SELECT 1");
        history.finish_last(Duration::from_millis(5));
        history.finish_last(Duration::from_millis(99));
        assert_eq!(
            history.entries()[0].duration,
            Some(Duration::from_millis(5))
        );
    }

    #[test]
    fn tracks_and_clears_last_query_marker() {
        let mut history = QueryHistory::new();
        history.record("SELECT 1");
        assert_eq!(history.last_query(), Some("SELECT 1"));
        history.clear_last();
        assert_eq!(history.last_query(), None);
        assert_eq!(history.entries().len(), 1);
    }
}
