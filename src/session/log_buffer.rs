//! Bounded per-session I/O log
//!
//! FIFO ring of [`SessionLogEntry`]: when full, the oldest entry is dropped
//! before the new one is appended. Entries are never reordered.

use std::collections::VecDeque;

use super::types::{Direction, SessionLogEntry};

/// Default maximum entries per session
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

#[derive(Debug)]
pub struct SessionLog {
    entries: VecDeque<SessionLogEntry>,
    max_entries: usize,
    /// Total entries ever written (including evicted)
    total_entries: u64,
}

impl Default for SessionLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_ENTRIES)
    }
}

impl SessionLog {
    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_entries.min(1024)),
            max_entries,
            total_entries: 0,
        }
    }

    pub fn append(&mut self, entry: SessionLogEntry) {
        if self.max_entries == 0 {
            self.total_entries += 1;
            return;
        }

        while self.entries.len() >= self.max_entries {
            self.entries.pop_front();
        }

        self.entries.push_back(entry);
        self.total_entries += 1;
    }

    pub fn record(&mut self, session_id: &str, direction: Direction, data: &[u8]) {
        self.append(SessionLogEntry::new(session_id, direction, data.to_vec()));
    }

    /// Snapshot in insertion order
    pub fn entries(&self) -> Vec<SessionLogEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn total_entries(&self) -> u64 {
        self.total_entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_keeps_most_recent_in_order() {
        let max = 5;
        let k = 7;
        let mut log = SessionLog::with_capacity(max);

        for i in 0..(max + k) {
            log.record("s1", Direction::Input, format!("cmd {}", i).as_bytes());
        }

        assert_eq!(log.len(), max);
        assert_eq!(log.total_entries(), (max + k) as u64);

        let payloads: Vec<String> = log
            .entries()
            .iter()
            .map(|e| String::from_utf8_lossy(&e.data).into_owned())
            .collect();
        let expected: Vec<String> = (k..max + k).map(|i| format!("cmd {}", i)).collect();
        assert_eq!(payloads, expected);
    }

    #[test]
    fn test_mixed_directions_preserve_append_order() {
        let mut log = SessionLog::with_capacity(10);
        log.record("s1", Direction::Input, b"ls\n");
        log.record("s1", Direction::Output, b"Cargo.toml\n");
        log.record("s1", Direction::Input, b"exit\n");

        let directions: Vec<Direction> = log.entries().iter().map(|e| e.direction).collect();
        assert_eq!(
            directions,
            vec![Direction::Input, Direction::Output, Direction::Input]
        );
    }

    #[test]
    fn test_zero_capacity_keeps_nothing() {
        let mut log = SessionLog::with_capacity(0);
        log.record("s1", Direction::Output, b"x");
        assert!(log.is_empty());
        assert_eq!(log.total_entries(), 1);
    }

    #[test]
    fn test_clear_keeps_total() {
        let mut log = SessionLog::default();
        log.record("s1", Direction::Output, b"a");
        log.record("s1", Direction::Output, b"b");
        log.clear();
        assert_eq!(log.len(), 0);
        assert_eq!(log.total_entries(), 2);
        assert_eq!(log.max_entries(), DEFAULT_MAX_ENTRIES);
    }
}
