//! Fixed-capacity log ring

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Which dev process produced a line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    /// The Go build
    Build,
    /// The front-end dev server
    Vite,
    /// The dev orchestrator itself
    System,
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogSource::Build => write!(f, "build"),
            LogSource::Vite => write!(f, "vite"),
            LogSource::System => write!(f, "system"),
        }
    }
}

/// Output stream of a line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

/// One captured line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// When the line was captured
    pub timestamp: DateTime<Utc>,
    /// Producing process
    pub source: LogSource,
    /// Output stream
    pub stream: LogStream,
    /// The line, without its trailing newline
    pub line: String,
}

impl LogEntry {
    /// Entry captured now
    pub fn new(source: LogSource, stream: LogStream, line: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            source,
            stream,
            line: line.into(),
        }
    }
}

/// Ring of the most recent log entries; the oldest entry is overwritten
/// once the ring is full
#[derive(Debug, Clone)]
pub struct LogRing {
    capacity: usize,
    entries: VecDeque<LogEntry>,
}

impl LogRing {
    /// Empty ring holding at most `capacity` entries (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Maximum number of entries kept
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of entries held
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the ring is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append `entry`, dropping the oldest when full
    pub fn push(&mut self, entry: LogEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Every entry, oldest first
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.iter().cloned().collect()
    }

    /// The newest `n` entries, oldest first
    pub fn last(&self, n: usize) -> Vec<LogEntry> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry(i: usize) -> LogEntry {
        LogEntry::new(LogSource::Vite, LogStream::Stdout, format!("line {i}"))
    }

    fn lines(entries: &[LogEntry]) -> Vec<String> {
        entries.iter().map(|e| e.line.clone()).collect()
    }

    #[test]
    fn test_last_edges() {
        let mut ring = LogRing::new(4);
        for i in 0..3 {
            ring.push(entry(i));
        }
        assert!(ring.last(0).is_empty());
        assert_eq!(lines(&ring.last(2)), vec!["line 1", "line 2"]);
        assert_eq!(ring.last(10).len(), 3);

        ring.clear();
        assert!(ring.is_empty());
        assert!(ring.last(1).is_empty());
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let mut ring = LogRing::new(0);
        ring.push(entry(0));
        ring.push(entry(1));
        assert_eq!(ring.capacity(), 1);
        assert_eq!(lines(&ring.entries()), vec!["line 1"]);
    }

    proptest! {
        #[test]
        fn prop_keeps_last_capacity_entries(capacity in 1usize..32, pushes in 0usize..100) {
            let mut ring = LogRing::new(capacity);
            for i in 0..pushes {
                ring.push(entry(i));
            }

            let expected: Vec<String> = (pushes.saturating_sub(capacity)..pushes)
                .map(|i| format!("line {i}"))
                .collect();
            prop_assert_eq!(lines(&ring.entries()), expected);
            prop_assert!(ring.len() <= capacity);
        }

        #[test]
        fn prop_last_is_suffix(capacity in 1usize..32, pushes in 0usize..64, k in 0usize..40) {
            let mut ring = LogRing::new(capacity);
            for i in 0..pushes {
                ring.push(entry(i));
            }
            let all = ring.entries();
            let last = ring.last(k);
            prop_assert_eq!(last.len(), k.min(all.len()));
            prop_assert_eq!(&all[all.len() - last.len()..], &last[..]);
        }
    }
}
