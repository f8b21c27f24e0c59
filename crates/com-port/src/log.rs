//! Bounded log of unsolicited data
//!
//! Data that arrives while a port is idle is kept line by line. A chunk that
//! ends mid-line is continued by the next chunk; a chunk that ends with a
//! newline leaves an empty pending entry for the next line.

use std::collections::VecDeque;

/// Maximum number of entries kept
pub const LOG_CAPACITY: usize = 1000;

/// Entries dropped from the front each time the capacity is exceeded
pub const LOG_EVICTION: usize = 10;

/// Line log with batch eviction of the oldest entries
#[derive(Debug, Clone, Default)]
pub struct BackgroundLog {
    entries: VecDeque<String>,
}

impl BackgroundLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a received chunk
    pub fn push_chunk(&mut self, chunk: &str) {
        let mut lines = chunk.split('\n');

        if let Some(first) = lines.next() {
            match self.entries.back_mut() {
                Some(last) => last.push_str(first),
                None => self.entries.push_back(first.to_string()),
            }
        }

        for line in lines {
            // The previous entry is now a complete line
            if let Some(done) = self.entries.back_mut() {
                if done.ends_with('\r') {
                    done.pop();
                }
            }
            self.entries.push_back(line.to_string());
        }

        while self.entries.len() > LOG_CAPACITY {
            let n = LOG_EVICTION.min(self.entries.len());
            self.entries.drain(..n);
        }
    }

    /// Number of entries, including a pending partial line
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy of the entries, oldest first
    pub fn entries(&self) -> Vec<String> {
        self.entries.iter().cloned().collect()
    }

    /// Take all entries, leaving the log empty
    pub fn drain(&mut self) -> Vec<String> {
        self.entries.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_lines_merge() {
        let mut log = BackgroundLog::new();
        log.push_chunk("TEMP=2");
        log.push_chunk("1.5\nHUM=");
        log.push_chunk("40\n");

        assert_eq!(log.entries(), vec!["TEMP=21.5", "HUM=40", ""]);
    }

    #[test]
    fn test_crlf_stripped_from_complete_lines() {
        let mut log = BackgroundLog::new();
        log.push_chunk("A\r\nB\r");
        assert_eq!(log.entries(), vec!["A", "B\r"]);
        log.push_chunk("\n");
        assert_eq!(log.entries(), vec!["A", "B", ""]);
    }

    #[test]
    fn test_eviction_drops_oldest_ten() {
        let mut log = BackgroundLog::new();
        for i in 0..LOG_CAPACITY {
            log.push_chunk(&format!("{}\n", i));
        }
        // 1000 lines plus the pending empty entry went over capacity once
        assert!(log.len() <= LOG_CAPACITY);
        assert_eq!(log.entries()[0], "10");
        assert_eq!(log.entries().last().map(String::as_str), Some(""));
    }

    #[test]
    fn test_drain_empties() {
        let mut log = BackgroundLog::new();
        log.push_chunk("x\ny");
        assert_eq!(log.drain(), vec!["x", "y"]);
        assert!(log.is_empty());
    }
}
