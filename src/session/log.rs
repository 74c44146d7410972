use std::collections::VecDeque;
use serde::Serialize;

/// Maximum number of entries kept in the visible log.
pub const LOG_CAPACITY: usize = 400;

/// Identical consecutive lines within this window (milliseconds) are shown once.
pub const DEBOUNCE_MS: u64 = 400;

/// Telemetry that floods the log; still decoded, just not shown while the filter is on.
pub const NOISE_PREFIXES: [&str; 3] = ["[Light]", "[Music]", "SENSORS|"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    /// Unix time in milliseconds
    pub ts: u64,
    pub line: String,
}

pub fn is_noise(line: &str) -> bool {
    NOISE_PREFIXES.iter().any(|prefix| line.starts_with(prefix))
}

#[derive(Debug)]
pub struct LogBuffer {
    entries: VecDeque<LogEntry>,
    pending: VecDeque<LogEntry>,
    live: bool,
    noise_filter: bool,
    last: Option<(String, u64)>,
}

impl Default for LogBuffer {
    fn default() -> Self {
        LogBuffer::new(true)
    }
}

impl LogBuffer {
    pub fn new(noise_filter: bool) -> Self {
        LogBuffer {
            entries: VecDeque::with_capacity(LOG_CAPACITY),
            pending: VecDeque::new(),
            live: true,
            noise_filter,
            last: None,
        }
    }

    /// Adds a line; returns the entry if it became visible right away.
    pub fn push(&mut self, line: &str, now_ms: u64) -> Option<LogEntry> {
        if self.noise_filter && is_noise(line) {
            return None;
        }

        if let Some((last_line, last_ms)) = &self.last {
            if last_line == line && now_ms.saturating_sub(*last_ms) < DEBOUNCE_MS {
                return None;
            }
        }
        self.last = Some((line.to_string(), now_ms));

        let entry = LogEntry { ts: now_ms, line: line.to_string() };
        if self.live {
            self.append(entry.clone());
            Some(entry)
        } else {
            // paused entries are capped too, the oldest go first
            if self.pending.len() == LOG_CAPACITY {
                self.pending.pop_front();
            }
            self.pending.push_back(entry);
            None
        }
    }

    fn append(&mut self, entry: LogEntry) {
        if self.entries.len() == LOG_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Switching live back on moves everything buffered meanwhile into the log, in order, and
    /// returns those entries.
    pub fn set_live(&mut self, live: bool) -> Vec<LogEntry> {
        self.live = live;
        if !live {
            return Vec::new();
        }

        let flushed: Vec<LogEntry> = std::mem::take(&mut self.pending).into();
        for entry in &flushed {
            self.append(entry.clone());
        }
        flushed
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn set_noise_filter(&mut self, enabled: bool) {
        self.noise_filter = enabled;
    }

    pub fn noise_filter(&self) -> bool {
        self.noise_filter
    }

    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
