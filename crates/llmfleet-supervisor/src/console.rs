use std::{collections::VecDeque, sync::Arc};

use tokio::sync::Mutex;

/// Console lines kept for one instance. Line `n` (1-based) is the n-th line ever
/// written; the ring only retains the newest `capacity` of them.
#[derive(Debug)]
struct ConsoleRing {
    capacity: usize,
    evicted: u64,
    retained: VecDeque<String>,
}

impl ConsoleRing {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            evicted: 0,
            retained: VecDeque::new(),
        }
    }

    fn written(&self) -> u64 {
        self.evicted + self.retained.len() as u64
    }

    fn append(&mut self, line: String) {
        if self.retained.len() == self.capacity {
            self.retained.pop_front();
            self.evicted += 1;
        }
        self.retained.push_back(line);
    }

    fn read_from(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        if cursor == 0 {
            let skip = self.retained.len().saturating_sub(limit);
            let lines = self.retained.iter().skip(skip).cloned().collect();
            return (lines, self.written());
        }

        // A cursor older than the retained window resumes at the oldest kept line.
        let offset = usize::try_from(cursor.saturating_sub(self.evicted)).unwrap_or(usize::MAX);
        let lines: Vec<String> = self
            .retained
            .iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        if lines.is_empty() {
            return (lines, cursor);
        }
        let next = self.evicted + (offset + lines.len()) as u64;
        (lines, next)
    }
}

/// Shared console log for one instance. Survives restarts of the instance.
#[derive(Debug, Clone)]
pub struct ConsoleLog {
    ring: Arc<Mutex<ConsoleRing>>,
}

impl ConsoleLog {
    pub fn new(max_lines: usize) -> Self {
        Self {
            ring: Arc::new(Mutex::new(ConsoleRing::new(max_lines))),
        }
    }

    pub async fn emit(&self, line: impl Into<String>) {
        self.ring.lock().await.append(line.into());
    }

    /// Up to `limit` lines written after line number `cursor`, plus the number of
    /// the last line returned. Cursor 0 reads the newest lines.
    pub async fn tail(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        self.ring.lock().await.read_from(cursor, limit.max(1))
    }
}
