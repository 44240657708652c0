use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

pub const DEFAULT_LOG_CAPACITY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleOutcome {
    Ran,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleLogEntry {
    pub timestamp: DateTime<Utc>,
    pub outcome: ScheduleOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ScheduleLogEntry {
    pub fn new(outcome: ScheduleOutcome, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            outcome,
            message: Some(message.into()),
        }
    }
}

/// Fixed-capacity history, newest first. Pushing past capacity drops the oldest entry.
#[derive(Debug, Clone)]
pub struct LogRing {
    entries: VecDeque<ScheduleLogEntry>,
    capacity: usize,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, entry: ScheduleLogEntry) {
        self.entries.push_front(entry);
        while self.entries.len() > self.capacity {
            self.entries.pop_back();
        }
    }

    pub fn entries(&self) -> Vec<ScheduleLogEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for LogRing {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}
