//! Domain log sink: tracepoint output and instance variable changes.

use serde::Serialize;
use std::sync::{Mutex, PoisonError};

/// One record, keyed by virtual time and thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogRecord {
    pub time: u64,
    pub thread: u64,
    pub text: String,
}

pub trait LogSink: Send + Sync {
    fn record(&self, record: LogRecord);
}

/// Forwards records to `tracing` under the `tempo::log` target.
#[derive(Debug, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn record(&self, record: LogRecord) {
        tracing::info!(
            target: "tempo::log",
            time = record.time,
            thread = record.thread,
            "{}",
            record.text
        );
    }
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<LogRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.records().into_iter().map(|r| r.text).collect()
    }
}

impl LogSink for MemorySink {
    fn record(&self, record: LogRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_keeps_order() {
        let sink = MemorySink::new();
        for (i, text) in ["a", "b"].iter().enumerate() {
            sink.record(LogRecord {
                time: i as u64,
                thread: 1,
                text: text.to_string(),
            });
        }
        assert_eq!(sink.texts(), vec!["a".to_string(), "b".to_string()]);
    }
}
