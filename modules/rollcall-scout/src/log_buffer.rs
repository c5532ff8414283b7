//! In-memory tail of recent log events for the dashboard.
//!
//! `LogBufferLayer` sits next to the fmt layer in the subscriber stack and
//! copies every event it sees into a shared `LogBuffer`.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use rollcall_common::LogEntry;

pub const LOG_BUFFER_CAPACITY: usize = 1000;

#[derive(Clone)]
pub struct LogBuffer {
    capacity: usize,
    entries: Arc<Mutex<VecDeque<LogEntry>>>,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
        }
    }

    pub fn push(&self, entry: LogEntry) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// The last `limit` entries in chronological order. `level` filters by
    /// exact level name (case-insensitive); `None` or `"ALL"` keeps everything.
    pub fn recent(&self, limit: usize, level: Option<&str>) -> Vec<LogEntry> {
        let level = level.filter(|l| !l.eq_ignore_ascii_case("ALL"));
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut matched: Vec<LogEntry> = entries
            .iter()
            .rev()
            .filter(|e| level.map_or(true, |l| e.level.eq_ignore_ascii_case(l)))
            .take(limit)
            .cloned()
            .collect();
        matched.reverse();
        matched
    }

    pub fn layer(&self) -> LogBufferLayer {
        LogBufferLayer {
            buffer: self.clone(),
        }
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(LOG_BUFFER_CAPACITY)
    }
}

pub struct LogBufferLayer {
    buffer: LogBuffer,
}

impl<S: Subscriber> Layer<S> for LogBufferLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let mut message = visitor.message;
        if !visitor.fields.is_empty() {
            if !message.is_empty() {
                message.push(' ');
            }
            message.push_str(&visitor.fields);
        }
        self.buffer.push(LogEntry {
            timestamp: Utc::now(),
            level: event.metadata().level().to_string(),
            message,
        });
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn field_sep(&mut self) {
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.field_sep();
            let _ = write!(self.fields, "{}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.field_sep();
            let _ = write!(self.fields, "{}={:?}", field.name(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::prelude::*;

    fn entry(level: &str, message: &str) -> LogEntry {
        LogEntry {
            timestamp: Utc::now(),
            level: level.to_string(),
            message: message.to_string(),
        }
    }

    #[test]
    fn ring_drops_oldest_entries() {
        let buffer = LogBuffer::new(2);
        buffer.push(entry("INFO", "a"));
        buffer.push(entry("INFO", "b"));
        buffer.push(entry("INFO", "c"));
        let messages: Vec<_> = buffer.recent(10, None).into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["b", "c"]);
    }

    #[test]
    fn level_filter_and_limit() {
        let buffer = LogBuffer::new(10);
        buffer.push(entry("INFO", "one"));
        buffer.push(entry("WARN", "two"));
        buffer.push(entry("INFO", "three"));
        buffer.push(entry("INFO", "four"));

        let infos: Vec<_> = buffer.recent(2, Some("info")).into_iter().map(|e| e.message).collect();
        assert_eq!(infos, vec!["three", "four"]);
        assert_eq!(buffer.recent(100, Some("ALL")).len(), 4);
        assert_eq!(buffer.recent(100, Some("WARN"))[0].message, "two");
    }

    #[test]
    fn layer_captures_message_and_fields() {
        let buffer = LogBuffer::new(10);
        let subscriber = tracing_subscriber::registry().with(buffer.layer());
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(uid = 42, "Add failed");
        });
        let entries = buffer.recent(10, None);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, "WARN");
        assert_eq!(entries[0].message, "Add failed uid=42");
    }
}
