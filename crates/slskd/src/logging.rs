//! Logging setup, including the in-memory log ring buffer.
//!
//! Besides the usual stderr output, the daemon keeps the most recent
//! log events in memory so a control surface can show them without
//! touching the filesystem.  The buffer is an injected collaborator
//! with a normal lifecycle, not a global.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt as _};
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::EnvFilter;

/// How many events the buffer retains by default.
pub const DEFAULT_LOG_BUFFER_CAPACITY: usize = 1_000;

/// One captured log event.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct LogEntry {
    /// When the event was recorded.
    pub timestamp: SystemTime,
    /// The event's level, as text.
    pub level: String,
    /// The event's target (usually the module path).
    pub target: String,
    /// The rendered message and fields.
    pub message: String,
}

/// A bounded ring buffer of recent log events.
#[derive(Debug)]
pub struct LogBuffer {
    /// The retained events, oldest first.
    entries: Mutex<VecDeque<LogEntry>>,
    /// Maximum number of retained events.
    capacity: usize,
}

impl LogBuffer {
    /// Construct a buffer retaining up to `capacity` events.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(LogBuffer {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        })
    }

    /// Append one event, evicting the oldest if full.
    fn push(&self, entry: LogEntry) {
        let mut entries = match self.entries.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// The most recent `n` events, oldest first.
    pub fn recent(&self, n: usize) -> Vec<LogEntry> {
        let entries = match self.entries.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    /// A tracing layer that feeds this buffer.
    pub fn layer(self: &Arc<Self>) -> BufferLayer {
        BufferLayer {
            buffer: Arc::clone(self),
        }
    }
}

/// The `tracing` layer feeding a [`LogBuffer`].
pub struct BufferLayer {
    /// The destination buffer.
    buffer: Arc<LogBuffer>,
}

/// Renders an event's fields into one line.
#[derive(Default)]
struct LineVisitor {
    /// The message field, if the event had one.
    message: String,
    /// The remaining fields, rendered `k=v`.
    fields: String,
}

impl Visit for LineVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            if !self.fields.is_empty() {
                self.fields.push(' ');
            }
            let _ = write!(self.fields, "{}={:?}", field.name(), value);
        }
    }
}

impl<S: Subscriber> Layer<S> for BufferLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);
        let message = if visitor.fields.is_empty() {
            visitor.message
        } else if visitor.message.is_empty() {
            visitor.fields
        } else {
            format!("{} {}", visitor.message, visitor.fields)
        };
        self.buffer.push(LogEntry {
            timestamp: SystemTime::now(),
            level: event.metadata().level().to_string(),
            target: event.metadata().target().to_owned(),
            message,
        });
    }
}

/// Install the global subscriber: an env-filtered stderr writer plus
/// the ring buffer.
pub fn install(
    filter: &str,
    buffer: &Arc<LogBuffer>,
) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(buffer.layer())
        .try_init()
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use tracing::subscriber::with_default;

    #[test]
    fn buffer_captures_and_evicts() {
        let buffer = LogBuffer::new(3);
        let subscriber = tracing_subscriber::registry().with(buffer.layer());
        with_default(subscriber, || {
            for i in 0..5 {
                tracing::info!(round = i, "tick");
            }
        });

        let recent = buffer.recent(10);
        assert_eq!(recent.len(), 3, "oldest two evicted");
        assert!(recent[0].message.contains("tick"));
        assert!(recent[0].message.contains("round=2"));
        assert_eq!(recent[2].level, "INFO");

        let last_one = buffer.recent(1);
        assert_eq!(last_one.len(), 1);
        assert!(last_one[0].message.contains("round=4"));
    }
}
