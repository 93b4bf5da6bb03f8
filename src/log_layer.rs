//! A `tracing_subscriber::Layer` that captures log records from this crate
//! and forwards them to a `broadcast::Sender<LogRecord>`.
//!
//! This decouples the bridge/discovery code from whatever logging setup the
//! host application uses — the host subscribes to the channel and displays
//! entries however it likes, without them going to stdout/stderr.

use tokio::sync::broadcast;
use tracing::{Event, Subscriber};
use tracing_subscriber::{layer::Context, registry::LookupSpan, Layer};

/// Capacity of the log broadcast channel (buffered entries per subscriber).
pub const LOG_CHANNEL_CAPACITY: usize = 512;

#[derive(Debug, Clone)]
pub struct LogRecord {
    pub level: String,
    pub target: String,
    pub message: String,
}

/// Creates a paired `(layer, receiver)`. Install `layer` in a
/// `tracing_subscriber::Registry` alongside any other layers the host
/// application uses; subscribe to `receiver` (or call `layer.subscribe()`)
/// to receive entries.
pub fn build_log_channel() -> (LogCaptureLayer, broadcast::Receiver<LogRecord>) {
    let (tx, rx) = broadcast::channel(LOG_CHANNEL_CAPACITY);
    (LogCaptureLayer { tx }, rx)
}

/// A tracing layer that converts each log `Event` into a `LogRecord` and
/// sends it over a broadcast channel. Dropped/lagged receivers are
/// silently ignored — the core never blocks on the channel.
pub struct LogCaptureLayer {
    tx: broadcast::Sender<LogRecord>,
}

impl LogCaptureLayer {
    pub fn subscribe(&self) -> broadcast::Receiver<LogRecord> {
        self.tx.subscribe()
    }
}

impl<S> Layer<S> for LogCaptureLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);

        let record = LogRecord {
            level: meta.level().to_string(),
            target: meta.target().to_string(),
            message: visitor.0,
        };
        let _ = self.tx.send(record);
    }
}

struct MessageVisitor(String);

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{:?}", value);
        } else if !self.0.is_empty() {
            self.0.push_str(&format!(", {}={:?}", field.name(), value));
        } else {
            self.0 = format!("{}={:?}", field.name(), value);
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.0 = value.to_string();
        } else if !self.0.is_empty() {
            self.0.push_str(&format!(", {}={}", field.name(), value));
        } else {
            self.0 = format!("{}={}", field.name(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn captured_events_carry_level_target_and_message() {
        let (layer, mut rx) = build_log_channel();
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(peer = "12D3KooW", "dial failed");
        });

        let record = rx.try_recv().expect("one event should have been captured");
        assert_eq!(record.level, "WARN");
        assert!(record.message.contains("dial failed"));
        assert!(record.message.contains("peer"));
    }
}
