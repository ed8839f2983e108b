//! Fan-out of tracing events to WebSocket subscribers.

use std::fmt::Write as _;

use tokio::sync::broadcast;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Buffered log events a late subscriber can miss; the stream is best
/// effort, not a durable log.
const CHANNEL_CAPACITY: usize = 256;

/// A tracing layer that mirrors formatted events into a broadcast channel.
pub struct LogBroadcastLayer {
    tx: broadcast::Sender<String>,
}

impl LogBroadcastLayer {
    pub fn new() -> (Self, broadcast::Sender<String>) {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        (Self { tx: tx.clone() }, tx)
    }
}

struct MessageVisitor {
    output: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.output, "{value:?}");
        } else {
            let _ = write!(self.output, " {}={value:?}", field.name());
        }
    }
}

impl<S: Subscriber> Layer<S> for LogBroadcastLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        // No subscribers, no formatting cost.
        if self.tx.receiver_count() == 0 {
            return;
        }
        let mut visitor = MessageVisitor {
            output: String::new(),
        };
        event.record(&mut visitor);
        let line = serde_json::json!({
            "ts": chrono::Utc::now().to_rfc3339(),
            "level": event.metadata().level().to_string(),
            "target": event.metadata().target(),
            "message": visitor.output,
        })
        .to_string();
        let _ = self.tx.send(line);
    }
}
