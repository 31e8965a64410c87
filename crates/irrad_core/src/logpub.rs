//! Forward tracing events onto the `log` publish channel.

use std::fmt::Write as _;

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::fanout::Publisher;

/// A [`Layer`] mirroring every log record to remote subscribers.
///
/// Forwarding is silent best-effort: this layer must never produce log
/// records of its own, or a full queue would feed back into itself.
pub struct LogPublisher {
    publisher: Publisher,
}

impl LogPublisher {
    pub fn new(publisher: Publisher) -> Self {
        Self { publisher }
    }
}

impl<S: Subscriber> Layer<S> for LogPublisher {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        if visitor.message.is_empty() {
            return;
        }
        let line = format!("{} {}", event.metadata().level(), visitor.message);
        self.publisher.try_publish_line(line);
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        }
    }
}
