//! Forwards log events toward the tree root over `FORWARD_LOG` (spec.md
//! §4.9). Implemented as a `tracing_subscriber::Layer` so it composes with
//! whatever other layers (e.g. `fmt`) the boot orchestrator installs.

use crate::context::Context;
use crate::message::{LogRecord, FORWARD_LOG};
use std::cell::Cell;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context as LayerContext, Layer};

thread_local! {
    static FORWARDING: Cell<bool> = Cell::new(false);
}

pub struct LogHandler {
    parent: Arc<Context>,
}

impl LogHandler {
    pub fn new(parent: Arc<Context>) -> Self {
        Self { parent }
    }
}

impl<S: Subscriber> Layer<S> for LogHandler {
    fn on_event(&self, event: &Event<'_>, _ctx: LayerContext<'_, S>) {
        // Forwarding itself logs through `tracing` in other layers; guard
        // against re-entering this one from within that path.
        if FORWARDING.with(Cell::get) {
            return;
        }
        FORWARDING.with(|c| c.set(true));

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let record = LogRecord {
            logger_name: event.metadata().target().to_string(),
            level: level_number(event.metadata().level()),
            message: visitor.message,
        };
        self.parent.send(FORWARD_LOG, 0, record.to_wire());

        FORWARDING.with(|c| c.set(false));
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}

fn level_number(level: &Level) -> u8 {
    match *level {
        Level::ERROR => 40,
        Level::WARN => 30,
        Level::INFO => 20,
        Level::DEBUG => 10,
        Level::TRACE => 5,
    }
}
