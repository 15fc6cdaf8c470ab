//! Log forwarding to the parent via a tracing [`Layer`].
//!
//! [`ControlLogLayer`] captures each tracing event at INFO or above and
//! emits it on the control channel as a `log` event, so the orchestrator
//! sees worker diagnostics without scraping stderr.  The binary installs the
//! sink with [`install_sink`] and removes it before exit; events emitted
//! while no sink is installed are dropped.

use std::fmt;
use std::sync::Mutex;

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::control::{EventSink, OutboundEvent};

// ---------------------------------------------------------------------------
// Global sink
// ---------------------------------------------------------------------------

static LOG_SINK: Mutex<Option<EventSink>> = Mutex::new(None);

/// Install the control-channel sink, replacing any previous one.
pub fn install_sink(sink: EventSink) {
    if let Ok(mut slot) = LOG_SINK.lock() {
        *slot = Some(sink);
    }
}

/// Drop the installed sink so the event channel can drain and close.
pub fn uninstall_sink() {
    if let Ok(mut slot) = LOG_SINK.lock() {
        slot.take();
    }
}

fn current_sink() -> Option<EventSink> {
    LOG_SINK.lock().ok().and_then(|slot| slot.clone())
}

// ---------------------------------------------------------------------------
// Tracing layer
// ---------------------------------------------------------------------------

pub struct ControlLogLayer {
    max_level: Level,
}

impl ControlLogLayer {
    pub fn new() -> Self {
        Self {
            max_level: Level::INFO,
        }
    }
}

impl Default for ControlLogLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Subscriber> Layer<S> for ControlLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if *meta.level() > self.max_level {
            return;
        }
        let Some(sink) = current_sink() else {
            return;
        };
        if sink.is_closed() {
            return;
        }

        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);

        sink.emit(log_event(
            meta.level(),
            meta.target(),
            visitor.message.unwrap_or_default(),
            visitor.fields,
        ));
    }
}

fn log_event(
    level: &Level,
    target: &str,
    message: String,
    fields: serde_json::Map<String, serde_json::Value>,
) -> OutboundEvent {
    OutboundEvent::LogEmitted {
        level: level_str(level).to_string(),
        target: target.to_string(),
        message,
        fields,
    }
}

fn level_str(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "error",
        Level::WARN => "warn",
        Level::INFO => "info",
        Level::DEBUG => "debug",
        Level::TRACE => "trace",
    }
}

// ---------------------------------------------------------------------------
// Field visitor
// ---------------------------------------------------------------------------

#[derive(Default)]
struct JsonVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
}

impl JsonVisitor {
    fn put(&mut self, field: &Field, value: serde_json::Value) {
        self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for JsonVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let val = format!("{value:?}");
        if field.name() == "message" {
            self.message = Some(val);
        } else {
            self.put(field, serde_json::Value::String(val));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.put(field, serde_json::Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, value.into());
    }
}
