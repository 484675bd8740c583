//! Tracing layer that captures log events for assertions.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{subscriber::DefaultGuard, Event, Level, Subscriber};
use tracing_subscriber::{layer::Context, prelude::*, registry::LookupSpan, Layer};

/// One captured event.
#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub level: Level,
    pub message: String,
    pub fields: serde_json::Map<String, serde_json::Value>,
}

/// Shared buffer of captured events.
#[derive(Debug, Clone, Default)]
pub struct LogCapture {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl LogCapture {
    /// Installs a capturing subscriber as the thread's default.
    ///
    /// Events are only captured while the returned guard is alive, and only on this
    /// thread, so tests using it should run on the current-thread runtime.
    #[must_use]
    pub fn install() -> (Self, DefaultGuard) {
        let capture = Self::default();
        let layer = CaptureLayer { events: Arc::clone(&capture.events) };
        let guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(layer));
        (capture, guard)
    }

    #[must_use]
    pub fn events(&self) -> Vec<CapturedEvent> {
        self.events.lock().clone()
    }

    /// Number of events whose message contains `needle`.
    #[must_use]
    pub fn count(&self, needle: &str) -> usize {
        self.events.lock().iter().filter(|e| e.message.contains(needle)).count()
    }

    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        self.count(needle) > 0
    }

    /// Messages at `level`, in order.
    #[must_use]
    pub fn messages_at(&self, level: Level) -> Vec<String> {
        self.events.lock().iter().filter(|e| e.level == level).map(|e| e.message.clone()).collect()
    }
}

struct CaptureLayer {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

struct FieldVisitor {
    fields: serde_json::Map<String, serde_json::Value>,
    message: Option<String>,
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        let value_str = format!("{value:?}");
        if field.name() == "message" {
            self.message = Some(value_str);
        } else {
            self.fields.insert(field.name().to_string(), serde_json::Value::String(value_str));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields
                .insert(field.name().to_string(), serde_json::Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.fields.insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.fields.insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.fields.insert(field.name().to_string(), serde_json::Value::Bool(value));
    }
}

impl<S> Layer<S> for CaptureLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor { fields: serde_json::Map::new(), message: None };
        event.record(&mut visitor);
        self.events.lock().push(CapturedEvent {
            level: *event.metadata().level(),
            message: visitor.message.unwrap_or_default(),
            fields: visitor.fields,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_records_message_and_fields() {
        let (capture, _guard) = LogCapture::install();
        tracing::warn!(node = "a", attempt = 3u64, "Poll failure");

        let events = capture.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].level, Level::WARN);
        assert_eq!(events[0].message, "Poll failure");
        assert_eq!(events[0].fields["node"], serde_json::json!("a"));
        assert_eq!(events[0].fields["attempt"], serde_json::json!(3));
        assert_eq!(capture.messages_at(Level::WARN), vec!["Poll failure".to_string()]);
    }
}
