use std::collections::BTreeMap;
use std::sync::Mutex;

use tracing::debug;

/// A single fire-and-forget metric event: a flat map of numbers and strings.
pub type MetricEvent = BTreeMap<String, serde_json::Value>;

/// External metrics collaborator. Delivery is best-effort: `emit` never
/// fails and task completion never blocks on the sink.
pub trait MetricsSink: Send + Sync {
    fn emit(&self, event: MetricEvent);
}

/// Emits every event as a structured log line.
pub struct LogSink;

impl MetricsSink for LogSink {
    fn emit(&self, event: MetricEvent) {
        match serde_json::to_string(&event) {
            Ok(line) => debug!(metric = %line, "metric emitted"),
            Err(_) => debug!("metric emitted (unencodable)"),
        }
    }
}

/// Drops every event. For callers that opt out of metrics entirely.
pub struct NullSink;

impl MetricsSink for NullSink {
    fn emit(&self, _event: MetricEvent) {}
}

/// Buffers events for assertions in tests.
#[derive(Default)]
pub struct CapturingSink {
    events: Mutex<Vec<MetricEvent>>,
}

impl CapturingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl MetricsSink for CapturingSink {
    fn emit(&self, event: MetricEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

/// Build a metric event from key/value pairs.
pub fn event<const N: usize>(fields: [(&str, serde_json::Value); N]) -> MetricEvent {
    fields
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}
