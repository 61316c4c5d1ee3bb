// ── Named-event listeners ──
//
// Caller-supplied handlers for stream events, keyed by event name. The
// registry is shared with the processor and may be edited while streaming.

use std::fmt;
use std::num::FpCategory;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

/// Handles one named stream event.
pub trait EventListener: Send + Sync {
    /// Parse the raw event data. `None`, or a falsy value (see
    /// [`is_falsy`]), marks the data as malformed.
    fn deserialize_data(&self, data: &str) -> Option<Value>;

    /// Receive successfully parsed data.
    fn process_json(&self, json: Value);
}

/// `null`, `false`, zero and the empty string carry no usable payload.
pub fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(flag) => !flag,
        Value::Number(number) => number
            .as_f64()
            .is_some_and(|n| n.classify() == FpCategory::Zero),
        Value::String(text) => text.is_empty(),
        Value::Array(_) | Value::Object(_) => false,
    }
}

/// Listener parsing data as JSON and handing it to a closure.
pub struct JsonListener<F> {
    process: F,
}

impl<F> JsonListener<F>
where
    F: Fn(Value) + Send + Sync,
{
    pub fn new(process: F) -> Self {
        Self { process }
    }
}

impl<F> EventListener for JsonListener<F>
where
    F: Fn(Value) + Send + Sync,
{
    fn deserialize_data(&self, data: &str) -> Option<Value> {
        serde_json::from_str(data).ok().filter(|json| !is_falsy(json))
    }

    fn process_json(&self, json: Value) {
        (self.process)(json);
    }
}

impl<F> fmt::Debug for JsonListener<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonListener").finish_non_exhaustive()
    }
}

/// Event name to listener. At most one listener per name.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: DashMap<String, Arc<dyn EventListener>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the listener previously registered under `event_name`.
    pub fn insert(
        &self,
        event_name: impl Into<String>,
        listener: Arc<dyn EventListener>,
    ) -> Option<Arc<dyn EventListener>> {
        self.listeners.insert(event_name.into(), listener)
    }

    pub fn remove(&self, event_name: &str) -> Option<Arc<dyn EventListener>> {
        self.listeners.remove(event_name).map(|(_, listener)| listener)
    }

    /// Cloned out so no map shard stays locked while the listener runs.
    pub fn get(&self, event_name: &str) -> Option<Arc<dyn EventListener>> {
        self.listeners
            .get(event_name)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Registered names, sorted.
    pub fn event_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.listeners.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("event_names", &self.event_names())
            .finish()
    }
}
