use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use parking_lot::RwLock;
use serde_json::{Map, Value};
use shared::protocol::{EVENT_MESSAGE, EVENT_SERVER_MESSAGE};
use tracing::{debug, error, warn};

/// Local signal names emitted by the transport, never sent by the server.
pub const SIGNAL_CONNECT: &str = "connect";
pub const SIGNAL_DISCONNECT: &str = "disconnect";
pub const SIGNAL_ERROR: &str = "error";

pub type Handler = Arc<dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync>;

pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Canonical result of decoding one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// A frame naming its event through `type` (or `event`).
    Typed { event: String, body: Value },
    /// Legacy `{sender, message}` announcement.
    ServerMessage(Value),
    /// Valid JSON of no known shape.
    Unrecognized(Value),
}

impl InboundFrame {
    pub fn event_name(&self) -> &str {
        match self {
            InboundFrame::Typed { event, .. } => event,
            InboundFrame::ServerMessage(_) => EVENT_SERVER_MESSAGE,
            InboundFrame::Unrecognized(_) => EVENT_MESSAGE,
        }
    }

    pub fn body(&self) -> &Value {
        match self {
            InboundFrame::Typed { body, .. } => body,
            InboundFrame::ServerMessage(body) | InboundFrame::Unrecognized(body) => body,
        }
    }
}

fn lowercase_keys(object: Map<String, Value>) -> Map<String, Value> {
    object
        .into_iter()
        .map(|(key, value)| (key.to_lowercase(), value))
        .collect()
}

fn string_field<'a>(object: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| object.get(*key).and_then(Value::as_str))
        .filter(|name| !name.is_empty())
}

/// Decodes a raw text frame. Returns `None` only when the frame is not JSON.
///
/// The server's envelope is unversioned: keys may be upper-cased, the logical
/// envelope may sit under `payload`, and the whole frame may be JSON encoded
/// twice.
pub fn decode_frame(raw: &str) -> Option<InboundFrame> {
    let mut parsed: Value = serde_json::from_str(raw).ok()?;
    if let Value::String(inner) = &parsed {
        if let Ok(reparsed) = serde_json::from_str::<Value>(inner) {
            parsed = reparsed;
        }
    }

    let Value::Object(top) = parsed else {
        return Some(InboundFrame::Unrecognized(parsed));
    };
    let top = lowercase_keys(top);

    let nested = match top.get("payload").or_else(|| top.get("data")) {
        Some(Value::Object(inner)) => Some(lowercase_keys(inner.clone())),
        _ => None,
    };
    let logical = nested.as_ref().unwrap_or(&top);

    let event = string_field(logical, &["type", "event"]).or_else(|| {
        nested
            .as_ref()
            .and_then(|_| string_field(&top, &["type", "event"]))
    });
    if let Some(event) = event {
        let body = logical
            .get("message")
            .cloned()
            .unwrap_or_else(|| Value::Object(logical.clone()));
        return Some(InboundFrame::Typed {
            event: event.to_string(),
            body,
        });
    }

    if logical.contains_key("sender") && logical.contains_key("message") {
        return Some(InboundFrame::ServerMessage(Value::Object(logical.clone())));
    }

    Some(InboundFrame::Unrecognized(Value::Object(top)))
}

/// Routes decoded events to handlers registered per event type.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: RwLock<HashMap<String, Vec<Handler>>>,
}

impl EventDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `handler` for `event`. Registering the same handler twice is
    /// a no-op; returns whether it was added.
    pub fn on(&self, event: &str, handler: Handler) -> bool {
        let mut guard = self.handlers.write();
        let set = guard.entry(event.to_string()).or_default();
        if set.iter().any(|existing| Arc::ptr_eq(existing, &handler)) {
            return false;
        }
        set.push(handler);
        true
    }

    pub fn off(&self, event: &str, handler: &Handler) -> bool {
        let mut guard = self.handlers.write();
        let Some(set) = guard.get_mut(event) else {
            return false;
        };
        let before = set.len();
        set.retain(|existing| !Arc::ptr_eq(existing, handler));
        let removed = set.len() != before;
        if set.is_empty() {
            guard.remove(event);
        }
        removed
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.handlers.read().get(event).map_or(0, Vec::len)
    }

    /// Runs the handlers registered for `event` in registration order and
    /// returns how many ran. Iterates over a snapshot, so handlers may
    /// register or unregister while being dispatched.
    pub fn emit(&self, event: &str, payload: &Value) -> usize {
        let snapshot = match self.handlers.read().get(event) {
            Some(set) => set.clone(),
            None => return 0,
        };

        for handler in &snapshot {
            match catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(event, error = %err, "event handler failed"),
                Err(_) => error!(event, "event handler panicked"),
            }
        }
        snapshot.len()
    }

    /// Decodes and routes one raw text frame. Undecodable frames are dropped.
    pub fn dispatch_frame(&self, raw: &str) -> Option<InboundFrame> {
        let Some(frame) = decode_frame(raw) else {
            debug!(len = raw.len(), "dropping undecodable frame");
            return None;
        };
        self.emit(frame.event_name(), frame.body());
        Some(frame)
    }
}

#[cfg(test)]
#[path = "tests/dispatcher_tests.rs"]
mod tests;
