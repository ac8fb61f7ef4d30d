//! Event delivery: listener tables and the dispatch router.
//!
//! Events arrive as JSON envelopes with a `type` field. The router looks
//! up the event's model, promotes payload fields that name a known
//! resource kind into [`ResourceInstance`]s (reusing live instances via a
//! weak index), then invokes client-wide listeners followed by the
//! promoted instances' scoped listeners. Listeners run in the dispatch
//! context; a panicking listener never prevents the remaining listeners
//! from running.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::{json, Map, Value};
use tracing::{error, warn};

use crate::client::ClientShared;
use crate::constants::EVENT_ERROR;
use crate::resources::{InstanceShared, ResourceInstance, ResourceKind};

/// Callback invoked with a dispatched event.
pub type EventCallback = Arc<dyn Fn(&AriEvent) + Send + Sync + 'static>;

/// Lock a mutex, recovering the guard if a previous holder panicked.
/// Table-holding sections never panic themselves; listener callbacks run
/// outside any lock.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A dispatched event: the raw payload plus any promoted instances, in
/// event-model field order.
#[derive(Clone)]
pub struct AriEvent {
    event_type: String,
    payload: Value,
    promoted: Vec<(String, ResourceInstance)>,
}

impl AriEvent {
    /// The payload `type` field.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// The raw JSON envelope as received.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// One payload field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }

    /// The first promoted instance, for the common single-resource events.
    pub fn instance(&self) -> Option<&ResourceInstance> {
        self.promoted.first().map(|(_, instance)| instance)
    }

    /// All promoted instances with the payload field each came from.
    pub fn instances(&self) -> &[(String, ResourceInstance)] {
        &self.promoted
    }

    /// The instance promoted from a specific payload field.
    pub fn instance_for(&self, field: &str) -> Option<&ResourceInstance> {
        self.promoted
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, instance)| instance)
    }
}

impl std::fmt::Debug for AriEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AriEvent")
            .field("type", &self.event_type)
            .field("promoted", &self.promoted)
            .finish()
    }
}

/// Disposer returned at subscribe time; identifies exactly one
/// registration for removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerHandle {
    pub(crate) event: String,
    pub(crate) id: u64,
}

impl ListenerHandle {
    /// The event name this registration listens for.
    pub fn event(&self) -> &str {
        &self.event
    }
}

struct ListenerEntry {
    id: u64,
    once: bool,
    callback: EventCallback,
}

/// Ordered listener registrations keyed by event name. Used both
/// client-wide and per instance.
#[derive(Default)]
pub(crate) struct ListenerTable {
    next_id: u64,
    by_event: HashMap<String, Vec<ListenerEntry>>,
}

impl ListenerTable {
    pub fn add(&mut self, event: &str, once: bool, callback: EventCallback) -> ListenerHandle {
        self.next_id += 1;
        let id = self.next_id;
        self.by_event
            .entry(event.to_string())
            .or_default()
            .push(ListenerEntry { id, once, callback });
        ListenerHandle {
            event: event.to_string(),
            id,
        }
    }

    /// Remove exactly the entry behind `handle`.
    pub fn remove(&mut self, handle: &ListenerHandle) -> bool {
        let Some(entries) = self.by_event.get_mut(&handle.event) else {
            return false;
        };
        let Some(position) = entries.iter().position(|e| e.id == handle.id) else {
            return false;
        };
        entries.remove(position);
        if entries.is_empty() {
            self.by_event.remove(&handle.event);
        }
        true
    }

    /// Remove all entries for `event`, or everything when `None`.
    pub fn remove_all(&mut self, event: Option<&str>) {
        match event {
            Some(event) => {
                self.by_event.remove(event);
            }
            None => self.by_event.clear(),
        }
    }

    /// Snapshot the callbacks for one event, removing `once` entries
    /// before they are invoked. Registrations made during dispatch apply
    /// to subsequent events only.
    pub fn snapshot(&mut self, event: &str) -> Vec<EventCallback> {
        let Some(entries) = self.by_event.get_mut(event) else {
            return Vec::new();
        };
        let callbacks: Vec<EventCallback> = entries.iter().map(|e| e.callback.clone()).collect();
        entries.retain(|e| !e.once);
        if entries.is_empty() {
            self.by_event.remove(event);
        }
        callbacks
    }

    /// Number of live registrations for one event.
    #[cfg(test)]
    pub fn count(&self, event: &str) -> usize {
        self.by_event.get(event).map_or(0, Vec::len)
    }
}

/// Routes decoded event envelopes to listeners and maintains the weak
/// index of live resource instances.
#[derive(Default)]
pub(crate) struct Router {
    pub(crate) listeners: Mutex<ListenerTable>,
    index: Mutex<HashMap<(ResourceKind, String), Weak<InstanceShared>>>,
}

impl Router {
    /// Produce the instance for `(kind, identity)`, reusing and
    /// field-updating a live one when callers still hold it.
    pub fn intern(
        &self,
        client: &Arc<ClientShared>,
        kind: ResourceKind,
        identity: &str,
        fields: Map<String, Value>,
    ) -> ResourceInstance {
        let key = (kind, identity.to_string());
        let existing = lock(&self.index).get(&key).and_then(Weak::upgrade);
        if let Some(shared) = existing {
            let instance = ResourceInstance { shared };
            instance.update_fields(&fields);
            return instance;
        }

        let shared = Arc::new(InstanceShared {
            kind,
            identity: identity.to_string(),
            fields: Mutex::new(fields),
            listeners: Mutex::new(ListenerTable::default()),
            client: Arc::clone(client),
        });
        let mut index = lock(&self.index);
        index.retain(|_, weak| weak.strong_count() > 0);
        index.insert(key, Arc::downgrade(&shared));
        ResourceInstance { shared }
    }

    /// Dispatch one decoded envelope.
    ///
    /// Client-wide listeners run first, then the scoped listeners of each
    /// promoted instance, each tier in registration order.
    pub fn dispatch(&self, client: &Arc<ClientShared>, payload: Value) {
        let Some(event_type) = payload.get("type").and_then(Value::as_str) else {
            warn!("discarding event without a type field");
            return;
        };
        let event_type = event_type.to_string();
        let promoted = self.promote(client, &event_type, &payload);
        let event = AriEvent {
            event_type,
            payload,
            promoted,
        };

        let callbacks = lock(&self.listeners).snapshot(event.event_type());
        for callback in callbacks {
            self.invoke(&event, &callback);
        }

        let mut seen: HashSet<(ResourceKind, String)> = HashSet::new();
        for (_, instance) in event.instances() {
            if !seen.insert((instance.kind(), instance.id())) {
                continue;
            }
            let callbacks = lock(&instance.shared.listeners).snapshot(event.event_type());
            for callback in callbacks {
                self.invoke(&event, &callback);
            }
        }
    }

    /// Promote payload fields to resource instances.
    ///
    /// Known event models drive promotion by declared field type, in model
    /// order. Unknown event types (server-added) still promote best-effort
    /// from conventionally named payload fields.
    fn promote(
        &self,
        client: &Arc<ClientShared>,
        event_type: &str,
        payload: &Value,
    ) -> Vec<(String, ResourceInstance)> {
        let promotable: Vec<(String, ResourceKind)> = match client.events.event(event_type) {
            Some(model) => model
                .fields
                .iter()
                .filter_map(|f| ResourceKind::from_wire(&f.data_type).map(|k| (f.name.clone(), k)))
                .collect(),
            None => match payload.as_object() {
                Some(object) => object
                    .keys()
                    .filter_map(|name| {
                        ResourceKind::for_field_name(name).map(|k| (name.clone(), k))
                    })
                    .collect(),
                None => Vec::new(),
            },
        };

        let mut promoted = Vec::new();
        for (field, kind) in promotable {
            let Some(object) = payload.get(&field).and_then(Value::as_object) else {
                continue;
            };
            let Some(identity) = object.get(kind.identity_field()).and_then(identity_text) else {
                continue;
            };
            let instance = self.intern(client, kind, &identity, object.clone());
            promoted.push((field, instance));
        }
        promoted
    }

    fn invoke(&self, event: &AriEvent, callback: &EventCallback) {
        if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
            error!("listener for {} panicked", event.event_type());
            self.report_listener_failure(event.event_type());
        }
    }

    /// Deliver a listener failure to the `Error` sink. A failure inside an
    /// `Error` listener is only logged, never re-dispatched.
    fn report_listener_failure(&self, source_type: &str) {
        if source_type == EVENT_ERROR {
            return;
        }
        let event = AriEvent {
            event_type: EVENT_ERROR.to_string(),
            payload: json!({
                "type": EVENT_ERROR,
                "message": format!("listener for {} panicked", source_type),
            }),
            promoted: Vec::new(),
        };
        let callbacks = lock(&self.listeners).snapshot(EVENT_ERROR);
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                error!("Error listener panicked");
            }
        }
    }
}

/// Identity values may arrive as strings or numbers.
pub(crate) fn identity_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> EventCallback {
        Arc::new(|_| {})
    }

    #[test]
    fn test_registration_order_preserved() {
        let mut table = ListenerTable::default();
        table.add("StasisStart", false, noop());
        table.add("StasisStart", false, noop());
        table.add("StasisEnd", false, noop());
        assert_eq!(table.count("StasisStart"), 2);
        assert_eq!(table.count("StasisEnd"), 1);
        assert_eq!(table.snapshot("StasisStart").len(), 2);
    }

    #[test]
    fn test_remove_removes_exactly_one() {
        let mut table = ListenerTable::default();
        let first = table.add("StasisStart", false, noop());
        table.add("StasisStart", false, noop());
        assert!(table.remove(&first));
        assert_eq!(table.count("StasisStart"), 1);
        // Removing again is a no-op.
        assert!(!table.remove(&first));
        assert_eq!(table.count("StasisStart"), 1);
    }

    #[test]
    fn test_remove_all_scoped_to_event() {
        let mut table = ListenerTable::default();
        table.add("StasisStart", false, noop());
        table.add("StasisStart", false, noop());
        table.add("StasisEnd", false, noop());
        table.remove_all(Some("StasisStart"));
        assert_eq!(table.count("StasisStart"), 0);
        assert_eq!(table.count("StasisEnd"), 1);
        table.remove_all(None);
        assert_eq!(table.count("StasisEnd"), 0);
    }

    #[test]
    fn test_once_removed_at_snapshot() {
        let mut table = ListenerTable::default();
        table.add("PlaybackFinished", true, noop());
        table.add("PlaybackFinished", false, noop());
        assert_eq!(table.snapshot("PlaybackFinished").len(), 2);
        // The once entry is gone before its callback ever ran.
        assert_eq!(table.count("PlaybackFinished"), 1);
        assert_eq!(table.snapshot("PlaybackFinished").len(), 1);
    }

    #[test]
    fn test_identity_text_accepts_numbers() {
        assert_eq!(identity_text(&json!("abc")), Some("abc".to_string()));
        assert_eq!(identity_text(&json!(1)), Some("1".to_string()));
        assert_eq!(identity_text(&json!({"id": 1})), None);
    }
}
