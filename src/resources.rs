//! Resource kinds, instances, namespaces, and local instance creation.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::client::ClientShared;
use crate::error::AriResult;
use crate::events::{lock, AriEvent, ListenerHandle, ListenerTable};

/// The closed set of server-managed entity kinds that participate in
/// event scoping and local instance creation.
///
/// Serializes as the model name used in schema documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Bridge,
    Channel,
    Playback,
    LiveRecording,
    Mailbox,
    DeviceState,
    Endpoint,
    Sound,
    Application,
}

impl ResourceKind {
    /// Every kind, for iteration.
    pub const ALL: [ResourceKind; 9] = [
        ResourceKind::Bridge,
        ResourceKind::Channel,
        ResourceKind::Playback,
        ResourceKind::LiveRecording,
        ResourceKind::Mailbox,
        ResourceKind::DeviceState,
        ResourceKind::Endpoint,
        ResourceKind::Sound,
        ResourceKind::Application,
    ];

    /// Model name as it appears in schema documents.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Bridge => "Bridge",
            ResourceKind::Channel => "Channel",
            ResourceKind::Playback => "Playback",
            ResourceKind::LiveRecording => "LiveRecording",
            ResourceKind::Mailbox => "Mailbox",
            ResourceKind::DeviceState => "DeviceState",
            ResourceKind::Endpoint => "Endpoint",
            ResourceKind::Sound => "Sound",
            ResourceKind::Application => "Application",
        }
    }

    /// Parse a declared model type name.
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "Bridge" => Some(ResourceKind::Bridge),
            "Channel" => Some(ResourceKind::Channel),
            "Playback" => Some(ResourceKind::Playback),
            "LiveRecording" => Some(ResourceKind::LiveRecording),
            "Mailbox" => Some(ResourceKind::Mailbox),
            "DeviceState" => Some(ResourceKind::DeviceState),
            "Endpoint" => Some(ResourceKind::Endpoint),
            "Sound" => Some(ResourceKind::Sound),
            "Application" => Some(ResourceKind::Application),
            _ => None,
        }
    }

    /// REST namespace the kind's operations live under.
    pub fn namespace(&self) -> &'static str {
        match self {
            ResourceKind::Bridge => "bridges",
            ResourceKind::Channel => "channels",
            ResourceKind::Playback => "playbacks",
            ResourceKind::LiveRecording => "recordings",
            ResourceKind::Mailbox => "mailboxes",
            ResourceKind::DeviceState => "deviceStates",
            ResourceKind::Endpoint => "endpoints",
            ResourceKind::Sound => "sounds",
            ResourceKind::Application => "applications",
        }
    }

    /// Payload field identifying an instance of this kind.
    pub fn identity_field(&self) -> &'static str {
        match self {
            ResourceKind::Bridge | ResourceKind::Channel | ResourceKind::Playback => "id",
            _ => "name",
        }
    }

    /// Operation parameter names auto-filled from an instance.
    pub fn identity_params(&self) -> &'static [&'static str] {
        match self {
            ResourceKind::Bridge => &["bridgeId"],
            ResourceKind::Channel => &["channelId"],
            ResourceKind::Playback => &["playbackId"],
            ResourceKind::LiveRecording => &["recordingName"],
            ResourceKind::Mailbox => &["mailboxName"],
            ResourceKind::DeviceState => &["deviceName"],
            ResourceKind::Endpoint => &["tech", "resource"],
            ResourceKind::Sound => &["soundId"],
            ResourceKind::Application => &["applicationName"],
        }
    }

    /// Conventional payload field names carrying this kind, used for
    /// best-effort promotion when the event type is not in the schema.
    pub fn for_field_name(name: &str) -> Option<Self> {
        match name {
            "bridge" => Some(ResourceKind::Bridge),
            "channel" | "peer" | "replace_channel" => Some(ResourceKind::Channel),
            "playback" => Some(ResourceKind::Playback),
            "recording" => Some(ResourceKind::LiveRecording),
            "mailbox" => Some(ResourceKind::Mailbox),
            "device_state" => Some(ResourceKind::DeviceState),
            "endpoint" => Some(ResourceKind::Endpoint),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mint an identifier for a locally created instance.
pub(crate) fn generate_instance_id() -> String {
    Uuid::new_v4().to_string()
}

/// Shared state behind a [`ResourceInstance`] handle.
///
/// The router's instance index holds these weakly: an instance lives as
/// long as a caller handle or an attached listener's handle does.
pub(crate) struct InstanceShared {
    pub(crate) kind: ResourceKind,
    pub(crate) identity: String,
    pub(crate) fields: Mutex<Map<String, Value>>,
    pub(crate) listeners: Mutex<ListenerTable>,
    pub(crate) client: Arc<ClientShared>,
}

/// A handle to one server-side (or locally minted, not yet persisted)
/// resource.
///
/// Cloning is cheap and clones refer to the same underlying instance:
/// events promoted for this resource's identity update the shared fields
/// and fire the shared scoped listeners.
#[derive(Clone)]
pub struct ResourceInstance {
    pub(crate) shared: Arc<InstanceShared>,
}

impl ResourceInstance {
    /// The kind tag.
    pub fn kind(&self) -> ResourceKind {
        self.shared.kind
    }

    /// Server-observed identity (`id` for most kinds, `name` for the rest).
    pub fn id(&self) -> String {
        self.shared.identity.clone()
    }

    /// One field of the last server-observed state.
    pub fn field(&self, name: &str) -> Option<Value> {
        lock(&self.shared.fields).get(name).cloned()
    }

    /// Snapshot of all fields.
    pub fn fields(&self) -> Map<String, Value> {
        lock(&self.shared.fields).clone()
    }

    /// Assign fresh server-observed fields onto the instance.
    pub(crate) fn update_fields(&self, fields: &Map<String, Value>) {
        let mut current = lock(&self.shared.fields);
        for (name, value) in fields {
            current.insert(name.clone(), value.clone());
        }
    }

    /// Invoke an operation of this kind's namespace with the identity
    /// parameter pre-bound. Explicitly passed identity values win.
    pub async fn request(&self, operation: &str, opts: &Value) -> AriResult<AriResponse> {
        let mut bound: Map<String, Value> = match opts {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        for param in self.kind().identity_params() {
            if !bound.contains_key(*param) {
                if let Some(value) = self.identity_param_value(param) {
                    bound.insert((*param).to_string(), value);
                }
            }
        }
        self.shared
            .client
            .execute(self.kind().namespace(), operation, &Value::Object(bound))
            .await
    }

    fn identity_param_value(&self, param: &str) -> Option<Value> {
        match (self.kind(), param) {
            (ResourceKind::Endpoint, "tech") => self.field("technology"),
            (ResourceKind::Endpoint, "resource") => self
                .field("resource")
                .or_else(|| Some(Value::String(self.id()))),
            _ => Some(Value::String(self.id())),
        }
    }

    /// Register a scoped listener: it fires only for events whose payload
    /// promotes to this instance's identity.
    pub fn on(&self, event: &str, callback: impl Fn(&AriEvent) + Send + Sync + 'static) -> ListenerHandle {
        lock(&self.shared.listeners).add(event, false, Arc::new(callback))
    }

    /// Register a scoped listener that fires at most once.
    pub fn once(
        &self,
        event: &str,
        callback: impl Fn(&AriEvent) + Send + Sync + 'static,
    ) -> ListenerHandle {
        lock(&self.shared.listeners).add(event, true, Arc::new(callback))
    }

    /// Alias for [`on`](Self::on).
    pub fn add_listener(
        &self,
        event: &str,
        callback: impl Fn(&AriEvent) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.on(event, callback)
    }

    /// Remove exactly the registration behind `handle`. Returns whether an
    /// entry was removed.
    pub fn remove_listener(&self, handle: &ListenerHandle) -> bool {
        lock(&self.shared.listeners).remove(handle)
    }

    /// Remove all scoped listeners for `event`, or every scoped listener
    /// when `event` is `None`.
    pub fn remove_all_listeners(&self, event: Option<&str>) {
        lock(&self.shared.listeners).remove_all(event);
    }
}

impl std::fmt::Debug for ResourceInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceInstance")
            .field("kind", &self.shared.kind)
            .field("id", &self.shared.identity)
            .finish()
    }
}

/// Shaped result of an operation call.
#[derive(Debug, Clone)]
pub enum AriResponse {
    /// The operation's declared response was a known resource kind.
    Resource(ResourceInstance),
    /// The declared response was a list of a known resource kind.
    Resources(Vec<ResourceInstance>),
    /// Anything else, including empty bodies (`Null`).
    Value(Value),
}

impl AriResponse {
    /// The promoted instance, when the response was a single resource.
    pub fn resource(&self) -> Option<&ResourceInstance> {
        match self {
            AriResponse::Resource(instance) => Some(instance),
            _ => None,
        }
    }

    /// Consume into the promoted instance, when present.
    pub fn into_resource(self) -> Option<ResourceInstance> {
        match self {
            AriResponse::Resource(instance) => Some(instance),
            _ => None,
        }
    }

    /// Consume into the promoted list, when present.
    pub fn into_resources(self) -> Option<Vec<ResourceInstance>> {
        match self {
            AriResponse::Resources(instances) => Some(instances),
            _ => None,
        }
    }

    /// The raw value, when the response was not resource-shaped.
    pub fn value(&self) -> Option<&Value> {
        match self {
            AriResponse::Value(value) => Some(value),
            _ => None,
        }
    }
}

/// One resource namespace of the loaded catalog, e.g. `channels`.
#[derive(Clone)]
pub struct ResourceNamespace {
    pub(crate) name: String,
    pub(crate) client: Arc<ClientShared>,
}

impl ResourceNamespace {
    /// Namespace name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke an operation of this namespace.
    pub async fn request(&self, operation: &str, opts: &Value) -> AriResult<AriResponse> {
        self.client.execute(&self.name, operation, opts).await
    }
}

impl std::fmt::Debug for ResourceNamespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceNamespace")
            .field("name", &self.name)
            .finish()
    }
}

/// Builds a resource instance locally, before the server knows about it.
///
/// Listeners may be attached to the result right away; the router matches
/// them as soon as events reference the pre-allocated identity.
pub struct InstanceBuilder {
    pub(crate) client: Arc<ClientShared>,
    pub(crate) kind: ResourceKind,
    pub(crate) id: Option<String>,
    pub(crate) fields: Map<String, Value>,
}

impl InstanceBuilder {
    /// Use a caller-chosen identity instead of a generated one.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set one initial field.
    pub fn field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Shallow-copy initial fields onto the instance.
    pub fn fields(mut self, fields: &Map<String, Value>) -> Self {
        for (name, value) in fields {
            self.fields.insert(name.clone(), value.clone());
        }
        self
    }

    /// Mint the instance and register it for event scoping.
    pub fn build(self) -> ResourceInstance {
        let identity = self.id.unwrap_or_else(generate_instance_id);
        let mut fields = self.fields;
        fields
            .entry(self.kind.identity_field().to_string())
            .or_insert_with(|| Value::String(identity.clone()));
        self.client
            .router
            .intern(&self.client, self.kind, &identity, fields)
    }
}
