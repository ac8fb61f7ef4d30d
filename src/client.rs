//! The ARI client facade.

use std::sync::{Arc, Mutex};

use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tracing::{debug, info};
use url::Url;

use crate::constants::DEFAULT_BASE_PATH;
use crate::error::{AriError, AriResult};
use crate::events::{identity_text, lock, AriEvent, ListenerHandle, Router};
use crate::http::HttpInvoker;
use crate::request;
use crate::resources::{
    AriResponse, InstanceBuilder, ResourceInstance, ResourceKind, ResourceNamespace,
};
use crate::schema::{self, Catalog, EventSchema, OperationDescriptor};
use crate::websocket::{Session, SessionState};

/// Connection tuning recognized by [`Ari::connect_with_options`].
///
/// Use [`Default::default()`] for standard settings.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Ceiling for the exponential reconnect backoff, in milliseconds.
    pub reconnect_ceiling_ms: u64,
    /// Consecutive failed connect attempts tolerated before the session
    /// gives up with `WebSocketMaxRetries`.
    pub max_consecutive_failures: u32,
    /// Reconnect when no frame arrives for this long. Zero disables.
    pub idle_timeout_ms: u64,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            reconnect_ceiling_ms: crate::constants::DEFAULT_RECONNECT_CEILING_MS,
            max_consecutive_failures: crate::constants::DEFAULT_MAX_CONSECUTIVE_FAILURES,
            idle_timeout_ms: crate::constants::DEFAULT_IDLE_TIMEOUT_MS,
        }
    }
}

/// State shared by the [`Ari`] handle, resource instances, and the
/// session task.
pub(crate) struct ClientShared {
    pub(crate) base_url: Url,
    pub(crate) username: String,
    pub(crate) password: String,
    pub(crate) options: ConnectOptions,
    pub(crate) catalog: Catalog,
    pub(crate) events: EventSchema,
    pub(crate) http: HttpInvoker,
    pub(crate) router: Router,
    cancel_tx: watch::Sender<u64>,
    session: Mutex<Option<Session>>,
}

impl ClientShared {
    /// Bind and execute one catalog operation, shaping the response.
    pub(crate) async fn execute(
        self: &Arc<Self>,
        resource: &str,
        operation: &str,
        opts: &Value,
    ) -> AriResult<AriResponse> {
        let descriptor = self
            .catalog
            .resource(resource)
            .ok_or_else(|| AriError::UnknownResource {
                name: resource.to_string(),
            })?;
        let op = descriptor
            .operation(operation)
            .ok_or_else(|| AriError::UnknownOperation {
                resource: resource.to_string(),
                operation: operation.to_string(),
            })?;

        let plan = request::bind(&self.base_url, op, opts)?;
        let mut cancel_rx = self.cancel_tx.subscribe();
        let (status, value) = tokio::select! {
            result = self.http.invoke(&plan) => result?,
            _ = cancel_rx.changed() => return Err(AriError::Cancelled),
        };
        debug!("{}.{} -> {}", resource, operation, status);
        Ok(self.shape(op, value))
    }

    /// Shape a decoded response by the operation's declared type: known
    /// resource kinds become instances, everything else passes through.
    fn shape(self: &Arc<Self>, op: &OperationDescriptor, value: Value) -> AriResponse {
        let Some(type_name) = op.response_type.as_deref() else {
            return AriResponse::Value(value);
        };

        if let Some(kind) = ResourceKind::from_wire(type_name) {
            if let Value::Object(fields) = value {
                return match self.adopt(kind, fields.clone()) {
                    Some(instance) => AriResponse::Resource(instance),
                    None => AriResponse::Value(Value::Object(fields)),
                };
            }
            return AriResponse::Value(value);
        }

        let item_kind = type_name
            .strip_prefix("List[")
            .and_then(|t| t.strip_suffix(']'))
            .and_then(ResourceKind::from_wire);
        if let Some(kind) = item_kind {
            if let Value::Array(items) = value {
                let instances = items
                    .into_iter()
                    .filter_map(|item| match item {
                        Value::Object(fields) => self.adopt(kind, fields),
                        _ => None,
                    })
                    .collect();
                return AriResponse::Resources(instances);
            }
            return AriResponse::Value(value);
        }

        AriResponse::Value(value)
    }

    /// Wrap response fields into an instance, reusing a live one.
    fn adopt(
        self: &Arc<Self>,
        kind: ResourceKind,
        fields: Map<String, Value>,
    ) -> Option<ResourceInstance> {
        let identity = fields.get(kind.identity_field()).and_then(identity_text)?;
        Some(self.router.intern(self, kind, &identity, fields))
    }

    /// Route a client lifecycle event through the dispatcher.
    pub(crate) fn dispatch_lifecycle(self: &Arc<Self>, event_type: &str) {
        self.router.dispatch(self, json!({ "type": event_type }));
    }
}

/// An ARI client.
///
/// Created with [`Ari::connect`], which loads the server's
/// self-description and materializes the operation catalog. The WebSocket
/// event session is opened separately with [`Ari::start`]. Cloning is
/// cheap; clones share the catalog, listener tables, and session.
#[derive(Clone)]
pub struct Ari {
    shared: Arc<ClientShared>,
}

impl Ari {
    /// Connect to an ARI server and load its self-description.
    ///
    /// The WebSocket is not opened yet; call [`start`](Self::start) to
    /// begin receiving events. Reachability failures (DNS, connection
    /// refused, TLS) surface as [`AriError::HostIsNotReachable`].
    pub async fn connect(base_url: &str, username: &str, password: &str) -> AriResult<Self> {
        Self::connect_with_options(base_url, username, password, ConnectOptions::default()).await
    }

    /// [`connect`](Self::connect) with explicit tuning.
    pub async fn connect_with_options(
        base_url: &str,
        username: &str,
        password: &str,
        options: ConnectOptions,
    ) -> AriResult<Self> {
        let base = normalize_base_url(base_url)?;
        info!("connecting to ARI at {}", base);

        let http = HttpInvoker::new(username, password)?;
        let (catalog, events) = schema::load(&http, &base).await?;

        let (cancel_tx, _) = watch::channel(0u64);
        Ok(Ari {
            shared: Arc::new(ClientShared {
                base_url: base,
                username: username.to_string(),
                password: password.to_string(),
                options,
                catalog,
                events,
                http,
                router: Router::default(),
                cancel_tx,
                session: Mutex::new(None),
            }),
        })
    }

    /// Open the event WebSocket for the given Stasis application names.
    ///
    /// The session signals its lifecycle through the `WebSocketConnected`,
    /// `WebSocketReconnecting`, and `WebSocketMaxRetries` client events.
    /// Starting while a session is running replaces it.
    pub fn start<I, S>(&self, apps: I) -> AriResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.start_inner(apps.into_iter().map(Into::into).collect(), false)
    }

    /// [`start`](Self::start), additionally subscribing to all server
    /// events regardless of application ownership.
    pub fn start_subscribe_all<I, S>(&self, apps: I) -> AriResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.start_inner(apps.into_iter().map(Into::into).collect(), true)
    }

    fn start_inner(&self, apps: Vec<String>, subscribe_all: bool) -> AriResult<()> {
        if apps.is_empty() {
            return Err(AriError::MissingRequiredParameter {
                name: "app".to_string(),
            });
        }
        let mut slot = lock(&self.shared.session);
        if let Some(previous) = slot.take() {
            debug!("replacing running event session");
            previous.stop();
        }
        *slot = Some(Session::spawn(&self.shared, apps, subscribe_all));
        Ok(())
    }

    /// Close the event session. Idempotent; safe before [`start`](Self::start).
    ///
    /// Cancels an in-flight reconnect wait. Frames received after this
    /// point produce no listener invocations until `start` is called
    /// again.
    pub fn stop(&self) {
        if let Some(session) = lock(&self.shared.session).take() {
            session.stop();
            info!("event session stopped");
        }
    }

    /// Lifecycle state of the current session, `Idle` when none started.
    pub fn session_state(&self) -> SessionState {
        lock(&self.shared.session)
            .as_ref()
            .map(Session::state)
            .unwrap_or(SessionState::Idle)
    }

    /// Fail all in-flight operation calls with [`AriError::Cancelled`].
    pub fn cancel_pending(&self) {
        self.shared.cancel_tx.send_modify(|generation| *generation += 1);
    }

    /// The loaded operation catalog.
    pub fn catalog(&self) -> &Catalog {
        &self.shared.catalog
    }

    /// The loaded event model.
    pub fn event_schema(&self) -> &EventSchema {
        &self.shared.events
    }

    /// Sorted names of the loaded resource namespaces.
    pub fn resource_names(&self) -> Vec<String> {
        self.shared
            .catalog
            .resource_names()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Look up a loaded resource namespace by name.
    pub fn namespace(&self, name: &str) -> Option<ResourceNamespace> {
        self.shared
            .catalog
            .resource(name)
            .map(|descriptor| ResourceNamespace {
                name: descriptor.name().to_string(),
                client: Arc::clone(&self.shared),
            })
    }

    fn kind_namespace(&self, kind: ResourceKind) -> ResourceNamespace {
        ResourceNamespace {
            name: kind.namespace().to_string(),
            client: Arc::clone(&self.shared),
        }
    }

    /// The `channels` namespace.
    pub fn channels(&self) -> ResourceNamespace {
        self.kind_namespace(ResourceKind::Channel)
    }

    /// The `bridges` namespace.
    pub fn bridges(&self) -> ResourceNamespace {
        self.kind_namespace(ResourceKind::Bridge)
    }

    /// The `playbacks` namespace.
    pub fn playbacks(&self) -> ResourceNamespace {
        self.kind_namespace(ResourceKind::Playback)
    }

    /// The `recordings` namespace.
    pub fn recordings(&self) -> ResourceNamespace {
        self.kind_namespace(ResourceKind::LiveRecording)
    }

    /// The `endpoints` namespace.
    pub fn endpoints(&self) -> ResourceNamespace {
        self.kind_namespace(ResourceKind::Endpoint)
    }

    /// The `sounds` namespace.
    pub fn sounds(&self) -> ResourceNamespace {
        self.kind_namespace(ResourceKind::Sound)
    }

    /// The `mailboxes` namespace.
    pub fn mailboxes(&self) -> ResourceNamespace {
        self.kind_namespace(ResourceKind::Mailbox)
    }

    /// The `deviceStates` namespace.
    pub fn device_states(&self) -> ResourceNamespace {
        self.kind_namespace(ResourceKind::DeviceState)
    }

    /// The `applications` namespace.
    pub fn applications(&self) -> ResourceNamespace {
        self.kind_namespace(ResourceKind::Application)
    }

    /// Build a resource instance locally, before any server interaction.
    ///
    /// Without an explicit id a fresh UUID-shaped identifier is minted, so
    /// listeners can be attached before the server knows the resource.
    pub fn instance(&self, kind: ResourceKind) -> InstanceBuilder {
        InstanceBuilder {
            client: Arc::clone(&self.shared),
            kind,
            id: None,
            fields: Map::new(),
        }
    }

    /// Invoke an operation by namespace and nickname.
    pub async fn request(
        &self,
        resource: &str,
        operation: &str,
        opts: &Value,
    ) -> AriResult<AriResponse> {
        self.shared.execute(resource, operation, opts).await
    }

    /// Register a client-wide listener for `event`.
    pub fn on(
        &self,
        event: &str,
        callback: impl Fn(&AriEvent) + Send + Sync + 'static,
    ) -> ListenerHandle {
        lock(&self.shared.router.listeners).add(event, false, Arc::new(callback))
    }

    /// Register a client-wide listener that fires at most once.
    pub fn once(
        &self,
        event: &str,
        callback: impl Fn(&AriEvent) + Send + Sync + 'static,
    ) -> ListenerHandle {
        lock(&self.shared.router.listeners).add(event, true, Arc::new(callback))
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
        lock(&self.shared.router.listeners).remove(handle)
    }

    /// Remove all client-wide listeners for `event`, or every client-wide
    /// listener when `event` is `None`.
    pub fn remove_all_listeners(&self, event: Option<&str>) {
        lock(&self.shared.router.listeners).remove_all(event);
    }
}

impl std::fmt::Debug for Ari {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ari")
            .field("base_url", &self.shared.base_url.as_str())
            .field("resources", &self.shared.catalog.len())
            .finish()
    }
}

/// A bare host URL gets the conventional `/ari` prefix; anything with an
/// explicit path is used verbatim.
fn normalize_base_url(raw: &str) -> AriResult<Url> {
    let mut url = Url::parse(raw)?;
    if url.path().is_empty() || url.path() == "/" {
        url.set_path(DEFAULT_BASE_PATH);
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn events_doc() -> Value {
        json!({
            "models": {
                "BridgeDestroyed": {"properties": {"bridge": {"type": "Bridge"}}},
                "BridgeMerged": {"properties": {
                    "bridge": {"type": "Bridge"},
                    "bridge_from": {"type": "Bridge"}
                }},
                "PlaybackFinished": {"properties": {"playback": {"type": "Playback"}}},
                "ChannelStateChange": {"properties": {"channel": {"type": "Channel"}}},
                "ChannelDtmfReceived": {"properties": {
                    "digit": {"type": "string"},
                    "channel": {"type": "Channel"}
                }}
            }
        })
    }

    fn test_client() -> Arc<ClientShared> {
        let (cancel_tx, _) = watch::channel(0u64);
        Arc::new(ClientShared {
            base_url: Url::parse("http://127.0.0.1:8088/ari").unwrap(),
            username: "asterisk".to_string(),
            password: "asterisk".to_string(),
            options: ConnectOptions::default(),
            catalog: Catalog::default(),
            events: schema::parse_events_doc(&events_doc()).unwrap(),
            http: HttpInvoker::new("asterisk", "asterisk").unwrap(),
            router: Router::default(),
            cancel_tx,
            session: Mutex::new(None),
        })
    }

    fn local_bridge(client: &Arc<ClientShared>, id: &str) -> ResourceInstance {
        InstanceBuilder {
            client: Arc::clone(client),
            kind: ResourceKind::Bridge,
            id: Some(id.to_string()),
            fields: Map::new(),
        }
        .build()
    }

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(
            normalize_base_url("http://pbx:8088").unwrap().as_str(),
            "http://pbx:8088/ari"
        );
        assert_eq!(
            normalize_base_url("http://pbx:8088/custom").unwrap().as_str(),
            "http://pbx:8088/custom"
        );
        assert!(normalize_base_url("not a url").is_err());
    }

    #[test]
    fn test_scoped_listener_fires_only_for_matching_identity() {
        let client = test_client();
        let b1 = local_bridge(&client, "b1");
        let b2 = local_bridge(&client, "b2");

        let b1_hits = Arc::new(AtomicUsize::new(0));
        let b2_hits = Arc::new(AtomicUsize::new(0));
        let wide_hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&b1_hits);
        b1.on("BridgeDestroyed", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = Arc::clone(&b2_hits);
        b2.on("BridgeDestroyed", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = Arc::clone(&wide_hits);
        lock(&client.router.listeners).add(
            "BridgeDestroyed",
            false,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        client.router.dispatch(
            &client,
            json!({"type": "BridgeDestroyed", "bridge": {"id": "b1"}}),
        );
        assert_eq!(b1_hits.load(Ordering::SeqCst), 1);
        assert_eq!(b2_hits.load(Ordering::SeqCst), 0);
        assert_eq!(wide_hits.load(Ordering::SeqCst), 1);

        client.router.dispatch(
            &client,
            json!({"type": "BridgeDestroyed", "bridge": {"id": "b2"}}),
        );
        assert_eq!(b1_hits.load(Ordering::SeqCst), 1);
        assert_eq!(b2_hits.load(Ordering::SeqCst), 1);
        assert_eq!(wide_hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_client_wide_listeners_run_before_scoped() {
        let client = test_client();
        let bridge = local_bridge(&client, "b1");

        let order = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&order);
        bridge.on("BridgeDestroyed", move |_| {
            lock(&log).push("scoped");
        });
        let log = Arc::clone(&order);
        lock(&client.router.listeners).add(
            "BridgeDestroyed",
            false,
            Arc::new(move |_| {
                lock(&log).push("wide-1");
            }),
        );
        let log = Arc::clone(&order);
        lock(&client.router.listeners).add(
            "BridgeDestroyed",
            false,
            Arc::new(move |_| {
                lock(&log).push("wide-2");
            }),
        );

        client.router.dispatch(
            &client,
            json!({"type": "BridgeDestroyed", "bridge": {"id": "b1"}}),
        );
        assert_eq!(*lock(&order), vec!["wide-1", "wide-2", "scoped"]);
    }

    #[test]
    fn test_once_fires_exactly_once() {
        let client = test_client();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        lock(&client.router.listeners).add(
            "PlaybackFinished",
            true,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let payload = json!({"type": "PlaybackFinished", "playback": {"id": "p1"}});
        client.router.dispatch(&client, payload.clone());
        client.router.dispatch(&client, payload);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_numeric_identity_promotes() {
        let client = test_client();
        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        lock(&client.router.listeners).add(
            "PlaybackFinished",
            false,
            Arc::new(move |event| {
                *lock(&slot) = event.instance().map(|i| (i.kind(), i.id()));
            }),
        );

        client.router.dispatch(
            &client,
            json!({"type": "PlaybackFinished", "playback": {"id": 1}}),
        );
        assert_eq!(
            *lock(&seen),
            Some((ResourceKind::Playback, "1".to_string()))
        );
    }

    #[test]
    fn test_unknown_event_type_still_reaches_wide_listeners() {
        let client = test_client();
        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        lock(&client.router.listeners).add(
            "BrandNewEvent",
            false,
            Arc::new(move |event| {
                *lock(&slot) = event.instance_for("channel").map(|i| i.id());
            }),
        );

        // Not in the schema; promotion falls back to recognized field names.
        client.router.dispatch(
            &client,
            json!({"type": "BrandNewEvent", "channel": {"id": "c9"}}),
        );
        assert_eq!(*lock(&seen), Some("c9".to_string()));
    }

    #[test]
    fn test_promotion_updates_live_instance_fields() {
        let client = test_client();
        let channel = InstanceBuilder {
            client: Arc::clone(&client),
            kind: ResourceKind::Channel,
            id: Some("c1".to_string()),
            fields: Map::new(),
        }
        .build();
        assert!(channel.field("state").is_none());

        client.router.dispatch(
            &client,
            json!({"type": "ChannelStateChange", "channel": {"id": "c1", "state": "Up"}}),
        );
        assert_eq!(channel.field("state"), Some(json!("Up")));
    }

    #[test]
    fn test_duplicate_promotions_fire_scoped_listeners_once() {
        let client = test_client();
        let bridge = local_bridge(&client, "b1");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        bridge.on("BridgeMerged", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        // Both promotable fields reference the same bridge.
        client.router.dispatch(
            &client,
            json!({
                "type": "BridgeMerged",
                "bridge": {"id": "b1"},
                "bridge_from": {"id": "b1"}
            }),
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_listener_does_not_abort_dispatch() {
        let client = test_client();
        let hits = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));

        lock(&client.router.listeners).add(
            "ChannelDtmfReceived",
            false,
            Arc::new(|_| panic!("listener bug")),
        );
        let counter = Arc::clone(&hits);
        lock(&client.router.listeners).add(
            "ChannelDtmfReceived",
            false,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let counter = Arc::clone(&errors);
        lock(&client.router.listeners).add(
            "Error",
            false,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        client.router.dispatch(
            &client,
            json!({"type": "ChannelDtmfReceived", "digit": "5", "channel": {"id": "c1"}}),
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_registered_before_server_knows_resource() {
        let client = test_client();
        // Locally minted id, listener attached before any "server" state.
        let playback = InstanceBuilder {
            client: Arc::clone(&client),
            kind: ResourceKind::Playback,
            id: None,
            fields: Map::new(),
        }
        .build();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        playback.once("PlaybackFinished", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        client.router.dispatch(
            &client,
            json!({"type": "PlaybackFinished", "playback": {"id": playback.id()}}),
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
