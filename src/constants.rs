//! Defaults and endpoint paths shared across modules

/// Default ARI HTTP port.
pub const DEFAULT_ARI_PORT: u16 = 8088;

/// Path prefix the server publishes its API under when the base URL has none.
pub const DEFAULT_BASE_PATH: &str = "/ari";

/// Root self-description document listing the per-resource documents.
pub const RESOURCES_DOC: &str = "api-docs/resources.json";

/// Name of the resource document that also carries the event model.
pub const EVENTS_RESOURCE: &str = "events";

/// WebSocket event endpoint, relative to the API base path.
pub const EVENTS_ENDPOINT: &str = "events";

/// First reconnect delay. Doubles on each consecutive failure.
pub const RECONNECT_INITIAL_MS: u64 = 300;

/// Default ceiling for the exponential reconnect backoff.
pub const DEFAULT_RECONNECT_CEILING_MS: u64 = 10_000;

/// Default number of consecutive failed connect attempts tolerated before
/// the session gives up.
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 10;

/// Default idle timeout. Zero disables idle detection.
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 0;

/// Client lifecycle event: the event WebSocket opened.
pub const EVENT_WEBSOCKET_CONNECTED: &str = "WebSocketConnected";

/// Client lifecycle event: the session lost its socket and is about to retry.
pub const EVENT_WEBSOCKET_RECONNECTING: &str = "WebSocketReconnecting";

/// Client lifecycle event: the retry streak was exhausted. Terminal.
pub const EVENT_WEBSOCKET_MAX_RETRIES: &str = "WebSocketMaxRetries";

/// Client event carrying listener failures raised during dispatch.
pub const EVENT_ERROR: &str = "Error";
