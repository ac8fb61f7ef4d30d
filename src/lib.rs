//! Asterisk REST Interface (ARI) client for Rust
//!
//! This crate provides an async client for Asterisk's REST Interface,
//! allowing applications to control call legs, bridges, playbacks,
//! recordings, device states, and mailboxes, and to react to the events
//! Asterisk pushes over its WebSocket.
//!
//! # Architecture
//!
//! The client is synthesized from the server's own self-description at
//! connect time:
//!
//! - [`Ari::connect`] loads the operation catalog and event model and
//!   returns a ready client, without opening the WebSocket.
//! - Operations are invoked through resource namespaces
//!   ([`Ari::channels`], [`Ari::bridges`], ...) or directly on a
//!   [`ResourceInstance`], which pre-binds its own identity parameter.
//! - [`Ari::start`] opens the event WebSocket for a set of Stasis
//!   application names and keeps it open across drops with a capped
//!   exponential backoff.
//! - Listeners attach client-wide ([`Ari::on`]) or to one instance
//!   ([`ResourceInstance::on`]); an instance's listeners only fire for
//!   events whose payload references that instance's identity.
//!
//! # Examples
//!
//! ## Originate a call and react to its events
//!
//! ```rust,no_run
//! use asterisk_ari_tokio::{Ari, AriError};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), AriError> {
//!     let client = Ari::connect("http://localhost:8088", "asterisk", "asterisk").await?;
//!
//!     client.on("StasisStart", |event| {
//!         if let Some(channel) = event.instance() {
//!             println!("channel {} entered the application", channel.id());
//!         }
//!     });
//!     client.start(["ivr"])?;
//!
//!     let response = client
//!         .channels()
//!         .request(
//!             "originate",
//!             &json!({
//!                 "endpoint": "PJSIP/softphone",
//!                 "app": "ivr",
//!                 "variables": {"CALLERID(name)": "Alice"}
//!             }),
//!         )
//!         .await?;
//!     let channel = response.into_resource().expect("originate returns a Channel");
//!     channel.once("ChannelDestroyed", |_| println!("call over"));
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Attach listeners before the resource exists
//!
//! A locally created instance carries a pre-allocated identifier, so
//! scoped listeners match as soon as the server starts referencing it:
//!
//! ```rust,no_run
//! use asterisk_ari_tokio::{Ari, AriError, ResourceKind};
//! use serde_json::json;
//!
//! # async fn example(client: &Ari) -> Result<(), AriError> {
//! let bridge = client.instance(ResourceKind::Bridge).build();
//! bridge.on("ChannelEnteredBridge", |event| {
//!     println!("member joined: {:?}", event.instance_for("channel"));
//! });
//! client
//!     .bridges()
//!     .request("createWithId", &json!({"bridgeId": bridge.id()}))
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Event session lifecycle
//!
//! The session emits `WebSocketConnected` on every successful open,
//! `WebSocketReconnecting` before each retry, and `WebSocketMaxRetries`
//! when a streak of failed attempts exceeds the configured maximum.
//! Events sent by the server while the socket is down are lost; the
//! client does not replay them.

pub mod client;
pub mod constants;
pub mod error;
pub mod events;
pub mod resources;
pub mod schema;
pub mod websocket;

pub(crate) mod http;
pub(crate) mod request;

pub use client::{Ari, ConnectOptions};
pub use error::{AriError, AriResult};
pub use events::{AriEvent, EventCallback, ListenerHandle};
pub use resources::{
    AriResponse, InstanceBuilder, ResourceInstance, ResourceKind, ResourceNamespace,
};
pub use schema::{
    Catalog, EventDescriptor, EventField, EventSchema, OperationDescriptor, ParamPlacement,
    ParameterDescriptor, ResourceDescriptor,
};
pub use websocket::SessionState;
