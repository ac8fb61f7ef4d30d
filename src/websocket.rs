//! The persistent event WebSocket session.
//!
//! A background task owns the socket: it subscribes the configured
//! application names, forwards every text frame to the event router, and
//! transparently reconnects with a capped exponential backoff when the
//! socket drops. Lifecycle is signalled through the client events
//! `WebSocketConnected`, `WebSocketReconnecting`, and
//! `WebSocketMaxRetries`.

use std::sync::{Arc, Weak};
use std::time::Duration;

use base64::Engine;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::client::ClientShared;
use crate::constants::{
    EVENTS_ENDPOINT, EVENT_WEBSOCKET_CONNECTED, EVENT_WEBSOCKET_MAX_RETRIES,
    EVENT_WEBSOCKET_RECONNECTING, RECONNECT_INITIAL_MS,
};
use crate::error::{AriError, AriResult};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Session lifecycle states.
///
/// `Stopped` and `GaveUp` are terminal; a new session starts over from
/// `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session started yet.
    Idle,
    /// Attempting the handshake.
    Connecting,
    /// Socket open, frames flowing.
    Open,
    /// Socket lost, waiting out the backoff before the next attempt.
    Reconnecting,
    /// Explicitly stopped by the caller.
    Stopped,
    /// The failed-attempt streak exceeded the configured maximum.
    GaveUp,
}

/// Handle to the running session task.
pub(crate) struct Session {
    stop_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<SessionState>,
}

impl Session {
    /// Spawn the session task. The task holds the client only weakly
    /// between connection cycles so a dropped client winds the task down.
    pub fn spawn(client: &Arc<ClientShared>, apps: Vec<String>, subscribe_all: bool) -> Session {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        tokio::spawn(run(
            Arc::downgrade(client),
            apps,
            subscribe_all,
            stop_rx,
            state_tx,
        ));
        Session { stop_tx, state_rx }
    }

    /// Signal the task to stop. Cancels any in-flight backoff wait; no
    /// frame received after this produces a listener invocation.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }
}

fn outcome(reason: DropReason) -> &'static str {
    match reason {
        DropReason::Stopped => "stopped",
        DropReason::Lost => "connection lost",
    }
}

async fn run(
    client: Weak<ClientShared>,
    apps: Vec<String>,
    subscribe_all: bool,
    mut stop_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<SessionState>,
) {
    let mut failures: u32 = 0;
    let mut delay = Duration::from_millis(RECONNECT_INITIAL_MS);

    loop {
        let Some(client) = client.upgrade() else {
            return;
        };
        if *stop_rx.borrow() {
            let _ = state_tx.send(SessionState::Stopped);
            return;
        }

        let _ = state_tx.send(SessionState::Connecting);
        let attempt = tokio::select! {
            result = connect_events(&client, &apps, subscribe_all) => Some(result),
            _ = stop_rx.changed() => None,
        };

        match attempt {
            None => {
                let _ = state_tx.send(SessionState::Stopped);
                return;
            }
            Some(Ok(stream)) => {
                failures = 0;
                delay = Duration::from_millis(RECONNECT_INITIAL_MS);
                let _ = state_tx.send(SessionState::Open);
                info!("event websocket open for apps [{}]", apps.join(","));
                client.dispatch_lifecycle(EVENT_WEBSOCKET_CONNECTED);

                let reason = read_frames(&client, stream, &mut stop_rx).await;
                debug!("event websocket closed: {}", outcome(reason));
                if reason == DropReason::Stopped {
                    let _ = state_tx.send(SessionState::Stopped);
                    return;
                }
            }
            Some(Err(e)) => {
                warn!("event websocket connect failed: {}", e);
                failures += 1;
                if failures > client.options.max_consecutive_failures {
                    let _ = state_tx.send(SessionState::GaveUp);
                    warn!(
                        "giving up after {} consecutive failed attempts",
                        failures
                    );
                    client.dispatch_lifecycle(EVENT_WEBSOCKET_MAX_RETRIES);
                    return;
                }
            }
        }

        if *stop_rx.borrow() {
            let _ = state_tx.send(SessionState::Stopped);
            return;
        }
        let _ = state_tx.send(SessionState::Reconnecting);
        client.dispatch_lifecycle(EVENT_WEBSOCKET_RECONNECTING);
        debug!("reconnecting in {:?}", delay);
        let stopped = tokio::select! {
            _ = sleep(delay) => false,
            _ = stop_rx.changed() => true,
        };
        if stopped {
            let _ = state_tx.send(SessionState::Stopped);
            return;
        }
        delay = next_delay(
            delay,
            Duration::from_millis(client.options.reconnect_ceiling_ms),
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DropReason {
    Stopped,
    Lost,
}

async fn read_frames(
    client: &Arc<ClientShared>,
    mut stream: WsStream,
    stop_rx: &mut watch::Receiver<bool>,
) -> DropReason {
    let idle_ms = client.options.idle_timeout_ms;
    loop {
        let frame = tokio::select! {
            _ = stop_rx.changed() => return DropReason::Stopped,
            frame = next_frame(&mut stream, idle_ms) => frame,
        };
        match frame {
            Err(_) => {
                warn!("no traffic for {}ms, forcing reconnect", idle_ms);
                return DropReason::Lost;
            }
            Ok(None) => return DropReason::Lost,
            Ok(Some(Ok(Message::Text(text)))) => {
                // A frame that raced the stop signal must not be routed.
                if *stop_rx.borrow() {
                    return DropReason::Stopped;
                }
                match serde_json::from_str::<Value>(text.as_str()) {
                    Ok(payload) => client.router.dispatch(client, payload),
                    Err(e) => warn!("discarding non-JSON event frame: {}", e),
                }
            }
            Ok(Some(Ok(Message::Close(_)))) => return DropReason::Lost,
            Ok(Some(Ok(_))) => {} // ping/pong/binary
            Ok(Some(Err(e))) => {
                warn!("event websocket error: {}", e);
                return DropReason::Lost;
            }
        }
    }
}

/// Next frame with the configured idle timeout; zero disables it.
async fn next_frame(
    stream: &mut WsStream,
    idle_ms: u64,
) -> Result<
    Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
    tokio::time::error::Elapsed,
> {
    if idle_ms == 0 {
        Ok(stream.next().await)
    } else {
        timeout(Duration::from_millis(idle_ms), stream.next()).await
    }
}

fn next_delay(current: Duration, ceiling: Duration) -> Duration {
    (current * 2).min(ceiling)
}

/// The event endpoint URL: base scheme switched to ws/wss, `/events`
/// appended, application names as the `app` query parameter.
fn events_url(base: &Url, apps: &[String], subscribe_all: bool) -> AriResult<Url> {
    let mut url = base.clone();
    let scheme = match base.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(AriError::transport(format!(
                "cannot derive websocket scheme from {}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| AriError::transport("cannot derive websocket scheme"))?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| AriError::transport("base url cannot be a base"))?;
        segments.pop_if_empty();
        segments.push(EVENTS_ENDPOINT);
    }
    url.query_pairs_mut().append_pair("app", &apps.join(","));
    if subscribe_all {
        url.query_pairs_mut().append_pair("subscribeAll", "true");
    }
    Ok(url)
}

async fn connect_events(
    client: &Arc<ClientShared>,
    apps: &[String],
    subscribe_all: bool,
) -> AriResult<WsStream> {
    let url = events_url(&client.base_url, apps, subscribe_all)?;
    debug!("opening event websocket to {}", url);

    let standard = base64::engine::general_purpose::STANDARD;
    let authorization = format!(
        "Basic {}",
        standard.encode(format!("{}:{}", client.username, client.password))
    );
    let key = standard.encode(uuid::Uuid::new_v4().into_bytes());
    let host = match url.port() {
        Some(port) => format!("{}:{}", url.host_str().unwrap_or_default(), port),
        None => url.host_str().unwrap_or_default().to_string(),
    };

    let request = http::Request::builder()
        .uri(url.as_str())
        .header("Authorization", authorization)
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", key)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Host", host)
        .body(())
        .map_err(AriError::transport)?;

    let (stream, _response) = connect_async(request).await?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_url() {
        let base = Url::parse("http://pbx.example.com:8088/ari").unwrap();
        let url = events_url(&base, &["unittests".to_string()], false).unwrap();
        assert_eq!(
            url.as_str(),
            "ws://pbx.example.com:8088/ari/events?app=unittests"
        );
    }

    #[test]
    fn test_events_url_multiple_apps_and_subscribe_all() {
        let base = Url::parse("https://pbx.example.com/ari").unwrap();
        let url = events_url(
            &base,
            &["ivr".to_string(), "dialer".to_string()],
            true,
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "wss://pbx.example.com/ari/events?app=ivr%2Cdialer&subscribeAll=true"
        );
    }

    #[test]
    fn test_next_delay_doubles_up_to_ceiling() {
        let ceiling = Duration::from_millis(10_000);
        let mut delay = Duration::from_millis(300);
        let mut seen = Vec::new();
        for _ in 0..8 {
            delay = next_delay(delay, ceiling);
            seen.push(delay.as_millis() as u64);
        }
        assert_eq!(
            seen,
            vec![600, 1200, 2400, 4800, 9600, 10_000, 10_000, 10_000]
        );
    }
}
