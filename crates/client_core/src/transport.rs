use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use shared::protocol::Envelope;
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch, Notify},
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::{
    backoff::ReconnectPolicy,
    dispatcher::{EventDispatcher, SIGNAL_CONNECT, SIGNAL_DISCONNECT, SIGNAL_ERROR},
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting out the backoff delay before the next attempt.
    Reconnecting,
}

/// The part of the transport conversation sessions depend on.
pub trait CommandTransport: Send + Sync {
    /// Starts connecting unless an attempt is already in flight or open.
    fn connect(&self);
    /// Queues `envelope` on the open socket. Returns false when not connected.
    fn send(&self, envelope: &Envelope) -> bool;
    fn state(&self) -> ConnectionState;
}

/// Owns the single websocket connection and reconnects after unexpected
/// drops. Inbound frames and the local `connect`/`disconnect`/`error`
/// signals are delivered through the [`EventDispatcher`].
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

struct Shared {
    url: String,
    policy: ReconnectPolicy,
    dispatcher: Arc<EventDispatcher>,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ConnectionState>,
}

struct Inner {
    state: ConnectionState,
    should_reconnect: bool,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    shutdown: Option<Arc<Notify>>,
}

impl ConnectionManager {
    pub fn new(
        url: impl Into<String>,
        policy: ReconnectPolicy,
        dispatcher: Arc<EventDispatcher>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                url: url.into(),
                policy,
                dispatcher,
                inner: Mutex::new(Inner {
                    state: ConnectionState::Disconnected,
                    should_reconnect: false,
                    generation: 0,
                    outbound: None,
                    shutdown: None,
                }),
                state_tx,
            }),
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Idempotent: a no-op while connecting, connected or backing off.
    pub fn connect(&self) {
        let (generation, shutdown) = {
            let mut inner = self.shared.inner.lock();
            if inner.state != ConnectionState::Disconnected {
                return;
            }
            inner.should_reconnect = true;
            inner.generation += 1;
            let shutdown = Arc::new(Notify::new());
            inner.shutdown = Some(Arc::clone(&shutdown));
            self.shared
                .set_state(&mut inner, ConnectionState::Connecting);
            (inner.generation, shutdown)
        };

        info!(url = %self.shared.url, "websocket: connecting");
        tokio::spawn(drive(Arc::clone(&self.shared), generation, shutdown));
    }

    /// Closes the socket and disables auto-reconnect.
    pub fn close(&self) {
        let was_connected = {
            let mut inner = self.shared.inner.lock();
            inner.should_reconnect = false;
            inner.generation += 1;
            inner.outbound = None;
            if let Some(shutdown) = inner.shutdown.take() {
                shutdown.notify_one();
            }
            let was_connected = inner.state == ConnectionState::Connected;
            self.shared
                .set_state(&mut inner, ConnectionState::Disconnected);
            was_connected
        };

        if was_connected {
            info!(url = %self.shared.url, "websocket: closed by client");
            self.shared
                .dispatcher
                .emit(SIGNAL_DISCONNECT, &json!({ "reason": "closed" }));
        }
    }

    pub fn send(&self, envelope: &Envelope) -> bool {
        let inner = self.shared.inner.lock();
        if inner.state != ConnectionState::Connected {
            return false;
        }
        let Some(outbound) = inner.outbound.as_ref() else {
            return false;
        };
        let text = match serde_json::to_string(envelope) {
            Ok(text) => text,
            Err(err) => {
                warn!(event = %envelope.event, error = %err, "websocket: failed to encode envelope");
                return false;
            }
        };
        outbound.send(Message::Text(text)).is_ok()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }
}

impl CommandTransport for ConnectionManager {
    fn connect(&self) {
        ConnectionManager::connect(self)
    }

    fn send(&self, envelope: &Envelope) -> bool {
        ConnectionManager::send(self, envelope)
    }

    fn state(&self) -> ConnectionState {
        ConnectionManager::state(self)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.close();
    }
}

impl Shared {
    fn set_state(&self, inner: &mut Inner, state: ConnectionState) {
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    /// Applies `update` only if `generation` still owns the connection.
    fn transition<F>(&self, generation: u64, update: F) -> bool
    where
        F: FnOnce(&Self, &mut Inner),
    {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return false;
        }
        update(self, &mut inner);
        true
    }

    fn mark_connected(&self, generation: u64, outbound: mpsc::UnboundedSender<Message>) -> bool {
        let applied = self.transition(generation, |shared, inner| {
            inner.outbound = Some(outbound);
            shared.set_state(inner, ConnectionState::Connected);
        });
        if applied {
            info!(url = %self.url, "websocket: connected");
            self.dispatcher.emit(SIGNAL_CONNECT, &json!({ "url": self.url }));
        }
        applied
    }

    /// Returns whether the driver should schedule another attempt.
    fn mark_dropped(&self, generation: u64, was_open: bool) -> bool {
        let mut reconnect = false;
        let applied = self.transition(generation, |shared, inner| {
            inner.outbound = None;
            reconnect = inner.should_reconnect;
            let next = if reconnect {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Disconnected
            };
            shared.set_state(inner, next);
        });
        if applied && was_open {
            warn!(url = %self.url, "websocket: connection dropped");
            self.dispatcher
                .emit(SIGNAL_DISCONNECT, &json!({ "reason": "dropped" }));
        }
        applied && reconnect
    }

    fn mark_connecting(&self, generation: u64) -> bool {
        self.transition(generation, |shared, inner| {
            shared.set_state(inner, ConnectionState::Connecting);
        })
    }

    fn emit_error(&self, message: String) {
        self.dispatcher
            .emit(SIGNAL_ERROR, &json!({ "message": message }));
    }
}

/// Connection state machine for one `connect()` generation:
/// Connecting → Connected → (drop) → Reconnecting → Connecting → ...
async fn drive(shared: Arc<Shared>, generation: u64, shutdown: Arc<Notify>) {
    let mut attempt: u32 = 0;
    loop {
        let result = tokio::select! {
            biased;
            _ = shutdown.notified() => return,
            result = connect_async(shared.url.as_str()) => result,
        };

        let was_open = match result {
            Ok((socket, _)) => {
                attempt = 0;
                let (tx, rx) = mpsc::unbounded_channel();
                if !shared.mark_connected(generation, tx) {
                    return;
                }
                if pump(&shared, socket, rx, &shutdown).await {
                    return;
                }
                true
            }
            Err(err) => {
                warn!(url = %shared.url, error = %err, "websocket: connect failed");
                shared.emit_error(err.to_string());
                false
            }
        };

        if !shared.mark_dropped(generation, was_open) {
            return;
        }

        let delay = shared.policy.delay(attempt);
        attempt = attempt.saturating_add(1);
        info!(
            url = %shared.url,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "websocket: scheduling reconnect"
        );
        tokio::select! {
            biased;
            _ = shutdown.notified() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        if !shared.mark_connecting(generation) {
            return;
        }
    }
}

/// Moves frames until the socket ends. Returns true when the end was
/// requested through `close()`.
async fn pump(
    shared: &Shared,
    socket: Socket,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    shutdown: &Notify,
) -> bool {
    let (mut writer, mut reader) = socket.split();
    loop {
        tokio::select! {
            biased;
            _ = shutdown.notified() => {
                // Commands queued before close() still go out, e.g. a leave.
                while let Ok(message) = outbound.try_recv() {
                    if writer.send(message).await.is_err() {
                        break;
                    }
                }
                let _ = writer.send(Message::Close(None)).await;
                return true;
            }
            queued = outbound.recv() => match queued {
                Some(message) => {
                    if let Err(err) = writer.send(message).await {
                        warn!(error = %err, "websocket: send failed");
                        shared.emit_error(err.to_string());
                        return false;
                    }
                }
                None => {
                    let _ = writer.close().await;
                    return true;
                }
            },
            inbound = reader.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    shared.dispatcher.dispatch_frame(&text);
                }
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => {
                        shared.dispatcher.dispatch_frame(text);
                    }
                    Err(_) => debug!(len = bytes.len(), "websocket: dropping non-utf8 binary frame"),
                },
                Some(Ok(Message::Close(_))) | None => return false,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(error = %err, "websocket: receive failed");
                    shared.emit_error(err.to_string());
                    return false;
                }
            },
        }
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
