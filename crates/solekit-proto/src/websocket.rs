//! Bridge WebSocket with auto-reconnect.
//!
//! Keeps a binary WebSocket to a bridge server alive, decodes inbound frames
//! as 2-byte-length TLV [`ServerMessage`]s and fans them out through a
//! [`tokio::sync::broadcast`] channel. Outbound frames are queued through an
//! mpsc and written by the same task that reads.
//!
//! # Example
//!
//! ```rust,ignore
//! use solekit_proto::websocket::{BridgeSocket, ReconnectConfig, SocketEvent};
//! use tokio_util::sync::CancellationToken;
//! use url::Url;
//!
//! let cancel = CancellationToken::new();
//! let url = Url::parse("ws://localhost:8080")?;
//!
//! let socket = BridgeSocket::connect(url, ReconnectConfig::default(), cancel.clone());
//! let mut rx = socket.subscribe();
//!
//! while let Ok(event) = rx.recv().await {
//!     if let SocketEvent::Message(message) = event {
//!         println!("{}", message.kind);
//!     }
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::bridge::ServerMessage;
use crate::codec::{self, LengthWidth};
use crate::error::Error;

// ── Channel capacities ──────────────────────────────────────────────

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

// ── SocketEvent ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum SocketEvent {
    Connected,
    Disconnected,
    Message(Arc<ServerMessage>),
}

// ── ReconnectConfig ─────────────────────────────────────────────────

/// Exponential backoff configuration for bridge reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 3s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// `None` means retry forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

// ── BridgeSocket ────────────────────────────────────────────────────

/// Handle to a running bridge connection.
///
/// Dropping the handle does not stop the background task; call
/// [`shutdown`](Self::shutdown) or cancel the token passed to `connect`.
pub struct BridgeSocket {
    event_rx: broadcast::Receiver<SocketEvent>,
    outbound_tx: mpsc::Sender<Bytes>,
    connected_rx: watch::Receiver<bool>,
    cancel: CancellationToken,
}

impl BridgeSocket {
    /// Spawn the reconnection loop and return immediately.
    pub fn connect(url: Url, reconnect: ReconnectConfig, cancel: CancellationToken) -> Self {
        let (event_tx, event_rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        let (connected_tx, connected_rx) = watch::channel(false);

        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            let channels = Channels {
                event_tx,
                outbound_rx,
                connected_tx,
            };
            ws_loop(url, channels, reconnect, task_cancel).await;
        });

        Self {
            event_rx,
            outbound_tx,
            connected_rx,
            cancel,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SocketEvent> {
        self.event_rx.resubscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected_rx.borrow()
    }

    /// Watch channel that flips with the socket's connectivity.
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.connected_rx.clone()
    }

    /// Encode and queue messages as one binary frame.
    pub async fn send(&self, messages: &[ServerMessage]) -> Result<(), Error> {
        if !self.is_connected() {
            return Err(Error::WebSocketClosed);
        }
        let frame = codec::encode(messages, LengthWidth::U16)?;
        self.outbound_tx
            .send(frame)
            .await
            .map_err(|_| Error::WebSocketClosed)
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

// ── Background reconnection loop ────────────────────────────────────

struct Channels {
    event_tx: broadcast::Sender<SocketEvent>,
    outbound_rx: mpsc::Receiver<Bytes>,
    connected_tx: watch::Sender<bool>,
}

impl Channels {
    fn set_connected(&self, connected: bool) {
        if self.connected_tx.send_replace(connected) != connected {
            let event = if connected {
                SocketEvent::Connected
            } else {
                SocketEvent::Disconnected
            };
            let _ = self.event_tx.send(event);
        }
    }
}

/// connect → read/write → on error, backoff → reconnect.
async fn ws_loop(url: Url, mut channels: Channels, reconnect: ReconnectConfig, cancel: CancellationToken) {
    let mut attempt: u32 = 0;

    loop {
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = connect_and_run(&url, &mut channels, &cancel) => result,
        };
        channels.set_connected(false);

        match result {
            Ok(()) if cancel.is_cancelled() => break,
            Ok(()) => {
                tracing::info!("bridge socket closed, reconnecting");
                attempt = 0;
            }
            Err(e) => {
                tracing::warn!(error = %e, attempt, "bridge socket error");

                if let Some(max) = reconnect.max_retries {
                    if attempt >= max {
                        tracing::error!(max_retries = max, "bridge reconnection limit reached, giving up");
                        break;
                    }
                }

                let delay = calculate_backoff(attempt, &reconnect);
                tracing::info!(
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    attempt,
                    "waiting before reconnect"
                );

                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }

                attempt = attempt.saturating_add(1);
            }
        }
    }

    channels.set_connected(false);
    tracing::debug!("bridge socket loop exiting");
}

// ── Single connection lifecycle ─────────────────────────────────────

async fn connect_and_run(url: &Url, channels: &mut Channels, cancel: &CancellationToken) -> Result<(), Error> {
    tracing::info!(url = %url, "connecting to bridge");

    let (ws_stream, _response) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

    tracing::info!("bridge connected");

    // Anything queued while disconnected is stale.
    while channels.outbound_rx.try_recv().is_ok() {}
    channels.set_connected(true);

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let _ = write.send(tungstenite::Message::Close(None)).await;
                return Ok(());
            }
            Some(frame) = channels.outbound_rx.recv() => {
                write
                    .send(tungstenite::Message::Binary(frame))
                    .await
                    .map_err(|e| Error::WebSocketConnect(e.to_string()))?;
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(tungstenite::Message::Binary(data))) => {
                        decode_and_broadcast(&data, &channels.event_tx);
                    }
                    Some(Ok(tungstenite::Message::Ping(_))) => {
                        tracing::trace!("bridge ping frame");
                    }
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        if let Some(ref cf) = frame {
                            tracing::info!(code = %cf.code, reason = %cf.reason, "bridge close frame received");
                        } else {
                            tracing::info!("bridge close frame received (no payload)");
                        }
                        return Ok(());
                    }
                    Some(Err(e)) => {
                        return Err(Error::WebSocketConnect(e.to_string()));
                    }
                    None => {
                        tracing::info!("bridge stream ended");
                        return Ok(());
                    }
                    Some(Ok(other)) => {
                        tracing::debug!(len = other.len(), "ignoring non-binary bridge frame");
                    }
                }
            }
        }
    }
}

// ── Frame decoding ──────────────────────────────────────────────────

fn decode_and_broadcast(data: &Bytes, event_tx: &broadcast::Sender<SocketEvent>) {
    match codec::decode(data, LengthWidth::U16) {
        Ok(messages) => {
            for message in messages {
                // no subscribers is fine
                let _ = event_tx.send(SocketEvent::Message(Arc::new(message)));
            }
        }
        Err(e) => {
            tracing::error!(error = %e, len = data.len(), "failed to decode bridge frame");
        }
    }
}

// ── Backoff calculation ─────────────────────────────────────────────

/// Exponential backoff with jitter.
///
/// `delay = min(initial * 2^attempt, max) * (1 ± 0.25)`
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let exponent = i32::try_from(attempt.min(30)).unwrap_or(30);
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(exponent);
    let capped = base.min(config.max_delay.as_secs_f64());

    // Deterministic spread seeded from the attempt number.
    let jitter_factor = 1.0 + 0.25 * (f64::from(attempt) * 7.3).sin();
    let with_jitter = (capped * jitter_factor).max(0.0);

    Duration::from_secs_f64(with_jitter)
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::message::ServerMessageType;

    #[test]
    fn default_reconnect_config() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_secs(3));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert!(config.max_retries.is_none());
    }

    #[test]
    fn backoff_increases_exponentially() {
        let config = ReconnectConfig::default();

        let d0 = calculate_backoff(0, &config);
        let d1 = calculate_backoff(1, &config);
        let d2 = calculate_backoff(2, &config);

        assert!(d1 > d0, "d1 ({d1:?}) should be greater than d0 ({d0:?})");
        assert!(d2 > d1, "d2 ({d2:?}) should be greater than d1 ({d1:?})");
    }

    #[test]
    fn backoff_caps_at_max_delay() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_retries: None,
        };
        let d10 = calculate_backoff(10, &config);
        assert!(d10 <= Duration::from_millis(12_500), "{d10:?}");
        let huge = calculate_backoff(u32::MAX, &config);
        assert!(huge <= Duration::from_millis(12_500), "{huge:?}");
    }

    #[test]
    fn decodes_batched_frame() {
        let (tx, mut rx) = broadcast::channel(16);
        let frame = codec::encode(
            &[
                ServerMessage::empty(ServerMessageType::Ping),
                ServerMessage::new(ServerMessageType::IsScanning, vec![1]),
            ],
            LengthWidth::U16,
        )
        .unwrap();

        decode_and_broadcast(&frame, &tx);

        let SocketEvent::Message(first) = rx.try_recv().unwrap() else {
            panic!("expected message");
        };
        assert_eq!(first.kind, ServerMessageType::Ping);
        let SocketEvent::Message(second) = rx.try_recv().unwrap() else {
            panic!("expected message");
        };
        assert_eq!(&second.payload[..], &[1]);
    }

    #[test]
    fn malformed_frame_is_dropped() {
        let (tx, mut rx) = broadcast::channel::<SocketEvent>(16);
        decode_and_broadcast(&Bytes::from_static(&[250, 0, 0]), &tx);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_fails_while_disconnected() {
        let cancel = CancellationToken::new();
        let url = Url::parse("ws://127.0.0.1:9").unwrap();
        let socket = BridgeSocket::connect(url, ReconnectConfig::default(), cancel.clone());
        let err = socket
            .send(&[ServerMessage::empty(ServerMessageType::Ping)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WebSocketClosed));
        socket.shutdown();
    }
}
