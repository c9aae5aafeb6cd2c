// ── Connection manager ──
//
// Owns one transport. Runs the connection-status state machine, the
// liveness and reconnect timers, batches outbound device messages to the
// MTU, and turns inbound transport bytes into `ConnectionEvent`s for the
// device dispatcher.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use bytes::{Bytes, BytesMut};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use solekit_proto::codec::{self, LengthWidth, Message};
use solekit_proto::{ConnectionMessageType, DeviceMessageType};

use crate::config::ConnectionConfig;
use crate::error::CoreError;
use crate::lock;
use crate::transport::{Transport, TransportEvent, WriteTarget};

/// ATT header bytes subtracted from the MTU for each write.
const ATT_OVERHEAD: usize = 3;

pub type DeviceMessage = Message<DeviceMessageType>;

// ── ConnectionStatus ─────────────────────────────────────────────────

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum ConnectionStatus {
    #[default]
    NotConnected,
    Connecting,
    Connected,
    Disconnecting,
}

// ── ConnectionEvent ──────────────────────────────────────────────────

/// Inbound traffic, handed to the device dispatcher in arrival order.
#[derive(Debug)]
pub enum ConnectionEvent {
    Status(ConnectionStatus),
    Device(DeviceMessage),
    Connection(ConnectionMessageType, Bytes),
    Smp(Bytes),
    ProtocolError(solekit_proto::Error),
}

// ── MessageSender ────────────────────────────────────────────────────

/// Outbound half of a connection, as seen by session managers.
pub trait MessageSender: Send + Sync {
    /// Queue messages; write everything queued when `send_immediately`.
    fn send(&self, messages: Vec<DeviceMessage>, send_immediately: bool) -> BoxFuture<'_, Result<(), CoreError>>;

    /// Write everything queued.
    fn flush(&self) -> BoxFuture<'_, Result<(), CoreError>>;

    /// Write one SMP frame to the SMP characteristic.
    fn send_smp(&self, frame: Bytes) -> BoxFuture<'_, Result<(), CoreError>>;
}

// ── Batching ─────────────────────────────────────────────────────────

/// Pack whole encoded messages into writes of at most `max_len` bytes.
///
/// Order is preserved. A message longer than `max_len` goes out on its own
/// and is never split. With no limit everything lands in one write.
pub fn batch(encoded: Vec<Bytes>, max_len: Option<usize>) -> Vec<Bytes> {
    let mut writes = Vec::new();
    let mut current = BytesMut::new();

    for message in encoded {
        if let Some(max) = max_len {
            if !current.is_empty() && current.len() + message.len() > max {
                writes.push(current.split().freeze());
            }
        }
        current.extend_from_slice(&message);
    }
    if !current.is_empty() {
        writes.push(current.freeze());
    }
    writes
}

// ── ConnectionManager ────────────────────────────────────────────────

/// Cheaply cloneable handle to one managed transport.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    status: watch::Sender<ConnectionStatus>,
    /// 0 means unknown.
    mtu: AtomicU16,
    queue: StdMutex<Vec<Bytes>>,
    /// Serializes flushes so batches hit the wire in queue order.
    write_lock: Mutex<()>,
    /// Set by an explicit disconnect; cleared on the next `Connected`.
    reconnect_suspended: AtomicBool,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    cancel: CancellationToken,
    liveness: StdMutex<Option<CancellationToken>>,
    reconnecting: StdMutex<Option<CancellationToken>>,
}

impl ConnectionManager {
    /// Wrap a transport and start pumping its events.
    ///
    /// Must be called inside a Tokio runtime. The returned receiver yields
    /// every inbound event; the device dispatcher is its only consumer.
    pub fn new(
        transport: Arc<dyn Transport>,
        config: ConnectionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ConnectionStatus::NotConnected);
        let transport_rx = transport.subscribe();

        let inner = Arc::new(ConnectionInner {
            transport,
            mtu: AtomicU16::new(config.default_mtu.unwrap_or(0)),
            config,
            status,
            queue: StdMutex::new(Vec::new()),
            write_lock: Mutex::new(()),
            reconnect_suspended: AtomicBool::new(false),
            events,
            cancel: CancellationToken::new(),
            liveness: StdMutex::new(None),
            reconnecting: StdMutex::new(None),
        });

        tokio::spawn(pump(Arc::clone(&inner), transport_rx));

        (Self { inner }, events_rx)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn can_reconnect(&self) -> bool {
        self.inner.transport.can_reconnect()
    }

    pub fn mtu(&self) -> Option<u16> {
        match self.inner.mtu.load(Ordering::Acquire) {
            0 => None,
            mtu => Some(mtu),
        }
    }

    pub fn set_mtu(&self, mtu: u16) {
        debug!(mtu, "mtu updated");
        self.inner.mtu.store(mtu, Ordering::Release);
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    pub async fn connect(&self) -> Result<(), CoreError> {
        match self.status() {
            ConnectionStatus::Connecting | ConnectionStatus::Connected => {
                return Err(CoreError::AlreadyInProgress);
            }
            ConnectionStatus::Disconnecting => {
                return Err(CoreError::invalid_state("disconnection in progress"));
            }
            ConnectionStatus::NotConnected => {}
        }

        self.inner.set_status(ConnectionStatus::Connecting);
        if let Err(e) = self.inner.transport.connect().await {
            warn!(error = %e, "transport connect failed");
            self.inner.set_status(ConnectionStatus::NotConnected);
            return Err(e);
        }
        Ok(())
    }

    /// Disconnect and suspend automatic reconnection until the next
    /// successful connection. While the link is down and retries are
    /// running, this only cancels the retries.
    pub async fn disconnect(&self) -> Result<(), CoreError> {
        match self.status() {
            ConnectionStatus::Connected => {}
            ConnectionStatus::NotConnected if self.inner.is_reconnecting() => {
                info!("cancelling automatic reconnection");
                self.inner.reconnect_suspended.store(true, Ordering::Release);
                self.inner.stop_reconnect();
                return Ok(());
            }
            _ => return Err(CoreError::NotConnected),
        }

        self.inner.reconnect_suspended.store(true, Ordering::Release);
        self.inner.stop_reconnect();
        self.inner.set_status(ConnectionStatus::Disconnecting);

        let result = self.inner.transport.disconnect().await;
        self.inner.set_status(ConnectionStatus::NotConnected);
        result
    }

    pub async fn reconnect(&self) -> Result<(), CoreError> {
        if !self.can_reconnect() {
            return Err(CoreError::invalid_state("transport cannot reconnect"));
        }
        if self.status() != ConnectionStatus::NotConnected {
            return Err(CoreError::AlreadyInProgress);
        }
        self.inner.transport.reconnect().await
    }

    /// Stop background tasks. The transport itself is left alone.
    pub fn close(&self) {
        self.inner.cancel.cancel();
    }

    // ── Outbound ─────────────────────────────────────────────────────

    fn ensure_sendable(&self) -> Result<(), CoreError> {
        if self.status() == ConnectionStatus::Connected {
            Ok(())
        } else {
            Err(CoreError::NotConnected)
        }
    }

    async fn send_messages(&self, messages: Vec<DeviceMessage>, send_immediately: bool) -> Result<(), CoreError> {
        self.ensure_sendable()?;

        // Encode up front so an oversized payload rejects the whole call.
        let encoded = messages
            .iter()
            .map(|m| codec::encode_message(m, LengthWidth::U8))
            .collect::<Result<Vec<_>, _>>()?;
        lock(&self.inner.queue).extend(encoded);

        if send_immediately {
            self.flush_queue().await
        } else {
            Ok(())
        }
    }

    async fn flush_queue(&self) -> Result<(), CoreError> {
        self.ensure_sendable()?;
        let _guard = self.inner.write_lock.lock().await;

        let queued = std::mem::take(&mut *lock(&self.inner.queue));
        if queued.is_empty() {
            return Ok(());
        }

        let max_len = self.mtu().map(|mtu| usize::from(mtu).saturating_sub(ATT_OVERHEAD));
        for write in batch(queued, max_len) {
            debug!(len = write.len(), "writing tx batch");
            self.inner.transport.write(WriteTarget::Tx, write).await?;
        }
        Ok(())
    }

    async fn write_smp(&self, frame: Bytes) -> Result<(), CoreError> {
        self.ensure_sendable()?;
        self.inner.transport.write(WriteTarget::Smp, frame).await
    }
}

impl MessageSender for ConnectionManager {
    fn send(&self, messages: Vec<DeviceMessage>, send_immediately: bool) -> BoxFuture<'_, Result<(), CoreError>> {
        Box::pin(self.send_messages(messages, send_immediately))
    }

    fn flush(&self) -> BoxFuture<'_, Result<(), CoreError>> {
        Box::pin(self.flush_queue())
    }

    fn send_smp(&self, frame: Bytes) -> BoxFuture<'_, Result<(), CoreError>> {
        Box::pin(self.write_smp(frame))
    }
}

// ── State machine ────────────────────────────────────────────────────

impl ConnectionInner {
    fn set_status(self: &Arc<Self>, status: ConnectionStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if !changed {
            debug!(?status, "redundant connection status");
            return;
        }
        info!(%status, "connection status");

        match status {
            ConnectionStatus::Connected => {
                self.reconnect_suspended.store(false, Ordering::Release);
                self.stop_reconnect();
                self.start_liveness();
            }
            ConnectionStatus::NotConnected => {
                self.stop_liveness();
                self.mtu.store(self.config.default_mtu.unwrap_or(0), Ordering::Release);
                lock(&self.queue).clear();
                if self.config.reconnect_on_disconnection
                    && self.transport.can_reconnect()
                    && !self.reconnect_suspended.load(Ordering::Acquire)
                {
                    self.start_reconnect();
                }
            }
            ConnectionStatus::Connecting | ConnectionStatus::Disconnecting => {}
        }

        let _ = self.events.send(ConnectionEvent::Status(status));
    }

    fn start_liveness(self: &Arc<Self>) {
        let token = self.cancel.child_token();
        if let Some(previous) = lock(&self.liveness).replace(token.clone()) {
            previous.cancel();
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(inner.config.liveness_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    _ = interval.tick() => {
                        if !inner.transport.is_connected().await {
                            warn!("transport no longer connected");
                            inner.set_status(ConnectionStatus::NotConnected);
                            break;
                        }
                    }
                }
            }
        });
    }

    fn stop_liveness(&self) {
        if let Some(token) = lock(&self.liveness).take() {
            token.cancel();
        }
    }

    fn start_reconnect(self: &Arc<Self>) {
        let token = self.cancel.child_token();
        if let Some(previous) = lock(&self.reconnecting).replace(token.clone()) {
            previous.cancel();
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(inner.config.reconnect_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    _ = interval.tick() => {
                        match *inner.status.borrow() {
                            ConnectionStatus::Connected => break,
                            ConnectionStatus::NotConnected => {}
                            ConnectionStatus::Connecting | ConnectionStatus::Disconnecting => continue,
                        }
                        info!("attempting to reconnect");
                        if let Err(e) = inner.transport.reconnect().await {
                            warn!(error = %e, "reconnect attempt failed");
                        }
                    }
                }
            }
        });
    }

    fn is_reconnecting(&self) -> bool {
        lock(&self.reconnecting).as_ref().is_some_and(|token| !token.is_cancelled())
    }

    fn stop_reconnect(&self) {
        if let Some(token) = lock(&self.reconnecting).take() {
            token.cancel();
        }
    }

    fn route(&self, kind: ConnectionMessageType, data: Bytes) {
        let event = match kind {
            ConnectionMessageType::Rx => {
                match codec::decode::<DeviceMessageType>(&data, LengthWidth::U8) {
                    Ok(messages) => {
                        for message in messages {
                            let _ = self.events.send(ConnectionEvent::Device(message));
                        }
                        return;
                    }
                    Err(e) => ConnectionEvent::ProtocolError(e),
                }
            }
            ConnectionMessageType::Smp => ConnectionEvent::Smp(data),
            ConnectionMessageType::Tx | ConnectionMessageType::IsConnected => {
                debug!(%kind, "ignoring outbound-only message type");
                return;
            }
            other => ConnectionEvent::Connection(other, data),
        };
        let _ = self.events.send(event);
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ── Transport event pump ─────────────────────────────────────────────

async fn pump(inner: Arc<ConnectionInner>, mut transport_rx: broadcast::Receiver<TransportEvent>) {
    let cancel = inner.cancel.clone();
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = transport_rx.recv() => match event {
                Ok(TransportEvent::Status(status)) => inner.set_status(status),
                Ok(TransportEvent::Message(kind, data)) => inner.route(kind, data),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "transport events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    debug!("transport pump exiting");
}
