// ── Bridge client ──
//
// Talks to a bridge server that owns the radios. `BridgeClient` keeps the
// WebSocket alive, tracks scanning state and the discovered-device cache,
// and hands out `Device`s whose transport is a `BridgeTransport` relaying
// `deviceMessage` envelopes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use solekit_proto::bridge::{self, ConnectionMessage, DiscoveredDevice, ServerMessage};
use solekit_proto::websocket::{BridgeSocket, SocketEvent};
use solekit_proto::{ConnectionMessageType, Message, ServerMessageType};

use crate::config::BridgeConfig;
use crate::connection::ConnectionStatus;
use crate::device::Device;
use crate::error::CoreError;
use crate::registry::{DeviceId, DeviceRegistry};
use crate::stream::EventStream;
use crate::transport::{Transport, TransportEvent, WriteTarget};

const EVENT_CHANNEL_SIZE: usize = 256;
const TRANSPORT_CHANNEL_SIZE: usize = 256;

// ── BridgeEvent ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "message", rename_all = "camelCase")]
pub enum BridgeEvent {
    IsConnected(bool),
    IsScanningAvailable(bool),
    IsScanning(bool),
    DiscoveredDevice(DiscoveredDevice),
    ExpiredDiscoveredDevice(DiscoveredDevice),
    ConnectedDevices(Vec<String>),
}

// ── BridgeTransport ──────────────────────────────────────────────────

/// `Transport` for one device behind a bridge server.
pub struct BridgeTransport {
    bluetooth_id: String,
    socket: Arc<BridgeSocket>,
    events: broadcast::Sender<TransportEvent>,
    connected: AtomicBool,
}

impl BridgeTransport {
    fn new(bluetooth_id: String, socket: Arc<BridgeSocket>) -> Self {
        let (events, _) = broadcast::channel(TRANSPORT_CHANNEL_SIZE);
        Self {
            bluetooth_id,
            socket,
            events,
            connected: AtomicBool::new(false),
        }
    }

    pub fn bluetooth_id(&self) -> &str {
        &self.bluetooth_id
    }

    async fn send(&self, message: ServerMessage) -> Result<(), CoreError> {
        self.socket.send(&[message]).await?;
        Ok(())
    }

    async fn send_device_messages(&self, messages: &[ConnectionMessage]) -> Result<(), CoreError> {
        self.send(bridge::device_message(&self.bluetooth_id, messages)?).await
    }

    /// Apply the relayed `isConnected` flag.
    async fn set_connected(&self, connected: bool) {
        if self.connected.swap(connected, Ordering::AcqRel) == connected {
            return;
        }
        debug!(device = %self.bluetooth_id, connected, "bridge device connectivity");
        let status = if connected {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::NotConnected
        };
        let _ = self.events.send(TransportEvent::Status(status));

        if connected {
            let requests: Vec<_> = ConnectionMessageType::DEVICE_INFORMATION
                .iter()
                .chain(std::iter::once(&ConnectionMessageType::BatteryLevel))
                .map(|kind| Message::empty(*kind))
                .collect();
            if let Err(e) = self.send_device_messages(&requests).await {
                warn!(device = %self.bluetooth_id, error = %e, "device information request failed");
            }
        }
    }

    async fn handle(&self, messages: Vec<ConnectionMessage>) {
        for message in messages {
            if message.kind == ConnectionMessageType::IsConnected {
                match bridge::parse_flag(&message.payload, "isConnected") {
                    Ok(connected) => self.set_connected(connected).await,
                    Err(e) => error!(device = %self.bluetooth_id, error = %e, "bridge protocol error"),
                }
            } else {
                let _ = self.events.send(TransportEvent::Message(message.kind, message.payload));
            }
        }
    }
}

impl Transport for BridgeTransport {
    fn connect(&self) -> BoxFuture<'_, Result<(), CoreError>> {
        Box::pin(async move { self.send(bridge::connect_to_device(&self.bluetooth_id)?).await })
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<(), CoreError>> {
        Box::pin(async move { self.send(bridge::disconnect_from_device(&self.bluetooth_id)?).await })
    }

    fn reconnect(&self) -> BoxFuture<'_, Result<(), CoreError>> {
        self.connect()
    }

    fn write(&self, target: WriteTarget, data: Bytes) -> BoxFuture<'_, Result<(), CoreError>> {
        Box::pin(async move {
            self.send_device_messages(&[Message::new(target.message_type(), data)])
                .await
        })
    }

    fn is_connected(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move { self.connected.load(Ordering::Acquire) && self.socket.is_connected() })
    }

    fn can_reconnect(&self) -> bool {
        true
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

// ── BridgeClient ─────────────────────────────────────────────────────

/// Handle to one bridge server. Cheaply cloneable.
#[derive(Clone)]
pub struct BridgeClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: BridgeConfig,
    socket: Arc<BridgeSocket>,
    events: broadcast::Sender<BridgeEvent>,
    is_scanning_available: AtomicBool,
    is_scanning: AtomicBool,
    discovered: DashMap<String, (DiscoveredDevice, Instant)>,
    transports: DashMap<String, Arc<BridgeTransport>>,
    registry: DeviceRegistry,
    cancel: CancellationToken,
}

impl BridgeClient {
    /// Open the bridge socket and start the background tasks. Returns
    /// immediately; the socket connects (and reconnects) on its own.
    pub fn connect(config: BridgeConfig) -> Self {
        let cancel = CancellationToken::new();
        let socket = Arc::new(BridgeSocket::connect(
            config.url.clone(),
            config.reconnect.clone(),
            cancel.child_token(),
        ));
        let socket_rx = socket.subscribe();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

        let inner = Arc::new(ClientInner {
            config,
            socket,
            events,
            is_scanning_available: AtomicBool::new(false),
            is_scanning: AtomicBool::new(false),
            discovered: DashMap::new(),
            transports: DashMap::new(),
            registry: DeviceRegistry::new(),
            cancel,
        });

        info!(url = %inner.config.url, "bridge client starting");
        tokio::spawn(socket_loop(Arc::downgrade(&inner), socket_rx, inner.cancel.child_token()));
        tokio::spawn(ping_loop(Arc::downgrade(&inner), inner.cancel.child_token()));
        tokio::spawn(expiry_loop(Arc::downgrade(&inner), inner.cancel.child_token()));

        Self { inner }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.socket.is_connected()
    }

    /// Wait until the bridge socket is open.
    pub async fn wait_until_connected(&self) -> Result<(), CoreError> {
        let mut connected = self.inner.socket.connected();
        connected
            .wait_for(|connected| *connected)
            .await
            .map(|_| ())
            .map_err(|_| CoreError::Bridge {
                message: "bridge socket task stopped".into(),
            })
    }

    pub fn is_scanning_available(&self) -> bool {
        self.inner.is_scanning_available.load(Ordering::Acquire)
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.is_scanning.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.inner.events.subscribe()
    }

    pub fn events(&self) -> EventStream<BridgeEvent> {
        EventStream::new(self.inner.events.subscribe())
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.inner.registry
    }

    /// Devices seen by the bridge's scanner and not yet expired.
    pub fn discovered_devices(&self) -> Vec<DiscoveredDevice> {
        let mut devices: Vec<_> = self
            .inner
            .discovered
            .iter()
            .map(|entry| entry.value().0.clone())
            .collect();
        devices.sort_by(|a, b| b.rssi.cmp(&a.rssi));
        devices
    }

    // ── Scanning ─────────────────────────────────────────────────────

    fn ensure_connected(&self) -> Result<(), CoreError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(CoreError::Bridge {
                message: "not connected to bridge".into(),
            })
        }
    }

    pub async fn start_scan(&self) -> Result<(), CoreError> {
        self.ensure_connected()?;
        if !self.is_scanning_available() {
            return Err(CoreError::invalid_state("scanning is not available"));
        }
        if self.is_scanning() {
            return Err(CoreError::invalid_state("already scanning"));
        }
        info!("starting scan");
        self.inner.send(Message::empty(ServerMessageType::StartScan)).await
    }

    pub async fn stop_scan(&self) -> Result<(), CoreError> {
        self.ensure_connected()?;
        if !self.is_scanning() {
            return Err(CoreError::invalid_state("not scanning"));
        }
        info!("stopping scan");
        self.inner.send(Message::empty(ServerMessageType::StopScan)).await
    }

    pub async fn toggle_scan(&self) -> Result<(), CoreError> {
        if self.is_scanning() {
            self.stop_scan().await
        } else {
            self.start_scan().await
        }
    }

    // ── Devices ──────────────────────────────────────────────────────

    /// The session for a remote device, created and registered on first use.
    pub fn device(&self, bluetooth_id: &str) -> Device {
        self.inner.device(bluetooth_id)
    }

    /// Ask the bridge to connect a device and return its session.
    pub async fn connect_to_device(&self, bluetooth_id: &str) -> Result<Device, CoreError> {
        self.ensure_connected()?;
        let device = self.device(bluetooth_id);
        device.connect().await?;
        Ok(device)
    }

    pub async fn disconnect_from_device(&self, bluetooth_id: &str) -> Result<(), CoreError> {
        let device = self
            .inner
            .registry
            .get(&DeviceId::from(bluetooth_id))
            .ok_or_else(|| CoreError::DeviceNotFound {
                identifier: bluetooth_id.to_owned(),
            })?;
        device.disconnect().await
    }

    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.registry.shutdown();
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl ClientInner {
    fn emit(&self, event: BridgeEvent) {
        let _ = self.events.send(event);
    }

    async fn send(&self, message: ServerMessage) -> Result<(), CoreError> {
        self.socket.send(&[message]).await?;
        Ok(())
    }

    fn device(&self, bluetooth_id: &str) -> Device {
        let id = DeviceId::from(bluetooth_id);
        if let Some(device) = self.registry.get(&id) {
            return device;
        }
        let transport = Arc::new(BridgeTransport::new(bluetooth_id.to_owned(), Arc::clone(&self.socket)));
        self.transports
            .insert(bluetooth_id.to_owned(), Arc::clone(&transport));
        let device = Device::new(bluetooth_id, transport, self.config.session.clone());
        self.registry.add(device.clone());
        device
    }

    async fn on_socket_event(&self, event: SocketEvent) {
        match event {
            SocketEvent::Connected => {
                info!("bridge connected");
                self.emit(BridgeEvent::IsConnected(true));
                if let Err(e) = self.socket.send(&bridge::session_requests()).await {
                    warn!(error = %e, "bridge session requests failed");
                }
            }
            SocketEvent::Disconnected => {
                warn!("bridge disconnected");
                self.is_scanning_available.store(false, Ordering::Release);
                self.is_scanning.store(false, Ordering::Release);
                self.emit(BridgeEvent::IsConnected(false));
                let transports: Vec<_> = self.transports.iter().map(|t| Arc::clone(t.value())).collect();
                for transport in transports {
                    transport.set_connected(false).await;
                }
            }
            SocketEvent::Message(message) => {
                if let Err(e) = self.on_message(&message).await {
                    error!(kind = %message.kind, error = %e, "bridge protocol error");
                }
            }
        }
    }

    async fn on_message(&self, message: &ServerMessage) -> Result<(), solekit_proto::Error> {
        use ServerMessageType as T;

        match message.kind {
            T::Ping => {
                if let Err(e) = self.send(Message::empty(T::Pong)).await {
                    warn!(error = %e, "pong failed");
                }
            }
            T::Pong => debug!("pong"),
            T::IsScanningAvailable => {
                let available = bridge::parse_flag(&message.payload, "isScanningAvailable")?;
                self.is_scanning_available.store(available, Ordering::Release);
                self.emit(BridgeEvent::IsScanningAvailable(available));
                if available {
                    if let Err(e) = self.send(Message::empty(T::IsScanning)).await {
                        warn!(error = %e, "isScanning request failed");
                    }
                }
            }
            T::IsScanning => {
                let scanning = bridge::parse_flag(&message.payload, "isScanning")?;
                self.is_scanning.store(scanning, Ordering::Release);
                info!(scanning, "bridge scanning state");
                self.emit(BridgeEvent::IsScanning(scanning));
            }
            T::DiscoveredDevice => {
                let device = bridge::parse_discovered_device(&message.payload)?;
                debug!(device = %device.bluetooth_id, rssi = device.rssi, "discovered device");
                self.discovered
                    .insert(device.bluetooth_id.clone(), (device.clone(), Instant::now()));
                self.emit(BridgeEvent::DiscoveredDevice(device));
            }
            T::ExpiredDiscoveredDevice => {
                let bluetooth_id = bridge::parse_expired_device(&message.payload)?;
                match self.discovered.remove(&bluetooth_id) {
                    Some((_, (device, _))) => self.emit(BridgeEvent::ExpiredDiscoveredDevice(device)),
                    None => warn!(device = %bluetooth_id, "expired device was never discovered"),
                }
            }
            T::ConnectedDevices => {
                let ids = bridge::parse_connected_devices(&message.payload)?;
                for id in &ids {
                    self.device(id);
                    if let Some(transport) = self.transports.get(id).map(|t| Arc::clone(t.value())) {
                        transport.set_connected(true).await;
                    }
                }
                self.emit(BridgeEvent::ConnectedDevices(ids));
            }
            T::DeviceMessage => {
                let (bluetooth_id, messages) = bridge::parse_device_message(&message.payload)?;
                match self.transports.get(&bluetooth_id).map(|t| Arc::clone(t.value())) {
                    Some(transport) => transport.handle(messages).await,
                    None => warn!(device = %bluetooth_id, "message for unknown device"),
                }
            }
            other => debug!(%other, "ignoring bridge message"),
        }
        Ok(())
    }

    fn expire_discovered(&self) {
        let expiration = self.config.discovered_device_expiration;
        let expired: Vec<String> = self
            .discovered
            .iter()
            .filter(|entry| entry.value().1.elapsed() > expiration)
            .map(|entry| entry.key().clone())
            .collect();
        for bluetooth_id in expired {
            if let Some((_, (device, _))) = self.discovered.remove(&bluetooth_id) {
                debug!(device = %bluetooth_id, "discovered device expired");
                self.emit(BridgeEvent::ExpiredDiscoveredDevice(device));
            }
        }
    }
}

// ── Background tasks ─────────────────────────────────────────────────

async fn socket_loop(
    client: Weak<ClientInner>,
    mut socket_rx: broadcast::Receiver<SocketEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = socket_rx.recv() => match event {
                Ok(event) => {
                    let Some(client) = client.upgrade() else { break };
                    client.on_socket_event(event).await;
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "bridge events lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    }
    debug!("bridge socket loop exiting");
}

async fn ping_loop(client: Weak<ClientInner>, cancel: CancellationToken) {
    let Some(period) = client.upgrade().map(|c| c.config.ping_interval) else {
        return;
    };
    let mut interval = tokio::time::interval(period);
    interval.tick().await;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                let Some(client) = client.upgrade() else { break };
                if client.socket.is_connected() {
                    if let Err(e) = client.send(Message::empty(ServerMessageType::Ping)).await {
                        warn!(error = %e, "ping failed");
                    }
                }
            }
        }
    }
}

async fn expiry_loop(client: Weak<ClientInner>, cancel: CancellationToken) {
    let Some(period) = client.upgrade().map(|c| c.config.expiration_check_interval) else {
        return;
    };
    let mut interval = tokio::time::interval(period);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                let Some(client) = client.upgrade() else { break };
                client.expire_discovered();
            }
        }
    }
}
