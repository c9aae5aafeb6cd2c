// ── Device session ──
//
// One handle per physical insole. Owns the connection manager and every
// session manager, and runs the dispatcher task that applies inbound
// traffic in arrival order: handshake bookkeeping, clock setup, routing to
// the managers and resolving pending requests.

use std::sync::{Arc, Mutex as StdMutex, Weak};

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, error, info, warn};

use solekit_proto::device_info::{self, DeviceInformation, DeviceInformationBuilder};
use solekit_proto::message::{MessageGroup, REQUIRED_HANDSHAKE};
use solekit_proto::{ConnectionMessageType, DeviceMessageType};

use crate::config::SessionConfig;
use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionStatus, DeviceMessage, MessageSender};
use crate::error::CoreError;
use crate::event::DeviceEvent;
use crate::lock;
use crate::pending::{PendingRequests, Requester};
use crate::session::{
    FileTransferManager, FirmwareManager, InformationManager, InformationUpdate, SensorManager, TfliteManager,
    VibrationManager, emit,
};
use crate::stream::EventStream;
use crate::transport::Transport;

const EVENT_CHANNEL_SIZE: usize = 1024;

/// A device session.
///
/// Cheaply cloneable via `Arc<DeviceInner>`. Dropping the last handle stops
/// the background tasks.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

struct DeviceInner {
    id: String,
    connection: ConnectionManager,
    pending: Arc<PendingRequests>,
    events: broadcast::Sender<DeviceEvent>,
    /// Handshake complete and clock set.
    ready: watch::Sender<bool>,
    /// Latest payload per (canonical) message type for this connection.
    latest: DashMap<DeviceMessageType, Bytes>,
    device_information: ArcSwapOption<DeviceInformation>,
    battery_level: StdMutex<Option<u8>>,

    information: InformationManager,
    sensors: SensorManager,
    file_transfer: FileTransferManager,
    tflite: TfliteManager,
    vibration: VibrationManager,
    firmware: FirmwareManager,
}

/// Per-connection state owned by the dispatcher task.
#[derive(Default)]
struct DispatchState {
    clock_set: bool,
    device_information: DeviceInformationBuilder,
}

impl Device {
    /// Build a session around `transport` and start its dispatcher.
    ///
    /// Must be called inside a Tokio runtime. Nothing is connected yet.
    pub fn new(id: impl Into<String>, transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        let (connection, connection_rx) = ConnectionManager::new(transport, config.connection);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let (ready, ready_rx) = watch::channel(false);
        let pending = Arc::new(PendingRequests::default());

        let sender: Arc<dyn MessageSender> = Arc::new(connection.clone());
        let requester = Requester::new(sender, Arc::clone(&pending), ready_rx);

        let inner = Arc::new(DeviceInner {
            id: id.into(),
            information: InformationManager::new(requester.clone(), events.clone()),
            sensors: SensorManager::new(requester.clone(), events.clone()),
            file_transfer: FileTransferManager::new(requester.clone(), events.clone()),
            tflite: TfliteManager::new(requester.clone(), events.clone()),
            vibration: VibrationManager::new(requester.clone()),
            firmware: FirmwareManager::new(requester, events.clone(), config.firmware),
            connection,
            pending,
            events,
            ready,
            latest: DashMap::new(),
            device_information: ArcSwapOption::empty(),
            battery_level: StdMutex::new(None),
        });

        tokio::spawn(dispatch(Arc::downgrade(&inner), connection_rx));

        Self { inner }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    // ── Connection ───────────────────────────────────────────────────

    pub async fn connect(&self) -> Result<(), CoreError> {
        info!(device = %self.inner.id, "connecting");
        self.inner.connection.connect().await
    }

    pub async fn disconnect(&self) -> Result<(), CoreError> {
        info!(device = %self.inner.id, "disconnecting");
        self.inner.connection.disconnect().await
    }

    pub async fn reconnect(&self) -> Result<(), CoreError> {
        info!(device = %self.inner.id, "reconnecting");
        self.inner.connection.reconnect().await
    }

    pub fn can_reconnect(&self) -> bool {
        self.inner.connection.can_reconnect()
    }

    /// Transport status, except that a connected device still running its
    /// handshake reports `Connecting`.
    pub fn connection_status(&self) -> ConnectionStatus {
        self.inner.connection_status()
    }

    /// Handshake complete and clock set.
    pub fn is_connected(&self) -> bool {
        *self.inner.ready.borrow()
    }

    pub fn watch_ready(&self) -> watch::Receiver<bool> {
        self.inner.ready.subscribe()
    }

    /// Raw transport status changes.
    pub fn status_stream(&self) -> WatchStream<ConnectionStatus> {
        WatchStream::new(self.inner.connection.watch_status())
    }

    /// Stop background tasks. The handle stays usable for reading state.
    pub fn close(&self) {
        self.inner.connection.close();
    }

    // ── Events ───────────────────────────────────────────────────────

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.inner.events.subscribe()
    }

    pub fn events(&self) -> EventStream<DeviceEvent> {
        EventStream::new(self.inner.events.subscribe())
    }

    // ── State ────────────────────────────────────────────────────────

    /// Latest payload of a message type on the current connection. Setter
    /// echoes are stored under their getter.
    pub fn latest_message(&self, kind: DeviceMessageType) -> Option<Bytes> {
        self.inner.latest.get(&kind.canonical()).map(|entry| entry.value().clone())
    }

    pub fn device_information(&self) -> Option<Arc<DeviceInformation>> {
        self.inner.device_information.load_full()
    }

    pub fn battery_level(&self) -> Option<u8> {
        *lock(&self.inner.battery_level)
    }

    // ── Session managers ─────────────────────────────────────────────

    pub fn information(&self) -> &InformationManager {
        &self.inner.information
    }

    pub fn sensors(&self) -> &SensorManager {
        &self.inner.sensors
    }

    pub fn file_transfer(&self) -> &FileTransferManager {
        &self.inner.file_transfer
    }

    pub fn tflite(&self) -> &TfliteManager {
        &self.inner.tflite
    }

    pub fn vibration(&self) -> &VibrationManager {
        &self.inner.vibration
    }

    pub fn firmware(&self) -> &FirmwareManager {
        &self.inner.firmware
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.inner.id)
            .field("status", &self.inner.connection_status())
            .finish_non_exhaustive()
    }
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        self.connection.close();
    }
}

// ── Dispatcher ───────────────────────────────────────────────────────

async fn dispatch(device: Weak<DeviceInner>, mut connection_rx: mpsc::UnboundedReceiver<ConnectionEvent>) {
    let mut state = DispatchState::default();
    while let Some(event) = connection_rx.recv().await {
        let Some(device) = device.upgrade() else {
            break;
        };
        device.apply(event, &mut state).await;
    }
    debug!("device dispatcher exiting");
}

impl DeviceInner {
    fn connection_status(&self) -> ConnectionStatus {
        match self.connection.status() {
            ConnectionStatus::Connected if !*self.ready.borrow() => ConnectionStatus::Connecting,
            status => status,
        }
    }

    async fn apply(&self, event: ConnectionEvent, state: &mut DispatchState) {
        match event {
            ConnectionEvent::Status(status) => self.on_status(status, state).await,
            ConnectionEvent::Device(message) => self.on_message(message, state).await,
            ConnectionEvent::Connection(kind, payload) => self.on_connection_message(kind, &payload, state),
            ConnectionEvent::Smp(data) => {
                for e in self.firmware.handle_smp(&data) {
                    self.protocol_error(&e);
                }
            }
            ConnectionEvent::ProtocolError(e) => self.protocol_error(&e),
        }
    }

    fn protocol_error(&self, e: &solekit_proto::Error) {
        error!(device = %self.id, error = %e, "protocol error");
        emit(&self.events, DeviceEvent::ProtocolError(e.to_string()));
    }

    fn reset_session(&self, state: &mut DispatchState) {
        self.latest.clear();
        *state = DispatchState::default();
        self.information.clear();
        self.sensors.clear();
        self.file_transfer.clear();
        self.tflite.clear();
    }

    async fn on_status(&self, status: ConnectionStatus, state: &mut DispatchState) {
        match status {
            ConnectionStatus::Connected => {
                self.reset_session(state);
                if !*self.ready.borrow() {
                    self.request_handshake().await;
                }
            }
            ConnectionStatus::NotConnected => {
                let was_ready = self.ready.send_replace(false);
                if was_ready {
                    info!(device = %self.id, "device no longer ready");
                    emit(&self.events, DeviceEvent::IsConnected(false));
                }
                self.reset_session(state);
                self.pending.fail_all();
                self.firmware.clear();
            }
            ConnectionStatus::Connecting | ConnectionStatus::Disconnecting => {}
        }
        emit(&self.events, DeviceEvent::ConnectionStatus(self.connection_status()));
    }

    async fn request_handshake(&self) {
        debug!(device = %self.id, count = REQUIRED_HANDSHAKE.len(), "requesting handshake");
        let messages = REQUIRED_HANDSHAKE.iter().map(|kind| DeviceMessage::empty(*kind)).collect();
        if let Err(e) = self.connection.send(messages, true).await {
            warn!(device = %self.id, error = %e, "handshake request failed");
        }
    }

    async fn on_message(&self, message: DeviceMessage, state: &mut DispatchState) {
        let kind = message.kind;
        debug!(device = %self.id, %kind, len = message.payload.len(), "device message");

        let routed = match kind.group() {
            MessageGroup::Information => self.information.handle(&message),
            MessageGroup::SensorConfiguration | MessageGroup::SensorData => self.sensors.handle(&message).map(|()| None),
            MessageGroup::Tflite => self.tflite.handle(&message).map(|()| None),
            MessageGroup::FileTransfer => self.file_transfer.handle(&message).map(|()| None),
            MessageGroup::Vibration => Ok(None),
        };
        let update = match routed {
            Ok(update) => update,
            Err(e) => {
                self.protocol_error(&e);
                return;
            }
        };

        match update {
            Some(InformationUpdate::Mtu(mtu)) => {
                self.connection.set_mtu(mtu);
                self.file_transfer.set_mtu(mtu);
                self.firmware.set_mtu(mtu);
            }
            Some(InformationUpdate::CurrentTime(0)) => {
                state.clock_set = false;
                if let Err(e) = self.information.set_current_time().await {
                    warn!(device = %self.id, error = %e, "failed to set device clock");
                }
            }
            Some(InformationUpdate::CurrentTime(_)) => state.clock_set = true,
            None => {}
        }

        let canonical = kind.canonical();
        self.latest.insert(canonical, message.payload.clone());
        self.check_ready(state);
        self.pending.resolve(canonical, &message.payload);
    }

    fn check_ready(&self, state: &DispatchState) {
        if *self.ready.borrow() || !state.clock_set || self.connection.status() != ConnectionStatus::Connected {
            return;
        }
        if !REQUIRED_HANDSHAKE.iter().all(|kind| self.latest.contains_key(kind)) {
            return;
        }

        self.ready.send_replace(true);
        info!(device = %self.id, "device ready");
        emit(&self.events, DeviceEvent::IsConnected(true));
        emit(&self.events, DeviceEvent::ConnectionStatus(ConnectionStatus::Connected));
    }

    fn on_connection_message(&self, kind: ConnectionMessageType, payload: &[u8], state: &mut DispatchState) {
        if kind == ConnectionMessageType::BatteryLevel {
            match device_info::parse_battery_level(payload) {
                Ok(level) => {
                    *lock(&self.battery_level) = Some(level);
                    emit(&self.events, DeviceEvent::BatteryLevel(level));
                }
                Err(e) => self.protocol_error(&e),
            }
            return;
        }

        match state.device_information.update(kind, payload) {
            Ok(true) => {
                let Some(information) = state.device_information.complete() else {
                    return;
                };
                let current = self.device_information.load();
                if current.as_deref() == Some(&information) {
                    return;
                }
                debug!(device = %self.id, ?information, "device information complete");
                self.device_information.store(Some(Arc::new(information.clone())));
                emit(&self.events, DeviceEvent::DeviceInformation(information));
            }
            Ok(false) => debug!(device = %self.id, %kind, "unhandled connection message"),
            Err(e) => self.protocol_error(&e),
        }
    }
}
