// Shared fixtures for solekit-core integration tests.
//
// `FakeInsole` is an in-memory `Transport` that behaves like well-behaved
// firmware: it answers the connect handshake, echoes setters, keeps a
// sensor configuration and answers SMP image requests.

#![allow(dead_code, clippy::unwrap_used)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::sync::broadcast;

use solekit_core::{
    ConnectionStatus, CoreError, Device, DeviceEvent, SessionConfig, Transport, TransportEvent, WriteTarget,
};
use solekit_proto::cbor::CborValue;
use solekit_proto::codec::{self, LengthWidth, Message};
use solekit_proto::sensor::SensorConfiguration;
use solekit_proto::smp::{self, Op, Reassembler, Request};
use solekit_proto::{ConnectionMessageType, DeviceMessageType, MessageKind};

type DeviceMessage = Message<DeviceMessageType>;

// ── FakeInsole ──────────────────────────────────────────────────────

pub struct FakeInsole {
    events: broadcast::Sender<TransportEvent>,
    connected: AtomicBool,
    /// When false, connect() succeeds without the link coming up.
    link_up_on_connect: AtomicBool,
    /// When false, handshake requests go unanswered.
    answer: AtomicBool,
    reconnectable: AtomicBool,
    pub connect_calls: AtomicUsize,
    pub reconnect_calls: AtomicUsize,
    state: Mutex<FirmwareState>,
    writes: Mutex<Vec<(WriteTarget, Bytes)>>,
}

struct FirmwareState {
    mtu: u16,
    current_time: u64,
    name: String,
    sensors: BTreeMap<u8, u16>,
    smp: Reassembler,
    uploaded: Vec<u8>,
    smp_rc: Option<i64>,
}

impl FakeInsole {
    pub fn new() -> Arc<Self> {
        Self::with_mtu(247)
    }

    pub fn with_mtu(mtu: u16) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            events,
            connected: AtomicBool::new(false),
            link_up_on_connect: AtomicBool::new(true),
            answer: AtomicBool::new(true),
            reconnectable: AtomicBool::new(true),
            connect_calls: AtomicUsize::new(0),
            reconnect_calls: AtomicUsize::new(0),
            state: Mutex::new(FirmwareState {
                mtu,
                current_time: 0,
                name: "Left Sole".into(),
                // acceleration and pressure advertised, both off
                sensors: BTreeMap::from([(0, 0), (12, 0)]),
                smp: Reassembler::new(),
                uploaded: Vec::new(),
                smp_rc: None,
            }),
            writes: Mutex::new(Vec::new()),
        })
    }

    pub fn set_clock(&self, unix_ms: u64) {
        self.state.lock().unwrap().current_time = unix_ms;
    }

    pub fn set_answering(&self, answer: bool) {
        self.answer.store(answer, Ordering::SeqCst);
    }

    pub fn set_link_up_on_connect(&self, up: bool) {
        self.link_up_on_connect.store(up, Ordering::SeqCst);
    }

    pub fn set_reconnectable(&self, reconnectable: bool) {
        self.reconnectable.store(reconnectable, Ordering::SeqCst);
    }

    pub fn set_smp_rc(&self, rc: Option<i64>) {
        self.state.lock().unwrap().smp_rc = rc;
    }

    pub fn uploaded(&self) -> Vec<u8> {
        self.state.lock().unwrap().uploaded.clone()
    }

    /// Drop the link as if the radio went away.
    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Status(ConnectionStatus::NotConnected));
    }

    /// Mark the link dead without telling anyone; only liveness polling notices.
    pub fn kill_silently(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn bring_up(&self) {
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Status(ConnectionStatus::Connected));
    }

    /// Deliver device TLV messages as one `rx` notification.
    pub fn notify(&self, messages: &[DeviceMessage]) {
        let encoded = codec::encode(messages, LengthWidth::U8).unwrap();
        let _ = self
            .events
            .send(TransportEvent::Message(ConnectionMessageType::Rx, Bytes::from(encoded)));
    }

    pub fn notify_connection(&self, kind: ConnectionMessageType, payload: &[u8]) {
        let _ = self
            .events
            .send(TransportEvent::Message(kind, Bytes::copy_from_slice(payload)));
    }

    pub fn tx_writes(&self) -> Vec<Bytes> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(target, _)| *target == WriteTarget::Tx)
            .map(|(_, data)| data.clone())
            .collect()
    }

    pub fn smp_writes(&self) -> usize {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(target, _)| *target == WriteTarget::Smp)
            .count()
    }

    /// Every device message written so far, in order.
    pub fn sent_messages(&self) -> Vec<DeviceMessage> {
        self.tx_writes()
            .iter()
            .flat_map(|write| codec::decode::<DeviceMessageType>(write, LengthWidth::U8).unwrap())
            .collect()
    }

    pub fn sent_kinds(&self) -> Vec<DeviceMessageType> {
        self.sent_messages().into_iter().map(|m| m.kind).collect()
    }

    pub fn clear_writes(&self) {
        self.writes.lock().unwrap().clear();
    }

    fn connect_now(&self) {
        if self.link_up_on_connect.load(Ordering::SeqCst) {
            self.bring_up();
        }
    }

    fn respond(&self, request: &DeviceMessage) -> Option<DeviceMessage> {
        if self.answer.load(Ordering::SeqCst) {
            self.reply(request)
        } else {
            None
        }
    }

    /// What the insole would answer to `request`, whether or not it is
    /// currently answering.
    pub fn reply(&self, request: &DeviceMessage) -> Option<DeviceMessage> {
        use DeviceMessageType as T;

        let mut state = self.state.lock().unwrap();
        let payload: Vec<u8> = match request.kind {
            T::IsCharging => vec![1],
            T::GetBatteryCurrent => 0.25f32.to_le_bytes().to_vec(),
            T::GetId => b"insole-01".to_vec(),
            T::GetMtu => state.mtu.to_le_bytes().to_vec(),
            T::GetName => state.name.as_bytes().to_vec(),
            T::SetName => {
                state.name = String::from_utf8(request.payload.to_vec()).unwrap();
                state.name.as_bytes().to_vec()
            }
            T::GetType => vec![0],
            T::SetType => request.payload.to_vec(),
            T::GetCurrentTime => state.current_time.to_le_bytes().to_vec(),
            T::SetCurrentTime => {
                state.current_time = u64::from_le_bytes(request.payload[..8].try_into().unwrap());
                request.payload.to_vec()
            }
            T::GetSensorConfiguration => encode_sensors(&state.sensors),
            T::SetSensorConfiguration => {
                let requested = SensorConfiguration::parse(&request.payload).unwrap();
                for sensor in requested.sensors() {
                    state.sensors.insert(sensor.index(), requested.get(sensor).unwrap());
                }
                encode_sensors(&state.sensors)
            }
            T::GetSensorScalars => {
                let mut out = vec![12];
                out.extend_from_slice(&(1.0f32 / 4096.0).to_le_bytes());
                out
            }
            T::GetPressurePositions => vec![40, 200, 80, 60],
            T::MaxFileLength => 10_000u32.to_le_bytes().to_vec(),
            T::GetFileLength | T::GetFileChecksum => 0u32.to_le_bytes().to_vec(),
            T::GetFileTransferType | T::FileTransferStatus => vec![0],
            T::SetFileTransferType | T::SetFileLength | T::SetFileChecksum => request.payload.to_vec(),
            T::SetFileTransferCommand => {
                let status = match request.payload[0] {
                    0 => 1,
                    1 => 2,
                    _ => 0,
                };
                return Some(Message::new(T::FileTransferStatus, vec![status]));
            }
            T::GetTfliteName => b"gestures".to_vec(),
            T::GetTfliteTask | T::TfliteIsReady | T::GetTfliteInferencingEnabled => vec![0],
            T::GetTfliteSampleRate => 20u16.to_le_bytes().to_vec(),
            T::GetTfliteSensorTypes => vec![12],
            T::GetTfliteCaptureDelay => 500u16.to_le_bytes().to_vec(),
            T::GetTfliteThreshold => 0.5f32.to_le_bytes().to_vec(),
            _ => return None,
        };
        Some(Message::new(request.kind, payload))
    }

    fn respond_smp(&self, data: &[u8]) -> Vec<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        let frames = state.smp.push(data);
        let mut responses = Vec::new();
        for frame in frames {
            let frame = frame.unwrap();
            let header = frame.header;
            let op = if header.op == Op::Read { Op::ReadRsp } else { Op::WriteRsp };

            let body = if let Some(rc) = state.smp_rc {
                CborValue::map([("rc", CborValue::integer(rc))])
            } else {
                match (header.group, header.id) {
                    (smp::group::IMAGE, smp::image::UPLOAD) => {
                        if let Some(data) = frame.body.get("data").and_then(CborValue::as_bytes) {
                            state.uploaded.extend_from_slice(data);
                        }
                        let off = u64::try_from(state.uploaded.len()).unwrap();
                        CborValue::map([("rc", CborValue::integer(0)), ("off", CborValue::Unsigned(off))])
                    }
                    (smp::group::IMAGE, smp::image::STATE) => image_state(!state.uploaded.is_empty()),
                    (smp::group::OS, smp::os::ECHO) => {
                        let text = frame.body.get("d").and_then(CborValue::as_str).unwrap_or_default();
                        CborValue::map([("r", CborValue::Text(text.to_owned()))])
                    }
                    _ => CborValue::map([("rc", CborValue::integer(0))]),
                }
            };

            let response = Request {
                op,
                group: header.group,
                id: header.id,
                body: Some(body),
            };
            responses.push(response.encode(header.seq).unwrap());
        }
        responses
    }
}

fn encode_sensors(sensors: &BTreeMap<u8, u16>) -> Vec<u8> {
    let mut out = Vec::new();
    for (index, rate) in sensors {
        out.push(*index);
        out.extend_from_slice(&rate.to_le_bytes());
    }
    out
}

fn image_state(with_upload: bool) -> CborValue {
    let slot = |slot: u64, confirmed: bool, bootable: bool| {
        CborValue::map([
            ("slot", CborValue::Unsigned(slot)),
            ("version", CborValue::Text(format!("1.{slot}.0"))),
            ("hash", CborValue::Bytes(vec![0xA0 + u8::try_from(slot).unwrap(); 32])),
            ("bootable", CborValue::Bool(bootable)),
            ("pending", CborValue::Bool(false)),
            ("confirmed", CborValue::Bool(confirmed)),
            ("active", CborValue::Bool(slot == 0)),
            ("permanent", CborValue::Bool(false)),
        ])
    };
    let mut slots = vec![slot(0, true, true)];
    if with_upload {
        slots.push(slot(1, false, true));
    }
    CborValue::map([("images", CborValue::Array(slots))])
}

impl Transport for FakeInsole {
    fn connect(&self) -> BoxFuture<'_, Result<(), CoreError>> {
        Box::pin(async move {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            self.connect_now();
            Ok(())
        })
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<(), CoreError>> {
        Box::pin(async move {
            self.drop_link();
            Ok(())
        })
    }

    fn reconnect(&self) -> BoxFuture<'_, Result<(), CoreError>> {
        Box::pin(async move {
            self.reconnect_calls.fetch_add(1, Ordering::SeqCst);
            self.connect_now();
            Ok(())
        })
    }

    fn write(&self, target: WriteTarget, data: Bytes) -> BoxFuture<'_, Result<(), CoreError>> {
        Box::pin(async move {
            if !self.connected.load(Ordering::SeqCst) {
                return Err(CoreError::Transport {
                    message: "link down".into(),
                });
            }
            self.writes.lock().unwrap().push((target, data.clone()));
            match target {
                WriteTarget::Tx => {
                    let requests = codec::decode::<DeviceMessageType>(&data, LengthWidth::U8).unwrap();
                    let responses: Vec<_> = requests.iter().filter_map(|r| self.respond(r)).collect();
                    if !responses.is_empty() {
                        self.notify(&responses);
                    }
                }
                WriteTarget::Smp => {
                    for response in self.respond_smp(&data) {
                        let _ = self
                            .events
                            .send(TransportEvent::Message(ConnectionMessageType::Smp, Bytes::from(response)));
                    }
                }
            }
            Ok(())
        })
    }

    fn is_connected(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move { self.connected.load(Ordering::SeqCst) })
    }

    fn can_reconnect(&self) -> bool {
        self.reconnectable.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

pub fn device(fake: &Arc<FakeInsole>) -> Device {
    device_with(fake, SessionConfig::default())
}

pub fn device_with(fake: &Arc<FakeInsole>, config: SessionConfig) -> Device {
    Device::new("insole-01", Arc::clone(fake) as Arc<dyn Transport>, config)
}

/// Connect and wait until the handshake has completed.
pub async fn connected_device(fake: &Arc<FakeInsole>) -> Device {
    let device = device(fake);
    device.connect().await.unwrap();
    wait_ready(&device).await;
    device
}

pub async fn wait_ready(device: &Device) {
    let mut ready = device.watch_ready();
    tokio::time::timeout(Duration::from_secs(30), ready.wait_for(|ready| *ready))
        .await
        .expect("device never became ready")
        .unwrap();
}

/// Wait for the first event matching `predicate`.
pub async fn next_event(
    events: &mut broadcast::Receiver<DeviceEvent>,
    predicate: impl Fn(&DeviceEvent) -> bool,
) -> DeviceEvent {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let event = events.recv().await.unwrap();
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event never arrived")
}

/// Yield until `condition` holds.
pub async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(30), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}
