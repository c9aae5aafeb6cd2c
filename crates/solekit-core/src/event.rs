// ── Device events ──
//
// Everything a device session reports, as one tagged union delivered over
// `tokio::sync::broadcast`. Serializes as `{"type": ..., "message": ...}`.

use bytes::Bytes;
use serde::Serialize;

use solekit_proto::device_info::DeviceInformation;
use solekit_proto::file_transfer::{FileTransferStatus, FileType, TransferDirection};
use solekit_proto::image::{FirmwareImage, FirmwareStatus};
use solekit_proto::information::DeviceType;
use solekit_proto::sensor::pressure::Vector2;
use solekit_proto::sensor::{SensorConfiguration, SensorReading, SensorType};
use solekit_proto::tflite::{TfliteInference, TfliteTask};

use crate::connection::ConnectionStatus;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "message", rename_all = "camelCase")]
pub enum DeviceEvent {
    // ── Connection ───────────────────────────────────────────────────
    /// Raw transport status, including while the handshake is running.
    ConnectionStatus(ConnectionStatus),
    /// Readiness: transport connected, handshake complete, clock set.
    IsConnected(bool),

    // ── Information ──────────────────────────────────────────────────
    IsCharging(bool),
    BatteryCurrent(f32),
    BatteryLevel(u8),
    Id(String),
    Name(String),
    DeviceType(DeviceType),
    Mtu(u16),
    CurrentTime(u64),
    DeviceInformation(DeviceInformation),

    // ── Sensors ──────────────────────────────────────────────────────
    SensorConfiguration(SensorConfiguration),
    PressurePositions(Vec<Vector2>),
    SensorData(SensorReading),

    // ── File transfer ────────────────────────────────────────────────
    MaxFileLength(u32),
    FileTransferType(FileType),
    FileLength(u32),
    FileChecksum(u32),
    FileTransferStatus(FileTransferStatus),
    #[serde(rename_all = "camelCase")]
    FileTransferProgress {
        direction: TransferDirection,
        progress: f64,
    },
    FileTransferComplete {
        direction: TransferDirection,
    },
    #[serde(rename_all = "camelCase")]
    FileReceived {
        file_name: String,
        file_type: FileType,
        #[serde(skip)]
        data: Bytes,
        size: usize,
    },
    FileTransferError {
        expected: u32,
        actual: u32,
    },

    // ── TFLite ───────────────────────────────────────────────────────
    TfliteName(String),
    TfliteTask(TfliteTask),
    TfliteSampleRate(u16),
    TfliteSensorTypes(Vec<SensorType>),
    TfliteIsReady(bool),
    TfliteCaptureDelay(u16),
    TfliteThreshold(f32),
    TfliteInferencingEnabled(bool),
    TfliteInference(TfliteInference),

    // ── Firmware ─────────────────────────────────────────────────────
    FirmwareImages(Vec<FirmwareImage>),
    FirmwareStatus(FirmwareStatus),
    FirmwareUploadProgress(f64),
    FirmwareUploadComplete,

    // ── Errors ───────────────────────────────────────────────────────
    /// The device sent something the codecs could not make sense of.
    ProtocolError(String),
}
