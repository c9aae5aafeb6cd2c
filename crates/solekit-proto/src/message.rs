// ── Message type enumerations ──
//
// Closed, contiguous enums for every TLV protocol in the system. The
// discriminant IS the wire index, so variant order must never change.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, FromRepr, IntoStaticStr};

/// A closed enumeration usable as the type field of a TLV frame.
pub trait MessageKind: Copy + Eq + std::fmt::Debug + Send + Sync + 'static {
    /// Short label used in error messages.
    const KIND: &'static str;

    fn index(self) -> u8;

    fn from_index(index: u8) -> Option<Self>;
}

macro_rules! message_kind {
    ($ty:ty, $kind:literal) => {
        impl $crate::message::MessageKind for $ty {
            const KIND: &'static str = $kind;

            #[allow(clippy::as_conversions)]
            fn index(self) -> u8 {
                self as u8
            }

            fn from_index(index: u8) -> Option<Self> {
                Self::from_repr(index)
            }
        }
    };
}

pub(crate) use message_kind;

// ── Device-local messages ───────────────────────────────────────────

/// Message types carried inside the `rx`/`tx` characteristics.
///
/// Grouped as Information, SensorConfiguration, SensorData, Vibration,
/// Tflite, FileTransfer. Both sides agree on this order.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    FromRepr,
    IntoStaticStr,
)]
#[repr(u8)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum DeviceMessageType {
    // Information
    IsCharging,
    GetBatteryCurrent,
    GetMtu,
    GetId,
    GetName,
    SetName,
    GetType,
    SetType,
    GetCurrentTime,
    SetCurrentTime,

    // Sensor configuration
    GetSensorConfiguration,
    SetSensorConfiguration,

    // Sensor data
    GetPressurePositions,
    GetSensorScalars,
    SensorData,

    // Vibration
    TriggerVibration,

    // Tflite
    GetTfliteName,
    SetTfliteName,
    GetTfliteTask,
    SetTfliteTask,
    GetTfliteSampleRate,
    SetTfliteSampleRate,
    GetTfliteSensorTypes,
    SetTfliteSensorTypes,
    TfliteIsReady,
    GetTfliteCaptureDelay,
    SetTfliteCaptureDelay,
    GetTfliteThreshold,
    SetTfliteThreshold,
    GetTfliteInferencingEnabled,
    SetTfliteInferencingEnabled,
    TfliteInference,

    // File transfer
    MaxFileLength,
    GetFileTransferType,
    SetFileTransferType,
    GetFileLength,
    SetFileLength,
    GetFileChecksum,
    SetFileChecksum,
    SetFileTransferCommand,
    FileTransferStatus,
    GetFileTransferBlock,
    SetFileTransferBlock,
}

message_kind!(DeviceMessageType, "device");

/// Which session component owns a device message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageGroup {
    Information,
    SensorConfiguration,
    SensorData,
    Vibration,
    Tflite,
    FileTransfer,
}

/// Message types a device must report before it is considered ready.
pub const REQUIRED_HANDSHAKE: [DeviceMessageType; 23] = [
    DeviceMessageType::IsCharging,
    DeviceMessageType::GetBatteryCurrent,
    DeviceMessageType::GetId,
    DeviceMessageType::GetMtu,
    DeviceMessageType::GetName,
    DeviceMessageType::GetType,
    DeviceMessageType::GetCurrentTime,
    DeviceMessageType::GetSensorConfiguration,
    DeviceMessageType::GetSensorScalars,
    DeviceMessageType::GetPressurePositions,
    DeviceMessageType::MaxFileLength,
    DeviceMessageType::GetFileLength,
    DeviceMessageType::GetFileChecksum,
    DeviceMessageType::GetFileTransferType,
    DeviceMessageType::FileTransferStatus,
    DeviceMessageType::GetTfliteName,
    DeviceMessageType::GetTfliteTask,
    DeviceMessageType::GetTfliteSampleRate,
    DeviceMessageType::GetTfliteSensorTypes,
    DeviceMessageType::TfliteIsReady,
    DeviceMessageType::GetTfliteCaptureDelay,
    DeviceMessageType::GetTfliteThreshold,
    DeviceMessageType::GetTfliteInferencingEnabled,
];

impl DeviceMessageType {
    pub fn group(self) -> MessageGroup {
        use DeviceMessageType as T;
        match self {
            T::IsCharging
            | T::GetBatteryCurrent
            | T::GetMtu
            | T::GetId
            | T::GetName
            | T::SetName
            | T::GetType
            | T::SetType
            | T::GetCurrentTime
            | T::SetCurrentTime => MessageGroup::Information,
            T::GetSensorConfiguration | T::SetSensorConfiguration => {
                MessageGroup::SensorConfiguration
            }
            T::GetPressurePositions | T::GetSensorScalars | T::SensorData => {
                MessageGroup::SensorData
            }
            T::TriggerVibration => MessageGroup::Vibration,
            T::GetTfliteName
            | T::SetTfliteName
            | T::GetTfliteTask
            | T::SetTfliteTask
            | T::GetTfliteSampleRate
            | T::SetTfliteSampleRate
            | T::GetTfliteSensorTypes
            | T::SetTfliteSensorTypes
            | T::TfliteIsReady
            | T::GetTfliteCaptureDelay
            | T::SetTfliteCaptureDelay
            | T::GetTfliteThreshold
            | T::SetTfliteThreshold
            | T::GetTfliteInferencingEnabled
            | T::SetTfliteInferencingEnabled
            | T::TfliteInference => MessageGroup::Tflite,
            T::MaxFileLength
            | T::GetFileTransferType
            | T::SetFileTransferType
            | T::GetFileLength
            | T::SetFileLength
            | T::GetFileChecksum
            | T::SetFileChecksum
            | T::SetFileTransferCommand
            | T::FileTransferStatus
            | T::GetFileTransferBlock
            | T::SetFileTransferBlock => MessageGroup::FileTransfer,
        }
    }

    /// The getter a device echoes a setter as.
    ///
    /// Devices answer `setX` with a `setX` frame carrying the new value;
    /// both count as a report of `getX` for waiting and handshake purposes.
    pub fn canonical(self) -> Self {
        use DeviceMessageType as T;
        match self {
            T::SetName => T::GetName,
            T::SetType => T::GetType,
            T::SetCurrentTime => T::GetCurrentTime,
            T::SetSensorConfiguration => T::GetSensorConfiguration,
            T::SetTfliteName => T::GetTfliteName,
            T::SetTfliteTask => T::GetTfliteTask,
            T::SetTfliteSampleRate => T::GetTfliteSampleRate,
            T::SetTfliteSensorTypes => T::GetTfliteSensorTypes,
            T::SetTfliteCaptureDelay => T::GetTfliteCaptureDelay,
            T::SetTfliteThreshold => T::GetTfliteThreshold,
            T::SetTfliteInferencingEnabled => T::GetTfliteInferencingEnabled,
            T::SetFileTransferType => T::GetFileTransferType,
            T::SetFileLength => T::GetFileLength,
            T::SetFileChecksum => T::GetFileChecksum,
            other => other,
        }
    }

    pub fn is_handshake(self) -> bool {
        REQUIRED_HANDSHAKE.contains(&self)
    }
}

// ── Connection-level messages ───────────────────────────────────────

/// Characteristics and signals exposed by a transport, outside the
/// device-local TLV stream.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    FromRepr,
    IntoStaticStr,
)]
#[repr(u8)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum ConnectionMessageType {
    ManufacturerName,
    ModelNumber,
    SoftwareRevision,
    HardwareRevision,
    FirmwareRevision,
    PnpId,
    SerialNumber,
    BatteryLevel,
    Smp,
    Rx,
    Tx,
    IsConnected,
}

message_kind!(ConnectionMessageType, "connection");

impl ConnectionMessageType {
    /// Device-information characteristics requested after connecting.
    pub const DEVICE_INFORMATION: [Self; 7] = [
        Self::ManufacturerName,
        Self::ModelNumber,
        Self::SoftwareRevision,
        Self::HardwareRevision,
        Self::FirmwareRevision,
        Self::PnpId,
        Self::SerialNumber,
    ];

    pub fn is_device_information(self) -> bool {
        Self::DEVICE_INFORMATION.contains(&self)
    }
}

// ── Server-bridge messages ──────────────────────────────────────────

/// Message types exchanged with a bridge server (2-byte length field).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    FromRepr,
    IntoStaticStr,
)]
#[repr(u8)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum ServerMessageType {
    Ping,
    Pong,
    IsScanningAvailable,
    IsScanning,
    StartScan,
    StopScan,
    DiscoveredDevice,
    DiscoveredDevices,
    ExpiredDiscoveredDevice,
    ConnectToDevice,
    DisconnectFromDevice,
    ConnectedDevices,
    DeviceMessage,
}

message_kind!(ServerMessageType, "server");

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn device_message_indices_are_contiguous() {
        for (i, t) in DeviceMessageType::iter().enumerate() {
            assert_eq!(usize::from(t.index()), i);
            assert_eq!(DeviceMessageType::from_index(t.index()), Some(t));
        }
        assert_eq!(DeviceMessageType::iter().count(), 43);
        assert_eq!(DeviceMessageType::from_index(43), None);
    }

    #[test]
    fn fixed_wire_indices() {
        assert_eq!(DeviceMessageType::IsCharging.index(), 0);
        assert_eq!(DeviceMessageType::GetSensorConfiguration.index(), 10);
        assert_eq!(DeviceMessageType::SensorData.index(), 14);
        assert_eq!(DeviceMessageType::TriggerVibration.index(), 15);
        assert_eq!(DeviceMessageType::MaxFileLength.index(), 32);
        assert_eq!(ServerMessageType::DeviceMessage.index(), 12);
        assert_eq!(ConnectionMessageType::Smp.index(), 8);
    }

    #[test]
    fn setters_canonicalize_to_getters() {
        assert_eq!(
            DeviceMessageType::SetSensorConfiguration.canonical(),
            DeviceMessageType::GetSensorConfiguration
        );
        assert_eq!(
            DeviceMessageType::SetCurrentTime.canonical(),
            DeviceMessageType::GetCurrentTime
        );
        assert_eq!(
            DeviceMessageType::TfliteInference.canonical(),
            DeviceMessageType::TfliteInference
        );
    }

    #[test]
    fn names_are_camel_case() {
        assert_eq!(DeviceMessageType::GetTfliteName.to_string(), "getTfliteName");
        assert_eq!(
            "fileTransferStatus".parse::<DeviceMessageType>().unwrap(),
            DeviceMessageType::FileTransferStatus
        );
    }

    #[test]
    fn handshake_set_is_all_getters() {
        for t in REQUIRED_HANDSHAKE {
            assert_eq!(t.canonical(), t, "{t} should be a canonical getter");
        }
    }
}
