// ── Bridge envelopes ──
//
// Server-bridge messages use the 2-byte-length TLV over `ServerMessageType`.
// Strings are u8-length-prefixed UTF-8; device traffic is wrapped as
// `[idLen][id][TLV<ConnectionMessageType, u16 length>]`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec::{self, LengthWidth, Message};
use crate::error::Error;
use crate::information::DeviceType;
use crate::message::{ConnectionMessageType, ServerMessageType};
use crate::reader::{self, ByteReader};

pub type ServerMessage = Message<ServerMessageType>;
pub type ConnectionMessage = Message<ConnectionMessageType>;

/// A device advertised by the bridge's scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredDevice {
    pub bluetooth_id: String,
    pub name: String,
    pub device_type: DeviceType,
    pub rssi: i16,
}

// ── Outbound ────────────────────────────────────────────────────────

fn short_string_message(kind: ServerMessageType, value: &str) -> Result<ServerMessage, Error> {
    let mut payload = Vec::with_capacity(value.len() + 1);
    reader::write_short_string(&mut payload, value)?;
    Ok(Message::new(kind, payload))
}

pub fn connect_to_device(bluetooth_id: &str) -> Result<ServerMessage, Error> {
    short_string_message(ServerMessageType::ConnectToDevice, bluetooth_id)
}

pub fn disconnect_from_device(bluetooth_id: &str) -> Result<ServerMessage, Error> {
    short_string_message(ServerMessageType::DisconnectFromDevice, bluetooth_id)
}

/// Wrap connection-level messages for one remote device.
pub fn device_message(bluetooth_id: &str, messages: &[ConnectionMessage]) -> Result<ServerMessage, Error> {
    let inner = codec::encode(messages, LengthWidth::U16)?;
    let mut payload = Vec::with_capacity(1 + bluetooth_id.len() + inner.len());
    reader::write_short_string(&mut payload, bluetooth_id)?;
    payload.extend_from_slice(&inner);
    Ok(Message::new(ServerMessageType::DeviceMessage, payload))
}

/// Messages sent right after the bridge socket opens.
pub fn session_requests() -> [ServerMessage; 3] {
    [
        Message::empty(ServerMessageType::IsScanningAvailable),
        Message::empty(ServerMessageType::DiscoveredDevices),
        Message::empty(ServerMessageType::ConnectedDevices),
    ]
}

// ── Inbound ─────────────────────────────────────────────────────────

pub fn parse_flag(payload: &[u8], context: &'static str) -> Result<bool, Error> {
    ByteReader::new(payload, context).bool()
}

pub fn parse_discovered_device(payload: &[u8]) -> Result<DiscoveredDevice, Error> {
    let mut r = ByteReader::new(payload, "discoveredDevice");
    let json = reader::read_short_string(&mut r, "discoveredDevice")?;
    Ok(serde_json::from_str(&json)?)
}

pub fn parse_expired_device(payload: &[u8]) -> Result<String, Error> {
    let mut r = ByteReader::new(payload, "expiredDiscoveredDevice");
    reader::read_short_string(&mut r, "expiredDiscoveredDevice")
}

/// An empty payload means no devices.
pub fn parse_connected_devices(payload: &[u8]) -> Result<Vec<String>, Error> {
    if payload.is_empty() {
        return Ok(Vec::new());
    }
    let mut r = ByteReader::new(payload, "connectedDevices");
    let json = reader::read_short_string(&mut r, "connectedDevices")?;
    Ok(serde_json::from_str(&json)?)
}

/// Split a `deviceMessage` into the target id and its inner messages.
pub fn parse_device_message(payload: &Bytes) -> Result<(String, Vec<ConnectionMessage>), Error> {
    let mut r = ByteReader::new(payload, "deviceMessage");
    let bluetooth_id = reader::read_short_string(&mut r, "deviceMessage")?;
    let inner = reader::slice_of(payload, r.rest());
    let messages = codec::decode(&inner, LengthWidth::U16)?;
    Ok((bluetooth_id, messages))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn device_message_round_trip() {
        let inner = [
            Message::new(ConnectionMessageType::Tx, Bytes::from_static(&[4, 0])),
            Message::empty(ConnectionMessageType::BatteryLevel),
        ];
        let outer = device_message("abc", &inner).unwrap();
        assert_eq!(outer.kind, ServerMessageType::DeviceMessage);
        assert_eq!(
            &outer.payload[..],
            &[3, b'a', b'b', b'c', 10, 2, 0, 4, 0, 7, 0, 0]
        );

        let (id, decoded) = parse_device_message(&outer.payload).unwrap();
        assert_eq!(id, "abc");
        assert_eq!(decoded, inner.to_vec());
    }

    #[test]
    fn discovered_device_json() {
        let json = r#"{"bluetoothId":"id-1","name":"Left","deviceType":"leftInsole","rssi":-60}"#;
        let mut payload = Vec::new();
        reader::write_short_string(&mut payload, json).unwrap();
        let device = parse_discovered_device(&payload).unwrap();
        assert_eq!(
            device,
            DiscoveredDevice {
                bluetooth_id: "id-1".into(),
                name: "Left".into(),
                device_type: DeviceType::LeftInsole,
                rssi: -60,
            }
        );
    }

    #[test]
    fn connected_devices_may_be_empty() {
        assert!(parse_connected_devices(&[]).unwrap().is_empty());
        let mut payload = Vec::new();
        reader::write_short_string(&mut payload, r#"["a","b"]"#).unwrap();
        assert_eq!(parse_connected_devices(&payload).unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn connect_request_carries_short_string() {
        let message = connect_to_device("xy").unwrap();
        assert_eq!(message.kind, ServerMessageType::ConnectToDevice);
        assert_eq!(&message.payload[..], &[2, b'x', b'y']);
        assert!(connect_to_device(&"z".repeat(256)).is_err());
    }

    #[test]
    fn malformed_json_is_error() {
        let mut payload = Vec::new();
        reader::write_short_string(&mut payload, "{").unwrap();
        assert!(matches!(parse_discovered_device(&payload), Err(Error::Json(_))));
    }
}
