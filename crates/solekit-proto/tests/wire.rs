#![allow(clippy::unwrap_used)]

use bytes::Bytes;
use pretty_assertions::assert_eq;

use solekit_proto::cbor::{self, CborValue};
use solekit_proto::codec::{self, LengthWidth, Message};
use solekit_proto::crc32::crc32;
use solekit_proto::sensor::data::reconstruct_timestamp;
use solekit_proto::sensor::{SensorConfiguration, SensorDataDecoder, SensorType, SensorValue};
use solekit_proto::smp::{self, Reassembler, Request, Sequence};
use solekit_proto::{ConnectionMessageType, DeviceMessageType, ServerMessageType};

#[test]
fn device_messages_round_trip_with_short_length() {
    let messages = vec![
        Message::new(DeviceMessageType::GetName, Bytes::from_static(b"Left Sole")),
        Message::empty(DeviceMessageType::GetMtu),
        Message::new(DeviceMessageType::SetFileTransferBlock, vec![0xAB; 255]),
    ];
    let encoded = codec::encode(&messages, LengthWidth::U8).unwrap();
    assert_eq!(encoded.len(), 2 + 9 + 2 + 2 + 255);
    assert_eq!(codec::decode::<DeviceMessageType>(&encoded, LengthWidth::U8).unwrap(), messages);
}

#[test]
fn bridge_messages_round_trip_with_long_length() {
    let messages = vec![
        Message::new(ServerMessageType::DeviceMessage, vec![7u8; 1000]),
        Message::empty(ServerMessageType::Pong),
    ];
    let encoded = codec::encode(&messages, LengthWidth::U16).unwrap();
    assert_eq!(&encoded[..3], &[12, 0xE8, 0x03]);
    assert_eq!(codec::decode::<ServerMessageType>(&encoded, LengthWidth::U16).unwrap(), messages);

    let inner = vec![Message::new(ConnectionMessageType::Rx, vec![1, 2, 3])];
    let encoded = codec::encode(&inner, LengthWidth::U16).unwrap();
    assert_eq!(codec::decode::<ConnectionMessageType>(&encoded, LengthWidth::U16).unwrap(), inner);
}

#[test]
fn crc32_reference_vectors() {
    assert_eq!(crc32(b""), 0);
    assert_eq!(crc32(b"123456789"), 0xCBF4_3926);

    let mut data = b"123456789".to_vec();
    data[4] ^= 0x10;
    assert_ne!(crc32(&data), 0xCBF4_3926);
}

#[test]
fn timestamp_reconstruction() {
    let now = 1_700_000_123_456u64;
    let low = u16::try_from(now % 65_536).unwrap();
    assert_eq!(reconstruct_timestamp(now, low), now);

    // low bits ahead of the clock land in the same 65536 ms window
    let window = now - now % 65_536;
    assert_eq!(reconstruct_timestamp(now, u16::MAX), window + 65_535);
    assert_eq!(reconstruct_timestamp(now, 0), window);
}

#[test]
fn smp_frames_reassemble_across_notifications() {
    let mut seq = Sequence::default();
    let first = Request::echo("hello").encode(seq.next()).unwrap();
    let second = Request::image_state().encode(seq.next()).unwrap();
    assert_eq!(first[6], 0);
    assert_eq!(second[6], 1);

    // Pretend the device echoes requests back as responses.
    let mut stream = first.clone();
    stream[0] = smp::Op::WriteRsp.code();
    stream.extend_from_slice(&second);

    let mut reassembler = Reassembler::new();
    let (head, tail) = stream.split_at(5);
    assert!(reassembler.push(head).is_empty());
    let frames: Vec<_> = reassembler.push(tail).into_iter().map(Result::unwrap).collect();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].header.op, smp::Op::WriteRsp);
    assert_eq!(frames[0].body.get("d").and_then(CborValue::as_str), Some("hello"));
    assert_eq!(frames[1].header.seq, 1);
    assert_eq!(reassembler.buffered(), 0);
}

#[test]
fn upload_chunks_fit_the_mtu() {
    let image: Vec<u8> = (0..2000u32).map(|i| u8::try_from(i % 251).unwrap()).collect();
    let sha = [0x5Au8; 32];
    let mut offset = 0;
    let mut seq = Sequence::default();
    while offset < image.len() {
        let (body, len) = smp::upload_chunk(&image, offset, &sha, smp::DEFAULT_MTU).unwrap();
        let frame = Request::image_upload(body).encode(seq.next()).unwrap();
        assert!(frame.len() <= smp::DEFAULT_MTU, "frame at {offset} is {} bytes", frame.len());
        let decoded = cbor::decode(&frame[smp::HEADER_LEN..]).unwrap();
        assert_eq!(decoded.get("data").and_then(CborValue::as_bytes).unwrap(), &image[offset..offset + len]);
        assert_eq!(decoded.get("len").is_some(), offset == 0);
        offset += len;
    }
}

#[test]
fn sensor_configuration_round_trip() {
    let config = SensorConfiguration::new()
        .with(SensorType::Pressure, 20)
        .with(SensorType::Gyroscope, 0);
    let encoded = config.encode();
    assert_eq!(encoded, vec![3, 0, 0, 12, 20, 0]);
    assert_eq!(SensorConfiguration::parse(&encoded).unwrap(), config);
}

#[test]
fn sensor_data_with_scalars() {
    let mut decoder = SensorDataDecoder::new();
    let mut scalars = vec![0u8];
    scalars.extend_from_slice(&0.5f32.to_le_bytes());
    decoder.parse_scalars(&scalars).unwrap();

    // timestamp 0x0010, then acceleration (type 0) with x=2, y=-4, z=6
    let mut payload = vec![0x10, 0x00, 0, 6];
    for v in [2i16, -4, 6] {
        payload.extend_from_slice(&v.to_le_bytes());
    }
    let readings = decoder.parse_data(&Bytes::from(payload), 0x3_0000).unwrap();
    assert_eq!(readings.len(), 1);
    assert_eq!(readings[0].timestamp, 0x3_0010);
    match &readings[0].value {
        SensorValue::Vector3(v) => {
            assert!((v.x - 1.0).abs() < 1e-9);
            assert!((v.y + 2.0).abs() < 1e-9);
            assert!((v.z - 3.0).abs() < 1e-9);
        }
        other => panic!("unexpected {other:?}"),
    }
}
