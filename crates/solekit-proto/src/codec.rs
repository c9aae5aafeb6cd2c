// ── TLV message framing ──
//
// `[typeIndex u8][length u8 | u16 LE][payload]`, repeated until the buffer
// is exhausted. The device link uses a 1-byte length, the bridge link a
// 2-byte one; both share this implementation.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Error;
use crate::message::MessageKind;

/// Width of the length field in a TLV frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthWidth {
    U8,
    U16,
}

impl LengthWidth {
    /// Largest payload the length field can describe.
    pub const fn max_len(self) -> usize {
        match self {
            Self::U8 => u8::MAX as usize,
            Self::U16 => u16::MAX as usize,
        }
    }

    /// Header size (type byte plus length field).
    pub const fn header_len(self) -> usize {
        match self {
            Self::U8 => 2,
            Self::U16 => 3,
        }
    }
}

/// A single typed message with an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<T> {
    pub kind: T,
    pub payload: Bytes,
}

impl<T: MessageKind> Message<T> {
    pub fn new(kind: T, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// A message with no payload (a plain request).
    pub fn empty(kind: T) -> Self {
        Self {
            kind,
            payload: Bytes::new(),
        }
    }

    /// Encoded size of this message on the wire.
    pub fn encoded_len(&self, width: LengthWidth) -> usize {
        width.header_len() + self.payload.len()
    }
}

/// Append one encoded message to `out`.
pub fn encode_into<T: MessageKind>(
    out: &mut BytesMut,
    message: &Message<T>,
    width: LengthWidth,
) -> Result<(), Error> {
    let len = message.payload.len();
    if len > width.max_len() {
        return Err(Error::PayloadTooLarge {
            len,
            max: width.max_len(),
        });
    }
    out.reserve(message.encoded_len(width));
    out.put_u8(message.kind.index());
    match width {
        LengthWidth::U8 => out.put_u8(u8::try_from(len).map_err(|_| Error::PayloadTooLarge {
            len,
            max: width.max_len(),
        })?),
        LengthWidth::U16 => {
            out.put_u16_le(u16::try_from(len).map_err(|_| Error::PayloadTooLarge {
                len,
                max: width.max_len(),
            })?);
        }
    }
    out.put_slice(&message.payload);
    Ok(())
}

/// Encode a single message.
pub fn encode_message<T: MessageKind>(message: &Message<T>, width: LengthWidth) -> Result<Bytes, Error> {
    let mut out = BytesMut::new();
    encode_into(&mut out, message, width)?;
    Ok(out.freeze())
}

/// Encode a sequence of messages back to back.
pub fn encode<T: MessageKind>(messages: &[Message<T>], width: LengthWidth) -> Result<Bytes, Error> {
    let mut out = BytesMut::new();
    for message in messages {
        encode_into(&mut out, message, width)?;
    }
    Ok(out.freeze())
}

/// Decode every message in `data`.
///
/// Payloads are zero-copy slices of `data`. An unknown type index or a
/// short header/payload aborts the whole decode.
pub fn decode<T: MessageKind>(data: &Bytes, width: LengthWidth) -> Result<Vec<Message<T>>, Error> {
    let mut messages = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        let remaining = data.len() - offset;
        if remaining < width.header_len() {
            return Err(Error::truncated(T::KIND, width.header_len(), remaining));
        }

        let index = data[offset];
        let kind = T::from_index(index).ok_or(Error::UnknownMessageType {
            kind: T::KIND,
            index,
        })?;

        let len = match width {
            LengthWidth::U8 => usize::from(data[offset + 1]),
            LengthWidth::U16 => usize::from(u16::from_le_bytes([data[offset + 1], data[offset + 2]])),
        };

        let start = offset + width.header_len();
        let available = data.len() - start;
        if available < len {
            return Err(Error::truncated(T::KIND, len, available));
        }

        messages.push(Message {
            kind,
            payload: data.slice(start..start + len),
        });
        offset = start + len;
    }

    Ok(messages)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::message::{DeviceMessageType, ServerMessageType};

    #[test]
    fn encodes_header_for_both_widths() {
        let msg = Message::new(DeviceMessageType::GetName, Bytes::from_static(b"ab"));
        let short = encode_message(&msg, LengthWidth::U8).unwrap();
        assert_eq!(&short[..], &[4, 2, b'a', b'b']);

        let msg = Message::new(ServerMessageType::StartScan, Bytes::from_static(b"ab"));
        let long = encode_message(&msg, LengthWidth::U16).unwrap();
        assert_eq!(&long[..], &[4, 2, 0, b'a', b'b']);
    }

    #[test]
    fn rejects_oversized_payload() {
        let msg = Message::new(DeviceMessageType::SetFileTransferBlock, vec![0u8; 256]);
        let err = encode_message(&msg, LengthWidth::U8).unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { len: 256, max: 255 }));
        assert!(encode_message(&msg, LengthWidth::U16).is_ok());
    }

    #[test]
    fn unknown_index_is_error() {
        let data = Bytes::from_static(&[200, 0]);
        let err = decode::<DeviceMessageType>(&data, LengthWidth::U8).unwrap_err();
        assert!(matches!(err, Error::UnknownMessageType { index: 200, .. }));
    }

    #[test]
    fn truncated_payload_is_error() {
        let data = Bytes::from_static(&[0, 5, 1, 2]);
        let err = decode::<DeviceMessageType>(&data, LengthWidth::U8).unwrap_err();
        assert!(matches!(err, Error::Truncated { needed: 5, available: 2, .. }));

        let data = Bytes::from_static(&[0, 1]);
        let err = decode::<ServerMessageType>(&data, LengthWidth::U16).unwrap_err();
        assert!(matches!(err, Error::Truncated { needed: 3, .. }));
    }

    #[test]
    fn empty_buffer_decodes_to_nothing() {
        let out = decode::<DeviceMessageType>(&Bytes::new(), LengthWidth::U8).unwrap();
        assert!(out.is_empty());
    }
}
