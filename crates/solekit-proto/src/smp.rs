// ── SMP (mcumgr) framing ──
//
// `[op][flags][lenHi][lenLo][groupHi][groupLo][seq][id][CBOR body]`.
// Header fields are big-endian. Notifications may split or coalesce frames,
// so inbound bytes go through `Reassembler` first.

use bytes::BytesMut;
use strum::{Display, FromRepr};

use crate::cbor::{self, CborValue};
use crate::error::Error;

pub const HEADER_LEN: usize = 8;

/// SMP MTU assumed until the device reports one.
pub const DEFAULT_MTU: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr)]
#[repr(u8)]
pub enum Op {
    Read = 0,
    ReadRsp = 1,
    Write = 2,
    WriteRsp = 3,
}

impl Op {
    #[allow(clippy::as_conversions)]
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn is_response(self) -> bool {
        matches!(self, Self::ReadRsp | Self::WriteRsp)
    }
}

/// Management group ids.
pub mod group {
    pub const OS: u16 = 0;
    pub const IMAGE: u16 = 1;
    pub const STAT: u16 = 2;
    pub const CONFIG: u16 = 3;
    pub const LOG: u16 = 4;
    pub const CRASH: u16 = 5;
    pub const SPLIT: u16 = 6;
    pub const RUN: u16 = 7;
    pub const FS: u16 = 8;
    pub const SHELL: u16 = 9;
}

/// Command ids within the OS group.
pub mod os {
    pub const ECHO: u8 = 0;
    pub const CONS_ECHO_CTRL: u8 = 1;
    pub const TASKSTAT: u8 = 2;
    pub const MPSTAT: u8 = 3;
    pub const DATETIME_STR: u8 = 4;
    pub const RESET: u8 = 5;
}

/// Command ids within the IMAGE group.
pub mod image {
    pub const STATE: u8 = 0;
    pub const UPLOAD: u8 = 1;
    pub const FILE: u8 = 2;
    pub const CORELIST: u8 = 3;
    pub const CORELOAD: u8 = 4;
    pub const ERASE: u8 = 5;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub op: Op,
    pub flags: u8,
    pub len: u16,
    pub group: u16,
    pub seq: u8,
    pub id: u8,
}

impl Header {
    fn parse(raw: &[u8]) -> Result<Self, Error> {
        if raw.len() < HEADER_LEN {
            return Err(Error::truncated("smp header", HEADER_LEN, raw.len()));
        }
        let op = Op::from_repr(raw[0]).ok_or(Error::InvalidEnum {
            kind: "smp op",
            index: raw[0],
        })?;
        Ok(Self {
            op,
            flags: raw[1],
            len: u16::from_be_bytes([raw[2], raw[3]]),
            group: u16::from_be_bytes([raw[4], raw[5]]),
            seq: raw[6],
            id: raw[7],
        })
    }
}

/// A decoded SMP frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub header: Header,
    pub body: CborValue,
}

impl Frame {
    /// Management return code; absent or zero means success.
    pub fn rc(&self) -> Option<i64> {
        self.body.get("rc").and_then(CborValue::as_i64).filter(|rc| *rc != 0)
    }
}

/// An outgoing request before it is assigned a sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub op: Op,
    pub group: u16,
    pub id: u8,
    pub body: Option<CborValue>,
}

impl Request {
    pub fn image_state() -> Self {
        Self {
            op: Op::Read,
            group: group::IMAGE,
            id: image::STATE,
            body: None,
        }
    }

    /// Mark an image for test boot (`confirm = false`) or confirm it.
    pub fn image_set_state(hash: &[u8], confirm: bool) -> Self {
        Self {
            op: Op::Write,
            group: group::IMAGE,
            id: image::STATE,
            body: Some(CborValue::map([
                ("hash", CborValue::Bytes(hash.to_vec())),
                ("confirm", CborValue::Bool(confirm)),
            ])),
        }
    }

    pub fn image_erase() -> Self {
        Self {
            op: Op::Write,
            group: group::IMAGE,
            id: image::ERASE,
            body: Some(CborValue::Map(Vec::new())),
        }
    }

    pub fn image_upload(body: CborValue) -> Self {
        Self {
            op: Op::Write,
            group: group::IMAGE,
            id: image::UPLOAD,
            body: Some(body),
        }
    }

    pub fn echo(text: &str) -> Self {
        Self {
            op: Op::Write,
            group: group::OS,
            id: os::ECHO,
            body: Some(CborValue::map([("d", CborValue::Text(text.to_owned()))])),
        }
    }

    pub fn reset() -> Self {
        Self {
            op: Op::Write,
            group: group::OS,
            id: os::RESET,
            body: None,
        }
    }

    /// Serialize with the given sequence number.
    pub fn encode(&self, seq: u8) -> Result<Vec<u8>, Error> {
        let body = self.body.as_ref().map(cbor::encode).unwrap_or_default();
        let len = u16::try_from(body.len()).map_err(|_| Error::PayloadTooLarge {
            len: body.len(),
            max: usize::from(u16::MAX),
        })?;
        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.push(self.op.code());
        out.push(0);
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&self.group.to_be_bytes());
        out.push(seq);
        out.push(self.id);
        out.extend_from_slice(&body);
        Ok(out)
    }
}

/// Sequence counter, wrapping mod 256.
#[derive(Debug, Default)]
pub struct Sequence(u8);

impl Sequence {
    pub fn next(&mut self) -> u8 {
        let seq = self.0;
        self.0 = self.0.wrapping_add(1);
        seq
    }

    pub fn reset(&mut self) {
        self.0 = 0;
    }
}

/// Buffers notification bytes until whole frames are available.
#[derive(Debug, Default)]
pub struct Reassembler {
    buffer: BytesMut,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Add received bytes and return every frame they complete.
    ///
    /// A frame whose header or body fails to decode yields an `Err` in its
    /// place; its bytes are still consumed so the stream stays aligned.
    pub fn push(&mut self, data: &[u8]) -> Vec<Result<Frame, Error>> {
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();

        while self.buffer.len() >= HEADER_LEN {
            let body_len = usize::from(u16::from_be_bytes([self.buffer[2], self.buffer[3]]));
            let total = HEADER_LEN + body_len;
            if self.buffer.len() < total {
                break;
            }
            let raw = self.buffer.split_to(total);
            frames.push(Header::parse(&raw).and_then(|header| {
                let body = cbor::decode(&raw[HEADER_LEN..])?;
                Ok(Frame { header, body })
            }));
        }

        frames
    }
}

// ── Image upload chunking ───────────────────────────────────────────

/// Build the upload body for the chunk starting at `offset`.
///
/// Returns the CBOR map and how many image bytes it carries. The first chunk
/// also announces the total length and the SHA-256 of the whole image. The
/// chunk is sized so the complete frame fits in `mtu` bytes, accounting for
/// the data field's byte-string header growing with its length.
pub fn upload_chunk(
    image: &[u8],
    offset: usize,
    sha256: &[u8],
    mtu: usize,
) -> Result<(CborValue, usize), Error> {
    let offset_value = u64::try_from(offset).map_err(|_| Error::Smp("offset overflow".into()))?;
    let mut entries = vec![
        ("data", CborValue::Bytes(Vec::new())),
        ("off", CborValue::Unsigned(offset_value)),
    ];
    if offset == 0 {
        let len = u64::try_from(image.len()).map_err(|_| Error::Smp("image too large".into()))?;
        entries.push(("len", CborValue::Unsigned(len)));
        entries.push(("sha", CborValue::Bytes(sha256.to_vec())));
    }

    let skeleton_len = cbor::encode(&CborValue::map(entries.clone())).len();
    let budget = mtu
        .checked_sub(skeleton_len + HEADER_LEN)
        .ok_or_else(|| Error::Smp(format!("mtu {mtu} too small for an upload frame")))?;

    let remaining = image.len().saturating_sub(offset);
    let mut chunk_len = budget.min(remaining);
    // The empty skeleton already paid for a 1-byte byte-string head.
    while chunk_len > 0 && chunk_len + cbor::head_len(u64::try_from(chunk_len).unwrap_or(u64::MAX)) - 1 > budget {
        chunk_len -= 1;
    }
    if chunk_len == 0 && remaining > 0 {
        return Err(Error::Smp(format!("mtu {mtu} leaves no room for image data")));
    }

    entries[0].1 = CborValue::Bytes(image[offset..offset + chunk_len].to_vec());
    Ok((CborValue::map(entries), chunk_len))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn encodes_header_big_endian() {
        let frame = Request::echo("hi").encode(7).unwrap();
        // {"d": "hi"} = a1 61 64 62 68 69
        assert_eq!(&frame[..8], &[2, 0, 0, 6, 0, 0, 7, 0]);
        assert_eq!(&frame[8..], &[0xA1, 0x61, b'd', 0x62, b'h', b'i']);
    }

    #[test]
    fn bodiless_request_has_zero_length() {
        let frame = Request::image_state().encode(0).unwrap();
        assert_eq!(frame, vec![0, 0, 0, 0, 0, 1, 0, 0]);
    }

    #[test]
    fn sequence_wraps() {
        let mut seq = Sequence::default();
        for expected in 0..=255u8 {
            assert_eq!(seq.next(), expected);
        }
        assert_eq!(seq.next(), 0);
    }

    #[test]
    fn reassembles_split_and_coalesced_frames() {
        let a = Request::echo("one").encode(1).unwrap();
        let b = Request::echo("two").encode(2).unwrap();
        let mut stream = a.clone();
        stream.extend_from_slice(&b);

        let mut r = Reassembler::new();
        assert!(r.push(&stream[..5]).is_empty());
        let frames = r.push(&stream[5..a.len() + 3]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref().unwrap().header.seq, 1);
        let frames = r.push(&stream[a.len() + 3..]);
        assert_eq!(frames.len(), 1);
        let body = &frames[0].as_ref().unwrap().body;
        assert_eq!(body.get("d").and_then(CborValue::as_str), Some("two"));
        assert_eq!(r.buffered(), 0);

        let frames = r.push(&stream);
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn bad_body_does_not_desync_stream() {
        let mut stream = vec![1, 0, 0, 1, 0, 0, 9, 0, 0xFF];
        stream.extend_from_slice(&Request::echo("ok").encode(10).unwrap());
        let frames = Reassembler::new().push(&stream);
        assert_eq!(frames.len(), 2);
        assert!(frames[0].is_err());
        assert_eq!(frames[1].as_ref().unwrap().header.seq, 10);
    }

    #[test]
    fn rc_is_reported_when_nonzero() {
        let frame = Frame {
            header: Header::parse(&[3, 0, 0, 0, 0, 1, 0, 1]).unwrap(),
            body: CborValue::map([("rc", CborValue::Unsigned(3))]),
        };
        assert_eq!(frame.rc(), Some(3));
    }

    #[test]
    fn upload_chunks_fill_the_mtu_exactly() {
        let image: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        let sha = [0x11u8; 32];
        let mtu = 256;

        let (body, first) = upload_chunk(&image, 0, &sha, mtu).unwrap();
        let frame = Request::image_upload(body).encode(0).unwrap();
        assert!(frame.len() <= mtu);
        assert!(frame.len() >= mtu - 1, "frame {} should fill mtu", frame.len());

        let (body, second) = upload_chunk(&image, first, &sha, mtu).unwrap();
        assert!(body.get("sha").is_none());
        assert!(body.get("len").is_none());
        let frame = Request::image_upload(body).encode(1).unwrap();
        assert!(frame.len() <= mtu);
        assert!(second > first);
    }

    #[test]
    fn last_chunk_is_short() {
        let image = vec![0u8; 300];
        let (_, len) = upload_chunk(&image, 290, &[0; 32], 256).unwrap();
        assert_eq!(len, 10);
    }

    #[test]
    fn tiny_mtu_is_rejected() {
        assert!(upload_chunk(&[0u8; 10], 0, &[0; 32], 40).is_err());
    }
}
