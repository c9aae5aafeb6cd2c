//! Chunked file transfer: enums, scalar payloads and inbound block assembly.

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, FromRepr};

use crate::crc32::crc32;
use crate::error::Error;
use crate::reader::ByteReader;

/// Largest block the device link can carry in one message.
pub const MAX_BLOCK_LEN: usize = 255;

/// Per-write overhead subtracted from the MTU: ATT header plus TLV header
/// plus the batch slack.
const BLOCK_OVERHEAD: u16 = 6;

macro_rules! byte_enum {
    ($ty:ident, $kind:literal) => {
        impl $ty {
            #[allow(clippy::as_conversions)]
            pub fn index(self) -> u8 {
                self as u8
            }

            pub fn parse(payload: &[u8]) -> Result<Self, Error> {
                let index = ByteReader::new(payload, $kind).u8()?;
                Self::from_repr(index).ok_or(Error::InvalidEnum { kind: $kind, index })
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, FromRepr)]
#[repr(u8)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum FileType {
    Tflite,
}

impl FileType {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Tflite => "tflite",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString, FromRepr)]
#[repr(u8)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum FileTransferStatus {
    #[default]
    Idle,
    Sending,
    Receiving,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, FromRepr)]
#[repr(u8)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum FileTransferCommand {
    StartSend,
    StartReceive,
    Cancel,
}

byte_enum!(FileType, "file type");
byte_enum!(FileTransferStatus, "file transfer status");
byte_enum!(FileTransferCommand, "file transfer command");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum TransferDirection {
    Sending,
    Receiving,
}

/// `maxFileLength`, `getFileLength` and `getFileChecksum` share this layout.
pub fn parse_u32(payload: &[u8], context: &'static str) -> Result<u32, Error> {
    ByteReader::new(payload, context).u32_le()
}

/// Block size for outbound chunks at the given MTU.
pub fn block_len(mtu: u16) -> usize {
    usize::from(mtu.saturating_sub(BLOCK_OVERHEAD)).min(MAX_BLOCK_LEN)
}

/// `"{YYYY-MM-DD_HH-MM-SS}.{ext}"` in local time.
pub fn received_file_name(file_type: FileType, at: DateTime<Local>) -> String {
    format!("{}.{}", at.format("%Y-%m-%d_%H-%M-%S"), file_type.extension())
}

/// Result of feeding one inbound block.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockOutcome {
    /// More blocks expected; `progress` in 0.0..1.0.
    Progress { progress: f64 },
    /// Length reached and the checksum matched.
    Complete { progress: f64, data: Bytes },
    /// Length reached (or exceeded) but the checksum did not match.
    ChecksumMismatch { expected: u32, actual: u32 },
}

/// Accumulates `getFileTransferBlock` payloads until the negotiated length
/// is reached.
#[derive(Debug, Default)]
pub struct BlockAssembler {
    buffer: BytesMut,
}

impl BlockAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn received(&self) -> usize {
        self.buffer.len()
    }

    pub fn push(&mut self, block: &[u8], expected_len: u32, expected_checksum: u32) -> BlockOutcome {
        self.buffer.extend_from_slice(block);
        let received = self.buffer.len();
        let expected = usize::try_from(expected_len).unwrap_or(usize::MAX);

        #[allow(clippy::as_conversions, clippy::cast_precision_loss)]
        let progress = if expected == 0 {
            1.0
        } else {
            received as f64 / expected as f64
        };

        if received < expected {
            return BlockOutcome::Progress { progress };
        }

        let data = self.buffer.split().freeze();
        let actual = crc32(&data);
        if received != expected || actual != expected_checksum {
            tracing::error!(expected = expected_checksum, actual, received, "wrong file checksum");
            return BlockOutcome::ChecksumMismatch {
                expected: expected_checksum,
                actual,
            };
        }
        BlockOutcome::Complete { progress, data }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn enum_indices_follow_wire_order() {
        assert_eq!(FileTransferCommand::StartSend.index(), 0);
        assert_eq!(FileTransferCommand::StartReceive.index(), 1);
        assert_eq!(FileTransferCommand::Cancel.index(), 2);
        assert_eq!(FileTransferStatus::parse(&[2]).unwrap(), FileTransferStatus::Receiving);
        assert!(matches!(
            FileTransferStatus::parse(&[3]),
            Err(Error::InvalidEnum { index: 3, .. })
        ));
        assert!(FileType::parse(&[]).is_err());
    }

    #[test]
    fn block_len_is_clamped() {
        assert_eq!(block_len(23), 17);
        assert_eq!(block_len(247), 241);
        assert_eq!(block_len(512), 255);
        assert_eq!(block_len(3), 0);
    }

    #[test]
    fn file_name_uses_timestamp_and_extension() {
        let at = Local.with_ymd_and_hms(2024, 3, 7, 9, 5, 1).unwrap();
        assert_eq!(received_file_name(FileType::Tflite, at), "2024-03-07_09-05-01.tflite");
    }

    #[test]
    fn assembles_and_verifies_blocks() {
        let file: Vec<u8> = (0..40u8).collect();
        let checksum = crc32(&file);
        let mut assembler = BlockAssembler::new();

        let first = assembler.push(&file[..25], 40, checksum);
        assert!(matches!(first, BlockOutcome::Progress { progress } if (progress - 0.625).abs() < 1e-9));

        match assembler.push(&file[25..], 40, checksum) {
            BlockOutcome::Complete { data, progress } => {
                assert_eq!(&data[..], &file[..]);
                assert!((progress - 1.0).abs() < f64::EPSILON);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(assembler.received(), 0);
    }

    #[test]
    fn wrong_checksum_is_reported_and_buffer_dropped() {
        let mut assembler = BlockAssembler::new();
        let outcome = assembler.push(b"abcde", 5, 0xDEAD_BEEF);
        assert_eq!(
            outcome,
            BlockOutcome::ChecksumMismatch {
                expected: 0xDEAD_BEEF,
                actual: 0x8587_D865
            }
        );
        assert_eq!(assembler.received(), 0);
    }
}
