//! Chunked file transfer in both directions, checked end to end by CRC32.

use std::sync::Mutex as StdMutex;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use solekit_proto::crc32::crc32;
use solekit_proto::file_transfer::{
    self, BlockAssembler, BlockOutcome, FileTransferCommand, FileTransferStatus, FileType, TransferDirection,
};
use solekit_proto::{DeviceMessageType, Error};

use super::emit;
use crate::connection::DeviceMessage;
use crate::error::CoreError;
use crate::event::DeviceEvent;
use crate::lock;
use crate::pending::Requester;

/// Smallest BLE MTU; assumed until the device reports its own.
const FALLBACK_MTU: u16 = 23;

/// Last-known transfer parameters as reported by the device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTransferState {
    pub max_file_length: u32,
    pub file_type: Option<FileType>,
    pub file_length: u32,
    pub file_checksum: u32,
    pub status: FileTransferStatus,
}

#[derive(Default)]
struct Inner {
    state: FileTransferState,
    assembler: BlockAssembler,
    mtu: Option<u16>,
}

pub struct FileTransferManager {
    requester: Requester,
    events: broadcast::Sender<DeviceEvent>,
    inner: StdMutex<Inner>,
}

fn progress_ratio(done: usize, total: usize) -> f64 {
    if total == 0 {
        return 1.0;
    }
    #[allow(clippy::as_conversions, clippy::cast_precision_loss)]
    let ratio = done as f64 / total as f64;
    ratio
}

impl FileTransferManager {
    pub(crate) fn new(requester: Requester, events: broadcast::Sender<DeviceEvent>) -> Self {
        Self {
            requester,
            events,
            inner: StdMutex::new(Inner::default()),
        }
    }

    pub fn state(&self) -> FileTransferState {
        lock(&self.inner).state.clone()
    }

    pub fn status(&self) -> FileTransferStatus {
        lock(&self.inner).state.status
    }

    pub(crate) fn set_mtu(&self, mtu: u16) {
        lock(&self.inner).mtu = Some(mtu);
    }

    pub(crate) fn clear(&self) {
        *lock(&self.inner) = Inner::default();
    }

    fn update_status(&self, status: FileTransferStatus) {
        {
            let mut inner = lock(&self.inner);
            if status == FileTransferStatus::Receiving && inner.state.status != FileTransferStatus::Receiving {
                inner.assembler.clear();
            }
            inner.state.status = status;
        }
        debug!(%status, "file transfer status");
        emit(&self.events, DeviceEvent::FileTransferStatus(status));
    }

    pub(crate) fn handle(&self, message: &DeviceMessage) -> Result<(), Error> {
        use DeviceMessageType as T;

        let payload = &message.payload[..];
        let event = match message.kind {
            T::MaxFileLength => {
                let max = file_transfer::parse_u32(payload, "maxFileLength")?;
                lock(&self.inner).state.max_file_length = max;
                DeviceEvent::MaxFileLength(max)
            }
            T::GetFileTransferType | T::SetFileTransferType => {
                let file_type = FileType::parse(payload)?;
                lock(&self.inner).state.file_type = Some(file_type);
                DeviceEvent::FileTransferType(file_type)
            }
            T::GetFileLength | T::SetFileLength => {
                let length = file_transfer::parse_u32(payload, "fileLength")?;
                lock(&self.inner).state.file_length = length;
                DeviceEvent::FileLength(length)
            }
            T::GetFileChecksum | T::SetFileChecksum => {
                let checksum = file_transfer::parse_u32(payload, "fileChecksum")?;
                lock(&self.inner).state.file_checksum = checksum;
                DeviceEvent::FileChecksum(checksum)
            }
            T::FileTransferStatus => {
                self.update_status(FileTransferStatus::parse(payload)?);
                return Ok(());
            }
            T::GetFileTransferBlock => {
                self.handle_block(payload);
                return Ok(());
            }
            other => {
                debug!(%other, "ignoring file transfer message");
                return Ok(());
            }
        };
        emit(&self.events, event);
        Ok(())
    }

    fn handle_block(&self, block: &[u8]) {
        let (outcome, file_type) = {
            let mut inner = lock(&self.inner);
            if inner.state.status != FileTransferStatus::Receiving {
                warn!(status = %inner.state.status, len = block.len(), "ignoring file block outside a receive");
                return;
            }
            let (length, checksum) = (inner.state.file_length, inner.state.file_checksum);
            let outcome = inner.assembler.push(block, length, checksum);
            (outcome, inner.state.file_type)
        };

        match outcome {
            BlockOutcome::Progress { progress } => {
                emit(
                    &self.events,
                    DeviceEvent::FileTransferProgress {
                        direction: TransferDirection::Receiving,
                        progress,
                    },
                );
            }
            BlockOutcome::ChecksumMismatch { expected, actual } => {
                emit(&self.events, DeviceEvent::FileTransferError { expected, actual });
                self.update_status(FileTransferStatus::Idle);
            }
            BlockOutcome::Complete { progress, data } => {
                emit(
                    &self.events,
                    DeviceEvent::FileTransferProgress {
                        direction: TransferDirection::Receiving,
                        progress,
                    },
                );
                emit(
                    &self.events,
                    DeviceEvent::FileTransferComplete {
                        direction: TransferDirection::Receiving,
                    },
                );
                let file_type = file_type.unwrap_or(FileType::Tflite);
                let file_name = file_transfer::received_file_name(file_type, chrono::Local::now());
                info!(%file_name, size = data.len(), "file received");
                emit(
                    &self.events,
                    DeviceEvent::FileReceived {
                        file_name,
                        file_type,
                        size: data.len(),
                        data,
                    },
                );
            }
        }
    }

    // ── Operations ───────────────────────────────────────────────────

    /// Upload `data` to the device.
    ///
    /// Returns once the last block has been written, or early if the device
    /// leaves the `sending` state.
    pub async fn send(&self, file_type: FileType, data: Bytes) -> Result<(), CoreError> {
        self.requester.ensure_ready()?;

        let state = self.state();
        if state.status != FileTransferStatus::Idle {
            return Err(CoreError::invalid_state(format!("file transfer is {}", state.status)));
        }
        let length = u32::try_from(data.len()).map_err(|_| CoreError::validation("file too large"))?;
        if length > state.max_file_length {
            return Err(CoreError::validation(format!(
                "file length {length} exceeds device maximum {}",
                state.max_file_length
            )));
        }
        let checksum = crc32(&data);

        let mut requests = Vec::with_capacity(4);
        if state.file_type == Some(file_type) {
            debug!(%file_type, "redundant file type");
        } else {
            requests.push((
                DeviceMessage::new(DeviceMessageType::SetFileTransferType, vec![file_type.index()]),
                DeviceMessageType::GetFileTransferType,
            ));
        }
        if state.file_length == length {
            debug!(length, "redundant file length");
        } else {
            requests.push((
                DeviceMessage::new(DeviceMessageType::SetFileLength, length.to_le_bytes().to_vec()),
                DeviceMessageType::GetFileLength,
            ));
        }
        if state.file_checksum == checksum {
            debug!(checksum, "redundant file checksum");
        } else {
            requests.push((
                DeviceMessage::new(DeviceMessageType::SetFileChecksum, checksum.to_le_bytes().to_vec()),
                DeviceMessageType::GetFileChecksum,
            ));
        }
        requests.push((command(FileTransferCommand::StartSend), DeviceMessageType::FileTransferStatus));

        info!(%file_type, length, checksum, "starting file send");
        self.requester.request_batch(requests).await?;
        self.stream_blocks(&data).await
    }

    async fn stream_blocks(&self, data: &Bytes) -> Result<(), CoreError> {
        let mut offset = 0;
        loop {
            let (status, mtu) = {
                let inner = lock(&self.inner);
                (inner.state.status, inner.mtu)
            };
            if status != FileTransferStatus::Sending {
                warn!(%status, offset, "file send stopped by device");
                return Ok(());
            }

            emit(
                &self.events,
                DeviceEvent::FileTransferProgress {
                    direction: TransferDirection::Sending,
                    progress: progress_ratio(offset, data.len()),
                },
            );

            if offset == data.len() {
                info!(len = data.len(), "file sent");
                emit(
                    &self.events,
                    DeviceEvent::FileTransferComplete {
                        direction: TransferDirection::Sending,
                    },
                );
                return Ok(());
            }

            let end = (offset + file_transfer::block_len(mtu.unwrap_or(FALLBACK_MTU))).min(data.len());
            let block = DeviceMessage::new(DeviceMessageType::SetFileTransferBlock, data.slice(offset..end));
            self.requester.send(vec![block], true).await?;
            offset = end;
        }
    }

    /// Ask the device to stream a file of `file_type` back.
    pub async fn receive(&self, file_type: FileType) -> Result<(), CoreError> {
        self.requester.ensure_ready()?;

        let state = self.state();
        if state.status != FileTransferStatus::Idle {
            return Err(CoreError::invalid_state(format!("file transfer is {}", state.status)));
        }

        if state.file_type != Some(file_type) {
            let message = DeviceMessage::new(DeviceMessageType::SetFileTransferType, vec![file_type.index()]);
            self.requester
                .request(message, DeviceMessageType::GetFileTransferType)
                .await?;
        }

        info!(%file_type, "starting file receive");
        self.requester
            .request(command(FileTransferCommand::StartReceive), DeviceMessageType::FileTransferStatus)
            .await?;
        Ok(())
    }

    pub async fn cancel(&self) -> Result<(), CoreError> {
        self.requester.ensure_ready()?;
        if self.status() == FileTransferStatus::Idle {
            return Err(CoreError::invalid_state("no file transfer in progress"));
        }

        info!("cancelling file transfer");
        self.requester
            .request(command(FileTransferCommand::Cancel), DeviceMessageType::FileTransferStatus)
            .await?;
        Ok(())
    }
}

fn command(command: FileTransferCommand) -> DeviceMessage {
    DeviceMessage::new(DeviceMessageType::SetFileTransferCommand, vec![command.index()])
}
