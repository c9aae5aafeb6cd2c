// ── Firmware update over SMP ──
//
// mcumgr image management: image state, chunked upload, test/confirm,
// erase, echo and reset. Requests are matched to responses by SMP sequence
// number; with strict matching off, an unmatched response falls back to the
// oldest outstanding request for the same group and command.

use std::sync::Mutex as StdMutex;

use bytes::Bytes;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use solekit_proto::cbor::CborValue;
use solekit_proto::image::{self, FirmwareImage, FirmwareStatus, ImageInfo};
use solekit_proto::smp::{self, Frame, Reassembler, Request, Sequence};
use solekit_proto::Error;

use super::emit;
use crate::config::FirmwareConfig;
use crate::error::CoreError;
use crate::event::DeviceEvent;
use crate::lock;
use crate::pending::Requester;

struct SmpWaiter {
    seq: u8,
    group: u16,
    id: u8,
    tx: oneshot::Sender<Result<Frame, CoreError>>,
}

struct FirmwareInner {
    sequence: Sequence,
    reassembler: Reassembler,
    /// Outstanding requests, oldest first.
    waiters: Vec<SmpWaiter>,
    images: Option<Vec<FirmwareImage>>,
    status: FirmwareStatus,
    mtu: usize,
}

pub struct FirmwareManager {
    requester: Requester,
    events: broadcast::Sender<DeviceEvent>,
    config: FirmwareConfig,
    inner: StdMutex<FirmwareInner>,
}

impl FirmwareManager {
    pub(crate) fn new(requester: Requester, events: broadcast::Sender<DeviceEvent>, config: FirmwareConfig) -> Self {
        let inner = FirmwareInner {
            sequence: Sequence::default(),
            reassembler: Reassembler::new(),
            waiters: Vec::new(),
            images: None,
            status: FirmwareStatus::Idle,
            mtu: config.smp_mtu,
        };
        Self {
            requester,
            events,
            config,
            inner: StdMutex::new(inner),
        }
    }

    pub fn status(&self) -> FirmwareStatus {
        lock(&self.inner).status
    }

    /// Image slots from the last state read, if any.
    pub fn images(&self) -> Option<Vec<FirmwareImage>> {
        lock(&self.inner).images.clone()
    }

    pub(crate) fn set_mtu(&self, mtu: u16) {
        lock(&self.inner).mtu = usize::from(mtu);
    }

    /// Forget everything tied to the link and fail outstanding requests.
    pub(crate) fn clear(&self) {
        let waiters = {
            let mut inner = lock(&self.inner);
            inner.reassembler.clear();
            inner.sequence.reset();
            inner.images = None;
            inner.status = FirmwareStatus::Idle;
            inner.mtu = self.config.smp_mtu;
            std::mem::take(&mut inner.waiters)
        };
        for waiter in waiters {
            let _ = waiter.tx.send(Err(CoreError::Disconnected));
        }
    }

    fn update_status(&self, status: FirmwareStatus) {
        {
            let mut inner = lock(&self.inner);
            if inner.status == status {
                debug!(%status, "redundant firmware status");
                return;
            }
            inner.status = status;
        }
        info!(%status, "firmware status");
        emit(&self.events, DeviceEvent::FirmwareStatus(status));
    }

    // ── Inbound ──────────────────────────────────────────────────────

    /// Feed SMP notification bytes. Returns the frames that failed to decode.
    pub(crate) fn handle_smp(&self, data: &[u8]) -> Vec<Error> {
        let frames = lock(&self.inner).reassembler.push(data);
        let mut errors = Vec::new();
        for frame in frames {
            match frame.and_then(|frame| self.handle_frame(frame)) {
                Ok(()) => {}
                Err(e) => errors.push(e),
            }
        }
        errors
    }

    fn handle_frame(&self, frame: Frame) -> Result<(), Error> {
        let header = frame.header;
        debug!(group = header.group, id = header.id, seq = header.seq, "smp frame");
        if !header.op.is_response() {
            debug!(op = ?header.op, "ignoring smp request frame");
            return Ok(());
        }

        match (header.group, header.id) {
            (smp::group::IMAGE, smp::image::STATE) => self.apply_image_state(&frame.body)?,
            (smp::group::OS, smp::os::ECHO) => {
                debug!(reply = frame.body.get("r").and_then(CborValue::as_str), "smp echo");
            }
            _ => {}
        }

        let waiter = {
            let mut inner = lock(&self.inner);
            let mut position = inner.waiters.iter().position(|w| w.seq == header.seq);
            if position.is_none() && !self.config.smp_strict_sequence {
                position = inner
                    .waiters
                    .iter()
                    .position(|w| w.group == header.group && w.id == header.id);
            }
            position.map(|index| inner.waiters.remove(index))
        };

        match waiter {
            Some(waiter) => {
                if waiter.group != header.group || waiter.id != header.id {
                    warn!(
                        seq = header.seq,
                        expected_group = waiter.group,
                        group = header.group,
                        "smp response for a different command"
                    );
                }
                let _ = waiter.tx.send(Ok(frame));
            }
            None => warn!(seq = header.seq, group = header.group, id = header.id, "unmatched smp response dropped"),
        }
        Ok(())
    }

    fn apply_image_state(&self, body: &CborValue) -> Result<(), Error> {
        let Some(mut images) = image::parse_image_state(body)? else {
            debug!("image state without images");
            return Ok(());
        };
        let status = image::reconcile_images(&mut images);
        lock(&self.inner).images = Some(images.clone());
        self.update_status(status);
        emit(&self.events, DeviceEvent::FirmwareImages(images));
        Ok(())
    }

    // ── Requests ─────────────────────────────────────────────────────

    async fn request(&self, request: Request) -> Result<Frame, CoreError> {
        let (frame, seq, rx) = {
            let mut inner = lock(&self.inner);
            let seq = inner.sequence.next();
            let frame = request.encode(seq)?;
            let (tx, rx) = oneshot::channel();
            inner.waiters.push(SmpWaiter {
                seq,
                group: request.group,
                id: request.id,
                tx,
            });
            (frame, seq, rx)
        };

        debug!(group = request.group, id = request.id, seq, len = frame.len(), "sending smp request");
        if let Err(e) = self.requester.send_smp(Bytes::from(frame)).await {
            lock(&self.inner).waiters.retain(|w| w.seq != seq);
            return Err(e);
        }

        let frame = rx.await.unwrap_or(Err(CoreError::Disconnected))?;
        if let Some(rc) = frame.rc() {
            return Err(CoreError::SmpRejected {
                group: frame.header.group,
                id: frame.header.id,
                rc,
            });
        }
        Ok(frame)
    }

    fn slot(&self, index: usize) -> Result<Option<FirmwareImage>, CoreError> {
        let inner = lock(&self.inner);
        let images = inner
            .images
            .as_ref()
            .ok_or_else(|| CoreError::invalid_state("image state unknown; read it first"))?;
        Ok(images.get(index).cloned())
    }

    // ── Operations ───────────────────────────────────────────────────

    /// Read the image slots.
    pub async fn get_state(&self) -> Result<Vec<FirmwareImage>, CoreError> {
        info!("reading firmware image state");
        self.request(Request::image_state()).await?;
        Ok(self.images().unwrap_or_default())
    }

    /// Upload an mcuboot image into slot 1.
    pub async fn upload(&self, firmware: Bytes) -> Result<(), CoreError> {
        if self.status() == FirmwareStatus::Uploading {
            return Err(CoreError::AlreadyInProgress);
        }
        let info = ImageInfo::parse(&firmware)?;
        info!(version = %info.version, size = info.image_size, hash = %info.hash_hex(), "uploading firmware");

        self.get_state().await?;

        let sha = image::upload_sha256(&firmware);
        self.update_status(FirmwareStatus::Uploading);
        if let Err(e) = self.stream_upload(&firmware, &sha).await {
            warn!(error = %e, "firmware upload failed");
            self.update_status(FirmwareStatus::Idle);
            return Err(e);
        }

        self.get_state().await?;
        emit(&self.events, DeviceEvent::FirmwareUploadProgress(1.0));
        emit(&self.events, DeviceEvent::FirmwareUploadComplete);
        info!("firmware upload complete");
        Ok(())
    }

    async fn stream_upload(&self, firmware: &[u8], sha: &[u8]) -> Result<(), CoreError> {
        let mut offset = 0;
        while offset < firmware.len() {
            let mtu = lock(&self.inner).mtu;
            let (body, chunk_len) = smp::upload_chunk(firmware, offset, sha, mtu)?;
            debug!(offset, chunk_len, "uploading chunk");

            let response = self.request(Request::image_upload(body)).await?;
            let off = response
                .body
                .get("off")
                .and_then(CborValue::as_u64)
                .ok_or_else(|| Error::Smp("upload response without offset".into()))?;
            offset = usize::try_from(off).map_err(|_| Error::Smp(format!("offset {off} out of range")))?;

            #[allow(clippy::as_conversions, clippy::cast_precision_loss)]
            let progress = (offset as f64 / firmware.len() as f64).min(1.0);
            emit(&self.events, DeviceEvent::FirmwareUploadProgress(progress));
        }
        Ok(())
    }

    /// Mark slot 1 for a test boot.
    pub async fn test_image(&self) -> Result<(), CoreError> {
        let Some(slot) = self.slot(1)? else {
            info!("no image in slot 1");
            return Ok(());
        };
        if slot.pending {
            info!("slot 1 is already pending");
            return Ok(());
        }
        if slot.empty {
            info!("slot 1 is empty");
            return Ok(());
        }
        let hash = slot
            .hash
            .ok_or_else(|| CoreError::invalid_state("slot 1 has no hash"))?;

        info!("testing firmware image");
        self.request(Request::image_set_state(&hash, false)).await?;
        Ok(())
    }

    /// Make the running image in slot 0 permanent.
    pub async fn confirm_image(&self) -> Result<(), CoreError> {
        let Some(slot) = self.slot(0)? else {
            info!("no image in slot 0");
            return Ok(());
        };
        if slot.confirmed {
            info!("slot 0 is already confirmed");
            return Ok(());
        }
        let hash = slot
            .hash
            .ok_or_else(|| CoreError::invalid_state("slot 0 has no hash"))?;

        info!("confirming firmware image");
        self.request(Request::image_set_state(&hash, true)).await?;
        Ok(())
    }

    pub async fn erase_image(&self) -> Result<(), CoreError> {
        self.slot(0)?;
        info!("erasing firmware image");
        self.update_status(FirmwareStatus::Erasing);
        if let Err(e) = self.request(Request::image_erase()).await {
            self.update_status(FirmwareStatus::Idle);
            return Err(e);
        }
        self.get_state().await?;
        Ok(())
    }

    /// Round-trip `text` through the device. Returns the reply.
    pub async fn echo(&self, text: &str) -> Result<String, CoreError> {
        let response = self.request(Request::echo(text)).await?;
        Ok(response
            .body
            .get("r")
            .and_then(CborValue::as_str)
            .unwrap_or_default()
            .to_owned())
    }

    pub async fn reset(&self) -> Result<(), CoreError> {
        info!("resetting device");
        self.request(Request::reset()).await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use solekit_proto::smp::Op;

    use super::*;
    use crate::pending::tests::{RecordingSender, requester};

    fn manager(strict: bool) -> (Arc<FirmwareManager>, Arc<RecordingSender>) {
        let sender = Arc::new(RecordingSender::default());
        let (requester, _pending, _ready) = requester(Arc::clone(&sender));
        let (events, _rx) = broadcast::channel(64);
        let config = FirmwareConfig {
            smp_strict_sequence: strict,
            ..FirmwareConfig::default()
        };
        (Arc::new(FirmwareManager::new(requester, events, config)), sender)
    }

    fn response(group: u16, id: u8, seq: u8, body: &CborValue) -> Vec<u8> {
        Request {
            op: Op::WriteRsp,
            group,
            id,
            body: Some(body.clone()),
        }
        .encode(seq)
        .unwrap()
    }

    async fn wait_for_smp(sender: &RecordingSender, count: usize) {
        while lock(&sender.smp).len() < count {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn echo_matches_by_sequence() {
        let (manager, sender) = manager(true);
        let task = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.echo("hi").await }
        });
        wait_for_smp(&sender, 1).await;

        let reply = CborValue::map([("r", CborValue::Text("hi".into()))]);
        // Split across two notifications.
        let frame = response(smp::group::OS, smp::os::ECHO, 0, &reply);
        assert!(manager.handle_smp(&frame[..5]).is_empty());
        assert!(manager.handle_smp(&frame[5..]).is_empty());

        assert_eq!(task.await.unwrap().unwrap(), "hi");
    }

    #[tokio::test]
    async fn strict_mode_drops_unmatched_sequence() {
        let (manager, sender) = manager(true);
        let task = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.reset().await }
        });
        wait_for_smp(&sender, 1).await;

        let empty = CborValue::Map(Vec::new());
        manager.handle_smp(&response(smp::group::OS, smp::os::RESET, 9, &empty));
        assert!(!task.is_finished());

        manager.handle_smp(&response(smp::group::OS, smp::os::RESET, 0, &empty));
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn permissive_mode_falls_back_to_group_and_id() {
        let (manager, sender) = manager(false);
        let task = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.reset().await }
        });
        wait_for_smp(&sender, 1).await;

        let empty = CborValue::Map(Vec::new());
        manager.handle_smp(&response(smp::group::OS, smp::os::RESET, 9, &empty));
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn nonzero_rc_is_rejection() {
        let (manager, sender) = manager(true);
        let task = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.reset().await }
        });
        wait_for_smp(&sender, 1).await;

        let body = CborValue::map([("rc", CborValue::Unsigned(3))]);
        manager.handle_smp(&response(smp::group::OS, smp::os::RESET, 0, &body));
        assert!(matches!(task.await.unwrap(), Err(CoreError::SmpRejected { rc: 3, .. })));
    }

    #[tokio::test]
    async fn clear_fails_outstanding_requests() {
        let (manager, sender) = manager(true);
        let task = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.get_state().await }
        });
        wait_for_smp(&sender, 1).await;
        manager.clear();
        assert!(matches!(task.await.unwrap(), Err(CoreError::Disconnected)));
    }

    #[tokio::test]
    async fn commands_need_known_state() {
        let (manager, _sender) = manager(true);
        assert!(matches!(manager.test_image().await, Err(CoreError::InvalidState { .. })));
        assert!(matches!(manager.upload(Bytes::from_static(&[0; 8])).await, Err(CoreError::Validation { .. })));
    }
}
