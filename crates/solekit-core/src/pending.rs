//! Pending-request table for device messages.
//!
//! A request registers a waiter under the message type its answer arrives
//! as, then writes. The dispatcher resolves waiters as messages come in.
//! Each response type has a FIFO gate so at most one request per type is in
//! flight; a second caller queues behind the first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::future::try_join_all;
use tokio::sync::{Mutex, OwnedMutexGuard, oneshot, watch};
use tracing::debug;

use solekit_proto::{DeviceMessageType, MessageKind};

use crate::connection::{DeviceMessage, MessageSender};
use crate::error::CoreError;
use crate::lock;

type Waiter = oneshot::Sender<Result<Bytes, CoreError>>;

#[derive(Default)]
pub(crate) struct PendingRequests {
    gates: DashMap<DeviceMessageType, Arc<Mutex<()>>>,
    waiters: StdMutex<HashMap<DeviceMessageType, Vec<Waiter>>>,
}

impl PendingRequests {
    async fn gate(&self, kind: DeviceMessageType) -> OwnedMutexGuard<()> {
        let gate = Arc::clone(self.gates.entry(kind).or_default().value());
        gate.lock_owned().await
    }

    fn register(&self, kind: DeviceMessageType) -> oneshot::Receiver<Result<Bytes, CoreError>> {
        let (tx, rx) = oneshot::channel();
        lock(&self.waiters).entry(kind).or_default().push(tx);
        rx
    }

    /// Hand `payload` to everyone waiting on `kind`.
    pub(crate) fn resolve(&self, kind: DeviceMessageType, payload: &Bytes) {
        let Some(waiters) = lock(&self.waiters).remove(&kind) else {
            return;
        };
        debug!(%kind, count = waiters.len(), "resolving pending requests");
        for waiter in waiters {
            let _ = waiter.send(Ok(payload.clone()));
        }
    }

    fn discard(&self, kind: DeviceMessageType) {
        lock(&self.waiters).remove(&kind);
    }

    /// Fail every outstanding request. Called when the device disconnects.
    pub(crate) fn fail_all(&self) {
        let drained: Vec<_> = lock(&self.waiters).drain().collect();
        for (kind, waiters) in drained {
            debug!(%kind, count = waiters.len(), "failing pending requests");
            for waiter in waiters {
                let _ = waiter.send(Err(CoreError::Disconnected));
            }
        }
    }
}

async fn await_response(rx: oneshot::Receiver<Result<Bytes, CoreError>>) -> Result<Bytes, CoreError> {
    rx.await.unwrap_or(Err(CoreError::Disconnected))
}

// ── Requester ────────────────────────────────────────────────────────

/// What a session manager holds to talk to its device.
#[derive(Clone)]
pub(crate) struct Requester {
    sender: Arc<dyn MessageSender>,
    pending: Arc<PendingRequests>,
    ready: watch::Receiver<bool>,
}

impl Requester {
    pub(crate) fn new(
        sender: Arc<dyn MessageSender>,
        pending: Arc<PendingRequests>,
        ready: watch::Receiver<bool>,
    ) -> Self {
        Self { sender, pending, ready }
    }

    pub(crate) fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub(crate) fn ensure_ready(&self) -> Result<(), CoreError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(CoreError::NotReady)
        }
    }

    /// Send one message and wait for `response` to arrive.
    pub(crate) async fn request(
        &self,
        message: DeviceMessage,
        response: DeviceMessageType,
    ) -> Result<Bytes, CoreError> {
        let _gate = self.pending.gate(response).await;
        let rx = self.pending.register(response);
        if let Err(e) = self.sender.send(vec![message], true).await {
            self.pending.discard(response);
            return Err(e);
        }
        await_response(rx).await
    }

    /// Queue several requests, write them in one flush and wait for every
    /// response. Results come back in request order.
    pub(crate) async fn request_batch(
        &self,
        requests: Vec<(DeviceMessage, DeviceMessageType)>,
    ) -> Result<Vec<Bytes>, CoreError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        // Gates are taken in index order so concurrent batches cannot deadlock.
        let mut kinds: Vec<_> = requests.iter().map(|(_, kind)| *kind).collect();
        kinds.sort_by_key(|kind| kind.index());
        kinds.dedup();
        let mut gates = Vec::with_capacity(kinds.len());
        for kind in &kinds {
            gates.push(self.pending.gate(*kind).await);
        }

        let mut receivers = Vec::with_capacity(requests.len());
        let mut messages = Vec::with_capacity(requests.len());
        for (message, kind) in requests {
            receivers.push(self.pending.register(kind));
            messages.push(message);
        }

        let sent = match self.sender.send(messages, false).await {
            Ok(()) => self.sender.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            for kind in kinds {
                self.pending.discard(kind);
            }
            return Err(e);
        }

        let responses = try_join_all(receivers.into_iter().map(await_response)).await;
        drop(gates);
        responses
    }

    /// Fire and forget.
    pub(crate) async fn send(&self, messages: Vec<DeviceMessage>, send_immediately: bool) -> Result<(), CoreError> {
        self.sender.send(messages, send_immediately).await
    }

    pub(crate) async fn send_smp(&self, frame: Bytes) -> Result<(), CoreError> {
        self.sender.send_smp(frame).await
    }
}
