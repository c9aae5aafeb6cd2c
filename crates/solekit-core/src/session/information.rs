//! Identity, battery, MTU and clock.

use std::sync::Mutex as StdMutex;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use solekit_proto::information::{self, DeviceType};
use solekit_proto::{DeviceMessageType, Error};

use super::emit;
use crate::connection::DeviceMessage;
use crate::error::CoreError;
use crate::event::DeviceEvent;
use crate::pending::Requester;
use crate::{lock, now_ms};

/// Last-known information values.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InformationState {
    pub is_charging: bool,
    pub battery_current: f32,
    pub id: String,
    pub name: String,
    pub device_type: Option<DeviceType>,
    pub mtu: Option<u16>,
    /// Device clock in Unix milliseconds; 0 until set.
    pub current_time: u64,
}

/// Values other components need to react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InformationUpdate {
    Mtu(u16),
    CurrentTime(u64),
}

pub struct InformationManager {
    requester: Requester,
    events: broadcast::Sender<DeviceEvent>,
    state: StdMutex<InformationState>,
}

impl InformationManager {
    pub(crate) fn new(requester: Requester, events: broadcast::Sender<DeviceEvent>) -> Self {
        Self {
            requester,
            events,
            state: StdMutex::new(InformationState::default()),
        }
    }

    pub fn state(&self) -> InformationState {
        lock(&self.state).clone()
    }

    pub fn name(&self) -> String {
        lock(&self.state).name.clone()
    }

    pub fn device_type(&self) -> Option<DeviceType> {
        lock(&self.state).device_type
    }

    pub fn mtu(&self) -> Option<u16> {
        lock(&self.state).mtu
    }

    pub(crate) fn clear(&self) {
        *lock(&self.state) = InformationState::default();
    }

    pub(crate) fn handle(&self, message: &DeviceMessage) -> Result<Option<InformationUpdate>, Error> {
        use DeviceMessageType as T;

        let payload = &message.payload[..];
        let mut state = lock(&self.state);
        let (event, update) = match message.kind {
            T::IsCharging => {
                state.is_charging = information::parse_is_charging(payload)?;
                (DeviceEvent::IsCharging(state.is_charging), None)
            }
            T::GetBatteryCurrent => {
                state.battery_current = information::parse_battery_current(payload)?;
                (DeviceEvent::BatteryCurrent(state.battery_current), None)
            }
            T::GetMtu => {
                let mtu = information::parse_mtu(payload)?;
                state.mtu = Some(mtu);
                (DeviceEvent::Mtu(mtu), Some(InformationUpdate::Mtu(mtu)))
            }
            T::GetId => {
                state.id = information::parse_text(payload, "id")?;
                (DeviceEvent::Id(state.id.clone()), None)
            }
            T::GetName | T::SetName => {
                state.name = information::parse_text(payload, "name")?;
                (DeviceEvent::Name(state.name.clone()), None)
            }
            T::GetType | T::SetType => {
                let device_type = information::parse_device_type(payload)?;
                state.device_type = Some(device_type);
                (DeviceEvent::DeviceType(device_type), None)
            }
            T::GetCurrentTime | T::SetCurrentTime => {
                state.current_time = information::parse_current_time(payload)?;
                (
                    DeviceEvent::CurrentTime(state.current_time),
                    Some(InformationUpdate::CurrentTime(state.current_time)),
                )
            }
            other => {
                debug!(%other, "not an information message");
                return Ok(None);
            }
        };
        drop(state);

        emit(&self.events, event);
        Ok(update)
    }

    // ── Operations ───────────────────────────────────────────────────

    pub async fn set_name(&self, name: &str) -> Result<(), CoreError> {
        self.requester.ensure_ready()?;
        information::validate_name(name)?;
        if lock(&self.state).name == name {
            debug!(name, "redundant name");
            return Ok(());
        }

        info!(name, "setting name");
        let message = DeviceMessage::new(DeviceMessageType::SetName, name.as_bytes().to_vec());
        self.requester.request(message, DeviceMessageType::GetName).await?;
        Ok(())
    }

    pub async fn set_type(&self, device_type: DeviceType) -> Result<(), CoreError> {
        self.requester.ensure_ready()?;
        if lock(&self.state).device_type == Some(device_type) {
            debug!(%device_type, "redundant device type");
            return Ok(());
        }

        info!(%device_type, "setting device type");
        let message = DeviceMessage::new(DeviceMessageType::SetType, vec![device_type.index()]);
        self.requester.request(message, DeviceMessageType::GetType).await?;
        Ok(())
    }

    /// Push the host clock to the device. The echo arrives as a normal
    /// `setCurrentTime` message; nothing waits on it here.
    pub(crate) async fn set_current_time(&self) -> Result<(), CoreError> {
        let now = now_ms();
        info!(now, "setting device clock");
        let message = DeviceMessage::new(
            DeviceMessageType::SetCurrentTime,
            information::encode_current_time(now).to_vec(),
        );
        self.requester.send(vec![message], true).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;
    use crate::pending::tests::{RecordingSender, requester};

    fn manager() -> (InformationManager, broadcast::Receiver<DeviceEvent>) {
        let (requester, _pending, _ready) = requester(Arc::new(RecordingSender::default()));
        let (events, rx) = broadcast::channel(16);
        (InformationManager::new(requester, events), rx)
    }

    #[test]
    fn mtu_and_clock_are_reported_upward() {
        let (manager, mut rx) = manager();

        let mtu = DeviceMessage::new(DeviceMessageType::GetMtu, Bytes::from_static(&[247, 0]));
        assert_eq!(manager.handle(&mtu).unwrap(), Some(InformationUpdate::Mtu(247)));
        assert!(matches!(rx.try_recv().unwrap(), DeviceEvent::Mtu(247)));

        let clock = DeviceMessage::new(DeviceMessageType::SetCurrentTime, 5u64.to_le_bytes().to_vec());
        assert_eq!(manager.handle(&clock).unwrap(), Some(InformationUpdate::CurrentTime(5)));
        assert_eq!(manager.state().current_time, 5);
    }

    #[test]
    fn set_echo_updates_name() {
        let (manager, mut rx) = manager();
        let echo = DeviceMessage::new(DeviceMessageType::SetName, Bytes::from_static(b"Left Sole"));
        assert_eq!(manager.handle(&echo).unwrap(), None);
        assert_eq!(manager.name(), "Left Sole");
        assert!(matches!(rx.try_recv().unwrap(), DeviceEvent::Name(n) if n == "Left Sole"));
    }

    #[test]
    fn bad_type_index_is_protocol_error() {
        let (manager, _rx) = manager();
        let bad = DeviceMessage::new(DeviceMessageType::GetType, Bytes::from_static(&[9]));
        assert!(manager.handle(&bad).is_err());
    }

    #[tokio::test]
    async fn short_name_is_rejected_before_sending() {
        let sender = Arc::new(RecordingSender::default());
        let (requester, _pending, _ready) = requester(Arc::clone(&sender));
        let (events, _rx) = broadcast::channel(16);
        let manager = InformationManager::new(requester, events);

        assert!(matches!(manager.set_name("x").await, Err(CoreError::Validation { .. })));
        assert!(lock(&sender.sent).is_empty());
    }
}
