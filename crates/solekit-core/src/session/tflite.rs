//! On-device model configuration and inference results.

use std::sync::Mutex as StdMutex;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use solekit_proto::sensor::SensorType;
use solekit_proto::tflite::{self, TfliteTask};
use solekit_proto::{DeviceMessageType, Error, MessageKind};

use super::emit;
use crate::connection::DeviceMessage;
use crate::error::CoreError;
use crate::event::DeviceEvent;
use crate::pending::Requester;
use crate::{lock, now_ms};

/// Last-known model settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TfliteState {
    pub name: String,
    pub task: Option<TfliteTask>,
    pub sample_rate: u16,
    pub sensor_types: Vec<SensorType>,
    pub is_ready: bool,
    pub capture_delay: u16,
    pub threshold: f32,
    pub inferencing_enabled: bool,
}

pub struct TfliteManager {
    requester: Requester,
    events: broadcast::Sender<DeviceEvent>,
    state: StdMutex<TfliteState>,
}

impl TfliteManager {
    pub(crate) fn new(requester: Requester, events: broadcast::Sender<DeviceEvent>) -> Self {
        Self {
            requester,
            events,
            state: StdMutex::new(TfliteState::default()),
        }
    }

    pub fn state(&self) -> TfliteState {
        lock(&self.state).clone()
    }

    pub fn is_ready(&self) -> bool {
        lock(&self.state).is_ready
    }

    pub(crate) fn clear(&self) {
        *lock(&self.state) = TfliteState::default();
    }

    pub(crate) fn handle(&self, message: &DeviceMessage) -> Result<(), Error> {
        use DeviceMessageType as T;

        let payload = &message.payload[..];
        let event = {
            let mut state = lock(&self.state);
            match message.kind {
                T::GetTfliteName | T::SetTfliteName => {
                    state.name = tflite::parse_name(payload)?;
                    DeviceEvent::TfliteName(state.name.clone())
                }
                T::GetTfliteTask | T::SetTfliteTask => {
                    let task = tflite::parse_task(payload)?;
                    state.task = Some(task);
                    DeviceEvent::TfliteTask(task)
                }
                T::GetTfliteSampleRate | T::SetTfliteSampleRate => {
                    state.sample_rate = tflite::parse_sample_rate(payload)?;
                    DeviceEvent::TfliteSampleRate(state.sample_rate)
                }
                T::GetTfliteSensorTypes | T::SetTfliteSensorTypes => {
                    state.sensor_types = tflite::parse_sensor_types(payload);
                    DeviceEvent::TfliteSensorTypes(state.sensor_types.clone())
                }
                T::TfliteIsReady => {
                    state.is_ready = tflite::parse_flag(payload, "tfliteIsReady")?;
                    DeviceEvent::TfliteIsReady(state.is_ready)
                }
                T::GetTfliteCaptureDelay | T::SetTfliteCaptureDelay => {
                    state.capture_delay = tflite::parse_capture_delay(payload)?;
                    DeviceEvent::TfliteCaptureDelay(state.capture_delay)
                }
                T::GetTfliteThreshold | T::SetTfliteThreshold => {
                    state.threshold = tflite::parse_threshold(payload)?;
                    DeviceEvent::TfliteThreshold(state.threshold)
                }
                T::GetTfliteInferencingEnabled | T::SetTfliteInferencingEnabled => {
                    state.inferencing_enabled = tflite::parse_flag(payload, "tfliteInferencingEnabled")?;
                    DeviceEvent::TfliteInferencingEnabled(state.inferencing_enabled)
                }
                T::TfliteInference => DeviceEvent::TfliteInference(tflite::parse_inference(&message.payload, now_ms())?),
                other => {
                    debug!(%other, "not a tflite message");
                    return Ok(());
                }
            }
        };
        emit(&self.events, event);
        Ok(())
    }

    // ── Operations ───────────────────────────────────────────────────

    async fn set(&self, kind: DeviceMessageType, payload: Vec<u8>) -> Result<(), CoreError> {
        info!(%kind, "updating tflite setting");
        self.requester
            .request(DeviceMessage::new(kind, payload), kind.canonical())
            .await?;
        Ok(())
    }

    pub async fn set_name(&self, name: &str) -> Result<(), CoreError> {
        self.requester.ensure_ready()?;
        if lock(&self.state).name == name {
            debug!(name, "redundant tflite name");
            return Ok(());
        }
        self.set(DeviceMessageType::SetTfliteName, name.as_bytes().to_vec()).await
    }

    pub async fn set_task(&self, task: TfliteTask) -> Result<(), CoreError> {
        self.requester.ensure_ready()?;
        if lock(&self.state).task == Some(task) {
            debug!(%task, "redundant tflite task");
            return Ok(());
        }
        self.set(DeviceMessageType::SetTfliteTask, vec![task.index()]).await
    }

    /// Rounded down to a multiple of 5 ms.
    pub async fn set_sample_rate(&self, rate: u16) -> Result<(), CoreError> {
        self.requester.ensure_ready()?;
        let rate = tflite::normalize_sample_rate(rate)?;
        if lock(&self.state).sample_rate == rate {
            debug!(rate, "redundant tflite sample rate");
            return Ok(());
        }
        self.set(DeviceMessageType::SetTfliteSampleRate, rate.to_le_bytes().to_vec())
            .await
    }

    pub async fn set_sensor_types(&self, sensors: &[SensorType]) -> Result<(), CoreError> {
        self.requester.ensure_ready()?;
        let encoded = tflite::encode_sensor_types(sensors)?;
        let mut current: Vec<u8> = lock(&self.state).sensor_types.iter().map(|s| s.index()).collect();
        current.sort_unstable();
        if current == encoded {
            debug!(?sensors, "redundant tflite sensor types");
            return Ok(());
        }
        self.set(DeviceMessageType::SetTfliteSensorTypes, encoded).await
    }

    pub async fn set_capture_delay(&self, delay_ms: u16) -> Result<(), CoreError> {
        self.requester.ensure_ready()?;
        if lock(&self.state).capture_delay == delay_ms {
            debug!(delay_ms, "redundant tflite capture delay");
            return Ok(());
        }
        self.set(DeviceMessageType::SetTfliteCaptureDelay, delay_ms.to_le_bytes().to_vec())
            .await
    }

    pub async fn set_threshold(&self, threshold: f32) -> Result<(), CoreError> {
        self.requester.ensure_ready()?;
        tflite::validate_threshold(threshold)?;
        #[allow(clippy::float_cmp)]
        let redundant = lock(&self.state).threshold == threshold;
        if redundant {
            debug!(threshold, "redundant tflite threshold");
            return Ok(());
        }
        self.set(DeviceMessageType::SetTfliteThreshold, threshold.to_le_bytes().to_vec())
            .await
    }

    /// Enabling needs a loaded model. Disabling without one does nothing.
    pub async fn set_inferencing_enabled(&self, enabled: bool) -> Result<(), CoreError> {
        self.requester.ensure_ready()?;
        let (is_ready, current) = {
            let state = lock(&self.state);
            (state.is_ready, state.inferencing_enabled)
        };
        if !enabled && !is_ready {
            return Ok(());
        }
        if !is_ready {
            return Err(CoreError::invalid_state("tflite model is not ready"));
        }
        if current == enabled {
            debug!(enabled, "redundant inferencing flag");
            return Ok(());
        }
        self.set(DeviceMessageType::SetTfliteInferencingEnabled, vec![u8::from(enabled)])
            .await
    }

    pub async fn toggle_inferencing_enabled(&self) -> Result<(), CoreError> {
        let enabled = lock(&self.state).inferencing_enabled;
        self.set_inferencing_enabled(!enabled).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;
    use crate::pending::tests::{RecordingSender, requester};

    fn manager() -> (TfliteManager, Arc<RecordingSender>, broadcast::Receiver<DeviceEvent>) {
        let sender = Arc::new(RecordingSender::default());
        let (requester, _pending, _ready) = requester(Arc::clone(&sender));
        let (events, rx) = broadcast::channel(16);
        (TfliteManager::new(requester, events), sender, rx)
    }

    #[tokio::test]
    async fn enabling_without_model_is_rejected() {
        let (manager, sender, _rx) = manager();
        assert!(matches!(
            manager.set_inferencing_enabled(true).await,
            Err(CoreError::InvalidState { .. })
        ));
        manager.set_inferencing_enabled(false).await.unwrap();
        assert!(lock(&sender.sent).is_empty());
    }

    #[tokio::test]
    async fn invalid_sample_rate_and_sensor_are_rejected() {
        let (manager, sender, _rx) = manager();
        assert!(manager.set_sample_rate(3).await.is_err());
        assert!(manager.set_sensor_types(&[SensorType::Barometer]).await.is_err());
        assert!(manager.set_threshold(-1.0).await.is_err());
        assert!(lock(&sender.sent).is_empty());
    }

    #[tokio::test]
    async fn redundant_sensor_types_skip_the_request() {
        let (manager, sender, _rx) = manager();
        manager
            .handle(&DeviceMessage::new(DeviceMessageType::GetTfliteSensorTypes, vec![12, 3]))
            .unwrap();
        manager
            .set_sensor_types(&[SensorType::Gyroscope, SensorType::Pressure, SensorType::Pressure])
            .await
            .unwrap();
        assert!(lock(&sender.sent).is_empty());
    }

    #[test]
    fn inference_is_emitted() {
        let (manager, _sender, mut rx) = manager();
        let mut payload = vec![0x01, 0x00];
        payload.extend_from_slice(&0.5f32.to_le_bytes());
        manager
            .handle(&DeviceMessage::new(DeviceMessageType::TfliteInference, Bytes::from(payload)))
            .unwrap();
        match rx.try_recv().unwrap() {
            DeviceEvent::TfliteInference(inference) => assert_eq!(inference.values, vec![0.5]),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
