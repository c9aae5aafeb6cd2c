//! Haptic triggers. Fire and forget: the device sends no echo.

use tracing::debug;

use solekit_proto::vibration::{self, VibrationConfiguration};
use solekit_proto::DeviceMessageType;

use crate::connection::DeviceMessage;
use crate::error::CoreError;
use crate::pending::Requester;

pub struct VibrationManager {
    requester: Requester,
}

impl VibrationManager {
    pub(crate) fn new(requester: Requester) -> Self {
        Self { requester }
    }

    /// Play every configuration at once, each on its own motors.
    pub async fn trigger(&self, configurations: &[VibrationConfiguration]) -> Result<(), CoreError> {
        self.requester.ensure_ready()?;
        let payload = vibration::encode_trigger(configurations)?;
        debug!(count = configurations.len(), len = payload.len(), "triggering vibration");
        self.requester
            .send(vec![DeviceMessage::new(DeviceMessageType::TriggerVibration, payload)], true)
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use solekit_proto::vibration::{VibrationLocation, VibrationPattern, WaveformSegment};

    use super::*;
    use crate::lock;
    use crate::pending::tests::{RecordingSender, requester};

    #[tokio::test]
    async fn trigger_sends_one_message() {
        let sender = Arc::new(RecordingSender::default());
        let (requester, _pending, _ready) = requester(Arc::clone(&sender));
        let manager = VibrationManager::new(requester);

        let config = VibrationConfiguration::new(VibrationPattern::Waveform {
            segments: vec![WaveformSegment {
                amplitude: 1.0,
                duration_ms: 100,
            }],
        })
        .at([VibrationLocation::Front]);
        manager.trigger(&[config]).await.unwrap();

        let sent = lock(&sender.sent);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, DeviceMessageType::TriggerVibration);
        assert_eq!(sent[0].payload[0], 0b01);
    }

    #[tokio::test]
    async fn empty_trigger_is_rejected() {
        let sender = Arc::new(RecordingSender::default());
        let (requester, _pending, _ready) = requester(Arc::clone(&sender));
        let manager = VibrationManager::new(requester);
        assert!(matches!(manager.trigger(&[]).await, Err(CoreError::Validation { .. })));
    }
}
