//! Sensor configuration and the sensor data stream.

use std::collections::BTreeSet;
use std::sync::Mutex as StdMutex;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use solekit_proto::sensor::config::{self, prepare_request};
use solekit_proto::sensor::{SensorConfiguration, SensorDataDecoder, SensorType};
use solekit_proto::{DeviceMessageType, Error};

use super::emit;
use crate::connection::DeviceMessage;
use crate::error::CoreError;
use crate::event::DeviceEvent;
use crate::pending::Requester;
use crate::{lock, now_ms};

#[derive(Default)]
struct SensorState {
    configuration: SensorConfiguration,
    /// Sensor types the device advertised in its last configuration.
    available: BTreeSet<SensorType>,
    decoder: SensorDataDecoder,
}

pub struct SensorManager {
    requester: Requester,
    events: broadcast::Sender<DeviceEvent>,
    state: StdMutex<SensorState>,
}

impl SensorManager {
    pub(crate) fn new(requester: Requester, events: broadcast::Sender<DeviceEvent>) -> Self {
        Self {
            requester,
            events,
            state: StdMutex::new(SensorState::default()),
        }
    }

    pub fn configuration(&self) -> SensorConfiguration {
        lock(&self.state).configuration.clone()
    }

    pub fn available_sensors(&self) -> BTreeSet<SensorType> {
        lock(&self.state).available.clone()
    }

    pub(crate) fn clear(&self) {
        *lock(&self.state) = SensorState::default();
    }

    /// Restart pressure normalization from scratch.
    pub fn reset_pressure_range(&self) {
        lock(&self.state).decoder.reset_pressure_range();
    }

    pub(crate) fn handle(&self, message: &DeviceMessage) -> Result<(), Error> {
        use DeviceMessageType as T;

        match message.kind {
            T::GetSensorConfiguration | T::SetSensorConfiguration => {
                let configuration = SensorConfiguration::parse(&message.payload)?;
                debug!(?configuration, "sensor configuration");
                {
                    let mut state = lock(&self.state);
                    state.available = configuration.sensors();
                    state.configuration = configuration.clone();
                }
                emit(&self.events, DeviceEvent::SensorConfiguration(configuration));
            }
            T::GetSensorScalars => lock(&self.state).decoder.parse_scalars(&message.payload)?,
            T::GetPressurePositions => {
                let positions = {
                    let mut state = lock(&self.state);
                    state.decoder.parse_positions(&message.payload)?;
                    state.decoder.pressure_positions().to_vec()
                };
                emit(&self.events, DeviceEvent::PressurePositions(positions));
            }
            T::SensorData => {
                let readings = lock(&self.state).decoder.parse_data(&message.payload, now_ms())?;
                for reading in readings {
                    emit(&self.events, DeviceEvent::SensorData(reading));
                }
            }
            other => debug!(%other, "not a sensor message"),
        }
        Ok(())
    }

    // ── Operations ───────────────────────────────────────────────────

    /// Apply `request`, optionally disabling every sensor it does not name,
    /// and wait for the device to echo its new configuration.
    pub async fn set_configuration(&self, request: &SensorConfiguration, clear_rest: bool) -> Result<(), CoreError> {
        self.requester.ensure_ready()?;

        let (prepared, current) = {
            let state = lock(&self.state);
            let request = if clear_rest {
                SensorConfiguration::zeroed(state.available.iter().copied()).merged(request)
            } else {
                request.clone()
            };
            (prepare_request(&request, &state.available)?, state.configuration.clone())
        };

        if prepared.is_empty() {
            warn!("no available sensors in configuration request");
            return Ok(());
        }
        if current.contains_all(&prepared) {
            debug!(?prepared, "redundant sensor configuration");
            return Ok(());
        }

        info!(?prepared, "setting sensor configuration");
        let message = DeviceMessage::new(DeviceMessageType::SetSensorConfiguration, prepared.encode());
        self.requester
            .request(message, DeviceMessageType::GetSensorConfiguration)
            .await?;
        Ok(())
    }

    /// Disable every sensor.
    pub async fn clear_configuration(&self) -> Result<(), CoreError> {
        let zeroed = SensorConfiguration::zeroed(config::all_sensors());
        self.set_configuration(&zeroed, false).await
    }
}
