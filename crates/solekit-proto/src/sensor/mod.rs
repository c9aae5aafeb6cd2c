// ── Sensors ──
//
// Sensor type catalogue plus the configuration and data codecs. Sensor
// types double as the type field of the nested TLV inside `sensorData`.

pub mod config;
pub mod data;
pub mod pressure;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, FromRepr, IntoStaticStr};

use crate::message::message_kind;

pub use config::SensorConfiguration;
pub use data::{SensorDataDecoder, SensorReading, SensorValue};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    FromRepr,
    IntoStaticStr,
)]
#[repr(u8)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum SensorType {
    Acceleration,
    Gravity,
    LinearAcceleration,
    Gyroscope,
    Magnetometer,
    GameRotation,
    Rotation,
    Orientation,
    Activity,
    StepCounter,
    StepDetector,
    DeviceOrientation,
    Pressure,
    Barometer,
}

message_kind!(SensorType, "sensor");

impl SensorType {
    /// Sensors that stream samples at a fixed rate (as opposed to events).
    pub fn is_continuous(self) -> bool {
        matches!(
            self,
            Self::Acceleration
                | Self::Gravity
                | Self::LinearAcceleration
                | Self::Gyroscope
                | Self::Magnetometer
                | Self::GameRotation
                | Self::Rotation
                | Self::Pressure
                | Self::Barometer
        )
    }
}
