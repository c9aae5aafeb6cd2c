//! On-device TensorFlow Lite model control payloads.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, FromRepr};

use crate::error::Error;
use crate::message::MessageKind;
use crate::reader::{self, ByteReader};
use crate::sensor::SensorType;
use crate::sensor::config::SENSOR_RATE_STEP;
use crate::sensor::data::reconstruct_timestamp;

/// Sensors a model may consume.
pub const TFLITE_SENSOR_TYPES: [SensorType; 4] = [
    SensorType::Pressure,
    SensorType::LinearAcceleration,
    SensorType::Gyroscope,
    SensorType::Magnetometer,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, FromRepr)]
#[repr(u8)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum TfliteTask {
    Classification,
    Regression,
}

impl TfliteTask {
    #[allow(clippy::as_conversions)]
    pub fn index(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TfliteInference {
    pub timestamp: u64,
    pub values: Vec<f32>,
}

pub fn parse_name(payload: &[u8]) -> Result<String, Error> {
    reader::utf8(payload, "tfliteName")
}

pub fn parse_task(payload: &[u8]) -> Result<TfliteTask, Error> {
    let index = ByteReader::new(payload, "tfliteTask").u8()?;
    TfliteTask::from_repr(index).ok_or(Error::InvalidEnum {
        kind: "tflite task",
        index,
    })
}

pub fn parse_sample_rate(payload: &[u8]) -> Result<u16, Error> {
    ByteReader::new(payload, "tfliteSampleRate").u16_le()
}

pub fn parse_capture_delay(payload: &[u8]) -> Result<u16, Error> {
    ByteReader::new(payload, "tfliteCaptureDelay").u16_le()
}

pub fn parse_threshold(payload: &[u8]) -> Result<f32, Error> {
    ByteReader::new(payload, "tfliteThreshold").f32_le()
}

pub fn parse_flag(payload: &[u8], context: &'static str) -> Result<bool, Error> {
    ByteReader::new(payload, context).bool()
}

/// One sensor type index per byte; unknown indices are logged and dropped.
pub fn parse_sensor_types(payload: &[u8]) -> Vec<SensorType> {
    payload
        .iter()
        .filter_map(|&index| {
            let sensor = SensorType::from_index(index);
            if sensor.is_none() {
                tracing::error!(index, "invalid tflite sensor type index");
            }
            sensor
        })
        .collect()
}

/// Round down to the rate step; the result must be at least one step.
pub fn normalize_sample_rate(rate: u16) -> Result<u16, Error> {
    let rounded = rate - rate % SENSOR_RATE_STEP;
    if rounded < SENSOR_RATE_STEP {
        return Err(Error::validation(
            "tflite sample rate",
            format!("must be a multiple of {SENSOR_RATE_STEP} greater than 0 (got {rate})"),
        ));
    }
    Ok(rounded)
}

/// Validate, deduplicate and sort into wire order.
pub fn encode_sensor_types(sensors: &[SensorType]) -> Result<Vec<u8>, Error> {
    let mut indices = Vec::with_capacity(sensors.len());
    for sensor in sensors {
        if !TFLITE_SENSOR_TYPES.contains(sensor) {
            return Err(Error::validation(
                "tflite sensor type",
                format!("{sensor} cannot feed a model"),
            ));
        }
        indices.push(sensor.index());
    }
    indices.sort_unstable();
    indices.dedup();
    Ok(indices)
}

pub fn validate_threshold(threshold: f32) -> Result<(), Error> {
    if threshold.is_nan() || threshold < 0.0 {
        return Err(Error::validation(
            "tflite threshold",
            format!("must be positive (got {threshold})"),
        ));
    }
    Ok(())
}

pub fn parse_inference(payload: &Bytes, now_ms: u64) -> Result<TfliteInference, Error> {
    let mut r = ByteReader::new(payload, "tfliteInference");
    let timestamp = reconstruct_timestamp(now_ms, r.u16_le()?);
    let mut values = Vec::with_capacity(r.remaining() / 4);
    while !r.is_empty() {
        values.push(r.f32_le()?);
    }
    Ok(TfliteInference { timestamp, values })
}
