// ── Sensor data decoding ──
//
// `sensorData` = `[u16 LE timestamp low bits][TLV<SensorType, u8 length>]`.
// Fixed-point samples are multiplied by a per-sensor scalar the device
// reports once in `getSensorScalars`.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use strum::{Display, FromRepr};

use super::SensorType;
use super::pressure::{PressureAggregator, PressureData, Vector2};
use crate::codec::{self, LengthWidth};
use crate::error::Error;
use crate::message::MessageKind;
use crate::reader::ByteReader;

const SCALAR_RECORD_LEN: usize = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Euler {
    pub heading: f64,
    pub pitch: f64,
    pub roll: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub still: bool,
    pub walking: bool,
    pub running: bool,
    pub bicycle: bool,
    pub vehicle: bool,
    pub tilting: bool,
}

impl Activity {
    fn from_bits(bits: u8) -> Self {
        let bit = |i: u8| bits & (1 << i) != 0;
        Self {
            still: bit(0),
            walking: bit(1),
            running: bit(2),
            bicycle: bit(3),
            vehicle: bit(4),
            tilting: bit(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, FromRepr)]
#[repr(u8)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum DeviceOrientation {
    PortraitUpright,
    LandscapeLeft,
    PortraitUpsideDown,
    LandscapeRight,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum SensorValue {
    Vector3(Vector3),
    Quaternion(Quaternion),
    Euler(Euler),
    StepCounter(u32),
    StepDetector,
    Activity(Activity),
    DeviceOrientation(DeviceOrientation),
    Pressure(PressureData),
    Barometer { pressure: f64, altitude: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorReading {
    pub sensor_type: SensorType,
    /// Unix milliseconds, reconstructed from the device's low 16 bits.
    pub timestamp: u64,
    pub value: SensorValue,
}

/// Rebuild a full timestamp from the device's 16-bit millisecond counter.
///
/// Takes the host clock with its own low 16 bits replaced by the device's.
/// Never lands more than one 65536 ms period away from `now_ms`.
pub fn reconstruct_timestamp(now_ms: u64, low: u16) -> u64 {
    now_ms - (now_ms % 0x1_0000) + u64::from(low)
}

/// Altitude in metres for a pressure in pascals (standard atmosphere).
pub fn altitude_from_pressure(pascals: f64) -> f64 {
    const P0: f64 = 101_325.0;
    const T0: f64 = 288.15;
    const L: f64 = 0.0065;
    const R: f64 = 8.314_459_8;
    const G: f64 = 9.806_65;
    const M: f64 = 0.028_964_4;

    let exponent = (R * L) / (G * M);
    (T0 / L) * (1.0 - (pascals / P0).powf(exponent))
}

/// Stateful decoder for the SensorData message group.
#[derive(Debug, Clone, Default)]
pub struct SensorDataDecoder {
    scalars: HashMap<SensorType, f64>,
    pressure: PressureAggregator,
}

impl SensorDataDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Effective scalar; missing or zero scalars count as 1.
    pub fn scalar(&self, sensor: SensorType) -> f64 {
        match self.scalars.get(&sensor) {
            Some(s) if *s != 0.0 => *s,
            _ => 1.0,
        }
    }

    pub fn pressure_positions(&self) -> &[Vector2] {
        self.pressure.positions()
    }

    pub fn reset_pressure_range(&mut self) {
        self.pressure.reset_range();
    }

    pub fn parse_scalars(&mut self, payload: &[u8]) -> Result<(), Error> {
        let mut r = ByteReader::new(payload, "sensorScalars");
        while r.remaining() >= SCALAR_RECORD_LEN {
            let index = r.u8()?;
            let scalar = r.f32_le()?;
            match SensorType::from_index(index) {
                Some(sensor) => {
                    tracing::debug!(%sensor, scalar, "sensor scalar");
                    self.scalars.insert(sensor, f64::from(scalar));
                }
                None => tracing::warn!(index, "unknown sensor type in scalars"),
            }
        }
        if !r.is_empty() {
            return Err(Error::truncated("sensorScalars", SCALAR_RECORD_LEN, r.remaining()));
        }
        Ok(())
    }

    pub fn parse_positions(&mut self, payload: &[u8]) -> Result<(), Error> {
        self.pressure.parse_positions(payload)
    }

    /// Decode one `sensorData` message into readings, in wire order.
    pub fn parse_data(&mut self, payload: &Bytes, now_ms: u64) -> Result<Vec<SensorReading>, Error> {
        let low = ByteReader::new(payload, "sensorData timestamp").u16_le()?;
        let timestamp = reconstruct_timestamp(now_ms, low);

        let nested = payload.slice(2..);
        let mut readings = Vec::new();
        for message in codec::decode::<SensorType>(&nested, LengthWidth::U8)? {
            let value = self.parse_value(message.kind, &message.payload)?;
            readings.push(SensorReading {
                sensor_type: message.kind,
                timestamp,
                value,
            });
        }
        Ok(readings)
    }

    fn parse_value(&mut self, sensor: SensorType, payload: &[u8]) -> Result<SensorValue, Error> {
        let scalar = self.scalar(sensor);
        let mut r = ByteReader::new(payload, sensor.into());
        let fixed = |r: &mut ByteReader<'_>| -> Result<f64, Error> { Ok(f64::from(r.i16_le()?) * scalar) };

        let value = match sensor {
            SensorType::Acceleration
            | SensorType::Gravity
            | SensorType::LinearAcceleration
            | SensorType::Gyroscope
            | SensorType::Magnetometer => SensorValue::Vector3(Vector3 {
                x: fixed(&mut r)?,
                y: fixed(&mut r)?,
                z: fixed(&mut r)?,
            }),
            SensorType::GameRotation | SensorType::Rotation => SensorValue::Quaternion(Quaternion {
                x: fixed(&mut r)?,
                y: fixed(&mut r)?,
                z: fixed(&mut r)?,
                w: fixed(&mut r)?,
            }),
            SensorType::Orientation => {
                let heading = fixed(&mut r)?;
                let pitch = fixed(&mut r)?;
                let roll = fixed(&mut r)?;
                SensorValue::Euler(Euler {
                    heading: -heading,
                    pitch: -pitch,
                    roll,
                })
            }
            SensorType::StepCounter => SensorValue::StepCounter(r.u32_le()?),
            SensorType::StepDetector => SensorValue::StepDetector,
            SensorType::Activity => SensorValue::Activity(Activity::from_bits(r.u8()?)),
            SensorType::DeviceOrientation => {
                let index = r.u8()?;
                let orientation = DeviceOrientation::from_repr(index).ok_or(Error::InvalidEnum {
                    kind: "device orientation",
                    index,
                })?;
                SensorValue::DeviceOrientation(orientation)
            }
            SensorType::Pressure => SensorValue::Pressure(self.pressure.parse(payload, scalar)?),
            SensorType::Barometer => {
                let pressure = f64::from(r.u32_le()?) * scalar;
                SensorValue::Barometer {
                    pressure,
                    altitude: altitude_from_pressure(pressure),
                }
            }
        };
        Ok(value)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_with_equal_low_bits_is_exact() {
        let now = 1_700_000_123_456u64;
        let low = u16::try_from(now % 0x1_0000).unwrap();
        assert_eq!(reconstruct_timestamp(now, low), now);
    }

    #[test]
    fn timestamp_wraparound_stays_within_one_period() {
        let now = 1_700_000_123_456u64;
        let now_low = now % 0x1_0000;
        let low = u16::try_from(now_low - 100).unwrap();
        let ts = reconstruct_timestamp(now, low);
        assert_eq!(ts, now - 100);
        assert!(now - ts < 0x1_0000);

        // Device counter just wrapped while the host has not yet.
        let low = 5u16;
        let ts = reconstruct_timestamp(now, low);
        assert!(ts <= now && now - ts < 0x1_0000);
    }

    #[test]
    fn sea_level_altitude_is_zero() {
        assert!(altitude_from_pressure(101_325.0).abs() < 1e-9);
        assert!(altitude_from_pressure(89_874.6) > 990.0);
    }

    fn sample(sensor: SensorType, data: &[u8]) -> Bytes {
        let mut out = vec![0x10, 0x00, sensor.index(), u8::try_from(data.len()).unwrap()];
        out.extend_from_slice(data);
        Bytes::from(out)
    }

    #[test]
    fn vector_uses_scalar() {
        let mut d = SensorDataDecoder::new();
        let mut scalars = vec![SensorType::Acceleration.index()];
        scalars.extend_from_slice(&0.5f32.to_le_bytes());
        d.parse_scalars(&scalars).unwrap();

        let mut raw = Vec::new();
        for v in [2i16, -4, 6] {
            raw.extend_from_slice(&v.to_le_bytes());
        }
        let readings = d.parse_data(&sample(SensorType::Acceleration, &raw), 0).unwrap();
        assert_eq!(readings[0].timestamp, 0x10);
        assert_eq!(
            readings[0].value,
            SensorValue::Vector3(Vector3 { x: 1.0, y: -2.0, z: 3.0 })
        );
    }

    #[test]
    fn zero_scalar_counts_as_one() {
        let mut d = SensorDataDecoder::new();
        let mut scalars = vec![SensorType::Gyroscope.index()];
        scalars.extend_from_slice(&0.0f32.to_le_bytes());
        d.parse_scalars(&scalars).unwrap();
        assert!((d.scalar(SensorType::Gyroscope) - 1.0).abs() < f64::EPSILON);
        assert!((d.scalar(SensorType::Rotation) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn euler_negates_heading_and_pitch() {
        let mut d = SensorDataDecoder::new();
        let mut raw = Vec::new();
        for v in [10i16, 20, 30] {
            raw.extend_from_slice(&v.to_le_bytes());
        }
        let readings = d.parse_data(&sample(SensorType::Orientation, &raw), 0).unwrap();
        assert_eq!(
            readings[0].value,
            SensorValue::Euler(Euler {
                heading: -10.0,
                pitch: -20.0,
                roll: 30.0
            })
        );
    }

    #[test]
    fn discrete_sensors() {
        let mut d = SensorDataDecoder::new();
        let r = d.parse_data(&sample(SensorType::Activity, &[0b0000_0110]), 0).unwrap();
        let SensorValue::Activity(a) = r[0].value else {
            panic!("expected activity");
        };
        assert!(a.walking && a.running && !a.still);

        let r = d.parse_data(&sample(SensorType::StepCounter, &42u32.to_le_bytes()), 0).unwrap();
        assert_eq!(r[0].value, SensorValue::StepCounter(42));

        let r = d.parse_data(&sample(SensorType::StepDetector, &[]), 0).unwrap();
        assert_eq!(r[0].value, SensorValue::StepDetector);

        let r = d.parse_data(&sample(SensorType::DeviceOrientation, &[3]), 0).unwrap();
        assert_eq!(r[0].value, SensorValue::DeviceOrientation(DeviceOrientation::LandscapeRight));

        let err = d.parse_data(&sample(SensorType::DeviceOrientation, &[9]), 0).unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn multiple_sensors_in_one_message() {
        let mut d = SensorDataDecoder::new();
        let mut payload = vec![0, 0];
        payload.extend_from_slice(&[SensorType::StepDetector.index(), 0]);
        payload.extend_from_slice(&[SensorType::StepCounter.index(), 4, 1, 0, 0, 0]);
        let readings = d.parse_data(&Bytes::from(payload), 0).unwrap();
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[1].value, SensorValue::StepCounter(1));
    }

    #[test]
    fn short_vector_is_truncated() {
        let mut d = SensorDataDecoder::new();
        let err = d.parse_data(&sample(SensorType::Gravity, &[1, 0]), 0).unwrap_err();
        assert!(matches!(err, Error::Truncated { .. }));
    }
}
