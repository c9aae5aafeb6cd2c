//! Pressure-grid aggregation: per-sensor normalization and center of pressure.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::reader::ByteReader;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vector2 {
    pub x: f64,
    pub y: f64,
}

/// Online min/max tracker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeHelper {
    min: f64,
    max: f64,
}

impl Default for RangeHelper {
    fn default() -> Self {
        Self {
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl RangeHelper {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn update(&mut self, value: f64) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn range(&self) -> f64 {
        if self.max < self.min {
            0.0
        } else {
            self.max - self.min
        }
    }

    /// Position of `value` inside the observed range, in `[0, 1]`.
    /// A degenerate range normalizes to 0.
    pub fn normalize(&self, value: f64) -> f64 {
        let range = self.range();
        if range > 0.0 {
            ((value - self.min) / range).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    pub fn update_and_normalize(&mut self, value: f64) -> f64 {
        self.update(value);
        self.normalize(value)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CenterOfPressureHelper {
    x: RangeHelper,
    y: RangeHelper,
}

impl CenterOfPressureHelper {
    pub fn reset(&mut self) {
        self.x.reset();
        self.y.reset();
    }

    pub fn update_and_normalize(&mut self, center: Vector2) -> Vector2 {
        Vector2 {
            x: self.x.update_and_normalize(center.x),
            y: self.y.update_and_normalize(center.y),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PressureSensorValue {
    pub position: Vector2,
    pub raw_value: u16,
    pub scaled_value: f64,
    pub normalized_value: f64,
    pub weighted_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PressureData {
    pub sensors: Vec<PressureSensorValue>,
    pub scaled_sum: f64,
    pub normalized_sum: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub center: Option<Vector2>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalized_center: Option<Vector2>,
}

/// Stateful pressure decoder; ranges persist across samples.
#[derive(Debug, Clone, Default)]
pub struct PressureAggregator {
    positions: Vec<Vector2>,
    ranges: Vec<RangeHelper>,
    center: CenterOfPressureHelper,
}

impl PressureAggregator {
    pub fn positions(&self) -> &[Vector2] {
        &self.positions
    }

    pub fn sensor_count(&self) -> usize {
        self.positions.len()
    }

    /// Two bytes per sensor, each coordinate `u8 / 256`. Resets all ranges.
    pub fn parse_positions(&mut self, payload: &[u8]) -> Result<(), Error> {
        let mut r = ByteReader::new(payload, "pressurePositions");
        let mut positions = Vec::with_capacity(payload.len() / 2);
        while !r.is_empty() {
            let x = f64::from(r.u8()?) / 256.0;
            let y = f64::from(r.u8()?) / 256.0;
            positions.push(Vector2 { x, y });
        }
        tracing::debug!(sensors = positions.len(), "pressure positions");
        self.ranges = vec![RangeHelper::default(); positions.len()];
        self.positions = positions;
        self.reset_range();
        Ok(())
    }

    pub fn reset_range(&mut self) {
        self.ranges.iter_mut().for_each(RangeHelper::reset);
        self.center.reset();
    }

    pub fn parse(&mut self, payload: &[u8], scalar: f64) -> Result<PressureData, Error> {
        if payload.len() % 2 != 0 {
            return Err(Error::truncated("pressure", payload.len() + 1, payload.len()));
        }
        let mut r = ByteReader::new(payload, "pressure");
        let count = payload.len() / 2;
        if count > self.positions.len() {
            return Err(Error::validation(
                "pressure",
                format!(
                    "{count} readings but only {} sensor positions known",
                    self.positions.len()
                ),
            ));
        }

        let mut sensors = Vec::with_capacity(count);
        let mut scaled_sum = 0.0;
        let mut normalized_sum = 0.0;
        for (position, range) in self.positions.iter().zip(self.ranges.iter_mut()).take(count) {
            let raw_value = r.u16_le()?;
            let scaled_value = f64::from(raw_value) * scalar;
            let normalized_value = range.update_and_normalize(scaled_value);
            sensors.push(PressureSensorValue {
                position: *position,
                raw_value,
                scaled_value,
                normalized_value,
                weighted_value: 0.0,
            });
            scaled_sum += scaled_value;
            normalized_sum += normalized_value;
        }
        if !self.positions.is_empty() {
            normalized_sum /= f64::from(u32::try_from(self.positions.len()).unwrap_or(u32::MAX));
        }

        let mut center = None;
        let mut normalized_center = None;
        if scaled_sum > 0.0 {
            let mut c = Vector2::default();
            for sensor in &mut sensors {
                sensor.weighted_value = sensor.scaled_value / scaled_sum;
                c.x += sensor.position.x * sensor.weighted_value;
                c.y += sensor.position.y * sensor.weighted_value;
            }
            center = Some(c);
            normalized_center = Some(self.center.update_and_normalize(c));
        }

        Ok(PressureData {
            sensors,
            scaled_sum,
            normalized_sum,
            center,
            normalized_center,
        })
    }
}
