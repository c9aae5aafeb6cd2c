//! Sensor rate configuration: `(u8 sensorType, u16 LE rate)` records.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

use super::SensorType;
use crate::error::Error;
use crate::message::MessageKind;
use crate::reader::ByteReader;

/// Rates must be multiples of this many milliseconds.
pub const SENSOR_RATE_STEP: u16 = 5;
/// Exclusive upper bound on a rate.
pub const MAX_SENSOR_RATE: u16 = u16::MAX;

const RECORD_LEN: usize = 3;

/// Sample interval in milliseconds per sensor; 0 disables a sensor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensorConfiguration(pub BTreeMap<SensorType, u16>);

impl SensorConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sensor: SensorType, rate: u16) -> Self {
        self.0.insert(sensor, rate);
        self
    }

    /// Every listed sensor disabled.
    pub fn zeroed(sensors: impl IntoIterator<Item = SensorType>) -> Self {
        Self(sensors.into_iter().map(|s| (s, 0)).collect())
    }

    pub fn get(&self, sensor: SensorType) -> Option<u16> {
        self.0.get(&sensor).copied()
    }

    pub fn sensors(&self) -> BTreeSet<SensorType> {
        self.0.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Overlay `other` on top of `self`.
    pub fn merged(&self, other: &Self) -> Self {
        let mut out = self.clone();
        out.0.extend(other.0.iter().map(|(k, v)| (*k, *v)));
        out
    }

    /// True when every rate in `request` already matches `self`.
    pub fn contains_all(&self, request: &Self) -> bool {
        request.0.iter().all(|(k, v)| self.0.get(k) == Some(v))
    }

    pub fn parse(payload: &[u8]) -> Result<Self, Error> {
        let mut r = ByteReader::new(payload, "sensorConfiguration");
        let mut out = BTreeMap::new();
        while !r.is_empty() {
            let index = r.u8()?;
            let rate = r.u16_le()?;
            match SensorType::from_index(index) {
                Some(sensor) => {
                    out.insert(sensor, rate);
                }
                None => tracing::warn!(index, "unknown sensor type in configuration"),
            }
        }
        Ok(Self(out))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.0.len() * RECORD_LEN);
        for (sensor, rate) in &self.0 {
            out.push(sensor.index());
            out.extend_from_slice(&rate.to_le_bytes());
        }
        out
    }
}

pub fn validate_rate(rate: u16) -> Result<(), Error> {
    if rate >= MAX_SENSOR_RATE {
        return Err(Error::validation(
            "sensor rate",
            format!("must be below {MAX_SENSOR_RATE} (got {rate})"),
        ));
    }
    if rate % SENSOR_RATE_STEP != 0 {
        return Err(Error::validation(
            "sensor rate",
            format!("must be a multiple of {SENSOR_RATE_STEP} (got {rate})"),
        ));
    }
    Ok(())
}

/// Check every rate and drop sensors the device did not advertise.
pub fn prepare_request(
    request: &SensorConfiguration,
    available: &BTreeSet<SensorType>,
) -> Result<SensorConfiguration, Error> {
    let mut out = BTreeMap::new();
    for (sensor, rate) in &request.0 {
        if !available.contains(sensor) {
            tracing::warn!(%sensor, "sensor type not available on this device, skipping");
            continue;
        }
        validate_rate(*rate)?;
        out.insert(*sensor, *rate);
    }
    Ok(SensorConfiguration(out))
}

/// All known sensor types, for building a full zero configuration.
pub fn all_sensors() -> impl Iterator<Item = SensorType> {
    SensorType::iter()
}
