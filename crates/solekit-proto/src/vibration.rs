// ── Vibration ──
//
// `triggerVibration` payload builder. Each configuration becomes
// `[locationBitmask][typeIndex][dataLen][data]`; several configurations are
// concatenated into one message.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

use crate::error::Error;

pub const MAX_WAVEFORM_EFFECT_SEGMENTS: usize = 8;
pub const MAX_WAVEFORM_EFFECT_SEGMENT_DELAY_MS: u16 = 1270;
pub const MAX_WAVEFORM_EFFECT_SEGMENT_LOOP_COUNT: u8 = 3;
pub const MAX_WAVEFORM_EFFECT_SEQUENCE_LOOP_COUNT: u8 = 6;
pub const MAX_WAVEFORM_SEGMENTS: usize = 20;
pub const MAX_WAVEFORM_SEGMENT_DURATION_MS: u16 = 2550;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter)]
#[repr(u8)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum VibrationLocation {
    Front,
    Rear,
}

impl VibrationLocation {
    #[allow(clippy::as_conversions)]
    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[repr(u8)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum VibrationType {
    WaveformEffect,
    Waveform,
}

/// Index into the haptic driver's effect library. `0` plays nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WaveformEffect(pub u8);

impl WaveformEffect {
    pub const NONE: Self = Self(0);
    pub const MAX: u8 = 123;

    fn validate(self) -> Result<(), Error> {
        if self.0 > Self::MAX {
            return Err(Error::validation(
                "waveform effect",
                format!("must be {} or less (got {})", Self::MAX, self.0),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EffectStep {
    Effect(WaveformEffect),
    /// Silence, in milliseconds.
    Delay(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaveformEffectSegment {
    #[serde(flatten)]
    pub step: EffectStep,
    #[serde(default)]
    pub loop_count: u8,
}

impl WaveformEffectSegment {
    pub fn effect(effect: u8) -> Self {
        Self {
            step: EffectStep::Effect(WaveformEffect(effect)),
            loop_count: 0,
        }
    }

    pub fn delay(delay_ms: u16) -> Self {
        Self {
            step: EffectStep::Delay(delay_ms),
            loop_count: 0,
        }
    }

    #[must_use]
    pub fn looped(mut self, loop_count: u8) -> Self {
        self.loop_count = loop_count;
        self
    }

    fn validate(&self) -> Result<(), Error> {
        match self.step {
            EffectStep::Effect(effect) => effect.validate()?,
            EffectStep::Delay(delay) if delay > MAX_WAVEFORM_EFFECT_SEGMENT_DELAY_MS => {
                return Err(Error::validation(
                    "waveform effect delay",
                    format!("must be {MAX_WAVEFORM_EFFECT_SEGMENT_DELAY_MS}ms or less (got {delay})"),
                ));
            }
            EffectStep::Delay(_) => {}
        }
        if self.loop_count > MAX_WAVEFORM_EFFECT_SEGMENT_LOOP_COUNT {
            return Err(Error::validation(
                "waveform effect loop count",
                format!(
                    "must be {MAX_WAVEFORM_EFFECT_SEGMENT_LOOP_COUNT} or fewer (got {})",
                    self.loop_count
                ),
            ));
        }
        Ok(())
    }

    fn encode(&self) -> Result<u8, Error> {
        match self.step {
            EffectStep::Effect(effect) => Ok(effect.0),
            EffectStep::Delay(delay) => {
                let tenths = u8::try_from(delay / 10).map_err(|_| {
                    Error::validation("waveform effect delay", format!("{delay}ms out of range"))
                })?;
                Ok(0x80 | tenths)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaveformSegment {
    /// 0.0 to 1.0
    pub amplitude: f32,
    pub duration_ms: u16,
}

impl WaveformSegment {
    fn validate(&self) -> Result<(), Error> {
        if !(0.0..=1.0).contains(&self.amplitude) {
            return Err(Error::validation(
                "waveform amplitude",
                format!("must be between 0 and 1 (got {})", self.amplitude),
            ));
        }
        if self.duration_ms == 0 || self.duration_ms > MAX_WAVEFORM_SEGMENT_DURATION_MS {
            return Err(Error::validation(
                "waveform duration",
                format!(
                    "must be greater than 0ms and at most {MAX_WAVEFORM_SEGMENT_DURATION_MS}ms (got {})",
                    self.duration_ms
                ),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum VibrationPattern {
    #[serde(rename_all = "camelCase")]
    WaveformEffect {
        segments: Vec<WaveformEffectSegment>,
        #[serde(default)]
        loop_count: u8,
    },
    Waveform { segments: Vec<WaveformSegment> },
}

impl VibrationPattern {
    pub fn vibration_type(&self) -> VibrationType {
        match self {
            Self::WaveformEffect { .. } => VibrationType::WaveformEffect,
            Self::Waveform { .. } => VibrationType::Waveform,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VibrationConfiguration {
    /// Empty means every location.
    #[serde(default)]
    pub locations: Vec<VibrationLocation>,
    #[serde(flatten)]
    pub pattern: VibrationPattern,
}

impl VibrationConfiguration {
    pub fn new(pattern: VibrationPattern) -> Self {
        Self {
            locations: Vec::new(),
            pattern,
        }
    }

    #[must_use]
    pub fn at(mut self, locations: impl IntoIterator<Item = VibrationLocation>) -> Self {
        self.locations = locations.into_iter().collect();
        self
    }

    fn location_bitmask(&self) -> u8 {
        if self.locations.is_empty() {
            return VibrationLocation::iter().fold(0, |mask, l| mask | l.bit());
        }
        self.locations.iter().fold(0, |mask, l| mask | l.bit())
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let data = match &self.pattern {
            VibrationPattern::WaveformEffect {
                segments,
                loop_count,
            } => encode_waveform_effect(segments, *loop_count)?,
            VibrationPattern::Waveform { segments } => encode_waveform(segments)?,
        };
        let len = u8::try_from(data.len()).map_err(|_| Error::PayloadTooLarge {
            len: data.len(),
            max: usize::from(u8::MAX),
        })?;

        #[allow(clippy::as_conversions)]
        let type_index = self.pattern.vibration_type() as u8;

        let mut out = Vec::with_capacity(3 + data.len());
        out.push(self.location_bitmask());
        out.push(type_index);
        out.push(len);
        out.extend_from_slice(&data);
        Ok(out)
    }
}

fn encode_waveform_effect(segments: &[WaveformEffectSegment], sequence_loop_count: u8) -> Result<Vec<u8>, Error> {
    if segments.is_empty() || segments.len() > MAX_WAVEFORM_EFFECT_SEGMENTS {
        return Err(Error::validation(
            "waveform effect segments",
            format!(
                "must have between 1 and {MAX_WAVEFORM_EFFECT_SEGMENTS} segments (got {})",
                segments.len()
            ),
        ));
    }
    if sequence_loop_count > MAX_WAVEFORM_EFFECT_SEQUENCE_LOOP_COUNT {
        return Err(Error::validation(
            "waveform effect sequence loop count",
            format!("must be {MAX_WAVEFORM_EFFECT_SEQUENCE_LOOP_COUNT} or fewer (got {sequence_loop_count})"),
        ));
    }
    for segment in segments {
        segment.validate()?;
    }

    let any_looped = segments.iter().any(|s| s.loop_count > 0);
    let effect_count = if any_looped || sequence_loop_count != 0 {
        MAX_WAVEFORM_EFFECT_SEGMENTS
    } else {
        segments.len()
    };
    let loop_count_slots = if sequence_loop_count != 0 {
        MAX_WAVEFORM_EFFECT_SEGMENTS
    } else {
        segments.len()
    };

    let mut data = Vec::with_capacity(effect_count + 3);
    for index in 0..effect_count {
        match segments.get(index) {
            Some(segment) => data.push(segment.encode()?),
            None => data.push(WaveformEffect::NONE.0),
        }
    }

    let mut packed = vec![0u8; loop_count_slots.div_ceil(4)];
    for (index, segment) in segments.iter().enumerate().take(loop_count_slots) {
        packed[index / 4] |= segment.loop_count << (2 * (index % 4));
    }
    data.extend_from_slice(&packed);

    if sequence_loop_count != 0 {
        data.push(sequence_loop_count);
    }
    Ok(data)
}

fn encode_waveform(segments: &[WaveformSegment]) -> Result<Vec<u8>, Error> {
    if segments.is_empty() || segments.len() > MAX_WAVEFORM_SEGMENTS {
        return Err(Error::validation(
            "waveform segments",
            format!(
                "must have between 1 and {MAX_WAVEFORM_SEGMENTS} segments (got {})",
                segments.len()
            ),
        ));
    }
    let mut data = Vec::with_capacity(segments.len() * 2);
    for segment in segments {
        segment.validate()?;
        #[allow(
            clippy::as_conversions,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let amplitude = (segment.amplitude * 127.0).floor() as u8;
        let duration = u8::try_from(segment.duration_ms / 10).map_err(|_| {
            Error::validation("waveform duration", format!("{}ms out of range", segment.duration_ms))
        })?;
        data.push(amplitude);
        data.push(duration);
    }
    Ok(data)
}

/// Build the full `triggerVibration` payload.
pub fn encode_trigger(configurations: &[VibrationConfiguration]) -> Result<Vec<u8>, Error> {
    if configurations.is_empty() {
        return Err(Error::validation("vibration", "no configurations given"));
    }
    let mut out = Vec::new();
    for configuration in configurations {
        out.extend(configuration.encode()?);
    }
    Ok(out)
}
