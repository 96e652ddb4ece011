use core::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::IdentityTag;

/// Sensor heads known to the platform, by their EEPROM code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SensorKind {
    /// Time-of-flight rangefinder.
    Tof,
    /// Light meter.
    Osi,
    /// Ultrasonic rangefinder.
    Ult,
    /// DS18B20 thermometer.
    Thr,
}

impl SensorKind {
    pub const ALL: [Self; 4] = [Self::Tof, Self::Osi, Self::Ult, Self::Thr];

    pub fn code(self) -> &'static str {
        match self {
            Self::Tof => "TOF",
            Self::Osi => "OSI",
            Self::Ult => "ULT",
            Self::Thr => "THR",
        }
    }

    pub fn from_tag(tag: &IdentityTag) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| tag.matches(kind.code()))
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SensorError {
    #[error("no sensor found on the bus")]
    NotFound,
    #[error("sensor stopped responding")]
    Disconnected,
    #[error("sensor bus error: {0}")]
    Bus(String),
    #[error("unsupported setting: {0}")]
    InvalidSetting(String),
}

/// Body of a `sensors/{id}/config` message. Every field is optional and
/// only the ones present are applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<u8>,
    /// Experiment length in seconds; 0 runs until stopped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
}

pub trait Sensor {
    type Reading;

    fn kind(&self) -> SensorKind;
    fn read(&mut self) -> Result<Self::Reading, SensorError>;
    fn configure(&mut self, settings: &SensorSettings) -> Result<(), SensorError>;
}

pub const MIN_RESOLUTION_BITS: u8 = 9;
pub const MAX_RESOLUTION_BITS: u8 = 12;

/// Worst-case DS18B20 conversion time for a resolution.
pub fn conversion_time_ms(resolution_bits: u8) -> u32 {
    match resolution_bits {
        9 => 94,
        10 => 188,
        11 => 375,
        _ => 750,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Temperature {
    pub celsius: f32,
}

impl Temperature {
    pub fn fahrenheit(self) -> f32 {
        self.celsius * 9.0 / 5.0 + 32.0
    }

    pub fn kelvin(self) -> f32 {
        self.celsius + 273.15
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn kind_follows_tag_code() {
        let tag = IdentityTag::parse("THR").unwrap();
        assert_eq!(SensorKind::from_tag(&tag), Some(SensorKind::Thr));
        assert_eq!(
            SensorKind::from_tag(&IdentityTag::parse("XYZ").unwrap()),
            None
        );
    }

    #[test]
    fn settings_accept_partial_payloads() {
        let settings: SensorSettings = serde_json::from_str(r#"{"resolution":11}"#).unwrap();
        assert_eq!(
            settings,
            SensorSettings {
                resolution: Some(11),
                duration: None
            }
        );
    }

    #[test]
    fn temperature_scales() {
        let reading = Temperature { celsius: 25.0 };
        assert!((reading.fahrenheit() - 77.0).abs() < 1e-4);
        assert!((reading.kelvin() - 298.15).abs() < 1e-3);
        assert_eq!(conversion_time_ms(9), 94);
        assert_eq!(conversion_time_ms(12), 750);
    }
}
