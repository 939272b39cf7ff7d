use std::fmt;

use log::{debug, warn};
use serde::Serialize;
use thiserror::Error;

pub const DEFAULT_MCU_TEMP: SensorValue = SensorValue::new(23, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorId {
    McuTemp,
    OffchipTemp,
}

impl SensorId {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::McuTemp => "mcu-temp",
            Self::OffchipTemp => "offchip-temp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SensorValue {
    pub whole: i32,
    pub micro: i32,
}

impl SensorValue {
    pub const fn new(whole: i32, micro: i32) -> Self {
        Self { whole, micro }
    }

    pub fn from_milli(milli: i64) -> Self {
        let whole = milli / 1000;
        let micro = (milli % 1000) * 1000;
        Self {
            whole: whole.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32,
            micro: micro as i32,
        }
    }

    pub fn as_f64(self) -> f64 {
        f64::from(self.whole) + f64::from(self.micro) / 1_000_000.0
    }
}

impl fmt::Display for SensorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}C", self.as_f64())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SensorError {
    #[error("sample fetch failed: {0}")]
    Fetch(String),
    #[error("channel read failed: {0}")]
    Channel(String),
}

/// Pull-based access to the device's temperature sensors.
///
/// `Ok(None)` means the sensor is not fitted; that is not an error.
pub trait SensorSource: Send {
    fn read(&mut self, id: SensorId) -> Result<Option<SensorValue>, SensorError>;
}

impl<S: SensorSource + ?Sized> SensorSource for Box<S> {
    fn read(&mut self, id: SensorId) -> Result<Option<SensorValue>, SensorError> {
        (**self).read(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensorSample {
    Present(SensorValue),
    Absent(SensorValue),
    Failed(SensorError),
    Missing,
}

impl SensorSample {
    pub fn value(&self) -> Option<SensorValue> {
        match self {
            Self::Present(value) | Self::Absent(value) => Some(*value),
            Self::Failed(_) | Self::Missing => None,
        }
    }

    pub fn is_real(&self) -> bool {
        matches!(self, Self::Present(_))
    }
}

pub fn sample_or_default<S: SensorSource + ?Sized>(
    source: &mut S,
    id: SensorId,
    default: SensorValue,
) -> SensorSample {
    match source.read(id) {
        Ok(Some(value)) => {
            debug!("read {} sensor: {value}", id.as_str());
            SensorSample::Present(value)
        }
        Ok(None) => SensorSample::Absent(default),
        Err(err) => {
            warn!("{} sensor error: {err}", id.as_str());
            SensorSample::Absent(default)
        }
    }
}

pub fn sample_optional<S: SensorSource + ?Sized>(source: &mut S, id: SensorId) -> SensorSample {
    match source.read(id) {
        Ok(Some(value)) => {
            debug!("read {} sensor: {value}", id.as_str());
            SensorSample::Present(value)
        }
        Ok(None) => SensorSample::Missing,
        Err(err) => {
            warn!("{} sensor error: {err}", id.as_str());
            SensorSample::Failed(err)
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoSensors;

impl SensorSource for NoSensors {
    fn read(&mut self, _id: SensorId) -> Result<Option<SensorValue>, SensorError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        mcu: Result<Option<SensorValue>, SensorError>,
        offchip: Result<Option<SensorValue>, SensorError>,
    }

    impl SensorSource for Fixed {
        fn read(&mut self, id: SensorId) -> Result<Option<SensorValue>, SensorError> {
            match id {
                SensorId::McuTemp => self.mcu.clone(),
                SensorId::OffchipTemp => self.offchip.clone(),
            }
        }
    }

    #[test]
    fn primary_sensor_falls_back_to_default() {
        let mut missing = NoSensors;
        let sample = sample_or_default(&mut missing, SensorId::McuTemp, DEFAULT_MCU_TEMP);
        assert_eq!(sample, SensorSample::Absent(SensorValue::new(23, 0)));
        assert!(!sample.is_real());

        let mut failing = Fixed {
            mcu: Err(SensorError::Fetch("bus timeout".into())),
            offchip: Ok(None),
        };
        let sample = sample_or_default(&mut failing, SensorId::McuTemp, DEFAULT_MCU_TEMP);
        assert_eq!(sample.value(), Some(DEFAULT_MCU_TEMP));
    }

    #[test]
    fn secondary_sensor_distinguishes_missing_from_failed() {
        let mut source = Fixed {
            mcu: Ok(Some(SensorValue::new(21, 500_000))),
            offchip: Ok(None),
        };
        assert_eq!(
            sample_optional(&mut source, SensorId::OffchipTemp),
            SensorSample::Missing
        );

        source.offchip = Err(SensorError::Channel("crc mismatch".into()));
        assert!(matches!(
            sample_optional(&mut source, SensorId::OffchipTemp),
            SensorSample::Failed(_)
        ));

        source.offchip = Ok(Some(SensorValue::new(19, 0)));
        assert_eq!(
            sample_optional(&mut source, SensorId::OffchipTemp),
            SensorSample::Present(SensorValue::new(19, 0))
        );
    }

    #[test]
    fn converts_millidegrees() {
        assert_eq!(SensorValue::from_milli(21_500), SensorValue::new(21, 500_000));
        assert_eq!(SensorValue::from_milli(-1_250), SensorValue::new(-1, -250_000));
        assert_eq!(SensorValue::new(21, 500_000).to_string(), "21.50C");
    }
}
