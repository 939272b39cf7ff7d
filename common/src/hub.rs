use std::{
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use log::debug;
use thiserror::Error;

use crate::sensor::{SensorError, SensorId, SensorSource, SensorValue};

// `SHUB: T <temp> H <humidity>`, temperature in tenths of a degree Celsius,
// humidity in percent.
const LINE_PREFIX: &str = "SHUB:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubReading {
    pub temp_decicelsius: i32,
    pub humidity_pct: u8,
}

impl HubReading {
    pub fn temperature(&self) -> SensorValue {
        SensorValue::new(
            self.temp_decicelsius / 10,
            (self.temp_decicelsius % 10) * 100_000,
        )
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HubParseError {
    #[error("not a sensor hub line")]
    NotHubLine,
    #[error("malformed sensor hub line: {0}")]
    Malformed(&'static str),
}

pub fn parse_hub_line(line: &str) -> Result<HubReading, HubParseError> {
    let rest = line
        .trim()
        .strip_prefix(LINE_PREFIX)
        .ok_or(HubParseError::NotHubLine)?;

    let mut fields = rest.split_whitespace();
    if fields.next() != Some("T") {
        return Err(HubParseError::Malformed("missing temperature tag"));
    }
    let temp_decicelsius = fields
        .next()
        .and_then(|value| value.parse::<i32>().ok())
        .filter(|value| (-999..=999).contains(value))
        .ok_or(HubParseError::Malformed("bad temperature"))?;

    if fields.next() != Some("H") {
        return Err(HubParseError::Malformed("missing humidity tag"));
    }
    let humidity_pct = fields
        .next()
        .and_then(|value| value.parse::<u8>().ok())
        .filter(|value| *value <= 100)
        .ok_or(HubParseError::Malformed("bad humidity"))?;

    if fields.next().is_some() {
        return Err(HubParseError::Malformed("trailing data"));
    }

    Ok(HubReading {
        temp_decicelsius,
        humidity_pct,
    })
}

#[derive(Debug, Clone)]
pub struct SensorHub {
    latest: Arc<Mutex<Option<(HubReading, Instant)>>>,
    max_age: Duration,
}

impl SensorHub {
    pub fn new(max_age: Duration) -> Self {
        Self {
            latest: Arc::new(Mutex::new(None)),
            max_age,
        }
    }

    pub fn feed_line(&self, line: &str) -> Result<HubReading, HubParseError> {
        match parse_hub_line(line) {
            Ok(reading) => {
                debug!(
                    "sensor hub temp: {}, humidity: {}",
                    reading.temperature(),
                    reading.humidity_pct
                );
                *self.latest.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some((reading, Instant::now()));
                Ok(reading)
            }
            Err(err) => {
                debug!("invalid sensor hub data {line:?}: {err}");
                Err(err)
            }
        }
    }

    pub fn latest(&self) -> Option<HubReading> {
        self.fresh_at(Instant::now())
    }

    fn fresh_at(&self, now: Instant) -> Option<HubReading> {
        let (reading, received) = (*self.latest.lock().unwrap_or_else(PoisonError::into_inner))?;
        let age = now.saturating_duration_since(received);
        if age > self.max_age {
            debug!("sensor hub silent for {age:?}, dropping stale reading");
            return None;
        }
        Some(reading)
    }
}

impl SensorSource for SensorHub {
    fn read(&mut self, id: SensorId) -> Result<Option<SensorValue>, SensorError> {
        match id {
            SensorId::OffchipTemp => Ok(self.latest().map(|reading| reading.temperature())),
            SensorId::McuTemp => Ok(None),
        }
    }
}
