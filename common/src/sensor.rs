use std::ops::RangeInclusive;

use log::{info, warn};

use crate::{
    error::SensorError,
    types::{Channel, Reading},
};

pub const TEMPERATURE_RANGE_C: RangeInclusive<f32> = -40.0..=80.0;
pub const HUMIDITY_RANGE_PCT: RangeInclusive<f32> = 0.0..=100.0;
pub const LUX_RANGE: RangeInclusive<f32> = 0.0..=65_535.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClimateSample {
    pub temperature_c: f32,
    pub humidity_pct: f32,
}

pub trait EnvironmentSensors {
    fn read_temperature_humidity(&mut self) -> Result<ClimateSample, SensorError>;
    fn read_light(&mut self) -> Result<f32, SensorError>;
}

pub fn check_range(
    channel: Channel,
    value: f32,
    range: RangeInclusive<f32>,
) -> Result<f32, SensorError> {
    if value.is_nan() {
        return Err(SensorError::NotANumber { channel });
    }
    if !value.is_finite() || !range.contains(&value) {
        return Err(SensorError::OutOfRange { channel, value });
    }
    Ok(value)
}

pub fn validate_climate(temperature_c: f32, humidity_pct: f32) -> Result<ClimateSample, SensorError> {
    Ok(ClimateSample {
        temperature_c: check_range(Channel::Temperature, temperature_c, TEMPERATURE_RANGE_C)?,
        humidity_pct: check_range(Channel::Humidity, humidity_pct, HUMIDITY_RANGE_PCT)?,
    })
}

pub fn validate_lux(lux: f32) -> Result<f32, SensorError> {
    check_range(Channel::Lux, lux, LUX_RANGE)
}

// The DHT pair is all-or-nothing.
pub fn sample_all<S: EnvironmentSensors + ?Sized>(sensors: &mut S) -> [Reading; 3] {
    let (temperature, humidity) = match sensors
        .read_temperature_humidity()
        .and_then(|sample| validate_climate(sample.temperature_c, sample.humidity_pct))
    {
        Ok(sample) => {
            info!(
                "[DHT22] Temperature: {:.2}°C, Humidity: {:.2}%",
                sample.temperature_c, sample.humidity_pct
            );
            (
                Reading::valid(Channel::Temperature, sample.temperature_c),
                Reading::valid(Channel::Humidity, sample.humidity_pct),
            )
        }
        Err(err) => {
            warn!("failed to read from DHT sensor: {err}");
            (
                Reading::invalid(Channel::Temperature),
                Reading::invalid(Channel::Humidity),
            )
        }
    };

    let lux = match sensors.read_light().and_then(validate_lux) {
        Ok(lux) => {
            info!("[BH1750] Light Intensity: {lux:.2} lux");
            Reading::valid(Channel::Lux, lux)
        }
        Err(err) => {
            warn!("failed to read from BH1750 sensor: {err}");
            Reading::invalid(Channel::Lux)
        }
    };

    [temperature, humidity, lux]
}
