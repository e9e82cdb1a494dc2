//! Sensor channel and experiment data model.
//!
//! A session asks the device for an ordered set of [`SensorRequest`]s; the
//! device answers with the [`ExperimentConfig`] it will actually use. Channel
//! order is significant: it maps to the physical read slots of each sample.

pub mod catalog;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// The physical phenomenon a channel measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantityType {
    /// Not configured; lets the device pick whatever is attached.
    #[default]
    Unknown,
    /// Temperature in degrees Celsius.
    Temperature,
    /// Illuminance.
    Light,
    /// Distance or position.
    Distance,
    /// Force in newtons.
    Force,
    /// Carbon dioxide concentration.
    Co2Gas,
    /// Oxygen concentration.
    OxygenGas,
    /// Acidity.
    Ph,
}

impl fmt::Display for QuantityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Temperature => write!(f, "temperature"),
            Self::Light => write!(f, "light"),
            Self::Distance => write!(f, "distance"),
            Self::Force => write!(f, "force"),
            Self::Co2Gas => write!(f, "CO2 gas"),
            Self::OxygenGas => write!(f, "O2 gas"),
            Self::Ph => write!(f, "pH"),
        }
    }
}

/// One requested input channel.
///
/// Immutable once built; construct with [`SensorRequest::new`] or take a
/// preset from [`catalog::sensor_request_for`].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SensorRequest {
    quantity: QuantityType,
    display_precision: i32,
    required_min: f32,
    required_max: f32,
    port: i32,
    step_size: f32,
}

impl SensorRequest {
    /// Build a request.
    ///
    /// # Arguments
    /// * `display_precision` - power-of-ten exponent of the displayed resolution
    /// * `required_min`, `required_max` - inclusive acquisition range
    /// * `port` - logical connector index; -1/0/1 are device specific
    /// * `step_size` - minimum resolvable increment
    pub const fn new(
        quantity: QuantityType,
        display_precision: i32,
        required_min: f32,
        required_max: f32,
        port: i32,
        step_size: f32,
    ) -> Self {
        Self {
            quantity,
            display_precision,
            required_min,
            required_max,
            port,
            step_size,
        }
    }

    /// Measured quantity.
    pub fn quantity(&self) -> QuantityType {
        self.quantity
    }

    /// Exponent of the displayed resolution.
    pub fn display_precision(&self) -> i32 {
        self.display_precision
    }

    /// Lower bound of the acquisition range.
    pub fn required_min(&self) -> f32 {
        self.required_min
    }

    /// Upper bound of the acquisition range.
    pub fn required_max(&self) -> f32 {
        self.required_max
    }

    /// Connector index.
    pub fn port(&self) -> i32 {
        self.port
    }

    /// Minimum resolvable increment.
    pub fn step_size(&self) -> f32 {
        self.step_size
    }
}

/// What the session asks the device to acquire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRequest {
    /// Requested sampling period in seconds.
    pub period: f32,
    /// `None` for continuous acquisition.
    pub number_of_samples: Option<u32>,
    /// Channels in read-slot order.
    pub sensor_requests: Vec<SensorRequest>,
}

/// A channel as reported by the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Measured quantity.
    pub quantity: QuantityType,
    /// Connector the sensor is plugged into.
    pub port: i32,
    /// Sensor name as reported by the driver.
    pub name: String,
    /// Unit of the sampled values.
    pub unit: String,
    /// Resolution of the sampled values.
    pub step_size: f32,
}

/// Configuration negotiated with (or reported by) the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Name of the interface.
    pub device_name: String,
    /// Whether the device accepted the configuration.
    pub valid: bool,
    /// Sampling period in seconds.
    pub period: f32,
    /// How often the host should read buffered samples, in seconds.
    pub data_read_period: f32,
    /// Channels in read-slot order.
    pub sensors: Vec<SensorConfig>,
}

impl ExperimentConfig {
    /// Number of channels per sample.
    pub fn channel_count(&self) -> usize {
        self.sensors.len()
    }

    /// Tick spacing for reads: the data read period floored to whole
    /// milliseconds, never below 1 ms.
    pub fn read_interval(&self) -> Duration {
        let millis = (self.data_read_period * 1000.0).floor();
        if millis.is_finite() && millis >= 1.0 {
            Duration::from_millis(millis as u64)
        } else {
            Duration::from_millis(1)
        }
    }
}

impl fmt::Display for ExperimentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Device: {}", self.device_name)?;
        writeln!(f, "  valid: {}", self.valid)?;
        writeln!(f, "  period: {}s", self.period)?;
        write!(f, "  data read period: {}s", self.data_read_period)?;
        for (slot, sensor) in self.sensors.iter().enumerate() {
            write!(
                f,
                "\n  [{}] {} on port {} ({}, unit {}, step {})",
                slot, sensor.quantity, sensor.port, sensor.name, sensor.unit, sensor.step_size
            )?;
        }
        Ok(())
    }
}
