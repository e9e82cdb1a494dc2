//! Pseudo device that generates synthetic data.
//!
//! Stands in for a real interface when no hardware driver is selected. It is
//! always attached, echoes the requested channels back as its negotiated
//! configuration, and produces one noisy sine sample per channel per read
//! while running.

use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use super::{DeviceConfig, DeviceFactory, SensorDevice};
use crate::sensor::{ExperimentConfig, ExperimentRequest, QuantityType, SensorConfig};

const DEVICE_NAME: &str = "Pseudo Sensor Interface";

/// Simulated sensor interface.
pub struct PseudoDevice {
    rng: StdRng,
    sensors: Vec<SensorConfig>,
    running: bool,
    closed: bool,
    phase: f64,
}

impl Default for PseudoDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl PseudoDevice {
    /// Device seeded from system entropy.
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Deterministic noise, for reproducible runs.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            rng,
            sensors: vec![auto_id_sensor(QuantityType::Temperature, 0)],
            running: false,
            closed: false,
            phase: 0.0,
        }
    }

    /// Whether acquisition has been started and not stopped.
    pub fn is_running(&self) -> bool {
        self.running
    }

    fn config(&self, period: f32) -> ExperimentConfig {
        ExperimentConfig {
            device_name: DEVICE_NAME.to_string(),
            valid: true,
            period,
            data_read_period: period,
            sensors: self.sensors.clone(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            bail!("{} has been closed", DEVICE_NAME);
        }
        Ok(())
    }
}

fn auto_id_sensor(quantity: QuantityType, port: i32) -> SensorConfig {
    let (name, unit) = match quantity {
        QuantityType::Unknown | QuantityType::Temperature => ("Temperature", "degC"),
        QuantityType::Light => ("Light", "lux"),
        QuantityType::Distance => ("Motion", "m"),
        QuantityType::Force => ("Force", "N"),
        QuantityType::Co2Gas => ("CO2 Gas", "ppm"),
        QuantityType::OxygenGas => ("O2 Gas", "%"),
        QuantityType::Ph => ("pH", "pH"),
    };
    let quantity = match quantity {
        QuantityType::Unknown => QuantityType::Temperature,
        other => other,
    };
    SensorConfig {
        quantity,
        port,
        name: name.to_string(),
        unit: unit.to_string(),
        step_size: 0.1,
    }
}

impl SensorDevice for PseudoDevice {
    fn is_attached(&mut self) -> Result<bool> {
        self.ensure_open()?;
        Ok(true)
    }

    fn current_config(&mut self) -> Result<Option<ExperimentConfig>> {
        self.ensure_open()?;
        Ok(Some(self.config(0.1)))
    }

    fn configure(&mut self, request: &ExperimentRequest) -> Result<Option<ExperimentConfig>> {
        self.ensure_open()?;
        if !request.sensor_requests.is_empty() {
            self.sensors = request
                .sensor_requests
                .iter()
                .enumerate()
                .map(|(slot, sensor)| {
                    let mut config = auto_id_sensor(sensor.quantity(), slot as i32);
                    config.step_size = sensor.step_size();
                    config
                })
                .collect();
        }
        debug!(channels = self.sensors.len(), period = request.period, "Pseudo device configured");
        Ok(Some(self.config(request.period)))
    }

    fn start(&mut self) -> Result<bool> {
        self.ensure_open()?;
        self.running = true;
        info!("Pseudo device started");
        Ok(true)
    }

    fn read(&mut self, values: &mut [f32], offset: usize, channel_count: usize) -> Result<usize> {
        self.ensure_open()?;
        if !self.running || channel_count == 0 {
            return Ok(0);
        }
        let Some(slots) = values.get_mut(offset..offset + channel_count) else {
            bail!("read buffer too small for {} channels", channel_count);
        };

        self.phase += 0.1;
        for (channel, slot) in slots.iter_mut().enumerate() {
            let noise: f64 = self.rng.gen_range(-0.05..0.05);
            *slot = ((self.phase + channel as f64).sin() + noise) as f32;
        }
        Ok(1)
    }

    fn stop(&mut self, _flush: bool) -> Result<()> {
        self.running = false;
        info!("Pseudo device stopped");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.running = false;
        self.closed = true;
        Ok(())
    }
}

/// Creates a [`PseudoDevice`] for any configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct PseudoDeviceFactory;

impl DeviceFactory for PseudoDeviceFactory {
    fn create_device(&self, config: &DeviceConfig) -> Result<Box<dyn SensorDevice>> {
        info!(device_id = %config.device_id, open_string = ?config.open_string, "Opening pseudo device");
        Ok(Box::new(PseudoDevice::new()))
    }
}
