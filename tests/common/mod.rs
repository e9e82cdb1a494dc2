//! Shared helpers for session integration tests
#![allow(dead_code)]

use anyhow::{anyhow, bail, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use sensor_bridge::device::{DeviceConfig, DeviceFactory, SensorDevice};
use sensor_bridge::sensor::{ExperimentConfig, ExperimentRequest, QuantityType, SensorConfig};
use sensor_bridge::{DeviceSessionController, SessionOptions};

/// One programmed read result.
#[derive(Debug, Clone, PartialEq)]
pub enum Read {
    /// Interleaved values; the device reports `len / channel_count` samples
    Samples(Vec<f32>),
    /// No data ready
    Empty,
    /// Read error
    Fault,
}

/// Programmable behaviour and call counters shared by a factory and the
/// devices it creates.
#[derive(Debug)]
pub struct Script {
    pub attached: bool,
    pub fail_create: bool,
    pub fail_configure: bool,
    pub configure_returns_none: bool,
    pub start_result: bool,
    pub reads: VecDeque<Read>,
    /// Used once `reads` is drained
    pub idle_read: Read,
    /// How long `start` takes
    pub start_delay: Duration,
    /// Per-read delays, consumed one per read
    pub read_jitter: VecDeque<Duration>,

    pub created: u32,
    pub configured: u32,
    pub started: u32,
    pub stopped: u32,
    pub closed: u32,
    pub reads_taken: u32,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            attached: true,
            fail_create: false,
            fail_configure: false,
            configure_returns_none: false,
            start_result: true,
            reads: VecDeque::new(),
            idle_read: Read::Empty,
            start_delay: Duration::ZERO,
            read_jitter: VecDeque::new(),
            created: 0,
            configured: 0,
            started: 0,
            stopped: 0,
            closed: 0,
            reads_taken: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScriptHandle(Arc<Mutex<Script>>);

impl ScriptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, Script> {
        self.0.lock().unwrap()
    }

    pub fn factory(&self) -> ScriptedFactory {
        ScriptedFactory(self.clone())
    }
}

pub struct ScriptedFactory(ScriptHandle);

impl DeviceFactory for ScriptedFactory {
    fn create_device(&self, _config: &DeviceConfig) -> Result<Box<dyn SensorDevice>> {
        let mut script = self.0.lock();
        if script.fail_create {
            bail!("driver library not found");
        }
        script.created += 1;
        Ok(Box::new(ScriptedDevice(self.0.clone())))
    }
}

/// Stub device driven by a [`Script`].
pub struct ScriptedDevice(ScriptHandle);

fn reported_config(request: Option<&ExperimentRequest>) -> ExperimentConfig {
    let (period, sensors) = match request {
        Some(request) => (
            request.period,
            request
                .sensor_requests
                .iter()
                .enumerate()
                .map(|(port, sensor)| SensorConfig {
                    quantity: sensor.quantity(),
                    port: port as i32,
                    name: sensor.quantity().to_string(),
                    unit: String::new(),
                    step_size: sensor.step_size(),
                })
                .collect(),
        ),
        None => (
            0.1,
            vec![SensorConfig {
                quantity: QuantityType::Temperature,
                port: 0,
                name: "Temperature".to_string(),
                unit: "degC".to_string(),
                step_size: 0.1,
            }],
        ),
    };
    ExperimentConfig {
        device_name: "Scripted".to_string(),
        valid: true,
        period,
        data_read_period: period,
        sensors,
    }
}

impl SensorDevice for ScriptedDevice {
    fn is_attached(&mut self) -> Result<bool> {
        Ok(self.0.lock().attached)
    }

    fn current_config(&mut self) -> Result<Option<ExperimentConfig>> {
        Ok(Some(reported_config(None)))
    }

    fn configure(&mut self, request: &ExperimentRequest) -> Result<Option<ExperimentConfig>> {
        let mut script = self.0.lock();
        script.configured += 1;
        if script.fail_configure {
            bail!("sensor not responding");
        }
        if script.configure_returns_none {
            return Ok(None);
        }
        Ok(Some(reported_config(Some(request))))
    }

    fn start(&mut self) -> Result<bool> {
        let delay = self.0.lock().start_delay;
        thread::sleep(delay);
        let mut script = self.0.lock();
        script.started += 1;
        Ok(script.start_result)
    }

    fn read(&mut self, values: &mut [f32], offset: usize, channel_count: usize) -> Result<usize> {
        let jitter = self.0.lock().read_jitter.pop_front();
        if let Some(delay) = jitter {
            thread::sleep(delay);
        }
        let mut script = self.0.lock();
        script.reads_taken += 1;
        let next = script
            .reads
            .pop_front()
            .unwrap_or_else(|| script.idle_read.clone());
        match next {
            Read::Samples(batch) => {
                values[offset..offset + batch.len()].copy_from_slice(&batch);
                Ok(batch.len() / channel_count.max(1))
            }
            Read::Empty => Ok(0),
            Read::Fault => Err(anyhow!("read timed out")),
        }
    }

    fn stop(&mut self, _flush: bool) -> Result<()> {
        self.0.lock().stopped += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.0.lock().closed += 1;
        Ok(())
    }
}

/// Options with no initial delay, so sampling begins right away.
pub fn fast_options() -> SessionOptions {
    SessionOptions {
        initial_delay: Duration::ZERO,
        ..SessionOptions::default()
    }
}

pub fn scripted_session(script: &ScriptHandle) -> DeviceSessionController {
    DeviceSessionController::new(
        "manual",
        script.factory(),
        std::collections::HashMap::<String, String>::new(),
        fast_options(),
    )
    .unwrap()
}

/// Delivered batches as `(num_samples, channel_count, samples)`.
pub type Delivered = Arc<Mutex<Vec<(usize, usize, Vec<f32>)>>>;

pub fn recorder() -> (
    Delivered,
    impl FnMut(usize, usize, Vec<f32>) + Send + 'static,
) {
    let delivered: Delivered = Arc::default();
    let sink_delivered = Arc::clone(&delivered);
    let sink = move |n: usize, c: usize, samples: Vec<f32>| {
        sink_delivered.lock().unwrap().push((n, c, samples));
    };
    (delivered, sink)
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
