//! Device session controller.
//!
//! Orchestrates one sensor interface through its lifecycle:
//!
//! ```text
//! Idle -> HasDevice -> Configured -> Running -> Configured (stop) -> Closed
//! ```
//!
//! All device work runs on a private [`SessionWorker`]. The device handle, the
//! requested channel set, the negotiated configuration and the collectability
//! cache are owned by that worker; callers only ever see values returned from
//! completed units. Setup, configuration, queries, stop and close block the
//! caller until their unit has run. `start` and the sampling ticks are queued
//! without waiting, so [`DeviceSessionController::is_running`] may briefly
//! report `false` after `start` returns.
//!
//! # Example
//!
//! ```
//! use sensor_bridge::device::pseudo::PseudoDeviceFactory;
//! use sensor_bridge::sensor::catalog::sensor_request_for;
//! use sensor_bridge::session::{DeviceSessionController, SessionOptions};
//! use std::collections::HashMap;
//!
//! let mut session = DeviceSessionController::new(
//!     "pseudo",
//!     PseudoDeviceFactory,
//!     HashMap::new(),
//!     SessionOptions::default(),
//! )?;
//!
//! assert!(session.is_collectable());
//! session.setup(vec![sensor_request_for("temperature")])?;
//! session.start(|n: usize, channels: usize, samples: Vec<f32>| {
//!     assert_eq!(samples.len(), n * channels);
//! })?;
//! session.stop();
//! session.destroy();
//! # Ok::<(), sensor_bridge::error::SessionError>(())
//! ```

pub mod sampler;
pub mod sink;

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::device::{DeviceConfig, DeviceFactory, HostParameters, SensorDevice};
use crate::error::{SessionError, SessionResult};
use crate::sensor::catalog::experiment_request;
use crate::sensor::{ExperimentConfig, SensorRequest};
use crate::worker::{CancelHandle, SessionWorker, WorkerHandle};

use sampler::{SamplingScheduler, TickOutcome};
use sink::SampleSink;

/// Cached answer of the collectability probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Collectability {
    /// Not probed since the device or channel set last changed.
    #[default]
    Unknown,
    /// The interface was attached and reported a configuration.
    Collectable,
    /// The probe failed or found nothing.
    NotCollectable,
}

/// What the configure step of `start` decided.
enum StartPlan {
    AlreadyRunning,
    NoChannels,
    Sample {
        channel_count: usize,
        period: Duration,
    },
}

/// Timing and limits of a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Delay before the first sampling tick.
    pub initial_delay: Duration,
    /// Consecutive failed reads that stop sampling.
    pub max_consecutive_errors: u32,
    /// Scalar slots in the read buffer.
    pub read_buffer_len: usize,
    /// Bound on draining the worker in [`DeviceSessionController::destroy`].
    pub shutdown_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_consecutive_errors: sampler::DEFAULT_MAX_CONSECUTIVE_ERRORS,
            read_buffer_len: sampler::DEFAULT_READ_BUFFER_LEN,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// State owned by the session worker.
struct SessionState {
    device_type: String,
    parameters: Box<dyn HostParameters>,
    factory: Box<dyn DeviceFactory>,
    device: Option<Box<dyn SensorDevice>>,
    channels: Vec<SensorRequest>,
    actual_config: Option<ExperimentConfig>,
    collectable: Collectability,
    sink: Option<Box<dyn SampleSink>>,
    running: Arc<AtomicBool>,
}

impl SessionState {
    fn device(&mut self) -> anyhow::Result<&mut (dyn SensorDevice + 'static)> {
        self.device
            .as_deref_mut()
            .ok_or_else(|| anyhow!("device has not been created"))
    }

    fn set_channels(&mut self, channels: Vec<SensorRequest>) {
        if channels != self.channels {
            self.collectable = Collectability::Unknown;
        }
        self.channels = channels;
    }

    fn ensure_device(&mut self) -> anyhow::Result<()> {
        if self.device.is_some() {
            return Ok(());
        }
        info!(device_type = %self.device_type, "Creating device");
        let config = DeviceConfig::resolve(&self.device_type, self.parameters.as_ref());
        let device = self
            .factory
            .create_device(&config)
            .with_context(|| format!("failed to open {} device", config.device_id))?;
        self.device = Some(device);
        self.collectable = Collectability::Unknown;
        Ok(())
    }

    fn configure(&mut self) -> anyhow::Result<Option<ExperimentConfig>> {
        info!(channels = self.channels.len(), "Configuring device");
        let request = experiment_request(&self.channels);
        let config = self.device()?.configure(&request)?;
        match &config {
            Some(config) => info!("Config to be used:\n{}", config),
            None => warn!("Device returned no configuration"),
        }
        self.actual_config = config.clone();
        Ok(config)
    }

    fn is_attached(&mut self) -> anyhow::Result<bool> {
        debug!("Checking attached");
        match self.device.as_deref_mut() {
            Some(device) => device.is_attached(),
            None => Ok(false),
        }
    }

    fn current_config(&mut self) -> anyhow::Result<Option<ExperimentConfig>> {
        debug!("Getting device config");
        match self.device.as_deref_mut() {
            Some(device) => device.current_config(),
            None => Ok(None),
        }
    }

    fn probe_collectable(&mut self) -> anyhow::Result<bool> {
        self.ensure_device()?;
        if !self.is_attached()? {
            info!("Device says not attached");
            return Ok(false);
        }
        info!("Device reported as attached");
        match self.current_config()? {
            Some(config) => {
                info!("Interface is connected, reported config:\n{}", config);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn start_device(&mut self) {
        match self.device().and_then(|device| device.start()) {
            Ok(running) => {
                info!(running, "Started device");
                self.running.store(running, Ordering::Release);
            }
            Err(e) => {
                error!(error = %format!("{:#}", e), "Failed to start device");
                self.running.store(false, Ordering::Release);
            }
        }
    }

    fn stop_if_running(&mut self) -> anyhow::Result<()> {
        if !self.running.load(Ordering::Acquire) {
            return Ok(());
        }
        self.stop_device()
    }

    fn stop_device(&mut self) -> anyhow::Result<()> {
        info!("Stopping device");
        let result = match self.device.as_deref_mut() {
            Some(device) => device.stop(true),
            None => Ok(()),
        };
        self.running.store(false, Ordering::Release);
        result
    }

    fn close_device(&mut self) {
        if let Some(mut device) = self.device.take() {
            info!("Closing device");
            if let Err(e) = device.close() {
                warn!(error = %format!("{:#}", e), "Device did not close cleanly");
            }
            info!("Device shut down");
        }
        self.actual_config = None;
        self.collectable = Collectability::Unknown;
        self.sink = None;
        self.running.store(false, Ordering::Release);
    }

    fn deliver(&mut self, batch: sampler::SampleBatch) {
        match self.sink.as_mut() {
            Some(sink) => sink.handle_batch(batch),
            None => debug!("No sink installed, dropping batch"),
        }
    }
}

/// Controls one sensor interface through a serialized session worker.
pub struct DeviceSessionController {
    device_type: String,
    options: SessionOptions,
    worker: SessionWorker<SessionState>,
    running: Arc<AtomicBool>,
    collection_task: Option<CancelHandle>,
}

impl DeviceSessionController {
    /// Create a controller for `device_type`. No device is opened yet.
    pub fn new<F, P>(
        device_type: &str,
        factory: F,
        parameters: P,
        options: SessionOptions,
    ) -> SessionResult<Self>
    where
        F: DeviceFactory + 'static,
        P: HostParameters + 'static,
    {
        let running = Arc::new(AtomicBool::new(false));
        let state_running = Arc::clone(&running);
        let state_device_type = device_type.to_string();

        let worker = SessionWorker::spawn(device_type, move || SessionState {
            device_type: state_device_type,
            parameters: Box::new(parameters),
            factory: Box::new(factory),
            device: None,
            channels: Vec::new(),
            actual_config: None,
            collectable: Collectability::Unknown,
            sink: None,
            running: state_running,
        })?;

        Ok(Self {
            device_type: device_type.to_string(),
            options,
            worker,
            running,
            collection_task: None,
        })
    }

    /// Create a controller from loaded configuration.
    pub fn from_config<F>(config: &BridgeConfig, factory: F) -> SessionResult<Self>
    where
        F: DeviceFactory + 'static,
    {
        Self::new(
            &config.device_type,
            factory,
            config.parameters.clone(),
            config.session.options(),
        )
    }

    /// The device type this controller was created for.
    pub fn device_type(&self) -> &str {
        &self.device_type
    }

    /// Whether the device reported running. Lags a just-requested `start`.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Whether [`DeviceSessionController::destroy`] has been called.
    pub fn is_destroyed(&self) -> bool {
        self.worker.is_shut_down()
    }

    /// Hold `channels` as the session's channel set, open the device if
    /// needed and, for a non-empty set, configure it.
    pub fn setup(&self, channels: Vec<SensorRequest>) -> SessionResult<()> {
        let configure = !channels.is_empty();

        self.worker
            .submit_and_wait(move |state| {
                state.set_channels(channels);
                state.ensure_device()
            })
            .map_err(SessionError::create)?;

        if configure {
            self.worker
                .submit_and_wait(|state| state.configure().map(drop))
                .map_err(SessionError::configure)?;
        }
        Ok(())
    }

    /// Configure the held channel set, start the device and begin sampling
    /// into `sink`. Does nothing if already running.
    ///
    /// Returns once configuration has completed; the device start itself is
    /// queued behind it and not waited on.
    pub fn start<K>(&mut self, sink: K) -> SessionResult<()>
    where
        K: SampleSink + 'static,
    {
        if self.is_running() {
            return Ok(());
        }

        self.worker
            .submit_and_wait(|state| state.ensure_device())
            .map_err(SessionError::create)?;

        // Runs after any start unit queued by an earlier call
        let plan = self
            .worker
            .submit_and_wait(|state| {
                if state.running.load(Ordering::Acquire) {
                    return Ok(StartPlan::AlreadyRunning);
                }
                if state.channels.is_empty() {
                    return Ok(StartPlan::NoChannels);
                }
                let config = state
                    .configure()?
                    .ok_or_else(|| anyhow!("device returned no configuration"))?;
                Ok(StartPlan::Sample {
                    channel_count: state.channels.len(),
                    period: config.read_interval(),
                })
            })
            .map_err(SessionError::configure)?;
        let (channel_count, period) = match plan {
            StartPlan::AlreadyRunning => {
                debug!("Device already running, start ignored");
                return Ok(());
            }
            StartPlan::NoChannels => return Err(SessionError::NoChannels),
            StartPlan::Sample {
                channel_count,
                period,
            } => (channel_count, period),
        };

        // stop() cancels this handle; the start unit checks it on both
        // sides of the device start
        if let Some(previous) = self.collection_task.take() {
            previous.cancel();
        }
        let cancel = CancelHandle::new();
        self.collection_task = Some(cancel.clone());

        let spawner = self.worker.handle();
        let scheduler = SamplingScheduler::with_limits(
            channel_count,
            self.options.read_buffer_len,
            self.options.max_consecutive_errors,
        );
        let initial_delay = self.options.initial_delay;

        info!(
            channels = channel_count,
            period_ms = period.as_millis() as u64,
            "Starting sampling"
        );
        self.worker.execute(move |state| {
            if cancel.is_cancelled() {
                debug!("Start superseded by stop");
                return;
            }
            state.sink = Some(Box::new(sink));
            state.start_device();
            if !state.running.load(Ordering::Acquire) {
                cancel.cancel();
                return;
            }
            if cancel.is_cancelled() {
                debug!("Stop arrived while starting, stopping device");
                if let Err(e) = state.stop_device() {
                    warn!(error = %format!("{:#}", e), "Device did not stop cleanly");
                }
                return;
            }
            let tick = sampling_tick(scheduler, spawner.clone());
            if let Err(e) = spawner.schedule_repeating_with(cancel, tick, initial_delay, period) {
                warn!(error = %e, "Could not schedule sampling");
            }
        })?;

        Ok(())
    }

    /// Cancel sampling and, if the device is running, wait for it to stop.
    ///
    /// A start still queued or in progress is waited out first, so the
    /// device is never left running once this returns. Safe to call
    /// repeatedly or before any start.
    pub fn stop(&mut self) {
        let pending = self.collection_task.take();
        if let Some(task) = &pending {
            task.cancel();
        }

        if pending.is_some() || self.is_running() {
            if let Err(e) = self.worker.submit_and_wait(|state| state.stop_if_running()) {
                warn!(error = %e, "Stopping device failed");
            }
        }

        self.running.store(false, Ordering::Release);
    }

    /// Ask the device whether the interface is physically present.
    ///
    /// Faults are logged and reported as not attached.
    pub fn is_attached(&self) -> bool {
        match self.worker.submit_and_wait(|state| state.is_attached()) {
            Ok(attached) => attached,
            Err(e) => {
                warn!(error = %e, "Attachment check failed");
                false
            }
        }
    }

    /// The configuration the device currently reports, regardless of the
    /// requested channel set. `None` if no device exists.
    pub fn get_config(&self) -> SessionResult<Option<ExperimentConfig>> {
        self.worker
            .submit_and_wait(|state| state.current_config())
            .map_err(SessionError::configure)
    }

    /// Whether hardware is present and willing to report a configuration.
    ///
    /// A cached positive answer is reused while a channel set is held.
    /// Otherwise the device is probed, opening it with an empty channel set
    /// if necessary. Any fault during the probe means "not collectable".
    pub fn is_collectable(&self) -> bool {
        info!(device_type = %self.device_type, "Checking for sensor interface");

        let probe = self.worker.submit_and_wait(|state| {
            if !state.channels.is_empty() && state.collectable == Collectability::Collectable {
                return Ok(true);
            }
            let probe = state.probe_collectable();
            state.collectable = match probe {
                Ok(true) => Collectability::Collectable,
                _ => Collectability::NotCollectable,
            };
            probe
        });

        match probe.map_err(SessionError::fault) {
            Ok(collectable) => collectable,
            Err(SessionError::SessionFault(cause)) => {
                warn!(error = %format!("{:#}", cause), "Sensor session fault, not collectable");
                false
            }
            Err(e) => {
                debug!(error = %e, "Collectability probe could not run");
                false
            }
        }
    }

    /// Snapshot of the held channel set.
    pub fn channels(&self) -> SessionResult<Vec<SensorRequest>> {
        self.worker
            .submit_and_wait(|state| Ok(state.channels.clone()))
            .map_err(SessionError::from)
    }

    /// The configuration negotiated by the last configure, if any.
    pub fn actual_config(&self) -> SessionResult<Option<ExperimentConfig>> {
        self.worker
            .submit_and_wait(|state| Ok(state.actual_config.clone()))
            .map_err(SessionError::from)
    }

    /// Stop, then close and discard the device.
    pub fn teardown(&mut self) {
        self.stop();
        if let Err(e) = self.worker.submit_and_wait(|state| {
            state.close_device();
            Ok(())
        }) {
            debug!(error = %e, "Teardown skipped");
        }
    }

    /// Tear down and shut the worker down. The controller is unusable
    /// afterwards: further operations fail fast.
    pub fn destroy(&mut self) {
        if self.worker.is_shut_down() {
            return;
        }
        self.teardown();
        if !self.worker.shutdown(self.options.shutdown_timeout) {
            warn!(device_type = %self.device_type, "Session worker abandoned pending work");
        }
    }
}

impl Drop for DeviceSessionController {
    fn drop(&mut self) {
        if let Some(task) = self.collection_task.take() {
            task.cancel();
        }
        // Runs ahead of the shutdown the worker queues when it is dropped
        let _ = self.worker.execute(|state| {
            if let Err(e) = state.stop_if_running() {
                warn!(error = %format!("{:#}", e), "Stopping device on drop failed");
            }
            state.close_device();
        });
    }
}

/// Build the repeating unit for one sampling run. The scheduler, and with it
/// the consecutive-error count, is dropped when the run ends.
fn sampling_tick(
    mut scheduler: SamplingScheduler,
    spawner: WorkerHandle<SessionState>,
) -> impl FnMut(&mut SessionState) -> ControlFlow<()> + Send + 'static {
    move |state| match scheduler.tick(state.device.as_deref_mut()) {
        TickOutcome::Batch(batch) => {
            // Queued behind this tick, ahead of the next one
            if let Err(e) = spawner.execute(move |state| state.deliver(batch)) {
                debug!(error = %e, "Dropping batch, worker is shutting down");
            }
            ControlFlow::Continue(())
        }
        TickOutcome::Empty | TickOutcome::Faulted { .. } => ControlFlow::Continue(()),
        TickOutcome::Exhausted { .. } => {
            if let Err(e) = state.stop_device() {
                error!(error = %format!("{:#}", e), "Device did not stop cleanly");
            }
            ControlFlow::Break(())
        }
    }
}
