//! Driver seam for sensor interfaces.
//!
//! Concrete drivers implement [`SensorDevice`] and are instantiated by a
//! [`DeviceFactory`] from a resolved [`DeviceConfig`]. A device handle is only
//! ever touched from the session worker thread, so drivers need not be `Send`
//! or reentrant.
//!
//! Resolution of the logical device type follows the host conventions:
//!
//! | device type        | driver                          | open string                |
//! |--------------------|---------------------------------|----------------------------|
//! | `golink`, `goio`   | [`DeviceId::VernierGoLink`]     | none                       |
//! | `labquest`         | [`DeviceId::VernierLabQuest`]   | none                       |
//! | `manual`           | host parameter `deviceId`       | host parameter `openString`|
//! | anything else      | [`DeviceId::Pseudo`]            | host parameter `openString`|

pub mod pseudo;

use anyhow::Result;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::{error, info};

use crate::sensor::{ExperimentConfig, ExperimentRequest};

/// Driver primitives of an opened sensor interface.
pub trait SensorDevice {
    /// Whether the interface is physically present.
    fn is_attached(&mut self) -> Result<bool>;

    /// Configuration describing what is currently plugged in.
    fn current_config(&mut self) -> Result<Option<ExperimentConfig>>;

    /// Negotiate `request`; returns the configuration the device will use.
    fn configure(&mut self, request: &ExperimentRequest) -> Result<Option<ExperimentConfig>>;

    /// Begin acquisition. Returns whether the device is now running.
    fn start(&mut self) -> Result<bool>;

    /// Read buffered samples into `values` starting at `offset`, interleaved
    /// by `channel_count`. Returns the number of samples per channel read.
    fn read(&mut self, values: &mut [f32], offset: usize, channel_count: usize) -> Result<usize>;

    /// Stop acquisition, optionally discarding buffered samples.
    fn stop(&mut self, flush: bool) -> Result<()>;

    /// Release the interface.
    fn close(&mut self) -> Result<()>;
}

/// Creates device handles. Lives on the session worker.
pub trait DeviceFactory: Send {
    /// Open a handle for `config`.
    fn create_device(&self, config: &DeviceConfig) -> Result<Box<dyn SensorDevice>>;
}

/// Named parameters supplied by the embedding host.
pub trait HostParameters: Send {
    /// Value of `name`, if the host set it.
    fn parameter(&self, name: &str) -> Option<String>;
}

impl HostParameters for HashMap<String, String> {
    fn parameter(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

impl HostParameters for BTreeMap<String, String> {
    fn parameter(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Host parameter naming the numeric driver for the `manual` device type.
pub const DEVICE_ID_PARAM: &str = "deviceId";
/// Host parameter carrying the driver's connection string.
pub const OPEN_STRING_PARAM: &str = "openString";

/// Low-level driver identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceId {
    /// Simulated interface.
    Pseudo,
    /// Vernier Go!Link and Go! devices.
    VernierGoLink,
    /// Vernier LabQuest.
    VernierLabQuest,
    /// Driver selected by number through the `deviceId` host parameter.
    Driver(i32),
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pseudo => write!(f, "pseudo"),
            Self::VernierGoLink => write!(f, "vernier-golink"),
            Self::VernierLabQuest => write!(f, "vernier-labquest"),
            Self::Driver(id) => write!(f, "driver-{}", id),
        }
    }
}

/// Addressing pair used to instantiate a device handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Driver to instantiate.
    pub device_id: DeviceId,
    /// Connection string, if the host supplied one.
    pub open_string: Option<String>,
}

impl DeviceConfig {
    /// Resolve a logical device type name against the host parameters.
    pub fn resolve(device_type: &str, parameters: &dyn HostParameters) -> Self {
        let device_id = resolve_device_id(device_type, parameters);
        let open_string = open_string(device_id, parameters);
        Self {
            device_id,
            open_string,
        }
    }
}

fn resolve_device_id(device_type: &str, parameters: &dyn HostParameters) -> DeviceId {
    info!(device_type, "Requested device");
    match device_type {
        "golink" | "goio" => DeviceId::VernierGoLink,
        "labquest" => DeviceId::VernierLabQuest,
        "manual" => {
            let raw = parameters.parameter(DEVICE_ID_PARAM);
            match raw.as_deref().map(str::trim).map(str::parse::<i32>) {
                Some(Ok(id)) => DeviceId::Driver(id),
                _ => {
                    error!(param = ?raw, "Invalid 'deviceId' param, using pseudo device");
                    DeviceId::Pseudo
                }
            }
        }
        _ => DeviceId::Pseudo,
    }
}

fn open_string(device_id: DeviceId, parameters: &dyn HostParameters) -> Option<String> {
    match device_id {
        DeviceId::VernierGoLink | DeviceId::VernierLabQuest => None,
        _ => parameters.parameter(OPEN_STRING_PARAM),
    }
}
