//! Core library for the sensor bridge.
//!
//! The bridge drives one sensor-acquisition interface through its lifecycle
//! (create, configure, start, periodic sampling, stop, close) while
//! guaranteeing that all interaction with the native driver happens
//! sequentially on a single session worker thread.
//!
//! - [`worker`]: the serialized execution context with fixed-rate timers
//! - [`session`]: the controller, the sampling loop and delivery sinks
//! - [`device`]: the driver seam, device-type resolution and a pseudo device
//! - [`sensor`]: quantity types, channel requests and named presets
//! - [`config`] and [`logging`]: figment configuration and tracing setup

pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod sensor;
pub mod session;
pub mod worker;

pub use error::{SessionError, SessionResult};
pub use session::{DeviceSessionController, SessionOptions};
