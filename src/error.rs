//! Custom error types for the sensor bridge.
//!
//! This module defines `SessionError`, the error type returned by every
//! blocking operation of the device session controller. Using the `thiserror`
//! crate, it keeps the failure taxonomy small and explicit:
//!
//! - **`CreateDevice`**: the device handle could not be instantiated or opened.
//! - **`ConfigureDevice`**: negotiating the channel set, or querying attachment
//!   or the reported configuration, failed.
//! - **`SessionFault`**: a generic probe-time fault. The collectability probe
//!   downgrades it to `false` instead of propagating it.
//! - **`NoChannels`**: sampling was requested without any channels to read.
//! - **`Worker`**: the session worker refused or abandoned a unit of work.
//!
//! Driver primitives report failures as `anyhow::Error`; the controller wraps
//! that original cause in the matching variant so `source()` still reaches it.

use thiserror::Error;

use crate::worker::WorkerError;

/// Convenience alias for results using the session error type.
pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Failure of a session controller operation.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Creating or opening the device failed.
    #[error("Exception creating device")]
    CreateDevice(#[source] anyhow::Error),

    /// Configuring or querying the device failed.
    #[error("Exception configuring device")]
    ConfigureDevice(#[source] anyhow::Error),

    /// Probe-time fault.
    #[error("Sensor session fault")]
    SessionFault(#[source] anyhow::Error),

    /// Sampling was requested with an empty channel set.
    #[error("No sensor channels have been requested")]
    NoChannels,

    /// The session worker refused or abandoned the unit.
    #[error("Session worker error: {0}")]
    Worker(#[from] WorkerError),
}

impl SessionError {
    /// Wraps a worker-level failure into a `CreateDevice` error, keeping
    /// scheduling failures (shutdown, reentrancy) as `Worker` errors.
    pub(crate) fn create(err: WorkerError) -> Self {
        match err {
            WorkerError::Failed(cause) => SessionError::CreateDevice(cause),
            other => SessionError::Worker(other),
        }
    }

    /// Same as [`SessionError::create`], for configuration round trips.
    pub(crate) fn configure(err: WorkerError) -> Self {
        match err {
            WorkerError::Failed(cause) => SessionError::ConfigureDevice(cause),
            other => SessionError::Worker(other),
        }
    }

    /// Same as [`SessionError::create`], for probe round trips.
    pub(crate) fn fault(err: WorkerError) -> Self {
        match err {
            WorkerError::Failed(cause) => SessionError::SessionFault(cause),
            other => SessionError::Worker(other),
        }
    }
}
