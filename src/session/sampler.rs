//! Periodic read loop with consecutive-failure shutdown.
//!
//! One [`SamplingScheduler`] lives exactly as long as one sampling run. Its
//! [`tick`](SamplingScheduler::tick) is executed on the session worker, reads
//! one batch from the device and tells the caller what to do next. The read
//! buffer is reused across ticks, so every delivered batch is copied out.

use chrono::{DateTime, Utc};
use tracing::{error, trace};

use crate::device::SensorDevice;

/// Number of consecutive failed reads that stops a run.
pub const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 5;
/// Scalar slots in the read buffer, shared across all channels.
pub const DEFAULT_READ_BUFFER_LEN: usize = 1024;

/// Samples produced by one successful read, interleaved by channel.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBatch {
    /// Samples per channel.
    pub num_samples: usize,
    /// Channels per sample.
    pub channel_count: usize,
    /// Exactly `num_samples * channel_count` values.
    pub samples: Vec<f32>,
    /// When the read returned.
    pub read_at: DateTime<Utc>,
}

/// What a tick produced.
#[derive(Debug, PartialEq)]
pub enum TickOutcome {
    /// Samples were read and must be delivered.
    Batch(SampleBatch),
    /// The read succeeded without new samples.
    Empty,
    /// The read faulted; the run continues.
    Faulted {
        /// Faults in a row, including this one.
        consecutive_errors: u32,
    },
    /// Too many consecutive faults; the run must stop.
    Exhausted {
        /// Faults in a row, including this one.
        consecutive_errors: u32,
    },
}

/// Read loop state for one sampling run.
#[derive(Debug)]
pub struct SamplingScheduler {
    channel_count: usize,
    buffer: Vec<f32>,
    consecutive_errors: u32,
    max_consecutive_errors: u32,
}

impl SamplingScheduler {
    /// Scheduler with the default buffer size and error limit.
    pub fn new(channel_count: usize) -> Self {
        Self::with_limits(
            channel_count,
            DEFAULT_READ_BUFFER_LEN,
            DEFAULT_MAX_CONSECUTIVE_ERRORS,
        )
    }

    /// Scheduler with an explicit buffer size and consecutive-error limit.
    /// Both are raised to at least 1.
    pub fn with_limits(channel_count: usize, buffer_len: usize, max_consecutive_errors: u32) -> Self {
        Self {
            channel_count,
            buffer: vec![0.0; buffer_len.max(1)],
            consecutive_errors: 0,
            max_consecutive_errors: max_consecutive_errors.max(1),
        }
    }

    /// Channels read per sample.
    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    /// Faults since the last successful read.
    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    /// Read one batch from `device`.
    pub fn tick(&mut self, device: Option<&mut (dyn SensorDevice + '_)>) -> TickOutcome {
        let read = match device {
            Some(device) => device.read(&mut self.buffer, 0, self.channel_count),
            None => Err(anyhow::anyhow!("device is not open")),
        };

        match read {
            Ok(0) => {
                self.consecutive_errors = 0;
                trace!("Read returned no samples");
                TickOutcome::Empty
            }
            Ok(num_samples) => {
                self.consecutive_errors = 0;
                TickOutcome::Batch(self.copy_batch(num_samples))
            }
            Err(e) => {
                self.consecutive_errors += 1;
                error!(
                    error = %format!("{:#}", e),
                    consecutive_errors = self.consecutive_errors,
                    "Error reading data from device"
                );
                if self.consecutive_errors >= self.max_consecutive_errors {
                    error!(
                        consecutive_errors = self.consecutive_errors,
                        "Too many collection errors, stopping device"
                    );
                    TickOutcome::Exhausted {
                        consecutive_errors: self.consecutive_errors,
                    }
                } else {
                    TickOutcome::Faulted {
                        consecutive_errors: self.consecutive_errors,
                    }
                }
            }
        }
    }

    fn copy_batch(&self, num_samples: usize) -> SampleBatch {
        let channel_count = self.channel_count.max(1);
        // A driver claiming more than fits is clamped to what the buffer holds
        let num_samples = num_samples.min(self.buffer.len() / channel_count);
        let len = num_samples * self.channel_count;

        SampleBatch {
            num_samples,
            channel_count: self.channel_count,
            samples: self.buffer[..len].to_vec(),
            read_at: Utc::now(),
        }
    }
}
