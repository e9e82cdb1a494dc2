//! Delivery sinks for sampled batches.
//!
//! A sink is invoked on the session worker, in the order batches were read.
//! It must not block on the session controller: the controller's blocking
//! operations would wait for the very worker the sink is running on.

use tokio::sync::mpsc;
use tracing::debug;

use super::sampler::SampleBatch;

/// Receives delivered batches.
pub trait SampleSink: Send {
    /// `samples` holds `num_samples * channel_count` values, interleaved by channel.
    fn handle_data(&mut self, num_samples: usize, channel_count: usize, samples: Vec<f32>);

    /// Full batch, including when it was read. Defaults to [`SampleSink::handle_data`].
    fn handle_batch(&mut self, batch: SampleBatch) {
        self.handle_data(batch.num_samples, batch.channel_count, batch.samples);
    }
}

impl<F> SampleSink for F
where
    F: FnMut(usize, usize, Vec<f32>) + Send,
{
    fn handle_data(&mut self, num_samples: usize, channel_count: usize, samples: Vec<f32>) {
        self(num_samples, channel_count, samples)
    }
}

/// Forwards batches to an async consumer.
///
/// # Example
///
/// ```
/// use sensor_bridge::session::sink::{ChannelSink, SampleSink};
///
/// let (mut sink, mut batches) = ChannelSink::new();
/// sink.handle_data(1, 2, vec![0.5, 1.5]);
/// let batch = batches.try_recv().unwrap();
/// assert_eq!(batch.samples, vec![0.5, 1.5]);
/// ```
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SampleBatch>,
}

impl ChannelSink {
    /// A sink and the receiver that yields its batches.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SampleBatch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl SampleSink for ChannelSink {
    fn handle_data(&mut self, num_samples: usize, channel_count: usize, samples: Vec<f32>) {
        self.handle_batch(SampleBatch {
            num_samples,
            channel_count,
            samples,
            read_at: chrono::Utc::now(),
        });
    }

    fn handle_batch(&mut self, batch: SampleBatch) {
        if self.tx.send(batch).is_err() {
            debug!("Batch receiver dropped, discarding batch");
        }
    }
}
