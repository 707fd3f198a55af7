use crate::error::{ParleyError, Result};

use super::codec::{self, CAPTURE_SAMPLE_RATE, WireFrame};
use super::{BlockSink, InputDevice};

/// A capture block after analysis and encoding, ready to send.
#[derive(Debug, Clone)]
pub struct CapturedBlock {
    /// Root-mean-square loudness of the block, unscaled.
    pub level: f32,
    pub frame: WireFrame,
}

/// Owns the input device for one session and turns its blocks into wire
/// frames.
pub struct CapturePipeline {
    device: Box<dyn InputDevice>,
    block_size: usize,
    running: bool,
}

impl CapturePipeline {
    #[must_use]
    pub fn new(device: Box<dyn InputDevice>, block_size: usize) -> Self {
        Self {
            device,
            block_size,
            running: false,
        }
    }

    #[must_use]
    pub fn device_name(&self) -> &str {
        self.device.name()
    }

    #[must_use]
    pub fn overruns(&self) -> u64 {
        self.device.overruns()
    }

    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running
    }

    /// Start pushing blocks to `sink`. The sink runs on the device's thread and
    /// must not block.
    pub fn start(&mut self, sink: BlockSink) -> Result<()> {
        if self.running {
            return Ok(());
        }
        self.device.start(sink)?;
        self.running = true;
        tracing::info!("capturing from {}", self.device.name());
        Ok(())
    }

    /// Stop the device. Once this returns no further blocks are delivered.
    pub fn stop(&mut self) {
        self.device.stop();
        if self.running {
            self.running = false;
            tracing::debug!("capture stopped");
        }
    }

    /// Measure and encode one block. Blocks of the wrong size are rejected so
    /// a partial frame is never transmitted.
    pub fn process(&self, block: &[f32]) -> Result<CapturedBlock> {
        if block.len() != self.block_size {
            return Err(ParleyError::MalformedFrame(format!(
                "capture block has {} samples, expected {}",
                block.len(),
                self.block_size
            )));
        }

        Ok(CapturedBlock {
            level: rms(block),
            frame: codec::encode(block, CAPTURE_SAMPLE_RATE)?,
        })
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[must_use]
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}
