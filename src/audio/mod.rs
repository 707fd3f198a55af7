pub mod buffer;
pub mod capture;
pub mod codec;
pub mod file;
pub mod output;
pub mod pipeline;
pub mod playback;
pub mod resample;

use std::path::PathBuf;
use std::time::Duration;

use crate::config::AudioConfig;
use crate::error::Result;

use self::codec::AudioFrame;

/// Receives fixed-size blocks of 16 kHz mono samples from an input device.
pub type BlockSink = Box<dyn FnMut(Vec<f32>) + Send + 'static>;

/// A source of microphone audio.
///
/// Implementations deliver blocks of exactly the configured size, at
/// [`codec::CAPTURE_SAMPLE_RATE`], mono.
pub trait InputDevice: Send {
    fn name(&self) -> &str;

    /// Begin pushing blocks into `sink`.
    fn start(&mut self, sink: BlockSink) -> Result<()>;

    /// Stop delivery and release the device. No block reaches the sink
    /// after this returns. Calling it again is a no-op.
    fn stop(&mut self);

    /// Device buffers lost before they could be assembled into blocks.
    fn overruns(&self) -> u64 {
        0
    }
}

/// A sink for synthesized audio with its own clock.
pub trait OutputDevice: Send {
    fn name(&self) -> &str;

    /// Current position of the device clock.
    fn now(&self) -> Duration;

    /// Queue `frame` to begin at `at` on the device clock.
    fn play_at(&mut self, frame: &AudioFrame, at: Duration) -> Result<()>;

    /// Silence everything queued or playing.
    fn stop_all(&mut self);

    /// Release the device. Calling it again is a no-op.
    fn close(&mut self);
}

/// Acquires devices for a session.
pub trait DeviceProvider: Send + Sync {
    fn open_input(&self, config: &AudioConfig) -> Result<Box<dyn InputDevice>>;
    fn open_output(&self, config: &AudioConfig) -> Result<Box<dyn OutputDevice>>;
}

/// Platform audio via cpal, optionally reading the microphone side from a
/// WAV file instead.
#[derive(Debug, Clone, Default)]
pub struct SystemDevices {
    pub wav_input: Option<PathBuf>,
}

impl SystemDevices {
    #[must_use]
    pub const fn new(wav_input: Option<PathBuf>) -> Self {
        Self { wav_input }
    }
}

impl DeviceProvider for SystemDevices {
    fn open_input(&self, config: &AudioConfig) -> Result<Box<dyn InputDevice>> {
        if let Some(ref path) = self.wav_input {
            return Ok(Box::new(file::WavInput::open(path, config.block_size)?));
        }
        Ok(Box::new(capture::CpalInput::open(config)?))
    }

    fn open_output(&self, config: &AudioConfig) -> Result<Box<dyn OutputDevice>> {
        Ok(Box::new(output::CpalOutput::open(config)?))
    }
}
