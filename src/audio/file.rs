use std::path::Path;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, Sender, bounded};

use crate::error::{ParleyError, Result};

use super::buffer::BlockAssembler;
use super::codec::{CAPTURE_SAMPLE_RATE, samples_to_duration};
use super::resample::Resampler;
use super::{BlockSink, InputDevice};

/// Plays a WAV file into the session as though it were a microphone,
/// delivering blocks at real-time pace.
pub struct WavInput {
    name: String,
    samples: Vec<f32>,
    block_size: usize,
    running: Option<(Sender<()>, JoinHandle<()>)>,
}

impl WavInput {
    /// Read and convert the whole file up front. A missing or unreadable file
    /// is `DeviceUnavailable`, like a missing microphone.
    pub fn open(path: &Path, block_size: usize) -> Result<Self> {
        let input = Self {
            name: path.display().to_string(),
            samples: read_wav_mono_16k(path)?,
            block_size,
            running: None,
        };
        tracing::debug!(
            "loaded {} ({:.1}s at 16kHz)",
            input.name,
            input.duration().as_secs_f64()
        );
        Ok(input)
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        samples_to_duration(self.samples.len(), CAPTURE_SAMPLE_RATE)
    }
}

impl InputDevice for WavInput {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, mut sink: BlockSink) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let samples = std::mem::take(&mut self.samples);
        let block_size = self.block_size;
        let block_time = samples_to_duration(block_size, CAPTURE_SAMPLE_RATE);

        let thread = std::thread::Builder::new()
            .name("parley-wav-input".to_string())
            .spawn(move || {
                let mut assembler = BlockAssembler::new(block_size);
                let started = Instant::now();

                for (i, block) in assembler.feed(&samples).into_iter().enumerate() {
                    let due = started + block_time * (i as u32 + 1);
                    match stop_rx.recv_timeout(due.saturating_duration_since(Instant::now())) {
                        Err(RecvTimeoutError::Timeout) => sink(block),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                    }
                }

                tracing::debug!("end of WAV input reached");
                let _ = stop_rx.recv();
            })
            .map_err(|e| ParleyError::Audio(format!("failed to spawn WAV input thread: {e}")))?;

        self.running = Some((stop_tx, thread));
        Ok(())
    }

    fn stop(&mut self) {
        if let Some((stop_tx, thread)) = self.running.take() {
            let _ = stop_tx.send(());
            if thread.join().is_err() {
                tracing::error!("WAV input thread panicked");
            }
        }
    }
}

impl Drop for WavInput {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Read a WAV file as 16 kHz mono float samples.
pub fn read_wav_mono_16k(path: &Path) -> Result<Vec<f32>> {
    let mut reader = hound::WavReader::open(path).map_err(|e| {
        ParleyError::DeviceUnavailable(format!("failed to open WAV file {}: {e}", path.display()))
    })?;

    let spec = reader.spec();

    let interleaved: Vec<f32> = if spec.sample_format == hound::SampleFormat::Float {
        reader
            .samples::<f32>()
            .map(|s| s.map_err(|e| ParleyError::Audio(format!("WAV read error: {e}"))))
            .collect::<Result<Vec<f32>>>()?
    } else {
        let scale = (1u32 << (spec.bits_per_sample.saturating_sub(1))) as f32;
        reader
            .samples::<i32>()
            .map(|s| {
                s.map(|v| v as f32 / scale)
                    .map_err(|e| ParleyError::Audio(format!("WAV read error: {e}")))
            })
            .collect::<Result<Vec<f32>>>()?
    };

    let mut resampler = Resampler::new(spec.sample_rate, spec.channels, CAPTURE_SAMPLE_RATE)?;
    resampler.process(&interleaved)
}
