use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};
use crossbeam_channel::{Receiver, Sender, bounded};

use crate::config::AudioConfig;
use crate::error::{ParleyError, Result};

use super::buffer::BlockAssembler;
use super::codec::CAPTURE_SAMPLE_RATE;
use super::resample::Resampler;
use super::{BlockSink, InputDevice};

/// Raw callback buffers queued between the cpal callback and the pump thread.
const RAW_QUEUE_DEPTH: usize = 64;

/// Microphone capture via cpal.
///
/// cpal streams cannot move between threads on every platform, so the stream
/// is built, run, and dropped on a dedicated pump thread. That thread also
/// resamples to 16 kHz mono and assembles fixed-size blocks for the sink.
pub struct CpalInput {
    device_name: Option<String>,
    display_name: String,
    block_size: usize,
    /// Callback buffers lost because the pump thread fell behind.
    overruns: Arc<AtomicU64>,
    running: Option<Running>,
}

struct Running {
    stop_tx: Sender<()>,
    thread: JoinHandle<()>,
}

impl CpalInput {
    /// Look up the configured input device. Fails with `DeviceUnavailable` if it
    /// does not exist or will not report a usable configuration.
    pub fn open(config: &AudioConfig) -> Result<Self> {
        let device = find_input_device(config.input_device.as_deref())?;
        device.default_input_config().map_err(|e| {
            ParleyError::DeviceUnavailable(format!("failed to get default input config: {e}"))
        })?;

        let display_name = device_name(&device).unwrap_or_else(|| "unknown".to_string());
        tracing::debug!("opened input device {display_name}");

        Ok(Self {
            device_name: config.input_device.clone(),
            display_name,
            block_size: config.block_size,
            overruns: Arc::new(AtomicU64::new(0)),
            running: None,
        })
    }
}

impl InputDevice for CpalInput {
    fn name(&self) -> &str {
        &self.display_name
    }

    fn start(&mut self, sink: BlockSink) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);
        let device_name = self.device_name.clone();
        let block_size = self.block_size;
        let overruns = Arc::clone(&self.overruns);

        let thread = std::thread::Builder::new()
            .name("parley-capture".to_string())
            .spawn(move || {
                run_capture(
                    device_name.as_deref(),
                    block_size,
                    overruns,
                    sink,
                    &stop_rx,
                    &ready_tx,
                );
            })
            .map_err(|e| ParleyError::Audio(format!("failed to spawn capture thread: {e}")))?;

        let ready = ready_rx.recv().unwrap_or_else(|_| {
            Err(ParleyError::Audio(
                "capture thread exited before starting".to_string(),
            ))
        });

        if let Err(e) = ready {
            let _ = thread.join();
            return Err(e);
        }

        self.running = Some(Running { stop_tx, thread });
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.stop_tx.send(());
            if running.thread.join().is_err() {
                tracing::error!("capture thread panicked");
            }
            tracing::debug!("input device {} stopped", self.display_name);
        }
    }

    fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }
}

impl Drop for CpalInput {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_capture(
    device_name: Option<&str>,
    block_size: usize,
    overruns: Arc<AtomicU64>,
    mut sink: BlockSink,
    stop_rx: &Receiver<()>,
    ready_tx: &Sender<Result<()>>,
) {
    let (raw_tx, raw_rx) = bounded::<Vec<f32>>(RAW_QUEUE_DEPTH);

    let built = build_stream(device_name, raw_tx, Arc::clone(&overruns));
    let (stream, mut resampler) = match built {
        Ok(parts) => parts,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(ParleyError::Audio(format!(
            "failed to start audio stream: {e}"
        ))));
        return;
    }
    let _ = ready_tx.send(Ok(()));

    let mut assembler = BlockAssembler::new(block_size);

    loop {
        crossbeam_channel::select! {
            recv(raw_rx) -> msg => {
                let Ok(raw) = msg else { break };
                let mono = match resampler.process(&raw) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!("resample error: {e}");
                        continue;
                    }
                };
                for block in assembler.feed(&mono) {
                    sink(block);
                }
            }
            recv(stop_rx) -> _ => break,
        }
    }

    let _ = stream.pause();
    drop(stream);
    let lost = overruns.load(Ordering::Relaxed);
    if lost > 0 {
        tracing::warn!("capture fell behind, {lost} device buffers were dropped");
    }
    tracing::debug!(
        "capture thread exiting, discarded {} partial samples",
        assembler.pending()
    );
}

fn build_stream(
    device_name: Option<&str>,
    raw_tx: Sender<Vec<f32>>,
    overruns: Arc<AtomicU64>,
) -> Result<(Stream, Resampler)> {
    let device = find_input_device(device_name)?;

    let supported = device.default_input_config().map_err(|e| {
        ParleyError::DeviceUnavailable(format!("failed to get default input config: {e}"))
    })?;

    let sample_rate = supported.sample_rate();
    let channels = supported.channels();

    let stream_config = StreamConfig {
        channels,
        sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let resampler = Resampler::new(sample_rate, channels, CAPTURE_SAMPLE_RATE)?;

    tracing::debug!(
        "capture stream: source_rate={sample_rate}, channels={channels}, target_rate={CAPTURE_SAMPLE_RATE}"
    );

    let err_fn = |err: cpal::StreamError| {
        tracing::error!("audio input stream error: {err}");
    };

    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                // try_send to stay lock-free in the audio callback
                if raw_tx.try_send(data.to_vec()).is_err() {
                    overruns.fetch_add(1, Ordering::Relaxed);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| ParleyError::DeviceUnavailable(format!("failed to build input stream: {e}")))?;

    Ok((stream, resampler))
}

pub(crate) fn device_name(device: &Device) -> Option<String> {
    device
        .description()
        .ok()
        .map(|desc| desc.name().to_string())
}

fn find_input_device(name: Option<&str>) -> Result<Device> {
    let host = cpal::default_host();

    if let Some(name) = name {
        host.input_devices()
            .map_err(|e| {
                ParleyError::DeviceUnavailable(format!("failed to enumerate input devices: {e}"))
            })?
            .find(|d| device_name(d).as_deref() == Some(name))
            .ok_or_else(|| ParleyError::DeviceUnavailable(format!("input device not found: {name}")))
    } else {
        host.default_input_device().ok_or_else(|| {
            ParleyError::DeviceUnavailable("no default input device available".to_string())
        })
    }
}

/// Names of every input device the default host can see.
pub fn list_input_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|e| ParleyError::Audio(format!("failed to enumerate input devices: {e}")))?;
    Ok(devices.filter_map(|d| device_name(&d)).collect())
}

#[must_use]
pub fn default_input_device_name() -> Option<String> {
    cpal::default_host()
        .default_input_device()
        .and_then(|d| device_name(&d))
}
