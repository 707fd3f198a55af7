use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig, SupportedStreamConfig};
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};

use crate::config::AudioConfig;
use crate::error::{ParleyError, Result};

use super::OutputDevice;
use super::capture::device_name;
use super::codec::{AudioFrame, PLAYBACK_SAMPLE_RATE};
use super::resample::Resampler;

/// Input frames per resampler chunk on the playback side. Small, since the
/// tail of an utterance waits in the resampler until the next chunk fills.
const PLAYBACK_CHUNK_FRAMES: usize = 256;

/// One frame queued for rendering, already at the device rate.
#[derive(Debug)]
struct Voice {
    samples: Vec<f32>,
    start: u64,
}

impl Voice {
    fn end(&self) -> u64 {
        self.start + self.samples.len() as u64
    }
}

#[derive(Debug)]
enum MixerCommand {
    Play(Voice),
    Clear,
}

/// Sample-accurate voice mixer driven by the output callback.
///
/// The device clock is the number of frames rendered so far; voices are placed
/// on that clock by absolute start tick.
struct Mixer {
    voices: Vec<Voice>,
    commands: Receiver<MixerCommand>,
    rendered: Arc<AtomicU64>,
}

impl Mixer {
    fn new(commands: Receiver<MixerCommand>, rendered: Arc<AtomicU64>) -> Self {
        Self {
            voices: Vec::new(),
            commands,
            rendered,
        }
    }

    fn drain_commands(&mut self) {
        while let Ok(cmd) = self.commands.try_recv() {
            match cmd {
                MixerCommand::Play(voice) => self.voices.push(voice),
                MixerCommand::Clear => self.voices.clear(),
            }
        }
    }

    /// Fill `out` with `out.len() / channels` frames of mixed audio.
    fn render(&mut self, out: &mut [f32], channels: usize) {
        self.drain_commands();

        let first = self.rendered.load(Ordering::Acquire);
        let frames = out.len() / channels;

        for (i, frame) in out.chunks_exact_mut(channels).enumerate() {
            let tick = first + i as u64;
            let mut mixed = 0.0f32;
            for voice in &self.voices {
                if tick >= voice.start && tick < voice.end() {
                    mixed += voice.samples[(tick - voice.start) as usize];
                }
            }
            frame.fill(mixed.clamp(-1.0, 1.0));
        }

        let last = first + frames as u64;
        self.voices.retain(|v| v.end() > last);
        self.rendered.store(last, Ordering::Release);
    }
}

/// Places frames on the device's sample clock.
///
/// A frame that starts exactly where the previous one ended continues both
/// the tick count and the resampler state, so consecutive frames join with
/// no gap or overlap and no filter restart. Any other start begins a new run
/// at the nearest device tick.
struct Timeline {
    device_rate: u32,
    run: Option<Run>,
}

struct Run {
    source_rate: u32,
    resampler: Resampler,
    end_time: Duration,
    end_tick: u64,
}

impl Timeline {
    const fn new(device_rate: u32) -> Self {
        Self {
            device_rate,
            run: None,
        }
    }

    fn place(&mut self, frame: &AudioFrame, at: Duration) -> Result<Voice> {
        let continues = self
            .run
            .as_ref()
            .is_some_and(|r| r.end_time == at && r.source_rate == frame.sample_rate());

        let run = match self.run.take() {
            Some(run) if continues => run,
            _ => Run {
                source_rate: frame.sample_rate(),
                resampler: Resampler::with_chunk(
                    frame.sample_rate(),
                    1,
                    self.device_rate,
                    PLAYBACK_CHUNK_FRAMES,
                )?,
                end_time: at,
                end_tick: to_tick(at, self.device_rate),
            },
        };
        let run = self.run.insert(run);

        let voice = Voice {
            samples: run.resampler.process(frame.samples())?,
            start: run.end_tick,
        };
        run.end_tick = voice.end();
        run.end_time = at + frame.duration();
        Ok(voice)
    }

    fn reset(&mut self) {
        self.run = None;
    }
}

/// Nearest device tick to `at`.
fn to_tick(at: Duration, rate: u32) -> u64 {
    ((at.as_nanos() * u128::from(rate) + 500_000_000) / 1_000_000_000) as u64
}

/// Speaker output via cpal.
pub struct CpalOutput {
    display_name: String,
    sample_rate: u32,
    timeline: Timeline,
    commands: Sender<MixerCommand>,
    rendered: Arc<AtomicU64>,
    running: Option<(Sender<()>, JoinHandle<()>)>,
}

struct Opened {
    name: String,
    sample_rate: u32,
}

impl CpalOutput {
    pub fn open(config: &AudioConfig) -> Result<Self> {
        let (cmd_tx, cmd_rx) = unbounded::<MixerCommand>();
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (ready_tx, ready_rx) = bounded::<Result<Opened>>(1);
        let rendered = Arc::new(AtomicU64::new(0));

        let device_name = config.output_device.clone();
        let mixer = Mixer::new(cmd_rx, Arc::clone(&rendered));

        let thread = std::thread::Builder::new()
            .name("parley-playback".to_string())
            .spawn(move || {
                run_output(device_name.as_deref(), mixer, &stop_rx, &ready_tx);
            })
            .map_err(|e| ParleyError::Audio(format!("failed to spawn playback thread: {e}")))?;

        let opened = ready_rx.recv().unwrap_or_else(|_| {
            Err(ParleyError::DeviceUnavailable(
                "playback thread exited before starting".to_string(),
            ))
        });

        let opened = match opened {
            Ok(o) => o,
            Err(e) => {
                let _ = thread.join();
                return Err(e);
            }
        };

        tracing::debug!(
            "opened output device {} at {} Hz",
            opened.name,
            opened.sample_rate
        );

        Ok(Self {
            display_name: opened.name,
            sample_rate: opened.sample_rate,
            timeline: Timeline::new(opened.sample_rate),
            commands: cmd_tx,
            rendered,
            running: Some((stop_tx, thread)),
        })
    }
}

impl OutputDevice for CpalOutput {
    fn name(&self) -> &str {
        &self.display_name
    }

    fn now(&self) -> Duration {
        let frames = self.rendered.load(Ordering::Acquire);
        let nanos = u128::from(frames) * 1_000_000_000 / u128::from(self.sample_rate);
        Duration::from_nanos(nanos as u64)
    }

    fn play_at(&mut self, frame: &AudioFrame, at: Duration) -> Result<()> {
        let voice = self.timeline.place(frame, at)?;
        if voice.samples.is_empty() {
            return Ok(());
        }
        self.commands
            .send(MixerCommand::Play(voice))
            .map_err(|_| ParleyError::Audio("output device is closed".to_string()))
    }

    fn stop_all(&mut self) {
        self.timeline.reset();
        let _ = self.commands.send(MixerCommand::Clear);
    }

    fn close(&mut self) {
        self.timeline.reset();
        if let Some((stop_tx, thread)) = self.running.take() {
            let _ = self.commands.send(MixerCommand::Clear);
            let _ = stop_tx.send(());
            if thread.join().is_err() {
                tracing::error!("playback thread panicked");
            }
            tracing::debug!("output device {} closed", self.display_name);
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_output(
    device_name: Option<&str>,
    mixer: Mixer,
    stop_rx: &Receiver<()>,
    ready_tx: &Sender<Result<Opened>>,
) {
    let (stream, opened) = match build_stream(device_name, mixer) {
        Ok(parts) => parts,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(ParleyError::Audio(format!(
            "failed to start playback stream: {e}"
        ))));
        return;
    }
    let _ = ready_tx.send(Ok(opened));

    // Park until closed; the stream lives as long as this thread does.
    let _ = stop_rx.recv();
    let _ = stream.pause();
}

fn build_stream(device_name: Option<&str>, mixer: Mixer) -> Result<(Stream, Opened)> {
    let device = find_output_device(device_name)?;
    let supported = preferred_output_config(&device)?;

    let stream_config = StreamConfig {
        channels: supported.channels(),
        sample_rate: supported.sample_rate(),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_typed::<f32>(&device, &stream_config, mixer)?,
        SampleFormat::I16 => build_typed::<i16>(&device, &stream_config, mixer)?,
        SampleFormat::U16 => build_typed::<u16>(&device, &stream_config, mixer)?,
        format => {
            return Err(ParleyError::DeviceUnavailable(format!(
                "unsupported output sample format: {format:?}"
            )));
        }
    };

    let opened = Opened {
        name: device_name_or_unknown(&device),
        sample_rate: stream_config.sample_rate,
    };

    Ok((stream, opened))
}

fn build_typed<T>(device: &Device, config: &StreamConfig, mut mixer: Mixer) -> Result<Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let mut scratch: Vec<f32> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _info: &cpal::OutputCallbackInfo| {
                scratch.resize(data.len(), 0.0);
                mixer.render(&mut scratch, channels);
                for (slot, &sample) in data.iter_mut().zip(scratch.iter()) {
                    *slot = T::from_sample(sample);
                }
            },
            |err: cpal::StreamError| {
                tracing::error!("audio output stream error: {err}");
            },
            None,
        )
        .map_err(|e| ParleyError::DeviceUnavailable(format!("failed to build output stream: {e}")))
}

/// Prefer a config that runs natively at the synthesis rate, so inbound frames
/// need no conversion; otherwise take the device default.
fn preferred_output_config(device: &Device) -> Result<SupportedStreamConfig> {
    if let Ok(ranges) = device.supported_output_configs() {
        let native = ranges
            .filter(|r| r.sample_format() == SampleFormat::F32)
            .filter(|r| {
                r.min_sample_rate() <= PLAYBACK_SAMPLE_RATE
                    && r.max_sample_rate() >= PLAYBACK_SAMPLE_RATE
            })
            .min_by_key(cpal::SupportedStreamConfigRange::channels);
        if let Some(range) = native {
            return Ok(range.with_sample_rate(PLAYBACK_SAMPLE_RATE));
        }
    }

    device.default_output_config().map_err(|e| {
        ParleyError::DeviceUnavailable(format!("failed to get default output config: {e}"))
    })
}

fn device_name_or_unknown(device: &Device) -> String {
    device_name(device).unwrap_or_else(|| "unknown".to_string())
}

fn find_output_device(name: Option<&str>) -> Result<Device> {
    let host = cpal::default_host();

    if let Some(name) = name {
        host.output_devices()
            .map_err(|e| {
                ParleyError::DeviceUnavailable(format!("failed to enumerate output devices: {e}"))
            })?
            .find(|d| device_name(d).as_deref() == Some(name))
            .ok_or_else(|| {
                ParleyError::DeviceUnavailable(format!("output device not found: {name}"))
            })
    } else {
        host.default_output_device().ok_or_else(|| {
            ParleyError::DeviceUnavailable("no default output device available".to_string())
        })
    }
}

/// Names of every output device the default host can see.
pub fn list_output_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host
        .output_devices()
        .map_err(|e| ParleyError::Audio(format!("failed to enumerate output devices: {e}")))?;
    Ok(devices.filter_map(|d| device_name(&d)).collect())
}

#[must_use]
pub fn default_output_device_name() -> Option<String> {
    cpal::default_host()
        .default_output_device()
        .and_then(|d| device_name(&d))
}
