use audioadapter_buffers::direct::SequentialSliceOfVecs;
use rubato::audioadapter::Adapter;
use rubato::{Fft, FixedSync, Resampler as RubatoResampler};

use crate::error::{ParleyError, Result};

const CHUNK_FRAMES: usize = 1024;

/// Downmixes interleaved device audio to mono and converts it to a target rate.
pub struct Resampler {
    inner: Option<Fft<f32>>,
    channels: usize,
    pending: Vec<f32>,
}

impl Resampler {
    pub fn new(source_rate: u32, channels: u16, target_rate: u32) -> Result<Self> {
        Self::with_chunk(source_rate, channels, target_rate, CHUNK_FRAMES)
    }

    /// Like [`Resampler::new`] with `chunk` input frames per resampler pass.
    pub fn with_chunk(
        source_rate: u32,
        channels: u16,
        target_rate: u32,
        chunk: usize,
    ) -> Result<Self> {
        if chunk == 0 || channels == 0 || source_rate == 0 || target_rate == 0 {
            return Err(ParleyError::Resample(format!(
                "invalid stream shape: {source_rate} Hz, {channels} channels -> {target_rate} Hz"
            )));
        }

        let inner = if source_rate == target_rate {
            None
        } else {
            Some(
                Fft::new(
                    source_rate as usize,
                    target_rate as usize,
                    chunk,
                    2, // sub_chunks
                    1, // mono after downmix
                    FixedSync::Input,
                )
                .map_err(|e| ParleyError::Resample(format!("failed to create resampler: {e}")))?,
            )
        };

        Ok(Self {
            inner,
            channels: channels as usize,
            pending: Vec::new(),
        })
    }

    /// Process interleaved samples; returns whatever mono output is ready.
    pub fn process(&mut self, interleaved: &[f32]) -> Result<Vec<f32>> {
        let mono = downmix(interleaved, self.channels);

        let Some(resampler) = self.inner.as_mut() else {
            return Ok(mono);
        };

        self.pending.extend_from_slice(&mono);

        let mut output = Vec::new();
        let frames_needed = resampler.input_frames_next();

        while self.pending.len() >= frames_needed {
            let chunk: Vec<f32> = self.pending.drain(..frames_needed).collect();
            let input_data = vec![chunk];
            let input = SequentialSliceOfVecs::new(&input_data, 1, frames_needed)
                .map_err(|e| ParleyError::Resample(format!("buffer error: {e}")))?;
            let result = resampler
                .process(&input, 0, None)
                .map_err(|e| ParleyError::Resample(format!("resample error: {e}")))?;
            for frame in 0..result.frames() {
                output.push(result.read_sample(0, frame).unwrap_or(0.0));
            }
        }

        Ok(output)
    }
}

fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels == 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_at_target_rate() {
        let mut r = Resampler::new(16000, 1, 16000).unwrap_or_else(|e| panic!("{e}"));
        let input: Vec<f32> = (0..1600).map(|i| (i as f32 / 1600.0).sin()).collect();
        let output = r.process(&input).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(output, input);
    }

    #[test]
    fn stereo_to_mono() {
        let mut r = Resampler::new(16000, 2, 16000).unwrap_or_else(|e| panic!("{e}"));
        let input: Vec<f32> = [0.2f32, 0.4].repeat(800);
        let output = r.process(&input).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(output.len(), 800);
        assert!(output.iter().all(|s| (s - 0.3).abs() < 1e-6));
    }

    #[test]
    fn downsamples_to_target_rate() {
        let mut r = Resampler::new(48000, 1, 16000).unwrap_or_else(|e| panic!("{e}"));
        let mut produced = 0;
        for _ in 0..10 {
            produced += r
                .process(&vec![0.0f32; 4800])
                .unwrap_or_else(|e| panic!("{e}"))
                .len();
        }
        // One second in; allow for the resampler's internal delay.
        assert!(produced > 14000 && produced <= 16000, "produced {produced}");
    }

    #[test]
    fn rejects_zero_channels() {
        assert!(Resampler::new(48000, 0, 16000).is_err());
    }
}
