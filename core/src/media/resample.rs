//! Stateful sample-rate conversion for one mono audio stream

use crate::error::Result;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

const PARAMETERS: SincInterpolationParameters = SincInterpolationParameters {
    sinc_len: 256,
    f_cutoff: 0.95,
    interpolation: SincInterpolationType::Linear,
    oversampling_factor: 256,
    window: WindowFunction::BlackmanHarris2,
};

/// Converts a continuous stream from one rate to another.
///
/// Input arrives in arbitrary slice sizes; samples are buffered until a full
/// chunk is available, so filter state carries across callbacks.
pub struct StreamResampler {
    inner: Option<SincFixedIn<f32>>,
    chunk: usize,
    pending: Vec<f32>,
    out_buf: Vec<f32>,
}

impl StreamResampler {
    /// `chunk` is the number of input samples consumed per conversion step.
    pub fn new(from: u32, to: u32, chunk: usize) -> Result<Self> {
        let chunk = chunk.max(1);
        if from == to {
            return Ok(Self {
                inner: None,
                chunk,
                pending: Vec::new(),
                out_buf: Vec::new(),
            });
        }

        let ratio = to as f64 / from as f64;
        let inner = SincFixedIn::<f32>::new(ratio, 2.0, PARAMETERS, chunk, 1)?;
        let out_buf = vec![0.0; inner.output_frames_max()];
        Ok(Self {
            inner: Some(inner),
            chunk,
            pending: Vec::with_capacity(chunk * 2),
            out_buf,
        })
    }

    /// A resampler whose chunk covers 10 ms of input.
    pub fn for_rates(from: u32, to: u32) -> Result<Self> {
        Self::new(from, to, (from / 100) as usize)
    }

    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }

    /// Feeds samples and returns whatever output is ready.
    pub fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        let Some(inner) = self.inner.as_mut() else {
            return Ok(samples.to_vec());
        };

        self.pending.extend_from_slice(samples);
        let mut output = Vec::new();
        let mut consumed = 0;
        while self.pending.len() - consumed >= self.chunk {
            let input = [&self.pending[consumed..consumed + self.chunk]];
            let mut out = [&mut self.out_buf[..]];
            let (used, written) = inner.process_into_buffer(&input, &mut out, None)?;
            output.extend_from_slice(&self.out_buf[..written]);
            consumed += used;
        }
        self.pending.drain(..consumed);
        Ok(output)
    }

    /// Drops buffered input and filter history.
    pub fn reset(&mut self) {
        self.pending.clear();
        if let Some(inner) = self.inner.as_mut() {
            inner.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_rate_passes_through() {
        let mut resampler = StreamResampler::for_rates(8_000, 8_000).unwrap();
        assert!(resampler.is_passthrough());
        assert_eq!(resampler.process(&[0.5, -0.5]).unwrap(), vec![0.5, -0.5]);
    }

    #[test]
    fn test_partial_callbacks_are_buffered() {
        let mut resampler = StreamResampler::for_rates(44_100, 8_000).unwrap();
        // Less than one 441-sample chunk yields nothing yet
        assert!(resampler.process(&[0.1; 300]).unwrap().is_empty());
        let out = resampler.process(&[0.1; 300]).unwrap();
        assert!(!out.is_empty());
        assert!(out.len() <= 90, "got {} samples", out.len());
    }

    #[test]
    fn test_output_rate_tracks_ratio() {
        let mut resampler = StreamResampler::for_rates(48_000, 8_000).unwrap();
        let mut total = 0;
        // One second of audio in uneven callback sizes
        for size in [512, 480, 1000, 7, 2001].iter().cycle().take(60) {
            total += resampler.process(&vec![0.0; *size]).unwrap().len();
        }
        let input: usize = [512, 480, 1000, 7, 2001].iter().sum::<usize>() * 12;
        let expected = input / 6;
        assert!(
            total + 100 >= expected && total <= expected + 2,
            "expected about {} samples, got {}",
            expected,
            total
        );
    }

    #[test]
    fn test_upsampled_tone_has_no_frame_edge_clicks() {
        let mut resampler = StreamResampler::for_rates(8_000, 48_000).unwrap();
        let tone: Vec<f32> = (0..8_000)
            .map(|i| (i as f32 * 2.0 * std::f32::consts::PI * 440.0 / 8_000.0).sin() * 0.5)
            .collect();
        let mut out = Vec::new();
        for packet in tone.chunks(160) {
            out.extend(resampler.process(packet).unwrap());
        }
        // Skip the filter's warm-up, then a 440 Hz tone at 48 kHz never
        // moves more than a few hundredths per sample.
        let max_step = out[1_000..]
            .windows(2)
            .map(|w| (w[1] - w[0]).abs())
            .fold(0.0_f32, f32::max);
        assert!(max_step < 0.05, "step of {}", max_step);
    }
}
