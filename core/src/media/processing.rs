//! Microphone post-processing: high-pass -> compressor -> gain

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProcessingConfig {
    pub high_pass_hz: f32,
    pub threshold_db: f32,
    pub ratio: f32,
    pub attack_secs: f32,
    pub release_secs: f32,
    pub gain: f32,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            high_pass_hz: 80.0,
            threshold_db: -24.0,
            ratio: 4.0,
            attack_secs: 0.003,
            release_secs: 0.25,
            gain: 1.2,
        }
    }
}

/// Second-order high-pass (RBJ cookbook, Q = 1/sqrt(2)).
#[derive(Debug, Clone)]
pub struct HighPass {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl HighPass {
    pub fn new(cutoff_hz: f32, sample_rate: u32) -> Self {
        let w0 = 2.0 * std::f32::consts::PI * cutoff_hz / sample_rate as f32;
        let cos_w0 = w0.cos();
        let alpha = w0.sin() / (2.0 * std::f32::consts::FRAC_1_SQRT_2);
        let a0 = 1.0 + alpha;

        Self {
            b0: (1.0 + cos_w0) / 2.0 / a0,
            b1: -(1.0 + cos_w0) / a0,
            b2: (1.0 + cos_w0) / 2.0 / a0,
            a1: -2.0 * cos_w0 / a0,
            a2: (1.0 - alpha) / a0,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        }
    }

    pub fn process(&mut self, frame: &mut [f32]) {
        for sample in frame.iter_mut() {
            let x = *sample;
            let y = self.b0 * x + self.b1 * self.x1 + self.b2 * self.x2
                - self.a1 * self.y1
                - self.a2 * self.y2;
            self.x2 = self.x1;
            self.x1 = x;
            self.y2 = self.y1;
            self.y1 = y;
            *sample = y;
        }
    }
}

/// Feed-forward peak compressor with attack/release envelope.
#[derive(Debug, Clone)]
pub struct Compressor {
    threshold_db: f32,
    ratio: f32,
    attack: f32,
    release: f32,
    envelope: f32,
}

impl Compressor {
    pub fn new(config: &ProcessingConfig, sample_rate: u32) -> Self {
        let coeff = |secs: f32| (-1.0 / (secs * sample_rate as f32)).exp();
        Self {
            threshold_db: config.threshold_db,
            ratio: config.ratio.max(1.0),
            attack: coeff(config.attack_secs),
            release: coeff(config.release_secs),
            envelope: 0.0,
        }
    }

    pub fn process(&mut self, frame: &mut [f32]) {
        for sample in frame.iter_mut() {
            let level = sample.abs();
            let coeff = if level > self.envelope {
                self.attack
            } else {
                self.release
            };
            self.envelope = coeff * self.envelope + (1.0 - coeff) * level;

            let level_db = 20.0 * self.envelope.max(1e-9).log10();
            if level_db > self.threshold_db {
                let reduction_db = (self.threshold_db - level_db) * (1.0 - 1.0 / self.ratio);
                *sample *= 10_f32.powf(reduction_db / 20.0);
            }
        }
    }
}

/// Output gain with hard clipping to [-1, 1].
#[derive(Debug, Clone, Copy)]
pub struct Gain(pub f32);

impl Gain {
    pub fn process(&self, frame: &mut [f32]) {
        for sample in frame.iter_mut() {
            *sample = (*sample * self.0).clamp(-1.0, 1.0);
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessingChain {
    high_pass: HighPass,
    compressor: Compressor,
    gain: Gain,
}

impl ProcessingChain {
    pub fn new(config: &ProcessingConfig, sample_rate: u32) -> Self {
        Self {
            high_pass: HighPass::new(config.high_pass_hz, sample_rate),
            compressor: Compressor::new(config, sample_rate),
            gain: Gain(config.gain),
        }
    }

    pub fn process(&mut self, frame: &mut [f32]) {
        self.high_pass.process(frame);
        self.compressor.process(frame);
        self.gain.process(frame);
    }
}

/// RMS level of a frame.
pub fn calculate_rms(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum: f32 = frame.iter().map(|s| s * s).sum();
    (sum / frame.len() as f32).sqrt()
}
