//! Local audio capture and remote audio playback

use crate::error::{Error, Result};
use crate::media::resample::StreamResampler;
use crate::media::processing::{ProcessingChain, ProcessingConfig};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use log::{error, info};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Local track handle: the mute switch and the release of the device.
pub trait MediaTrack: Send + Sync {
    fn id(&self) -> &str;
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    /// Releases the underlying device. Further calls are no-ops.
    fn stop(&self);
}

/// Remote track handle as played back locally.
pub trait RemoteTrack: Send + Sync {
    fn id(&self) -> &str;
    fn set_volume(&self, volume: f32);
    fn volume(&self) -> f32;
    fn stop(&self);
}

/// Mono PCM captured from the microphone, after processing.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

#[derive(Debug, Clone)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub processing: ProcessingConfig,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            processing: ProcessingConfig::default(),
        }
    }
}

/// A granted microphone stream.
pub struct LocalAudio {
    track: Arc<dyn MediaTrack>,
    frames: Mutex<Option<mpsc::UnboundedReceiver<AudioFrame>>>,
}

impl LocalAudio {
    pub fn new(
        track: Arc<dyn MediaTrack>,
        frames: Option<mpsc::UnboundedReceiver<AudioFrame>>,
    ) -> Self {
        Self {
            track,
            frames: Mutex::new(frames),
        }
    }

    pub fn track(&self) -> &Arc<dyn MediaTrack> {
        &self.track
    }

    /// Hands the captured frames to whoever sends them; only the first
    /// caller gets them.
    pub fn take_frames(&self) -> Option<mpsc::UnboundedReceiver<AudioFrame>> {
        self.frames.lock().take()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.track.set_enabled(enabled);
    }

    pub fn is_enabled(&self) -> bool {
        self.track.is_enabled()
    }

    pub fn stop(&self) {
        self.track.stop();
    }
}

#[async_trait]
pub trait AudioDevices: Send + Sync {
    async fn acquire_local_audio(&self, constraints: &AudioConstraints) -> Result<LocalAudio>;
}

// ============================================================================
// cpal capture
// ============================================================================

/// System audio devices through cpal.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalDevices;

struct CaptureTrack {
    id: String,
    enabled: Arc<AtomicBool>,
    stop_tx: Mutex<Option<std::sync::mpsc::Sender<()>>>,
}

impl MediaTrack for CaptureTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.send(());
            info!("Microphone released ({})", self.id);
        }
    }
}

#[async_trait]
impl AudioDevices for CpalDevices {
    async fn acquire_local_audio(&self, constraints: &AudioConstraints) -> Result<LocalAudio> {
        let (ready_tx, ready_rx) = oneshot::channel::<Result<u32>>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let enabled = Arc::new(AtomicBool::new(true));
        let processing = constraints.processing;
        let enabled_for_thread = enabled.clone();

        // cpal streams are not Send; the stream lives and dies on this thread
        std::thread::Builder::new()
            .name("voxlink-capture".to_string())
            .spawn(move || {
                let stream = match open_capture(processing, enabled_for_thread, frame_tx) {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Blocks until stop() or until the track is dropped
                let _ = stop_rx.recv();
                drop(stream);
            })?;

        let rate = ready_rx
            .await
            .map_err(|_| Error::UnsupportedPlatform("capture thread exited".to_string()))??;
        info!(
            "Microphone acquired at {} Hz (echo_cancellation={}, noise_suppression={})",
            rate, constraints.echo_cancellation, constraints.noise_suppression
        );

        let track = CaptureTrack {
            id: uuid::Uuid::new_v4().to_string(),
            enabled,
            stop_tx: Mutex::new(Some(stop_tx)),
        };
        Ok(LocalAudio::new(Arc::new(track), Some(frame_rx)))
    }
}

fn open_capture(
    processing: ProcessingConfig,
    enabled: Arc<AtomicBool>,
    frames: mpsc::UnboundedSender<AudioFrame>,
) -> Result<(cpal::Stream, u32)> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| Error::DeviceNotFound("no default input device".to_string()))?;
    let supported = device.default_input_config()?;
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    let channels = config.channels.max(1) as usize;
    let sample_rate = config.sample_rate.0;
    let mut chain = ProcessingChain::new(&processing, sample_rate);

    let sink = move |interleaved: Vec<f32>| {
        let mut mono: Vec<f32> = interleaved.chunks(channels).map(|f| f[0]).collect();
        if !enabled.load(Ordering::Relaxed) {
            mono.iter_mut().for_each(|s| *s = 0.0);
        }
        chain.process(&mut mono);
        let _ = frames.send(AudioFrame {
            samples: mono,
            sample_rate,
        });
    };

    let stream = match sample_format {
        cpal::SampleFormat::F32 => build_input::<f32>(&device, &config, sink)?,
        cpal::SampleFormat::I16 => build_input::<i16>(&device, &config, sink)?,
        cpal::SampleFormat::U16 => build_input::<u16>(&device, &config, sink)?,
        other => {
            return Err(Error::UnsupportedPlatform(format!(
                "sample format {:?}",
                other
            )))
        }
    };
    stream.play()?;

    Ok((stream, sample_rate))
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut sink: impl FnMut(Vec<f32>) + Send + 'static,
) -> Result<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            sink(data.iter().map(|s| f32::from_sample(*s)).collect());
        },
        |err| error!("Error in input stream: {}", err),
        None,
    )?;
    Ok(stream)
}

// ============================================================================
// cpal playback
// ============================================================================

/// Speaker output for one remote track.
pub struct Playback {
    id: String,
    volume: Arc<AtomicU32>,
    buffer: Arc<Mutex<VecDeque<f32>>>,
    device_rate: u32,
    resampler: Mutex<StreamResampler>,
    stop_tx: Mutex<Option<std::sync::mpsc::Sender<()>>>,
}

impl Playback {
    /// Opens the default output device for a stream encoded at `source_rate`.
    pub async fn open(id: &str, source_rate: u32) -> Result<Arc<Self>> {
        let (ready_tx, ready_rx) = oneshot::channel::<Result<u32>>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let volume = Arc::new(AtomicU32::new(1.0_f32.to_bits()));
        let buffer = Arc::new(Mutex::new(VecDeque::new()));
        let volume_for_thread = volume.clone();
        let buffer_for_thread = buffer.clone();

        std::thread::Builder::new()
            .name("voxlink-playback".to_string())
            .spawn(move || {
                let stream = match open_output(volume_for_thread, buffer_for_thread) {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = stop_rx.recv();
                drop(stream);
            })?;

        let device_rate = ready_rx
            .await
            .map_err(|_| Error::UnsupportedPlatform("playback thread exited".to_string()))??;
        let resampler = StreamResampler::for_rates(source_rate, device_rate)?;

        Ok(Arc::new(Self {
            id: id.to_string(),
            volume,
            buffer,
            device_rate,
            resampler: Mutex::new(resampler),
            stop_tx: Mutex::new(Some(stop_tx)),
        }))
    }

    /// Queues decoded samples at the source rate.
    pub fn push(&self, samples: &[f32]) -> Result<()> {
        let resampled = self.resampler.lock().process(samples)?;
        let mut buffer = self.buffer.lock();
        buffer.extend(resampled);
        // Keep latency bounded to roughly half a second
        let cap = self.device_rate as usize / 2;
        if buffer.len() > cap {
            let excess = buffer.len() - cap;
            buffer.drain(..excess);
        }
        Ok(())
    }
}

impl RemoteTrack for Playback {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_volume(&self, volume: f32) {
        self.volume
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.send(());
            self.buffer.lock().clear();
            self.resampler.lock().reset();
        }
    }
}

fn open_output(
    volume: Arc<AtomicU32>,
    buffer: Arc<Mutex<VecDeque<f32>>>,
) -> Result<(cpal::Stream, u32)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::DeviceNotFound("no default output device".to_string()))?;
    let supported = device.default_output_config()?;
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    let channels = config.channels.max(1) as usize;
    let rate = config.sample_rate.0;

    let source = move |frames: usize| -> Vec<f32> {
        let gain = f32::from_bits(volume.load(Ordering::Relaxed));
        let mut buffer = buffer.lock();
        (0..frames)
            .map(|_| buffer.pop_front().unwrap_or(0.0) * gain)
            .collect()
    };

    let stream = match sample_format {
        cpal::SampleFormat::F32 => build_output::<f32>(&device, &config, channels, source)?,
        cpal::SampleFormat::I16 => build_output::<i16>(&device, &config, channels, source)?,
        cpal::SampleFormat::U16 => build_output::<u16>(&device, &config, channels, source)?,
        other => {
            return Err(Error::UnsupportedPlatform(format!(
                "sample format {:?}",
                other
            )))
        }
    };
    stream.play()?;

    Ok((stream, rate))
}

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    channels: usize,
    mut source: impl FnMut(usize) -> Vec<f32> + Send + 'static,
) -> Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let stream = device.build_output_stream(
        config,
        move |output: &mut [T], _: &cpal::OutputCallbackInfo| {
            let samples = source(output.len() / channels);
            for (frame, sample) in output.chunks_mut(channels).zip(samples) {
                // write the sample to all the channels
                frame.fill(T::from_sample(sample));
            }
        },
        |err| error!("Error in output stream: {}", err),
        None,
    )?;
    Ok(stream)
}
