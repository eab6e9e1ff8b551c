//! Audio capture and playback using CPAL and Rodio
//!
//! The session core only sees the `AudioDevices`, `CaptureStream` and
//! `OutputSink` traits. `SystemAudio` is the bare-metal implementation.

use crate::codec::PcmBuffer;
use crate::error::{VoiceError, VoiceResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use rodio::source::EmptyCallback;
use rodio::{buffer::SamplesBuffer, OutputStream, OutputStreamHandle, Sink, Source};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Identifier of one scheduled playback unit.
pub type PlaybackId = u64;

/// Microphone capture configuration
///
/// The device is opened at its own default format; frames are always
/// delivered as mono at `sample_rate`.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Sample rate of delivered frames in Hz (default: 16000, what the live service expects)
    pub sample_rate: u32,

    /// Samples per outbound frame (default: 4096, ~256ms at 16kHz)
    pub frame_size: usize,

    /// Frames buffered between the capture thread and the session before
    /// new frames are dropped (default: 8)
    pub queue_depth: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            frame_size: 4096,
            queue_depth: 8,
        }
    }
}

/// Speaker output configuration
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Default rate of decoded fragments (24000 Hz from the live service)
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24000,
            channels: 1,
        }
    }
}

/// Audio frame sent from the capture thread
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Mono samples (f32, normalized to -1.0 to 1.0) at the capture rate
    pub samples: Vec<f32>,
}

/// A running microphone stream. Stopping releases the device.
pub trait CaptureStream {
    fn stop(&mut self);
}

/// An output device with its own clock, able to start buffers at a given time.
pub trait OutputSink {
    /// Output clock in seconds since the sink was opened.
    fn current_time(&self) -> f64;

    /// False once closed (or if the device went away).
    fn is_running(&self) -> bool;

    /// Start `buffer` at `start_at` on the output clock. When it finishes
    /// naturally the sink reports `id` on its `ended` channel.
    fn schedule(&mut self, id: PlaybackId, buffer: &PcmBuffer, start_at: f64) -> VoiceResult<()>;

    /// Force-stop a scheduled unit. Unknown ids are ignored.
    fn stop_source(&mut self, id: PlaybackId);

    /// Fire-and-forget playback starting now; no completion is reported.
    fn play_oneshot(&mut self, buffer: &PcmBuffer) -> VoiceResult<()>;

    fn close(&mut self);
}

/// Factory for the two devices a session needs.
pub trait AudioDevices {
    fn open_capture(
        &mut self,
        config: &CaptureConfig,
        frames: mpsc::Sender<AudioChunk>,
    ) -> VoiceResult<Box<dyn CaptureStream>>;

    fn open_output(
        &mut self,
        config: &PlaybackConfig,
        ended: mpsc::UnboundedSender<PlaybackId>,
    ) -> VoiceResult<Box<dyn OutputSink>>;
}

/// Default host devices: CPAL microphone, Rodio speakers.
#[derive(Debug, Default)]
pub struct SystemAudio;

impl AudioDevices for SystemAudio {
    fn open_capture(
        &mut self,
        config: &CaptureConfig,
        frames: mpsc::Sender<AudioChunk>,
    ) -> VoiceResult<Box<dyn CaptureStream>> {
        let capture = AudioCapture::new(config.clone())?;
        Ok(Box::new(capture.start_capture(frames)?))
    }

    fn open_output(
        &mut self,
        config: &PlaybackConfig,
        ended: mpsc::UnboundedSender<PlaybackId>,
    ) -> VoiceResult<Box<dyn OutputSink>> {
        Ok(Box::new(RodioSink::new(config, ended)?))
    }
}

/// Audio capture system using CPAL
pub struct AudioCapture {
    config: CaptureConfig,
    device: Device,
    stream_config: StreamConfig,
    sample_format: SampleFormat,
}

impl AudioCapture {
    /// Create a new audio capture system on the default input device
    pub fn new(config: CaptureConfig) -> VoiceResult<Self> {
        if config.sample_rate == 0 {
            return Err(VoiceError::Config("Capture sample rate must be non-zero".to_string()));
        }

        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| VoiceError::AudioDevice("No input device available".to_string()))?;

        info!(
            "📱 Using input device: {}",
            device.name().unwrap_or_else(|_| "Unknown".to_string())
        );

        // Open at whatever the device prefers; conversion happens in the callback.
        let default_config = device.default_input_config()?;
        info!(
            "🎤 Initializing audio capture ({}Hz x{} → {}Hz mono)",
            default_config.sample_rate().0,
            default_config.channels(),
            config.sample_rate
        );

        Ok(Self {
            config,
            device,
            sample_format: default_config.sample_format(),
            stream_config: default_config.into(),
        })
    }

    /// Start capturing and push fixed-size frames into `frame_tx`.
    ///
    /// Frames are offered with `try_send`: when the session is not draining
    /// the queue (e.g. still connecting) new frames are dropped.
    pub fn start_capture(self, frame_tx: mpsc::Sender<AudioChunk>) -> VoiceResult<CpalCaptureStream> {
        info!("▶️ Starting audio capture stream");

        let stream = match self.sample_format {
            SampleFormat::I16 => self.build_stream::<i16>(frame_tx)?,
            SampleFormat::U16 => self.build_stream::<u16>(frame_tx)?,
            SampleFormat::F32 => self.build_stream::<f32>(frame_tx)?,
            other => {
                return Err(VoiceError::AudioStream(format!(
                    "Unsupported input sample format: {:?}",
                    other
                )))
            }
        };

        stream.play()?;

        info!("✅ Audio capture started");

        Ok(CpalCaptureStream {
            stream: Some(stream),
        })
    }

    fn build_stream<T>(&self, frame_tx: mpsc::Sender<AudioChunk>) -> VoiceResult<Stream>
    where
        T: SizedSample,
        f32: FromSample<T>,
    {
        let frame_size = self.config.frame_size.max(1);
        let mut resampler = MonoResampler::new(
            self.stream_config.channels,
            self.stream_config.sample_rate.0,
            self.config.sample_rate,
        );
        let mut frame = Vec::with_capacity(frame_size);
        let mut dropped: u64 = 0;

        let stream = self.device.build_input_stream(
            &self.stream_config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let input: Vec<f32> = data.iter().map(|&s| f32::from_sample(s)).collect();
                for sample in resampler.process(&input) {
                    frame.push(sample);

                    if frame.len() >= frame_size {
                        let chunk = AudioChunk {
                            samples: std::mem::replace(&mut frame, Vec::with_capacity(frame_size)),
                        };
                        match frame_tx.try_send(chunk) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                dropped += 1;
                                if dropped % 32 == 1 {
                                    debug!("Capture queue full, dropped {} frames", dropped);
                                }
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => return,
                        }
                    }
                }
            },
            move |err| {
                warn!("Audio stream error: {}", err);
            },
            None,
        )?;

        Ok(stream)
    }

    /// Names of the available input devices.
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let devices = cpal::default_host().input_devices()?;
        Ok(devices.filter_map(|device| device.name().ok()).collect())
    }
}

/// Downmixes interleaved device audio to mono and resamples it to the
/// capture rate by linear interpolation. Phase carries over between
/// callbacks so block boundaries add no clicks or drift.
#[derive(Debug, Clone)]
pub struct MonoResampler {
    channels: usize,
    /// Input frames advanced per output sample.
    step: f64,
    /// Next read position, in input frames relative to the current block.
    /// -1.0 addresses the last frame of the previous block.
    position: f64,
    last: f32,
}

impl MonoResampler {
    pub fn new(channels: u16, from_rate: u32, to_rate: u32) -> Self {
        Self {
            channels: usize::from(channels.max(1)),
            step: f64::from(from_rate.max(1)) / f64::from(to_rate.max(1)),
            position: 0.0,
            last: 0.0,
        }
    }

    /// Convert one block of interleaved samples. A trailing partial frame is ignored.
    pub fn process(&mut self, interleaved: &[f32]) -> Vec<f32> {
        let mono: Vec<f32> = interleaved
            .chunks_exact(self.channels)
            .map(|frame| frame.iter().sum::<f32>() / self.channels as f32)
            .collect();
        let Some(&tail) = mono.last() else {
            return Vec::new();
        };

        let at = |i: isize| if i < 0 { self.last } else { mono[i as usize] };
        let end = (mono.len() - 1) as f64;
        let mut out = Vec::with_capacity((mono.len() as f64 / self.step) as usize + 1);
        let mut position = self.position;
        while position <= end {
            let index = position.floor();
            let frac = (position - index) as f32;
            let a = at(index as isize);
            let b = if frac > 0.0 { at(index as isize + 1) } else { a };
            out.push(a + (b - a) * frac);
            position += self.step;
        }

        self.position = position - mono.len() as f64;
        self.last = tail;
        out
    }
}

/// Keeps the CPAL stream alive until stopped.
pub struct CpalCaptureStream {
    stream: Option<Stream>,
}

impl CaptureStream for CpalCaptureStream {
    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                debug!("Pausing capture stream failed: {}", e);
            }
            info!("⏹️ Audio capture stopped");
        }
    }
}

/// Rodio output: one `Sink` per scheduled fragment so each can be cut individually.
pub struct RodioSink {
    output: Option<(OutputStream, OutputStreamHandle)>,
    epoch: Instant,
    sinks: HashMap<PlaybackId, Sink>,
    ended_tx: mpsc::UnboundedSender<PlaybackId>,
}

impl RodioSink {
    /// Open the default output device.
    pub fn new(config: &PlaybackConfig, ended_tx: mpsc::UnboundedSender<PlaybackId>) -> VoiceResult<Self> {
        info!("🔊 Initializing audio playback ({}Hz default)", config.sample_rate);

        let (stream, handle) =
            OutputStream::try_default().map_err(|e| VoiceError::Playback(e.to_string()))?;

        info!("✅ Audio playback initialized");

        Ok(Self {
            output: Some((stream, handle)),
            epoch: Instant::now(),
            sinks: HashMap::new(),
            ended_tx,
        })
    }

    fn handle(&self) -> VoiceResult<&OutputStreamHandle> {
        self.output
            .as_ref()
            .map(|(_, handle)| handle)
            .ok_or_else(|| VoiceError::Playback("Output closed".to_string()))
    }

    /// Rodio asserts on a zero rate or channel count; refuse those here.
    fn source(buffer: &PcmBuffer) -> VoiceResult<SamplesBuffer<f32>> {
        if buffer.sample_rate() == 0 || buffer.channel_count() == 0 {
            return Err(VoiceError::Playback(format!(
                "Unplayable buffer format ({}Hz x{})",
                buffer.sample_rate(),
                buffer.channel_count()
            )));
        }
        Ok(SamplesBuffer::new(
            buffer.channel_count(),
            buffer.sample_rate(),
            buffer.interleaved(),
        ))
    }
}

impl OutputSink for RodioSink {
    fn current_time(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    fn is_running(&self) -> bool {
        self.output.is_some()
    }

    fn schedule(&mut self, id: PlaybackId, buffer: &PcmBuffer, start_at: f64) -> VoiceResult<()> {
        self.sinks.retain(|_, sink| !sink.empty());

        let source = Self::source(buffer)?;
        let sink = Sink::try_new(self.handle()?).map_err(|e| VoiceError::Playback(e.to_string()))?;
        let delay = Duration::from_secs_f64((start_at - self.current_time()).max(0.0));
        sink.append(source.delay(delay));

        let ended_tx = self.ended_tx.clone();
        sink.append(EmptyCallback::<f32>::new(Box::new(move || {
            let _ = ended_tx.send(id);
        })));

        debug!(
            "Scheduled fragment {} ({:.3}s @ {}Hz) in {:?}",
            id,
            buffer.duration_secs(),
            buffer.sample_rate(),
            delay
        );
        self.sinks.insert(id, sink);
        Ok(())
    }

    fn stop_source(&mut self, id: PlaybackId) {
        if let Some(sink) = self.sinks.remove(&id) {
            sink.stop();
        }
    }

    fn play_oneshot(&mut self, buffer: &PcmBuffer) -> VoiceResult<()> {
        let source = Self::source(buffer)?;
        self.handle()?
            .play_raw(source)
            .map_err(|e| VoiceError::Playback(e.to_string()))
    }

    fn close(&mut self) {
        for (_, sink) in self.sinks.drain() {
            sink.stop();
        }
        if self.output.take().is_some() {
            info!("⏹️ Audio playback closed");
        }
    }
}

impl Drop for RodioSink {
    fn drop(&mut self) {
        self.close();
    }
}
