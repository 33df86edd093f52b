//! cpal output stream
//!
//! ```text
//! ┌──────────────────┐   push()    ┌─────────────────────┐
//! │ PlaybackController│───────────►│   Command Queue     │
//! │  (control thread) │            │  (lock-free SPSC)   │
//! └──────────────────┘             └──────────┬──────────┘
//!         ▲                                   │ pop()
//!         │ atomics + event ring              ▼
//!         │                        ┌─────────────────────┐
//!         └────────────────────────│  cpal audio thread  │
//!                                  │ (owns PlaybackEngine)│
//!                                  └─────────────────────┘
//! ```
//!
//! The engine is moved into the stream closure; nothing is shared behind a
//! mutex.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{BufferSize as CpalBufferSize, SampleFormat, Stream, StreamConfig};

use super::callback::OutputCallback;
use super::config::AudioConfig;
use super::device::{default_output_device, find_device_by_id};
use super::error::{AudioError, AudioResult};
use crate::config::EngineConfig;
use crate::engine::PlaybackController;
use crate::types::DEFAULT_SAMPLE_RATE;

/// Keeps the output stream alive. Drop it to stop audio.
pub struct AudioHandle {
    _stream: Stream,
    device_name: String,
    sample_rate: u32,
    buffer_size: u32,
    channels: u16,
}

impl AudioHandle {
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Requested buffer size in frames
    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// One-way output latency in milliseconds
    pub fn latency_ms(&self) -> f32 {
        (self.buffer_size as f32 / self.sample_rate as f32) * 1000.0
    }
}

/// Open the configured output device, create the engine at the device rate
/// and start streaming.
///
/// Fails before any audio runs when the device cannot be opened or its
/// buffer does not fit the engine's preallocated block.
pub fn start_audio_system(config: &EngineConfig) -> AudioResult<(AudioHandle, PlaybackController)> {
    let device = match &config.audio.device {
        Some(id) => find_device_by_id(id)?,
        None => default_output_device()?,
    };
    let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    log::info!("Using audio device: {}", device_name);

    let (supported, buffer_size) = get_output_config(&device, &config.audio)?;
    let sample_rate = supported.sample_rate().0;
    let stream_config = StreamConfig {
        channels: supported.channels(),
        sample_rate: supported.sample_rate(),
        buffer_size: CpalBufferSize::Fixed(buffer_size),
    };

    let (controller, engine) = PlaybackController::new(config, sample_rate);
    let channels = stream_config.channels as usize;
    let callback = OutputCallback::new(engine, channels, buffer_size as usize)?;
    let stream = build_output_stream(&device, &stream_config, callback)?;
    stream
        .play()
        .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

    let handle = AudioHandle {
        _stream: stream,
        device_name,
        sample_rate,
        buffer_size,
        channels: stream_config.channels,
    };
    log::info!(
        "Audio stream started: {} channels, {}Hz, {} frames (~{:.1}ms latency)",
        handle.channels,
        sample_rate,
        buffer_size,
        handle.latency_ms()
    );
    Ok((handle, controller))
}

/// Pick the stream configuration: `f32`, at least stereo, at the requested
/// rate when the device supports it.
fn get_output_config(
    device: &cpal::Device,
    config: &AudioConfig,
) -> AudioResult<(cpal::SupportedStreamConfig, u32)> {
    let supported_configs: Vec<_> = device
        .supported_output_configs()
        .map_err(|e| AudioError::ConfigError(e.to_string()))?
        .filter(|c| c.sample_format() == SampleFormat::F32)
        .collect();

    if supported_configs.is_empty() {
        return Err(AudioError::UnsupportedFormat(
            "device offers no f32 output configuration".to_string(),
        ));
    }

    let target_rate = config.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE);
    let supports_rate = |c: &&cpal::SupportedStreamConfigRange| {
        (c.min_sample_rate().0..=c.max_sample_rate().0).contains(&target_rate)
    };

    let best = supported_configs
        .iter()
        .filter(|c| c.channels() >= 2)
        .find(supports_rate)
        .or_else(|| supported_configs.iter().find(supports_rate))
        .or_else(|| supported_configs.iter().find(|c| c.channels() >= 2))
        .or_else(|| supported_configs.first())
        .ok_or_else(|| {
            AudioError::ConfigError("No suitable output configuration found".to_string())
        })?;

    let sample_rate = if supports_rate(&best) {
        cpal::SampleRate(target_rate)
    } else {
        let fallback = best.max_sample_rate();
        log::warn!(
            "Audio device doesn't support {}Hz, falling back to {}Hz (sources will be resampled)",
            target_rate,
            fallback.0
        );
        fallback
    };

    let buffer_size = config.buffer_size.frames();
    log::debug!("Selected buffer size: {} frames ({:?})", buffer_size, config.buffer_size);

    Ok((best.clone().with_sample_rate(sample_rate), buffer_size))
}

fn build_output_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    mut callback: OutputCallback,
) -> AudioResult<Stream> {
    device
        .build_output_stream(
            config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| callback.render(data),
            move |err| {
                log::error!("Output stream error: {}", err);
            },
            None,
        )
        .map_err(|e| AudioError::StreamBuildError(e.to_string()))
}
