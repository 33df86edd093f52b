//! Device callback adapter
//!
//! Owns the [`PlaybackEngine`] inside the output callback and maps its
//! stereo blocks onto the device's interleaved `f32` layout.

use crate::engine::PlaybackEngine;
use crate::types::StereoSample;

use super::error::{AudioError, AudioResult};

/// Everything the output callback owns. Moved into the stream closure.
pub struct OutputCallback {
    engine: PlaybackEngine,
    scratch: Vec<StereoSample>,
    channels: usize,
}

impl OutputCallback {
    /// Prepare a callback for a device with `channels` channels that will
    /// request up to `buffer_frames` frames. Fails before the stream starts
    /// when the engine cannot hold a device buffer.
    pub fn new(
        mut engine: PlaybackEngine,
        channels: usize,
        buffer_frames: usize,
    ) -> AudioResult<Self> {
        let capacity = engine.max_block_frames();
        if buffer_frames > capacity {
            return Err(AudioError::InsufficientCapacity {
                requested: buffer_frames,
                available: capacity,
            });
        }
        if channels == 0 {
            return Err(AudioError::UnsupportedFormat("device has no output channels".to_string()));
        }
        engine.reset_for_stream_start();

        Ok(Self {
            engine,
            scratch: vec![StereoSample::silence(); capacity],
            channels,
        })
    }

    pub fn engine(&self) -> &PlaybackEngine {
        &self.engine
    }

    /// Fill an interleaved device buffer. Never allocates.
    pub fn render(&mut self, data: &mut [f32]) {
        let channels = self.channels;
        let chunk_samples = self.scratch.len() * channels;

        for device_chunk in data.chunks_mut(chunk_samples) {
            let frames = device_chunk.len() / channels;
            let block = &mut self.scratch[..frames];
            self.engine.process(block);
            write_interleaved(block, device_chunk, channels);
        }
    }
}

/// Map stereo frames onto `channels` interleaved channels: a mono device
/// gets the average, channels beyond the first two get silence.
pub fn write_interleaved(block: &[StereoSample], data: &mut [f32], channels: usize) {
    let mut frames = data.chunks_exact_mut(channels);
    for (frame, sample) in frames.by_ref().zip(block) {
        if channels == 1 {
            frame[0] = sample.fold();
            continue;
        }
        frame[0] = sample.left;
        frame[1] = sample.right;
        frame[2..].fill(0.0);
    }
    // Frames the engine did not render
    for frame in frames.by_ref() {
        frame.fill(0.0);
    }
    frames.into_remainder().fill(0.0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::PlaybackController;

    #[test]
    fn test_mono_device_gets_average() {
        let block = [StereoSample::new(0.5, 0.1), StereoSample::new(-0.2, 0.2)];
        let mut data = [9.0f32; 2];
        write_interleaved(&block, &mut data, 1);
        assert!((data[0] - 0.3).abs() < 1e-6);
        assert_eq!(data[1], 0.0);
    }

    #[test]
    fn test_extra_channels_are_silent() {
        let block = [StereoSample::new(0.5, -0.5)];
        let mut data = [9.0f32; 4];
        write_interleaved(&block, &mut data, 4);
        assert_eq!(data, [0.5, -0.5, 0.0, 0.0]);
    }

    #[test]
    fn test_oversized_device_buffer_is_rejected() {
        let config = EngineConfig {
            max_block_frames: 256,
            ..EngineConfig::default()
        };
        let (_controller, engine) = PlaybackController::new(&config, 48000);
        assert!(matches!(
            OutputCallback::new(engine, 2, 512),
            Err(AudioError::InsufficientCapacity {
                requested: 512,
                available: 256
            })
        ));
    }

    #[test]
    fn test_render_fills_whole_device_buffer() {
        let config = EngineConfig {
            max_block_frames: 128,
            ..EngineConfig::default()
        };
        let (controller, engine) = PlaybackController::new(&config, 48000);
        let mut callback = OutputCallback::new(engine, 2, 128).unwrap();

        // Device asks for more than one block: processed in chunks
        let mut data = vec![9.0f32; 300 * 2];
        callback.render(&mut data);
        assert!(data.iter().all(|s| *s == 0.0));
        assert_eq!(controller.playback_atomics().blocks_processed(), 3);
    }
}
