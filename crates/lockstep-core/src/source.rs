//! Sample sources - the capability the engine pulls audio from
//!
//! A [`SampleSource`] yields interleaved PCM frames at its own native rate and
//! channel count, starting at any frame offset. File decoding lives outside
//! this crate; decoders plug in by implementing the trait. Two in-memory
//! implementations are provided for synthetic material and tests.

use std::f32::consts::TAU;

use crate::types::{Sample, StereoSample};

/// Result of a [`SampleSource::read`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The output slice was filled
    Ready,
    /// Data was not available without blocking; the caller zero-fills
    Underrun,
    /// The source could not decode the requested span; the caller zero-fills
    Failed,
}

/// Capability interface for anything the engine can play.
///
/// `read` is called from the real-time thread and must not block, allocate
/// or take locks. A source that cannot answer immediately returns
/// [`ReadOutcome::Underrun`]. Frames before zero or past the end of the
/// material are silence.
pub trait SampleSource: Send + Sync {
    /// Fill `out` with `frames` interleaved frames starting at `start_frame`.
    ///
    /// `out.len()` is exactly `frames * channel_count()`.
    fn read(&self, start_frame: i64, frames: usize, out: &mut [Sample]) -> ReadOutcome;

    /// Native sample rate in Hz
    fn native_sample_rate(&self) -> u32;

    /// Number of interleaved channels
    fn channel_count(&self) -> usize;

    /// Total length in frames, `None` for unbounded material
    fn length_frames(&self) -> Option<u64> {
        None
    }

    /// Human-readable label for logs
    fn label(&self) -> &str {
        "source"
    }
}

/// Fold `frames` interleaved frames of `channels` channels into stereo.
///
/// Mono is duplicated, stereo is copied, wider layouts keep their first two
/// channels.
pub fn interleaved_to_stereo(
    input: &[Sample],
    channels: usize,
    frames: usize,
    output: &mut [StereoSample],
) {
    match channels {
        0 => output[..frames].fill(StereoSample::silence()),
        1 => {
            for (dst, &s) in output[..frames].iter_mut().zip(input) {
                *dst = StereoSample::mono(s);
            }
        }
        _ => {
            for (dst, frame) in output[..frames].iter_mut().zip(input.chunks_exact(channels)) {
                *dst = StereoSample::new(frame[0], frame[1]);
            }
        }
    }
}

/// Fully decoded material held in memory
pub struct BufferSource {
    label: String,
    samples: Vec<Sample>,
    sample_rate: u32,
    channels: usize,
}

impl BufferSource {
    /// Wrap interleaved samples. Trailing partial frames are dropped.
    pub fn new(
        label: impl Into<String>,
        mut samples: Vec<Sample>,
        sample_rate: u32,
        channels: usize,
    ) -> Self {
        let channels = channels.max(1);
        let whole = samples.len() - samples.len() % channels;
        samples.truncate(whole);
        Self {
            label: label.into(),
            samples,
            sample_rate,
            channels,
        }
    }

    /// Interleaved sample data
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }
}

impl SampleSource for BufferSource {
    fn read(&self, start_frame: i64, frames: usize, out: &mut [Sample]) -> ReadOutcome {
        let ch = self.channels;
        let total = (self.samples.len() / ch) as i64;
        out.fill(0.0);

        let first = start_frame.max(0);
        let last = (start_frame + frames as i64).min(total);
        if first < last {
            let dst_offset = (first - start_frame) as usize * ch;
            let src = &self.samples[first as usize * ch..last as usize * ch];
            out[dst_offset..dst_offset + src.len()].copy_from_slice(src);
        }
        ReadOutcome::Ready
    }

    fn native_sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channel_count(&self) -> usize {
        self.channels
    }

    fn length_frames(&self) -> Option<u64> {
        Some((self.samples.len() / self.channels) as u64)
    }

    fn label(&self) -> &str {
        &self.label
    }
}

/// Synthetic sine tone, computed on demand
pub struct ToneSource {
    label: String,
    frequency: f32,
    amplitude: f32,
    sample_rate: u32,
    channels: usize,
    length: Option<u64>,
}

impl ToneSource {
    pub fn new(frequency: f32, amplitude: f32, sample_rate: u32, channels: usize) -> Self {
        Self {
            label: format!("tone {frequency}Hz"),
            frequency,
            amplitude,
            sample_rate,
            channels: channels.max(1),
            length: None,
        }
    }

    /// Limit the tone to `frames` frames
    pub fn with_length(mut self, frames: u64) -> Self {
        self.length = Some(frames);
        self
    }

    #[inline]
    fn value_at(&self, frame: i64) -> Sample {
        if frame < 0 || self.length.is_some_and(|len| frame as u64 >= len) {
            return 0.0;
        }
        // Phase wraps per period to keep precision over long sessions
        let period = self.sample_rate as f64 / self.frequency as f64;
        let phase = (frame as f64 % period) / period;
        (phase as f32 * TAU).sin() * self.amplitude
    }
}

impl SampleSource for ToneSource {
    fn read(&self, start_frame: i64, frames: usize, out: &mut [Sample]) -> ReadOutcome {
        for (i, frame) in out.chunks_exact_mut(self.channels).take(frames).enumerate() {
            frame.fill(self.value_at(start_frame + i as i64));
        }
        ReadOutcome::Ready
    }

    fn native_sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channel_count(&self) -> usize {
        self.channels
    }

    fn length_frames(&self) -> Option<u64> {
        self.length
    }

    fn label(&self) -> &str {
        &self.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_source_pads_outside_material() {
        let source = BufferSource::new("ramp", vec![1.0, 2.0, 3.0, 4.0], 44100, 1);
        let mut out = [9.0; 6];

        assert_eq!(source.read(-2, 6, &mut out), ReadOutcome::Ready);
        assert_eq!(out, [0.0, 0.0, 1.0, 2.0, 3.0, 4.0]);

        source.read(3, 3, &mut out[..3]);
        assert_eq!(&out[..3], &[4.0, 0.0, 0.0]);
        assert_eq!(source.length_frames(), Some(4));
    }

    #[test]
    fn test_buffer_source_drops_partial_frame() {
        let source = BufferSource::new("odd", vec![0.1, 0.2, 0.3], 48000, 2);
        assert_eq!(source.length_frames(), Some(1));
    }

    #[test]
    fn test_tone_source_is_silent_past_length() {
        let tone = ToneSource::new(1000.0, 0.5, 48000, 2).with_length(10);
        let mut out = [1.0; 8];
        tone.read(8, 4, &mut out);
        assert_eq!(&out[4..], &[0.0; 4]);
        assert!(out[..4].iter().any(|s| *s != 0.0));
    }

    #[test]
    fn test_interleaved_to_stereo_layouts() {
        let mut out = [StereoSample::silence(); 2];

        interleaved_to_stereo(&[0.5, -0.5], 1, 2, &mut out);
        assert_eq!(out[1], StereoSample::mono(-0.5));

        interleaved_to_stereo(&[0.1, 0.2, 0.3, 0.4, 0.5, 0.6], 3, 2, &mut out);
        assert_eq!(out[0], StereoSample::new(0.1, 0.2));
        assert_eq!(out[1], StereoSample::new(0.4, 0.5));
    }
}
