//! Time-stretching via signalsmith-stretch
//!
//! Wraps the signalsmith-stretch library to change playback speed without
//! changing pitch. The stretcher is an elastic buffer: every call maps an
//! arbitrary number of input frames onto the requested number of output
//! frames, and the ratio between the two is the effective speed.
//!
//! Small speed changes ramp linearly over one grain through [`SpeedGlide`].
//! Seeks, loop wraps, mono switches and speed jumps larger than
//! [`GLIDE_THRESHOLD`] go through [`TimeStretcher::restart`]: the fresh
//! context is pre-rolled with the input just before the new position, and
//! the replaced context's flushed output is overlapped onto the first
//! output latency of the new one.

mod glide;

pub use glide::{clamp_speed_ratio, SpeedChange, SpeedGlide, GLIDE_THRESHOLD, GRAIN_FRAMES};

use serde::{Deserialize, Serialize};
use signalsmith_stretch::Stretch;

use crate::types::StereoSample;

/// Slowest supported playback speed
pub const MIN_SPEED_RATIO: f64 = 0.1;

/// Fastest supported playback speed
pub const MAX_SPEED_RATIO: f64 = 4.0;

/// Pre-roll given to a restarted context: one analysis block plus one hop
/// of the largest preset
pub const PREROLL_SECONDS: f64 = 0.15;

/// Fade at the end of a flushed tail
const TAIL_FADE_FRAMES: usize = 64;

/// Pre-roll length in frames at `sample_rate`
pub fn preroll_frames(sample_rate: u32) -> usize {
    (PREROLL_SECONDS * sample_rate as f64).ceil() as usize
}

/// signalsmith preset used for the stretch context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StretchQuality {
    /// `preset_cheaper`: 30-50% faster, slightly lower quality
    Cheaper,
    /// `preset_default`
    #[default]
    Default,
}

fn build_stretch(channels: u32, sample_rate: u32, quality: StretchQuality) -> Stretch {
    match quality {
        StretchQuality::Cheaper => Stretch::preset_cheaper(channels, sample_rate),
        StretchQuality::Default => Stretch::preset_default(channels, sample_rate),
    }
}

/// Per-source time stretcher
///
/// Holds the stretch context (signalsmith history and grain state) for one
/// source. A stereo and a mono context are kept side by side so the engine
/// can drop to mono processing under overload without allocating.
pub struct TimeStretcher {
    stereo: Stretch,
    mono: Stretch,
    mono_active: bool,
    /// Context that produced the last output, flushed on restart
    output_from_mono: bool,
    has_output: bool,
    glide: SpeedGlide,
    mono_in: Vec<f32>,
    mono_out: Vec<f32>,
    /// Flushed output of the replaced context
    tail: Vec<StereoSample>,
    tail_mono: Vec<f32>,
    tail_len: usize,
    tail_pos: usize,
    sample_rate: u32,
}

impl TimeStretcher {
    /// Create a stretcher able to take up to `max_input_frames` and emit up to
    /// `max_output_frames` per call.
    pub fn new(
        sample_rate: u32,
        quality: StretchQuality,
        max_input_frames: usize,
        max_output_frames: usize,
    ) -> Self {
        let stereo = build_stretch(2, sample_rate, quality);
        let mono = build_stretch(1, sample_rate, quality);
        let tail_frames = stereo.output_latency().max(mono.output_latency());

        Self {
            stereo,
            mono,
            mono_active: false,
            output_from_mono: false,
            has_output: false,
            glide: SpeedGlide::new(1.0),
            mono_in: vec![0.0; max_input_frames],
            mono_out: vec![0.0; max_output_frames],
            tail: vec![StereoSample::silence(); tail_frames],
            tail_mono: vec![0.0; tail_frames],
            tail_len: 0,
            tail_pos: 0,
            sample_rate,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Request a new speed. Out-of-range values are clamped.
    ///
    /// On [`SpeedChange::Jump`] the caller restarts the context with
    /// pre-roll from its source.
    pub fn set_speed_ratio(&mut self, ratio: f64) -> SpeedChange {
        self.glide.set_target(ratio)
    }

    /// Target speed ratio
    pub fn speed_ratio(&self) -> f64 {
        self.glide.target()
    }

    /// Speed ratio in effect right now (differs from the target mid-glide)
    pub fn current_ratio(&self) -> f64 {
        self.glide.current()
    }

    /// Switch between stereo and mono (fold, stretch, duplicate) processing.
    ///
    /// Returns true when the mode changed; the newly active context must then
    /// be restarted.
    pub fn set_mono(&mut self, mono: bool) -> bool {
        if mono == self.mono_active {
            return false;
        }
        self.mono_active = mono;
        true
    }

    pub fn is_mono(&self) -> bool {
        self.mono_active
    }

    /// Input latency in frames
    pub fn input_latency(&self) -> usize {
        self.stereo.input_latency()
    }

    /// Output latency in frames
    pub fn output_latency(&self) -> usize {
        self.stereo.output_latency()
    }

    /// Frames of the replaced context's tail still to be overlapped
    pub fn tail_remaining(&self) -> usize {
        self.tail_len - self.tail_pos
    }

    /// Start over at a new position.
    ///
    /// `preroll` is the input leading up to that position (possibly empty).
    /// Whatever the previous context still had to say is flushed and mixed
    /// into the next output.
    pub fn restart(&mut self, preroll: &[StereoSample]) {
        self.capture_tail();
        self.stereo.reset();
        self.mono.reset();
        if preroll.is_empty() {
            return;
        }

        let rate = self.glide.current();
        if self.mono_active {
            let m = preroll.len().min(self.mono_in.len());
            let skip = preroll.len() - m;
            for (dst, src) in self.mono_in[..m].iter_mut().zip(&preroll[skip..]) {
                *dst = src.fold();
            }
            self.mono.seek(&self.mono_in[..m], rate);
        } else {
            let interleaved: &[f32] = bytemuck::cast_slice(preroll);
            self.stereo.seek(interleaved, rate);
        }
    }

    fn capture_tail(&mut self) {
        self.tail_len = 0;
        self.tail_pos = 0;
        if !self.has_output {
            return;
        }
        self.has_output = false;

        if self.output_from_mono {
            self.tail_mono.fill(0.0);
            self.mono.flush(&mut self.tail_mono[..]);
            for (dst, &s) in self.tail.iter_mut().zip(&self.tail_mono) {
                *dst = StereoSample::mono(s);
            }
        } else {
            let interleaved: &mut [f32] = bytemuck::cast_slice_mut(&mut self.tail[..]);
            interleaved.fill(0.0);
            self.stereo.flush(interleaved);
        }

        let len = self.tail.len();
        let fade = TAIL_FADE_FRAMES.min(len);
        for (i, sample) in self.tail[len - fade..].iter_mut().enumerate() {
            *sample = *sample * (1.0 - (i + 1) as f32 / fade as f32);
        }
        self.tail_len = len;
    }

    /// Stretch `input` onto `output`.
    ///
    /// The effective ratio is `input.len() / output.len()`. Any lengths are
    /// accepted; an empty input yields silence (plus any pending tail).
    pub fn process(&mut self, input: &[StereoSample], output: &mut [StereoSample]) {
        self.glide.advance(output.len());
        if output.is_empty() {
            return;
        }

        if input.is_empty() {
            output.fill(StereoSample::silence());
        } else {
            if self.mono_active {
                self.process_mono(input, output);
            } else {
                let input_interleaved: &[f32] = bytemuck::cast_slice(input);
                let output_interleaved: &mut [f32] = bytemuck::cast_slice_mut(output);
                output_interleaved.fill(0.0);
                self.stereo.process(input_interleaved, output_interleaved);
            }
            self.has_output = true;
            self.output_from_mono = self.mono_active;
        }

        self.overlap_tail(output);
    }

    fn process_mono(&mut self, input: &[StereoSample], output: &mut [StereoSample]) {
        let m = input.len().min(self.mono_in.len());
        let n = output.len().min(self.mono_out.len());

        for (dst, src) in self.mono_in[..m].iter_mut().zip(input) {
            *dst = src.fold();
        }
        self.mono_out[..n].fill(0.0);
        self.mono.process(&self.mono_in[..m], &mut self.mono_out[..n]);

        for (dst, &s) in output[..n].iter_mut().zip(&self.mono_out[..n]) {
            *dst = StereoSample::mono(s);
        }
        output[n..].fill(StereoSample::silence());
    }

    fn overlap_tail(&mut self, output: &mut [StereoSample]) {
        let n = self.tail_remaining().min(output.len());
        if n == 0 {
            return;
        }
        let tail = &self.tail[self.tail_pos..self.tail_pos + n];
        for (dst, src) in output[..n].iter_mut().zip(tail) {
            dst.left += src.left;
            dst.right += src.right;
        }
        self.tail_pos += n;
    }
}
