//! Streaming sample rate conversion via rubato
//!
//! [`RateConverter`] turns a source's native rate into the device rate, one
//! variable-length block at a time. Output counts follow the cumulative
//! rounding rule `produced(T) = round(T * out / in)` where `T` is the total
//! number of input frames fed since the last reset, so per-block rounding
//! never accumulates into drift.
//!
//! Rubato resamplers consume fixed chunks. Input is staged until a chunk is
//! complete and output lands in a FIFO that is primed with a little silence
//! at reset, which guarantees the exact frame count can always be delivered.
//! All buffers are sized at construction; `process` never allocates.

use std::collections::VecDeque;

use rubato::{
    FastFixedIn, PolynomialDegree, Resampler, SincFixedIn, SincInterpolationParameters,
    SincInterpolationType, WindowFunction,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::StereoSample;

/// Frames per rubato chunk. Small to keep the worst-case cost per block flat.
pub const CONVERTER_CHUNK_FRAMES: usize = 64;

/// Conversion quality tier, fixed for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConvertQuality {
    /// Linear polynomial interpolation
    Fastest,
    /// Septic polynomial interpolation
    #[default]
    Standard,
    /// Windowed sinc interpolation
    Highest,
}

/// Rate converter configuration errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConvertError {
    #[error("invalid sample rate conversion {input_rate}Hz -> {output_rate}Hz")]
    InvalidRate { input_rate: u32, output_rate: u32 },

    #[error("failed to construct resampler: {0}")]
    Construction(String),
}

enum Interpolator {
    Polynomial(FastFixedIn<f32>),
    Sinc(SincFixedIn<f32>),
}

impl Interpolator {
    fn new(quality: ConvertQuality, ratio: f64) -> Result<Self, ConvertError> {
        let construction =
            |e: rubato::ResamplerConstructionError| ConvertError::Construction(e.to_string());
        match quality {
            ConvertQuality::Fastest => FastFixedIn::<f32>::new(
                ratio,
                1.0,
                PolynomialDegree::Linear,
                CONVERTER_CHUNK_FRAMES,
                2,
            )
            .map(Interpolator::Polynomial)
            .map_err(construction),
            ConvertQuality::Standard => FastFixedIn::<f32>::new(
                ratio,
                1.0,
                PolynomialDegree::Septic,
                CONVERTER_CHUNK_FRAMES,
                2,
            )
            .map(Interpolator::Polynomial)
            .map_err(construction),
            ConvertQuality::Highest => {
                let params = SincInterpolationParameters {
                    sinc_len: 128,
                    f_cutoff: 0.95,
                    interpolation: SincInterpolationType::Linear,
                    oversampling_factor: 128,
                    window: WindowFunction::BlackmanHarris2,
                };
                SincFixedIn::<f32>::new(ratio, 1.0, params, CONVERTER_CHUNK_FRAMES, 2)
                    .map(Interpolator::Sinc)
                    .map_err(construction)
            }
        }
    }

    fn output_frames_max(&self) -> usize {
        match self {
            Interpolator::Polynomial(r) => r.output_frames_max(),
            Interpolator::Sinc(r) => r.output_frames_max(),
        }
    }

    /// Run one chunk. Returns the number of frames written per channel.
    fn process(
        &mut self,
        input: &[Vec<f32>],
        output: &mut [Vec<f32>],
        mask: Option<&[bool]>,
    ) -> usize {
        let result = match self {
            Interpolator::Polynomial(r) => r.process_into_buffer(input, output, mask),
            Interpolator::Sinc(r) => r.process_into_buffer(input, output, mask),
        };
        // Buffer sizes are fixed at construction, so a failure here means
        // nothing was produced; the FIFO priming absorbs the gap.
        result.map(|(_, written)| written).unwrap_or(0)
    }

    fn reset(&mut self) {
        match self {
            Interpolator::Polynomial(r) => r.reset(),
            Interpolator::Sinc(r) => r.reset(),
        }
    }
}

/// Chunk staging and output FIFO around a rubato resampler
struct ChunkedResampler {
    interpolator: Interpolator,
    staged_in: [Vec<f32>; 2],
    staged: usize,
    chunk_out: [Vec<f32>; 2],
    fifo: [VecDeque<f32>; 2],
    prime_frames: usize,
}

impl ChunkedResampler {
    fn new(quality: ConvertQuality, ratio: f64) -> Result<Self, ConvertError> {
        let interpolator = Interpolator::new(quality, ratio)?;
        let out_max = interpolator.output_frames_max();
        let prime_frames = (CONVERTER_CHUNK_FRAMES as f64 * ratio).ceil() as usize + 2;
        let fifo_capacity = 2 * (prime_frames + out_max) + 16;

        let mut resampler = Self {
            interpolator,
            staged_in: [vec![0.0; CONVERTER_CHUNK_FRAMES], vec![0.0; CONVERTER_CHUNK_FRAMES]],
            staged: 0,
            chunk_out: [vec![0.0; out_max], vec![0.0; out_max]],
            fifo: [
                VecDeque::with_capacity(fifo_capacity),
                VecDeque::with_capacity(fifo_capacity),
            ],
            prime_frames,
        };
        resampler.reset();
        Ok(resampler)
    }

    fn reset(&mut self) {
        self.interpolator.reset();
        self.staged = 0;
        for fifo in &mut self.fifo {
            fifo.clear();
            fifo.extend(std::iter::repeat(0.0).take(self.prime_frames));
        }
    }

    /// Feed `input` and write exactly `target` frames into `output`.
    fn process(
        &mut self,
        input: &[StereoSample],
        output: &mut [StereoSample],
        target: usize,
        mono: bool,
    ) {
        let mask: Option<&[bool]> = if mono { Some(&[true, false]) } else { None };
        let mut written = 0;

        for frame in input {
            if mono {
                // Only channel 0 is converted; it carries the fold
                self.staged_in[0][self.staged] = frame.fold();
            } else {
                self.staged_in[0][self.staged] = frame.left;
                self.staged_in[1][self.staged] = frame.right;
            }
            self.staged += 1;

            if self.staged == CONVERTER_CHUNK_FRAMES {
                self.staged = 0;
                let produced =
                    self.interpolator.process(&self.staged_in, &mut self.chunk_out, mask);
                let right = if mono { 0 } else { 1 };
                for i in 0..produced {
                    self.fifo[0].push_back(self.chunk_out[0][i]);
                    self.fifo[1].push_back(self.chunk_out[right][i]);
                }
                written = self.drain(output, written, target);
            }
        }

        written = self.drain(output, written, target);
        // Priming covers the worst-case deficit; pad any shortfall with silence
        output[written..target].fill(StereoSample::silence());
    }

    fn drain(&mut self, output: &mut [StereoSample], mut written: usize, target: usize) -> usize {
        while written < target {
            match (self.fifo[0].pop_front(), self.fifo[1].pop_front()) {
                (Some(left), Some(right)) => {
                    output[written] = StereoSample::new(left, right);
                    written += 1;
                }
                _ => break,
            }
        }
        written
    }
}

enum ConverterKind {
    Passthrough,
    Invalid,
    Resampling(Box<ChunkedResampler>),
}

/// Per-source sample rate converter
///
/// Stateful across calls; call [`RateConverter::reset`] whenever the source
/// position jumps discontinuously.
pub struct RateConverter {
    input_rate: u32,
    output_rate: u32,
    quality: ConvertQuality,
    kind: ConverterKind,
    consumed: u64,
    produced: u64,
    mono: bool,
    error: Option<ConvertError>,
}

impl RateConverter {
    /// Create a converter. Invalid rates produce a converter that outputs
    /// nothing and reports the problem once via [`RateConverter::take_config_error`].
    pub fn new(input_rate: u32, output_rate: u32, quality: ConvertQuality) -> Self {
        let (kind, error) = if input_rate == 0 || output_rate == 0 {
            (
                ConverterKind::Invalid,
                Some(ConvertError::InvalidRate { input_rate, output_rate }),
            )
        } else if input_rate == output_rate {
            (ConverterKind::Passthrough, None)
        } else {
            let ratio = output_rate as f64 / input_rate as f64;
            match ChunkedResampler::new(quality, ratio) {
                Ok(resampler) => (ConverterKind::Resampling(Box::new(resampler)), None),
                Err(e) => (ConverterKind::Invalid, Some(e)),
            }
        };

        if let Some(ref e) = error {
            log::warn!("RateConverter: {}", e);
        }

        Self {
            input_rate,
            output_rate,
            quality,
            kind,
            consumed: 0,
            produced: 0,
            mono: false,
            error,
        }
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    pub fn quality(&self) -> ConvertQuality {
        self.quality
    }

    /// True when the converter can produce output
    pub fn is_valid(&self) -> bool {
        !matches!(self.kind, ConverterKind::Invalid)
    }

    /// Return the configuration error the first time it is asked for
    pub fn take_config_error(&mut self) -> Option<ConvertError> {
        self.error.take()
    }

    /// Fold to mono, convert one channel and duplicate it (overload
    /// degradation)
    pub fn set_mono(&mut self, mono: bool) {
        self.mono = mono;
    }

    #[inline]
    fn cumulative_output(&self, total_in: u64) -> u64 {
        let out = self.output_rate as u128;
        let inp = self.input_rate as u128;
        ((total_in as u128 * out + inp / 2) / inp) as u64
    }

    /// Output frames the next `process` call yields for `input_frames` frames
    pub fn frames_out_for(&self, input_frames: usize) -> usize {
        match self.kind {
            ConverterKind::Passthrough => input_frames,
            ConverterKind::Invalid => 0,
            ConverterKind::Resampling(_) => {
                let total = self.cumulative_output(self.consumed + input_frames as u64);
                (total - self.produced) as usize
            }
        }
    }

    /// Smallest input length whose output covers `output_frames` frames
    pub fn frames_in_for(&self, output_frames: usize) -> usize {
        match self.kind {
            ConverterKind::Passthrough => output_frames,
            ConverterKind::Invalid => 0,
            ConverterKind::Resampling(_) => {
                let mut n = (output_frames as u64 * self.input_rate as u64
                    / self.output_rate as u64) as usize;
                while self.frames_out_for(n) < output_frames {
                    n += 1;
                }
                while n > 0 && self.frames_out_for(n - 1) >= output_frames {
                    n -= 1;
                }
                n
            }
        }
    }

    /// Convert `input`, writing `frames_out_for(input.len())` frames into
    /// `output`. Returns the number of frames written.
    pub fn process(&mut self, input: &[StereoSample], output: &mut [StereoSample]) -> usize {
        let target = self.frames_out_for(input.len());
        debug_assert!(output.len() >= target, "RateConverter output buffer too small");
        let target = target.min(output.len());

        match &mut self.kind {
            ConverterKind::Invalid => return 0,
            ConverterKind::Passthrough if self.mono => {
                for (dst, src) in output[..target].iter_mut().zip(input) {
                    *dst = StereoSample::mono(src.fold());
                }
            }
            ConverterKind::Passthrough => {
                output[..target].copy_from_slice(&input[..target]);
            }
            ConverterKind::Resampling(resampler) => {
                resampler.process(input, output, target, self.mono);
            }
        }

        self.consumed += input.len() as u64;
        self.produced += target as u64;
        target
    }

    /// Drop filter history and rounding state (after a seek)
    pub fn reset(&mut self) {
        if let ConverterKind::Resampling(resampler) = &mut self.kind {
            resampler.reset();
        }
        self.consumed = 0;
        self.produced = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(frames: usize, rate: u32, freq: f32) -> Vec<StereoSample> {
        (0..frames)
            .map(|i| {
                let v = (std::f32::consts::TAU * freq * i as f32 / rate as f32).sin() * 0.5;
                StereoSample::new(v, v)
            })
            .collect()
    }

    fn convert_all(
        converter: &mut RateConverter,
        input: &[StereoSample],
        block: usize,
    ) -> Vec<StereoSample> {
        let mut out = Vec::new();
        let mut scratch = vec![StereoSample::silence(); block * 4 + 16];
        for chunk in input.chunks(block) {
            let n = converter.process(chunk, &mut scratch);
            out.extend_from_slice(&scratch[..n]);
        }
        out
    }

    fn best_lag_rms(reference: &[StereoSample], candidate: &[StereoSample], max_lag: usize) -> f32 {
        let start = 4000;
        let len = reference.len().min(candidate.len()) - start - max_lag - 100;
        (0..max_lag)
            .map(|lag| {
                let sum: f32 = (start..start + len)
                    .map(|i| {
                        let d = reference[i].left - candidate[i + lag].left;
                        d * d
                    })
                    .sum();
                (sum / len as f32).sqrt()
            })
            .fold(f32::MAX, f32::min)
    }

    #[test]
    fn test_concrete_44100_to_48000_block() {
        let mut converter = RateConverter::new(44100, 48000, ConvertQuality::Standard);
        assert_eq!(converter.frames_in_for(512), 470);

        let input = sine(470, 44100, 440.0);
        let mut output = vec![StereoSample::silence(); 600];
        assert_eq!(converter.process(&input, &mut output), 512);
    }

    #[test]
    fn test_cumulative_rounding_does_not_drift() {
        let mut converter = RateConverter::new(44100, 48000, ConvertQuality::Fastest);
        let input = sine(44100 * 2, 44100, 220.0);
        let mut total_in = 0u64;
        let mut total_out = 0u64;
        let mut scratch = vec![StereoSample::silence(); 2048];

        for (i, chunk) in input.chunks(97).enumerate() {
            // Vary block sizes so remainders fall differently every call
            let chunk = &chunk[..chunk.len().min(50 + i % 47)];
            total_out += converter.process(chunk, &mut scratch) as u64;
            total_in += chunk.len() as u64;
        }

        let expected = (total_in * 48000 + 22050) / 44100;
        assert_eq!(total_out, expected);
    }

    #[test]
    fn test_frames_in_for_is_minimal() {
        let converter = RateConverter::new(48000, 44100, ConvertQuality::Standard);
        for wanted in [1, 63, 256, 512, 1000] {
            let n = converter.frames_in_for(wanted);
            assert!(converter.frames_out_for(n) >= wanted);
            assert!(n == 0 || converter.frames_out_for(n - 1) < wanted);
        }
    }

    #[test]
    fn test_round_trip_all_qualities() {
        let original = sine(44100, 44100, 440.0);
        for quality in [
            ConvertQuality::Fastest,
            ConvertQuality::Standard,
            ConvertQuality::Highest,
        ] {
            let mut up = RateConverter::new(44100, 48000, quality);
            let mut down = RateConverter::new(48000, 44100, quality);
            let converted = convert_all(&mut up, &original, 470);
            let restored = convert_all(&mut down, &converted, 512);

            let rms = best_lag_rms(&original, &restored, 600);
            assert!(rms < 0.03, "{:?} round trip rms error {}", quality, rms);
        }
    }

    #[test]
    fn test_invalid_rate_reports_once() {
        let mut converter = RateConverter::new(0, 48000, ConvertQuality::Standard);
        assert!(!converter.is_valid());
        assert_eq!(converter.frames_out_for(128), 0);

        let input = sine(128, 44100, 440.0);
        let mut output = vec![StereoSample::silence(); 256];
        assert_eq!(converter.process(&input, &mut output), 0);

        assert!(matches!(
            converter.take_config_error(),
            Some(ConvertError::InvalidRate { input_rate: 0, output_rate: 48000 })
        ));
        assert!(converter.take_config_error().is_none());
    }

    #[test]
    fn test_passthrough_copies() {
        let mut converter = RateConverter::new(48000, 48000, ConvertQuality::Highest);
        let input = sine(100, 48000, 1000.0);
        let mut output = vec![StereoSample::silence(); 100];
        assert_eq!(converter.process(&input, &mut output), 100);
        assert_eq!(output, input);
    }

    #[test]
    fn test_mono_mode_keeps_right_only_material() {
        let mut converter = RateConverter::new(44100, 48000, ConvertQuality::Standard);
        converter.set_mono(true);
        let input: Vec<StereoSample> = sine(4096, 44100, 300.0)
            .into_iter()
            .map(|s| StereoSample::new(0.0, s.right))
            .collect();

        let output = convert_all(&mut converter, &input, 470);
        let peak = output.iter().map(|s| s.left.abs()).fold(0.0, f32::max);
        assert!(peak > 0.2, "folded peak {}", peak);
        assert!(output.iter().all(|s| s.left == s.right));
    }

    #[test]
    fn test_mono_passthrough_folds() {
        let mut converter = RateConverter::new(48000, 48000, ConvertQuality::Standard);
        converter.set_mono(true);
        let input = vec![StereoSample::new(0.0, 0.8); 16];
        let mut output = vec![StereoSample::silence(); 16];
        assert_eq!(converter.process(&input, &mut output), 16);
        assert!(output.iter().all(|s| *s == StereoSample::new(0.4, 0.4)));
    }

    #[test]
    fn test_mono_mode_duplicates_one_channel() {
        let mut converter = RateConverter::new(44100, 48000, ConvertQuality::Fastest);
        converter.set_mono(true);
        let input: Vec<StereoSample> = sine(1024, 44100, 300.0)
            .into_iter()
            .map(|s| StereoSample::new(s.left, -s.left))
            .collect();
        let mut output = vec![StereoSample::silence(); 1200];
        let n = converter.process(&input, &mut output);
        assert!(output[..n].iter().all(|s| s.left == s.right));
    }

    #[test]
    fn test_reset_restarts_rounding() {
        let mut converter = RateConverter::new(44100, 48000, ConvertQuality::Standard);
        let input = sine(470, 44100, 440.0);
        let mut output = vec![StereoSample::silence(); 600];
        converter.process(&input[..100], &mut output);
        converter.reset();
        assert_eq!(converter.frames_in_for(512), 470);
    }
}
