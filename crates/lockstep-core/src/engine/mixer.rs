//! Mixer - per-source gain/pan/mute/solo and summation
//!
//! Conventions, frozen so output can be reproduced bit for bit:
//! - gain: `linear = 10^(gain_db / 20)`, with `gain_db <= -96` as silence
//! - pan: equal power, `left = sin((1 - pan) * π/4)`, `right = sin((1 + pan) * π/4)`,
//!   applied to each side of the stereo signal (balance form)
//! - sources are summed in ascending [`SourceId`] order in `f32`
//! - the final block is hard-limited to [-1, 1] and every clipped sample is counted

use std::f32::consts::FRAC_PI_4;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::types::{SourceId, StereoBuffer, StereoSample};

/// Gains at or below this level are treated as silence
pub const SILENCE_DB: f32 = -96.0;

/// Convert decibels to a linear factor
#[inline]
pub fn db_to_linear(db: f32) -> f32 {
    if db <= SILENCE_DB || db.is_nan() {
        0.0
    } else {
        10.0_f32.powf(db / 20.0)
    }
}

/// Equal-power pan law. Returns `(left, right)` factors.
#[inline]
pub fn pan_gains(pan: f32) -> (f32, f32) {
    let pan = if pan.is_nan() { 0.0 } else { pan.clamp(-1.0, 1.0) };
    (((1.0 - pan) * FRAC_PI_4).sin(), ((1.0 + pan) * FRAC_PI_4).sin())
}

/// Mixer settings for one attached source
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceChannel {
    pub source_id: SourceId,
    pub gain_db: f32,
    pub pan: f32,
    pub muted: bool,
    pub soloed: bool,
}

impl SourceChannel {
    /// Unity gain, centred, audible
    pub fn new(source_id: SourceId) -> Self {
        Self {
            source_id,
            gain_db: 0.0,
            pan: 0.0,
            muted: false,
            soloed: false,
        }
    }

    pub fn set_pan(&mut self, pan: f32) {
        self.pan = if pan.is_nan() { 0.0 } else { pan.clamp(-1.0, 1.0) };
    }

    /// Combined gain and pan factors `(left, right)`
    #[inline]
    pub fn gains(&self) -> (f32, f32) {
        let gain = db_to_linear(self.gain_db);
        let (left, right) = pan_gains(self.pan);
        (gain * left, gain * right)
    }

    /// Whether this channel reaches the sum. Solo overrides mute.
    #[inline]
    pub fn is_audible(&self, any_soloed: bool) -> bool {
        if any_soloed {
            self.soloed
        } else {
            !self.muted
        }
    }
}

/// Output level feed for meters and capture (lock-free reads)
#[derive(Debug, Default)]
pub struct OutputLevels {
    peak_left: AtomicU32,
    peak_right: AtomicU32,
    clip_indicator: AtomicBool,
    clipped_samples: AtomicU64,
}

impl OutputLevels {
    /// Peak of the most recent block `(left, right)`
    pub fn peak(&self) -> (f32, f32) {
        (
            f32::from_bits(self.peak_left.load(Ordering::Relaxed)),
            f32::from_bits(self.peak_right.load(Ordering::Relaxed)),
        )
    }

    /// Read and clear the sticky clip indicator
    pub fn take_clip(&self) -> bool {
        self.clip_indicator.swap(false, Ordering::Relaxed)
    }

    /// Total samples hard-limited since stream start
    pub fn clipped_samples(&self) -> u64 {
        self.clipped_samples.load(Ordering::Relaxed)
    }

    pub(crate) fn reset(&self) {
        self.peak_left.store(0f32.to_bits(), Ordering::Relaxed);
        self.peak_right.store(0f32.to_bits(), Ordering::Relaxed);
        self.clip_indicator.store(false, Ordering::Relaxed);
        self.clipped_samples.store(0, Ordering::Relaxed);
    }
}

/// Result of [`PlaybackMixer::finalize`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClipReport {
    /// Samples limited in this block
    pub clipped: u32,
    /// True on the first clipping block after a clean one
    pub onset: bool,
}

/// Sums per-source blocks into the output and finalizes the mix
pub struct PlaybackMixer {
    levels: Arc<OutputLevels>,
    was_clipping: bool,
}

impl PlaybackMixer {
    pub fn new() -> Self {
        Self {
            levels: Arc::new(OutputLevels::default()),
            was_clipping: false,
        }
    }

    /// Shared level feed (for UI meters)
    pub fn levels(&self) -> Arc<OutputLevels> {
        Arc::clone(&self.levels)
    }

    /// Mix `inputs` into `output` (whose length sets the block size).
    ///
    /// `inputs` must yield sources in ascending id order for reproducible
    /// results. If any channel is soloed only soloed channels contribute.
    pub fn mix<'a, I>(&self, inputs: I, output: &mut StereoBuffer)
    where
        I: Iterator<Item = (&'a SourceChannel, &'a [StereoSample])> + Clone,
    {
        output.fill_silence();
        let any_soloed = inputs.clone().any(|(channel, _)| channel.soloed);

        for (channel, block) in inputs {
            if !channel.is_audible(any_soloed) {
                continue;
            }
            let (gain_l, gain_r) = channel.gains();
            for (dst, src) in output.iter_mut().zip(block) {
                dst.left += src.left * gain_l;
                dst.right += src.right * gain_r;
            }
        }
    }

    /// Hard-limit the final block to [-1, 1], update the level feed and
    /// report clipping.
    pub fn finalize(&mut self, output: &mut StereoBuffer) -> ClipReport {
        let mut clipped = 0u32;
        let mut peak_l = 0.0f32;
        let mut peak_r = 0.0f32;

        for sample in output.iter_mut() {
            for value in [&mut sample.left, &mut sample.right] {
                if !value.is_finite() {
                    *value = 0.0;
                    clipped += 1;
                } else if value.abs() > 1.0 {
                    *value = value.clamp(-1.0, 1.0);
                    clipped += 1;
                }
            }
            peak_l = peak_l.max(sample.left.abs());
            peak_r = peak_r.max(sample.right.abs());
        }

        self.levels.peak_left.store(peak_l.to_bits(), Ordering::Relaxed);
        self.levels.peak_right.store(peak_r.to_bits(), Ordering::Relaxed);

        let clipping = clipped > 0;
        if clipping {
            self.levels.clip_indicator.store(true, Ordering::Relaxed);
            self.levels
                .clipped_samples
                .fetch_add(clipped as u64, Ordering::Relaxed);
        }
        let onset = clipping && !self.was_clipping;
        self.was_clipping = clipping;

        ClipReport { clipped, onset }
    }

    /// Reset the level feed (stream start)
    pub fn reset(&mut self) {
        self.was_clipping = false;
        self.levels.reset();
    }
}

impl Default for PlaybackMixer {
    fn default() -> Self {
        Self::new()
    }
}
