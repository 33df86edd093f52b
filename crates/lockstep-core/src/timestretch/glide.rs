//! Speed ratio scheduling shared by the stretcher and the engine timeline

use super::{MAX_SPEED_RATIO, MIN_SPEED_RATIO};

/// Largest ratio change applied as a glide; anything bigger is a jump
pub const GLIDE_THRESHOLD: f64 = 0.25;

/// Length of one glide, in output frames
pub const GRAIN_FRAMES: usize = 2048;

/// How a new speed ratio is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedChange {
    /// Same as the current target
    Unchanged,
    /// Ramped linearly over [`GRAIN_FRAMES`]
    Glide,
    /// Applied at once; stretch contexts must be reset
    Jump,
}

/// Clamp a requested ratio into the supported range.
///
/// Non-finite or non-positive requests map to the nearest sane value
/// instead of being rejected.
pub fn clamp_speed_ratio(ratio: f64) -> f64 {
    if ratio.is_nan() {
        return 1.0;
    }
    ratio.clamp(MIN_SPEED_RATIO, MAX_SPEED_RATIO)
}

/// Per-frame speed schedule
///
/// `advance(n)` returns the sum of the per-frame ratios over the next `n`
/// output frames, i.e. how many source frames (at output rate) those frames
/// cover.
#[derive(Debug, Clone, Copy)]
pub struct SpeedGlide {
    current: f64,
    target: f64,
    step: f64,
    remaining: usize,
}

impl SpeedGlide {
    pub fn new(ratio: f64) -> Self {
        let ratio = clamp_speed_ratio(ratio);
        Self {
            current: ratio,
            target: ratio,
            step: 0.0,
            remaining: 0,
        }
    }

    pub fn current(&self) -> f64 {
        self.current
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    pub fn is_gliding(&self) -> bool {
        self.remaining > 0
    }

    pub fn set_target(&mut self, ratio: f64) -> SpeedChange {
        let ratio = clamp_speed_ratio(ratio);
        if ratio == self.target {
            return SpeedChange::Unchanged;
        }

        let delta = ratio - self.current;
        self.target = ratio;
        if delta.abs() > GLIDE_THRESHOLD {
            self.current = ratio;
            self.step = 0.0;
            self.remaining = 0;
            SpeedChange::Jump
        } else {
            self.step = delta / GRAIN_FRAMES as f64;
            self.remaining = GRAIN_FRAMES;
            SpeedChange::Glide
        }
    }

    /// Advance by `frames` output frames
    pub fn advance(&mut self, frames: usize) -> f64 {
        if self.remaining == 0 {
            return self.current * frames as f64;
        }

        let ramp = frames.min(self.remaining);
        let ramp_f = ramp as f64;
        let ramp_sum = ramp_f * self.current + self.step * ramp_f * (ramp_f + 1.0) / 2.0;

        self.remaining -= ramp;
        self.current = if self.remaining == 0 {
            self.target
        } else {
            self.current + self.step * ramp_f
        };

        ramp_sum + (frames - ramp) as f64 * self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp() {
        assert_eq!(clamp_speed_ratio(0.0), MIN_SPEED_RATIO);
        assert_eq!(clamp_speed_ratio(-3.0), MIN_SPEED_RATIO);
        assert_eq!(clamp_speed_ratio(f64::INFINITY), MAX_SPEED_RATIO);
        assert_eq!(clamp_speed_ratio(f64::NAN), 1.0);
        assert_eq!(clamp_speed_ratio(1.25), 1.25);
    }

    #[test]
    fn test_glide_covers_linear_ramp() {
        let mut glide = SpeedGlide::new(1.0);
        assert_eq!(glide.set_target(1.25), SpeedChange::Glide);

        let total = glide.advance(GRAIN_FRAMES);
        let expected = GRAIN_FRAMES as f64 * 1.125 + 0.25 / 2.0;
        assert!((total - expected).abs() < 1e-6, "{} vs {}", total, expected);
        assert!(!glide.is_gliding());
        assert_eq!(glide.current(), 1.25);
        assert_eq!(glide.advance(100), 125.0);
    }

    #[test]
    fn test_jump_applies_immediately() {
        let mut glide = SpeedGlide::new(1.0);
        assert_eq!(glide.set_target(2.0), SpeedChange::Jump);
        assert_eq!(glide.current(), 2.0);
        assert_eq!(glide.set_target(2.0), SpeedChange::Unchanged);
    }
}
