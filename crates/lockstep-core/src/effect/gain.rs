//! Gain processor - simple level trim for auditioning

use super::AudioEffectProcessor;
use crate::engine::db_to_linear;
use crate::types::StereoBuffer;

/// A level trim. Zero latency, negligible cost.
pub struct GainProcessor {
    gain: f32,
}

impl GainProcessor {
    pub fn new(gain_db: f32) -> Self {
        Self {
            gain: db_to_linear(gain_db),
        }
    }

    pub fn set_gain_db(&mut self, gain_db: f32) {
        self.gain = db_to_linear(gain_db);
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }
}

impl Default for GainProcessor {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl AudioEffectProcessor for GainProcessor {
    fn process(&mut self, block: &mut StereoBuffer) {
        for sample in block.iter_mut() {
            *sample = *sample * self.gain;
        }
    }

    fn name(&self) -> &str {
        "Gain"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StereoSample;

    #[test]
    fn test_unity_gain_is_transparent() {
        let mut effect = GainProcessor::default();
        let mut buffer = StereoBuffer::silence(4);
        buffer[0] = StereoSample::new(1.0, 1.0);
        buffer[1] = StereoSample::new(0.5, -0.5);

        effect.process(&mut buffer);

        assert_eq!(buffer[0].left, 1.0);
        assert_eq!(buffer[1].right, -0.5);
    }

    #[test]
    fn test_minus_six_db_halves() {
        let mut effect = GainProcessor::new(-6.0206);
        let mut buffer = StereoBuffer::silence(1);
        buffer[0] = StereoSample::new(1.0, 1.0);

        effect.process(&mut buffer);

        assert!((buffer[0].left - 0.5).abs() < 0.001);
    }
}
