//! Alignment transform capability and a built-in envelope aligner

use std::sync::atomic::{AtomicBool, Ordering};

use super::{AlignmentError, AlignmentPath, AlignmentResult};
use crate::source::{ReadOutcome, SampleSource};

/// Envelope analysis hop, in seconds
pub const ENVELOPE_HOP_SECONDS: f64 = 0.05;

/// Longest envelope computed per source; longer material uses a wider hop
pub const MAX_ENVELOPE_FRAMES: usize = 4000;

/// Computes the correspondence between two recordings.
///
/// Called on the alignment worker thread. Implementations may take seconds
/// and should poll `cancel` regularly, returning
/// [`AlignmentError::Cancelled`] once it is set.
pub trait AlignmentTransform: Send + Sync {
    fn align(
        &self,
        reference: &dyn SampleSource,
        target: &dyn SampleSource,
        cancel: &AtomicBool,
    ) -> AlignmentResult<AlignmentPath>;
}

/// Dynamic time warping over peak-normalized RMS envelopes
///
/// Coarse but dependency free; good enough to line up performances whose
/// loudness contours match.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeAligner;

/// RMS envelope of a source and the hop it was taken at
struct Envelope {
    values: Vec<f32>,
    hop: usize,
}

impl Envelope {
    fn analyze(source: &dyn SampleSource, cancel: &AtomicBool) -> AlignmentResult<Self> {
        let label = source.label().to_string();
        let length = source
            .length_frames()
            .ok_or_else(|| AlignmentError::UnboundedSource(label.clone()))? as usize;

        let channels = source.channel_count().max(1);
        let base_hop = (source.native_sample_rate() as f64 * ENVELOPE_HOP_SECONDS).round() as usize;
        let hop = base_hop.max(length.div_ceil(MAX_ENVELOPE_FRAMES)).max(1);
        let count = length / hop;
        if count < 2 {
            return Err(AlignmentError::InsufficientMaterial(label));
        }

        let mut scratch = vec![0.0f32; hop * channels];
        let mut values = Vec::with_capacity(count);
        for i in 0..count {
            if cancel.load(Ordering::Relaxed) {
                return Err(AlignmentError::Cancelled);
            }
            // Non-real-time context: a miss is simply analysed as silence
            if source.read((i * hop) as i64, hop, &mut scratch) != ReadOutcome::Ready {
                scratch.fill(0.0);
            }
            let energy: f32 = scratch.iter().map(|s| s * s).sum();
            values.push((energy / scratch.len() as f32).sqrt());
        }

        let peak = values.iter().copied().fold(0.0f32, f32::max);
        if peak > 0.0 {
            for v in &mut values {
                *v /= peak;
            }
        }
        Ok(Self { values, hop })
    }
}

#[derive(Clone, Copy)]
enum Step {
    Diagonal,
    Reference,
    Target,
}

impl AlignmentTransform for EnvelopeAligner {
    fn align(
        &self,
        reference: &dyn SampleSource,
        target: &dyn SampleSource,
        cancel: &AtomicBool,
    ) -> AlignmentResult<AlignmentPath> {
        let reference = Envelope::analyze(reference, cancel)?;
        let target = Envelope::analyze(target, cancel)?;
        let n = reference.values.len();
        let m = target.values.len();

        // Rolling cost rows, full step matrix for the backtrack
        let mut previous = vec![f32::INFINITY; m];
        let mut current = vec![f32::INFINITY; m];
        let mut steps = vec![Step::Diagonal; n * m];

        for i in 0..n {
            if cancel.load(Ordering::Relaxed) {
                return Err(AlignmentError::Cancelled);
            }
            let r = reference.values[i];
            for j in 0..m {
                let cost = (r - target.values[j]).abs();
                let (best, step) = if i == 0 && j == 0 {
                    (0.0, Step::Diagonal)
                } else {
                    let diagonal = if i > 0 && j > 0 { previous[j - 1] } else { f32::INFINITY };
                    let up = if i > 0 { previous[j] } else { f32::INFINITY };
                    let left = if j > 0 { current[j - 1] } else { f32::INFINITY };
                    if diagonal <= up && diagonal <= left {
                        (diagonal, Step::Diagonal)
                    } else if up <= left {
                        (up, Step::Reference)
                    } else {
                        (left, Step::Target)
                    }
                };
                current[j] = best + cost;
                steps[i * m + j] = step;
            }
            std::mem::swap(&mut previous, &mut current);
        }

        // Walk back from the end, keeping the last target index per reference index
        let mut cells = Vec::with_capacity(n + m);
        let (mut i, mut j) = (n - 1, m - 1);
        loop {
            cells.push((i, j));
            if i == 0 && j == 0 {
                break;
            }
            match steps[i * m + j] {
                Step::Diagonal => {
                    i -= 1;
                    j -= 1;
                }
                Step::Reference => i -= 1,
                Step::Target => j -= 1,
            }
        }
        cells.reverse();

        let mut pairs: Vec<(i64, i64)> = Vec::with_capacity(n);
        for (i, j) in cells {
            let entry = ((i * reference.hop) as i64, (j * target.hop) as i64);
            match pairs.last_mut() {
                Some(last) if last.0 == entry.0 => last.1 = entry.1,
                _ => pairs.push(entry),
            }
        }

        AlignmentPath::new(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::BufferSource;
    use std::f32::consts::TAU;

    const RATE: u32 = 8000;
    const STEPS: [f32; 16] = [
        0.1, 0.8, 0.3, 1.0, 0.5, 0.2, 0.9, 0.4, 0.7, 0.15, 0.6, 0.35, 0.95, 0.25, 0.55, 0.45,
    ];

    /// 4 s of 200 Hz tone whose amplitude changes every 0.25 s
    fn stepped_tone(silence_prefix: usize) -> BufferSource {
        let step_frames = RATE as usize / 4;
        let mut samples = vec![0.0f32; silence_prefix];
        for (s, amplitude) in STEPS.iter().enumerate() {
            for k in 0..step_frames {
                let frame = s * step_frames + k;
                samples.push((TAU * 200.0 * frame as f32 / RATE as f32).sin() * amplitude);
            }
        }
        BufferSource::new("stepped", samples, RATE, 1)
    }

    #[test]
    fn test_finds_constant_offset() {
        let reference = stepped_tone(0);
        let target = stepped_tone(RATE as usize / 2);
        let cancel = AtomicBool::new(false);

        let path = EnvelopeAligner.align(&reference, &target, &cancel).unwrap();
        let mapped = path.map_to_target(2 * RATE as i64);
        let expected = 2 * RATE as i64 + RATE as i64 / 2;
        assert!((mapped - expected).abs() <= 800, "mapped {} expected {}", mapped, expected);
    }

    #[test]
    fn test_honours_cancellation() {
        let reference = stepped_tone(0);
        let target = stepped_tone(0);
        let cancel = AtomicBool::new(true);
        assert_eq!(
            EnvelopeAligner.align(&reference, &target, &cancel),
            Err(AlignmentError::Cancelled)
        );
    }

    #[test]
    fn test_rejects_unbounded_sources() {
        let reference = stepped_tone(0);
        let target = crate::source::ToneSource::new(200.0, 0.5, RATE, 1);
        let cancel = AtomicBool::new(false);
        assert!(matches!(
            EnvelopeAligner.align(&reference, &target, &cancel),
            Err(AlignmentError::UnboundedSource(_))
        ));
    }
}
