//! Common types for Lockstep
//!
//! Fundamental audio types shared by every stage of the pull chain: the
//! stereo sample and buffer types, source identifiers and the frame
//! conversions between sample rates.

use std::fmt;
use std::ops::{Index, IndexMut};

/// Default device sample rate when nothing else is known
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

/// Largest block the engine processes in one pass (frames).
///
/// Every real-time buffer is pre-allocated to this size at stream start.
/// Device callbacks asking for more are processed in chunks of this size.
pub const MAX_BLOCK_FRAMES: usize = 8192;

/// Audio sample type (32-bit float throughout the pipeline)
pub type Sample = f32;

/// Identifier of an attached sample source.
///
/// Assigned by the controller at attach time, monotonically increasing and
/// never reused within a session. Mixing order follows ascending id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceId(pub u32);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source#{}", self.0)
    }
}

/// A single stereo sample (left and right channels)
///
/// `#[repr(C)]` guarantees the layout `[left, right]`, so `&[StereoSample]`
/// can be reinterpreted as interleaved `&[f32]` through bytemuck.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct StereoSample {
    pub left: Sample,
    pub right: Sample,
}

impl StereoSample {
    #[inline]
    pub fn new(left: Sample, right: Sample) -> Self {
        Self { left, right }
    }

    #[inline]
    pub fn silence() -> Self {
        Self::default()
    }

    /// Same value in both channels
    #[inline]
    pub fn mono(value: Sample) -> Self {
        Self { left: value, right: value }
    }

    /// Average of both channels
    #[inline]
    pub fn fold(&self) -> Sample {
        (self.left + self.right) * 0.5
    }

    /// Peak amplitude (max of abs(left), abs(right))
    #[inline]
    pub fn peak(&self) -> Sample {
        self.left.abs().max(self.right.abs())
    }
}

impl std::ops::Add for StereoSample {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Self {
            left: self.left + other.left,
            right: self.right + other.right,
        }
    }
}

impl std::ops::AddAssign for StereoSample {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        self.left += other.left;
        self.right += other.right;
    }
}

impl std::ops::Mul<Sample> for StereoSample {
    type Output = Self;

    #[inline]
    fn mul(self, factor: Sample) -> Self {
        Self {
            left: self.left * factor,
            right: self.right * factor,
        }
    }
}

/// A buffer of stereo samples
///
/// Real-time code only ever works on pre-allocated buffers: create them with
/// [`StereoBuffer::with_capacity`] at stream start and change the working
/// length with [`StereoBuffer::set_len_from_capacity`].
#[derive(Debug, Clone, Default)]
pub struct StereoBuffer {
    samples: Vec<StereoSample>,
}

impl StereoBuffer {
    /// Empty buffer with room for `capacity` frames
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
        }
    }

    /// Buffer of `len` silent frames
    pub fn silence(len: usize) -> Self {
        Self {
            samples: vec![StereoSample::silence(); len],
        }
    }

    /// Buffer from interleaved samples [L, R, L, R, ...]
    pub fn from_interleaved(interleaved: &[Sample]) -> Self {
        assert!(interleaved.len() % 2 == 0, "Interleaved buffer must have even length");
        let samples = interleaved
            .chunks_exact(2)
            .map(|chunk| StereoSample::new(chunk[0], chunk[1]))
            .collect();
        Self { samples }
    }

    pub fn from_vec(samples: Vec<StereoSample>) -> Self {
        Self { samples }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.samples.capacity()
    }

    /// Set the working length of a pre-allocated buffer (real-time safe)
    ///
    /// Newly exposed frames are silent. Must not exceed the capacity.
    #[inline]
    pub fn set_len_from_capacity(&mut self, new_len: usize) {
        let current_len = self.samples.len();
        if new_len > current_len {
            debug_assert!(
                new_len <= self.samples.capacity(),
                "set_len_from_capacity called with len > capacity"
            );
            self.samples.resize(new_len, StereoSample::silence());
        } else {
            self.samples.truncate(new_len);
        }
    }

    pub fn fill_silence(&mut self) {
        self.samples.fill(StereoSample::silence());
    }

    #[inline]
    pub fn as_slice(&self) -> &[StereoSample] {
        &self.samples
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [StereoSample] {
        &mut self.samples
    }

    /// Zero-copy view as interleaved f32 [L, R, L, R, ...]
    #[inline]
    pub fn as_interleaved(&self) -> &[Sample] {
        bytemuck::cast_slice(&self.samples)
    }

    /// Zero-copy mutable view as interleaved f32 [L, R, L, R, ...]
    #[inline]
    pub fn as_interleaved_mut(&mut self) -> &mut [Sample] {
        bytemuck::cast_slice_mut(&mut self.samples)
    }

    /// Copy from another buffer without allocating (capacity permitting)
    pub fn copy_from(&mut self, other: &StereoBuffer) {
        let len = other.samples.len();
        debug_assert!(
            len <= self.samples.capacity(),
            "copy_from: insufficient capacity ({} < {})",
            self.samples.capacity(),
            len
        );
        self.set_len_from_capacity(len);
        self.samples[..len].copy_from_slice(&other.samples[..len]);
    }

    pub fn iter(&self) -> impl Iterator<Item = &StereoSample> {
        self.samples.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut StereoSample> {
        self.samples.iter_mut()
    }

    /// Peak amplitude in the buffer
    pub fn peak(&self) -> Sample {
        self.samples.iter().map(|s| s.peak()).fold(0.0, Sample::max)
    }
}

impl Index<usize> for StereoBuffer {
    type Output = StereoSample;

    #[inline]
    fn index(&self, index: usize) -> &Self::Output {
        &self.samples[index]
    }
}

impl IndexMut<usize> for StereoBuffer {
    #[inline]
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.samples[index]
    }
}

/// Convert a frame count between two sample rates, rounding down.
///
/// Uses 128-bit intermediates so positions of very long sessions at high
/// rates cannot overflow.
#[inline]
pub fn rescale_frames(frames: i64, from_rate: u32, to_rate: u32) -> i64 {
    if from_rate == to_rate || from_rate == 0 {
        return frames;
    }
    let scaled = frames as i128 * to_rate as i128;
    scaled.div_euclid(from_rate as i128) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stereo_sample_operations() {
        let a = StereoSample::new(1.0, 2.0);
        let b = StereoSample::new(0.5, 0.5);

        let sum = a + b;
        assert_eq!(sum.left, 1.5);
        assert_eq!(sum.right, 2.5);

        let scaled = a * 0.5;
        assert_eq!(scaled.left, 0.5);
        assert_eq!(scaled.right, 1.0);
        assert_eq!(a.fold(), 1.5);
    }

    #[test]
    fn test_interleaved_view_matches_layout() {
        let buffer = StereoBuffer::from_interleaved(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer[1].left, 3.0);
        assert_eq!(buffer.as_interleaved(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_set_len_from_capacity_never_reallocates() {
        let mut buffer = StereoBuffer::with_capacity(256);
        let ptr = buffer.as_slice().as_ptr();
        buffer.set_len_from_capacity(256);
        assert_eq!(buffer.len(), 256);
        buffer.set_len_from_capacity(10);
        buffer.set_len_from_capacity(200);
        assert_eq!(buffer.as_slice().as_ptr(), ptr);
        assert!(buffer.iter().all(|s| *s == StereoSample::silence()));
    }

    #[test]
    fn test_copy_from_uses_existing_capacity() {
        let src = StereoBuffer::from_interleaved(&[0.25, -0.25, 0.5, -0.5]);
        let mut dst = StereoBuffer::with_capacity(16);
        dst.copy_from(&src);
        assert_eq!(dst.as_slice(), src.as_slice());
        assert_eq!(dst.capacity(), 16);
    }

    #[test]
    fn test_rescale_frames() {
        assert_eq!(rescale_frames(44100, 44100, 48000), 48000);
        assert_eq!(rescale_frames(470, 44100, 48000), 511);
        assert_eq!(rescale_frames(-1, 44100, 48000), -2);
        assert_eq!(rescale_frames(1000, 48000, 48000), 1000);
    }
}
