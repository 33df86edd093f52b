//! Immutable reference-to-target frame correspondence

use super::AlignmentError;

/// Monotonic sequence of `(reference_frame, target_frame)` pairs
///
/// Frames are in each source's native rate. Reference frames are strictly
/// increasing and target frames never decrease. Lookups are O(log n) and
/// allocation free, so the path can be read from the audio thread.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentPath {
    pairs: Vec<(i64, i64)>,
}

impl AlignmentPath {
    /// Validate and wrap a list of pairs
    pub fn new(pairs: Vec<(i64, i64)>) -> Result<Self, AlignmentError> {
        if pairs.is_empty() {
            return Err(AlignmentError::EmptyPath);
        }
        for (index, window) in pairs.windows(2).enumerate() {
            let (r0, t0) = window[0];
            let (r1, t1) = window[1];
            if r1 <= r0 || t1 < t0 {
                return Err(AlignmentError::NotMonotonic { index: index + 1 });
            }
        }
        Ok(Self { pairs })
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn pairs(&self) -> &[(i64, i64)] {
        &self.pairs
    }

    /// Reference frame range covered by the path
    pub fn reference_range(&self) -> (i64, i64) {
        (self.pairs[0].0, self.pairs[self.pairs.len() - 1].0)
    }

    /// Map a reference frame to the target frame.
    ///
    /// Interpolates linearly between the bracketing pairs. Frames before the
    /// first pair or after the last map to that endpoint's target frame.
    pub fn map_to_target(&self, reference_frame: i64) -> i64 {
        let first = self.pairs[0];
        let last = self.pairs[self.pairs.len() - 1];
        if reference_frame <= first.0 {
            return first.1;
        }
        if reference_frame >= last.0 {
            return last.1;
        }

        // First pair whose reference frame is past the lookup
        let upper = self.pairs.partition_point(|&(r, _)| r <= reference_frame);
        let (r0, t0) = self.pairs[upper - 1];
        let (r1, t1) = self.pairs[upper];

        let span = (r1 - r0) as i128;
        let offset = (reference_frame - r0) as i128 * (t1 - t0) as i128;
        t0 + (offset / span) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path() -> AlignmentPath {
        AlignmentPath::new(vec![(100, 1000), (200, 1100), (400, 1150), (500, 1350)]).unwrap()
    }

    #[test]
    fn test_rejects_invalid_paths() {
        assert!(matches!(AlignmentPath::new(vec![]), Err(AlignmentError::EmptyPath)));
        assert!(matches!(
            AlignmentPath::new(vec![(0, 0), (10, 5), (10, 6)]),
            Err(AlignmentError::NotMonotonic { index: 2 })
        ));
        assert!(matches!(
            AlignmentPath::new(vec![(0, 10), (10, 5)]),
            Err(AlignmentError::NotMonotonic { index: 1 })
        ));
        // Target may hold still while the reference moves
        assert!(AlignmentPath::new(vec![(0, 10), (10, 10)]).is_ok());
    }

    #[test]
    fn test_interpolates_between_pairs() {
        let path = path();
        assert_eq!(path.map_to_target(100), 1000);
        assert_eq!(path.map_to_target(150), 1050);
        assert_eq!(path.map_to_target(200), 1100);
        assert_eq!(path.map_to_target(300), 1125);
        assert_eq!(path.map_to_target(450), 1250);
    }

    #[test]
    fn test_clamps_outside_range() {
        let path = path();
        assert_eq!(path.map_to_target(-5000), 1000);
        assert_eq!(path.map_to_target(99), 1000);
        assert_eq!(path.map_to_target(500), 1350);
        assert_eq!(path.map_to_target(1_000_000), 1350);
    }

    #[test]
    fn test_single_pair_clamps_everywhere() {
        let path = AlignmentPath::new(vec![(50, 700)]).unwrap();
        assert_eq!(path.map_to_target(0), 700);
        assert_eq!(path.map_to_target(50), 700);
        assert_eq!(path.map_to_target(5000), 700);
        assert_eq!(path.reference_range(), (50, 50));
    }
}
