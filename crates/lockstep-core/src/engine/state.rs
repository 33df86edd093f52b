//! Playback state and its lock-free mirror
//!
//! [`PlaybackState`] is owned by the engine and only changed by commands
//! drained at block boundaries. After every block the engine publishes it to
//! [`PlaybackAtomics`] so the control side can read position and flags
//! without touching the audio thread.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use crate::types::SourceId;

/// Half-open range `[start, end)` in timeline frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub start: i64,
    pub end: i64,
}

impl Selection {
    /// `None` unless `start < end`
    pub fn new(start: i64, end: i64) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    #[inline]
    pub fn contains(&self, frame: i64) -> bool {
        frame >= self.start && frame < self.end
    }

    pub fn len(&self) -> i64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Transport state of the engine
///
/// `Playing` sub-modes (looping, selection constrained) are orthogonal flags.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackState {
    /// Timeline position in frames
    pub position_frames: i64,
    pub is_playing: bool,
    /// Target speed ratio, always inside the supported range
    pub speed_ratio: f64,
    pub loop_enabled: bool,
    pub selection_constraint_enabled: bool,
    pub selection: Option<Selection>,
    /// Lowest-id soloed source, if any
    pub solo_source_id: Option<SourceId>,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            position_frames: 0,
            is_playing: false,
            speed_ratio: 1.0,
            loop_enabled: false,
            selection_constraint_enabled: false,
            selection: None,
            solo_source_id: None,
        }
    }
}

impl PlaybackState {
    /// Selection bounding playback, when the constraint is on
    pub fn active_selection(&self) -> Option<Selection> {
        if self.selection_constraint_enabled {
            self.selection
        } else {
            None
        }
    }
}

/// Atomic mirror of [`PlaybackState`] plus engine counters
///
/// Single writer (audio thread), any number of readers.
#[derive(Debug)]
pub struct PlaybackAtomics {
    position: AtomicI64,
    playing: AtomicBool,
    speed_bits: AtomicU64,
    looping: AtomicBool,
    constrained: AtomicBool,
    underruns: AtomicU64,
    blocks: AtomicU64,
    dropped_events: AtomicU64,
}

impl Default for PlaybackAtomics {
    fn default() -> Self {
        Self {
            position: AtomicI64::new(0),
            playing: AtomicBool::new(false),
            speed_bits: AtomicU64::new(1.0f64.to_bits()),
            looping: AtomicBool::new(false),
            constrained: AtomicBool::new(false),
            underruns: AtomicU64::new(0),
            blocks: AtomicU64::new(0),
            dropped_events: AtomicU64::new(0),
        }
    }
}

impl PlaybackAtomics {
    #[inline]
    pub fn position(&self) -> i64 {
        self.position.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn speed_ratio(&self) -> f64 {
        f64::from_bits(self.speed_bits.load(Ordering::Relaxed))
    }

    pub fn loop_enabled(&self) -> bool {
        self.looping.load(Ordering::Relaxed)
    }

    pub fn selection_constraint_enabled(&self) -> bool {
        self.constrained.load(Ordering::Relaxed)
    }

    /// Source reads that could not be served since stream start
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    /// Blocks rendered since stream start
    pub fn blocks_processed(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }

    /// Events lost to a full event ring
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    pub(crate) fn publish(&self, state: &PlaybackState) {
        self.position.store(state.position_frames, Ordering::Relaxed);
        self.playing.store(state.is_playing, Ordering::Relaxed);
        self.speed_bits.store(state.speed_ratio.to_bits(), Ordering::Relaxed);
        self.looping.store(state.loop_enabled, Ordering::Relaxed);
        self.constrained
            .store(state.selection_constraint_enabled, Ordering::Relaxed);
    }

    pub(crate) fn count_underrun(&self) {
        self.underruns.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_block(&self) {
        self.blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_dropped_event(&self) {
        self.dropped_events.fetch_add(1, Ordering::Relaxed);
    }
}
