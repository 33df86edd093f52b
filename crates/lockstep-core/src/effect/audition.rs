//! Budgeted single-slot effect chain

use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use basedrop::Owned;

use super::AudioEffectProcessor;
use crate::types::StereoBuffer;

/// Consecutive over-budget blocks before a processor is removed
pub const DEFAULT_STRIKE_LIMIT: u32 = 8;

/// Fraction of the callback period an auditioned effect may use
pub const DEFAULT_EFFECT_BUDGET: f32 = 0.5;

/// An installed processor. Dropping it on the audio thread only enqueues the
/// allocation for the collector thread.
pub type ProcessorSlot = Owned<Box<dyn AudioEffectProcessor>>;

/// What happened to the block in [`EffectAuditionChain::process`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditionOutcome {
    /// No processor installed
    Empty,
    /// Processor installed but bypassed by the overload ladder
    Bypassed,
    /// Processor ran within budget
    Processed,
    /// Processor exceeded its budget too long or panicked, and was removed
    /// (reported once)
    Disabled,
}

/// Wraps zero or one externally supplied effect processor
pub struct EffectAuditionChain {
    processor: Option<ProcessorSlot>,
    budget_fraction: f32,
    strike_limit: u32,
    strikes: u32,
    bypassed: bool,
    last_load: f32,
    /// Copy of the unprocessed block, restored if the processor panics
    dry: StereoBuffer,
}

impl EffectAuditionChain {
    /// `max_block_frames` sizes the dry copy; larger blocks are not processed
    pub fn new(budget_fraction: f32, strike_limit: u32, max_block_frames: usize) -> Self {
        Self {
            processor: None,
            budget_fraction,
            strike_limit: strike_limit.max(1),
            strikes: 0,
            bypassed: false,
            last_load: 0.0,
            dry: StereoBuffer::with_capacity(max_block_frames),
        }
    }

    /// Install a processor (or none). Returns the one it replaces so the
    /// caller decides where it is dropped.
    pub fn set_processor(&mut self, processor: Option<ProcessorSlot>) -> Option<ProcessorSlot> {
        self.strikes = 0;
        self.last_load = 0.0;
        let mut processor = processor;
        if let Some(p) = processor.as_mut() {
            p.reset();
        }
        std::mem::replace(&mut self.processor, processor)
    }

    pub fn has_processor(&self) -> bool {
        self.processor.is_some()
    }

    /// Skip the processor without removing it (overload degradation)
    pub fn set_bypassed(&mut self, bypassed: bool) {
        self.bypassed = bypassed;
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypassed
    }

    /// Load fraction measured on the last processed block
    pub fn last_load(&self) -> f32 {
        self.last_load
    }

    /// Run the processor over `block`. `period` is the callback period the
    /// block represents.
    pub fn process(&mut self, block: &mut StereoBuffer, period: Duration) -> AuditionOutcome {
        let Some(processor) = self.processor.as_mut() else {
            return AuditionOutcome::Empty;
        };
        if self.bypassed {
            return AuditionOutcome::Bypassed;
        }
        if block.len() > self.dry.capacity() {
            return AuditionOutcome::Bypassed;
        }

        self.dry.set_len_from_capacity(block.len());
        self.dry.as_mut_slice().copy_from_slice(block.as_slice());

        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| processor.process(block)));
        if result.is_err() {
            block.as_mut_slice().copy_from_slice(self.dry.as_slice());
            self.strikes = 0;
            self.processor = None;
            return AuditionOutcome::Disabled;
        }

        let measured = if period.is_zero() {
            0.0
        } else {
            started.elapsed().as_secs_f32() / period.as_secs_f32()
        };

        let load = measured.max(processor.reported_load_fraction());
        self.last_load = load;

        if load > self.budget_fraction {
            self.strikes += 1;
        } else {
            self.strikes = 0;
        }

        if self.strikes >= self.strike_limit {
            self.strikes = 0;
            // Deferred: Owned hands the allocation to the collector thread
            self.processor = None;
            return AuditionOutcome::Disabled;
        }

        AuditionOutcome::Processed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StereoSample;
    use basedrop::Collector;

    struct FixedLoad {
        load: f32,
        calls: usize,
    }

    impl AudioEffectProcessor for FixedLoad {
        fn process(&mut self, block: &mut StereoBuffer) {
            self.calls += 1;
            for s in block.iter_mut() {
                *s = *s * 0.5;
            }
        }

        fn reported_load_fraction(&self) -> f32 {
            self.load
        }

        fn name(&self) -> &str {
            "fixed-load"
        }
    }

    fn slot(collector: &Collector, load: f32) -> ProcessorSlot {
        let processor: Box<dyn AudioEffectProcessor> = Box::new(FixedLoad { load, calls: 0 });
        Owned::new(&collector.handle(), processor)
    }

    const PERIOD: Duration = Duration::from_millis(10);

    #[test]
    fn test_empty_chain_passes_through() {
        let mut chain = EffectAuditionChain::new(DEFAULT_EFFECT_BUDGET, DEFAULT_STRIKE_LIMIT, 64);
        let mut block = StereoBuffer::from_vec(vec![StereoSample::new(1.0, 1.0); 4]);
        assert_eq!(chain.process(&mut block, PERIOD), AuditionOutcome::Empty);
        assert_eq!(block[0].left, 1.0);
    }

    #[test]
    fn test_processor_is_applied_within_budget() {
        let mut collector = Collector::new();
        let mut chain = EffectAuditionChain::new(0.5, 8, 64);
        chain.set_processor(Some(slot(&collector, 0.1)));

        let mut block = StereoBuffer::from_vec(vec![StereoSample::new(1.0, 1.0); 4]);
        for _ in 0..20 {
            assert_eq!(chain.process(&mut block, PERIOD), AuditionOutcome::Processed);
        }
        assert!(chain.has_processor());
        drop(chain);
        collector.collect();
    }

    #[test]
    fn test_overloaded_processor_removed_after_strike_limit() {
        let mut collector = Collector::new();
        let mut chain = EffectAuditionChain::new(0.5, 8, 64);
        chain.set_processor(Some(slot(&collector, 0.9)));

        let mut block = StereoBuffer::silence(64);
        for _ in 0..7 {
            assert_eq!(chain.process(&mut block, PERIOD), AuditionOutcome::Processed);
        }
        assert_eq!(chain.process(&mut block, PERIOD), AuditionOutcome::Disabled);
        assert!(!chain.has_processor());

        // One-shot: later blocks are simply empty
        assert_eq!(chain.process(&mut block, PERIOD), AuditionOutcome::Empty);
        collector.collect();
    }

    #[test]
    fn test_strikes_need_to_be_consecutive() {
        let mut collector = Collector::new();
        let mut chain = EffectAuditionChain::new(0.5, 3, 64);
        chain.set_processor(Some(slot(&collector, 0.9)));
        let mut block = StereoBuffer::silence(16);

        chain.process(&mut block, PERIOD);
        chain.process(&mut block, PERIOD);
        // Replacing the processor clears the strike count
        let old = chain.set_processor(Some(slot(&collector, 0.9)));
        assert!(old.is_some());
        drop(old);
        chain.process(&mut block, PERIOD);
        chain.process(&mut block, PERIOD);
        assert!(chain.has_processor());
        assert_eq!(chain.process(&mut block, PERIOD), AuditionOutcome::Disabled);
        collector.collect();
    }

    struct Panics;

    impl AudioEffectProcessor for Panics {
        fn process(&mut self, block: &mut StereoBuffer) {
            block.fill_silence();
            panic!("processor failure");
        }

        fn name(&self) -> &str {
            "panics"
        }
    }

    #[test]
    fn test_panicking_processor_is_removed_and_dry_signal_kept() {
        let mut collector = Collector::new();
        let mut chain = EffectAuditionChain::new(0.5, 8, 64);
        let processor: Box<dyn AudioEffectProcessor> = Box::new(Panics);
        chain.set_processor(Some(Owned::new(&collector.handle(), processor)));

        let mut block = StereoBuffer::from_vec(vec![StereoSample::new(0.3, -0.3); 32]);
        assert_eq!(chain.process(&mut block, PERIOD), AuditionOutcome::Disabled);
        assert!(!chain.has_processor());
        assert!(block.iter().all(|s| *s == StereoSample::new(0.3, -0.3)));

        assert_eq!(chain.process(&mut block, PERIOD), AuditionOutcome::Empty);
        collector.collect();
    }

    #[test]
    fn test_bypass_skips_processing() {
        let mut collector = Collector::new();
        let mut chain = EffectAuditionChain::new(0.5, 8, 64);
        chain.set_processor(Some(slot(&collector, 0.9)));
        chain.set_bypassed(true);

        let mut block = StereoBuffer::from_vec(vec![StereoSample::new(1.0, 1.0); 4]);
        for _ in 0..20 {
            assert_eq!(chain.process(&mut block, PERIOD), AuditionOutcome::Bypassed);
        }
        assert_eq!(block[0].left, 1.0);
        assert!(chain.has_processor());
        drop(chain);
        collector.collect();
    }
}
