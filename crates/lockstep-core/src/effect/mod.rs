//! Effect audition - one externally supplied processor on the mixed signal
//!
//! Plugin hosting lives outside this crate. Hosts adapt their plugins to
//! [`AudioEffectProcessor`] and hand them to the engine, which runs at most
//! one of them through an [`EffectAuditionChain`] with CPU budget tracking.

mod audition;
mod gain;

pub use audition::{
    AuditionOutcome, EffectAuditionChain, ProcessorSlot, DEFAULT_EFFECT_BUDGET,
    DEFAULT_STRIKE_LIMIT,
};
pub use gain::GainProcessor;

use crate::types::StereoBuffer;

/// Capability interface for an auditioned effect
///
/// `process` runs on the real-time thread: no blocking, no allocation.
pub trait AudioEffectProcessor: Send {
    /// Process a stereo block in place
    fn process(&mut self, block: &mut StereoBuffer);

    /// Fraction of the callback period the processor believes it uses.
    ///
    /// Hosts that measure plugin time themselves report it here; the chain
    /// also measures wall-clock time and uses the larger of the two.
    fn reported_load_fraction(&self) -> f32 {
        0.0
    }

    /// Display name for notifications
    fn name(&self) -> &str;

    /// Clear internal state (called when installed)
    fn reset(&mut self) {}
}
