//! Notifications from the audio thread to the control side
//!
//! The engine never logs or calls back into the UI. Conditions raised inside
//! the callback are pushed onto an `rtrb` ring and drained by
//! [`super::PlaybackController::poll_events`]. A full ring drops the event
//! and counts it.

use super::overload::DegradeLevel;
use crate::types::SourceId;

/// Default event ring capacity
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// One-shot engine notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    /// End of material reached without looping; transport stopped
    PlaybackComplete,
    /// End of selection reached with the constraint on and looping off
    SelectionEnded,
    /// Playback wrapped back to the loop start
    LoopWrapped,
    /// The auditioned effect overran its budget and was removed
    AuditionDisabled,
    OverloadEscalated(DegradeLevel),
    OverloadRecovered(DegradeLevel),
    /// A source could not supply data (underrun or decode miss).
    /// Sent for the first block of a run only.
    SourceUnderrun(SourceId),
    /// A source's rate configuration is invalid; it contributes silence
    ConfigurationError(SourceId),
    /// Output clipped (first block of a clipping run)
    Clipped { samples: u32 },
    /// A block failed inside the pull chain and was replaced by silence
    BlockFailed,
    /// A detached source left the engine; its state is being reclaimed
    SourceDetached(SourceId),
    /// An alignment path was swapped in for this source
    AlignmentInstalled(SourceId),
}

/// Create the event ring `(Producer, Consumer)`.
///
/// The producer goes to the engine, the consumer to the controller.
pub fn event_channel(
    capacity: usize,
) -> (rtrb::Producer<EngineEvent>, rtrb::Consumer<EngineEvent>) {
    rtrb::RingBuffer::new(capacity.max(1))
}
