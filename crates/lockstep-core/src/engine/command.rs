//! Lock-free command queue from the control side to the audio thread
//!
//! Every control API call becomes an [`EngineCommand`] pushed onto an `rtrb`
//! ring. The engine drains the ring at the start of each callback, so a
//! command always takes effect on a block boundary and never mid-block.
//!
//! Pushing and popping are wait-free. Large payloads are boxed (through
//! `basedrop::Owned` so the audio thread can drop them) to keep the enum
//! small.

use basedrop::{Owned, Shared};

use super::slot::SourceSlot;
use crate::alignment::AlignmentPath;
use crate::effect::ProcessorSlot;
use crate::types::SourceId;

/// Default command ring capacity
pub const COMMAND_QUEUE_CAPACITY: usize = 1024;

/// Commands sent from the control thread to the audio thread
pub enum EngineCommand {
    // ─────────────────────────────────────────────────────────────
    // Transport
    // ─────────────────────────────────────────────────────────────
    Play,
    Pause,
    /// Stop, keeping the position, and drop stretch history
    Stop,
    /// Move to a timeline frame at the next block boundary
    Seek(i64),
    SetSpeedRatio(f64),
    SetLoop(bool),
    SetSelection { start: i64, end: i64 },
    ClearSelection,
    SetSelectionConstraint(bool),

    // ─────────────────────────────────────────────────────────────
    // Sources
    // ─────────────────────────────────────────────────────────────
    /// Add a prepared slot (built and sized on the control thread)
    AttachSource(Owned<SourceSlot>),
    DetachSource(SourceId),
    SetSourceGain { id: SourceId, gain_db: f32 },
    SetSourcePan { id: SourceId, pan: f32 },
    SetSourceMute { id: SourceId, muted: bool },
    SetSourceSolo { id: SourceId, soloed: bool },

    // ─────────────────────────────────────────────────────────────
    // Effects, alignment, capture
    // ─────────────────────────────────────────────────────────────
    /// Install (or remove) the auditioned effect
    SetEffectProcessor(Option<ProcessorSlot>),
    /// Install (or clear) the alignment path of a target source
    InstallAlignment {
        id: SourceId,
        path: Option<Shared<AlignmentPath>>,
    },
    /// Choose the source the others are aligned to
    SetReferenceSource(Option<SourceId>),
    SetCapture(bool),
}

/// Create a command channel `(Producer, Consumer)`.
///
/// The producer stays with the controller, the consumer moves to the engine.
pub fn command_channel(
    capacity: usize,
) -> (rtrb::Producer<EngineCommand>, rtrb::Consumer<EngineCommand>) {
    rtrb::RingBuffer::new(capacity.max(1))
}
