//! Playback engine - transport, source slots, mixer, overload handling
//!
//! This module contains the real-time side of the system and its control
//! handle:
//! - PlaybackEngine: runs inside the device callback, owns all playback state
//! - PlaybackController: control-thread API, sends commands, reads status
//! - SourceSlot: per-source read → convert → stretch chain
//! - PlaybackMixer: gain/pan/mute/solo summation and output limiting
//! - OverloadGovernor: block cost tracking and the degradation ladder
//! - Reclaimer: deferred deallocation off the audio thread

mod command;
mod controller;
mod engine;
mod events;
mod gc;
mod mixer;
mod overload;
mod slot;
mod state;

pub use command::{command_channel, EngineCommand, COMMAND_QUEUE_CAPACITY};
pub use controller::{EngineError, EngineResult, PlaybackController};
pub use engine::{EngineSettings, PlaybackEngine};
pub use events::{event_channel, EngineEvent, EVENT_QUEUE_CAPACITY};
pub use gc::Reclaimer;
pub use mixer::*;
pub use overload::*;
pub use slot::{RenderReport, SlotParams, SourceSlot, RESYNC_THRESHOLD_FRAMES};
pub use state::{PlaybackAtomics, PlaybackState, Selection};
