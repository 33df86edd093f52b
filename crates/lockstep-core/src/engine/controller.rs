//! Control-side API of the playback engine
//!
//! [`PlaybackController`] is what the UI or command layer holds. Every call
//! is validated here, then encoded as an [`EngineCommand`] and pushed onto
//! the lock-free command ring; the audio thread applies it at the next block
//! boundary. State flows back through atomics (read any time, no locks) and
//! the event ring (drained by [`PlaybackController::poll_events`]).
//!
//! The controller also owns everything that must never run on the audio
//! thread: slot construction, the alignment worker, the capture writer and
//! the deferred-drop collector.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use basedrop::Owned;
use thiserror::Error;

use super::command::{command_channel, EngineCommand};
use super::engine::{EngineSettings, PlaybackEngine};
use super::events::{event_channel, EngineEvent};
use super::gc::Reclaimer;
use super::mixer::{OutputLevels, PlaybackMixer};
use super::overload::{OverloadAtomics, OverloadStatus};
use super::slot::{SlotParams, SourceSlot};
use super::state::{PlaybackAtomics, Selection};
use crate::alignment::{
    AlignmentCoordinator, AlignmentError, AlignmentStatus, AlignmentTransform, EnvelopeAligner,
};
use crate::capture::{capture_channel, CaptureError, CaptureWriter};
use crate::config::EngineConfig;
use crate::effect::AudioEffectProcessor;
use crate::source::SampleSource;
use crate::timestretch::clamp_speed_ratio;
use crate::types::SourceId;

/// Control-side errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine command queue is full")]
    QueueFull,

    #[error("unknown source: {0}")]
    UnknownSource(SourceId),

    #[error("all {max} source slots are in use")]
    CapacityExhausted { max: usize },

    #[error("invalid source: {0}")]
    InvalidSource(String),

    #[error("invalid selection: start {start} is not before end {end}")]
    InvalidSelection { start: i64, end: i64 },

    #[error("no reference source is set")]
    NoReference,

    #[error(transparent)]
    Alignment(#[from] AlignmentError),

    #[error(transparent)]
    Capture(#[from] CaptureError),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Handle for driving a [`PlaybackEngine`] from the control thread
pub struct PlaybackController {
    commands: rtrb::Producer<EngineCommand>,
    events: rtrb::Consumer<EngineEvent>,
    playback: Arc<PlaybackAtomics>,
    overload: Arc<OverloadAtomics>,
    levels: Arc<OutputLevels>,
    params: SlotParams,
    timeline_rate: u32,
    max_sources: usize,
    sources: BTreeMap<SourceId, Arc<dyn SampleSource>>,
    next_id: u32,
    reference: Option<SourceId>,
    alignment: AlignmentCoordinator,
    capture: CaptureWriter,
    // Last: everything above may still hold reclaimable allocations
    gc: Reclaimer,
}

impl PlaybackController {
    /// Create a connected controller/engine pair for a stream running at
    /// `device_rate`. Uses [`EnvelopeAligner`] for alignment.
    pub fn new(config: &EngineConfig, device_rate: u32) -> (Self, PlaybackEngine) {
        Self::with_transform(config, device_rate, Arc::new(EnvelopeAligner))
    }

    /// Same as [`PlaybackController::new`] with a custom alignment transform
    pub fn with_transform(
        config: &EngineConfig,
        device_rate: u32,
        transform: Arc<dyn AlignmentTransform>,
    ) -> (Self, PlaybackEngine) {
        let device_rate = device_rate.max(1);
        let max_block_frames = config.max_block_frames.max(1);
        let timeline_rate = config.timeline_rate_for(device_rate);

        let gc = Reclaimer::spawn();
        let (command_tx, command_rx) = command_channel(config.command_queue_capacity);
        let (event_tx, event_rx) = event_channel(config.event_queue_capacity);
        let (tap, writer) = capture_channel(config.capture_ring_frames);
        let playback = Arc::new(PlaybackAtomics::default());
        let overload = Arc::new(OverloadAtomics::default());
        let mixer = PlaybackMixer::new();
        let levels = mixer.levels();

        let settings = EngineSettings {
            device_rate,
            timeline_rate,
            max_block_frames,
            max_sources: config.max_sources,
            effect_budget: config.effect_budget_fraction,
            effect_strike_limit: config.effect_strike_limit,
            overload: config.overload,
        };
        let engine = PlaybackEngine::new(
            settings,
            mixer,
            command_rx,
            event_tx,
            Arc::clone(&playback),
            Arc::clone(&overload),
            tap,
        );

        let alignment = AlignmentCoordinator::spawn(transform, gc.handle());

        log::info!(
            "Playback engine created: device {} Hz, timeline {} Hz, {} sources, {} frame blocks",
            device_rate,
            timeline_rate,
            config.max_sources,
            max_block_frames
        );

        let controller = Self {
            commands: command_tx,
            events: event_rx,
            playback,
            overload,
            levels,
            params: SlotParams {
                device_rate,
                max_block_frames,
                convert_quality: config.convert_quality,
                stretch_quality: config.stretch_quality,
            },
            timeline_rate,
            max_sources: config.max_sources,
            sources: BTreeMap::new(),
            next_id: 1,
            reference: None,
            alignment,
            capture: writer,
            gc,
        };
        (controller, engine)
    }

    fn send(&mut self, command: EngineCommand) -> EngineResult<()> {
        self.commands.push(command).map_err(|_| EngineError::QueueFull)
    }

    fn ensure_known(&self, id: SourceId) -> EngineResult<()> {
        if self.sources.contains_key(&id) {
            Ok(())
        } else {
            Err(EngineError::UnknownSource(id))
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Transport
    // ─────────────────────────────────────────────────────────────

    pub fn play(&mut self) -> EngineResult<()> {
        self.send(EngineCommand::Play)
    }

    pub fn pause(&mut self) -> EngineResult<()> {
        self.send(EngineCommand::Pause)
    }

    pub fn stop(&mut self) -> EngineResult<()> {
        self.send(EngineCommand::Stop)
    }

    /// Move to a timeline frame (negative frames clamp to 0)
    pub fn seek(&mut self, frame: i64) -> EngineResult<()> {
        self.send(EngineCommand::Seek(frame.max(0)))
    }

    /// Set the playback speed. Out-of-range ratios are clamped; the applied
    /// ratio is returned.
    pub fn set_speed_ratio(&mut self, ratio: f64) -> EngineResult<f64> {
        let clamped = clamp_speed_ratio(ratio);
        if clamped != ratio {
            log::warn!("Speed ratio {} out of range, clamped to {}", ratio, clamped);
        }
        self.send(EngineCommand::SetSpeedRatio(clamped))?;
        Ok(clamped)
    }

    pub fn set_loop(&mut self, enabled: bool) -> EngineResult<()> {
        self.send(EngineCommand::SetLoop(enabled))
    }

    pub fn set_selection(&mut self, start: i64, end: i64) -> EngineResult<()> {
        let selection =
            Selection::new(start, end).ok_or(EngineError::InvalidSelection { start, end })?;
        self.send(EngineCommand::SetSelection {
            start: selection.start,
            end: selection.end,
        })
    }

    pub fn clear_selection(&mut self) -> EngineResult<()> {
        self.send(EngineCommand::ClearSelection)
    }

    pub fn set_selection_constraint(&mut self, enabled: bool) -> EngineResult<()> {
        self.send(EngineCommand::SetSelectionConstraint(enabled))
    }

    // ─────────────────────────────────────────────────────────────
    // Sources
    // ─────────────────────────────────────────────────────────────

    /// Attach a source. The slot and all its buffers are built here, off the
    /// audio thread.
    pub fn attach_source(&mut self, source: Arc<dyn SampleSource>) -> EngineResult<SourceId> {
        if source.channel_count() == 0 {
            return Err(EngineError::InvalidSource(format!(
                "'{}' has no channels",
                source.label()
            )));
        }
        if self.sources.len() >= self.max_sources {
            return Err(EngineError::CapacityExhausted { max: self.max_sources });
        }

        let id = SourceId(self.next_id);
        let slot = SourceSlot::new(id, Arc::clone(&source), &self.params);
        if source.native_sample_rate() == 0 {
            log::warn!(
                "Source '{}' has an invalid sample rate and will play silent",
                source.label()
            );
        }
        self.send(EngineCommand::AttachSource(Owned::new(&self.gc.handle(), slot)))?;

        log::info!(
            "Attached {} '{}' ({} Hz, {} ch)",
            id,
            source.label(),
            source.native_sample_rate(),
            source.channel_count()
        );
        self.next_id += 1;
        self.sources.insert(id, source);
        Ok(id)
    }

    /// Detach a source. Any alignment job for it is cancelled.
    pub fn detach_source(&mut self, id: SourceId) -> EngineResult<()> {
        self.ensure_known(id)?;
        self.send(EngineCommand::DetachSource(id))?;
        self.sources.remove(&id);
        self.alignment.forget(id);
        if self.reference == Some(id) {
            self.reference = None;
        }
        Ok(())
    }

    pub fn source_ids(&self) -> Vec<SourceId> {
        self.sources.keys().copied().collect()
    }

    pub fn set_source_gain(&mut self, id: SourceId, gain_db: f32) -> EngineResult<()> {
        self.ensure_known(id)?;
        self.send(EngineCommand::SetSourceGain { id, gain_db })
    }

    /// Pan in [-1, 1]; clamped
    pub fn set_source_pan(&mut self, id: SourceId, pan: f32) -> EngineResult<()> {
        self.ensure_known(id)?;
        self.send(EngineCommand::SetSourcePan {
            id,
            pan: pan.clamp(-1.0, 1.0),
        })
    }

    pub fn set_source_mute(&mut self, id: SourceId, muted: bool) -> EngineResult<()> {
        self.ensure_known(id)?;
        self.send(EngineCommand::SetSourceMute { id, muted })
    }

    pub fn set_source_solo(&mut self, id: SourceId, soloed: bool) -> EngineResult<()> {
        self.ensure_known(id)?;
        self.send(EngineCommand::SetSourceSolo { id, soloed })
    }

    // ─────────────────────────────────────────────────────────────
    // Effect audition
    // ─────────────────────────────────────────────────────────────

    /// Install the auditioned effect, or remove it with `None`
    pub fn set_effect_processor(
        &mut self,
        processor: Option<Box<dyn AudioEffectProcessor>>,
    ) -> EngineResult<()> {
        let handle = self.gc.handle();
        if let Some(p) = &processor {
            log::info!("Auditioning effect '{}'", p.name());
        }
        let slot = processor.map(|p| Owned::new(&handle, p));
        self.send(EngineCommand::SetEffectProcessor(slot))
    }

    // ─────────────────────────────────────────────────────────────
    // Alignment
    // ─────────────────────────────────────────────────────────────

    /// Choose the source the others are aligned to (`None` disables
    /// alignment-following for every source)
    pub fn set_reference_source(&mut self, id: Option<SourceId>) -> EngineResult<()> {
        if let Some(id) = id {
            self.ensure_known(id)?;
        }
        self.send(EngineCommand::SetReferenceSource(id))?;
        self.reference = id;
        Ok(())
    }

    pub fn reference_source(&self) -> Option<SourceId> {
        self.reference
    }

    /// Start computing the alignment of `target` against the reference
    /// source. Playback continues unaligned until the path is ready.
    pub fn request_alignment(&mut self, target: SourceId) -> EngineResult<()> {
        let reference = self.reference.ok_or(EngineError::NoReference)?;
        if reference == target {
            return Err(EngineError::InvalidSource(format!(
                "{} is the reference source",
                target
            )));
        }
        let reference_source = self
            .sources
            .get(&reference)
            .cloned()
            .ok_or(EngineError::UnknownSource(reference))?;
        let target_source = self
            .sources
            .get(&target)
            .cloned()
            .ok_or(EngineError::UnknownSource(target))?;

        self.alignment.request(target, reference_source, target_source)?;
        Ok(())
    }

    pub fn cancel_alignment(&mut self, target: SourceId) {
        self.alignment.cancel(target);
    }

    /// Drop the installed path of `target`; it plays unaligned again
    pub fn clear_alignment(&mut self, target: SourceId) -> EngineResult<()> {
        self.ensure_known(target)?;
        self.alignment.clear(target);
        self.send(EngineCommand::InstallAlignment { id: target, path: None })
    }

    pub fn alignment_status(&self, target: SourceId) -> AlignmentStatus {
        self.alignment.status(target)
    }

    /// Reference frame → target frame through the installed path (identity
    /// while unaligned)
    pub fn map_to_target(&self, target: SourceId, reference_frame: i64) -> i64 {
        self.alignment.map_to_target(target, reference_frame)
    }

    // ─────────────────────────────────────────────────────────────
    // Capture
    // ─────────────────────────────────────────────────────────────

    /// Record the engine output to a WAV file at `path`
    pub fn start_capture(&mut self, path: &Path) -> EngineResult<()> {
        self.capture.start(path, self.params.device_rate)?;
        self.send(EngineCommand::SetCapture(true))
    }

    /// Stop recording and close the file. Returns the frames written.
    ///
    /// A full command queue leaves the recording running; retry later.
    pub fn stop_capture(&mut self) -> EngineResult<u64> {
        self.send(EngineCommand::SetCapture(false))?;
        Ok(self.capture.finish()?)
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_recording()
    }

    // ─────────────────────────────────────────────────────────────
    // Status
    // ─────────────────────────────────────────────────────────────

    /// Timeline position in frames (timeline rate)
    pub fn position(&self) -> i64 {
        self.playback.position()
    }

    pub fn position_seconds(&self) -> f64 {
        self.playback.position() as f64 / self.timeline_rate as f64
    }

    pub fn timeline_rate(&self) -> u32 {
        self.timeline_rate
    }

    pub fn device_rate(&self) -> u32 {
        self.params.device_rate
    }

    pub fn is_playing(&self) -> bool {
        self.playback.is_playing()
    }

    pub fn speed_ratio(&self) -> f64 {
        self.playback.speed_ratio()
    }

    pub fn overload_status(&self) -> OverloadStatus {
        self.overload.snapshot()
    }

    pub fn output_levels(&self) -> Arc<OutputLevels> {
        Arc::clone(&self.levels)
    }

    pub fn playback_atomics(&self) -> Arc<PlaybackAtomics> {
        Arc::clone(&self.playback)
    }

    /// Drain engine notifications, service the capture file and install
    /// finished alignment paths. Call periodically from the control thread.
    pub fn poll_events(&mut self) -> Vec<EngineEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.pop() {
            log_event(&event);
            drained.push(event);
        }

        if let Err(e) = self.capture.drain() {
            log::error!("Capture write failed: {}", e);
        }

        for (id, path) in self.alignment.drain_finished() {
            if !self.sources.contains_key(&id) {
                continue;
            }
            if self
                .send(EngineCommand::InstallAlignment { id, path: Some(path) })
                .is_err()
            {
                log::warn!("Command queue full, alignment for {} not installed", id);
            }
        }

        drained
    }
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::PlaybackComplete => log::info!("Playback complete"),
        EngineEvent::SelectionEnded => log::info!("Reached end of selection"),
        EngineEvent::LoopWrapped => log::debug!("Loop wrapped"),
        EngineEvent::AuditionDisabled => {
            log::warn!("Effect audition disabled: processor exceeded its CPU budget or failed")
        }
        EngineEvent::OverloadEscalated(level) => {
            log::warn!("Audio overload, degraded to {:?}", level)
        }
        EngineEvent::OverloadRecovered(level) => log::info!("Audio load recovered to {:?}", level),
        EngineEvent::SourceUnderrun(id) => log::warn!("{} underrun, playing silence", id),
        EngineEvent::ConfigurationError(id) => {
            log::warn!("{} has an invalid rate configuration, playing silence", id)
        }
        EngineEvent::Clipped { samples } => log::warn!("Output clipped ({} samples)", samples),
        EngineEvent::BlockFailed => log::error!("Audio block failed, replaced with silence"),
        EngineEvent::SourceDetached(id) => log::debug!("{} detached", id),
        EngineEvent::AlignmentInstalled(id) => log::info!("Alignment installed for {}", id),
    }
}
