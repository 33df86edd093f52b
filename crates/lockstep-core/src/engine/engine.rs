//! Real-time playback engine
//!
//! [`PlaybackEngine`] is the audio-thread half of the system. The device
//! callback hands it an output block; per block it:
//!
//! 1. drains the command queue (transport, sources, effects, alignment)
//! 2. advances the timeline by the glided speed ratio, splitting the block
//!    where it meets a loop, selection or material boundary
//! 3. pulls every source through read → convert → stretch
//! 4. mixes, runs the auditioned effect, hard-limits and captures
//! 5. measures its own cost and steps the overload ladder
//!
//! Nothing here blocks, locks, logs or allocates. Conditions are reported
//! through atomics and the event ring; dropped objects go to the reclaimer.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use basedrop::Owned;

use super::command::EngineCommand;
use super::events::EngineEvent;
use super::mixer::PlaybackMixer;
use super::overload::{
    CostMeter, DegradeLevel, LevelChange, OverloadAtomics, OverloadGovernor, OverloadPolicy,
    WallClockMeter,
};
use super::slot::SourceSlot;
use super::state::{PlaybackAtomics, PlaybackState, Selection};
use crate::capture::CaptureTap;
use crate::effect::{AuditionOutcome, EffectAuditionChain};
use crate::timestretch::{clamp_speed_ratio, SpeedGlide};
use crate::types::{SourceId, StereoBuffer, StereoSample};

/// Session-fixed engine parameters
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub device_rate: u32,
    /// Rate positions are counted in
    pub timeline_rate: u32,
    pub max_block_frames: usize,
    pub max_sources: usize,
    pub effect_budget: f32,
    pub effect_strike_limit: u32,
    pub overload: OverloadPolicy,
}

/// What stops the timeline inside a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Boundary {
    SelectionEnd(Selection),
    MaterialEnd(i64),
}

impl Boundary {
    fn end(&self) -> i64 {
        match self {
            Boundary::SelectionEnd(selection) => selection.end,
            Boundary::MaterialEnd(end) => *end,
        }
    }
}

/// Push an event, counting it when the ring is full
#[inline]
fn emit(events: &mut rtrb::Producer<EngineEvent>, playback: &PlaybackAtomics, event: EngineEvent) {
    if events.push(event).is_err() {
        playback.count_dropped_event();
    }
}

/// Audio-thread engine. Moved into the device callback at stream start.
pub struct PlaybackEngine {
    settings: EngineSettings,
    state: PlaybackState,
    glide: SpeedGlide,
    /// Fractional timeline frames carried between blocks
    timeline_fraction: f64,
    slots: Vec<Owned<SourceSlot>>,
    reference: Option<SourceId>,
    mixer: PlaybackMixer,
    effects: EffectAuditionChain,
    audition_disabled: bool,
    governor: OverloadGovernor,
    meter: Box<dyn CostMeter>,
    degraded_mono: bool,
    block: StereoBuffer,
    segment: StereoBuffer,
    commands: rtrb::Consumer<EngineCommand>,
    events: rtrb::Producer<EngineEvent>,
    playback: Arc<PlaybackAtomics>,
    overload: Arc<OverloadAtomics>,
    capture: CaptureTap,
}

impl PlaybackEngine {
    pub(crate) fn new(
        settings: EngineSettings,
        mixer: PlaybackMixer,
        commands: rtrb::Consumer<EngineCommand>,
        events: rtrb::Producer<EngineEvent>,
        playback: Arc<PlaybackAtomics>,
        overload: Arc<OverloadAtomics>,
        capture: CaptureTap,
    ) -> Self {
        let max_block_frames = settings.max_block_frames.max(1);
        let settings = EngineSettings {
            max_block_frames,
            timeline_rate: settings.timeline_rate.max(1),
            device_rate: settings.device_rate.max(1),
            ..settings
        };

        Self {
            state: PlaybackState::default(),
            glide: SpeedGlide::new(1.0),
            timeline_fraction: 0.0,
            slots: Vec::with_capacity(settings.max_sources),
            reference: None,
            mixer,
            effects: EffectAuditionChain::new(
                settings.effect_budget,
                settings.effect_strike_limit,
                max_block_frames,
            ),
            audition_disabled: false,
            governor: OverloadGovernor::new(settings.overload),
            meter: Box::new(WallClockMeter::default()),
            degraded_mono: false,
            block: StereoBuffer::with_capacity(max_block_frames),
            segment: StereoBuffer::with_capacity(max_block_frames),
            commands,
            events,
            playback,
            overload,
            capture,
            settings,
        }
    }

    /// Replace the block cost measurement (the default is wall clock)
    pub fn with_cost_meter(mut self, meter: Box<dyn CostMeter>) -> Self {
        self.meter = meter;
        self
    }

    pub fn device_rate(&self) -> u32 {
        self.settings.device_rate
    }

    pub fn max_block_frames(&self) -> usize {
        self.settings.max_block_frames
    }

    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    pub fn degrade_level(&self) -> DegradeLevel {
        self.governor.level()
    }

    pub fn source_count(&self) -> usize {
        self.slots.len()
    }

    /// Clear overload and level state. Called when a stream starts.
    pub fn reset_for_stream_start(&mut self) {
        self.governor.reset();
        self.overload.reset();
        self.mixer.reset();
        self.apply_level(DegradeLevel::Full);
    }

    /// Fill `output` with the next frames. Never fails, never blocks.
    ///
    /// Requests larger than the preallocated block size are processed in
    /// chunks.
    pub fn process(&mut self, output: &mut [StereoSample]) {
        let max = self.settings.max_block_frames;
        for chunk in output.chunks_mut(max) {
            let result = panic::catch_unwind(AssertUnwindSafe(|| self.render_block(chunk)));
            if result.is_err() {
                chunk.fill(StereoSample::silence());
                emit(&mut self.events, &self.playback, EngineEvent::BlockFailed);
            }
            self.playback.publish(&self.state);
            self.playback.count_block();
        }
    }

    fn render_block(&mut self, output: &mut [StereoSample]) {
        self.drain_commands();

        let frames = output.len();
        let period = Duration::from_secs_f64(frames as f64 / self.settings.device_rate as f64);

        self.meter.begin();
        let level = self.governor.level();
        self.apply_level(level);

        self.block.set_len_from_capacity(frames);
        self.block.fill_silence();

        if self.state.is_playing {
            let pull = level != DegradeLevel::Silent;
            self.advance(frames, pull);
            if !pull {
                self.overload.count_silenced();
            }
        }

        if level != DegradeLevel::Silent
            && self.effects.process(&mut self.block, period) == AuditionOutcome::Disabled
        {
            self.audition_disabled = true;
            emit(&mut self.events, &self.playback, EngineEvent::AuditionDisabled);
        }

        let clip = self.mixer.finalize(&mut self.block);
        if clip.onset {
            emit(
                &mut self.events,
                &self.playback,
                EngineEvent::Clipped { samples: clip.clipped },
            );
        }
        self.capture.write(self.block.as_slice());
        output.copy_from_slice(self.block.as_slice());

        let cost = self.meter.end();
        match self.governor.observe(cost, period) {
            Some(LevelChange::Escalated(level)) => {
                emit(&mut self.events, &self.playback, EngineEvent::OverloadEscalated(level))
            }
            Some(LevelChange::Recovered(level)) => {
                emit(&mut self.events, &self.playback, EngineEvent::OverloadRecovered(level))
            }
            None => {}
        }
        let effects_disabled = self.governor.level().effects_disabled() || self.audition_disabled;
        self.overload.publish(&self.governor, effects_disabled);
    }

    fn apply_level(&mut self, level: DegradeLevel) {
        self.effects.set_bypassed(level.effects_disabled());
        let mono = level.mono();
        if mono != self.degraded_mono {
            self.degraded_mono = mono;
            for slot in self.slots.iter_mut() {
                slot.set_mono(mono);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Timeline
    // ─────────────────────────────────────────────────────────────

    /// Native rate of the reference source, when one is attached
    fn reference_rate(&self) -> Option<u32> {
        let reference = self.reference?;
        self.find_slot(reference)
            .ok()
            .map(|index| self.slots[index].native_rate())
    }

    /// Rate `slot` should map through an alignment path with, if any
    #[inline]
    fn alignment_rate(
        reference: Option<SourceId>,
        reference_rate: Option<u32>,
        slot: &SourceSlot,
    ) -> Option<u32> {
        if reference == Some(slot.id()) {
            None
        } else {
            reference_rate
        }
    }

    /// End of material in timeline frames: the longest source that follows
    /// the timeline directly. `None` if any such source is unbounded.
    fn material_end(&self) -> Option<i64> {
        let reference_rate = self.reference_rate();
        let mut end: Option<i64> = None;
        for slot in self.slots.iter() {
            let follows_path = slot.is_aligned()
                && Self::alignment_rate(self.reference, reference_rate, slot).is_some();
            if follows_path {
                continue;
            }
            let length = slot.timeline_length(self.settings.timeline_rate)?;
            end = Some(end.map_or(length, |e| e.max(length)));
        }
        end
    }

    fn boundary(&self) -> Option<Boundary> {
        match self.state.active_selection() {
            Some(selection) => Some(Boundary::SelectionEnd(selection)),
            None => self.material_end().map(Boundary::MaterialEnd),
        }
    }

    /// Advance the timeline by `frames` output frames, rendering into
    /// `self.block` when `pull` is set.
    fn advance(&mut self, frames: usize, pull: bool) {
        let scale = self.settings.timeline_rate as f64 / self.settings.device_rate as f64;
        let mut offset = 0;
        // Every pass either renders at least one frame or stops/wraps
        let mut passes = 0;

        while offset < frames && self.state.is_playing && passes <= frames + 2 {
            passes += 1;
            let boundary = self.boundary();
            let start = self.state.position_frames;
            let mut count = frames - offset;

            if let Some(boundary) = boundary {
                let left = boundary.end() - start;
                if left <= 0 {
                    self.reach_boundary(boundary);
                    continue;
                }
                let per_frame = (self.glide.current() * scale).max(f64::EPSILON);
                let needed = ((left as f64 - self.timeline_fraction) / per_frame).ceil();
                count = count.min(needed.max(1.0) as usize);
            }

            let advanced = self.timeline_fraction + self.glide.advance(count) * scale;
            let whole = advanced.floor();
            self.timeline_fraction = advanced - whole;
            let mut end = start + whole as i64;

            let reached = boundary.filter(|b| end >= b.end());
            if let Some(boundary) = reached {
                end = boundary.end();
                self.timeline_fraction = 0.0;
            }

            if pull {
                self.render_segment(start, end, offset, count);
            }
            self.state.position_frames = end;
            offset += count;

            if let Some(boundary) = reached {
                self.reach_boundary(boundary);
            }
        }
    }

    fn reach_boundary(&mut self, boundary: Boundary) {
        let (loop_start, finished) = match boundary {
            Boundary::SelectionEnd(selection) => (selection.start, EngineEvent::SelectionEnded),
            Boundary::MaterialEnd(_) => (0, EngineEvent::PlaybackComplete),
        };

        if self.state.loop_enabled && loop_start < boundary.end() {
            self.jump_to(loop_start);
            emit(&mut self.events, &self.playback, EngineEvent::LoopWrapped);
        } else {
            self.state.is_playing = false;
            emit(&mut self.events, &self.playback, finished);
        }
    }

    /// Move the timeline and every source cursor, dropping stretch history
    fn jump_to(&mut self, position: i64) {
        self.state.position_frames = position.max(0);
        self.timeline_fraction = 0.0;
        self.relocate_all();
    }

    fn relocate_all(&mut self) {
        let reference_rate = self.reference_rate();
        let position = self.state.position_frames;
        let timeline_rate = self.settings.timeline_rate;
        for slot in self.slots.iter_mut() {
            let rate = Self::alignment_rate(self.reference, reference_rate, slot);
            let frame = slot.source_frame_at(position, timeline_rate, rate);
            slot.relocate(frame);
        }
    }

    fn render_segment(&mut self, start: i64, end: i64, offset: usize, count: usize) {
        let reference_rate = self.reference_rate();
        let timeline_rate = self.settings.timeline_rate;

        for slot in self.slots.iter_mut() {
            let rate = Self::alignment_rate(self.reference, reference_rate, slot);
            let source_start = slot.source_frame_at(start, timeline_rate, rate);
            let source_end = slot.source_frame_at(end, timeline_rate, rate);
            let report = slot.render(source_start, source_end, count);
            if report.underrun {
                self.playback.count_underrun();
                if report.underrun_onset {
                    emit(&mut self.events, &self.playback, EngineEvent::SourceUnderrun(slot.id()));
                }
            }
        }

        self.segment.set_len_from_capacity(count);
        self.mixer.mix(
            self.slots.iter().map(|slot| (&slot.channel, slot.output(count))),
            &mut self.segment,
        );
        self.block.as_mut_slice()[offset..offset + count].copy_from_slice(self.segment.as_slice());
    }

    // ─────────────────────────────────────────────────────────────
    // Commands
    // ─────────────────────────────────────────────────────────────

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.pop() {
            self.apply(command);
        }
    }

    fn find_slot(&self, id: SourceId) -> Result<usize, usize> {
        self.slots.binary_search_by_key(&id, |slot| slot.id())
    }

    fn with_channel(&mut self, id: SourceId, f: impl FnOnce(&mut SourceSlot)) {
        if let Ok(index) = self.find_slot(id) {
            f(&mut self.slots[index]);
        }
    }

    fn update_solo(&mut self) {
        self.state.solo_source_id = self
            .slots
            .iter()
            .find(|slot| slot.channel.soloed)
            .map(|slot| slot.id());
    }

    fn apply(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Play => self.play(),
            EngineCommand::Pause => self.state.is_playing = false,
            EngineCommand::Stop => {
                self.state.is_playing = false;
                self.jump_to(self.state.position_frames);
            }
            EngineCommand::Seek(frame) => self.jump_to(frame),
            EngineCommand::SetSpeedRatio(ratio) => {
                let ratio = clamp_speed_ratio(ratio);
                self.state.speed_ratio = ratio;
                self.glide.set_target(ratio);
                for slot in self.slots.iter_mut() {
                    slot.set_speed_ratio(ratio);
                }
            }
            EngineCommand::SetLoop(enabled) => self.state.loop_enabled = enabled,
            EngineCommand::SetSelection { start, end } => {
                if let Some(selection) = Selection::new(start, end) {
                    self.state.selection = Some(selection);
                }
            }
            EngineCommand::ClearSelection => self.state.selection = None,
            EngineCommand::SetSelectionConstraint(enabled) => {
                self.state.selection_constraint_enabled = enabled
            }
            EngineCommand::AttachSource(slot) => self.attach(slot),
            EngineCommand::DetachSource(id) => {
                if let Ok(index) = self.find_slot(id) {
                    // Owned: the slot's memory is freed on the reclaimer thread
                    drop(self.slots.remove(index));
                    if self.reference == Some(id) {
                        self.reference = None;
                        self.relocate_all();
                    }
                    self.update_solo();
                    emit(&mut self.events, &self.playback, EngineEvent::SourceDetached(id));
                }
            }
            EngineCommand::SetSourceGain { id, gain_db } => {
                self.with_channel(id, |slot| slot.channel.gain_db = gain_db)
            }
            EngineCommand::SetSourcePan { id, pan } => {
                self.with_channel(id, |slot| slot.channel.set_pan(pan))
            }
            EngineCommand::SetSourceMute { id, muted } => {
                self.with_channel(id, |slot| slot.channel.muted = muted)
            }
            EngineCommand::SetSourceSolo { id, soloed } => {
                self.with_channel(id, |slot| slot.channel.soloed = soloed);
                self.update_solo();
            }
            EngineCommand::SetEffectProcessor(processor) => {
                drop(self.effects.set_processor(processor));
                self.audition_disabled = false;
            }
            EngineCommand::InstallAlignment { id, path } => {
                let installed = path.is_some();
                if let Ok(index) = self.find_slot(id) {
                    drop(self.slots[index].set_alignment(path));
                    let reference_rate = self.reference_rate();
                    let rate =
                        Self::alignment_rate(self.reference, reference_rate, &self.slots[index]);
                    let position = self.state.position_frames;
                    let slot = &mut self.slots[index];
                    let frame = slot.source_frame_at(position, self.settings.timeline_rate, rate);
                    slot.relocate(frame);
                    if installed {
                        emit(&mut self.events, &self.playback, EngineEvent::AlignmentInstalled(id));
                    }
                }
            }
            EngineCommand::SetReferenceSource(id) => {
                self.reference = id;
                self.relocate_all();
            }
            EngineCommand::SetCapture(enabled) => self.capture.set_enabled(enabled),
        }
    }

    fn play(&mut self) {
        let position = self.state.position_frames;
        match self.state.active_selection() {
            Some(selection) if !selection.contains(position) => self.jump_to(selection.start),
            Some(_) => {}
            None => {
                if self.material_end().is_some_and(|end| position >= end) {
                    self.jump_to(0);
                }
            }
        }
        self.state.is_playing = true;
    }

    fn attach(&mut self, mut slot: Owned<SourceSlot>) {
        let id = slot.id();
        if slot.take_config_error() {
            emit(&mut self.events, &self.playback, EngineEvent::ConfigurationError(id));
        }
        slot.set_speed_ratio(self.state.speed_ratio);
        slot.set_mono(self.degraded_mono);

        let reference_rate = self.reference_rate();
        let rate = Self::alignment_rate(self.reference, reference_rate, &slot);
        let position = self.state.position_frames;
        let frame = slot.source_frame_at(position, self.settings.timeline_rate, rate);
        slot.relocate(frame);

        match self.find_slot(id) {
            Ok(index) => self.slots[index] = slot,
            Err(index) if self.slots.len() < self.slots.capacity() => {
                self.slots.insert(index, slot)
            }
            // Controller enforces capacity; never grow on the audio thread
            Err(_) => drop(slot),
        }
        self.update_solo();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::{AlignmentError, AlignmentPath, AlignmentTransform};
    use crate::config::EngineConfig;
    use crate::effect::AudioEffectProcessor;
    use crate::engine::PlaybackController;
    use crate::source::{ReadOutcome, SampleSource, ToneSource};
    use crate::types::Sample;
    use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
    use std::thread;

    fn config(max_block_frames: usize) -> EngineConfig {
        EngineConfig {
            max_block_frames,
            max_sources: 4,
            ..EngineConfig::default()
        }
    }

    fn run(engine: &mut PlaybackEngine, frames: usize) -> Vec<StereoSample> {
        let mut out = vec![StereoSample::new(9.0, 9.0); frames];
        engine.process(&mut out);
        out
    }

    fn peak(block: &[StereoSample]) -> f32 {
        block.iter().map(|s| s.peak()).fold(0.0, f32::max)
    }

    /// Records how far into the source it was read
    struct SpySource {
        rate: u32,
        length: u64,
        min_read_start: AtomicI64,
        max_read_end: AtomicI64,
        frames_read: AtomicUsize,
    }

    impl SpySource {
        fn new(rate: u32, length: u64) -> Self {
            Self {
                rate,
                length,
                min_read_start: AtomicI64::new(i64::MAX),
                max_read_end: AtomicI64::new(0),
                frames_read: AtomicUsize::new(0),
            }
        }
    }

    impl SampleSource for SpySource {
        fn read(&self, start_frame: i64, frames: usize, out: &mut [Sample]) -> ReadOutcome {
            self.min_read_start.fetch_min(start_frame, Ordering::Relaxed);
            self.max_read_end
                .fetch_max(start_frame + frames as i64, Ordering::Relaxed);
            self.frames_read.fetch_add(frames, Ordering::Relaxed);
            out.fill(0.1);
            ReadOutcome::Ready
        }
        fn native_sample_rate(&self) -> u32 {
            self.rate
        }
        fn channel_count(&self) -> usize {
            2
        }
        fn length_frames(&self) -> Option<u64> {
            Some(self.length)
        }
        fn label(&self) -> &str {
            "spy"
        }
    }

    /// Never has data ready
    struct StarvedSource;

    impl SampleSource for StarvedSource {
        fn read(&self, _start_frame: i64, _frames: usize, out: &mut [Sample]) -> ReadOutcome {
            out.fill(0.7);
            ReadOutcome::Underrun
        }
        fn native_sample_rate(&self) -> u32 {
            48000
        }
        fn channel_count(&self) -> usize {
            2
        }
        fn label(&self) -> &str {
            "starved"
        }
    }

    /// Panics on every read
    struct PanickingSource;

    impl SampleSource for PanickingSource {
        fn read(&self, _start_frame: i64, _frames: usize, _out: &mut [Sample]) -> ReadOutcome {
            panic!("source failure");
        }
        fn native_sample_rate(&self) -> u32 {
            48000
        }
        fn channel_count(&self) -> usize {
            2
        }
        fn label(&self) -> &str {
            "panics"
        }
    }

    /// Maps reference 0..48000 onto target 1000..49000
    struct FixedPath;

    impl AlignmentTransform for FixedPath {
        fn align(
            &self,
            _reference: &dyn SampleSource,
            _target: &dyn SampleSource,
            _cancel: &AtomicBool,
        ) -> Result<AlignmentPath, AlignmentError> {
            AlignmentPath::new(vec![(0, 1000), (48000, 49000)])
        }
    }

    /// Cost meter returning a scripted block cost
    struct ScriptedMeter(Arc<AtomicU64>);

    impl CostMeter for ScriptedMeter {
        fn begin(&mut self) {}
        fn end(&mut self) -> Duration {
            Duration::from_micros(self.0.load(Ordering::Relaxed))
        }
    }

    struct CountingEffect(Arc<AtomicUsize>);

    impl AudioEffectProcessor for CountingEffect {
        fn process(&mut self, _block: &mut StereoBuffer) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
        fn name(&self) -> &str {
            "counter"
        }
    }

    struct HeavyEffect;

    impl AudioEffectProcessor for HeavyEffect {
        fn process(&mut self, _block: &mut StereoBuffer) {}
        fn reported_load_fraction(&self) -> f32 {
            0.9
        }
        fn name(&self) -> &str {
            "heavy"
        }
    }

    struct PanickingEffect;

    impl AudioEffectProcessor for PanickingEffect {
        fn process(&mut self, _block: &mut StereoBuffer) {
            panic!("processor failure");
        }
        fn name(&self) -> &str {
            "panics"
        }
    }

    #[test]
    fn test_loop_wraps_to_selection_start() {
        let (mut controller, mut engine) = PlaybackController::new(&config(512), 48000);
        controller
            .attach_source(Arc::new(ToneSource::new(220.0, 0.5, 48000, 2).with_length(96000)))
            .unwrap();
        controller.set_selection(1000, 2000).unwrap();
        controller.set_loop(true).unwrap();
        controller.set_selection_constraint(true).unwrap();
        controller.seek(1999).unwrap();
        controller.play().unwrap();

        run(&mut engine, 1);
        assert_eq!(controller.position(), 1000);
        assert!(controller.poll_events().contains(&EngineEvent::LoopWrapped));

        for _ in 0..50 {
            run(&mut engine, 256);
            let position = controller.position();
            assert!((1000..2000).contains(&position), "position {}", position);
            assert!(controller.is_playing());
        }
    }

    #[test]
    fn test_selection_end_stops_without_reading_past_it() {
        let spy = Arc::new(SpySource::new(48000, 96000));
        let (mut controller, mut engine) = PlaybackController::new(&config(512), 48000);
        controller.attach_source(spy.clone()).unwrap();
        controller.set_selection(0, 2000).unwrap();
        controller.set_selection_constraint(true).unwrap();
        controller.play().unwrap();

        for _ in 0..10 {
            run(&mut engine, 300);
        }

        assert!(!controller.is_playing());
        assert_eq!(controller.position(), 2000);
        assert_eq!(spy.max_read_end.load(Ordering::Relaxed), 2000);
        let events = controller.poll_events();
        assert_eq!(
            events.iter().filter(|e| **e == EngineEvent::SelectionEnded).count(),
            1
        );
    }

    #[test]
    fn test_play_outside_selection_starts_at_selection_start() {
        let (mut controller, mut engine) = PlaybackController::new(&config(512), 48000);
        controller
            .attach_source(Arc::new(ToneSource::new(220.0, 0.5, 48000, 2).with_length(96000)))
            .unwrap();
        controller.seek(5000).unwrap();
        controller.set_selection(1000, 2000).unwrap();
        controller.set_selection_constraint(true).unwrap();
        controller.play().unwrap();

        run(&mut engine, 16);
        assert_eq!(controller.position(), 1016);
    }

    #[test]
    fn test_play_at_end_of_material_restarts() {
        let (mut controller, mut engine) = PlaybackController::new(&config(512), 48000);
        controller
            .attach_source(Arc::new(ToneSource::new(220.0, 0.5, 48000, 2).with_length(4800)))
            .unwrap();
        controller.seek(4800).unwrap();
        controller.play().unwrap();

        run(&mut engine, 16);
        assert_eq!(controller.position(), 16);
    }

    #[test]
    fn test_material_end_emits_playback_complete() {
        let (mut controller, mut engine) = PlaybackController::new(&config(512), 48000);
        controller
            .attach_source(Arc::new(ToneSource::new(220.0, 0.5, 48000, 2).with_length(1000)))
            .unwrap();
        controller.play().unwrap();

        run(&mut engine, 512);
        run(&mut engine, 512);
        run(&mut engine, 512);

        assert!(!controller.is_playing());
        assert_eq!(controller.position(), 1000);
        let events = controller.poll_events();
        assert_eq!(
            events.iter().filter(|e| **e == EngineEvent::PlaybackComplete).count(),
            1
        );
    }

    #[test]
    fn test_duration_scales_with_speed() {
        let (mut controller, mut engine) = PlaybackController::new(&config(512), 48000);
        controller
            .attach_source(Arc::new(ToneSource::new(220.0, 0.5, 48000, 2).with_length(48000)))
            .unwrap();
        controller.set_speed_ratio(2.0).unwrap();
        controller.play().unwrap();

        let block = 480;
        let mut blocks = 0;
        while blocks < 1000 {
            run(&mut engine, block);
            blocks += 1;
            if !controller.is_playing() {
                break;
            }
        }

        let played = (blocks * block) as i64;
        assert!((played - 24000).abs() <= block as i64, "played {} frames", played);
    }

    #[test]
    fn test_rate_conversion_pulls_expected_span() {
        let spy = Arc::new(SpySource::new(44100, 441000));
        let (mut controller, mut engine) = PlaybackController::new(&config(1024), 48000);
        controller.attach_source(spy.clone()).unwrap();
        controller.play().unwrap();

        let out = run(&mut engine, 512);
        assert_eq!(out.len(), 512);
        assert_eq!(spy.frames_read.load(Ordering::Relaxed), 470);
        assert_eq!(controller.position(), 512);
    }

    #[test]
    fn test_underrun_plays_silence_and_reports_once() {
        let (mut controller, mut engine) = PlaybackController::new(&config(512), 48000);
        let id = controller.attach_source(Arc::new(StarvedSource)).unwrap();
        controller.play().unwrap();

        for _ in 0..5 {
            let out = run(&mut engine, 256);
            assert!(out.iter().all(|s| *s == StereoSample::silence()));
        }

        let events = controller.poll_events();
        assert_eq!(
            events
                .iter()
                .filter(|e| **e == EngineEvent::SourceUnderrun(id))
                .count(),
            1
        );
        assert_eq!(controller.playback_atomics().underruns(), 5);
        assert!(controller.is_playing());
    }

    #[test]
    fn test_overload_ladder_escalates_and_recovers_in_order() {
        let mut config = config(512);
        config.overload.overrun_threshold = 2;
        config.overload.cooldown_blocks = 3;
        let (mut controller, engine) = PlaybackController::new(&config, 48000);
        let cost = Arc::new(AtomicU64::new(0));
        let mut engine = engine.with_cost_meter(Box::new(ScriptedMeter(Arc::clone(&cost))));
        let calls = Arc::new(AtomicUsize::new(0));

        controller
            .attach_source(Arc::new(ToneSource::new(220.0, 0.5, 48000, 2)))
            .unwrap();
        controller
            .set_effect_processor(Some(Box::new(CountingEffect(Arc::clone(&calls)))))
            .unwrap();
        controller.play().unwrap();

        // 480 frames at 48 kHz is a 10 ms period; 9 ms overruns the 80% budget
        cost.store(9_000, Ordering::Relaxed);
        for _ in 0..3 {
            run(&mut engine, 480);
        }
        assert_eq!(engine.degrade_level(), DegradeLevel::EffectsBypassed);
        let effect_calls = calls.load(Ordering::Relaxed);

        for _ in 0..6 {
            run(&mut engine, 480);
        }
        assert_eq!(engine.degrade_level(), DegradeLevel::Silent);
        assert_eq!(calls.load(Ordering::Relaxed), effect_calls);

        let status = controller.overload_status();
        assert!(status.effects_disabled);
        assert!(status.degraded_to_mono);
        assert_eq!(status.level, DegradeLevel::Silent);

        let silent = run(&mut engine, 480);
        assert!(silent.iter().all(|s| *s == StereoSample::silence()));
        assert!(controller.overload_status().silenced_blocks >= 1);

        cost.store(1_000, Ordering::Relaxed);
        for _ in 0..12 {
            run(&mut engine, 480);
        }
        assert_eq!(engine.degrade_level(), DegradeLevel::Full);

        let ladder: Vec<EngineEvent> = controller
            .poll_events()
            .into_iter()
            .filter(|e| {
                matches!(
                    e,
                    EngineEvent::OverloadEscalated(_) | EngineEvent::OverloadRecovered(_)
                )
            })
            .collect();
        assert_eq!(
            ladder,
            vec![
                EngineEvent::OverloadEscalated(DegradeLevel::EffectsBypassed),
                EngineEvent::OverloadEscalated(DegradeLevel::Mono),
                EngineEvent::OverloadEscalated(DegradeLevel::Silent),
                EngineEvent::OverloadRecovered(DegradeLevel::Mono),
                EngineEvent::OverloadRecovered(DegradeLevel::EffectsBypassed),
                EngineEvent::OverloadRecovered(DegradeLevel::Full),
            ]
        );
        assert!(!controller.overload_status().effects_disabled);
    }

    #[test]
    fn test_heavy_effect_is_removed_once() {
        let (mut controller, mut engine) = PlaybackController::new(&config(512), 48000);
        controller.set_effect_processor(Some(Box::new(HeavyEffect))).unwrap();

        for _ in 0..20 {
            run(&mut engine, 256);
        }

        let events = controller.poll_events();
        assert_eq!(
            events
                .iter()
                .filter(|e| **e == EngineEvent::AuditionDisabled)
                .count(),
            1
        );
        assert!(controller.overload_status().effects_disabled);
    }

    #[test]
    fn test_panicking_processor_is_removed_and_signal_continues() {
        let (mut controller, mut engine) = PlaybackController::new(&config(512), 48000);
        controller
            .attach_source(Arc::new(ToneSource::new(220.0, 0.5, 48000, 2)))
            .unwrap();
        controller.set_effect_processor(Some(Box::new(PanickingEffect))).unwrap();
        controller.play().unwrap();

        let mut last = Vec::new();
        for _ in 0..40 {
            last = run(&mut engine, 256);
        }

        assert!(peak(&last) > 0.05);
        let events = controller.poll_events();
        assert_eq!(
            events
                .iter()
                .filter(|e| **e == EngineEvent::AuditionDisabled)
                .count(),
            1
        );
        assert!(!events.contains(&EngineEvent::BlockFailed));
        assert!(controller.overload_status().effects_disabled);
    }

    #[test]
    fn test_panicking_source_yields_silent_block() {
        let (mut controller, mut engine) = PlaybackController::new(&config(512), 48000);
        controller.attach_source(Arc::new(PanickingSource)).unwrap();
        controller.play().unwrap();

        let out = run(&mut engine, 256);
        assert!(out.iter().all(|s| *s == StereoSample::silence()));
        assert!(controller.poll_events().contains(&EngineEvent::BlockFailed));
        assert_eq!(controller.playback_atomics().blocks_processed(), 1);
    }

    #[test]
    fn test_loop_wrap_keeps_signal_flowing() {
        let (mut controller, mut engine) = PlaybackController::new(&config(512), 48000);
        controller
            .attach_source(Arc::new(ToneSource::new(220.0, 0.5, 48000, 2)))
            .unwrap();
        controller.set_selection(24000, 72000).unwrap();
        controller.set_loop(true).unwrap();
        controller.set_selection_constraint(true).unwrap();
        controller.seek(24000).unwrap();
        controller.play().unwrap();

        for _ in 0..80 {
            run(&mut engine, 512);
        }
        controller.poll_events();

        // 64960 before these blocks, so the wrap at 72000 falls inside them
        for i in 0..40 {
            let out = run(&mut engine, 512);
            assert!(peak(&out) > 0.05, "block {} went silent", i);
        }
        assert!(controller.poll_events().contains(&EngineEvent::LoopWrapped));
    }

    #[test]
    fn test_aligned_source_follows_path_and_holds_at_its_end() {
        let (mut controller, mut engine) =
            PlaybackController::with_transform(&config(512), 48000, Arc::new(FixedPath));
        let reference = controller
            .attach_source(Arc::new(ToneSource::new(220.0, 0.5, 48000, 2)))
            .unwrap();
        let spy = Arc::new(SpySource::new(48000, 200_000));
        let target = controller.attach_source(spy.clone()).unwrap();
        controller.set_reference_source(Some(reference)).unwrap();
        controller.request_alignment(target).unwrap();

        let mut installed = false;
        for _ in 0..500 {
            run(&mut engine, 64);
            if controller.poll_events().contains(&EngineEvent::AlignmentInstalled(target)) {
                installed = true;
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        assert!(installed);

        spy.min_read_start.store(i64::MAX, Ordering::Relaxed);
        controller.play().unwrap();
        run(&mut engine, 480);
        assert_eq!(spy.min_read_start.load(Ordering::Relaxed), 1000);
        assert_eq!(spy.max_read_end.load(Ordering::Relaxed), 1480);

        controller.seek(47_000).unwrap();
        for _ in 0..10 {
            run(&mut engine, 480);
        }
        assert!(controller.position() > 49_000);
        assert_eq!(spy.max_read_end.load(Ordering::Relaxed), 49_000);

        let frames_read = spy.frames_read.load(Ordering::Relaxed);
        for _ in 0..10 {
            run(&mut engine, 480);
        }
        assert_eq!(spy.frames_read.load(Ordering::Relaxed), frames_read);
        assert_eq!(spy.max_read_end.load(Ordering::Relaxed), 49_000);
    }

    #[test]
    fn test_long_request_is_chunked() {
        let (mut controller, mut engine) = PlaybackController::new(&config(256), 48000);
        controller
            .attach_source(Arc::new(ToneSource::new(220.0, 0.5, 48000, 2)))
            .unwrap();
        controller.play().unwrap();

        run(&mut engine, 1000);
        assert_eq!(controller.position(), 1000);
        assert_eq!(controller.playback_atomics().blocks_processed(), 4);
    }

    #[test]
    fn test_clipping_is_reported() {
        let (mut controller, mut engine) = PlaybackController::new(&config(512), 48000);
        controller
            .attach_source(Arc::new(ToneSource::new(220.0, 4.0, 48000, 2)))
            .unwrap();
        controller.play().unwrap();

        let mut peak: f32 = 0.0;
        for _ in 0..40 {
            let out = run(&mut engine, 512);
            peak = out.iter().fold(peak, |p, s| p.max(s.peak()));
        }

        assert!(peak <= 1.0);
        let events = controller.poll_events();
        assert!(events.iter().any(|e| matches!(e, EngineEvent::Clipped { .. })));
        assert!(controller.output_levels().take_clip());
    }
}
