//! Per-source pull chain: read → stereo → rate conversion → time stretch
//!
//! A [`SourceSlot`] is built completely on the control thread, with every
//! buffer sized for the worst case, then moved into the engine. On the audio
//! thread it only reads, converts and stretches into those buffers.

use std::sync::Arc;

use basedrop::Shared;

use crate::alignment::AlignmentPath;
use crate::resample::{ConvertQuality, RateConverter};
use crate::source::{interleaved_to_stereo, ReadOutcome, SampleSource};
use crate::timestretch::{
    preroll_frames, SpeedChange, StretchQuality, TimeStretcher, MAX_SPEED_RATIO,
};
use crate::types::{rescale_frames, Sample, SourceId, StereoSample};

use super::mixer::SourceChannel;

/// Extra source frames allowed per block beyond the nominal worst case
const READ_SLACK_FRAMES: usize = 256;

/// Drift (in source frames) past which a source is relocated instead of
/// being caught up through the stretcher
pub const RESYNC_THRESHOLD_FRAMES: i64 = 4096;

/// Session parameters every slot is sized from
#[derive(Debug, Clone, Copy)]
pub struct SlotParams {
    pub device_rate: u32,
    pub max_block_frames: usize,
    pub convert_quality: ConvertQuality,
    pub stretch_quality: StretchQuality,
}

/// What happened while rendering a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenderReport {
    /// The source could not supply data this block
    pub underrun: bool,
    /// First block of an underrun run
    pub underrun_onset: bool,
    /// The slot was relocated because it drifted too far
    pub resynced: bool,
}

/// One attached source and its processing state
pub struct SourceSlot {
    pub(crate) channel: SourceChannel,
    source: Arc<dyn SampleSource>,
    converter: RateConverter,
    stretcher: TimeStretcher,
    native_rate: u32,
    channels: usize,
    read_capacity: usize,
    /// Native frames read ahead of a new position to prime the stretcher
    preroll_frames: usize,
    read_buf: Vec<Sample>,
    stereo_buf: Vec<StereoSample>,
    converted: Vec<StereoSample>,
    output: Vec<StereoSample>,
    /// Next source frame to read, in native frames
    cursor: i64,
    alignment: Option<Shared<AlignmentPath>>,
    in_underrun: bool,
    config_error_pending: bool,
}

impl SourceSlot {
    /// Build the slot. Allocates; call on the control thread.
    pub fn new(id: SourceId, source: Arc<dyn SampleSource>, params: &SlotParams) -> Self {
        let native_rate = source.native_sample_rate();
        let channels = source.channel_count().max(1);
        let device_rate = params.device_rate.max(1);

        let mut converter = RateConverter::new(native_rate, device_rate, params.convert_quality);
        let config_error_pending = converter.take_config_error().is_some();

        let to_native = native_rate.max(1) as f64 / device_rate as f64;
        let nominal = params.max_block_frames as f64 * MAX_SPEED_RATIO;
        let preroll = (preroll_frames(device_rate) as f64 * to_native).ceil() as usize;
        let read_capacity =
            ((nominal * to_native).ceil() as usize).max(preroll) + READ_SLACK_FRAMES;
        let to_device = device_rate as f64 / native_rate.max(1) as f64;
        let converted_capacity = (read_capacity as f64 * to_device).ceil() as usize + 16;

        Self {
            channel: SourceChannel::new(id),
            stretcher: TimeStretcher::new(
                device_rate,
                params.stretch_quality,
                converted_capacity,
                params.max_block_frames,
            ),
            source,
            converter,
            native_rate,
            channels,
            read_capacity,
            preroll_frames: preroll,
            read_buf: vec![0.0; read_capacity * channels],
            stereo_buf: vec![StereoSample::silence(); read_capacity],
            converted: vec![StereoSample::silence(); converted_capacity],
            output: vec![StereoSample::silence(); params.max_block_frames],
            cursor: 0,
            alignment: None,
            in_underrun: false,
            config_error_pending,
        }
    }

    #[inline]
    pub fn id(&self) -> SourceId {
        self.channel.source_id
    }

    pub fn native_rate(&self) -> u32 {
        self.native_rate
    }

    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    pub fn is_aligned(&self) -> bool {
        self.alignment.is_some()
    }

    /// Swap the alignment path. The old one is returned so the caller picks
    /// where it is dropped.
    pub(crate) fn set_alignment(
        &mut self,
        path: Option<Shared<AlignmentPath>>,
    ) -> Option<Shared<AlignmentPath>> {
        std::mem::replace(&mut self.alignment, path)
    }

    /// Report a pending configuration error once
    pub(crate) fn take_config_error(&mut self) -> bool {
        std::mem::take(&mut self.config_error_pending)
    }

    /// Material length in timeline frames (rounded up)
    pub fn timeline_length(&self, timeline_rate: u32) -> Option<i64> {
        let length = self.source.length_frames()? as i64;
        if self.native_rate == 0 {
            return Some(0);
        }
        let native = self.native_rate as i128;
        Some(((length as i128 * timeline_rate as i128 + native - 1) / native) as i64)
    }

    /// Source frame corresponding to a timeline frame.
    ///
    /// `reference_rate` is the native rate of the reference source; when
    /// given and a path is installed the mapping goes through the path.
    #[inline]
    pub fn source_frame_at(
        &self,
        timeline_frame: i64,
        timeline_rate: u32,
        reference_rate: Option<u32>,
    ) -> i64 {
        match (&self.alignment, reference_rate) {
            (Some(path), Some(reference_rate)) => {
                path.map_to_target(rescale_frames(timeline_frame, timeline_rate, reference_rate))
            }
            _ => rescale_frames(timeline_frame, timeline_rate, self.native_rate),
        }
    }

    /// Jump to `source_frame`, restarting the converter and stretcher primed
    /// with the material just before it
    pub fn relocate(&mut self, source_frame: i64) {
        self.cursor = source_frame;
        self.converter.reset();
        self.in_underrun = false;

        // Nothing precedes frame 0
        let frames = (self.preroll_frames as i64).min(source_frame.max(0)) as usize;
        let frames = frames.min(self.read_capacity);
        let samples = frames * self.channels;
        let ready = frames > 0
            && self
                .source
                .read(source_frame - frames as i64, frames, &mut self.read_buf[..samples])
                == ReadOutcome::Ready;
        if !ready {
            self.stretcher.restart(&[]);
            return;
        }

        let read = &self.read_buf[..samples];
        interleaved_to_stereo(read, self.channels, frames, &mut self.stereo_buf);
        let converted = self
            .converter
            .process(&self.stereo_buf[..frames], &mut self.converted);
        self.stretcher.restart(&self.converted[..converted]);
    }

    /// Large jumps restart the stretcher at the current cursor
    pub fn set_speed_ratio(&mut self, ratio: f64) {
        if self.stretcher.set_speed_ratio(ratio) == SpeedChange::Jump {
            self.relocate(self.cursor);
        }
    }

    pub fn set_mono(&mut self, mono: bool) {
        self.converter.set_mono(mono);
        if self.stretcher.set_mono(mono) {
            self.relocate(self.cursor);
        }
    }

    /// Rendered block (valid after [`SourceSlot::render`])
    #[inline]
    pub fn output(&self, frames: usize) -> &[StereoSample] {
        &self.output[..frames]
    }

    /// Pull source frames up to `source_end` and stretch them onto `frames`
    /// output frames.
    pub fn render(&mut self, source_start: i64, source_end: i64, frames: usize) -> RenderReport {
        let mut report = RenderReport::default();
        let frames = frames.min(self.output.len());

        if (source_start - self.cursor).abs() > RESYNC_THRESHOLD_FRAMES {
            self.relocate(source_start);
            report.resynced = true;
        }

        let wanted = (source_end - self.cursor).clamp(0, self.read_capacity as i64) as usize;

        if wanted > 0 {
            let samples = wanted * self.channels;
            let outcome = self.source.read(self.cursor, wanted, &mut self.read_buf[..samples]);
            if outcome == ReadOutcome::Ready {
                self.in_underrun = false;
            } else {
                self.read_buf[..samples].fill(0.0);
                report.underrun = true;
                report.underrun_onset = !self.in_underrun;
                self.in_underrun = true;
            }
            let read = &self.read_buf[..samples];
            interleaved_to_stereo(read, self.channels, wanted, &mut self.stereo_buf);
            self.cursor += wanted as i64;
        }

        let converted = self
            .converter
            .process(&self.stereo_buf[..wanted], &mut self.converted);
        self.stretcher
            .process(&self.converted[..converted], &mut self.output[..frames]);

        report
    }
}
