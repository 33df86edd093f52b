//! Engine configuration
//!
//! Everything fixed for a playback session lives in [`EngineConfig`], loaded
//! from YAML with [`load_config`]. Missing fields take their defaults so a
//! partial file is always valid.
//!
//! ```ignore
//! use lockstep_core::config::{default_config_path, load_config, EngineConfig};
//!
//! let config: EngineConfig = load_config(&default_config_path());
//! ```

mod io;
mod paths;

pub use io::{load_config, save_config};
pub use paths::{config_dir, default_config_path};

use serde::{Deserialize, Serialize};

use crate::audio::AudioConfig;
use crate::capture::DEFAULT_CAPTURE_FRAMES;
use crate::effect::{DEFAULT_EFFECT_BUDGET, DEFAULT_STRIKE_LIMIT};
use crate::engine::{OverloadPolicy, COMMAND_QUEUE_CAPACITY, EVENT_QUEUE_CAPACITY};
use crate::resample::ConvertQuality;
use crate::timestretch::StretchQuality;
use crate::types::MAX_BLOCK_FRAMES;

/// Default number of simultaneously attached sources
pub const DEFAULT_MAX_SOURCES: usize = 16;

/// Session configuration for the playback engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Largest block the engine renders at once; longer device buffers are
    /// processed in chunks of this size
    pub max_block_frames: usize,
    /// Source slots preallocated on the audio thread
    pub max_sources: usize,
    /// Rate timeline positions are counted in (None = device rate)
    pub timeline_rate: Option<u32>,
    pub convert_quality: ConvertQuality,
    pub stretch_quality: StretchQuality,
    /// Fraction of the callback period the auditioned effect may use
    pub effect_budget_fraction: f32,
    /// Consecutive over-budget blocks before the effect is removed
    pub effect_strike_limit: u32,
    pub overload: OverloadPolicy,
    pub command_queue_capacity: usize,
    pub event_queue_capacity: usize,
    /// Capture ring size in frames
    pub capture_ring_frames: usize,
    pub audio: AudioConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_block_frames: MAX_BLOCK_FRAMES,
            max_sources: DEFAULT_MAX_SOURCES,
            timeline_rate: None,
            convert_quality: ConvertQuality::default(),
            stretch_quality: StretchQuality::default(),
            effect_budget_fraction: DEFAULT_EFFECT_BUDGET,
            effect_strike_limit: DEFAULT_STRIKE_LIMIT,
            overload: OverloadPolicy::default(),
            command_queue_capacity: COMMAND_QUEUE_CAPACITY,
            event_queue_capacity: EVENT_QUEUE_CAPACITY,
            capture_ring_frames: DEFAULT_CAPTURE_FRAMES,
            audio: AudioConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Timeline rate for a stream running at `device_rate`
    pub fn timeline_rate_for(&self, device_rate: u32) -> u32 {
        self.timeline_rate.filter(|rate| *rate > 0).unwrap_or(device_rate)
    }
}
