//! Output device sink
//!
//! The engine is device-agnostic: anything that periodically asks for an
//! interleaved `f32` buffer can drive it through [`OutputCallback`]. With the
//! `cpal-backend` feature (on by default) [`start_audio_system`] opens the
//! default or a named device and runs the engine inside its callback.
//!
//! ```ignore
//! use lockstep_core::audio::start_audio_system;
//! use lockstep_core::config::EngineConfig;
//!
//! let (handle, mut controller) = start_audio_system(&EngineConfig::default())?;
//! controller.attach_source(source)?;
//! controller.play()?;
//! ```

mod callback;
mod config;
mod error;

#[cfg(feature = "cpal-backend")]
mod cpal_backend;
#[cfg(feature = "cpal-backend")]
mod device;

pub use callback::{write_interleaved, OutputCallback};
pub use config::{
    AudioConfig, BufferSize, DeviceId, DEFAULT_BUFFER_SIZE, MAX_BUFFER_SIZE, MIN_BUFFER_SIZE,
};
pub use error::{AudioError, AudioResult};

#[cfg(feature = "cpal-backend")]
pub use cpal_backend::{start_audio_system, AudioHandle};
#[cfg(feature = "cpal-backend")]
pub use device::{default_output_device, find_device_by_id, output_device_ids};
