//! Lockstep Core - real-time variable-speed playback of several sources
//!
//! Sources are pulled through rate conversion and pitch-preserving time
//! stretching, mixed, optionally run through an auditioned effect, and
//! delivered to the output device callback. Secondary sources can follow a
//! reference source through a computed alignment path.

pub mod alignment;
pub mod audio;
pub mod capture;
pub mod config;
pub mod effect;
pub mod engine;
pub mod resample;
pub mod source;
pub mod timestretch;
pub mod types;

pub use types::*;
