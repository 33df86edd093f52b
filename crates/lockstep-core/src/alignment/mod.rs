//! Cross-source timeline alignment
//!
//! Several recordings of the same work play in lockstep: one source is the
//! reference, the others follow it through an [`AlignmentPath`] computed off
//! the audio thread by an [`AlignmentTransform`].
//!
//! # Architecture
//!
//! ```text
//! Controller ──request──► AlignmentCoordinator ──job──► worker thread
//!                                   ▲                    (transform.align)
//!                                   └───────result───────────┘
//! poll_events ──drain_finished──► Shared<AlignmentPath> ──command──► engine
//! ```
//!
//! Until a path is installed the target plays unaligned (identity mapping).

mod coordinator;
mod path;
mod transform;

pub use coordinator::{AlignmentCoordinator, AlignmentStatus};
pub use path::AlignmentPath;
pub use transform::{AlignmentTransform, EnvelopeAligner, ENVELOPE_HOP_SECONDS, MAX_ENVELOPE_FRAMES};

use thiserror::Error;

/// Alignment errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AlignmentError {
    #[error("alignment path is empty")]
    EmptyPath,

    #[error("alignment path is not monotonic at pair {index}")]
    NotMonotonic { index: usize },

    #[error("source '{0}' has no known length")]
    UnboundedSource(String),

    #[error("source '{0}' is too short to align")]
    InsufficientMaterial(String),

    #[error("alignment cancelled")]
    Cancelled,

    #[error("alignment transform failed: {0}")]
    Transform(String),

    #[error("alignment worker is not running")]
    WorkerGone,
}

pub type AlignmentResult<T> = Result<T, AlignmentError>;
