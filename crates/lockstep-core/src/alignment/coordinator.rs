//! Background alignment service
//!
//! Alignment can take seconds, so it runs on a dedicated worker thread fed by
//! a crossbeam channel. Each job carries its own cancellation flag and a
//! generation number; results from superseded or cancelled jobs are dropped
//! when drained.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use basedrop::{Handle, Shared};
use crossbeam::channel::{self, Receiver, Sender};

use super::{AlignmentError, AlignmentPath, AlignmentResult, AlignmentTransform};
use crate::source::SampleSource;
use crate::types::SourceId;

/// Alignment state of one target source
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AlignmentStatus {
    /// No path; playback follows the timeline directly
    #[default]
    Unaligned,
    /// A job is queued or running
    Computing,
    /// A path is installed
    Aligned { pairs: usize },
    Failed(String),
    Cancelled,
}

struct AlignJob {
    target_id: SourceId,
    generation: u64,
    reference: Arc<dyn SampleSource>,
    target: Arc<dyn SampleSource>,
    cancel: Arc<AtomicBool>,
}

enum WorkerCommand {
    Align(AlignJob),
    Shutdown,
}

struct JobOutcome {
    target_id: SourceId,
    generation: u64,
    result: AlignmentResult<AlignmentPath>,
}

struct PendingJob {
    generation: u64,
    cancel: Arc<AtomicBool>,
}

/// Computes alignment paths off the audio thread and tracks their status
pub struct AlignmentCoordinator {
    command_tx: Sender<WorkerCommand>,
    result_rx: Receiver<JobOutcome>,
    thread_handle: Option<JoinHandle<()>>,
    gc: Handle,
    next_generation: u64,
    pending: HashMap<SourceId, PendingJob>,
    statuses: HashMap<SourceId, AlignmentStatus>,
    installed: HashMap<SourceId, Shared<AlignmentPath>>,
}

impl AlignmentCoordinator {
    /// Start the worker thread. Paths handed to the engine are allocated
    /// through `gc` so the audio thread can drop them.
    pub fn spawn(transform: Arc<dyn AlignmentTransform>, gc: Handle) -> Self {
        let (command_tx, command_rx) = channel::unbounded();
        let (result_tx, result_rx) = channel::unbounded();

        let thread_handle = thread::Builder::new()
            .name("lockstep-align".to_string())
            .spawn(move || Self::run(transform, command_rx, result_tx))
            .expect("Failed to spawn alignment worker");

        Self {
            command_tx,
            result_rx,
            thread_handle: Some(thread_handle),
            gc,
            next_generation: 0,
            pending: HashMap::new(),
            statuses: HashMap::new(),
            installed: HashMap::new(),
        }
    }

    fn run(
        transform: Arc<dyn AlignmentTransform>,
        command_rx: Receiver<WorkerCommand>,
        result_tx: Sender<JobOutcome>,
    ) {
        log::info!("Alignment worker started");

        while let Ok(command) = command_rx.recv() {
            match command {
                WorkerCommand::Align(job) => {
                    let result = if job.cancel.load(Ordering::Relaxed) {
                        Err(AlignmentError::Cancelled)
                    } else {
                        log::debug!(
                            "Aligning '{}' to '{}'",
                            job.target.label(),
                            job.reference.label()
                        );
                        transform.align(&*job.reference, &*job.target, &job.cancel)
                    };
                    let outcome = JobOutcome {
                        target_id: job.target_id,
                        generation: job.generation,
                        result,
                    };
                    if result_tx.send(outcome).is_err() {
                        break;
                    }
                }
                WorkerCommand::Shutdown => {
                    log::info!("Alignment worker shutting down");
                    break;
                }
            }
        }
    }

    /// Queue an alignment of `target` against `reference`.
    ///
    /// Supersedes any job already pending for the same target.
    pub fn request(
        &mut self,
        target_id: SourceId,
        reference: Arc<dyn SampleSource>,
        target: Arc<dyn SampleSource>,
    ) -> AlignmentResult<()> {
        self.cancel_pending(target_id);

        self.next_generation += 1;
        let generation = self.next_generation;
        let cancel = Arc::new(AtomicBool::new(false));
        let job = AlignJob {
            target_id,
            generation,
            reference,
            target,
            cancel: Arc::clone(&cancel),
        };
        self.command_tx
            .send(WorkerCommand::Align(job))
            .map_err(|_| AlignmentError::WorkerGone)?;

        self.pending.insert(target_id, PendingJob { generation, cancel });
        self.statuses.insert(target_id, AlignmentStatus::Computing);
        Ok(())
    }

    /// Cancel the pending job for `target_id`, if any
    pub fn cancel(&mut self, target_id: SourceId) {
        if self.cancel_pending(target_id) {
            self.statuses.insert(target_id, AlignmentStatus::Cancelled);
        }
    }

    fn cancel_pending(&mut self, target_id: SourceId) -> bool {
        match self.pending.remove(&target_id) {
            Some(job) => {
                job.cancel.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Cancel and forget everything about a detached source
    pub fn forget(&mut self, target_id: SourceId) {
        self.cancel_pending(target_id);
        self.statuses.remove(&target_id);
        self.installed.remove(&target_id);
    }

    /// Forget the installed path of `target_id` (it plays unaligned again)
    pub fn clear(&mut self, target_id: SourceId) {
        self.cancel_pending(target_id);
        self.installed.remove(&target_id);
        self.statuses.insert(target_id, AlignmentStatus::Unaligned);
    }

    pub fn status(&self, target_id: SourceId) -> AlignmentStatus {
        self.statuses.get(&target_id).cloned().unwrap_or_default()
    }

    /// Installed path of `target_id`
    pub fn path(&self, target_id: SourceId) -> Option<&Shared<AlignmentPath>> {
        self.installed.get(&target_id)
    }

    /// Map a reference frame into `target_id`'s frames. Identity while no
    /// path is installed.
    pub fn map_to_target(&self, target_id: SourceId, reference_frame: i64) -> i64 {
        match self.installed.get(&target_id) {
            Some(path) => path.map_to_target(reference_frame),
            None => reference_frame,
        }
    }

    /// Collect finished jobs. Returns the paths that became ready, already
    /// wrapped for the audio thread.
    pub fn drain_finished(&mut self) -> Vec<(SourceId, Shared<AlignmentPath>)> {
        let mut ready = Vec::new();
        while let Ok(outcome) = self.result_rx.try_recv() {
            let current = self
                .pending
                .get(&outcome.target_id)
                .is_some_and(|job| job.generation == outcome.generation);
            if !current {
                continue;
            }
            self.pending.remove(&outcome.target_id);

            let status = match outcome.result {
                Ok(path) => {
                    let pairs = path.len();
                    let shared = Shared::new(&self.gc, path);
                    self.installed.insert(outcome.target_id, shared.clone());
                    ready.push((outcome.target_id, shared));
                    log::info!("Alignment for {} ready ({} pairs)", outcome.target_id, pairs);
                    AlignmentStatus::Aligned { pairs }
                }
                Err(AlignmentError::Cancelled) => AlignmentStatus::Cancelled,
                Err(e) => {
                    log::warn!("Alignment for {} failed: {}", outcome.target_id, e);
                    AlignmentStatus::Failed(e.to_string())
                }
            };
            self.statuses.insert(outcome.target_id, status);
        }
        ready
    }

    /// True while any job is queued or running
    pub fn is_busy(&self) -> bool {
        !self.pending.is_empty()
    }
}

impl Drop for AlignmentCoordinator {
    fn drop(&mut self) {
        for job in self.pending.values() {
            job.cancel.store(true, Ordering::Relaxed);
        }
        let _ = self.command_tx.send(WorkerCommand::Shutdown);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}
