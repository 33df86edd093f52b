//! Deferred reclamation of audio-thread allocations
//!
//! Anything the audio thread may drop (detached source slots, replaced effect
//! processors, replaced alignment paths) is wrapped in `basedrop::Owned` or
//! `basedrop::Shared`. Dropping those on the audio thread only enqueues a
//! pointer; the memory is released on the collector thread owned by a
//! [`Reclaimer`].
//!
//! The reclaimer belongs to the controller, so its lifetime is the stream's
//! lifetime rather than the process's.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use basedrop::{Collector, Handle};

/// Interval between collection passes
const COLLECT_INTERVAL: Duration = Duration::from_millis(50);

/// Owns the collector thread and hands out allocation handles
pub struct Reclaimer {
    handle: Handle,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Reclaimer {
    /// Start the collector thread
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        let thread = thread::Builder::new()
            .name("lockstep-gc".to_string())
            .spawn(move || {
                // Collector is !Sync, so it lives entirely on this thread
                let mut collector = Collector::new();
                if tx.send(collector.handle()).is_err() {
                    return;
                }
                log::debug!("Reclaimer thread started");

                while !thread_stop.load(Ordering::Acquire) {
                    collector.collect();
                    thread::sleep(COLLECT_INTERVAL);
                }
                collector.collect();
                log::debug!(
                    "Reclaimer thread stopped ({} allocations still live)",
                    collector.alloc_count()
                );
            })
            .expect("Failed to spawn reclaimer thread");

        let handle = rx.recv().expect("Failed to receive collector handle");

        Self {
            handle,
            stop,
            thread: Some(thread),
        }
    }

    /// Handle for creating `Owned`/`Shared` allocations
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }
}

impl Drop for Reclaimer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
