//! Output capture to WAV
//!
//! The engine copies every finished block into an `rtrb` ring through a
//! [`CaptureTap`] (wait-free, frames are dropped and counted when the ring
//! is full). A [`CaptureWriter`] on the control side drains the ring into a
//! 32-bit float stereo WAV file via `hound`.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::types::StereoSample;

/// Capture errors
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to write capture file: {0}")]
    Wav(#[from] hound::Error),

    #[error("capture is not running")]
    NotRecording,

    #[error("capture already running to {0}")]
    AlreadyRecording(PathBuf),
}

pub type CaptureResult<T> = Result<T, CaptureError>;

/// Default capture ring size (two seconds at 48 kHz)
pub const DEFAULT_CAPTURE_FRAMES: usize = 96_000;

/// Create a connected tap/writer pair holding `capacity_frames` frames
pub fn capture_channel(capacity_frames: usize) -> (CaptureTap, CaptureWriter) {
    let (producer, consumer) = rtrb::RingBuffer::new(capacity_frames.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        CaptureTap {
            producer,
            enabled: false,
            dropped: Arc::clone(&dropped),
        },
        CaptureWriter {
            consumer,
            wav: None,
            frames_written: 0,
            dropped,
        },
    )
}

/// Audio-thread side of the capture ring
pub struct CaptureTap {
    producer: rtrb::Producer<StereoSample>,
    enabled: bool,
    dropped: Arc<AtomicU64>,
}

impl CaptureTap {
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Copy a finished block into the ring. Never blocks.
    pub fn write(&mut self, block: &[StereoSample]) {
        if !self.enabled || block.is_empty() {
            return;
        }
        let room = self.producer.slots().min(block.len());
        if room > 0 {
            if let Ok(chunk) = self.producer.write_chunk_uninit(room) {
                chunk.fill_from_iter(block[..room].iter().copied());
            }
        }
        let lost = block.len() - room;
        if lost > 0 {
            self.dropped.fetch_add(lost as u64, Ordering::Relaxed);
        }
    }
}

struct ActiveFile {
    path: PathBuf,
    writer: hound::WavWriter<BufWriter<File>>,
}

/// Control-side drain of the capture ring
pub struct CaptureWriter {
    consumer: rtrb::Consumer<StereoSample>,
    wav: Option<ActiveFile>,
    frames_written: u64,
    dropped: Arc<AtomicU64>,
}

impl CaptureWriter {
    /// Open `path` for writing. Frames already in the ring are discarded.
    pub fn start(&mut self, path: &Path, sample_rate: u32) -> CaptureResult<()> {
        if let Some(active) = &self.wav {
            return Err(CaptureError::AlreadyRecording(active.path.clone()));
        }
        self.discard();

        let spec = hound::WavSpec {
            channels: 2,
            sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let writer = hound::WavWriter::create(path, spec)?;
        log::info!("Capturing output to {:?} ({} Hz)", path, sample_rate);

        self.wav = Some(ActiveFile {
            path: path.to_path_buf(),
            writer,
        });
        self.frames_written = 0;
        self.dropped.store(0, Ordering::Relaxed);
        Ok(())
    }

    pub fn is_recording(&self) -> bool {
        self.wav.is_some()
    }

    /// Frames written to the current file
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Frames lost because the ring was full
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Move everything queued in the ring to the file (or discard it when
    /// not recording). Returns the number of frames drained.
    pub fn drain(&mut self) -> CaptureResult<usize> {
        if self.wav.is_none() {
            return Ok(self.discard());
        }

        let available = self.consumer.slots();
        if available == 0 {
            return Ok(0);
        }
        let chunk = match self.consumer.read_chunk(available) {
            Ok(chunk) => chunk,
            Err(_) => return Ok(0),
        };
        if let Some(active) = self.wav.as_mut() {
            let (first, second) = chunk.as_slices();
            for frame in first.iter().chain(second) {
                active.writer.write_sample(frame.left)?;
                active.writer.write_sample(frame.right)?;
            }
        }
        chunk.commit_all();
        self.frames_written += available as u64;
        Ok(available)
    }

    /// Drain what is left and close the file. Returns frames written.
    pub fn finish(&mut self) -> CaptureResult<u64> {
        if self.wav.is_none() {
            return Err(CaptureError::NotRecording);
        }
        self.drain()?;
        if let Some(active) = self.wav.take() {
            active.writer.finalize()?;
            log::info!(
                "Capture to {:?} finished ({} frames, {} dropped)",
                active.path,
                self.frames_written,
                self.dropped_frames()
            );
        }
        Ok(self.frames_written)
    }

    fn discard(&mut self) -> usize {
        let available = self.consumer.slots();
        if let Ok(chunk) = self.consumer.read_chunk(available) {
            chunk.commit_all();
        }
        available
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(frames: usize, value: f32) -> Vec<StereoSample> {
        vec![StereoSample::new(value, -value); frames]
    }

    #[test]
    fn test_disabled_tap_writes_nothing() {
        let (mut tap, mut writer) = capture_channel(64);
        tap.write(&block(32, 0.5));
        assert_eq!(writer.drain().unwrap(), 0);
    }

    #[test]
    fn test_full_ring_counts_dropped_frames() {
        let (mut tap, writer) = capture_channel(16);
        tap.set_enabled(true);
        tap.write(&block(10, 0.1));
        tap.write(&block(10, 0.1));
        assert_eq!(writer.dropped_frames(), 4);
    }

    #[test]
    fn test_capture_round_trip_to_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.wav");
        let (mut tap, mut writer) = capture_channel(1024);

        writer.start(&path, 48000).unwrap();
        assert!(matches!(
            writer.start(&path, 48000),
            Err(CaptureError::AlreadyRecording(_))
        ));
        tap.set_enabled(true);
        tap.write(&block(100, 0.25));
        writer.drain().unwrap();
        tap.write(&block(50, 0.5));
        assert_eq!(writer.finish().unwrap(), 150);

        let mut reader = hound::WavReader::open(&path).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 2);
        assert_eq!(spec.sample_rate, 48000);
        let samples: Vec<f32> = reader.samples::<f32>().map(|s| s.unwrap()).collect();
        assert_eq!(samples.len(), 300);
        assert_eq!(samples[0], 0.25);
        assert_eq!(samples[1], -0.25);
        assert_eq!(samples[298], 0.5);
    }

    #[test]
    fn test_finish_without_start() {
        let (_tap, mut writer) = capture_channel(16);
        assert!(matches!(writer.finish(), Err(CaptureError::NotRecording)));
    }
}
