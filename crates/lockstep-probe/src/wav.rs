//! WAV file loading into an in-memory source

use std::path::Path;

use anyhow::{Context, Result};
use lockstep_core::source::BufferSource;

/// Decode a whole WAV file into a [`BufferSource`]
pub fn load_wav(path: &Path) -> Result<BufferSource> {
    let mut reader =
        hound::WavReader::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .with_context(|| format!("Failed to decode {:?}", path))?,
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1u64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<Result<_, _>>()
                .with_context(|| format!("Failed to decode {:?}", path))?
        }
    };

    let label = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    log::info!(
        "Loaded {} ({} Hz, {} ch, {} frames)",
        label,
        spec.sample_rate,
        spec.channels,
        samples.len() / spec.channels.max(1) as usize
    );

    Ok(BufferSource::new(label, samples, spec.sample_rate, spec.channels as usize))
}
