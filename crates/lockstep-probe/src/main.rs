//! Lockstep probe - command-line harness for the playback engine
//!
//! Loads the engine configuration, attaches WAV files and synthetic tones,
//! then either plays them on the output device or renders them offline.
//! Set RUST_LOG=debug for verbose output.

mod options;
mod wav;

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use clap::Parser;
use lockstep_core::alignment::AlignmentStatus;
use lockstep_core::audio::{output_device_ids, start_audio_system};
use lockstep_core::config::{default_config_path, load_config, save_config, EngineConfig};
use lockstep_core::engine::{EngineEvent, PlaybackController, PlaybackEngine};
use lockstep_core::source::{SampleSource, ToneSource};
use lockstep_core::{SourceId, StereoSample, DEFAULT_SAMPLE_RATE};

use options::{Cli, Command, PlaybackArgs};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const RENDER_BLOCK: usize = 512;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config: EngineConfig = load_config(&config_path);

    match &cli.command {
        Command::Devices => list_devices(),
        Command::SaveConfig => {
            save_config(&config, &config_path)?;
            println!("Config written to {}", config_path.display());
            Ok(())
        }
        Command::Play { playback, out } => play(playback, out.as_deref(), &config),
        Command::Render { playback, out } => render(playback, out, &config),
    }
}

fn list_devices() -> Result<()> {
    for id in output_device_ids()? {
        println!("{}", id.display_label());
    }
    Ok(())
}

fn load_sources(options: &PlaybackArgs) -> Result<Vec<Arc<dyn SampleSource>>> {
    let mut sources: Vec<Arc<dyn SampleSource>> = Vec::new();
    for path in &options.inputs {
        sources.push(Arc::new(wav::load_wav(path)?));
    }
    for &hz in &options.tones {
        sources.push(Arc::new(ToneSource::new(hz, 0.25, DEFAULT_SAMPLE_RATE, 2)));
    }
    if sources.is_empty() {
        bail!("nothing to play: give WAV files or --tone <hz>");
    }
    Ok(sources)
}

/// Attach sources, queue alignment and set up the transport
fn prepare(controller: &mut PlaybackController, options: &PlaybackArgs) -> Result<Vec<SourceId>> {
    let mut ids = Vec::new();
    for source in load_sources(options)? {
        ids.push(controller.attach_source(source)?);
    }

    if options.align && ids.len() > 1 {
        controller.set_reference_source(Some(ids[0]))?;
        for &id in &ids[1..] {
            controller.request_alignment(id)?;
        }
    }

    let rate = controller.timeline_rate() as f64;
    if let Some((start, end)) = options.loop_selection {
        controller.set_selection((start * rate) as i64, (end * rate) as i64)?;
        controller.set_selection_constraint(true)?;
        controller.set_loop(true)?;
    }
    controller.seek((options.start * rate) as i64)?;
    controller.set_speed_ratio(options.speed)?;
    Ok(ids)
}

fn alignment_pending(controller: &PlaybackController, ids: &[SourceId]) -> bool {
    ids.iter()
        .any(|id| controller.alignment_status(*id) == AlignmentStatus::Computing)
}

fn report_alignment(controller: &PlaybackController, ids: &[SourceId]) {
    for &id in ids.iter().skip(1) {
        match controller.alignment_status(id) {
            AlignmentStatus::Unaligned => {}
            status => log::info!("{}: {:?}", id, status),
        }
    }
}

fn play(options: &PlaybackArgs, out: Option<&Path>, config: &EngineConfig) -> Result<()> {
    let (handle, mut controller) = start_audio_system(config)?;
    println!(
        "Playing on {} ({} Hz, {} frames, ~{:.1} ms)",
        handle.device_name(),
        handle.sample_rate(),
        handle.buffer_size(),
        handle.latency_ms()
    );

    let ids = prepare(&mut controller, options)?;
    if let Some(out) = out {
        controller.start_capture(out)?;
    }
    controller.play()?;

    let started = Instant::now();
    loop {
        thread::sleep(POLL_INTERVAL);
        let events = controller.poll_events();
        let finished = events
            .iter()
            .any(|e| matches!(e, EngineEvent::PlaybackComplete | EngineEvent::SelectionEnded));
        if finished {
            break;
        }
        if options
            .seconds
            .is_some_and(|limit| started.elapsed().as_secs_f64() >= limit)
        {
            break;
        }
        let levels = controller.output_levels().peak();
        log::debug!(
            "pos {:.2}s  speed {:.2}  peak {:.2}/{:.2}  {:?}",
            controller.position_seconds(),
            controller.speed_ratio(),
            levels.0,
            levels.1,
            controller.overload_status().level
        );
    }

    controller.stop()?;
    thread::sleep(POLL_INTERVAL);
    controller.poll_events();
    report_alignment(&controller, &ids);
    if controller.is_capturing() {
        let frames = controller.stop_capture()?;
        println!("Captured {} frames", frames);
    }
    print_summary(&controller);
    drop(handle);
    Ok(())
}

fn render(options: &PlaybackArgs, out: &Path, config: &EngineConfig) -> Result<()> {
    if options.seconds.is_none() && !options.tones.is_empty() {
        bail!("tones never end; give --seconds for an offline render");
    }
    let rate = config.audio.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE);
    let (mut controller, mut engine) = PlaybackController::new(config, rate);
    let ids = prepare(&mut controller, options)?;

    // Offline: wait for paths so the render starts aligned
    while alignment_pending(&controller, &ids) {
        thread::sleep(Duration::from_millis(10));
        controller.poll_events();
    }
    report_alignment(&controller, &ids);

    controller.start_capture(out)?;
    controller.play()?;

    let limit = options.seconds.map(|s| (s * rate as f64) as u64);
    let rendered = render_blocks(&mut controller, &mut engine, limit);

    let frames = controller.stop_capture()?;
    println!(
        "Rendered {} frames ({:.2}s) to {}",
        frames,
        rendered as f64 / rate as f64,
        out.display()
    );
    print_summary(&controller);
    Ok(())
}

fn render_blocks(
    controller: &mut PlaybackController,
    engine: &mut PlaybackEngine,
    limit: Option<u64>,
) -> u64 {
    let mut block = vec![StereoSample::silence(); RENDER_BLOCK];
    let mut rendered = 0u64;
    loop {
        engine.process(&mut block);
        rendered += RENDER_BLOCK as u64;
        let events = controller.poll_events();
        let finished = events
            .iter()
            .any(|e| matches!(e, EngineEvent::PlaybackComplete | EngineEvent::SelectionEnded));
        if finished || limit.is_some_and(|l| rendered >= l) {
            return rendered;
        }
        if limit.is_none() && !controller.is_playing() {
            return rendered;
        }
    }
}

fn print_summary(controller: &PlaybackController) {
    let status = controller.overload_status();
    let atomics = controller.playback_atomics();
    println!(
        "{} blocks, {} underruns, {} overruns, {} silenced, {} events dropped",
        atomics.blocks_processed(),
        atomics.underruns(),
        status.total_overruns,
        status.silenced_blocks,
        atomics.dropped_events()
    );
}
