//! Command line parsing

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(about = "Play or render sources through the lockstep engine")]
pub struct Cli {
    /// Engine config (default: platform config dir)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List output devices
    Devices,
    /// Write the effective config back and exit
    SaveConfig,
    /// Play inputs on the output device
    Play {
        #[command(flatten)]
        playback: PlaybackArgs,
        /// Capture the output to this WAV file
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
    },
    /// Render inputs offline to a WAV file
    Render {
        #[command(flatten)]
        playback: PlaybackArgs,
        #[arg(long, value_name = "FILE")]
        out: PathBuf,
    },
}

#[derive(Args, Debug, Clone)]
pub struct PlaybackArgs {
    /// WAV files to attach
    pub inputs: Vec<PathBuf>,

    /// Add a synthetic tone source
    #[arg(long = "tone", value_name = "HZ")]
    pub tones: Vec<f32>,

    /// Playback speed (0.1 - 4.0)
    #[arg(long, default_value_t = 1.0)]
    pub speed: f64,

    /// Stop after this many seconds of output
    #[arg(long)]
    pub seconds: Option<f64>,

    /// Start position in seconds
    #[arg(long, default_value_t = 0.0)]
    pub start: f64,

    /// Loop the selection between A and B seconds
    #[arg(long = "loop", value_name = "A:B", value_parser = parse_selection)]
    pub loop_selection: Option<(f64, f64)>,

    /// Align every input to the first one before playing
    #[arg(long)]
    pub align: bool,
}

fn parse_selection(text: &str) -> Result<(f64, f64), String> {
    let (a, b) = text
        .split_once(':')
        .ok_or_else(|| format!("expected <start>:<end>, got '{}'", text))?;
    let number = |s: &str| {
        s.trim()
            .parse::<f64>()
            .map_err(|_| format!("'{}' is not a number", s))
    };
    let (start, end) = (number(a)?, number(b)?);
    if end <= start {
        return Err(format!("loop end {} must be after start {}", end, start));
    }
    Ok((start, end))
}
