use crate::error::{MelodyError, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_TEMPERATURE: f64 = 0.8;
pub const DEFAULT_MAX_SIZE: usize = 125;
pub const DEFAULT_NOTES_PER_CHORD: usize = 6;
pub const DEFAULT_MELODY_PROGRAM: u8 = 25;

#[derive(Parser, Debug)]
#[command(
    name = "MELODY_TRAGIC",
    about = "Upload your chords, download your masterpiece! Generates a melody track for a transcribed MIDI file."
)]
pub struct Args {
    /// Path to the transcribed MIDI file holding the chord/rhythm track.
    pub midi: PathBuf,

    /// Directory holding the `encoder.json` and `decoder.json` parameter files.
    #[arg(short, long, default_value = "weights")]
    pub weights: PathBuf,

    /// Where to write the combined MIDI file. Defaults to `<input>_melody.mid`.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Sampling temperature. Lower is more deterministic, higher is closer to uniform.
    #[arg(short, long, default_value_t = DEFAULT_TEMPERATURE)]
    pub temperature: f64,

    /// Number of melody notes to generate.
    #[arg(long, default_value_t = DEFAULT_MAX_SIZE)]
    pub max_size: usize,

    /// Maximum number of simultaneous pitches kept per chord.
    #[arg(long, default_value_t = DEFAULT_NOTES_PER_CHORD)]
    pub notes_per_chord: usize,

    /// Index of the instrument to use as the rhythm input.
    #[arg(short, long, default_value_t = 0)]
    pub instrument: usize,

    /// General MIDI program for the generated melody track.
    #[arg(short, long, default_value_t = DEFAULT_MELODY_PROGRAM)]
    pub program: u8,

    /// Seed for reproducible sampling. Uses OS entropy when omitted.
    #[arg(short, long)]
    pub seed: Option<u64>,

    /// Dry run (print first dry_run_max generated notes and exit).
    #[arg(short, long, default_value_t = false)]
    pub dry_run: bool,

    /// Maximum notes to print in dry run.
    #[arg(long, default_value_t = 80)]
    pub dry_run_max: usize,
}

impl Args {
    pub fn output_path(&self) -> PathBuf {
        if let Some(output) = self.output.as_ref() {
            return output.clone();
        }

        let stem = self
            .midi
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("output");
        self.midi.with_file_name(format!("{stem}_melody.mid"))
    }

    pub fn generation_config(&self) -> Result<GenerationConfig> {
        GenerationConfig {
            temperature: self.temperature,
            max_size: self.max_size,
            notes_per_chord: self.notes_per_chord,
            program: self.program,
        }
        .validated()
    }
}

/// Parameters for a single melody generation request.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct GenerationConfig {
    pub temperature: f64,
    pub max_size: usize,
    pub notes_per_chord: usize,
    pub program: u8,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            max_size: DEFAULT_MAX_SIZE,
            notes_per_chord: DEFAULT_NOTES_PER_CHORD,
            program: DEFAULT_MELODY_PROGRAM,
        }
    }
}

impl GenerationConfig {
    pub fn validated(self) -> Result<Self> {
        if !self.temperature.is_finite() || self.temperature <= 0.0 {
            return Err(MelodyError::InvalidConfig(format!(
                "temperature must be a positive finite number, got {}",
                self.temperature
            )));
        }
        if self.max_size == 0 {
            return Err(MelodyError::InvalidConfig(
                "max_size must be at least 1".into(),
            ));
        }
        if self.notes_per_chord == 0 {
            return Err(MelodyError::InvalidConfig(
                "notes_per_chord must be at least 1".into(),
            ));
        }
        if self.program > 127 {
            return Err(MelodyError::InvalidConfig(format!(
                "program must be in [0, 127], got {}",
                self.program
            )));
        }
        Ok(self)
    }
}
