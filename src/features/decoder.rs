use crate::features::{MelodyNumeric, OCTAVE_SCALE, STEP_SCALE, VELOCITY_SCALE};
use crate::model::song::{Instrument, NoteEvent};
use serde::{Deserialize, Serialize};

pub const MELODY_TRACK_NAME: &str = "Melody";

/// One decoder iteration's output before de-normalization.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct GeneratedNote {
    /// Raw velocity, step, duration and octave predictions.
    pub numeric: MelodyNumeric,
    /// Sampled semitone class, 0 being silence.
    pub semitone: usize,
}

impl GeneratedNote {
    pub fn new(numeric: MelodyNumeric, semitone: usize) -> Self {
        Self { numeric, semitone }
    }

    pub fn velocity(&self) -> f64 {
        self.numeric[0] as f64
    }

    pub fn step(&self) -> f64 {
        self.numeric[1] as f64
    }

    pub fn duration(&self) -> f64 {
        self.numeric[2] as f64
    }

    pub fn octave(&self) -> f64 {
        self.numeric[3] as f64
    }
}

/// Converts generated rows back into absolute-time notes.
///
/// Velocity, octave and class are truncated toward zero. Starts are the running
/// sum of steps, including the first. Pitches are not clamped.
pub fn decode_melody(generated: &[GeneratedNote]) -> Vec<NoteEvent> {
    let mut start = 0.0f64;

    generated
        .iter()
        .map(|note| {
            let velocity = (note.velocity() * VELOCITY_SCALE) as i32;
            let octave = (note.octave() * OCTAVE_SCALE) as i32;
            start += note.step() * STEP_SCALE;

            NoteEvent {
                start,
                end: start + note.duration(),
                pitch: octave * 12 + (note.semitone as i32 - 1),
                velocity,
            }
        })
        .collect()
}

/// Wraps decoded notes into the melody instrument.
pub fn melody_instrument(generated: &[GeneratedNote], program: u8) -> Instrument {
    Instrument {
        name: Some(MELODY_TRACK_NAME.to_owned()),
        program,
        notes: decode_melody(generated),
    }
}
