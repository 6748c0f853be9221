use serde::{Deserialize, Serialize};

/// A single note with absolute timing in seconds.
///
/// Pitch and velocity are signed so that model output which falls outside the
/// MIDI range can still be represented; the MIDI writer rejects or clips it.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct NoteEvent {
    pub start: f64,
    pub end: f64,
    pub pitch: i32,
    pub velocity: i32,
}

impl NoteEvent {
    pub fn new(start: f64, end: f64, pitch: i32, velocity: i32) -> Self {
        Self {
            start,
            end,
            pitch,
            velocity,
        }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Instrument {
    pub name: Option<String>,
    /// General MIDI program number.
    pub program: u8,
    pub notes: Vec<NoteEvent>,
}

impl Instrument {
    pub fn new(program: u8) -> Self {
        Self {
            name: None,
            program,
            notes: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    pub title: Option<String>,
    pub tempo_bpm: Option<f64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Song {
    pub metadata: Metadata,
    pub instruments: Vec<Instrument>,
}
