use crate::error::{MelodyError, Result};
use crate::features::{
    NO_OCTAVE, NUM_SEMITONE_CLASSES, OCTAVE_SCALE, RhythmNumeric, STEP_SCALE, SemitoneVector,
    VELOCITY_SCALE,
};
use crate::model::song::NoteEvent;
use log::{debug, warn};

/// One aggregated row per distinct onset time.
#[derive(Debug, Clone, PartialEq)]
pub struct RhythmStep {
    pub start: f64,
    pub end: f64,
    pub velocity: i32,
    /// Onset delta from the previous step, 0 for the first.
    pub step: f64,
    pub duration: f64,
    pub min_octave: i32,
    pub max_octave: i32,
    /// Semitone class per unfolded chord slot, in order of first appearance.
    pub semitones: Vec<u8>,
}

/// Model-ready features, one row per rhythm step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RhythmFeatures {
    pub numeric: Vec<RhythmNumeric>,
    pub categorical: Vec<SemitoneVector>,
}

impl RhythmFeatures {
    pub fn len(&self) -> usize {
        self.numeric.len()
    }

    pub fn is_empty(&self) -> bool {
        self.numeric.is_empty()
    }
}

/// Semitone class of a MIDI pitch: `1 + pitch % 12`, or 0 for silence.
pub fn semitone(pitch: i32) -> u8 {
    if pitch > 0 {
        1 + pitch.rem_euclid(12) as u8
    } else {
        0
    }
}

/// Octave of a MIDI pitch (`pitch / 12 - 1`), or the sentinel for silence.
pub fn octave(pitch: i32) -> i32 {
    if pitch > 0 {
        pitch.div_euclid(12) - 1
    } else {
        NO_OCTAVE
    }
}

/// Groups notes into chords keyed by exact onset time, ascending.
///
/// Within a chord the notes keep their input order.
fn group_chords(notes: &[NoteEvent]) -> Vec<Vec<&NoteEvent>> {
    let mut sorted: Vec<&NoteEvent> = notes
        .iter()
        .filter(|note| {
            if note.start.is_finite() && note.end.is_finite() {
                return true;
            }
            warn!(
                "Dropping note {} with non-finite timing [{} -> {}]..!",
                note.pitch, note.start, note.end
            );
            false
        })
        .collect();

    // sort_by is stable, which keeps chord members in order of appearance
    sorted.sort_by(|a, b| a.start.total_cmp(&b.start));

    let mut chords: Vec<Vec<&NoteEvent>> = Vec::new();
    for note in sorted {
        match chords.last_mut() {
            Some(chord) if chord[0].start == note.start => chord.push(note),
            _ => chords.push(vec![note]),
        }
    }
    chords
}

/// Unfolds a chord into exactly `notes_per_chord` pitch slots, padding with silence.
fn unfold_chord(chord: &[&NoteEvent], notes_per_chord: usize) -> Vec<i32> {
    if chord.len() > notes_per_chord {
        debug!(
            "Chord at {:.3}s has {} notes, keeping the first {}..!",
            chord[0].start,
            chord.len(),
            notes_per_chord
        );
    }

    let mut slots: Vec<i32> = chord
        .iter()
        .take(notes_per_chord)
        .map(|note| note.pitch)
        .collect();
    slots.resize(notes_per_chord, 0);
    slots
}

/// Builds the rhythm steps for an instrument's notes.
pub fn rhythm_steps(notes: &[NoteEvent], notes_per_chord: usize) -> Result<Vec<RhythmStep>> {
    if let Some(note) = notes.iter().find(|note| !(0..=127).contains(&note.pitch)) {
        return Err(MelodyError::InvalidPitch { pitch: note.pitch });
    }

    let chords = group_chords(notes);
    if chords.is_empty() {
        return Err(MelodyError::EmptyInput);
    }

    let mut steps: Vec<RhythmStep> = Vec::with_capacity(chords.len());
    let mut previous_start: Option<f64> = None;

    for chord in chords.iter() {
        let start = chord[0].start;
        let end = chord
            .iter()
            .map(|note| note.end)
            .fold(f64::NEG_INFINITY, f64::max);
        let velocity = chord.iter().map(|note| note.velocity).max().unwrap_or(0);

        let slots = unfold_chord(chord, notes_per_chord);
        let octaves = slots
            .iter()
            .map(|&pitch| octave(pitch))
            .filter(|&oct| oct >= 0);
        let (min_octave, max_octave) = octaves.fold(None, |acc: Option<(i32, i32)>, oct| {
            Some(match acc {
                Some((lo, hi)) => (lo.min(oct), hi.max(oct)),
                None => (oct, oct),
            })
        })
        .unwrap_or((NO_OCTAVE, NO_OCTAVE));

        steps.push(RhythmStep {
            start,
            end,
            velocity,
            step: previous_start.map_or(0.0, |prev| start - prev),
            duration: end - start,
            min_octave,
            max_octave,
            semitones: slots.iter().map(|&pitch| semitone(pitch)).collect(),
        });
        previous_start = Some(start);
    }

    debug!(
        "Built {} rhythm steps from {} notes..!",
        steps.len(),
        notes.len()
    );
    Ok(steps)
}

/// Normalized numeric row for a rhythm step.
pub fn numeric_row(step: &RhythmStep) -> RhythmNumeric {
    [
        (step.velocity as f64 / VELOCITY_SCALE) as f32,
        (step.step / STEP_SCALE) as f32,
        step.duration as f32,
        (step.min_octave as f64 / OCTAVE_SCALE) as f32,
        (step.max_octave as f64 / OCTAVE_SCALE) as f32,
    ]
}

/// Multi-hot semitone row: the logical OR of each slot's one-hot class.
///
/// Padded slots of a pitched chord switch on class 0. A chord with no pitched
/// slot at all stays all zeros, which the sequence model treats as masked.
pub fn categorical_row(step: &RhythmStep) -> SemitoneVector {
    let mut row = [0.0f32; NUM_SEMITONE_CLASSES];
    if step.semitones.iter().all(|&class| class == 0) {
        return row;
    }
    for &class in step.semitones.iter() {
        row[class as usize] = 1.0;
    }
    row
}

/// Encodes an instrument's notes into numeric and categorical feature sequences.
pub fn encode_rhythm(notes: &[NoteEvent], notes_per_chord: usize) -> Result<RhythmFeatures> {
    let steps = rhythm_steps(notes, notes_per_chord)?;

    Ok(RhythmFeatures {
        numeric: steps.iter().map(numeric_row).collect(),
        categorical: steps.iter().map(categorical_row).collect(),
    })
}
