pub mod decoder;
pub mod encoder;

/// Numeric features per rhythm step: velocity, step, duration, min octave, max octave.
pub const NUM_RHYTHM_FEATURES: usize = 5;

/// Numeric features per generated melody note: velocity, step, duration, octave.
pub const NUM_MELODY_FEATURES: usize = 4;

/// Semitone classes: 0 is silence, 1..=12 are the pitch classes C..B.
pub const NUM_SEMITONE_CLASSES: usize = 13;

pub const VELOCITY_SCALE: f64 = 127.0;
pub const STEP_SCALE: f64 = 10.0;
pub const OCTAVE_SCALE: f64 = 10.0;

/// Octave sentinel for silent slots and chords without a pitched note.
pub const NO_OCTAVE: i32 = -1;

pub type RhythmNumeric = [f32; NUM_RHYTHM_FEATURES];
pub type MelodyNumeric = [f32; NUM_MELODY_FEATURES];
pub type SemitoneVector = [f32; NUM_SEMITONE_CLASSES];
