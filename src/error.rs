use std::path::PathBuf;
use thiserror::Error;

/// Failures surfaced by feature encoding, model loading and generation.
///
/// Near-degenerate sampling distributions are not errors: the sampler logs a
/// warning and falls back to a deterministic pick.
#[derive(Error, Debug)]
pub enum MelodyError {
    /// The rhythm instrument has no notes, so there is nothing to encode.
    #[error("Instrument has no notes to encode..!")]
    EmptyInput,

    /// A chord slot pitch fell outside the MIDI range during encoding.
    #[error("Pitch {pitch} is outside the representable range [0, 127]..!")]
    InvalidPitch { pitch: i32 },

    /// Model parameters are missing, unreadable or have inconsistent shapes.
    #[error("Failed to load model parameters from {}: {reason}", path.display())]
    ModelLoad { path: PathBuf, reason: String },

    /// The tensor backend failed to hand results back.
    #[error("Inference failed: {0}")]
    Inference(String),

    /// A generation parameter is out of range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MelodyError {
    pub(crate) fn model_load(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        MelodyError::ModelLoad {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MelodyError>;
