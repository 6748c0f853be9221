use crate::error::Result;
use crate::features::decoder::GeneratedNote;
use crate::features::encoder::RhythmFeatures;
use crate::features::{MelodyNumeric, NUM_MELODY_FEATURES, NUM_SEMITONE_CLASSES, SemitoneVector};
use crate::nn::layers::LatentState;
use crate::nn::model::MelodyModel;
use crate::sampler::TemperatureSampler;
use log::{debug, info};
use rand::Rng;

/// Loop carry: the recurrent state plus the note fed into the next step.
struct Carry {
    state: LatentState,
    numeric: MelodyNumeric,
    categorical: SemitoneVector,
}

/// Generates exactly `max_size` notes from a rhythm.
///
/// Starts from the encoded rhythm and an all-zero start token, then feeds every
/// raw numeric prediction and sampled one-hot class back into the decoder.
pub fn generate<R: Rng + ?Sized>(
    model: &MelodyModel,
    features: &RhythmFeatures,
    sampler: &TemperatureSampler,
    max_size: usize,
    rng: &mut R,
) -> Result<Vec<GeneratedNote>> {
    let state = model.encode(features)?;
    info!(
        "Generating {} notes from {} rhythm steps at temperature {}..!",
        max_size,
        features.len(),
        sampler.temperature()
    );

    let start = Carry {
        state,
        numeric: [0.0; NUM_MELODY_FEATURES],
        categorical: [0.0; NUM_SEMITONE_CLASSES],
    };

    let mut notes: Vec<GeneratedNote> = Vec::with_capacity(max_size);
    (0..max_size).try_fold(start, |carry, _| -> Result<Carry> {
        let output = model.decode_step(&carry.numeric, &carry.categorical, carry.state)?;
        let (class, one_hot) = sampler.sample_one_hot(&output.distribution, rng);

        notes.push(GeneratedNote::new(output.numeric, class));
        Ok(Carry {
            state: output.state,
            numeric: output.numeric,
            categorical: one_hot,
        })
    })?;

    debug!("Generated {} notes..!", notes.len());
    Ok(notes)
}
