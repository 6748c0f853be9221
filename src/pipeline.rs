use crate::error::{MelodyError, Result};
use crate::features::decoder::{GeneratedNote, melody_instrument};
use crate::features::encoder::encode_rhythm;
use crate::generator::generate;
use crate::model::config::GenerationConfig;
use crate::model::song::{Instrument, Song};
use crate::nn::model::MelodyModel;
use crate::sampler::TemperatureSampler;
use log::{debug, info};
use rand::Rng;

/// Turns a rhythm instrument into a melody instrument with a shared model.
///
/// Holds no per-request state, so one generator can serve any number of
/// requests, each with its own RNG.
#[derive(Debug, Clone, Copy)]
pub struct MelodyGenerator<'m> {
    model: &'m MelodyModel,
    config: GenerationConfig,
}

impl<'m> MelodyGenerator<'m> {
    pub fn new(model: &'m MelodyModel, config: GenerationConfig) -> Result<Self> {
        Ok(Self {
            model,
            config: config.validated()?,
        })
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// Raw generated rows for `rhythm`, before de-normalization.
    pub fn generate_notes<R: Rng + ?Sized>(
        &self,
        rhythm: &Instrument,
        rng: &mut R,
    ) -> Result<Vec<GeneratedNote>> {
        let features = encode_rhythm(&rhythm.notes, self.config.notes_per_chord)?;
        let sampler = TemperatureSampler::new(self.config.temperature);
        generate(self.model, &features, &sampler, self.config.max_size, rng)
    }

    pub fn generate_melody<R: Rng + ?Sized>(
        &self,
        rhythm: &Instrument,
        rng: &mut R,
    ) -> Result<Instrument> {
        let generated = self.generate_notes(rhythm, rng)?;
        Ok(melody_instrument(&generated, self.config.program))
    }

    /// Returns a copy of `song` with a melody track appended after its own
    /// tracks, generated from the instrument at `instrument`.
    pub fn accompany<R: Rng + ?Sized>(
        &self,
        song: &Song,
        instrument: usize,
        rng: &mut R,
    ) -> Result<Song> {
        if song.instruments.is_empty() {
            return Err(MelodyError::EmptyInput);
        }
        let rhythm = song.instruments.get(instrument).ok_or_else(|| {
            MelodyError::InvalidConfig(format!(
                "instrument {} does not exist, the song has {}",
                instrument,
                song.instruments.len()
            ))
        })?;

        debug!(
            "Using instrument {} ('{}') with {} notes as rhythm..!",
            instrument,
            rhythm.name.as_deref().unwrap_or("<unnamed>"),
            rhythm.notes.len()
        );

        let melody = self.generate_melody(rhythm, rng)?;
        info!(
            "Generated a melody of {} notes on program {}..!",
            melody.notes.len(),
            melody.program
        );

        let mut accompanied = song.clone();
        accompanied.instruments.push(melody);
        Ok(accompanied)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::features::decoder::MELODY_TRACK_NAME;
    use crate::model::song::{Metadata, NoteEvent};
    use crate::nn::weights::fixtures::model_params;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn model() -> MelodyModel {
        MelodyModel::from_params(&model_params(4, 3, 8)).unwrap()
    }

    fn config(max_size: usize) -> GenerationConfig {
        GenerationConfig {
            max_size,
            ..GenerationConfig::default()
        }
    }

    fn rhythm() -> Instrument {
        let mut instrument = Instrument::new(0).with_name("Piano");
        for i in 0..6 {
            let start = i as f64 * 0.5;
            instrument.notes.push(NoteEvent::new(start, start + 0.5, 48, 70));
            instrument.notes.push(NoteEvent::new(start, start + 0.5, 52 + i, 70));
        }
        instrument
    }

    fn song() -> Song {
        Song {
            metadata: Metadata {
                title: Some(String::from("Chords")),
                tempo_bpm: Some(100.0),
            },
            instruments: vec![rhythm()],
        }
    }

    #[test]
    fn melody_has_configured_shape() {
        env_logger::try_init().unwrap_or(());

        let model = model();
        let generator = MelodyGenerator::new(&model, config(20)).unwrap();
        let mut rng = StdRng::seed_from_u64(8);

        let melody = generator.generate_melody(&rhythm(), &mut rng).unwrap();
        assert_eq!(melody.notes.len(), 20);
        assert_eq!(melody.program, 25);
        assert_eq!(melody.name.as_deref(), Some(MELODY_TRACK_NAME));
    }

    #[test]
    fn accompany_appends_without_touching_input() {
        env_logger::try_init().unwrap_or(());

        let model = model();
        let generator = MelodyGenerator::new(&model, config(12)).unwrap();
        let original = song();
        let mut rng = StdRng::seed_from_u64(8);

        let accompanied = generator.accompany(&original, 0, &mut rng).unwrap();
        assert_eq!(original.instruments.len(), 1);
        assert_eq!(accompanied.instruments.len(), 2);
        assert_eq!(accompanied.instruments[0], original.instruments[0]);
        assert_eq!(accompanied.metadata, original.metadata);
        assert_eq!(accompanied.instruments[1].notes.len(), 12);
    }

    #[test]
    fn same_seed_same_song() {
        env_logger::try_init().unwrap_or(());

        let model = model();
        let generator = MelodyGenerator::new(&model, config(30)).unwrap();
        let run = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            generator.accompany(&song(), 0, &mut rng).unwrap()
        };
        assert_eq!(run(4), run(4));
    }

    #[test]
    fn missing_or_empty_rhythm_is_rejected() {
        env_logger::try_init().unwrap_or(());

        let model = model();
        let generator = MelodyGenerator::new(&model, config(5)).unwrap();
        let mut rng = StdRng::seed_from_u64(0);

        let result = generator.accompany(&song(), 3, &mut rng);
        assert!(matches!(result, Err(MelodyError::InvalidConfig(_))));

        let result = generator.accompany(&Song::default(), 0, &mut rng);
        assert!(matches!(result, Err(MelodyError::EmptyInput)));

        let result = generator.generate_melody(&Instrument::new(0), &mut rng);
        assert!(matches!(result, Err(MelodyError::EmptyInput)));
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let model = model();
        let bad = GenerationConfig {
            temperature: 0.0,
            ..GenerationConfig::default()
        };
        assert!(matches!(
            MelodyGenerator::new(&model, bad),
            Err(MelodyError::InvalidConfig(_))
        ));
    }
}
