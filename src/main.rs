use MELODY_TRAGIC::{Args, MelodyGenerator, MelodyModel, import_midi_file, write_midi_file};
use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info};
use rand::SeedableRng;
use rand::rngs::StdRng;

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = args.generation_config()?;

    info!("Loading model parameters from '{}'...", args.weights.display());
    let model = MelodyModel::load(&args.weights).with_context(|| {
        format!(
            "Cannot start without model parameters in '{}'",
            args.weights.display()
        )
    })?;

    info!("Importing MIDI file: '{}'...", args.midi.display());
    let song = import_midi_file(&args.midi)?;

    debug!(
        "Imported song '{}' with {} instrument(s)..!",
        song.metadata
            .title
            .clone()
            .unwrap_or_else(|| "<unknown>".into()),
        song.instruments.len()
    );

    let mut rng = match args.seed {
        Some(seed) => {
            info!("Seeding sampler with {}..!", seed);
            StdRng::seed_from_u64(seed)
        }
        None => StdRng::from_entropy(),
    };

    let generator = MelodyGenerator::new(&model, config)?;
    let accompanied = generator.accompany(&song, args.instrument, &mut rng)?;

    if args.dry_run {
        info!("Previewing at most {} generated notes..!", args.dry_run_max);
        if let Some(melody) = accompanied.instruments.last() {
            for (i, note) in melody.notes.iter().enumerate() {
                if i >= args.dry_run_max {
                    break;
                }
                info!(
                    "Note {}: pitch={} velocity={} start={:.3}s dur={:.3}s",
                    i,
                    note.pitch,
                    note.velocity,
                    note.start,
                    note.duration()
                );
            }
        }
        return Ok(());
    }

    let output = args.output_path();
    write_midi_file(&accompanied, &output)?;
    info!("Done! Melody written to '{}'..!", output.display());

    Ok(())
}
