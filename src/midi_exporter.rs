use crate::midi_importer::{DEFAULT_MPQN, MICROSECONDS_PER_MINUTE};
use crate::model::song::{Instrument, Song};
use anyhow::{Result, anyhow};
use log::{debug, info, warn};
use midly::num::{u4, u7, u15, u24, u28};
use midly::{Format, Header, MetaMessage, MidiMessage, Smf, Timing, Track, TrackEvent, TrackEventKind};
use std::fs;
use std::path::Path;

pub const TICKS_PER_QUARTER: u16 = 480;

const DRUM_CHANNEL: u8 = 9;
const MAX_TICK: u64 = 0x0FFF_FFFF;
const MAX_MPQN: u32 = 0x00FF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimedMessage {
    tick: u64,
    // offs sort before ons so back-to-back notes on one key don't cut each other
    is_on: bool,
    key: u8,
    velocity: u8,
}

/// Converts seconds to ticks at a fixed tempo.
struct TickClock {
    ticks_per_second: f64,
}

impl TickClock {
    fn new(mpqn: u32) -> Self {
        Self {
            ticks_per_second: TICKS_PER_QUARTER as f64 * 1_000_000.0 / mpqn as f64,
        }
    }

    fn ticks(&self, seconds: f64) -> u64 {
        (seconds * self.ticks_per_second).round() as u64
    }
}

fn song_mpqn(song: &Song) -> u32 {
    let Some(bpm) = song.metadata.tempo_bpm else {
        return DEFAULT_MPQN;
    };

    let mpqn = (MICROSECONDS_PER_MINUTE / bpm).round();
    if !mpqn.is_finite() || mpqn < 1.0 || mpqn > MAX_MPQN as f64 {
        warn!("Tempo of {} bpm cannot be written, using 120 bpm..!", bpm);
        return DEFAULT_MPQN;
    }
    mpqn as u32
}

/// Channel for the n-th instrument, skipping the GM drum channel.
fn channel_for(index: usize) -> u8 {
    let ch = (index % 15) as u8;
    if ch >= DRUM_CHANNEL { ch + 1 } else { ch }
}

/// Collects note on/off messages, rejecting notes a MIDI file cannot hold.
fn instrument_messages(instrument: &Instrument, clock: &TickClock) -> Vec<TimedMessage> {
    let mut messages: Vec<TimedMessage> = Vec::with_capacity(instrument.notes.len() * 2);
    let mut rejected = 0usize;
    let mut clipped = 0usize;

    for note in instrument.notes.iter() {
        if !(0..=127).contains(&note.pitch) {
            debug!("Rejecting out-of-range pitch {}..!", note.pitch);
            rejected += 1;
            continue;
        }
        if !note.start.is_finite() || !note.end.is_finite() || note.start < 0.0 {
            debug!(
                "Rejecting note {} with unwritable timing [{} -> {}]..!",
                note.pitch, note.start, note.end
            );
            rejected += 1;
            continue;
        }

        let start_tick = clock.ticks(note.start);
        let end_tick = clock.ticks(note.end);
        if end_tick <= start_tick || end_tick > MAX_TICK {
            debug!(
                "Rejecting note {} spanning ticks {} -> {}..!",
                note.pitch, start_tick, end_tick
            );
            rejected += 1;
            continue;
        }

        let velocity = note.velocity.clamp(1, 127) as u8;
        if velocity as i32 != note.velocity {
            clipped += 1;
        }

        let key = note.pitch as u8;
        messages.push(TimedMessage {
            tick: start_tick,
            is_on: true,
            key,
            velocity,
        });
        messages.push(TimedMessage {
            tick: end_tick,
            is_on: false,
            key,
            velocity: 0,
        });
    }

    if rejected > 0 {
        warn!(
            "Dropped {} unwritable note(s) from instrument '{}'..!",
            rejected,
            instrument.name.as_deref().unwrap_or("<unnamed>")
        );
    }
    if clipped > 0 {
        warn!(
            "Clipped the velocity of {} note(s) from instrument '{}' into [1, 127]..!",
            clipped,
            instrument.name.as_deref().unwrap_or("<unnamed>")
        );
    }

    messages.sort_unstable();
    messages
}

fn instrument_track<'a>(instrument: &'a Instrument, channel: u8, clock: &TickClock) -> Track<'a> {
    let channel = u4::new(channel);
    let mut track: Track<'a> = Vec::new();

    if let Some(name) = instrument.name.as_ref() {
        track.push(TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::TrackName(name.as_bytes())),
        });
    }

    track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Midi {
            channel,
            message: MidiMessage::ProgramChange {
                program: u7::new(instrument.program.min(127)),
            },
        },
    });

    let mut last_tick: u64 = 0;
    for message in instrument_messages(instrument, clock) {
        let key = u7::new(message.key);
        let midi = if message.is_on {
            MidiMessage::NoteOn {
                key,
                vel: u7::new(message.velocity),
            }
        } else {
            MidiMessage::NoteOff {
                key,
                vel: u7::new(0),
            }
        };

        track.push(TrackEvent {
            delta: u28::new((message.tick - last_tick) as u32),
            kind: TrackEventKind::Midi {
                channel,
                message: midi,
            },
        });
        last_tick = message.tick;
    }

    track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    });
    track
}

/// Builds a format 1 file: a tempo track followed by one track per instrument.
pub fn song_to_smf(song: &Song) -> Smf<'_> {
    let mpqn = song_mpqn(song);
    let clock = TickClock::new(mpqn);

    let mut smf = Smf::new(Header::new(
        Format::Parallel,
        Timing::Metrical(u15::new(TICKS_PER_QUARTER)),
    ));

    smf.tracks.push(vec![
        TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::new(mpqn))),
        },
        TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
        },
    ]);

    for (index, instrument) in song.instruments.iter().enumerate() {
        smf.tracks
            .push(instrument_track(instrument, channel_for(index), &clock));
    }

    smf
}

pub fn song_to_bytes(song: &Song) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    song_to_smf(song)
        .write(&mut buf)
        .map_err(|e| anyhow!("Failed to encode MIDI: {:?}", e))?;
    Ok(buf)
}

pub fn write_midi_file<P: AsRef<Path>>(song: &Song, path: P) -> Result<()> {
    let bytes = song_to_bytes(song)?;
    fs::write(path.as_ref(), &bytes).map_err(|e| {
        anyhow!(
            "Failed to write MIDI file {}: {}",
            path.as_ref().display(),
            e
        )
    })?;

    info!(
        "Wrote {} track(s) to '{}'..!",
        song.instruments.len() + 1,
        path.as_ref().display()
    );
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::midi_importer::{import_midi_file, midi_bytes_to_song};
    use crate::model::song::{Metadata, NoteEvent};
    use approx::assert_relative_eq;
    use tempfile::TempDir;

    fn song(instruments: Vec<Instrument>) -> Song {
        Song {
            metadata: Metadata {
                title: Some(String::from("Test")),
                tempo_bpm: Some(90.0),
            },
            instruments,
        }
    }

    fn chords() -> Instrument {
        Instrument {
            name: Some(String::from("Chords")),
            program: 0,
            notes: vec![
                NoteEvent::new(0.0, 1.0, 60, 80),
                NoteEvent::new(0.0, 1.0, 64, 80),
                NoteEvent::new(1.0, 2.0, 65, 80),
            ],
        }
    }

    #[test]
    fn written_file_reads_back() {
        env_logger::try_init().unwrap_or(());

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.mid");
        let original = song(vec![chords()]);

        write_midi_file(&original, &path).unwrap();
        let read = import_midi_file(&path).unwrap();

        assert_relative_eq!(read.metadata.tempo_bpm.unwrap(), 90.0, epsilon = 1e-3);
        assert_eq!(read.instruments.len(), 1);
        assert_eq!(read.instruments[0].name.as_deref(), Some("Chords"));

        let mut notes = read.instruments[0].notes.clone();
        notes.sort_by(|a, b| a.start.total_cmp(&b.start).then(a.pitch.cmp(&b.pitch)));
        for (read, written) in notes.iter().zip(original.instruments[0].notes.iter()) {
            assert_eq!(read.pitch, written.pitch);
            assert_eq!(read.velocity, written.velocity);
            assert_relative_eq!(read.start, written.start, epsilon = 1e-3);
            assert_relative_eq!(read.end, written.end, epsilon = 1e-3);
        }
    }

    #[test]
    fn unwritable_notes_are_dropped_or_clipped() {
        env_logger::try_init().unwrap_or(());

        let melody = Instrument {
            name: Some(String::from("Melody")),
            program: 25,
            notes: vec![
                NoteEvent::new(0.0, 0.5, -1, 64),
                NoteEvent::new(0.0, 0.5, 140, 64),
                NoteEvent::new(-1.0, 0.5, 60, 64),
                NoteEvent::new(1.0, 0.5, 62, 64),
                NoteEvent::new(f64::NAN, 0.5, 62, 64),
                NoteEvent::new(0.5, 1.0, 67, 190),
                NoteEvent::new(1.0, 1.5, 69, -3),
            ],
        };

        let bytes = song_to_bytes(&song(vec![melody])).unwrap();
        let read = midi_bytes_to_song(&bytes, None).unwrap();
        assert_eq!(read.instruments.len(), 1);
        assert_eq!(read.instruments[0].program, 25);

        let notes = &read.instruments[0].notes;
        assert_eq!(notes.len(), 2);
        let g = notes.iter().find(|n| n.pitch == 67).unwrap();
        assert_eq!(g.velocity, 127);
        let a = notes.iter().find(|n| n.pitch == 69).unwrap();
        assert_eq!(a.velocity, 1);
    }

    #[test]
    fn repeated_key_keeps_both_notes() {
        env_logger::try_init().unwrap_or(());

        let instrument = Instrument {
            name: None,
            program: 0,
            notes: vec![
                NoteEvent::new(0.0, 0.5, 60, 80),
                NoteEvent::new(0.5, 1.0, 60, 80),
            ],
        };
        let bytes = song_to_bytes(&song(vec![instrument])).unwrap();
        let read = midi_bytes_to_song(&bytes, None).unwrap();
        assert_eq!(read.instruments[0].notes.len(), 2);
    }

    #[test]
    fn appended_tracks_use_distinct_channels() {
        let song = song(vec![chords(), chords(), chords()]);
        let smf = song_to_smf(&song);
        assert_eq!(smf.tracks.len(), 4);

        let channels: Vec<u8> = smf.tracks[1..]
            .iter()
            .filter_map(|track| {
                track.iter().find_map(|event| match event.kind {
                    TrackEventKind::Midi { channel, .. } => Some(channel.as_int()),
                    _ => None,
                })
            })
            .collect();
        assert_eq!(channels, vec![0, 1, 2]);
    }

    #[test]
    fn channels_skip_drums_and_wrap() {
        let channels: Vec<u8> = (0..17).map(channel_for).collect();
        assert!(!channels.contains(&DRUM_CHANNEL));
        assert_eq!(channels[8], 8);
        assert_eq!(channels[9], 10);
        assert_eq!(channels[14], 15);
        assert_eq!(channels[15], 0);
        assert_eq!(channels[16], 1);
    }
}
