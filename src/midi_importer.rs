use crate::model::song::*;
use anyhow::{Result, anyhow};
use log::{debug, info, warn};
use midly::{MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

pub(crate) const DEFAULT_MPQN: u32 = 500_000;
pub(crate) const MICROSECONDS_PER_MINUTE: f64 = 60_000_000.0;
const MICROSECONDS_PER_SECOND: f64 = 1_000_000.0;

struct NoteInterval {
    pub pitch: u8,
    pub start_tick: u64,
    pub end_tick: u64,
    pub velocity: u8,
}

#[derive(Debug, Clone)]
struct TempoSegment {
    pub mpqn: u32,
    pub start_tick: u64,
    pub seconds_at_start: f64,
}

/// Piecewise-constant tempo map for converting ticks into seconds.
struct TempoMap {
    ticks_per_quarter: u64,
    segments: Vec<TempoSegment>,
}

impl TempoMap {
    fn new(mut tempo_changes: Vec<(u64, u32)>, ticks_per_quarter: u64) -> Self {
        let mut last_tick: u64 = 0;
        let mut seconds_accum: f64 = 0.0;
        let mut last_mpqn: u32 = DEFAULT_MPQN;
        let mut segments: Vec<TempoSegment> = Vec::new();

        tempo_changes.sort_by_key(|(tick, _)| *tick);

        for (tick, mpqn) in tempo_changes.into_iter() {
            if tick > last_tick {
                let delta_ticks = (tick - last_tick) as f64;
                seconds_accum += delta_ticks * (last_mpqn as f64)
                    / (ticks_per_quarter as f64)
                    / MICROSECONDS_PER_SECOND;
            }

            // a later change at the same tick wins
            if let Some(last) = segments.last_mut()
                && last.start_tick == tick
            {
                last.mpqn = mpqn;
            } else {
                segments.push(TempoSegment {
                    start_tick: tick,
                    mpqn,
                    seconds_at_start: seconds_accum,
                });
            }

            last_tick = tick;
            last_mpqn = mpqn;
        }

        Self {
            ticks_per_quarter,
            segments,
        }
    }

    fn seconds(&self, tick: u64) -> f64 {
        let Some(segment) = self
            .segments
            .iter()
            .rfind(|seg| seg.start_tick <= tick)
            .or(self.segments.first())
        else {
            return (tick as f64) * DEFAULT_MPQN as f64
                / (self.ticks_per_quarter as f64)
                / MICROSECONDS_PER_SECOND;
        };

        let delta_ticks = tick.saturating_sub(segment.start_tick) as f64;
        segment.seconds_at_start
            + delta_ticks * (segment.mpqn as f64)
                / (self.ticks_per_quarter as f64)
                / MICROSECONDS_PER_SECOND
    }

    fn initial_bpm(&self) -> f64 {
        let mpqn = self.segments.first().map_or(DEFAULT_MPQN, |seg| seg.mpqn);
        MICROSECONDS_PER_MINUTE / (mpqn as f64)
    }
}

/// Notes collected from one MIDI track, split by channel.
#[derive(Default)]
struct TrackNotes {
    name: Option<String>,
    programs: HashMap<u8, u8>,
    open_notes: HashMap<(u8, u8), Vec<(u64, u8)>>,
    intervals: BTreeMap<u8, Vec<NoteInterval>>,
}

impl TrackNotes {
    fn close_note(&mut self, ch: u8, pitch: u8, abs_tick: u64) {
        if let Some((start_tick, velocity)) = self
            .open_notes
            .get_mut(&(ch, pitch))
            .and_then(|stack| stack.pop())
        {
            self.intervals.entry(ch).or_default().push(NoteInterval {
                pitch,
                start_tick,
                end_tick: abs_tick,
                velocity,
            });
        } else {
            debug!(
                "Orphaned NoteOff for {} ch{} at tick {}..!",
                pitch, ch, abs_tick
            );
        }
    }
}

/// Reads a Standard MIDI File into a song with one instrument per track and channel.
pub fn import_midi_file<P: AsRef<Path>>(path: P) -> Result<Song> {
    let bytes = fs::read(path.as_ref()).map_err(|e| {
        anyhow!(
            "Failed to read MIDI file {}: {}",
            path.as_ref().display(),
            e
        )
    })?;

    let title = path
        .as_ref()
        .file_name()
        .and_then(|s| s.to_str())
        .map(|s| s.to_string());

    midi_bytes_to_song(&bytes, title)
}

pub fn midi_bytes_to_song(bytes: &[u8], title: Option<String>) -> Result<Song> {
    let smf = Smf::parse(bytes).map_err(|e| anyhow!("Failed to parse MIDI: {:?}", e))?;

    let ticks_per_quarter = match smf.header.timing {
        Timing::Metrical(t) => t.as_int() as u64,
        Timing::Timecode(_fps, _subframe) => {
            return Err(anyhow!(
                "SMPTE timecode midi timing is not currently supported..!"
            ));
        }
    };

    debug!("Ticks per quarter note: {}", ticks_per_quarter);
    debug!(
        "MIDI format: {:?}, tracks: {}",
        smf.header.format,
        smf.tracks.len()
    );

    let mut tempo_changes: Vec<(u64, u32)> = Vec::new();
    tempo_changes.push((0u64, DEFAULT_MPQN)); // ~120bpm until a tempo meta appears

    let mut tracks: Vec<TrackNotes> = Vec::with_capacity(smf.tracks.len());
    let mut last_tick_estimate: u64 = 0;

    for (track_idx, track) in smf.tracks.iter().enumerate() {
        let mut notes = TrackNotes::default();
        let mut abs_tick: u64 = 0;

        for event in track.iter() {
            abs_tick = abs_tick.saturating_add(event.delta.as_int() as u64);

            match &event.kind {
                TrackEventKind::Meta(meta) => match meta {
                    MetaMessage::Tempo(micro) => {
                        let mpqn: u32 = micro.as_int();
                        tempo_changes.push((abs_tick, mpqn));
                        debug!(
                            "Tempo change at tick {} -> {} us/qn (track {})",
                            abs_tick, mpqn, track_idx
                        );
                    }
                    MetaMessage::TrackName(bytes) => {
                        if notes.name.is_none() {
                            let name = String::from_utf8_lossy(bytes).into_owned();
                            debug!("Track {} name: {}", track_idx, name);
                            notes.name = Some(name);
                        }
                    }
                    _ => {}
                },
                TrackEventKind::Midi { channel, message } => {
                    let ch: u8 = channel.as_int();

                    match message {
                        MidiMessage::NoteOn { key, vel } => {
                            let velocity: u8 = vel.as_int();

                            if velocity == 0 {
                                notes.close_note(ch, key.as_int(), abs_tick);
                            } else {
                                notes
                                    .open_notes
                                    .entry((ch, key.as_int()))
                                    .or_default()
                                    .push((abs_tick, velocity));
                            }
                        }
                        MidiMessage::NoteOff { key, vel: _ } => {
                            notes.close_note(ch, key.as_int(), abs_tick);
                        }
                        MidiMessage::ProgramChange { program } => {
                            notes.programs.entry(ch).or_insert(program.as_int());
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        }

        last_tick_estimate = last_tick_estimate.max(abs_tick);
        tracks.push(notes);
    }

    let tempo = TempoMap::new(tempo_changes, ticks_per_quarter);
    let mut instruments: Vec<Instrument> = Vec::new();

    for mut notes in tracks.into_iter() {
        let mut unclosed: Vec<(u64, u8, u8, u8)> = std::mem::take(&mut notes.open_notes)
            .into_iter()
            .flat_map(|((ch, pitch), stack)| {
                stack
                    .into_iter()
                    .map(move |(start_tick, velocity)| (start_tick, ch, pitch, velocity))
            })
            .collect();
        unclosed.sort_unstable();

        for (start_tick, ch, pitch, velocity) in unclosed {
            let end_tick = if last_tick_estimate > start_tick {
                last_tick_estimate
            } else {
                start_tick + ticks_per_quarter
            };

            warn!(
                "Unclosed NoteOn for {}, channel: {} at tick: {} auto-closing at: {}..!",
                pitch, ch, start_tick, end_tick
            );

            notes.intervals.entry(ch).or_default().push(NoteInterval {
                pitch,
                start_tick,
                end_tick,
                velocity,
            });
        }

        for (ch, intervals) in notes.intervals.into_iter() {
            let note_events: Vec<NoteEvent> = intervals
                .into_iter()
                .filter(|interval| {
                    if interval.end_tick > interval.start_tick {
                        return true;
                    }
                    debug!(
                        "Skipping zero-length midi note {} at tick {}..!",
                        interval.pitch, interval.start_tick
                    );
                    false
                })
                .map(|interval| NoteEvent {
                    start: tempo.seconds(interval.start_tick),
                    end: tempo.seconds(interval.end_tick),
                    pitch: interval.pitch as i32,
                    velocity: interval.velocity as i32,
                })
                .collect();

            if note_events.is_empty() {
                continue;
            }

            instruments.push(Instrument {
                name: notes.name.clone(),
                program: notes.programs.get(&ch).copied().unwrap_or(0),
                notes: note_events,
            });
        }
    }

    info!(
        "Imported {} instrument(s) with {} notes..!",
        instruments.len(),
        instruments.iter().map(|i| i.notes.len()).sum::<usize>()
    );

    Ok(Song {
        metadata: Metadata {
            title,
            tempo_bpm: Some(tempo.initial_bpm()),
        },
        instruments,
    })
}
