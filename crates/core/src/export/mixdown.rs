//! Offline audio for exports: every note becomes an enveloped sine voice,
//! placed on the same beat grid the frames use.

use std::path::Path;

use crate::timeline::beat_to_time;
use crate::{BeatframeError, Result, TrackData};

const ATTACK: f64 = 0.008;
const DECAY: f64 = 0.06;
const SUSTAIN: f64 = 0.75;
const RELEASE: f64 = 0.15;
/// Headroom before the soft clipper.
const VOICE_LEVEL: f32 = 0.3;

/// Frames rendered per block while streaming to disk.
const BLOCK_FRAMES: usize = 4_096;

#[derive(Debug, Clone, Copy, PartialEq)]
struct NoteVoice {
    start: f64,
    held: f64,
    amplitude: f32,
    omega: f64,
}

impl NoteVoice {
    /// Frames `[first, last)` this voice can sound in, before the release
    /// tail has fully decayed.
    fn frame_span(&self, rate: f64) -> (u64, u64) {
        let first = (self.start * rate).ceil().max(0.0) as u64;
        let last = ((self.start + self.held + RELEASE) * rate).ceil().max(0.0) as u64;
        (first, last)
    }
}

/// Offline render of a set of tracks. Samples are produced on demand in
/// blocks, so memory stays flat however long the export is.
#[derive(Debug, Clone, PartialEq)]
pub struct Mixdown {
    sample_rate: u32,
    total_frames: u64,
    voices: Vec<NoteVoice>,
}

impl Mixdown {
    /// Plans `duration_seconds` of audio for `tracks` at `bpm`. Muted tracks
    /// are skipped.
    pub fn new(tracks: &[TrackData], bpm: f64, duration_seconds: f64, sample_rate: u32) -> Self {
        let sample_rate = sample_rate.max(1);
        let total_frames = (duration_seconds.max(0.0) * sample_rate as f64).ceil() as u64;
        let voices = tracks
            .iter()
            .filter(|track| !track.muted)
            .flat_map(|track| {
                track.notes.iter().map(move |note| NoteVoice {
                    start: beat_to_time(note.start_beat, bpm),
                    held: beat_to_time(note.length_beats.max(0.0), bpm),
                    amplitude: note.velocity as f32 / 127.0 * track.gain * VOICE_LEVEL,
                    omega: 2.0 * std::f64::consts::PI * note.frequency() as f64,
                })
            })
            .collect();
        Self {
            sample_rate,
            total_frames,
            voices,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frames(&self) -> u64 {
        self.total_frames
    }

    /// Fills `out` with mono frames starting at `first_frame`, soft-clipped
    /// with `tanh`. Frames past the end are silent.
    pub fn render_block(&self, first_frame: u64, out: &mut [f32]) {
        out.fill(0.0);
        let rate = self.sample_rate as f64;
        let block_end = (first_frame + out.len() as u64).min(self.total_frames);

        for voice in &self.voices {
            let (first, last) = voice.frame_span(rate);
            let from = first.max(first_frame);
            let to = last.min(block_end);
            for index in from..to {
                let t = index as f64 / rate - voice.start;
                let level = envelope(t, voice.held) as f32;
                out[(index - first_frame) as usize] +=
                    voice.amplitude * level * (voice.omega * t).sin() as f32;
            }
        }

        for sample in out.iter_mut() {
            *sample = sample.tanh();
        }
    }

    /// Streams the whole mixdown to `path` as 16-bit stereo PCM and returns
    /// the number of frames written.
    pub fn write_wav(&self, path: &Path) -> Result<u64> {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).map_err(wav_error)?;
        let mut block = vec![0.0_f32; BLOCK_FRAMES];
        let mut first = 0;
        while first < self.total_frames {
            let len = (self.total_frames - first).min(BLOCK_FRAMES as u64) as usize;
            let chunk = &mut block[..len];
            self.render_block(first, chunk);
            for sample in chunk.iter() {
                let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                writer.write_sample(value).map_err(wav_error)?;
                writer.write_sample(value).map_err(wav_error)?;
            }
            first += len as u64;
        }
        writer.finalize().map_err(wav_error)?;
        tracing::debug!(path = %path.display(), frames = self.total_frames, "mixdown written");
        Ok(self.total_frames)
    }
}

/// Envelope level `t` seconds after note-on for a note held `held` seconds.
fn envelope(t: f64, held: f64) -> f64 {
    let sustained = |t: f64| {
        if t < ATTACK {
            t / ATTACK
        } else if t < ATTACK + DECAY {
            1.0 - (1.0 - SUSTAIN) * (t - ATTACK) / DECAY
        } else {
            SUSTAIN
        }
    };
    if t < 0.0 {
        0.0
    } else if t < held {
        sustained(t)
    } else {
        let released = t - held;
        if released >= RELEASE {
            0.0
        } else {
            sustained(held) * (1.0 - released / RELEASE)
        }
    }
}

fn wav_error(err: hound::Error) -> BeatframeError {
    match err {
        hound::Error::IoError(err) => BeatframeError::Io(err),
        other => BeatframeError::Encode(format!("wav mixdown: {other}")),
    }
}
