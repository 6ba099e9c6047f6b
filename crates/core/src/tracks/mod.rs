use serde::{Deserialize, Serialize};

/// A single note on a track, positioned in beats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    /// MIDI key number, 69 = A4.
    pub pitch: u8,
    #[serde(default = "default_velocity")]
    pub velocity: u8,
    pub start_beat: f64,
    pub length_beats: f64,
}

fn default_velocity() -> u8 {
    100
}

impl Note {
    pub fn end_beat(&self) -> f64 {
        self.start_beat + self.length_beats.max(0.0)
    }

    pub fn is_active_at(&self, beat: f64) -> bool {
        beat >= self.start_beat && beat < self.end_beat()
    }

    pub fn frequency(&self) -> f32 {
        440.0 * 2.0_f32.powf((self.pitch as f32 - 69.0) / 12.0)
    }
}

/// Track definition shared by the visual layer and the offline mixdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackData {
    pub name: String,
    #[serde(default = "default_color")]
    pub color: [u8; 3],
    #[serde(default = "default_gain")]
    pub gain: f32,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub notes: Vec<Note>,
}

fn default_color() -> [u8; 3] {
    [96, 160, 255]
}

fn default_gain() -> f32 {
    1.0
}

impl TrackData {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: default_color(),
            gain: default_gain(),
            muted: false,
            notes: Vec::new(),
        }
    }

    pub fn with_note(mut self, pitch: u8, start_beat: f64, length_beats: f64) -> Self {
        self.notes.push(Note {
            pitch,
            velocity: default_velocity(),
            start_beat,
            length_beats,
        });
        self
    }

    pub fn active_notes(&self, beat: f64) -> impl Iterator<Item = &Note> {
        self.notes.iter().filter(move |note| note.is_active_at(beat))
    }

    /// Beat at which the last note ends.
    pub fn max_beat(&self) -> f64 {
        self.notes
            .iter()
            .map(Note::end_beat)
            .fold(0.0, f64::max)
    }
}
