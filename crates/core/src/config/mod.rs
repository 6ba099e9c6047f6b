use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{BeatframeError, Result};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub transport: TransportConfig,
    pub export: ExportSettings,
}

impl AppConfig {
    /// Reads a JSON configuration file. Missing sections fall back to their
    /// defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.audio.sample_rate == 0 || self.export.sample_rate == 0 {
            return Err(BeatframeError::msg("sample rate must be greater than zero"));
        }
        if self.audio.channels == 0 {
            return Err(BeatframeError::msg("channel count must be greater than zero"));
        }
        if !(self.transport.lookahead_ms >= 0.0) {
            return Err(BeatframeError::msg("lookahead must not be negative"));
        }
        if !(self.transport.project_max_beat > 0.0) {
            return Err(BeatframeError::msg("project length must be positive"));
        }
        if !(self.transport.initial_bpm > 0.0) || !self.transport.initial_bpm.is_finite() {
            return Err(BeatframeError::InvalidBpm(self.transport.initial_bpm));
        }
        if self.transport.tick_hz == 0 {
            return Err(BeatframeError::msg("tick rate must be greater than zero"));
        }
        if self.export.progress_every_frames == 0 {
            return Err(BeatframeError::msg(
                "progress cadence must be at least one frame",
            ));
        }
        if !(self.export.max_duration_seconds > 0.0) || self.export.max_frame_pixels == 0 {
            return Err(BeatframeError::msg("export limits must be positive"));
        }
        Ok(())
    }
}

/// Configuration specific to the audio subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
        }
    }
}

/// Realtime transport tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub initial_bpm: f64,
    /// Scheduling margin added to the device clock when starting audio.
    pub lookahead_ms: f64,
    /// Upper bound for loop points, in beats.
    pub project_max_beat: f64,
    /// Host tick cadence used by the CLI driver.
    pub tick_hz: u32,
}

impl TransportConfig {
    pub fn lookahead_seconds(&self) -> f64 {
        self.lookahead_ms / 1000.0
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            initial_bpm: 120.0,
            lookahead_ms: 25.0,
            project_max_beat: 1024.0,
            tick_hz: 60,
        }
    }
}

/// Options for the offline export pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    pub output_dir: PathBuf,
    pub ffmpeg_path: PathBuf,
    pub sample_rate: u32,
    pub crf: u8,
    pub preset: String,
    /// Emit a progress event at most once per this many frames.
    pub progress_every_frames: u64,
    pub keep_intermediate_audio: bool,
    /// Longest export accepted, in seconds.
    pub max_duration_seconds: f64,
    /// Largest `width * height` accepted for one frame.
    pub max_frame_pixels: u64,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("exports"),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            sample_rate: 48_000,
            crf: 20,
            preset: "medium".to_string(),
            progress_every_frames: 1,
            keep_intermediate_audio: false,
            max_duration_seconds: 4.0 * 60.0 * 60.0,
            max_frame_pixels: 7_680 * 4_320,
        }
    }
}
