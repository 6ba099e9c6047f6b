//! Deterministic offline export.
//!
//! Frames are stepped on a virtual clock (`beat = time_to_beat(f / fps)`),
//! never on wall time, so two runs of the same [`ExportRequest`] see the
//! same beats. Audio is rendered separately from the same tracks and BPM,
//! then muxed by the encoder.

mod encoder;
mod jobs;
mod mixdown;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use encoder::{
    ffmpeg_args, EncodeSpec, EncoderFactory, FfmpegEncoder, FfmpegEncoderFactory, VideoEncoder,
};
pub use jobs::{
    ExportService, JobEvent, JobId, JobRecorder, JobSnapshot, JobStatus, JobTable, JobTicket,
    ProgressSink,
};
pub use mixdown::Mixdown;

use crate::config::ExportSettings;
use crate::render::{FrameContext, PostProcessing, VisualRenderer};
use crate::timeline::{time_to_beat, validate_bpm};
use crate::{BeatframeError, Result, TrackData};

/// Project description for one export. Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRequest {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    #[serde(alias = "durationSeconds")]
    pub duration_seconds: f64,
    pub bpm: f64,
    #[serde(default)]
    pub tracks: Vec<TrackData>,
    #[serde(default, alias = "postProcessing")]
    pub post_processing: Option<PostProcessing>,
}

impl ExportRequest {
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(BeatframeError::InvalidRequest(
                "resolution must be greater than zero".to_string(),
            ));
        }
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(BeatframeError::InvalidRequest(format!(
                "resolution {}x{} must have even width and height",
                self.width, self.height
            )));
        }
        if self.fps == 0 {
            return Err(BeatframeError::InvalidRequest(
                "fps must be greater than zero".to_string(),
            ));
        }
        if !(self.duration_seconds > 0.0) || !self.duration_seconds.is_finite() {
            return Err(BeatframeError::InvalidRequest(
                "duration must be a positive number of seconds".to_string(),
            ));
        }
        validate_bpm(self.bpm)
            .map_err(|err| BeatframeError::InvalidRequest(err.to_string()))
    }

    /// [`validate`](Self::validate) plus the configured size limits.
    pub fn validate_within(&self, settings: &ExportSettings) -> Result<()> {
        self.validate()?;
        let pixels = self.width as u64 * self.height as u64;
        if pixels > settings.max_frame_pixels {
            return Err(BeatframeError::InvalidRequest(format!(
                "resolution {}x{} exceeds the limit of {} pixels per frame",
                self.width, self.height, settings.max_frame_pixels
            )));
        }
        if self.duration_seconds > settings.max_duration_seconds {
            return Err(BeatframeError::InvalidRequest(format!(
                "duration {}s exceeds the limit of {}s",
                self.duration_seconds, settings.max_duration_seconds
            )));
        }
        Ok(())
    }

    pub fn plan(&self) -> FramePlan {
        FramePlan::new(self.fps, self.bpm, self.duration_seconds)
    }
}

/// Frame-stepped timeline for one export.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FramePlan {
    pub fps: u32,
    pub bpm: f64,
    pub total_frames: u64,
}

impl FramePlan {
    pub fn new(fps: u32, bpm: f64, duration_seconds: f64) -> Self {
        Self {
            fps,
            bpm,
            total_frames: (duration_seconds * fps as f64).ceil() as u64,
        }
    }

    pub fn time_at(&self, frame: u64) -> f64 {
        frame as f64 / self.fps as f64
    }

    pub fn beat_at(&self, frame: u64) -> f64 {
        time_to_beat(self.time_at(frame), self.bpm)
    }

    /// `floor(frame * 100 / total_frames)`.
    pub fn percent_at(&self, frame: u64) -> u8 {
        if self.total_frames == 0 {
            return 100;
        }
        (frame.min(self.total_frames) * 100 / self.total_frames) as u8
    }

    /// `(frame, beat)` pairs in frame order.
    pub fn frames(&self) -> impl Iterator<Item = (u64, f64)> + '_ {
        (0..self.total_frames).map(move |frame| (frame, self.beat_at(frame)))
    }
}

/// Runs one export to completion on the calling thread.
#[derive(Clone)]
pub struct ExportRenderer {
    renderer: Arc<dyn VisualRenderer>,
    encoders: Arc<dyn EncoderFactory>,
    settings: ExportSettings,
}

impl ExportRenderer {
    pub fn new(
        renderer: Arc<dyn VisualRenderer>,
        encoders: Arc<dyn EncoderFactory>,
        settings: ExportSettings,
    ) -> Self {
        Self {
            renderer,
            encoders,
            settings,
        }
    }

    pub fn video_path(&self, id: JobId) -> PathBuf {
        self.settings.output_dir.join(format!("{id}.mp4"))
    }

    pub fn audio_path(&self, id: JobId) -> PathBuf {
        self.settings.output_dir.join(format!("{id}.wav"))
    }

    /// Renders audio, then every frame in order, and returns the finished
    /// artifact. The first error aborts the remaining frames and removes
    /// whatever was written for this job.
    pub fn run(
        &self,
        request: &ExportRequest,
        id: JobId,
        sink: &mut dyn ProgressSink,
    ) -> Result<PathBuf> {
        request.validate_within(&self.settings)?;
        let plan = request.plan();
        std::fs::create_dir_all(&self.settings.output_dir)?;
        tracing::info!(job = %id, frames = plan.total_frames, "export started");

        let audio_path = self.audio_path(id);
        let video_path = self.video_path(id);
        let result = self.render_and_encode(request, &plan, &audio_path, &video_path, sink);

        if result.is_err() || !self.settings.keep_intermediate_audio {
            remove_artifact(id, &audio_path);
        }
        if result.is_err() {
            remove_artifact(id, &video_path);
        }

        let location = result?;
        sink.report(100, "export complete");
        Ok(location)
    }

    fn render_and_encode(
        &self,
        request: &ExportRequest,
        plan: &FramePlan,
        audio_path: &Path,
        video_path: &Path,
        sink: &mut dyn ProgressSink,
    ) -> Result<PathBuf> {
        sink.report(0, "rendering audio");
        Mixdown::new(
            &request.tracks,
            request.bpm,
            request.duration_seconds,
            self.settings.sample_rate,
        )
        .write_wav(audio_path)?;

        let spec = EncodeSpec {
            width: request.width,
            height: request.height,
            fps: request.fps,
            audio_path: Some(audio_path.to_path_buf()),
            output_path: video_path.to_path_buf(),
            crf: self.settings.crf,
            preset: self.settings.preset.clone(),
            ffmpeg_path: self.settings.ffmpeg_path.clone(),
        };
        self.encode_frames(request, plan, &spec, sink)
    }

    fn encode_frames(
        &self,
        request: &ExportRequest,
        plan: &FramePlan,
        spec: &EncodeSpec,
        sink: &mut dyn ProgressSink,
    ) -> Result<PathBuf> {
        let mut encoder = self.encoders.open(spec)?;
        let post = request.post_processing.clone().unwrap_or_default();
        let every = self.settings.progress_every_frames.max(1);
        let expected = crate::render::FrameBuffer::byte_len(request.width, request.height);

        for (frame, beat) in plan.frames() {
            let ctx = FrameContext {
                frame,
                beat,
                tracks: &request.tracks,
                width: request.width,
                height: request.height,
                post: &post,
            };
            let buffer = self.renderer.render(&ctx).map_err(|err| match err {
                BeatframeError::RenderFrame { .. } => err,
                other => BeatframeError::RenderFrame {
                    frame,
                    reason: other.to_string(),
                },
            })?;
            if buffer.width != request.width
                || buffer.height != request.height
                || buffer.data.len() != expected
            {
                return Err(BeatframeError::RenderFrame {
                    frame,
                    reason: format!(
                        "renderer returned {}x{} ({} bytes), expected {}x{}",
                        buffer.width,
                        buffer.height,
                        buffer.data.len(),
                        request.width,
                        request.height
                    ),
                });
            }
            encoder.write_frame(&buffer)?;

            if frame % every == 0 {
                sink.report(
                    plan.percent_at(frame),
                    &format!("frame {} of {}", frame + 1, plan.total_frames),
                );
            }
        }

        encoder.finish()
    }
}

fn remove_artifact(id: JobId, path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(job = %id, path = %path.display(), "removed export file"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::warn!(job = %id, path = %path.display(), error = %err, "could not remove file")
        }
    }
}

impl std::fmt::Debug for ExportRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportRenderer")
            .field("settings", &self.settings)
            .finish()
    }
}
