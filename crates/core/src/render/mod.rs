//! Boundary to the visual layer. The export pipeline only relies on the
//! [`VisualRenderer`] contract; [`PulseRenderer`] is a small deterministic
//! implementation used by the CLI and tests.

use serde::{Deserialize, Serialize};

use crate::{BeatframeError, Result, TrackData};

/// Optional post-processing applied by the visual layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostProcessing {
    /// Multiplier applied to every colour channel.
    pub brightness: f32,
    /// Edge darkening strength in `[0, 1]`.
    pub vignette: f32,
    /// How strongly the background flashes on each beat.
    pub pulse: f32,
}

impl Default for PostProcessing {
    fn default() -> Self {
        Self {
            brightness: 1.0,
            vignette: 0.0,
            pulse: 0.6,
        }
    }
}

/// Packed RGBA8 pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBuffer {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl FrameBuffer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; Self::byte_len(width, height)],
        }
    }

    pub fn byte_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * 4
    }

    pub fn is_well_formed(&self) -> bool {
        self.data.len() == Self::byte_len(self.width, self.height)
    }

    fn put(&mut self, x: u32, y: u32, rgb: [f32; 3]) {
        let index = (y as usize * self.width as usize + x as usize) * 4;
        for (channel, value) in rgb.iter().enumerate() {
            self.data[index + channel] = value.clamp(0.0, 255.0) as u8;
        }
        self.data[index + 3] = 255;
    }
}

/// Everything the visual layer sees for one frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameContext<'a> {
    pub frame: u64,
    pub beat: f64,
    pub tracks: &'a [TrackData],
    pub width: u32,
    pub height: u32,
    pub post: &'a PostProcessing,
}

/// Pure function from beat and track data to pixels. Identical contexts must
/// produce identical buffers.
pub trait VisualRenderer: Send + Sync {
    fn render(&self, ctx: &FrameContext<'_>) -> Result<FrameBuffer>;
}

/// Draws a beat-synchronised background flash and one column per track that
/// lights up while the track has sounding notes.
#[derive(Debug, Default, Clone, Copy)]
pub struct PulseRenderer;

impl PulseRenderer {
    pub fn new() -> Self {
        Self
    }
}

impl VisualRenderer for PulseRenderer {
    fn render(&self, ctx: &FrameContext<'_>) -> Result<FrameBuffer> {
        if ctx.width == 0 || ctx.height == 0 {
            return Err(BeatframeError::RenderFrame {
                frame: ctx.frame,
                reason: "zero-sized frame".to_string(),
            });
        }

        let mut buffer = FrameBuffer::new(ctx.width, ctx.height);
        let phase = ctx.beat.rem_euclid(1.0) as f32;
        let flash = (1.0 - phase).powi(3) * ctx.post.pulse;
        let base = 18.0 + 60.0 * flash;

        let columns = ctx.tracks.len().max(1) as u32;
        let column_width = (ctx.width / columns).max(1);
        let lit: Vec<f32> = ctx
            .tracks
            .iter()
            .map(|track| {
                if track.muted {
                    return 0.0;
                }
                track
                    .active_notes(ctx.beat)
                    .map(|note| note.velocity as f32 / 127.0)
                    .fold(0.0, f32::max)
            })
            .collect();

        let cx = ctx.width as f32 * 0.5;
        let cy = ctx.height as f32 * 0.5;
        let max_dist = (cx * cx + cy * cy).sqrt().max(1.0);

        for y in 0..ctx.height {
            for x in 0..ctx.width {
                let mut rgb = [base, base, base * 1.2];
                let column = ((x / column_width) as usize).min(lit.len().saturating_sub(1));
                if let (Some(level), Some(track)) = (lit.get(column), ctx.tracks.get(column)) {
                    // Bars grow upwards from the bottom edge.
                    let bar_top = ctx.height as f32 * (1.0 - level);
                    if *level > 0.0 && y as f32 >= bar_top {
                        for (channel, value) in rgb.iter_mut().enumerate() {
                            *value = track.color[channel] as f32 * (0.5 + 0.5 * level);
                        }
                    }
                }

                let dx = x as f32 - cx;
                let dy = y as f32 - cy;
                let falloff = 1.0 - ctx.post.vignette * ((dx * dx + dy * dy).sqrt() / max_dist);
                for value in &mut rgb {
                    *value *= ctx.post.brightness * falloff.max(0.0);
                }
                buffer.put(x, y, rgb);
            }
        }

        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(beat: f64, tracks: &[TrackData]) -> FrameBuffer {
        let post = PostProcessing::default();
        PulseRenderer
            .render(&FrameContext {
                frame: 0,
                beat,
                tracks,
                width: 16,
                height: 8,
                post: &post,
            })
            .unwrap()
    }

    #[test]
    fn output_is_deterministic_and_sized() {
        let tracks = vec![TrackData::new("a").with_note(60, 0.0, 2.0)];
        let first = render(0.25, &tracks);
        let second = render(0.25, &tracks);
        assert!(first.is_well_formed());
        assert_eq!(first, second);
    }

    #[test]
    fn beat_changes_the_picture() {
        let tracks = vec![TrackData::new("a").with_note(60, 0.0, 1.0)];
        assert_ne!(render(0.0, &tracks), render(1.5, &tracks));
    }

    #[test]
    fn zero_sized_frames_are_rejected() {
        let post = PostProcessing::default();
        let err = PulseRenderer
            .render(&FrameContext {
                frame: 7,
                beat: 0.0,
                tracks: &[],
                width: 0,
                height: 4,
                post: &post,
            })
            .unwrap_err();
        assert!(matches!(err, BeatframeError::RenderFrame { frame: 7, .. }));
    }
}
