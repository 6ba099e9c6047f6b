//! Device-clock playback scheduling for the session's decoded audio asset.

mod decode;
mod device;
#[cfg(feature = "cpal")]
mod output;

use std::sync::Arc;

pub use decode::{decode_wav, DecodedAudio};
pub use device::{AudioDevice, DeviceClock, NullDevice, PowerState, VirtualDevice, VoiceId};
#[cfg(feature = "cpal")]
pub use output::CpalDevice;

#[cfg(test)]
pub(crate) use decode::wav_bytes;

use crate::config::AudioConfig;
use crate::{BeatframeError, Result};

/// Opens the default hardware output when built with the `cpal` feature.
/// Otherwise, or when no device can be opened, playback runs against a
/// wall-clock [`VirtualDevice`] that keeps real timing but is silent.
pub fn open_output(config: &AudioConfig) -> Box<dyn AudioDevice> {
    #[cfg(feature = "cpal")]
    {
        match CpalDevice::open_default(config.sample_rate, config.channels) {
            Ok(device) => return Box::new(device),
            Err(err) => tracing::warn!(error = %err, "no audio output; using a silent device"),
        }
    }
    #[cfg(not(feature = "cpal"))]
    tracing::info!("built without audio output support; using a silent device");

    Box::new(VirtualDevice::new(
        DeviceClock::Monotonic,
        config.sample_rate,
        config.channels,
    ))
}

/// Observable scheduling state. Exactly one holds at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Playing,
    Paused,
}

/// Why a scheduled playback ended. Pausing is not an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEnd {
    /// The buffer played out.
    Finished,
    /// Playback was stopped or its buffer replaced.
    Stopped,
}

/// Where the current (or last) playback was pinned to the device clock.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlaybackAnchor {
    pub device_start_time: f64,
    pub buffer_start_offset: f64,
    /// Set if and only if the scheduler is paused.
    pub paused_at_device_time: Option<f64>,
}

impl PlaybackAnchor {
    /// Buffer position at device time `at`, before modulo reduction.
    fn position_at(&self, at: f64) -> f64 {
        self.buffer_start_offset + (at - self.device_start_time).max(0.0)
    }
}

type EndListener = Box<dyn FnMut(PlaybackEnd) + Send>;

/// Owns the decoded asset and keeps at most one playback path alive on the
/// output device.
pub struct AudioScheduler {
    device: Box<dyn AudioDevice>,
    audio: Option<Arc<DecodedAudio>>,
    state: SchedulerState,
    anchor: PlaybackAnchor,
    voice: Option<VoiceId>,
    seek_offset: f64,
    end_listener: Option<EndListener>,
}

impl AudioScheduler {
    pub fn new(device: Box<dyn AudioDevice>) -> Self {
        Self {
            device,
            audio: None,
            state: SchedulerState::Stopped,
            anchor: PlaybackAnchor::default(),
            voice: None,
            seek_offset: 0.0,
            end_listener: None,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn anchor(&self) -> PlaybackAnchor {
        self.anchor
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    pub fn duration(&self) -> Option<f64> {
        self.audio.as_ref().map(|audio| audio.duration_seconds)
    }

    pub fn device_now(&self) -> f64 {
        self.device.now()
    }

    pub fn power_state(&self) -> PowerState {
        self.device.power_state()
    }

    pub fn resume_device(&mut self) -> Result<()> {
        self.device.resume()
    }

    pub fn on_playback_end<F>(&mut self, listener: F)
    where
        F: FnMut(PlaybackEnd) + Send + 'static,
    {
        self.end_listener = Some(Box::new(listener));
    }

    /// Decodes `bytes` and makes it the scheduled asset. Whatever was playing
    /// or paused is stopped first, and a decode failure leaves no asset
    /// loaded.
    pub fn load_audio(&mut self, bytes: &[u8]) -> Result<f64> {
        self.unload();
        let decoded = decode_wav(bytes)?;
        let duration = decoded.duration_seconds;
        self.audio = Some(Arc::new(decoded));
        tracing::info!(duration, "audio loaded");
        Ok(duration)
    }

    pub fn unload(&mut self) {
        self.stop();
        self.audio = None;
    }

    /// Schedules playback to begin at device time `at`.
    ///
    /// When resuming from a pause the offset is derived from the pause
    /// anchor and `buffer_offset` is ignored.
    pub fn play(&mut self, at: f64, buffer_offset: f64) -> Result<()> {
        let audio = self.audio.clone().ok_or(BeatframeError::AudioNotLoaded)?;
        let duration = audio.duration_seconds;

        let requested = match self.anchor.paused_at_device_time {
            Some(paused_at) if self.state == SchedulerState::Paused => {
                self.anchor.position_at(paused_at).rem_euclid(duration)
            }
            _ => buffer_offset,
        };
        let offset = if requested.is_finite() {
            requested.clamp(0.0, duration)
        } else {
            0.0
        };

        self.release_voice();
        match self.device.schedule(audio, at, offset) {
            Ok(voice) => {
                self.voice = Some(voice);
                self.anchor = PlaybackAnchor {
                    device_start_time: at,
                    buffer_start_offset: offset,
                    paused_at_device_time: None,
                };
                self.state = SchedulerState::Playing;
                tracing::debug!(at, offset, "playback scheduled");
                Ok(())
            }
            Err(err) => {
                self.park(offset);
                Err(err)
            }
        }
    }

    /// Plays from the paused position or the last seek offset.
    pub fn resume(&mut self, at: f64) -> Result<()> {
        self.play(at, self.seek_offset)
    }

    /// Halts device playback and returns the position it reached, measured
    /// on the device clock and wrapped into the buffer.
    ///
    /// A buffer that already played out still pauses at the wrapped
    /// position, so the next `play` continues from there. Pausing never
    /// reports an end.
    pub fn pause(&mut self) -> f64 {
        if self.state != SchedulerState::Playing {
            return self.current_playback_time();
        }

        let now = self.device.now();
        self.release_voice();
        self.anchor.paused_at_device_time = Some(now);
        self.state = SchedulerState::Paused;
        let position = self.current_playback_time();
        tracing::debug!(position, "playback paused");
        position
    }

    /// Halts playback and rewinds to the start of the buffer.
    pub fn stop(&mut self) {
        let had_voice = self.voice.is_some() && self.state == SchedulerState::Playing;
        self.release_voice();
        self.park(0.0);
        if had_voice {
            self.emit_end(PlaybackEnd::Stopped);
        }
    }

    /// Repositions the next playback. Not valid while actively playing.
    pub fn seek(&mut self, offset: f64) -> Result<()> {
        if self.state == SchedulerState::Playing {
            return Err(BeatframeError::SchedulingConflict(
                "seek while playing; stop first or use seek_while_playing",
            ));
        }
        self.park(self.clamp_offset(offset));
        Ok(())
    }

    /// Stops the current playback and immediately reschedules it at `at`
    /// from `offset`.
    pub fn seek_while_playing(&mut self, offset: f64, at: f64) -> Result<()> {
        self.release_voice();
        self.park(self.clamp_offset(offset));
        self.play(at, self.seek_offset)
    }

    /// Position within the buffer, always in `[0, duration)`.
    pub fn current_playback_time(&self) -> f64 {
        let Some(duration) = self.duration() else {
            return self.seek_offset;
        };
        let position = match (self.state, self.anchor.paused_at_device_time) {
            (SchedulerState::Playing, _) => self.anchor.position_at(self.device.now()),
            (SchedulerState::Paused, Some(paused_at)) => self.anchor.position_at(paused_at),
            _ => self.seek_offset,
        };
        position.rem_euclid(duration)
    }

    /// Device-backed "currently playing" predicate.
    pub fn is_playing(&self) -> bool {
        self.state == SchedulerState::Playing
            && self
                .voice
                .map(|voice| self.device.is_voice_active(voice))
                .unwrap_or(false)
    }

    /// Detects a buffer that played out on its own.
    pub fn poll(&mut self) -> Option<PlaybackEnd> {
        if self.state != SchedulerState::Playing || self.is_playing() {
            return None;
        }
        self.voice = None;
        self.park(0.0);
        tracing::debug!("playback finished");
        self.emit_end(PlaybackEnd::Finished);
        Some(PlaybackEnd::Finished)
    }

    fn clamp_offset(&self, offset: f64) -> f64 {
        let offset = if offset.is_finite() { offset.max(0.0) } else { 0.0 };
        match self.duration() {
            Some(duration) => offset.min(duration),
            None => offset,
        }
    }

    fn release_voice(&mut self) {
        if let Some(voice) = self.voice.take() {
            self.device.stop_voice(voice);
        }
    }

    fn park(&mut self, offset: f64) {
        self.state = SchedulerState::Stopped;
        self.seek_offset = offset;
        self.anchor = PlaybackAnchor {
            device_start_time: 0.0,
            buffer_start_offset: offset,
            paused_at_device_time: None,
        };
    }

    fn emit_end(&mut self, end: PlaybackEnd) {
        if let Some(listener) = self.end_listener.as_mut() {
            listener(end);
        }
    }
}

impl std::fmt::Debug for AudioScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioScheduler")
            .field("state", &self.state)
            .field("anchor", &self.anchor)
            .field("duration", &self.duration())
            .field("seek_offset", &self.seek_offset)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    fn scheduler(seconds: f64) -> (AudioScheduler, VirtualDevice) {
        let device = VirtualDevice::manual(1_000);
        let mut scheduler = AudioScheduler::new(Box::new(device.clone()));
        scheduler.load_audio(&wav_bytes(seconds, 1_000)).unwrap();
        (scheduler, device)
    }

    #[test]
    fn resume_after_pause_lands_on_paused_sample() {
        let (mut scheduler, device) = scheduler(10.0);
        device.advance(1.0);
        scheduler.play(1.0, 1.5).unwrap();

        device.advance(2.0);
        let paused = scheduler.pause();
        assert!((paused - 3.5).abs() < 1e-9);
        assert_eq!(scheduler.state(), SchedulerState::Paused);
        assert!(scheduler.anchor().paused_at_device_time.is_some());

        // A long pause must not shift the resume point.
        device.advance(30.0);
        scheduler.play(device.now(), 1.5).unwrap();
        assert!((scheduler.anchor().buffer_start_offset - 3.5).abs() < 1e-9);
        assert!(scheduler.anchor().paused_at_device_time.is_none());
    }

    #[test]
    fn pause_past_buffer_end_wraps_resume_offset() {
        let ends = Arc::new(Mutex::new(Vec::new()));
        let sink = ends.clone();
        let (mut scheduler, device) = scheduler(10.0);
        scheduler.on_playback_end(move |end| sink.lock().push(end));
        scheduler.play(0.0, 9.0).unwrap();

        device.advance(2.0);
        assert!((scheduler.pause() - 1.0).abs() < 1e-9);
        assert_eq!(scheduler.state(), SchedulerState::Paused);
        assert!(ends.lock().is_empty());

        scheduler.play(device.now(), 9.0).unwrap();
        assert!((scheduler.anchor().buffer_start_offset - 1.0).abs() < 1e-9);
    }

    #[test]
    fn output_callback_drives_the_device_clock() {
        let device = VirtualDevice::new(DeviceClock::SampleCounted, 1_000, 2);
        let mut scheduler = AudioScheduler::new(Box::new(device.clone()));
        scheduler.load_audio(&wav_bytes(0.5, 1_000)).unwrap();
        scheduler.play(0.0, 0.0).unwrap();

        let mut block = vec![0.0_f32; 2 * 128];
        device.render(&mut block);
        assert!(scheduler.is_playing());
        assert!((scheduler.current_playback_time() - 0.128).abs() < 1e-9);

        for _ in 0..4 {
            device.render(&mut block);
        }
        assert_eq!(scheduler.poll(), Some(PlaybackEnd::Finished));
    }

    #[test]
    fn fallback_output_keeps_configured_format() {
        let config = AudioConfig::default();
        let device = open_output(&config);
        assert_eq!(device.sample_rate(), config.sample_rate);
        assert_eq!(device.power_state(), PowerState::Running);
    }

    #[test]
    fn pause_inside_lookahead_window_keeps_offset() {
        let (mut scheduler, device) = scheduler(4.0);
        scheduler.play(0.05, 2.0).unwrap();
        device.advance(0.01);
        assert!((scheduler.pause() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn offsets_are_clamped_and_positions_stay_in_range() {
        let (mut scheduler, device) = scheduler(2.0);
        scheduler.play(0.0, -5.0).unwrap();
        assert_eq!(scheduler.anchor().buffer_start_offset, 0.0);

        scheduler.play(device.now(), 10.0).unwrap();
        assert_eq!(scheduler.anchor().buffer_start_offset, 2.0);
        let position = scheduler.current_playback_time();
        assert!((0.0..2.0).contains(&position));
    }

    #[test]
    fn seek_while_playing_is_a_conflict() {
        let (mut scheduler, device) = scheduler(5.0);
        scheduler.play(0.0, 0.0).unwrap();
        assert!(matches!(
            scheduler.seek(1.0),
            Err(BeatframeError::SchedulingConflict(_))
        ));

        scheduler.seek_while_playing(2.5, device.now() + 0.02).unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Playing);
        assert_eq!(scheduler.anchor().buffer_start_offset, 2.5);
        assert_eq!(device.active_voices(), 1);
    }

    #[test]
    fn seek_when_stopped_positions_next_resume() {
        let (mut scheduler, device) = scheduler(5.0);
        scheduler.seek(1.25).unwrap();
        assert!((scheduler.current_playback_time() - 1.25).abs() < 1e-12);
        scheduler.resume(device.now()).unwrap();
        assert_eq!(scheduler.anchor().buffer_start_offset, 1.25);
    }

    #[test]
    fn stop_resets_to_start_and_fires_end() {
        let ends = Arc::new(Mutex::new(Vec::new()));
        let sink = ends.clone();
        let (mut scheduler, device) = scheduler(5.0);
        scheduler.on_playback_end(move |end| sink.lock().push(end));

        scheduler.play(0.0, 2.0).unwrap();
        device.advance(1.0);
        scheduler.pause();
        assert!(ends.lock().is_empty(), "pause must not report an end");

        scheduler.resume(device.now()).unwrap();
        scheduler.stop();
        assert_eq!(ends.lock().as_slice(), &[PlaybackEnd::Stopped]);
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert_eq!(scheduler.current_playback_time(), 0.0);
        assert_eq!(device.active_voices(), 0);
    }

    #[test]
    fn natural_end_is_reported_once() {
        let ends = Arc::new(Mutex::new(Vec::new()));
        let sink = ends.clone();
        let (mut scheduler, device) = scheduler(1.0);
        scheduler.on_playback_end(move |end| sink.lock().push(end));
        scheduler.play(0.0, 0.0).unwrap();
        device.advance(1.5);

        assert_eq!(scheduler.poll(), Some(PlaybackEnd::Finished));
        assert_eq!(scheduler.poll(), None);
        assert_eq!(ends.lock().as_slice(), &[PlaybackEnd::Finished]);
    }

    #[test]
    fn loading_replaces_inflight_playback() {
        let (mut scheduler, device) = scheduler(5.0);
        scheduler.play(0.0, 0.0).unwrap();
        assert_eq!(device.active_voices(), 1);

        scheduler.load_audio(&wav_bytes(3.0, 1_000)).unwrap();
        assert_eq!(device.active_voices(), 0);
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert_eq!(scheduler.duration(), Some(3.0));
    }

    #[test]
    fn failed_decode_leaves_nothing_loaded() {
        let (mut scheduler, _device) = scheduler(5.0);
        assert!(scheduler.load_audio(b"junk").is_err());
        assert!(!scheduler.has_audio());
        assert!(matches!(
            scheduler.play(0.0, 0.0),
            Err(BeatframeError::AudioNotLoaded)
        ));
    }
}
