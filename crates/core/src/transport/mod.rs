//! Keeps the beat clock and the audio scheduler in agreement. Nothing else
//! in the crate touches both.

use crate::audio::{
    AudioDevice, AudioScheduler, NullDevice, PlaybackEnd, PowerState, SchedulerState,
};
use crate::config::TransportConfig;
use crate::timeline::{validate_bpm, BeatClock, ListenerId, LoopRange, TickOutcome};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Stopped,
    Playing,
    Paused,
}

#[derive(Debug)]
pub struct TransportCoordinator {
    clock: BeatClock,
    audio: AudioScheduler,
    state: TransportState,
    lookahead: f64,
}

impl TransportCoordinator {
    pub fn new(config: &TransportConfig, device: Box<dyn AudioDevice>) -> Result<Self> {
        Ok(Self {
            clock: BeatClock::new(config.initial_bpm, config.project_max_beat)?,
            audio: AudioScheduler::new(device),
            state: TransportState::Stopped,
            lookahead: config.lookahead_seconds(),
        })
    }

    /// Session without audio output; the beat still advances.
    pub fn silent(config: &TransportConfig) -> Result<Self> {
        Self::new(config, Box::new(NullDevice::new()))
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn current_beat(&self) -> f64 {
        self.clock.current_beat()
    }

    pub fn bpm(&self) -> f64 {
        self.clock.bpm()
    }

    pub fn loop_range(&self) -> Option<LoopRange> {
        self.clock.loop_range()
    }

    pub fn audio_state(&self) -> SchedulerState {
        self.audio.state()
    }

    pub fn audio_position(&self) -> f64 {
        self.audio.current_playback_time()
    }

    pub fn subscribe<F>(&mut self, listener: F) -> ListenerId
    where
        F: FnMut(f64) + Send + 'static,
    {
        self.clock.subscribe(listener)
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        self.clock.unsubscribe(id)
    }

    pub fn on_audio_end<F>(&mut self, listener: F)
    where
        F: FnMut(PlaybackEnd) + Send + 'static,
    {
        self.audio.on_playback_end(listener);
    }

    /// Replaces the session audio. A decode failure leaves the transport
    /// usable for visual-only playback.
    pub fn load_audio(&mut self, bytes: &[u8]) -> Result<f64> {
        let result = self.audio.load_audio(bytes);
        if self.state == TransportState::Playing {
            self.start_audio();
        }
        result
    }

    pub fn play(&mut self) {
        if self.state == TransportState::Playing {
            return;
        }
        if let Some(range) = self.clock.loop_range() {
            if !range.contains(self.clock.current_beat()) {
                self.clock.seek_to(range.start);
                // A pause anchor now points at the wrong sample.
                self.park_audio();
            }
        }

        self.start_audio();
        self.clock.play();
        self.transition(TransportState::Playing);
    }

    pub fn pause(&mut self) {
        if self.state != TransportState::Playing {
            return;
        }
        let position = self.audio.pause();
        self.clock.pause();
        tracing::debug!(beat = self.clock.current_beat(), position, "transport paused");
        self.transition(TransportState::Paused);
    }

    pub fn stop(&mut self) {
        self.audio.stop();
        self.clock.stop();
        self.transition(TransportState::Stopped);
    }

    /// Changes tempo without moving the playhead. While playing, both sides
    /// are paused around the change and resumed from the same beat.
    pub fn set_bpm(&mut self, bpm: f64) -> Result<()> {
        validate_bpm(bpm)?;
        if self.state != TransportState::Playing {
            return self.clock.set_bpm(bpm);
        }

        self.audio.pause();
        self.clock.pause();
        self.clock.set_bpm(bpm)?;
        self.start_audio();
        self.clock.play();
        tracing::info!(bpm, beat = self.clock.current_beat(), "tempo changed during playback");
        Ok(())
    }

    pub fn seek_to(&mut self, beat: f64) -> Result<()> {
        self.clock.seek_to(beat);
        if self.state == TransportState::Playing {
            self.restart_audio();
            return Ok(());
        }
        if self.audio.has_audio() {
            let offset = self.clock.beat_to_time(self.clock.current_beat());
            self.audio.seek(offset)?;
        }
        Ok(())
    }

    pub fn set_loop_range(&mut self, start: f64, end: f64) -> Result<LoopRange> {
        self.clock.set_loop_range(start, end)
    }

    pub fn clear_loop(&mut self) {
        self.clock.clear_loop();
    }

    /// Changes the project length once the session's content is known. An
    /// active loop is clamped to the new end or dropped.
    pub fn set_project_max_beat(&mut self, max_beat: f64) -> Result<Option<LoopRange>> {
        self.clock.set_project_max_beat(max_beat)?;
        tracing::debug!(max_beat, looping = ?self.clock.loop_range(), "project length changed");
        Ok(self.clock.loop_range())
    }

    /// Host frame callback. `now` is the host's monotonic time in seconds.
    pub fn tick(&mut self, now: f64) -> TickOutcome {
        let outcome = self.clock.tick(now);
        if self.state == TransportState::Playing {
            if outcome.wrapped {
                tracing::debug!(beat = outcome.beat, "loop wrapped, restarting audio");
                self.restart_audio();
            } else if self.audio.poll() == Some(PlaybackEnd::Finished) {
                tracing::debug!(beat = outcome.beat, "audio ran out; visuals continue");
            }
        }
        outcome
    }

    /// Schedules audio from the clock's current beat, falling back to
    /// visual-only playback when the device cannot play.
    fn start_audio(&mut self) {
        if !self.audio.has_audio() {
            tracing::debug!("no audio loaded; visual-only playback");
            return;
        }

        match self.audio.power_state() {
            PowerState::Running => {}
            PowerState::Suspended => {
                if let Err(err) = self.audio.resume_device() {
                    tracing::warn!(
                        error = %err,
                        "audio device did not resume; visual-only playback"
                    );
                    return;
                }
            }
            PowerState::Unavailable => {
                tracing::warn!("audio device unavailable; visual-only playback");
                return;
            }
        }

        let at = self.audio.device_now() + self.lookahead;
        let offset = self.clock.beat_to_time(self.clock.current_beat());
        if let Err(err) = self.audio.play(at, offset) {
            tracing::warn!(error = %err, "audio scheduling failed; visual-only playback");
        }
    }

    /// Stop-then-reschedule from the clock's current beat.
    fn restart_audio(&mut self) {
        if self.audio.state() != SchedulerState::Playing {
            self.start_audio();
            return;
        }
        let at = self.audio.device_now() + self.lookahead;
        let offset = self.clock.beat_to_time(self.clock.current_beat());
        if let Err(err) = self.audio.seek_while_playing(offset, at) {
            tracing::warn!(error = %err, "audio reschedule failed; visual-only playback");
        }
    }

    fn park_audio(&mut self) {
        if self.audio.has_audio() && self.audio.state() != SchedulerState::Playing {
            let offset = self.clock.beat_to_time(self.clock.current_beat());
            if let Err(err) = self.audio.seek(offset) {
                tracing::warn!(error = %err, "could not reposition audio");
            }
        }
    }

    fn transition(&mut self, next: TransportState) {
        if self.state != next {
            tracing::debug!(from = ?self.state, to = ?next, "transport state");
            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::audio::{wav_bytes, VirtualDevice};
    use crate::BeatframeError;

    fn transport() -> (TransportCoordinator, VirtualDevice) {
        let device = VirtualDevice::manual(1_000);
        let config = TransportConfig {
            initial_bpm: 120.0,
            lookahead_ms: 20.0,
            project_max_beat: 64.0,
            tick_hz: 60,
        };
        let mut transport = TransportCoordinator::new(&config, Box::new(device.clone())).unwrap();
        transport.load_audio(&wav_bytes(30.0, 1_000)).unwrap();
        (transport, device)
    }

    fn advance(
        transport: &mut TransportCoordinator,
        device: &VirtualDevice,
        now: &mut f64,
        dt: f64,
    ) {
        *now += dt;
        device.advance(dt);
        transport.tick(*now);
    }

    #[test]
    fn play_schedules_audio_with_lookahead() {
        let (mut transport, device) = transport();
        transport.seek_to(4.0).unwrap();
        transport.play();

        assert_eq!(transport.state(), TransportState::Playing);
        assert_eq!(transport.audio_state(), SchedulerState::Playing);
        assert_eq!(device.active_voices(), 1);
        assert!((transport.audio.anchor().device_start_time - 0.02).abs() < 1e-12);
        assert!((transport.audio.anchor().buffer_start_offset - 2.0).abs() < 1e-12);
    }

    #[test]
    fn play_outside_loop_jumps_to_loop_start() {
        let (mut transport, _device) = transport();
        transport.set_loop_range(8.0, 12.0).unwrap();
        transport.seek_to(2.0).unwrap();
        transport.play();
        assert_eq!(transport.current_beat(), 8.0);
        assert!((transport.audio.anchor().buffer_start_offset - 4.0).abs() < 1e-12);
    }

    #[test]
    fn shrinking_the_project_clamps_the_loop() {
        let (mut transport, _device) = transport();
        transport.set_loop_range(8.0, 12.0).unwrap();

        let clamped = transport.set_project_max_beat(10.0).unwrap();
        assert_eq!(clamped, Some(LoopRange { start: 8.0, end: 10.0 }));
        assert_eq!(transport.loop_range(), clamped);

        assert_eq!(transport.set_project_max_beat(4.0).unwrap(), None);
        assert!(transport.set_project_max_beat(0.0).is_err());
        assert!(matches!(
            transport.set_loop_range(5.0, 6.0),
            Err(BeatframeError::InvalidLoopRange { .. })
        ));
    }

    #[test]
    fn pause_silences_audio() {
        let (mut transport, device) = transport();
        let mut now = 0.0;
        transport.play();
        transport.tick(now);
        advance(&mut transport, &device, &mut now, 1.0);
        transport.pause();

        assert_eq!(transport.state(), TransportState::Paused);
        assert_eq!(device.active_voices(), 0);
        assert!((transport.current_beat() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn stop_resets_everything() {
        let (mut transport, device) = transport();
        let mut now = 0.0;
        transport.play();
        transport.tick(now);
        advance(&mut transport, &device, &mut now, 1.5);
        transport.stop();

        assert_eq!(transport.state(), TransportState::Stopped);
        assert_eq!(transport.current_beat(), 0.0);
        assert_eq!(transport.audio_state(), SchedulerState::Stopped);
        assert_eq!(device.active_voices(), 0);
        assert_eq!(transport.audio_position(), 0.0);
    }

    #[test]
    fn bpm_change_keeps_beat_and_audio_position() {
        let (mut transport, device) = transport();
        let mut now = 0.0;
        transport.play();
        transport.tick(now);
        advance(&mut transport, &device, &mut now, 1.0);

        let beat = transport.current_beat();
        let audio_before = transport.audio_position();
        transport.set_bpm(60.0).unwrap();

        assert_eq!(transport.current_beat(), beat);
        assert_eq!(transport.state(), TransportState::Playing);
        assert!((transport.audio.anchor().buffer_start_offset - audio_before).abs() < 1e-9);

        transport.tick(now);
        advance(&mut transport, &device, &mut now, 1.0);
        assert!((transport.current_beat() - (beat + 1.0)).abs() < 1e-9);
    }

    #[test]
    fn rejected_bpm_leaves_playback_untouched() {
        let (mut transport, device) = transport();
        transport.play();
        assert!(matches!(transport.set_bpm(-1.0), Err(BeatframeError::InvalidBpm(_))));
        assert_eq!(transport.bpm(), 120.0);
        assert_eq!(device.active_voices(), 1);
    }

    #[test]
    fn seek_while_playing_reschedules() {
        let (mut transport, device) = transport();
        transport.play();
        device.advance(0.5);
        transport.seek_to(10.0).unwrap();

        assert_eq!(device.active_voices(), 1);
        let anchor = transport.audio.anchor();
        assert!((anchor.buffer_start_offset - 5.0).abs() < 1e-12);
        assert!((anchor.device_start_time - 0.52).abs() < 1e-12);
    }

    #[test]
    fn seek_while_paused_repositions_resume() {
        let (mut transport, _device) = transport();
        transport.play();
        transport.pause();
        transport.seek_to(6.0).unwrap();
        assert!((transport.audio_position() - 3.0).abs() < 1e-12);
        transport.play();
        assert!((transport.audio.anchor().buffer_start_offset - 3.0).abs() < 1e-12);
    }

    #[test]
    fn loop_wrap_restarts_audio_at_loop_start() {
        let (mut transport, device) = transport();
        transport.set_loop_range(0.0, 4.0).unwrap();
        let mut now = 0.0;
        transport.play();
        transport.tick(now);
        for _ in 0..3 {
            advance(&mut transport, &device, &mut now, 0.75);
        }
        // 2.25s at 120 bpm = 4.5 beats, so the third tick wrapped.
        assert_eq!(transport.current_beat(), 0.0);
        let anchor = transport.audio.anchor();
        assert_eq!(anchor.buffer_start_offset, 0.0);
        assert!((anchor.device_start_time - (2.25 + 0.02)).abs() < 1e-9);
        assert_eq!(device.active_voices(), 1);
    }

    #[test]
    fn listeners_receive_wrapped_beat() {
        let (mut transport, device) = transport();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        transport.subscribe(move |beat| sink.lock().push(beat));
        transport.set_loop_range(0.0, 4.0).unwrap();
        let mut now = 0.0;
        transport.play();
        transport.tick(now);
        advance(&mut transport, &device, &mut now, 2.5);
        assert_eq!(seen.lock().last().copied(), Some(0.0));
    }

    #[test]
    fn suspended_device_is_resumed_on_play() {
        let (mut transport, device) = transport();
        device.start_suspended();
        transport.play();
        assert_eq!(device.power_state(), PowerState::Running);
        assert_eq!(device.active_voices(), 1);
    }

    #[test]
    fn failed_resume_falls_back_to_visual_playback() {
        let (mut transport, device) = transport();
        device.start_suspended();
        device.set_resume_failure(true);
        transport.play();

        assert_eq!(transport.state(), TransportState::Playing);
        assert_eq!(transport.audio_state(), SchedulerState::Stopped);
        transport.tick(0.0);
        transport.tick(1.0);
        assert!((transport.current_beat() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn silent_session_still_advances() {
        let mut transport = TransportCoordinator::silent(&TransportConfig::default()).unwrap();
        assert!(transport.load_audio(&wav_bytes(1.0, 1_000)).is_ok());
        transport.play();
        transport.tick(10.0);
        transport.tick(10.5);
        assert!((transport.current_beat() - 1.0).abs() < 1e-9);
        assert_eq!(transport.audio_state(), SchedulerState::Stopped);
    }

    #[test]
    fn bad_audio_keeps_transport_usable() {
        let (mut transport, device) = transport();
        transport.play();
        assert!(transport.load_audio(b"nope").is_err());
        assert_eq!(device.active_voices(), 0);
        transport.tick(0.0);
        transport.tick(0.5);
        assert!((transport.current_beat() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn only_legal_edges_change_state() {
        let (mut transport, _device) = transport();
        transport.pause();
        assert_eq!(transport.state(), TransportState::Stopped);
        transport.play();
        transport.pause();
        assert_eq!(transport.state(), TransportState::Paused);
        transport.play();
        assert_eq!(transport.state(), TransportState::Playing);
        transport.stop();
        assert_eq!(transport.state(), TransportState::Stopped);
    }
}
