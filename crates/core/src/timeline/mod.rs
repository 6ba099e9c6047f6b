//! Musical clock: beat/second conversion and the play/pause/stop/seek state
//! machine that the transport drives once per host frame.

use serde::{Deserialize, Serialize};

use crate::{BeatframeError, Result};

/// Converts a beat position into seconds at the given tempo.
pub fn beat_to_time(beat: f64, bpm: f64) -> f64 {
    beat / bpm * 60.0
}

/// Converts seconds into a beat position at the given tempo.
pub fn time_to_beat(seconds: f64, bpm: f64) -> f64 {
    seconds * bpm / 60.0
}

/// Accepts finite, strictly positive tempos.
pub fn validate_bpm(bpm: f64) -> Result<()> {
    if bpm.is_finite() && bpm > 0.0 {
        Ok(())
    } else {
        Err(BeatframeError::InvalidBpm(bpm))
    }
}

/// Half-open `[start, end)` region that playback wraps within.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoopRange {
    pub start: f64,
    pub end: f64,
}

impl LoopRange {
    pub fn length(&self) -> f64 {
        self.end - self.start
    }

    pub fn contains(&self, beat: f64) -> bool {
        beat >= self.start && beat < self.end
    }

    fn normalized(a: f64, b: f64, max_beat: f64) -> Result<Self> {
        if !a.is_finite() || !b.is_finite() {
            return Err(BeatframeError::InvalidLoopRange { start: a, end: b });
        }
        let start = a.min(b).clamp(0.0, max_beat);
        let end = a.max(b).clamp(0.0, max_beat);
        if start >= end {
            return Err(BeatframeError::InvalidLoopRange { start, end });
        }
        Ok(Self { start, end })
    }
}

/// Result of advancing the clock by one host tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickOutcome {
    pub beat: f64,
    /// Set when the advance crossed the loop end and snapped to its start.
    pub wrapped: bool,
}

/// Handle returned by [`BeatClock::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type BeatListener = Box<dyn FnMut(f64) + Send>;

pub struct BeatClock {
    bpm: f64,
    current_beat: f64,
    is_playing: bool,
    loop_range: Option<LoopRange>,
    project_max_beat: f64,
    last_tick: Option<f64>,
    listeners: Vec<(ListenerId, BeatListener)>,
    next_listener: u64,
}

impl BeatClock {
    pub fn new(bpm: f64, project_max_beat: f64) -> Result<Self> {
        validate_bpm(bpm)?;
        if !(project_max_beat > 0.0) {
            return Err(BeatframeError::msg("project length must be positive"));
        }
        Ok(Self {
            bpm,
            current_beat: 0.0,
            is_playing: false,
            loop_range: None,
            project_max_beat,
            last_tick: None,
            listeners: Vec::new(),
            next_listener: 0,
        })
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    pub fn current_beat(&self) -> f64 {
        self.current_beat
    }

    pub fn is_playing(&self) -> bool {
        self.is_playing
    }

    pub fn loop_range(&self) -> Option<LoopRange> {
        self.loop_range
    }

    pub fn project_max_beat(&self) -> f64 {
        self.project_max_beat
    }

    pub fn beat_to_time(&self, beat: f64) -> f64 {
        beat_to_time(beat, self.bpm)
    }

    pub fn time_to_beat(&self, seconds: f64) -> f64 {
        time_to_beat(seconds, self.bpm)
    }

    /// Changes the tempo for future advancement. The current beat is kept.
    pub fn set_bpm(&mut self, bpm: f64) -> Result<()> {
        validate_bpm(bpm)?;
        self.bpm = bpm;
        tracing::debug!(bpm, beat = self.current_beat, "tempo changed");
        Ok(())
    }

    /// Moves the playhead. Seeking outside an active loop is allowed and
    /// leaves the loop enabled.
    pub fn seek_to(&mut self, beat: f64) {
        self.current_beat = if beat.is_finite() { beat.max(0.0) } else { 0.0 };
        // Elapsed time before the seek must not be applied after it.
        if self.is_playing {
            self.last_tick = None;
        }
        self.notify();
    }

    pub fn play(&mut self) {
        if !self.is_playing {
            self.is_playing = true;
            self.last_tick = None;
        }
    }

    /// Freezes the playhead at its last observed value.
    pub fn pause(&mut self) {
        self.is_playing = false;
        self.last_tick = None;
    }

    pub fn stop(&mut self) {
        self.is_playing = false;
        self.last_tick = None;
        self.current_beat = 0.0;
        self.notify();
    }

    pub fn set_loop_range(&mut self, start: f64, end: f64) -> Result<LoopRange> {
        let range = LoopRange::normalized(start, end, self.project_max_beat)?;
        self.loop_range = Some(range);
        tracing::debug!(start = range.start, end = range.end, "loop range set");
        Ok(range)
    }

    pub fn clear_loop(&mut self) {
        self.loop_range = None;
    }

    /// Updates the project length. An existing loop is clamped into the new
    /// bounds, or cleared if nothing of it remains.
    pub fn set_project_max_beat(&mut self, max_beat: f64) -> Result<()> {
        if !(max_beat > 0.0) || !max_beat.is_finite() {
            return Err(BeatframeError::msg("project length must be positive"));
        }
        self.project_max_beat = max_beat;
        if let Some(range) = self.loop_range {
            self.loop_range = LoopRange::normalized(range.start, range.end, max_beat).ok();
        }
        Ok(())
    }

    /// Advances the playhead by the wall time elapsed since the previous tick.
    ///
    /// `now` is the host's monotonic time in seconds. The first tick after
    /// `play()` only records the reference point.
    pub fn tick(&mut self, now: f64) -> TickOutcome {
        if !self.is_playing {
            return TickOutcome {
                beat: self.current_beat,
                wrapped: false,
            };
        }

        let Some(last) = self.last_tick.replace(now) else {
            return TickOutcome {
                beat: self.current_beat,
                wrapped: false,
            };
        };

        let elapsed = now - last;
        if !(elapsed > 0.0) {
            // Host time went backwards or stood still; keep the newer anchor.
            self.last_tick = Some(last.max(now));
            return TickOutcome {
                beat: self.current_beat,
                wrapped: false,
            };
        }

        let mut beat = self.current_beat + self.time_to_beat(elapsed);
        let mut wrapped = false;
        if let Some(range) = self.loop_range {
            if beat >= range.end {
                beat = range.start;
                wrapped = true;
            }
        }

        self.current_beat = beat;
        self.notify();
        TickOutcome { beat, wrapped }
    }

    pub fn subscribe<F>(&mut self, listener: F) -> ListenerId
    where
        F: FnMut(f64) + Send + 'static,
    {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(existing, _)| *existing != id);
        self.listeners.len() != before
    }

    fn notify(&mut self) {
        let beat = self.current_beat;
        for (_, listener) in &mut self.listeners {
            listener(beat);
        }
    }
}

impl std::fmt::Debug for BeatClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BeatClock")
            .field("bpm", &self.bpm)
            .field("current_beat", &self.current_beat)
            .field("is_playing", &self.is_playing)
            .field("loop_range", &self.loop_range)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn clock(bpm: f64) -> BeatClock {
        BeatClock::new(bpm, 64.0).unwrap()
    }

    #[test]
    fn conversions_are_inverse() {
        for bpm in [1.0, 60.0, 87.5, 120.0, 174.0, 300.0] {
            for beat in [0.0, 0.25, 1.0, 3.75, 16.0, 1000.5] {
                let back = time_to_beat(beat_to_time(beat, bpm), bpm);
                assert!((back - beat).abs() < 1e-9, "bpm {bpm} beat {beat}");
            }
        }
        assert_eq!(beat_to_time(2.0, 120.0), 1.0);
    }

    #[test]
    fn rejects_invalid_bpm_without_mutation() {
        let mut clock = clock(120.0);
        clock.seek_to(3.0);
        for bad in [0.0, -10.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(clock.set_bpm(bad), Err(BeatframeError::InvalidBpm(_))));
        }
        assert_eq!(clock.bpm(), 120.0);
        assert_eq!(clock.current_beat(), 3.0);
    }

    #[test]
    fn tick_advances_by_elapsed_time() {
        let mut clock = clock(120.0);
        clock.play();
        clock.tick(10.0);
        let outcome = clock.tick(10.5);
        assert!((outcome.beat - 1.0).abs() < 1e-12);
        assert!(!outcome.wrapped);
    }

    #[test]
    fn paused_clock_does_not_advance() {
        let mut clock = clock(120.0);
        clock.play();
        clock.tick(0.0);
        clock.tick(1.0);
        clock.pause();
        clock.tick(5.0);
        assert!((clock.current_beat() - 2.0).abs() < 1e-12);

        // Resuming must not count the time spent paused.
        clock.play();
        clock.tick(6.0);
        clock.tick(6.5);
        assert!((clock.current_beat() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn loop_wraps_exactly_to_start() {
        let mut clock = clock(120.0);
        clock.set_loop_range(0.0, 4.0).unwrap();
        clock.play();
        clock.tick(0.0);
        clock.tick(1.9);
        let outcome = clock.tick(2.01);
        assert!(outcome.wrapped);
        assert_eq!(outcome.beat, 0.0);
        assert_eq!(clock.current_beat(), 0.0);
    }

    #[test]
    fn listeners_see_post_wrap_beat() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut clock = clock(120.0);
        clock.subscribe(move |beat| sink.lock().unwrap().push(beat));
        clock.set_loop_range(1.0, 2.0).unwrap();
        clock.seek_to(1.5);
        clock.play();
        clock.tick(0.0);
        clock.tick(0.3);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[1.5, 1.0]);
    }

    #[test]
    fn unsubscribe_removes_listener() {
        let count = Arc::new(Mutex::new(0));
        let sink = count.clone();
        let mut clock = clock(120.0);
        let id = clock.subscribe(move |_| *sink.lock().unwrap() += 1);
        clock.seek_to(1.0);
        assert!(clock.unsubscribe(id));
        assert!(!clock.unsubscribe(id));
        clock.seek_to(2.0);
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn loop_range_is_normalised_and_clamped() {
        let mut clock = clock(120.0);
        let range = clock.set_loop_range(80.0, -2.0).unwrap();
        assert_eq!(range, LoopRange { start: 0.0, end: 64.0 });

        let err = clock.set_loop_range(70.0, 90.0).unwrap_err();
        assert!(matches!(err, BeatframeError::InvalidLoopRange { .. }));
        assert_eq!(clock.loop_range(), Some(range));

        assert!(clock.set_loop_range(f64::NAN, 2.0).is_err());
        clock.clear_loop();
        assert_eq!(clock.loop_range(), None);
    }

    #[test]
    fn seeking_outside_loop_keeps_loop() {
        let mut clock = clock(120.0);
        clock.set_loop_range(4.0, 8.0).unwrap();
        clock.seek_to(12.0);
        assert_eq!(clock.current_beat(), 12.0);
        assert!(clock.loop_range().is_some());

        clock.seek_to(-3.0);
        assert_eq!(clock.current_beat(), 0.0);
    }

    #[test]
    fn stop_always_resets() {
        let mut clock = clock(90.0);
        clock.seek_to(7.0);
        clock.play();
        clock.tick(0.0);
        clock.tick(1.0);
        clock.stop();
        assert_eq!(clock.current_beat(), 0.0);
        assert!(!clock.is_playing());

        clock.pause();
        clock.stop();
        assert_eq!(clock.current_beat(), 0.0);
        assert!(!clock.is_playing());
    }

    #[test]
    fn bpm_change_keeps_beat_and_changes_rate() {
        let mut clock = clock(120.0);
        clock.play();
        clock.tick(0.0);
        clock.tick(1.0);
        let before = clock.current_beat();
        clock.set_bpm(60.0).unwrap();
        assert_eq!(clock.current_beat(), before);
        clock.tick(2.0);
        assert!((clock.current_beat() - (before + 1.0)).abs() < 1e-12);
    }

    #[test]
    fn shrinking_project_reclamps_loop() {
        let mut clock = clock(120.0);
        clock.set_loop_range(8.0, 32.0).unwrap();
        clock.set_project_max_beat(16.0).unwrap();
        assert_eq!(clock.loop_range(), Some(LoopRange { start: 8.0, end: 16.0 }));
        clock.set_project_max_beat(4.0).unwrap();
        assert_eq!(clock.loop_range(), None);
    }

    #[test]
    fn backwards_time_is_ignored() {
        let mut clock = clock(120.0);
        clock.play();
        clock.tick(5.0);
        clock.tick(4.0);
        assert_eq!(clock.current_beat(), 0.0);
        clock.tick(5.5);
        assert!((clock.current_beat() - 1.0).abs() < 1e-12);
    }
}
