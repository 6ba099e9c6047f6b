//! Audio output device contract plus software implementations.
//!
//! The scheduler never blocks on hardware: it hands a buffer, a start time
//! on the device clock and a start offset to [`AudioDevice::schedule`], and
//! the device's own thread does the rest.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use super::DecodedAudio;
use crate::{BeatframeError, Result};

/// Power state of an output device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Running,
    Suspended,
    Unavailable,
}

/// Identifies one scheduled playback on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VoiceId(u64);

pub trait AudioDevice: Send {
    /// Monotonic device clock, in seconds.
    fn now(&self) -> f64;

    fn sample_rate(&self) -> u32;

    fn power_state(&self) -> PowerState;

    fn resume(&mut self) -> Result<()>;

    fn suspend(&mut self) -> Result<()>;

    /// Starts `buffer` at device time `at`, beginning `offset` seconds into it.
    fn schedule(&mut self, buffer: Arc<DecodedAudio>, at: f64, offset: f64) -> Result<VoiceId>;

    /// Halts a voice immediately. Unknown ids are ignored.
    fn stop_voice(&mut self, voice: VoiceId);

    /// Whether the voice is scheduled or still sounding.
    fn is_voice_active(&self, voice: VoiceId) -> bool;
}

/// Time source behind a [`VirtualDevice`].
#[derive(Debug, Clone, Copy)]
pub enum DeviceClock {
    /// Advanced explicitly through [`VirtualDevice::advance`].
    Manual,
    /// Advanced by the frames pulled through [`VirtualDevice::render`].
    SampleCounted,
    /// Wall clock measured from device creation.
    Monotonic,
}

#[derive(Debug)]
struct Voice {
    id: VoiceId,
    buffer: Arc<DecodedAudio>,
    start_at: f64,
    offset: f64,
}

impl Voice {
    fn ends_at(&self) -> f64 {
        self.start_at + (self.buffer.duration_seconds - self.offset).max(0.0)
    }
}

#[derive(Debug)]
struct DeviceState {
    clock: DeviceClock,
    origin: Instant,
    manual_time: f64,
    frames_rendered: u64,
    suspended_at: Option<f64>,
    suspended_total: f64,
    power: PowerState,
    fail_resume: bool,
    voices: Vec<Voice>,
    next_voice: u64,
}

impl DeviceState {
    fn raw_time(&self, sample_rate: u32) -> f64 {
        match self.clock {
            DeviceClock::Manual => self.manual_time,
            DeviceClock::SampleCounted => self.frames_rendered as f64 / sample_rate as f64,
            DeviceClock::Monotonic => self.origin.elapsed().as_secs_f64(),
        }
    }

    /// The device clock stands still while suspended.
    fn now(&self, sample_rate: u32) -> f64 {
        match self.suspended_at {
            Some(at) => at,
            None => self.raw_time(sample_rate) - self.suspended_total,
        }
    }
}

/// Software output device. Clones share the same clock and voices, so a test
/// or an output thread can hold one while the scheduler owns another.
#[derive(Clone)]
pub struct VirtualDevice {
    sample_rate: u32,
    channels: u16,
    state: Arc<Mutex<DeviceState>>,
}

impl VirtualDevice {
    pub fn new(clock: DeviceClock, sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            channels: channels.max(1),
            state: Arc::new(Mutex::new(DeviceState {
                clock,
                origin: Instant::now(),
                manual_time: 0.0,
                frames_rendered: 0,
                suspended_at: None,
                suspended_total: 0.0,
                power: PowerState::Running,
                fail_resume: false,
                voices: Vec::new(),
                next_voice: 0,
            })),
        }
    }

    pub fn manual(sample_rate: u32) -> Self {
        Self::new(DeviceClock::Manual, sample_rate, 2)
    }

    /// Moves a manual clock forward. Other clock modes ignore this.
    pub fn advance(&self, seconds: f64) {
        let mut state = self.state.lock();
        if matches!(state.clock, DeviceClock::Manual) && seconds > 0.0 {
            state.manual_time += seconds;
        }
    }

    /// Starts the device suspended, the way browsers hand out audio contexts
    /// before a user gesture.
    pub fn start_suspended(&self) {
        let mut state = self.state.lock();
        let now = state.now(self.sample_rate);
        state.power = PowerState::Suspended;
        state.suspended_at = Some(now);
    }

    /// Makes the next `resume()` calls fail.
    pub fn set_resume_failure(&self, fail: bool) {
        self.state.lock().fail_resume = fail;
    }

    pub fn active_voices(&self) -> usize {
        let state = self.state.lock();
        let now = state.now(self.sample_rate);
        state.voices.iter().filter(|v| now < v.ends_at()).count()
    }

    /// Pull callback for an output thread: mixes every sounding voice into
    /// `out` (interleaved, `channels` wide) and advances a sample-counted
    /// clock by the number of frames written.
    pub fn render(&self, out: &mut [f32]) {
        out.fill(0.0);
        let mut state = self.state.lock();
        if state.power != PowerState::Running {
            return;
        }

        let channels = self.channels as usize;
        let frames = out.len() / channels;
        let start = state.now(self.sample_rate);
        let step = 1.0 / self.sample_rate as f64;

        for voice in &state.voices {
            for frame in 0..frames {
                let t = start + frame as f64 * step;
                if t < voice.start_at || t >= voice.ends_at() {
                    continue;
                }
                let position = voice.offset + (t - voice.start_at);
                for channel in 0..channels {
                    out[frame * channels + channel] +=
                        voice.buffer.sample_at(position, channel as u16);
                }
            }
        }

        if matches!(state.clock, DeviceClock::SampleCounted) {
            state.frames_rendered += frames as u64;
        }
        let now = state.now(self.sample_rate);
        state.voices.retain(|voice| now < voice.ends_at());
    }
}

impl AudioDevice for VirtualDevice {
    fn now(&self) -> f64 {
        self.state.lock().now(self.sample_rate)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn power_state(&self) -> PowerState {
        self.state.lock().power
    }

    fn resume(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_resume {
            return Err(BeatframeError::DeviceUnavailable(
                "device refused to resume".to_string(),
            ));
        }
        if let Some(at) = state.suspended_at.take() {
            let raw = state.raw_time(self.sample_rate);
            state.suspended_total = raw - at;
        }
        state.power = PowerState::Running;
        Ok(())
    }

    fn suspend(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        if state.suspended_at.is_none() {
            let now = state.now(self.sample_rate);
            state.suspended_at = Some(now);
        }
        state.power = PowerState::Suspended;
        Ok(())
    }

    fn schedule(&mut self, buffer: Arc<DecodedAudio>, at: f64, offset: f64) -> Result<VoiceId> {
        let mut state = self.state.lock();
        let id = VoiceId(state.next_voice);
        state.next_voice += 1;
        state.voices.push(Voice {
            id,
            buffer,
            start_at: at,
            offset: offset.max(0.0),
        });
        Ok(id)
    }

    fn stop_voice(&mut self, voice: VoiceId) {
        self.state.lock().voices.retain(|v| v.id != voice);
    }

    fn is_voice_active(&self, voice: VoiceId) -> bool {
        let state = self.state.lock();
        let now = state.now(self.sample_rate);
        state
            .voices
            .iter()
            .any(|v| v.id == voice && now < v.ends_at())
    }
}

impl std::fmt::Debug for VirtualDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualDevice")
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .finish()
    }
}

/// Device for sessions without audio output. Its clock counts host time
/// so lookahead arithmetic stays meaningful.
#[derive(Debug)]
pub struct NullDevice {
    origin: Instant,
}

impl NullDevice {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for NullDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioDevice for NullDevice {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn sample_rate(&self) -> u32 {
        48_000
    }

    fn power_state(&self) -> PowerState {
        PowerState::Unavailable
    }

    fn resume(&mut self) -> Result<()> {
        Err(BeatframeError::DeviceUnavailable(
            "no audio output".to_string(),
        ))
    }

    fn suspend(&mut self) -> Result<()> {
        Ok(())
    }

    fn schedule(&mut self, _: Arc<DecodedAudio>, _: f64, _: f64) -> Result<VoiceId> {
        Err(BeatframeError::DeviceUnavailable(
            "no audio output".to_string(),
        ))
    }

    fn stop_voice(&mut self, _: VoiceId) {}

    fn is_voice_active(&self, _: VoiceId) -> bool {
        false
    }
}
