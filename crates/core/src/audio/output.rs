//! Hardware output through cpal.
//!
//! A cpal stream cannot leave the thread that built it, so each
//! [`CpalDevice`] owns a small thread that builds the stream, keeps it
//! alive, and drops it when the device is dropped. The stream callback
//! pulls from a sample-counted [`VirtualDevice`], which makes the device
//! clock exactly the number of frames the hardware has consumed.

use std::sync::Arc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use crossbeam_channel::{bounded, Sender};

use super::{AudioDevice, DecodedAudio, DeviceClock, PowerState, VirtualDevice, VoiceId};
use crate::{BeatframeError, Result};

pub struct CpalDevice {
    mixer: VirtualDevice,
    device_name: String,
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalDevice {
    /// Opens the host's default output device at the requested format.
    pub fn open_default(sample_rate: u32, channels: u16) -> Result<Self> {
        let (ready_tx, ready_rx) = bounded::<Result<(VirtualDevice, String)>>(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);

        let thread = std::thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || {
                let stream = match build_stream(sample_rate, channels) {
                    Ok((stream, mixer, name)) => {
                        let _ = ready_tx.send(Ok((mixer, name)));
                        stream
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                // Returns once the owning device is dropped.
                let _ = shutdown_rx.recv();
                drop(stream);
                tracing::debug!("audio output stream closed");
            })?;

        let opened = ready_rx.recv().map_err(|_| {
            BeatframeError::DeviceUnavailable("audio output thread exited early".to_string())
        });
        match opened.and_then(|result| result) {
            Ok((mixer, device_name)) => {
                tracing::info!(
                    device = %device_name,
                    sample_rate,
                    channels,
                    "audio output opened"
                );
                Ok(Self {
                    mixer,
                    device_name,
                    shutdown: Some(shutdown_tx),
                    thread: Some(thread),
                })
            }
            Err(err) => {
                let _ = thread.join();
                Err(err)
            }
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }
}

fn build_stream(sample_rate: u32, channels: u16) -> Result<(cpal::Stream, VirtualDevice, String)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| unavailable("no default output device"))?;
    let name = device.name().unwrap_or_else(|_| "unknown".to_string());

    let config = StreamConfig {
        channels,
        sample_rate: SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let mixer = VirtualDevice::new(DeviceClock::SampleCounted, sample_rate, channels);
    let callback_mixer = mixer.clone();
    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| callback_mixer.render(data),
            move |err| tracing::error!(error = %err, "audio output stream error"),
            None,
        )
        .map_err(unavailable)?;
    stream.play().map_err(unavailable)?;
    Ok((stream, mixer, name))
}

fn unavailable(err: impl std::fmt::Display) -> BeatframeError {
    BeatframeError::DeviceUnavailable(err.to_string())
}

impl AudioDevice for CpalDevice {
    fn now(&self) -> f64 {
        self.mixer.now()
    }

    fn sample_rate(&self) -> u32 {
        self.mixer.sample_rate()
    }

    fn power_state(&self) -> PowerState {
        self.mixer.power_state()
    }

    fn resume(&mut self) -> Result<()> {
        self.mixer.resume()
    }

    fn suspend(&mut self) -> Result<()> {
        self.mixer.suspend()
    }

    fn schedule(&mut self, buffer: Arc<DecodedAudio>, at: f64, offset: f64) -> Result<VoiceId> {
        self.mixer.schedule(buffer, at, offset)
    }

    fn stop_voice(&mut self, voice: VoiceId) {
        self.mixer.stop_voice(voice)
    }

    fn is_voice_active(&self, voice: VoiceId) -> bool {
        self.mixer.is_voice_active(voice)
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        drop(self.shutdown.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl std::fmt::Debug for CpalDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpalDevice")
            .field("device_name", &self.device_name)
            .field("mixer", &self.mixer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opening_without_hardware_is_a_device_error() {
        // Build machines usually lack a sound card; either outcome is valid
        // but a failure must surface as DeviceUnavailable.
        match CpalDevice::open_default(48_000, 2) {
            Ok(device) => {
                assert_eq!(device.sample_rate(), 48_000);
                assert_eq!(device.power_state(), PowerState::Running);
            }
            Err(err) => assert!(matches!(err, BeatframeError::DeviceUnavailable(_))),
        }
    }
}
