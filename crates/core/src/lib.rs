//! Core library for the Beatframe workstation engine.
//!
//! Two clock disciplines live here. The realtime side ([`TransportCoordinator`])
//! ticks a [`BeatClock`] from host time and keeps an [`AudioScheduler`]
//! pinned to the same beat on the audio device clock. The offline side
//! ([`ExportService`]) steps frames on a virtual clock and hands them to an
//! external encoder together with a rendered mixdown.

pub mod audio;
pub mod config;
pub mod error;
pub mod export;
pub mod render;
pub mod timeline;
pub mod tracks;
pub mod transport;

pub use audio::{
    decode_wav, open_output, AudioDevice, AudioScheduler, DecodedAudio, DeviceClock, NullDevice,
    PlaybackEnd, PowerState, SchedulerState, VirtualDevice,
};
#[cfg(feature = "cpal")]
pub use audio::CpalDevice;
pub use config::{AppConfig, AudioConfig, ExportSettings, TransportConfig};
pub use error::{BeatframeError, Result};
pub use export::{
    ExportRenderer, ExportRequest, ExportService, FfmpegEncoderFactory, FramePlan, JobEvent, JobId,
    JobSnapshot, JobStatus, JobTicket,
};
pub use render::{FrameBuffer, FrameContext, PostProcessing, PulseRenderer, VisualRenderer};
pub use timeline::{beat_to_time, time_to_beat, BeatClock, LoopRange, TickOutcome};
pub use tracks::{Note, TrackData};
pub use transport::{TransportCoordinator, TransportState};
