//! WAV decoding into interleaved `f32` buffers.

use std::io::Cursor;

use hound::{SampleFormat, WavReader};

use crate::{BeatframeError, Result};

/// Immutable decoded sample buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    /// Interleaved samples in `[-1.0, 1.0]`.
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
    pub duration_seconds: f64,
}

impl DecodedAudio {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Result<Self> {
        if sample_rate == 0 || channels == 0 {
            return Err(BeatframeError::Decode(
                "sample rate and channel count must be non-zero".to_string(),
            ));
        }
        if samples.is_empty() || samples.len() % channels as usize != 0 {
            return Err(BeatframeError::Decode(
                "buffer must contain at least one whole frame".to_string(),
            ));
        }
        let frames = samples.len() / channels as usize;
        Ok(Self {
            samples,
            sample_rate,
            channels,
            duration_seconds: frames as f64 / sample_rate as f64,
        })
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    /// Returns the sample for `channel` at a position in seconds, or silence
    /// outside the buffer.
    pub fn sample_at(&self, seconds: f64, channel: u16) -> f32 {
        if !(seconds >= 0.0) {
            return 0.0;
        }
        let frame = (seconds * self.sample_rate as f64) as usize;
        if frame >= self.frames() {
            return 0.0;
        }
        let channel = channel.min(self.channels - 1) as usize;
        self.samples[frame * self.channels as usize + channel]
    }
}

/// Decodes an in-memory WAV file.
pub fn decode_wav(bytes: &[u8]) -> Result<DecodedAudio> {
    if bytes.is_empty() {
        return Err(BeatframeError::Decode("empty input".to_string()));
    }

    let reader = WavReader::new(Cursor::new(bytes))
        .map_err(|err| BeatframeError::Decode(err.to_string()))?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|err| BeatframeError::Decode(err.to_string()))?,
        SampleFormat::Int => {
            let scale = 1.0 / (1_i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .into_samples::<i32>()
                .map(|sample| sample.map(|value| value as f32 * scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|err| BeatframeError::Decode(err.to_string()))?
        }
    };

    let decoded = DecodedAudio::new(samples, spec.sample_rate, spec.channels)?;
    tracing::debug!(
        sample_rate = decoded.sample_rate,
        channels = decoded.channels,
        duration = decoded.duration_seconds,
        "decoded wav"
    );
    Ok(decoded)
}

#[cfg(test)]
pub(crate) fn wav_bytes(seconds: f64, sample_rate: u32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        let frames = (seconds * sample_rate as f64) as usize;
        for i in 0..frames {
            let value = ((i % 100) as i16 - 50) * 100;
            writer.write_sample(value).unwrap();
            writer.write_sample(value).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}
