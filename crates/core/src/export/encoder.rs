//! Streaming video encoder boundary and the ffmpeg implementation.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread::JoinHandle;

use crate::render::FrameBuffer;
use crate::{BeatframeError, Result};

/// Lines of encoder stderr kept for error messages.
const STDERR_TAIL_LINES: usize = 12;

/// Everything an encoder needs to open one output.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeSpec {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub audio_path: Option<PathBuf>,
    pub output_path: PathBuf,
    pub crf: u8,
    pub preset: String,
    pub ffmpeg_path: PathBuf,
}

/// Accepts frames in strict order and produces one artifact.
pub trait VideoEncoder: Send {
    fn write_frame(&mut self, frame: &FrameBuffer) -> Result<()>;

    /// Flushes the stream and returns the artifact location.
    fn finish(self: Box<Self>) -> Result<PathBuf>;
}

pub trait EncoderFactory: Send + Sync {
    fn open(&self, spec: &EncodeSpec) -> Result<Box<dyn VideoEncoder>>;
}

/// Spawns one ffmpeg process per export.
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegEncoderFactory;

impl EncoderFactory for FfmpegEncoderFactory {
    fn open(&self, spec: &EncodeSpec) -> Result<Box<dyn VideoEncoder>> {
        let args = ffmpeg_args(spec);
        tracing::debug!(
            command = %format!("{} {}", spec.ffmpeg_path.display(), args.join(" ")),
            "starting encoder"
        );

        let mut child = Command::new(&spec.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                BeatframeError::Encode(format!(
                    "failed to start {}: {err}",
                    spec.ffmpeg_path.display()
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BeatframeError::Encode("encoder stdin unavailable".to_string()))?;
        let stderr = child.stderr.take().map(|stderr| {
            // Drained on its own thread so a chatty encoder never blocks on a full pipe.
            std::thread::spawn(move || {
                let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
                for line in BufReader::new(stderr).lines().map_while(|line| line.ok()) {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                Vec::from(tail).join("\n")
            })
        });

        Ok(Box::new(FfmpegEncoder {
            child,
            stdin: Some(stdin),
            stderr,
            output_path: spec.output_path.clone(),
            expected_len: FrameBuffer::byte_len(spec.width, spec.height),
        }))
    }
}

pub struct FfmpegEncoder {
    child: Child,
    stdin: Option<ChildStdin>,
    stderr: Option<JoinHandle<String>>,
    output_path: PathBuf,
    expected_len: usize,
}

impl FfmpegEncoder {
    fn stderr_tail(&mut self) -> String {
        self.stderr
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default()
    }

    /// Tears the process down and builds an error carrying its last words.
    fn fail(&mut self, what: String) -> BeatframeError {
        self.stdin = None;
        let _ = self.child.kill();
        let _ = self.child.wait();
        let tail = self.stderr_tail();
        if tail.is_empty() {
            BeatframeError::Encode(what)
        } else {
            BeatframeError::Encode(format!("{what}\n{tail}"))
        }
    }
}

impl VideoEncoder for FfmpegEncoder {
    fn write_frame(&mut self, frame: &FrameBuffer) -> Result<()> {
        if frame.data.len() != self.expected_len {
            return Err(BeatframeError::Encode(format!(
                "frame is {} bytes, encoder expects {}",
                frame.data.len(),
                self.expected_len
            )));
        }
        let written = match self.stdin.as_mut() {
            Some(stdin) => stdin.write_all(&frame.data),
            None => return Err(BeatframeError::Encode("encoder already closed".to_string())),
        };
        written.map_err(|err| self.fail(format!("failed to write frame: {err}")))
    }

    fn finish(mut self: Box<Self>) -> Result<PathBuf> {
        // Closing stdin is what tells ffmpeg the stream is over.
        drop(self.stdin.take());
        let status = match self.child.wait() {
            Ok(status) => status,
            Err(err) => return Err(self.fail(format!("failed to wait for encoder: {err}"))),
        };
        if !status.success() {
            let tail = self.stderr_tail();
            return Err(BeatframeError::Encode(format!(
                "encoder exited with {status}\n{tail}"
            )));
        }
        let _ = self.stderr_tail();
        Ok(self.output_path.clone())
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        // Abandoned mid-stream: do not leave the process running.
        if self.stdin.take().is_some() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

impl std::fmt::Debug for FfmpegEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FfmpegEncoder")
            .field("pid", &self.child.id())
            .field("output_path", &self.output_path)
            .finish()
    }
}

/// Raw RGBA on stdin, optional WAV as a second input, H.264 + AAC out.
pub fn ffmpeg_args(spec: &EncodeSpec) -> Vec<String> {
    let mut args = vec![
        "-y".to_string(),
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pix_fmt".to_string(),
        "rgba".to_string(),
        "-s".to_string(),
        format!("{}x{}", spec.width, spec.height),
        "-r".to_string(),
        spec.fps.to_string(),
        "-i".to_string(),
        "-".to_string(),
    ];
    if let Some(audio) = &spec.audio_path {
        args.extend(["-i".to_string(), audio.to_string_lossy().to_string()]);
    }

    args.extend([
        "-c:v".to_string(),
        "libx264".to_string(),
        "-crf".to_string(),
        spec.crf.to_string(),
        "-preset".to_string(),
        spec.preset.clone(),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        "-g".to_string(),
        spec.fps.to_string(),
        "-movflags".to_string(),
        "+faststart".to_string(),
    ]);
    if spec.audio_path.is_some() {
        args.extend([
            "-map".to_string(),
            "0:v".to_string(),
            "-map".to_string(),
            "1:a".to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            "192k".to_string(),
            "-shortest".to_string(),
        ]);
    }

    args.push(spec.output_path.to_string_lossy().to_string());
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(audio: bool) -> EncodeSpec {
        EncodeSpec {
            width: 640,
            height: 360,
            fps: 30,
            audio_path: audio.then(|| PathBuf::from("/tmp/job.wav")),
            output_path: PathBuf::from("/tmp/job.mp4"),
            crf: 20,
            preset: "medium".to_string(),
            ffmpeg_path: PathBuf::from("ffmpeg"),
        }
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|arg| arg == flag)
            .and_then(|index| args.get(index + 1))
            .map(String::as_str)
    }

    #[test]
    fn video_input_comes_from_stdin() {
        let args = ffmpeg_args(&spec(true));
        assert_eq!(value_after(&args, "-f"), Some("rawvideo"));
        assert_eq!(value_after(&args, "-s"), Some("640x360"));
        assert_eq!(value_after(&args, "-r"), Some("30"));
        assert_eq!(value_after(&args, "-i"), Some("-"));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/job.mp4"));
    }

    #[test]
    fn audio_is_muxed_when_present() {
        let args = ffmpeg_args(&spec(true));
        assert!(args.iter().any(|arg| arg == "/tmp/job.wav"));
        assert!(args.iter().any(|arg| arg == "-shortest"));
        assert_eq!(value_after(&args, "-c:a"), Some("aac"));
        assert_eq!(value_after(&args, "-movflags"), Some("+faststart"));
    }

    #[test]
    fn silent_exports_skip_audio_flags() {
        let args = ffmpeg_args(&spec(false));
        assert!(!args.iter().any(|arg| arg == "-c:a" || arg == "-shortest"));
        assert_eq!(args.iter().filter(|arg| *arg == "-i").count(), 1);
    }

    #[test]
    fn missing_binary_is_an_encode_error() {
        let mut spec = spec(false);
        spec.ffmpeg_path = PathBuf::from("/nonexistent/beatframe-ffmpeg");
        let err = FfmpegEncoderFactory.open(&spec).err();
        assert!(matches!(err, Some(BeatframeError::Encode(_))));
    }
}
