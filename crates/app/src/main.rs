use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use beatframe_core::{
    open_output, AppConfig, BeatframeError, ExportRequest, ExportService, FfmpegEncoderFactory,
    JobStatus, PulseRenderer, TransportCoordinator,
};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

fn main() -> beatframe_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = AppConfig::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Play {
            audio,
            bpm,
            seconds,
            loop_start,
            loop_end,
        } => run_play(&config, audio.as_deref(), bpm, seconds, loop_start.zip(loop_end)),
        Commands::Export { request, follow } => run_export(&config, &request, follow),
        Commands::Plan { request, limit } => run_plan(&config, &request, limit),
    }
}

fn run_play(
    config: &AppConfig,
    audio: Option<&Path>,
    bpm: Option<f64>,
    seconds: f64,
    looping: Option<(f64, f64)>,
) -> beatframe_core::Result<()> {
    let mut transport = TransportCoordinator::new(&config.transport, open_output(&config.audio))?;

    if let Some(path) = audio {
        let loaded = std::fs::read(path)
            .map_err(BeatframeError::from)
            .and_then(|bytes| transport.load_audio(&bytes));
        match loaded {
            Ok(duration) => tracing::info!(path = %path.display(), duration, "audio ready"),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "continuing without audio")
            }
        }
    }
    if let Some(bpm) = bpm {
        transport.set_bpm(bpm)?;
    }
    if let Some((start, end)) = looping {
        let range = transport.set_loop_range(start, end)?;
        tracing::info!(start = range.start, end = range.end, "looping");
    }

    tracing::info!(bpm = transport.bpm(), seconds, "starting playback");
    let period = Duration::from_secs_f64(1.0 / config.transport.tick_hz as f64);
    let started = Instant::now();
    let mut last_whole_beat = None;

    transport.play();
    while started.elapsed().as_secs_f64() < seconds {
        let outcome = transport.tick(started.elapsed().as_secs_f64());
        let whole = outcome.beat.floor() as u64;
        if last_whole_beat != Some(whole) || outcome.wrapped {
            tracing::info!(
                beat = whole,
                audio = transport.audio_position(),
                wrapped = outcome.wrapped,
                "beat"
            );
            last_whole_beat = Some(whole);
        }
        std::thread::sleep(period);
    }
    transport.stop();
    Ok(())
}

fn run_export(config: &AppConfig, path: &Path, follow: bool) -> beatframe_core::Result<()> {
    let request = read_request(path)?;
    let service = ExportService::new(
        config.export.clone(),
        Arc::new(PulseRenderer::new()),
        Arc::new(FfmpegEncoderFactory),
    );

    let ticket = service.submit(request)?;
    println!("{}", ticket.id);

    // The render thread dies with the process, so the CLI waits either way.
    for event in ticket.events.iter() {
        if follow {
            println!("{}", serde_json::to_string(&event)?);
        }
        if event.is_terminal() {
            break;
        }
    }

    let job = service.status(ticket.id)?;
    if !follow {
        println!("{}", serde_json::to_string_pretty(&job)?);
    }
    match job.status {
        JobStatus::Complete => Ok(()),
        _ => Err(BeatframeError::msg(
            job.error.unwrap_or_else(|| "export did not complete".to_string()),
        )),
    }
}

fn run_plan(config: &AppConfig, path: &Path, limit: usize) -> beatframe_core::Result<()> {
    let request = read_request(path)?;
    request.validate_within(&config.export)?;
    let plan = request.plan();
    println!("total_frames {}", plan.total_frames);
    for (frame, beat) in plan.frames().take(limit) {
        println!("{frame}\t{beat}");
    }
    Ok(())
}

fn read_request(path: &Path) -> beatframe_core::Result<ExportRequest> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Beat-synchronised transport and video export",
    long_about = None
)]
struct Cli {
    /// JSON configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the realtime transport on the default audio output, or silently
    /// when none is available.
    Play {
        /// WAV file to schedule alongside the beat clock.
        #[arg(short, long)]
        audio: Option<PathBuf>,
        /// Override the configured starting tempo.
        #[arg(long)]
        bpm: Option<f64>,
        /// How long to play, in seconds.
        #[arg(long, default_value_t = 8.0)]
        seconds: f64,
        #[arg(long, requires = "loop_end")]
        loop_start: Option<f64>,
        #[arg(long, requires = "loop_start")]
        loop_end: Option<f64>,
    },
    /// Render an export request to video through ffmpeg.
    Export {
        /// Path to the export request JSON.
        request: PathBuf,
        /// Print every job event as JSON.
        #[arg(short, long)]
        follow: bool,
    },
    /// Print the frame/beat schedule an export request would use.
    Plan {
        request: PathBuf,
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
}
