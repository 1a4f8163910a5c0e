use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use cleanmic::strategy::PARAM_ATTENUATION_LIMIT_DB;
use cleanmic::{
    CaptureBackend, FsModelStore, MemoryModelStore, ModeId, ModelStore, PipelineStats,
    ReplayBackend, SessionConfig, SessionController, SessionEvent, StrategyRegistry,
};
use crossbeam_channel::Receiver;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(about = "Run audio through a cleanmic session and write the PCM16 result", version)]
struct Args {
    /// Input WAV file to replay as the microphone
    input: Option<PathBuf>,

    /// Output path (.wav, or raw PCM16 with --raw)
    #[arg(short, long, default_value = "cleanmic_out.wav")]
    output: PathBuf,

    /// Force LIGHT or PREMIUM instead of capability detection
    #[arg(long)]
    mode: Option<ModeId>,

    /// Frames per replayed capture block
    #[arg(long = "block-frames", default_value_t = 128)]
    block_frames: usize,

    /// Pace replay at the file's sample rate
    #[arg(long, default_value_t = false)]
    realtime: bool,

    /// Write headerless native-endian PCM16 instead of WAV
    #[arg(long, default_value_t = false)]
    raw: bool,

    /// JSON session config; missing fields keep their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory of stored model blobs
    #[arg(long)]
    models: Option<PathBuf>,

    #[arg(long = "attenuation-db")]
    attenuation_db: Option<f32>,

    #[arg(long, default_value_t = false)]
    metrics: bool,

    /// Record from the default microphone for this many seconds instead of replaying a file
    #[cfg(feature = "cpal")]
    #[arg(long = "mic-seconds")]
    mic_seconds: Option<u64>,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,cleanmic=debug"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .init();
}

struct Collected {
    samples: Vec<i16>,
    sample_rate: u32,
    chunks: usize,
    first_audio_after: Option<Duration>,
}

fn collect(events: &Receiver<SessionEvent>, started: Instant, into: &mut Collected) {
    for event in events.try_iter() {
        match event {
            SessionEvent::FirstAudio => {
                into.first_audio_after.get_or_insert(started.elapsed());
            }
            SessionEvent::Audio(chunk) => {
                into.sample_rate = chunk.sample_rate;
                into.chunks += 1;
                into.samples.extend(chunk.into_samples());
            }
            SessionEvent::Error(message) => tracing::error!("pipeline error: {}", message),
        }
    }
}

fn run_session<B: CaptureBackend>(
    session: &mut SessionController<B>,
    args: &Args,
    mut finished: impl FnMut() -> bool,
) -> Result<Collected> {
    let events = session.events();
    let started = Instant::now();
    let mut collected = Collected {
        samples: Vec::new(),
        sample_rate: 0,
        chunks: 0,
        first_audio_after: None,
    };

    session.start(args.mode)?;
    let snapshot = session.snapshot();
    tracing::info!(
        "session {:?} in {:?} mode on '{}'",
        snapshot.status,
        snapshot.mode,
        snapshot.selected_device
    );
    if let Some(db) = args.attenuation_db {
        session.set_param(PARAM_ATTENUATION_LIMIT_DB, db)?;
    }

    while !finished() {
        collect(&events, started, &mut collected);
        std::thread::sleep(Duration::from_millis(10));
    }
    if !session.drain_input(DRAIN_TIMEOUT) {
        tracing::warn!("pipeline did not drain within {:?}", DRAIN_TIMEOUT);
    }
    if let Some(stats) = session.stats() {
        tracing::info!("{:?}", PipelineStats::from_runtime(&stats));
    }
    session.stop();
    collect(&events, started, &mut collected);
    Ok(collected)
}

fn write_output(path: &Path, collected: &Collected, raw: bool) -> Result<()> {
    if raw {
        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(bytemuck::cast_slice(&collected.samples))?;
        out.flush()?;
        return Ok(());
    }
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: collected.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .with_context(|| format!("failed to create {}", path.display()))?;
    for &s in &collected.samples {
        writer.write_sample(s)?;
    }
    writer.finalize()?;
    Ok(())
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SessionConfig::from_json_str(
            &std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?,
        )?,
        None => SessionConfig::default(),
    };
    if args.metrics {
        config.enable_metrics = true;
    }
    let models: Arc<dyn ModelStore> = match &args.models {
        Some(dir) => Arc::new(FsModelStore::new(dir)?),
        None => Arc::new(MemoryModelStore::new()),
    };

    #[cfg(feature = "cpal")]
    if let Some(seconds) = args.mic_seconds {
        let mut session = SessionController::new(
            config,
            cleanmic::CpalBackend::new(),
            StrategyRegistry::with_defaults(),
            models,
        );
        let deadline = Instant::now() + Duration::from_secs(seconds);
        let collected = run_session(&mut session, &args, || Instant::now() >= deadline)?;
        return finish(&args, &collected);
    }

    let input = args.input.as_ref().context("an input WAV file is required")?;
    let backend = ReplayBackend::from_wav(input)?
        .block_frames(args.block_frames)
        .realtime(args.realtime);
    let mut session = SessionController::new(
        config,
        backend.clone(),
        StrategyRegistry::with_defaults(),
        models,
    );
    let collected = run_session(&mut session, &args, || backend.completed_playbacks() > 0)?;
    finish(&args, &collected)
}

fn finish(args: &Args, collected: &Collected) -> Result<()> {
    if collected.samples.is_empty() {
        anyhow::bail!("session produced no audio");
    }
    write_output(&args.output, collected, args.raw)?;
    println!(
        "wrote {} samples @ {}Hz in {} chunks to {} (first audio after {:?})",
        collected.samples.len(),
        collected.sample_rate,
        collected.chunks,
        args.output.display(),
        collected.first_audio_after.unwrap_or_default()
    );
    Ok(())
}
