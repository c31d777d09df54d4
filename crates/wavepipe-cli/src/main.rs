use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;
use wavepipe_backends::{
    cpal_backend, CapturePattern, PcmDevice, SimClock, SimConfig, SimulatedPcm,
};
use wavepipe_engine::{
    config, ChannelSink, Direction, DirectRenderer, DirectStreamSession, EngineConfig, EngineError, PcmFormat,
    RegionInfo, SampleEncoding, StreamEvent, StreamHandle, StreamTime, TimeFormat, WaveBuffer,
};

/// How long to wait for the engine before giving up on a stalled stream.
const STALL_TIMEOUT: Duration = Duration::from_secs(10);

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let Cli { output, command } = Cli::parse();
    let mut settings = config::load();
    if let Some(device) = &output.device {
        settings.device = Some(device.clone());
    }
    if output.direct {
        settings.prefer_direct = true;
    }
    match command {
        Commands::Play(args) => execute_play(&output, &settings, args),
        Commands::Record(args) => execute_record(&output, &settings, args),
        Commands::Config(args) => execute_config(settings, args),
    }
}

#[derive(Parser)]
#[command(author, version, about = "Stream audio through the wavepipe engine")]
struct Cli {
    #[command(flatten)]
    output: DeviceArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play a WAV file.
    Play(PlayArgs),
    /// Record from the simulated capture device into a WAV file.
    Record(RecordArgs),
    /// Show or store engine settings.
    Config(ConfigArgs),
}

#[derive(Args)]
struct DeviceArgs {
    /// Output device name. Overrides the configured device.
    #[arg(long, global = true)]
    device: Option<String>,
    /// Use the simulated device instead of real hardware.
    #[arg(long, global = true)]
    sim: bool,
    /// Stream straight into the hardware ring instead of queueing buffers.
    #[arg(long, global = true)]
    direct: bool,
    /// Frames per hardware period.
    #[arg(long, global = true, default_value_t = 1024)]
    period_frames: usize,
    /// Periods in the hardware ring.
    #[arg(long, global = true, default_value_t = 4)]
    periods: usize,
}

#[derive(Args)]
struct PlayArgs {
    /// WAV file to play.
    file: PathBuf,
    /// Length of each submitted buffer in milliseconds.
    #[arg(long, default_value_t = 100)]
    buffer_ms: u32,
    /// Buffers kept in flight.
    #[arg(long, default_value_t = 4)]
    queue: usize,
    /// Play the whole file this many times.
    #[arg(long)]
    loops: Option<u32>,
}

#[derive(Args)]
struct RecordArgs {
    /// Destination WAV file.
    file: PathBuf,
    /// Recording length in seconds.
    #[arg(long, default_value_t = 1.0)]
    seconds: f32,
    #[arg(long, default_value_t = 44_100)]
    rate: u32,
    #[arg(long, default_value_t = 2)]
    channels: u16,
    /// Length of each capture buffer in milliseconds.
    #[arg(long, default_value_t = 100)]
    buffer_ms: u32,
    /// Content produced by the simulated device.
    #[arg(long, value_enum, default_value_t = Pattern::Ramp)]
    pattern: Pattern,
}

#[derive(Args)]
struct ConfigArgs {
    /// Write the effective settings back to the settings file.
    #[arg(long)]
    save: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Pattern {
    Silence,
    Ramp,
}

impl From<Pattern> for CapturePattern {
    fn from(pattern: Pattern) -> Self {
        match pattern {
            Pattern::Silence => CapturePattern::Silence,
            Pattern::Ramp => CapturePattern::Ramp,
        }
    }
}

fn sim_config(args: &DeviceArgs) -> SimConfig {
    SimConfig {
        period_frames: args.period_frames,
        periods: args.periods,
        clock: SimClock::realtime(),
        tap: false,
        ..SimConfig::default()
    }
}

fn open_output(
    args: &DeviceArgs,
    settings: &EngineConfig,
    format: PcmFormat,
) -> Result<Box<dyn PcmDevice>> {
    if args.sim {
        return Ok(Box::new(SimulatedPcm::playback(format, sim_config(args))));
    }
    cpal_backend::open_output(
        settings.device.as_deref(),
        format,
        args.period_frames,
        args.periods,
    )
    .context("failed to open output device")
}

fn execute_play(output: &DeviceArgs, settings: &EngineConfig, args: PlayArgs) -> Result<()> {
    let (format, data) = read_wav(&args.file)?;
    println!(
        "Playing {} ({} Hz, {} channels, {:?}, {} ms)",
        args.file.display(),
        format.sample_rate,
        format.channels,
        format.encoding,
        format.millis_of(data.len() as u64)
    );
    let pcm = open_output(output, settings, format)?;

    if settings.prefer_direct {
        let data = Arc::new(data);
        let renderer: Box<dyn DirectRenderer> = Box::new(file_renderer(
            format,
            Arc::clone(&data),
            args.loops.unwrap_or(1),
        ));
        match DirectStreamSession::open(pcm, Some(renderer), settings) {
            Ok(session) => return play_direct(session, data.len(), args.loops.unwrap_or(1)),
            Err(EngineError::MmapUnsupported) => {
                tracing::warn!("device has no mapped access, using the buffer queue");
            }
            Err(err) => return Err(err).context("failed to open direct session"),
        }
        let pcm = open_output(output, settings, format)?;
        let data = Arc::try_unwrap(data).unwrap_or_else(|shared| shared.as_ref().clone());
        return play_queued(pcm, settings, format, data, &args);
    }
    play_queued(pcm, settings, format, data, &args)
}

/// Splits `data` into prepared buffers of about `buffer_ms`, marking the
/// whole file as one loop when `loops` is given.
fn chunks_of(
    format: PcmFormat,
    data: &[u8],
    buffer_ms: u32,
    loops: Option<u32>,
) -> Result<Vec<WaveBuffer>, EngineError> {
    let frames = (format.sample_rate as usize * buffer_ms.max(1) as usize / 1000).max(1);
    let chunks: Vec<&[u8]> = data.chunks(format.frames_to_bytes(frames)).collect();
    let last = chunks.len().saturating_sub(1);
    chunks
        .into_iter()
        .enumerate()
        .map(|(index, bytes)| {
            let mut buffer = WaveBuffer::new(bytes.to_vec()).with_user(index as u64);
            if let Some(loops) = loops {
                buffer = buffer.with_loop(index == 0, index == last, loops);
            }
            buffer.prepare()?;
            Ok(buffer)
        })
        .collect()
}

fn play_queued(
    pcm: Box<dyn PcmDevice>,
    settings: &EngineConfig,
    format: PcmFormat,
    data: Vec<u8>,
    args: &PlayArgs,
) -> Result<()> {
    let (sink, events) = ChannelSink::new();
    let handle = StreamHandle::open(format, pcm, None, Box::new(sink), settings)
        .context("failed to open stream")?;

    let buffers = chunks_of(format, &data, args.buffer_ms, args.loops)?;
    let total = buffers.len();
    if total == 0 {
        bail!("{} contains no audio", args.file.display());
    }

    // A loop must be queued completely before it can repeat.
    let window = if args.loops.is_some() {
        total
    } else {
        args.queue.max(1)
    };
    let mut pending = buffers.into_iter();
    for buffer in pending.by_ref().take(window) {
        handle.submit(buffer).map_err(|rejected| rejected.error)?;
    }

    let started = Instant::now();
    let mut completed = 0;
    while completed < total {
        let event = events
            .recv_timeout(STALL_TIMEOUT)
            .context("stream stalled")?;
        match event {
            StreamEvent::BufferCompleted { buffer, forced } => {
                tracing::debug!(user = buffer.user(), forced, "buffer returned");
                completed += 1;
                if let Some(next) = pending.next() {
                    handle.submit(next).map_err(|rejected| rejected.error)?;
                }
            }
            StreamEvent::Closed => bail!("output device was lost"),
            StreamEvent::Opened => {}
        }
    }

    if let StreamTime::Millis(millis) = handle.position(TimeFormat::Millis)? {
        println!(
            "Played {millis} ms in {:.2} s",
            started.elapsed().as_secs_f32()
        );
    }
    let metrics = handle.metrics();
    println!(
        "{} buffers, {} bytes, {} xruns, {} recoveries",
        metrics.buffers_completed, metrics.bytes_transferred, metrics.xruns, metrics.recoveries
    );
    handle.close()?;
    Ok(())
}

/// Renders `loops` passes of `data`, then silence.
fn file_renderer(
    format: PcmFormat,
    data: Arc<Vec<u8>>,
    loops: u32,
) -> impl FnMut(&mut [u8], RegionInfo) + Send {
    let silence = format.encoding.silence_byte();
    let total = data.len() as u64 * u64::from(loops.max(1));
    move |region: &mut [u8], info: RegionInfo| {
        for (index, byte) in region.iter_mut().enumerate() {
            let position = info.commit_position + index as u64;
            *byte = if position < total {
                data[(position % data.len() as u64) as usize]
            } else {
                silence
            };
        }
    }
}

fn play_direct(mut session: DirectStreamSession, len: usize, loops: u32) -> Result<()> {
    if len == 0 {
        bail!("file contains no audio");
    }
    // Everything has been committed once a full ring of silence follows it.
    let end = len as u64 * u64::from(loops.max(1)) + session.buffer_len() as u64;
    let started = Instant::now();
    session.start()?;
    let mut last_progress = (Instant::now(), 0);
    while session.commit_position() < end {
        if !session.is_running() {
            break;
        }
        let committed = session.commit_position();
        if committed != last_progress.1 {
            last_progress = (Instant::now(), committed);
        } else if last_progress.0.elapsed() > STALL_TIMEOUT {
            bail!("direct stream stalled");
        }
        thread::sleep(Duration::from_millis(10));
    }
    session.stop()?;

    let metrics = session.metrics();
    println!(
        "Streamed {} bytes directly in {:.2} s, {} xruns",
        metrics.bytes_transferred,
        started.elapsed().as_secs_f32(),
        metrics.xruns
    );
    Ok(())
}

fn execute_record(output: &DeviceArgs, settings: &EngineConfig, args: RecordArgs) -> Result<()> {
    let format = PcmFormat::new(SampleEncoding::S16Le, args.channels, args.rate);
    format.validate()?;
    let config = SimConfig {
        capture: args.pattern.into(),
        ..sim_config(output)
    };
    let pcm = SimulatedPcm::new(Direction::Capture, format, config);
    let (sink, events) = ChannelSink::new();
    let handle = StreamHandle::open(format, Box::new(pcm), None, Box::new(sink), settings)
        .context("failed to open capture stream")?;

    let frames_wanted = (args.seconds.max(0.0) * args.rate as f32) as usize;
    let buffer_frames = (args.rate as usize * args.buffer_ms.max(1) as usize / 1000).max(1);
    let buffers = frames_wanted.div_ceil(buffer_frames);
    for index in 0..buffers {
        let frames = buffer_frames.min(frames_wanted - index * buffer_frames);
        let mut buffer = WaveBuffer::for_capture(&format, frames).with_user(index as u64);
        buffer.prepare()?;
        handle.submit(buffer).map_err(|rejected| rejected.error)?;
    }
    handle.start()?;

    let spec = hound::WavSpec {
        channels: args.channels,
        sample_rate: args.rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&args.file, spec)
        .with_context(|| format!("failed to create {}", args.file.display()))?;
    let mut received = 0;
    while received < buffers {
        match events.recv_timeout(STALL_TIMEOUT).context("capture stalled")? {
            StreamEvent::BufferCompleted { buffer, .. } => {
                received += 1;
                for sample in buffer.recorded().chunks_exact(2) {
                    writer.write_sample(i16::from_le_bytes([sample[0], sample[1]]))?;
                }
            }
            StreamEvent::Closed => bail!("capture device was lost"),
            StreamEvent::Opened => {}
        }
    }
    writer.finalize()?;

    handle.reset()?;
    handle.close()?;
    println!(
        "Recorded {} frames to {}",
        frames_wanted,
        args.file.display()
    );
    Ok(())
}

fn execute_config(settings: EngineConfig, args: ConfigArgs) -> Result<()> {
    match config::settings_path() {
        Some(path) => println!("Settings file: {}", path.display()),
        None => println!("No settings directory on this system"),
    }
    println!("{}", serde_json::to_string_pretty(&settings)?);
    if args.save {
        let path = config::settings_path().context("no settings directory on this system")?;
        settings.save_to(&path)?;
        println!("Saved.");
    }
    Ok(())
}

/// Reads a WAV file into interleaved little-endian bytes.
fn read_wav(path: &Path) -> Result<(PcmFormat, Vec<u8>)> {
    let mut reader = hound::WavReader::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let spec = reader.spec();
    let encoding = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 8) => SampleEncoding::U8,
        (hound::SampleFormat::Int, 16) => SampleEncoding::S16Le,
        (hound::SampleFormat::Int, 24) => SampleEncoding::S24Le,
        (hound::SampleFormat::Int, 32) => SampleEncoding::S32Le,
        (hound::SampleFormat::Float, 32) => SampleEncoding::F32Le,
        (format, bits) => bail!("unsupported WAV encoding: {bits}-bit {format:?}"),
    };
    let format = PcmFormat::new(encoding, spec.channels, spec.sample_rate);
    format.validate()?;

    let mut data = Vec::with_capacity(reader.len() as usize * encoding.bytes());
    match encoding {
        SampleEncoding::F32Le => {
            for sample in reader.samples::<f32>() {
                data.extend_from_slice(&sample?.to_le_bytes());
            }
        }
        SampleEncoding::U8 => {
            // hound hands out 8-bit samples re-centred on zero.
            for sample in reader.samples::<i8>() {
                data.push((i16::from(sample?) + 128) as u8);
            }
        }
        _ => {
            let width = encoding.bytes();
            for sample in reader.samples::<i32>() {
                data.extend_from_slice(&sample?.to_le_bytes()[..width]);
            }
        }
    }
    // Drop a trailing partial frame.
    data.truncate(data.len() / format.block_align() * format.block_align());
    Ok((format, data))
}
